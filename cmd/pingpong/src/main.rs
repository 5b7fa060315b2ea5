//! Two contexts bouncing a note back and forth as fast as the reactor can
//! carry it; prints round trips per second.
//!
//! Usage: pingpong [rounds]

use greenctx::{notify, spawn, this_ctx, Context, Runtime, RuntimeConfig};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Instant;

type Slot = Rc<RefCell<Option<Context>>>;

fn main() -> greenctx::Result<()> {
    let rounds: usize = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(100_000);

    let mut rt = Runtime::new(RuntimeConfig::from_env())?;
    rt.run(move || {
        let a_slot: Slot = Rc::new(RefCell::new(None));
        let b_slot: Slot = Rc::new(RefCell::new(None));
        let finished = Rc::new(Cell::new(0usize));

        let started = Instant::now();

        let b = {
            let a_slot = a_slot.clone();
            let finished = finished.clone();
            spawn("pong", move || {
                for _ in 0..rounds {
                    this_ctx::wait()?;
                    if let Some(a) = a_slot.borrow().as_ref() {
                        notify(a);
                    }
                }
                finished.set(finished.get() + 1);
                Ok(())
            })?
        };
        let a = {
            let b_slot = b_slot.clone();
            let finished = finished.clone();
            spawn("ping", move || {
                for _ in 0..rounds {
                    if let Some(b) = b_slot.borrow().as_ref() {
                        notify(b);
                    }
                    this_ctx::wait()?;
                }
                finished.set(finished.get() + 1);
                Ok(())
            })?
        };
        *a_slot.borrow_mut() = Some(a);
        *b_slot.borrow_mut() = Some(b);

        while finished.get() < 2 {
            this_ctx::yield_now()?;
        }

        let elapsed = started.elapsed();
        let rate = rounds as f64 / elapsed.as_secs_f64();
        println!(
            "{} round trips in {:.3}s ({:.0}/s, {:.1}us each)",
            rounds,
            elapsed.as_secs_f64(),
            rate,
            1e6 / rate,
        );

        let mut a = a_slot.borrow_mut().take().unwrap();
        let mut b = b_slot.borrow_mut().take().unwrap();
        a.join()?;
        b.join()?;
        Ok(())
    })
}
