//! Pool and timer stress: a worker pool grinding through short jobs while
//! a crowd of sleepers exercises the alarm heap.
//!
//! Usage: stress [jobs] [workers] [sleepers]

use greenctx::{spawn, this_ctx, Pool, Runtime, RuntimeConfig};
use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

fn arg(n: usize, default: usize) -> usize {
    std::env::args()
        .nth(n)
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn main() -> greenctx::Result<()> {
    let jobs = arg(1, 10_000);
    let workers = arg(2, 8);
    let sleepers = arg(3, 64);

    let mut rt = Runtime::new(RuntimeConfig::from_env())?;
    rt.run(move || {
        let started = Instant::now();

        // Sleepers hammer the alarm heap with staggered deadlines.
        let naps = Rc::new(Cell::new(0usize));
        let mut crowd = Vec::new();
        for i in 0..sleepers {
            let naps = naps.clone();
            crowd.push(spawn(&format!("sleeper{}", i), move || {
                for _ in 0..10 {
                    this_ctx::sleep(Duration::from_millis((i % 7 + 1) as u64))?;
                    naps.set(naps.get() + 1);
                }
                Ok(())
            })?);
        }

        // The pool grinds through yielding jobs meanwhile.
        let pool = Pool::new("grinder", 64 * 1024, workers)?;
        let done = Rc::new(Cell::new(0usize));
        for _ in 0..jobs {
            let done = done.clone();
            pool.submit(move || {
                this_ctx::yield_now()?;
                done.set(done.get() + 1);
                Ok(())
            });
        }

        while done.get() < jobs {
            this_ctx::yield_now()?;
        }
        for sleeper in &mut crowd {
            sleeper.join()?;
        }
        pool.join();

        let elapsed = started.elapsed();
        println!(
            "{} jobs on {} workers + {} naps in {:.3}s",
            jobs,
            workers,
            naps.get(),
            elapsed.as_secs_f64(),
        );
        Ok(())
    })
}
