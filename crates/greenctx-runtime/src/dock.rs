//! Cooperative condition variable
//!
//! A FIFO list of waiting context ids plus notify operations. Wakes can be
//! spurious (any note lands the waiter back here), so the predicate form is
//! the only reliable one; the plain forms exist for protocols that carry
//! their own state.
//!
//! A notification consumed by a waiter that leaves on the error path is
//! passed on to the next waiter, so cancellation cannot eat a wake meant
//! for someone else.

use crate::reactor;
use crate::this_ctx;
use greenctx_core::{CtxId, Result};

use std::cell::RefCell;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// A waiter list with FIFO wake order.
#[derive(Default)]
pub struct Dock {
    waiters: RefCell<VecDeque<CtxId>>,
}

impl Dock {
    pub const fn new() -> Self {
        Dock {
            waiters: RefCell::new(VecDeque::new()),
        }
    }

    /// Number of contexts currently parked here.
    pub fn waiting(&self) -> usize {
        self.waiters.borrow().len()
    }

    /// Suspend until any notify (or any other note) arrives.
    pub fn wait(&self) -> Result<()> {
        let id = this_ctx::id()?;
        self.waiters.borrow_mut().push_back(id);
        match this_ctx::wait() {
            Ok(()) => {
                // A foreign note may have woken us while we were still
                // listed; deregister either way.
                self.remove(id);
                Ok(())
            }
            Err(e) => {
                if !self.remove(id) {
                    self.notify_one();
                }
                Err(e)
            }
        }
    }

    /// Suspend while `cond` holds; returns with `cond()` false.
    pub fn wait_while(&self, mut cond: impl FnMut() -> bool) -> Result<()> {
        while cond() {
            self.wait()?;
        }
        Ok(())
    }

    /// Suspend until notified or `tp` passes; `Ok(true)` means the deadline
    /// was reached.
    pub fn wait_until(&self, tp: Instant) -> Result<bool> {
        let id = this_ctx::id()?;
        self.waiters.borrow_mut().push_back(id);
        match this_ctx::wait_until(tp) {
            Ok(expired) => {
                let removed = self.remove(id);
                if expired && !removed {
                    // Timed out but a notify had picked us; hand it on.
                    self.notify_one();
                }
                Ok(expired)
            }
            Err(e) => {
                if !self.remove(id) {
                    self.notify_one();
                }
                Err(e)
            }
        }
    }

    /// Like [`Dock::wait_until`], but an expired deadline is
    /// `Error::Timeout`.
    pub fn wait_until_or(&self, tp: Instant) -> Result<()> {
        if self.wait_until(tp)? {
            return Err(greenctx_core::Error::Timeout);
        }
        Ok(())
    }

    /// Suspend until notified or `d` elapses; `None` means the deadline was
    /// reached, otherwise the remaining duration.
    pub fn wait_for(&self, d: Duration) -> Result<Option<Duration>> {
        let tp = Instant::now() + d;
        match self.wait_until(tp)? {
            true => Ok(None),
            false => Ok(Some(tp.saturating_duration_since(Instant::now()))),
        }
    }

    /// Like [`Dock::wait_for`], but an expired deadline is `Error::Timeout`.
    pub fn wait_for_or(&self, d: Duration) -> Result<Duration> {
        match self.wait_for(d)? {
            Some(remaining) => Ok(remaining),
            None => Err(greenctx_core::Error::Timeout),
        }
    }

    /// Wake the head waiter, skipping entries whose context is gone.
    pub fn notify_one(&self) {
        loop {
            let head = self.waiters.borrow_mut().pop_front();
            let Some(id) = head else { return };
            let Some(live) = reactor::try_with(|r| match r.get(id) {
                Some(ctx) => {
                    ctx.note();
                    true
                }
                None => false,
            }) else {
                return;
            };
            if live {
                return;
            }
        }
    }

    /// Wake every current waiter, in FIFO order.
    pub fn notify_all(&self) {
        let ids: Vec<CtxId> = self.waiters.borrow_mut().drain(..).collect();
        for id in ids {
            reactor::try_with(|r| {
                if let Some(ctx) = r.get(id) {
                    ctx.note();
                }
            });
        }
    }

    fn remove(&self, id: CtxId) -> bool {
        let mut waiters = self.waiters.borrow_mut();
        match waiters.iter().position(|w| *w == id) {
            Some(at) => {
                waiters.remove(at);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctx::spawn;
    use crate::testing;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    #[test]
    fn test_wake_order_is_fifo() {
        testing::run(|| {
            let dock = Rc::new(Dock::new());
            let order: Rc<RefCell<Vec<usize>>> = Rc::new(RefCell::new(Vec::new()));

            let mut waiters = Vec::new();
            for i in 0..3 {
                let dock = dock.clone();
                let order = order.clone();
                waiters.push(spawn(&format!("waiter{}", i), move || {
                    dock.wait()?;
                    order.borrow_mut().push(i);
                    Ok(())
                })?);
            }
            this_ctx::yield_now()?;
            assert_eq!(dock.waiting(), 3);

            for _ in 0..3 {
                dock.notify_one();
                this_ctx::yield_now()?;
            }
            for w in &mut waiters {
                w.join()?;
            }
            assert_eq!(*order.borrow(), vec![0, 1, 2]);
            Ok(())
        });
    }

    #[test]
    fn test_predicate_holds_on_return() {
        testing::run(|| {
            let dock = Rc::new(Dock::new());
            let value = Rc::new(Cell::new(0));
            let seen = Rc::new(Cell::new(-1));

            let mut consumer = {
                let dock = dock.clone();
                let value = value.clone();
                let seen = seen.clone();
                spawn("consumer", move || {
                    dock.wait_while(|| value.get() < 3)?;
                    seen.set(value.get());
                    Ok(())
                })?
            };
            this_ctx::yield_now()?;

            // Spurious notify without satisfying the predicate.
            dock.notify_one();
            this_ctx::yield_now()?;
            assert_eq!(seen.get(), -1, "woke through a false predicate");

            value.set(1);
            dock.notify_one();
            this_ctx::yield_now()?;
            assert_eq!(seen.get(), -1);

            value.set(3);
            dock.notify_one();
            consumer.join()?;
            assert!(seen.get() >= 3);
            Ok(())
        });
    }

    #[test]
    fn test_notify_all_wakes_everyone() {
        testing::run(|| {
            let dock = Rc::new(Dock::new());
            let woken = Rc::new(Cell::new(0));

            let mut waiters = Vec::new();
            for i in 0..5 {
                let dock = dock.clone();
                let woken = woken.clone();
                waiters.push(spawn(&format!("w{}", i), move || {
                    dock.wait()?;
                    woken.set(woken.get() + 1);
                    Ok(())
                })?);
            }
            this_ctx::yield_now()?;
            dock.notify_all();
            for w in &mut waiters {
                w.join()?;
            }
            assert_eq!(woken.get(), 5);
            Ok(())
        });
    }

    #[test]
    fn test_timed_wait_expires() {
        testing::run(|| {
            let dock = Dock::new();
            let expired = dock.wait_until(Instant::now() + Duration::from_millis(20))?;
            assert!(expired);
            assert_eq!(dock.waiting(), 0, "expired waiter must deregister");
            Ok(())
        });
    }

    #[test]
    fn test_canceled_waiter_passes_the_note_on() {
        testing::run(|| {
            let dock = Rc::new(Dock::new());
            let first_woke = Rc::new(Cell::new(false));
            let second_woke = Rc::new(Cell::new(false));

            let first = {
                let dock = dock.clone();
                let flag = first_woke.clone();
                spawn("first", move || {
                    dock.wait()?;
                    flag.set(true);
                    Ok(())
                })?
            };
            let mut second = {
                let dock = dock.clone();
                let flag = second_woke.clone();
                spawn("second", move || {
                    dock.wait()?;
                    flag.set(true);
                    Ok(())
                })?
            };
            this_ctx::yield_now()?;

            // Notify then immediately cancel the head waiter: the note must
            // reach the second.
            dock.notify_one();
            first.interrupt();
            drop(first);
            second.join()?;
            assert!(!first_woke.get());
            assert!(second_woke.get());
            Ok(())
        });
    }
}
