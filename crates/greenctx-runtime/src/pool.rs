//! Named worker pools
//!
//! A pool is a closure queue, a dock and a set of identical worker
//! contexts. Submission wakes one idle worker; dispatch order is FIFO per
//! pool. A canceled worker leaves the loop quietly; any other failure in a
//! closure is logged and the worker keeps serving.
//!
//! Submitting into a pool from one of its own workers is legal and cannot
//! deadlock as long as the pool has at least one worker.

use crate::ctx::{Builder, Context};
use crate::dock::Dock;
use greenctx_core::{kcrit, kdebug};
use greenctx_core::{Flags, Result};

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;

type Closure = Box<dyn FnOnce() -> Result<()> + 'static>;

struct PoolInner {
    name: String,
    stack_size: usize,
    queue: RefCell<VecDeque<Closure>>,
    dock: Dock,
    available: Cell<usize>,
}

/// A fixed-name pool of worker contexts consuming submitted closures.
pub struct Pool {
    inner: Rc<PoolInner>,
    workers: RefCell<Vec<Context>>,
}

impl Pool {
    /// Create a pool with `size` workers of `stack_size` bytes each.
    pub fn new(name: &str, stack_size: usize, size: usize) -> Result<Pool> {
        let pool = Pool {
            inner: Rc::new(PoolInner {
                name: name.to_owned(),
                stack_size,
                queue: RefCell::new(VecDeque::new()),
                dock: Dock::new(),
                available: Cell::new(0),
            }),
            workers: RefCell::new(Vec::new()),
        };
        pool.add(size)?;
        Ok(pool)
    }

    /// Enqueue a closure and wake one idle worker.
    pub fn submit<F>(&self, f: F)
    where
        F: FnOnce() -> Result<()> + 'static,
    {
        self.inner.queue.borrow_mut().push_back(Box::new(f));
        self.inner.dock.notify_one();
    }

    /// Number of worker contexts.
    pub fn size(&self) -> usize {
        self.workers.borrow().len()
    }

    /// Workers currently idle on the dock.
    pub fn available(&self) -> usize {
        self.inner.available.get()
    }

    /// Closures submitted but not yet picked up.
    pub fn queued(&self) -> usize {
        self.inner.queue.borrow().len()
    }

    /// Grow the pool by `n` workers.
    pub fn add(&self, n: usize) -> Result<()> {
        for _ in 0..n {
            let inner = self.inner.clone();
            let worker = Builder::new()
                .name(self.inner.name.as_str())
                .stack_size(self.inner.stack_size)
                .flags(Flags::POST)
                .spawn(move || worker_main(&inner))?;
            self.workers.borrow_mut().push(worker);
        }
        Ok(())
    }

    /// Shrink the pool by `n` workers, joining each removed one.
    pub fn del(&self, n: usize) {
        let target = self.size().saturating_sub(n);
        loop {
            let worker = {
                let mut workers = self.workers.borrow_mut();
                if workers.len() <= target {
                    break;
                }
                workers.pop()
            };
            // The handle drop interrupts and joins the worker.
            drop(worker);
        }
    }

    /// Remove every worker, joining them all.
    pub fn join(&self) {
        self.del(self.size());
    }

    /// Interrupt all workers without joining.
    pub fn interrupt(&self) {
        for worker in self.workers.borrow().iter() {
            worker.interrupt();
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.join();
    }
}

fn worker_main(inner: &PoolInner) -> Result<()> {
    inner.available.set(inner.available.get() + 1);
    let exit = loop {
        if let Err(e) = next(inner) {
            break e;
        }
    };
    inner.available.set(inner.available.get() - 1);
    kdebug!("pool '{}' worker leaving: {}", inner.name, exit);
    Err(exit)
}

/// One serve cycle: park for work, run it, absorb non-cancel failures.
fn next(inner: &PoolInner) -> Result<()> {
    inner.dock.wait_while(|| inner.queue.borrow().is_empty())?;
    let Some(func) = inner.queue.borrow_mut().pop_front() else {
        // Another worker took it between the wake and here.
        return Ok(());
    };

    inner.available.set(inner.available.get() - 1);
    let outcome = catch_unwind(AssertUnwindSafe(func));
    inner.available.set(inner.available.get() + 1);

    match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) if e.is_cancellation() => Err(e),
        Ok(Err(e)) => {
            kcrit!("pool '{}': unhandled: {}", inner.name, e);
            Ok(())
        }
        Err(_) => {
            kcrit!("pool '{}': closure panicked", inner.name);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use crate::this_ctx;
    use greenctx_core::CtxId;
    use std::collections::HashMap;

    // A hundred closures over four workers: all run, and with a yield in
    // each closure the dispatch spreads across the pool.
    #[test]
    fn test_fan_out_and_balance() {
        testing::run(|| {
            let pool = Pool::new("fanout", 64 * 1024, 4)?;
            let runs: Rc<RefCell<Vec<CtxId>>> = Rc::new(RefCell::new(Vec::new()));

            for _ in 0..100 {
                let runs = runs.clone();
                pool.submit(move || {
                    runs.borrow_mut().push(this_ctx::id()?);
                    this_ctx::yield_now()?;
                    Ok(())
                });
            }
            while runs.borrow().len() < 100 {
                this_ctx::yield_now()?;
            }

            let mut per_worker: HashMap<CtxId, usize> = HashMap::new();
            for id in runs.borrow().iter() {
                *per_worker.entry(*id).or_insert(0) += 1;
            }
            assert!(per_worker.len() <= 4);
            assert!(per_worker.len() >= 2, "everything ran on one worker");
            let max = per_worker.values().copied().max().unwrap();
            assert!(max <= 60, "worker imbalance: {} of 100", max);

            pool.join();
            assert_eq!(pool.size(), 0);
            Ok(())
        });
    }

    #[test]
    fn test_available_tracks_idle_workers() {
        testing::run(|| {
            let pool = Pool::new("idle", 64 * 1024, 2)?;
            this_ctx::yield_now()?;
            assert_eq!(pool.available(), 2);

            let release = Rc::new(Cell::new(false));
            let gate = release.clone();
            pool.submit(move || {
                while !gate.get() {
                    this_ctx::yield_now()?;
                }
                Ok(())
            });
            this_ctx::yield_now()?;
            this_ctx::yield_now()?;
            assert_eq!(pool.available(), 1, "one worker must be busy");

            release.set(true);
            while pool.available() != 2 {
                this_ctx::yield_now()?;
            }
            Ok(())
        });
    }

    #[test]
    fn test_closure_failure_keeps_worker() {
        testing::run(|| {
            greenctx_core::log::set_log_level(greenctx_core::LogLevel::Off);
            let pool = Pool::new("sturdy", 64 * 1024, 1)?;
            let done = Rc::new(Cell::new(false));

            pool.submit(|| Err(greenctx_core::Error::Timeout));
            pool.submit(|| panic!("closure down"));
            let flag = done.clone();
            pool.submit(move || {
                flag.set(true);
                Ok(())
            });

            while !done.get() {
                this_ctx::yield_now()?;
            }
            assert_eq!(pool.size(), 1);
            Ok(())
        });
    }

    #[test]
    fn test_submit_from_own_worker() {
        testing::run(|| {
            let pool = Rc::new(Pool::new("reentrant", 64 * 1024, 1)?);
            let done = Rc::new(Cell::new(false));

            let inner_pool = pool.clone();
            let flag = done.clone();
            pool.submit(move || {
                let flag = flag.clone();
                inner_pool.submit(move || {
                    flag.set(true);
                    Ok(())
                });
                Ok(())
            });

            while !done.get() {
                this_ctx::yield_now()?;
            }
            Ok(())
        });
    }

    #[test]
    fn test_grow_and_shrink() {
        testing::run(|| {
            let pool = Pool::new("elastic", 64 * 1024, 2)?;
            assert_eq!(pool.size(), 2);
            pool.add(3)?;
            assert_eq!(pool.size(), 5);
            pool.del(4);
            assert_eq!(pool.size(), 1);
            pool.join();
            assert_eq!(pool.size(), 0);
            Ok(())
        });
    }
}
