//! Runtime entry point
//!
//! `Runtime::run` turns the calling thread into the reactor thread: it
//! installs the reactor, spawns the primary context around the given entry,
//! drives the loop until the primary finishes and the queue drains, and
//! tears everything down again (joining the offload worker if one started).

use crate::ctx::Builder;
use crate::reactor;
use crate::RuntimeConfig;
use greenctx_core::{Error, Flags, Result};

use std::cell::RefCell;
use std::rc::Rc;

/// Handle for running contexts on the calling thread.
///
/// One `run` at a time per thread; a second runtime may run concurrently on
/// another thread, fully independent. When `run` returns, contexts that were
/// still suspended (typically detached ones) are discarded without unwinding
/// their stacks.
pub struct Runtime {
    config: RuntimeConfig,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        config.validate()?;
        greenctx_core::log::init();
        Ok(Self { config })
    }

    /// Run `entry` as the primary context and drive the reactor until it
    /// finishes and all queued work has drained.
    pub fn run<T, F>(&mut self, entry: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + 'static,
        T: 'static,
    {
        reactor::install(
            self.config.default_stack_size,
            self.config.park_timeout,
            self.config.enable_offload,
        )?;
        // Reactor teardown must happen on every exit path.
        let _teardown = Teardown;

        let out: Rc<RefCell<Option<Result<T>>>> = Rc::new(RefCell::new(None));
        let slot = out.clone();
        let primary = Builder::new()
            .name("main")
            .flags(Flags::POST)
            .spawn(move || {
                let result = entry();
                let status = result.as_ref().map(|_| ()).map_err(Clone::clone);
                *slot.borrow_mut() = Some(result);
                status
            })?;

        let done = primary.raw().cloned().expect("fresh primary handle");
        reactor::with(|r| {
            r.run_until(|| done.state() == crate::ctx::RunState::Finished);
        });
        drop(primary);

        let result = out.borrow_mut().take();
        // None means the primary never produced a value: its entry panicked,
        // or it was canceled before running.
        result.unwrap_or(Err(Error::BrokenPromise))
    }
}

/// Whether the calling thread is currently a reactor thread.
pub fn on_reactor_thread() -> bool {
    reactor::installed()
}

/// Whether the caller is inside a context.
pub fn in_ctx() -> bool {
    crate::tls::in_ctx()
}

struct Teardown;

impl Drop for Teardown {
    fn drop(&mut self) {
        reactor::uninstall();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctx::{notify, spawn};
    use crate::this_ctx;
    use greenctx_core::CtxId;
    use std::cell::Cell;

    #[test]
    fn test_run_returns_value() {
        let mut rt = Runtime::new(RuntimeConfig::new()).unwrap();
        let v = rt.run(|| Ok(40 + 2)).unwrap();
        assert_eq!(v, 42);
    }

    #[test]
    fn test_run_propagates_entry_error() {
        greenctx_core::log::set_log_level(greenctx_core::LogLevel::Off);
        let mut rt = Runtime::new(RuntimeConfig::new()).unwrap();
        let r: Result<()> = rt.run(|| Err(Error::Timeout));
        assert_eq!(r, Err(Error::Timeout));
    }

    #[test]
    fn test_run_survives_entry_panic() {
        greenctx_core::log::set_log_level(greenctx_core::LogLevel::Off);
        let mut rt = Runtime::new(RuntimeConfig::new()).unwrap();
        let r: Result<()> = rt.run(|| panic!("primary down"));
        assert_eq!(r, Err(Error::BrokenPromise));
        // The runtime is reusable afterwards.
        let v = rt.run(|| Ok(1)).unwrap();
        assert_eq!(v, 1);
    }

    #[test]
    fn test_reactor_predicates() {
        assert!(!on_reactor_thread());
        let mut rt = Runtime::new(RuntimeConfig::new()).unwrap();
        rt.run(|| {
            assert!(on_reactor_thread());
            assert!(in_ctx());
            Ok(())
        })
        .unwrap();
        assert!(!on_reactor_thread());
    }

    // Two contexts bouncing a note back and forth; both must complete the
    // full thousand round trips.
    #[test]
    fn test_ping_pong() {
        type Slot = Rc<RefCell<Option<crate::Context>>>;

        crate::testing::run(|| {
            const ROUNDS: usize = 1000;
            let a_slot: Slot = Rc::new(RefCell::new(None));
            let b_slot: Slot = Rc::new(RefCell::new(None));
            let a_count = Rc::new(Cell::new(0usize));
            let b_count = Rc::new(Cell::new(0usize));

            let b = {
                let a_slot = a_slot.clone();
                let count = b_count.clone();
                spawn("pong", move || {
                    for _ in 0..ROUNDS {
                        this_ctx::wait()?;
                        if let Some(a) = a_slot.borrow().as_ref() {
                            notify(a);
                        }
                        count.set(count.get() + 1);
                    }
                    Ok(())
                })?
            };
            let a = {
                let b_slot = b_slot.clone();
                let count = a_count.clone();
                spawn("ping", move || {
                    for _ in 0..ROUNDS {
                        if let Some(b) = b_slot.borrow().as_ref() {
                            notify(b);
                        }
                        this_ctx::wait()?;
                        count.set(count.get() + 1);
                    }
                    Ok(())
                })?
            };
            *a_slot.borrow_mut() = Some(a);
            *b_slot.borrow_mut() = Some(b);

            while a_count.get() < ROUNDS || b_count.get() < ROUNDS {
                this_ctx::yield_now()?;
            }

            let mut a = a_slot.borrow_mut().take().unwrap();
            let mut b = b_slot.borrow_mut().take().unwrap();
            a.join()?;
            b.join()?;
            assert!(a.finished() && b.finished());
            assert_eq!(a_count.get(), ROUNDS);
            assert_eq!(b_count.get(), ROUNDS);
            Ok(())
        });
    }

    #[test]
    fn test_turn_counter_advances() {
        crate::testing::run(|| {
            let before = reactor::with(|r| r.turns());
            this_ctx::yield_now()?;
            let after = reactor::with(|r| r.turns());
            assert!(after > before);
            Ok(())
        });
    }

    #[test]
    fn test_ids_unique_across_contexts() {
        crate::testing::run(|| {
            let seen: Rc<RefCell<Vec<CtxId>>> = Rc::new(RefCell::new(Vec::new()));
            let mut handles = Vec::new();
            for i in 0..8 {
                let seen = seen.clone();
                handles.push(spawn(&format!("w{}", i), move || {
                    seen.borrow_mut().push(this_ctx::id()?);
                    Ok(())
                })?);
            }
            for h in &mut handles {
                h.join()?;
            }
            let mut ids = seen.borrow().clone();
            ids.sort();
            ids.dedup();
            assert_eq!(ids.len(), 8);
            Ok(())
        });
    }
}
