//! Off-thread bridge for unavoidably blocking calls
//!
//! One dedicated OS worker thread serves all offloads in FIFO order. The
//! queue mutex and condvar here are the only kernel-level synchronization
//! in the runtime; everything else is cooperative.
//!
//! `offload` is not a thread pool: it exists so a context can make a
//! genuinely blocking system call without stalling the reactor.

use crate::reactor;
use crate::this_ctx;
use greenctx_core::Result;

use std::collections::VecDeque;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

struct WorkerState {
    queue: VecDeque<Job>,
    stop: bool,
}

struct WorkerShared {
    state: Mutex<WorkerState>,
    cond: Condvar,
}

/// Handle to the offload thread; owned by the reactor, joined on teardown.
pub(crate) struct Worker {
    shared: Arc<WorkerShared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Worker {
    pub(crate) fn start() -> Worker {
        let shared = Arc::new(WorkerShared {
            state: Mutex::new(WorkerState {
                queue: VecDeque::new(),
                stop: false,
            }),
            cond: Condvar::new(),
        });
        let for_thread = shared.clone();
        let thread = thread::Builder::new()
            .name("gcx-offload".into())
            .spawn(move || worker_main(&for_thread))
            .expect("failed to spawn the offload thread");
        Worker {
            shared,
            thread: Some(thread),
        }
    }

    pub(crate) fn push(&self, job: Job) {
        let mut state = self.shared.state.lock().unwrap();
        state.queue.push_back(job);
        drop(state);
        self.shared.cond.notify_one();
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.stop = true;
        }
        self.shared.cond.notify_one();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn worker_main(shared: &WorkerShared) {
    loop {
        let job = {
            let mut state = shared.state.lock().unwrap();
            loop {
                if let Some(job) = state.queue.pop_front() {
                    break job;
                }
                if state.stop {
                    return;
                }
                state = shared.cond.wait(state).unwrap();
            }
        };
        job();
    }
}

/// Run `f` on the offload thread while the calling context yields.
///
/// Returns `f`'s value once the worker has finished and the reactor has
/// resumed the caller; a panic inside `f` resumes in the calling context.
/// The reactor keeps executing other contexts for the whole duration.
pub fn offload<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let me = this_ctx::remote()?;
    let slot: Arc<Mutex<Option<thread::Result<T>>>> = Arc::new(Mutex::new(None));

    let result = slot.clone();
    let job: Job = Box::new(move || {
        let outcome = catch_unwind(AssertUnwindSafe(f));
        *result.lock().unwrap() = Some(outcome);
        // Wake the caller through the reactor's inbox.
        me.notify();
    });
    reactor::with(|r| r.offload_push(job))?;

    loop {
        if slot.lock().unwrap().is_some() {
            break;
        }
        this_ctx::wait()?;
    }

    let outcome = slot.lock().unwrap().take().expect("checked above");
    match outcome {
        Ok(v) => Ok(v),
        Err(panic) => resume_unwind(panic),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctx::spawn;
    use crate::testing;
    use std::cell::Cell;
    use std::rc::Rc;
    use std::time::Duration;

    #[test]
    fn test_round_trip() {
        testing::run(|| {
            let v = offload(|| {
                thread::sleep(Duration::from_millis(10));
                42
            })?;
            assert_eq!(v, 42);
            Ok(())
        });
    }

    #[test]
    fn test_resumes_on_reactor_thread() {
        testing::run(|| {
            let caller_thread = thread::current().id();
            let worker_thread = offload(thread::current)?.id();
            assert_ne!(caller_thread, worker_thread, "must run off-thread");
            assert_eq!(
                thread::current().id(),
                caller_thread,
                "must resume on the reactor thread"
            );
            Ok(())
        });
    }

    #[test]
    fn test_reactor_runs_others_during_offload() {
        testing::run(|| {
            let progress = Rc::new(Cell::new(0));
            let counter = progress.clone();
            let mut side = spawn("side", move || {
                for _ in 0..5 {
                    counter.set(counter.get() + 1);
                    this_ctx::yield_now()?;
                }
                Ok(())
            })?;

            let v = offload(|| {
                thread::sleep(Duration::from_millis(20));
                7
            })?;
            assert_eq!(v, 7);
            assert_eq!(progress.get(), 5, "the reactor stalled during offload");
            side.join()?;
            Ok(())
        });
    }

    #[test]
    fn test_panic_rethrown_in_caller() {
        testing::run(|| {
            greenctx_core::log::set_log_level(greenctx_core::LogLevel::Off);
            let mut child = spawn("offloader", || {
                let _: i32 = offload(|| panic!("remote down"))?;
                unreachable!("the panic must resume here");
            })?;
            child.join()?;
            assert!(child.finished(), "panic must end the context cleanly");
            Ok(())
        });
    }

    #[test]
    fn test_fifo_order_on_worker() {
        testing::run(|| {
            let log: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
            let mut runners = Vec::new();
            for i in 0..3u32 {
                let log = log.clone();
                runners.push(spawn(&format!("off{}", i), move || {
                    offload(move || log.lock().unwrap().push(i))?;
                    Ok(())
                })?);
            }
            for r in &mut runners {
                r.join()?;
            }
            assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
            Ok(())
        });
    }

    #[test]
    fn test_offload_disabled_by_config() {
        let mut rt =
            crate::Runtime::new(crate::RuntimeConfig::new().enable_offload(false)).unwrap();
        rt.run(|| {
            let r = offload(|| 1);
            assert!(matches!(r, Err(greenctx_core::Error::Config(_))));
            Ok(())
        })
        .unwrap();
    }
}
