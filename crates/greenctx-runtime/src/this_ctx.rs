//! Interface to the currently running context
//!
//! Free functions addressing "whoever is running right now". Every waiting
//! form is an interruption point. Timed forms come in two shapes: a value
//! shape reporting deadline-vs-notify in the return value, and an `_or`
//! shape that turns an expired deadline into `Error::Timeout`.

use crate::ctx::{Ctx, Remote};
use crate::reactor;
use crate::tls;
use greenctx_core::{CtxId, Error, Result};

use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

fn cur<R>(f: impl FnOnce(&Ctx) -> Result<R>) -> Result<R> {
    match tls::with_current(f) {
        Some(r) => r,
        None => Err(Error::NotInContext),
    }
}

/// Block until notified.
pub fn wait() -> Result<()> {
    cur(|c| {
        c.set_alarm(None);
        c.wait().map(|_| ())
    })
}

/// Block until notified or `tp` passes.
///
/// Returns `Ok(true)` when the deadline was reached without a note.
pub fn wait_until(tp: Instant) -> Result<bool> {
    cur(|c| {
        c.set_alarm(Some(tp));
        let waited = c.wait();
        c.set_alarm(None);
        waited?;
        Ok(Instant::now() >= tp)
    })
}

/// Like [`wait_until`], but an expired deadline is `Error::Timeout`.
pub fn wait_until_or(tp: Instant) -> Result<()> {
    if wait_until(tp)? {
        return Err(Error::Timeout);
    }
    Ok(())
}

/// Block until notified or `d` elapses.
///
/// Returns the remaining duration when notified, `None` when the deadline
/// was reached. A buffered note returns with the duration nearly untouched.
pub fn wait_for(d: Duration) -> Result<Option<Duration>> {
    let tp = Instant::now() + d;
    cur(|c| {
        c.set_alarm(Some(tp));
        let waited = c.wait();
        c.set_alarm(None);
        waited?;
        let remaining = tp.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            Ok(None)
        } else {
            Ok(Some(remaining))
        }
    })
}

/// Like [`wait_for`], but an expired deadline is `Error::Timeout`.
pub fn wait_for_or(d: Duration) -> Result<Duration> {
    match wait_for(d)? {
        Some(remaining) => Ok(remaining),
        None => Err(Error::Timeout),
    }
}

/// Sleep through `tp`, ignoring notifications.
///
/// Returns only once the deadline has truly passed, or propagates a
/// cancellation.
pub fn sleep_until(tp: Instant) -> Result<()> {
    while !wait_until(tp)? {}
    Ok(())
}

/// Sleep for `d`, ignoring notifications.
pub fn sleep(d: Duration) -> Result<()> {
    sleep_until(Instant::now() + d)
}

/// Give other ready work one turn.
///
/// Posts a turn marker behind everything already queued and waits for it;
/// notes from unrelated sources are ignored until the marker lands, which
/// keeps yielding distinct from synchronization.
pub fn yield_now() -> Result<()> {
    let me = tls::current_id();
    if me.is_none() {
        return Err(Error::NotInContext);
    }

    let done = Rc::new(Cell::new(false));
    let marker = done.clone();
    reactor::with(|r| {
        r.defer(Box::new(move || {
            marker.set(true);
            reactor::with(|r| {
                if let Some(c) = r.get(me) {
                    c.note();
                }
            });
        }))
    });

    while !done.get() {
        wait()?;
    }
    Ok(())
}

/// Deliver a pending cancellation, if any. Checks only; never yields.
pub fn interruption_point() -> Result<()> {
    cur(|c| c.interruption_point())
}

/// Whether a cancellation is pending and undelivered.
pub fn interruption_requested() -> bool {
    tls::with_current(|c| c.interruption_requested()).unwrap_or(false)
}

/// Id of the current context.
pub fn id() -> Result<CtxId> {
    cur(|c| Ok(c.id()))
}

/// Name of the current context.
pub fn name() -> Result<String> {
    cur(|c| Ok(c.name().to_owned()))
}

/// Notification counter of the current context.
pub fn notes() -> Result<i64> {
    cur(|c| Ok(c.notes()))
}

/// Accumulated on-CPU time of the current context.
pub fn awake() -> Result<Duration> {
    cur(|c| Ok(c.awake()))
}

/// Thread-safe notifier for the current context.
pub fn remote() -> Result<Remote> {
    cur(|c| Ok(c.remote()))
}

/// Live stack bytes between the context's entry frame and here.
pub fn stack_usage_here() -> Result<usize> {
    cur(|c| {
        let probe = 0u8;
        let here = &probe as *const u8 as usize;
        Ok(c.stack_base().saturating_sub(here))
    })
}

/// Raw cycle counter read, for ad-hoc profiling.
pub fn cycles_here() -> u64 {
    crate::arch::cycles()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctx::spawn;
    use crate::testing;

    #[test]
    fn test_outside_any_context() {
        assert_eq!(wait(), Err(Error::NotInContext));
        assert_eq!(id(), Err(Error::NotInContext));
        assert!(!interruption_requested());
    }

    #[test]
    fn test_wait_for_times_out() {
        testing::run(|| {
            let t0 = Instant::now();
            let r = wait_for(Duration::from_millis(50))?;
            assert_eq!(r, None, "no notifier, the deadline must win");
            assert!(
                t0.elapsed() >= Duration::from_millis(50),
                "returned before the deadline"
            );
            Ok(())
        });
    }

    #[test]
    fn test_wait_for_notified_in_time() {
        testing::run(|| {
            let me = remote()?;
            let mut pinger = spawn("pinger", move || {
                sleep(Duration::from_millis(20))?;
                me.notify();
                Ok(())
            })?;

            let r = wait_for(Duration::from_millis(50))?;
            let remaining = r.expect("the note must beat the deadline");
            assert!(remaining <= Duration::from_millis(45));
            pinger.join()?;
            Ok(())
        });
    }

    #[test]
    fn test_wait_until_monotonic() {
        testing::run(|| {
            let tp = Instant::now() + Duration::from_millis(30);
            let expired = wait_until(tp)?;
            assert!(expired);
            assert!(Instant::now() >= tp);
            Ok(())
        });
    }

    #[test]
    fn test_wait_for_or_raises_timeout() {
        testing::run(|| {
            let r = wait_for_or(Duration::from_millis(10));
            assert_eq!(r, Err(Error::Timeout));
            Ok(())
        });
    }

    #[test]
    fn test_sleep_ignores_notes() {
        testing::run(|| {
            let me = remote()?;
            let mut noisy = spawn("noisy", move || {
                for _ in 0..3 {
                    me.notify();
                    sleep(Duration::from_millis(5))?;
                }
                Ok(())
            })?;

            let t0 = Instant::now();
            sleep(Duration::from_millis(30))?;
            assert!(
                t0.elapsed() >= Duration::from_millis(30),
                "sleep returned early on a note"
            );
            noisy.join()?;
            Ok(())
        });
    }

    #[test]
    fn test_yield_gives_a_turn() {
        testing::run(|| {
            let done = Rc::new(Cell::new(false));
            let flag = done.clone();
            let mut child = spawn("turnee", move || {
                flag.set(true);
                Ok(())
            })?;
            yield_now()?;
            assert!(done.get(), "the spawned context never got its turn");
            child.join()?;
            Ok(())
        });
    }

    #[test]
    fn test_identity_and_probes() {
        testing::run(|| {
            assert!(id()?.is_some());
            assert_eq!(name()?, "main");
            assert_eq!(notes()?, 1);
            assert!(stack_usage_here()? > 0);
            let _ = cycles_here();
            Ok(())
        });
    }
}
