//! Context profiler
//!
//! Samples a steady clock and the stack pointer at the four scheduling
//! events of a context (enter, leave, yield, continue) to account on-CPU
//! time per slice and live stack depth. Thresholds live in process-wide
//! atomics so they can be adjusted while the runtime is running.
//!
//! A slice is the span between an enter/continue and the next yield/leave.
//! Slice overruns log a warning, optionally trip a debug assertion, and --
//! when `slice_interrupt` is non-zero -- cancel the offending context at
//! the yield that detected the overrun.

use crate::ctx::Ctx;
use greenctx_core::kwarn;
use greenctx_core::{Error, Result};
use std::cell::Cell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Profiler thresholds; zero durations disable the matching check.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Warn when live stack exceeds this fraction of the stack size
    pub stack_usage_warning: f32,
    /// Debug-assert when live stack exceeds this fraction
    pub stack_usage_assertion: f32,
    /// Warn when a slice runs at least this long
    pub slice_warning: Duration,
    /// Cancel the context when a slice runs at least this long
    pub slice_interrupt: Duration,
    /// Debug-assert when a slice runs at least this long
    pub slice_assertion: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            stack_usage_warning: 0.46,
            stack_usage_assertion: 0.67,
            slice_warning: Duration::from_millis(50),
            slice_interrupt: Duration::ZERO,
            slice_assertion: Duration::ZERO,
        }
    }
}

static STACK_WARNING_BITS: AtomicU32 = AtomicU32::new(0.46f32.to_bits());
static STACK_ASSERTION_BITS: AtomicU32 = AtomicU32::new(0.67f32.to_bits());
static SLICE_WARNING_NS: AtomicU64 = AtomicU64::new(50_000_000);
static SLICE_INTERRUPT_NS: AtomicU64 = AtomicU64::new(0);
static SLICE_ASSERTION_NS: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// Start of the current slice on this reactor thread
    static SLICE_START: Cell<Option<Instant>> = const { Cell::new(None) };

    /// Depth of nested critical-assertion scopes
    static CRITICAL: Cell<u32> = const { Cell::new(0) };
}

/// Snapshot the current thresholds.
pub fn settings() -> Settings {
    Settings {
        stack_usage_warning: f32::from_bits(STACK_WARNING_BITS.load(Ordering::Relaxed)),
        stack_usage_assertion: f32::from_bits(STACK_ASSERTION_BITS.load(Ordering::Relaxed)),
        slice_warning: Duration::from_nanos(SLICE_WARNING_NS.load(Ordering::Relaxed)),
        slice_interrupt: Duration::from_nanos(SLICE_INTERRUPT_NS.load(Ordering::Relaxed)),
        slice_assertion: Duration::from_nanos(SLICE_ASSERTION_NS.load(Ordering::Relaxed)),
    }
}

/// Replace the thresholds; takes effect at the next event.
pub fn configure(s: &Settings) {
    STACK_WARNING_BITS.store(s.stack_usage_warning.to_bits(), Ordering::Relaxed);
    STACK_ASSERTION_BITS.store(s.stack_usage_assertion.to_bits(), Ordering::Relaxed);
    SLICE_WARNING_NS.store(s.slice_warning.as_nanos() as u64, Ordering::Relaxed);
    SLICE_INTERRUPT_NS.store(s.slice_interrupt.as_nanos() as u64, Ordering::Relaxed);
    SLICE_ASSERTION_NS.store(s.slice_assertion.as_nanos() as u64, Ordering::Relaxed);
}

/// Context entered: a new slice begins.
pub(crate) fn mark_enter() {
    SLICE_START.with(|s| s.set(Some(Instant::now())));
}

/// Context resumed after a yield: a new slice begins.
pub(crate) fn mark_continue() {
    SLICE_START.with(|s| s.set(Some(Instant::now())));
}

/// Context leaving for good: close out the slice.
pub(crate) fn mark_leave(ctx: &Ctx) {
    let _ = check_slice(ctx);
    SLICE_START.with(|s| s.set(None));
}

/// Context about to yield: stack check plus slice check; a breached
/// `slice_interrupt` cancels the context in place of the suspension.
pub(crate) fn check_yield(ctx: &Ctx) -> Result<()> {
    check_stack(ctx);
    if check_slice(ctx) {
        return Err(Error::Interrupted);
    }
    Ok(())
}

/// Close the running slice into the context's awake total and apply the
/// slice thresholds. Returns whether the interrupt threshold was breached.
fn check_slice(ctx: &Ctx) -> bool {
    let now = Instant::now();
    let Some(start) = SLICE_START.with(|s| s.replace(Some(now))) else {
        return false;
    };
    let used = now.saturating_duration_since(start);
    ctx.add_awake(used);

    let warning = SLICE_WARNING_NS.load(Ordering::Relaxed);
    if warning > 0 && used.as_nanos() as u64 >= warning {
        kwarn!(
            "context '{}' ({}) timeslice exceeded: last {:?} total {:?}",
            ctx.name(),
            ctx.id(),
            used,
            ctx.awake(),
        );
        let assertion = SLICE_ASSERTION_NS.load(Ordering::Relaxed);
        debug_assert!(
            assertion == 0 || (used.as_nanos() as u64) < assertion,
            "context '{}' slice {:?} over the assertion threshold",
            ctx.name(),
            used,
        );
    }

    let interrupt = SLICE_INTERRUPT_NS.load(Ordering::Relaxed);
    interrupt > 0 && used.as_nanos() as u64 >= interrupt
}

/// Apply the stack thresholds against the live frame depth.
fn check_stack(ctx: &Ctx) {
    let probe = 0u8;
    let here = &probe as *const u8 as usize;
    let used = ctx.stack_base().saturating_sub(here);
    let max = ctx.stack_max() as f64;

    let warning = f32::from_bits(STACK_WARNING_BITS.load(Ordering::Relaxed)) as f64;
    if warning > 0.0 && used as f64 > max * warning {
        kwarn!(
            "context '{}' ({}) stack usage {} of {} bytes",
            ctx.name(),
            ctx.id(),
            used,
            ctx.stack_max(),
        );
        let assertion = f32::from_bits(STACK_ASSERTION_BITS.load(Ordering::Relaxed)) as f64;
        debug_assert!(
            (used as f64) < max * assertion,
            "context '{}' stack {} over the assertion threshold",
            ctx.name(),
            used,
        );
    }
}

/// Scoped claim that no yield happens while the guard lives.
///
/// The claim is checked at continuation-enter: suspending inside the scope
/// is a bug in the suspending code, reported by a debug assertion.
pub struct CriticalAssertion(());

impl CriticalAssertion {
    pub fn new() -> Self {
        CRITICAL.with(|c| c.set(c.get() + 1));
        CriticalAssertion(())
    }
}

impl Default for CriticalAssertion {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CriticalAssertion {
    fn drop(&mut self) {
        CRITICAL.with(|c| {
            debug_assert!(c.get() > 0);
            c.set(c.get().saturating_sub(1));
        });
    }
}

/// Whether any critical-assertion scope is in force on this thread.
pub(crate) fn critical_asserted() -> bool {
    CRITICAL.with(|c| c.get() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_round_trip() {
        // Harmless thresholds: settings are process-wide and other tests
        // may be running contexts concurrently.
        let before = settings();
        let s = Settings {
            stack_usage_warning: 0.97,
            stack_usage_assertion: 0.99,
            slice_warning: Duration::from_secs(3600),
            slice_interrupt: Duration::from_secs(7200),
            slice_assertion: Duration::from_secs(7200),
        };
        configure(&s);
        assert_eq!(settings(), s);
        configure(&before);
    }

    #[test]
    fn test_critical_assertion_nesting() {
        assert!(!critical_asserted());
        {
            let _a = CriticalAssertion::new();
            assert!(critical_asserted());
            {
                let _b = CriticalAssertion::new();
                assert!(critical_asserted());
            }
            assert!(critical_asserted());
        }
        assert!(!critical_asserted());
    }
}
