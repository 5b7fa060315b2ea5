//! Context lifecycle and inter-context operations
//!
//! A `Ctx` is one stackful thread of execution: its own guarded stack, saved
//! registers, a notification counter and a per-context alarm. The public
//! [`Context`] handle owns a share of it; the reactor registry owns another
//! from spawn until the finish is observed, so a context's storage always
//! outlives its last switch.
//!
//! The notes discipline: 0 means suspended, 1 means awake, more means wakes
//! are buffered. Wakers increment; only the context itself decrements, in
//! `wait`. Every resume lands with notes == 1, restored by the continuation
//! scope.

use crate::arch::{self, SavedRegs};
use crate::prof;
use crate::reactor::{self, Handler, Shared};
use crate::stack::Stack;
use crate::this_ctx;
use crate::tls;
use greenctx_core::{kcrit, kdebug, kwarn};
use greenctx_core::{CtxId, Error, Flags, Result};

use std::cell::{Cell, UnsafeCell};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub(crate) type EntryFn = Box<dyn FnOnce() -> Result<()> + 'static>;

/// Where a context is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunState {
    /// Constructed, entry not yet begun
    Spawning,
    /// On CPU, or between turns without an armed suspension
    Running,
    /// Parked on its alarm
    Suspended,
    /// Wake issued, resume queued on the reactor
    Woken,
    /// Entry returned or was skipped; storage pending reclaim
    Finished,
}

/// Internal context state; shared as `Rc<Ctx>` on the reactor thread only.
pub(crate) struct Ctx {
    id: CtxId,
    name: String,
    flags: Cell<Flags>,
    state: Cell<RunState>,
    notes: Cell<i64>,
    alarm_deadline: Cell<Option<Instant>>,
    alarm_seq: Cell<u64>,
    no_cancel: Cell<bool>,
    regs: UnsafeCell<SavedRegs>,
    stack: Stack,
    stack_base: Cell<usize>,
    joiner: Cell<CtxId>,
    awake: Cell<Duration>,
    shared: Arc<Shared>,
}

impl Ctx {
    fn new(name: String, stack: Stack, flags: Flags, shared: Arc<Shared>) -> Rc<Ctx> {
        Rc::new(Ctx {
            id: CtxId::next(),
            name,
            flags: Cell::new(flags),
            state: Cell::new(RunState::Spawning),
            notes: Cell::new(1),
            alarm_deadline: Cell::new(None),
            alarm_seq: Cell::new(0),
            no_cancel: Cell::new(false),
            regs: UnsafeCell::new(SavedRegs::zeroed()),
            stack,
            stack_base: Cell::new(0),
            joiner: Cell::new(CtxId::NONE),
            awake: Cell::new(Duration::ZERO),
            shared,
        })
    }

    #[inline]
    pub(crate) fn id(&self) -> CtxId {
        self.id
    }

    #[inline]
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub(crate) fn flags(&self) -> Flags {
        self.flags.get()
    }

    #[inline]
    pub(crate) fn add_flag(&self, f: Flags) {
        self.flags.set(self.flags.get() | f);
    }

    #[inline]
    pub(crate) fn state(&self) -> RunState {
        self.state.get()
    }

    #[inline]
    pub(crate) fn set_state(&self, s: RunState) {
        self.state.set(s);
    }

    #[inline]
    pub(crate) fn alarm_seq(&self) -> u64 {
        self.alarm_seq.get()
    }

    #[inline]
    pub(crate) fn bump_alarm_seq(&self) {
        self.alarm_seq.set(self.alarm_seq.get().wrapping_add(1));
    }

    #[inline]
    pub(crate) fn set_alarm(&self, deadline: Option<Instant>) {
        self.alarm_deadline.set(deadline);
    }

    #[inline]
    pub(crate) fn regs_ptr(&self) -> *mut SavedRegs {
        self.regs.get()
    }

    #[inline]
    pub(crate) fn stack_top(&self) -> *mut u8 {
        self.stack.top()
    }

    #[inline]
    pub(crate) fn stack_max(&self) -> usize {
        self.stack.usable()
    }

    #[inline]
    pub(crate) fn stack_base(&self) -> usize {
        self.stack_base.get()
    }

    #[inline]
    pub(crate) fn notes(&self) -> i64 {
        self.notes.get()
    }

    #[inline]
    pub(crate) fn awake(&self) -> Duration {
        self.awake.get()
    }

    #[inline]
    pub(crate) fn add_awake(&self, d: Duration) {
        self.awake.set(self.awake.get() + d);
    }

    #[inline]
    pub(crate) fn joiner(&self) -> CtxId {
        self.joiner.get()
    }

    #[inline]
    pub(crate) fn set_joiner(&self, id: CtxId) {
        self.joiner.set(id);
    }

    pub(crate) fn remote(&self) -> Remote {
        Remote {
            id: self.id,
            shared: self.shared.clone(),
        }
    }

    /// Request a wake. Only the 0 -> 1 transition issues one; further notes
    /// accumulate until the context consumes them in `wait`.
    pub(crate) fn note(&self) -> bool {
        let n = self.notes.get();
        self.notes.set(n + 1);
        if n > 0 {
            return false;
        }
        self.wake();
        true
    }

    /// Cancel the armed alarm and queue a resume, if actually parked.
    pub(crate) fn wake(&self) {
        if self.state.get() != RunState::Suspended {
            return;
        }
        // Strand the heap entry; the resume goes through the run queue.
        self.bump_alarm_seq();
        reactor::try_with(|r| {
            if let Some(ctx) = r.get(self.id) {
                r.schedule_resume(&ctx);
            }
        });
    }

    /// Flag a cancellation and force any pending suspension to return.
    pub(crate) fn interrupt_request(&self, terminate: bool) {
        let f = if terminate {
            Flags::TERMINATED
        } else {
            Flags::INTERRUPTED
        };
        self.add_flag(f);
        self.wake();
    }

    /// Deliver a pending cancellation, if any. Termination is sticky;
    /// interruption clears when delivered.
    pub(crate) fn interruption_point(&self) -> Result<()> {
        if self.no_cancel.get() {
            return Ok(());
        }
        let flags = self.flags.get();
        if flags.has(Flags::TERMINATED) {
            return Err(Error::Terminated);
        }
        if flags.has(Flags::INTERRUPTED) {
            self.flags.set(flags & !Flags::INTERRUPTED);
            return Err(Error::Interrupted);
        }
        Ok(())
    }

    #[inline]
    pub(crate) fn interruption_requested(&self) -> bool {
        let flags = self.flags.get();
        flags.has(Flags::INTERRUPTED) || flags.has(Flags::TERMINATED)
    }

    /// Suspend on the alarm until noted, woken or expired.
    ///
    /// Precondition: `self` is the current context. Returns `Ok(false)` when
    /// a buffered note made the wait a no-op, `Ok(true)` after a real
    /// suspension. Either way a pending cancellation is delivered inside
    /// this call.
    pub(crate) fn wait(&self) -> Result<bool> {
        debug_assert!(
            std::ptr::eq(tls::current_ptr(), self),
            "only the context itself may wait"
        );

        // An interrupt issued while we were running cannot have canceled an
        // armed alarm; deliver it before parking on one.
        self.interruption_point()?;

        let n = self.notes.get() - 1;
        self.notes.set(n);
        debug_assert!(n >= 0);
        if n > 0 {
            return Ok(false);
        }

        if let Err(e) = prof::check_yield(self) {
            self.notes.set(1);
            return Err(e);
        }

        // Commit: new suspension epoch, optional alarm, then the swap.
        self.bump_alarm_seq();
        self.state.set(RunState::Suspended);
        let sched = reactor::with(|r| {
            if let Some(deadline) = self.alarm_deadline.get() {
                r.arm_alarm(self.id, self.alarm_seq.get(), deadline);
            }
            r.sched_regs_ptr()
        });

        {
            let _continuation = Continuation::enter(self);
            unsafe { arch::switch(self.regs.get(), sched) };
            // Resumed; the continuation drop reinstates current and notes.
        }

        debug_assert_eq!(self.notes.get(), 1);
        self.interruption_point()?;
        Ok(true)
    }
}

/// Scope object bracketing every yield.
///
/// Enter asserts the invariants and nulls the current-context pointer; the
/// drop on resume restores the pointer, normalizes notes to 1 and restarts
/// the profiler slice.
struct Continuation<'a> {
    ctx: &'a Ctx,
}

impl<'a> Continuation<'a> {
    fn enter(ctx: &'a Ctx) -> Self {
        debug_assert!(
            !prof::critical_asserted(),
            "yield inside a critical-assertion scope"
        );
        debug_assert!(ctx.notes.get() <= 1);
        debug_assert!(std::ptr::eq(tls::current_ptr(), ctx));
        tls::clear_current();
        Continuation { ctx }
    }
}

impl Drop for Continuation<'_> {
    fn drop(&mut self) {
        tls::set_current(self.ctx);
        self.ctx.notes.set(1);
        prof::mark_continue();
    }
}

/// Scope deferring cancellation delivery in the current context.
///
/// While the guard lives, interruption points report Ok and the flags stay
/// pending; the next point after the scope delivers them. Used by protocols
/// that must run a bounded number of suspensions to keep shared state sound
/// before they can honor a cancellation.
pub(crate) struct DeferCancel {
    ctx: *const Ctx,
    prev: bool,
}

pub(crate) fn defer_cancel() -> Option<DeferCancel> {
    let ctx = tls::current_ptr();
    if ctx.is_null() {
        return None;
    }
    let prev = unsafe { (*ctx).no_cancel.replace(true) };
    Some(DeferCancel { ctx, prev })
}

impl Drop for DeferCancel {
    fn drop(&mut self) {
        // The guard lives inside the context's own frames, so the pointer
        // stays valid for its whole lifetime.
        unsafe { (*self.ctx).no_cancel.set(self.prev) };
    }
}

struct EntryArg {
    ctx: Rc<Ctx>,
    func: EntryFn,
}

/// First frame of every context, reached through the arch trampoline.
extern "C" fn ctx_entry(arg: usize) {
    let (regs, sched) = {
        let arg = unsafe { Box::from_raw(arg as *mut EntryArg) };
        let EntryArg { ctx, func } = *arg;
        let regs = ctx.regs_ptr();
        let sched = reactor::with(|r| r.sched_regs_ptr());
        ctx_main(&ctx, func);
        drop(ctx);
        // Drop our share here; the registry keeps the storage alive until
        // the reactor observes the finish after the switch below.
        (regs, sched)
    };
    unsafe { arch::switch(regs, sched) };
    unreachable!("finished context resumed");
}

fn ctx_main(ctx: &Ctx, func: EntryFn) {
    tls::set_current(ctx);
    ctx.set_state(RunState::Running);
    let probe = 0u8;
    ctx.stack_base.set(&probe as *const u8 as usize);
    ctx.notes.set(1);
    prof::mark_enter();

    // A cancellation that beat the entry skips the function entirely.
    if !ctx.interruption_requested() {
        match catch_unwind(AssertUnwindSafe(func)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_cancellation() => {
                kdebug!("context '{}' ({}) canceled: {}", ctx.name(), ctx.id(), e);
            }
            Ok(Err(e)) => {
                kcrit!("context '{}' ({}) failed: {}", ctx.name(), ctx.id(), e);
            }
            Err(panic) => {
                kcrit!(
                    "context '{}' ({}) panicked: {}",
                    ctx.name(),
                    ctx.id(),
                    panic_message(&panic),
                );
            }
        }
    }

    prof::mark_leave(ctx);

    let joiner = ctx.joiner.get();
    if joiner.is_some() {
        reactor::with(|r| {
            if let Some(j) = r.get(joiner) {
                j.note();
            }
        });
    }

    tls::clear_current();
    ctx.set_state(RunState::Finished);
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic payload>"
    }
}

/// Configure and spawn a context.
///
/// Name, stack size and flags are all optional and order-free at the call
/// site; `spawn` submits the entry according to the flags.
///
/// ```ignore
/// let ctx = Builder::new()
///     .name("resolver")
///     .stack_size(128 * 1024)
///     .flags(Flags::POST)
///     .spawn(|| {
///         this_ctx::wait()?;
///         Ok(())
///     })?;
/// ```
#[derive(Default)]
pub struct Builder {
    name: Option<String>,
    stack_size: Option<usize>,
    flags: Flags,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Diagnostic label for the context
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Usable stack bytes; defaults to the runtime's configured size
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    pub fn flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    /// Create the context and submit its entry to the reactor.
    ///
    /// POST defers to a later turn. DISPATCH (and no flag) runs the entry
    /// immediately when called on the reactor thread outside any context,
    /// and defers otherwise.
    pub fn spawn<F>(self, f: F) -> Result<Context>
    where
        F: FnOnce() -> Result<()> + 'static,
    {
        let Some((default_stack, shared)) =
            reactor::try_with(|r| (r.default_stack_size(), r.shared_arc()))
        else {
            return Err(Error::OffReactor);
        };

        let size = self.stack_size.unwrap_or(default_stack);
        let stack = Stack::new(size)?;
        let name = self.name.unwrap_or_else(|| "<unnamed>".to_owned());
        let ctx = Ctx::new(name, stack, self.flags, shared);
        reactor::with(|r| r.register(ctx.clone()));

        let arg = Box::new(EntryArg {
            ctx: ctx.clone(),
            func: Box::new(f),
        });
        unsafe {
            arch::init(
                ctx.regs_ptr(),
                ctx.stack_top(),
                ctx_entry as usize,
                Box::into_raw(arg) as usize,
            );
        }

        let launch: Handler = {
            let ctx = ctx.clone();
            Box::new(move || reactor::with(|r| r.launch(&ctx)))
        };
        if self.flags.has(Flags::POST) || tls::in_ctx() {
            reactor::with(|r| r.defer(launch));
        } else {
            launch();
        }

        Ok(Context { inner: Some(ctx) })
    }
}

/// Shorthand for `Builder::new().name(name).flags(Flags::POST).spawn(f)`.
pub fn spawn<F>(name: &str, f: F) -> Result<Context>
where
    F: FnOnce() -> Result<()> + 'static,
{
    Builder::new().name(name).flags(Flags::POST).spawn(f)
}

/// Owning handle to a context.
///
/// Dropping a live handle from inside another context interrupts the target
/// and joins it; dropping from outside any context detaches instead, since
/// bare metal cannot block.
pub struct Context {
    inner: Option<Rc<Ctx>>,
}

impl Context {
    pub(crate) fn raw(&self) -> Option<&Rc<Ctx>> {
        self.inner.as_ref()
    }

    pub fn id(&self) -> CtxId {
        self.inner.as_ref().map_or(CtxId::NONE, |c| c.id())
    }

    pub fn name(&self) -> &str {
        self.inner.as_ref().map_or("<empty>", |c| c.name())
    }

    /// Whether the context has begun executing its entry
    pub fn started(&self) -> bool {
        self.inner
            .as_ref()
            .map_or(true, |c| c.state() != RunState::Spawning)
    }

    /// Whether the context has finished
    pub fn finished(&self) -> bool {
        self.inner
            .as_ref()
            .map_or(true, |c| c.state() == RunState::Finished)
    }

    /// Whether a cancellation is pending and undelivered
    pub fn interruption(&self) -> bool {
        self.inner
            .as_ref()
            .map_or(false, |c| c.interruption_requested())
    }

    /// Current notification counter
    pub fn notes(&self) -> i64 {
        self.inner.as_ref().map_or(0, |c| c.notes())
    }

    /// Accumulated on-CPU time
    pub fn awake(&self) -> Duration {
        self.inner.as_ref().map_or(Duration::ZERO, |c| c.awake())
    }

    /// Post a note; returns whether it issued a wake.
    pub fn notify(&self) -> bool {
        self.inner.as_ref().map_or(false, |c| c.note())
    }

    /// Request cooperative cancellation.
    pub fn interrupt(&self) {
        if let Some(c) = &self.inner {
            c.interrupt_request(false);
        }
    }

    /// Request forced cancellation; unswallowable by interrupt-tolerant
    /// callers.
    pub fn terminate(&self) {
        if let Some(c) = &self.inner {
            c.interrupt_request(true);
        }
    }

    /// Thread-safe notifier for this context.
    pub fn remote(&self) -> Remote {
        self.inner
            .as_ref()
            .map(|c| c.remote())
            .expect("remote() on an empty context handle")
    }

    /// Block the calling context until this one finishes.
    ///
    /// A second join after completion is a no-op. Returns `BrokenPromise`
    /// when another context already occupies the joiner slot.
    pub fn join(&mut self) -> Result<()> {
        let Some(ctx) = self.inner.take() else {
            return Ok(());
        };
        if ctx.state() == RunState::Finished {
            return Ok(());
        }
        if !tls::in_ctx() {
            self.inner = Some(ctx);
            return Err(Error::NotInContext);
        }
        let me = tls::current_id();
        debug_assert_ne!(me, ctx.id(), "context cannot join itself");
        if ctx.joiner().is_some() {
            self.inner = Some(ctx);
            return Err(Error::BrokenPromise);
        }

        ctx.set_joiner(me);
        while ctx.state() != RunState::Finished {
            if let Err(e) = this_ctx::wait() {
                ctx.set_joiner(CtxId::NONE);
                self.inner = Some(ctx);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Release the handle; the context cleans itself up on exit.
    pub fn detach(mut self) {
        if let Some(ctx) = self.inner.take() {
            ctx.add_flag(Flags::DETACH);
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        let Some(ctx) = self.inner.take() else { return };
        if ctx.flags().has(Flags::DETACH) || ctx.state() == RunState::Finished {
            return;
        }
        if !tls::in_ctx() {
            kwarn!(
                "context '{}' ({}) handle dropped outside any context; detaching",
                ctx.name(),
                ctx.id(),
            );
            ctx.add_flag(Flags::DETACH);
            return;
        }

        ctx.interrupt_request(false);
        self.inner = Some(ctx);
        if let Err(e) = self.join() {
            kdebug!("join on handle drop: {}", e);
            self.inner = None;
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("started", &self.started())
            .field("finished", &self.finished())
            .finish()
    }
}

/// `Send + Sync` notifier minted from a context.
///
/// The one legitimate path for foreign threads to wake a context: the note
/// travels through the reactor's inbox and is applied on the reactor thread.
#[derive(Clone)]
pub struct Remote {
    id: CtxId,
    shared: Arc<Shared>,
}

impl Remote {
    /// Notify the context from any thread.
    pub fn notify(&self) {
        let id = self.id;
        reactor::post_remote(
            &self.shared,
            Box::new(move || {
                reactor::with(|r| {
                    if let Some(ctx) = r.get(id) {
                        ctx.note();
                    }
                })
            }),
        );
    }

    pub fn id(&self) -> CtxId {
        self.id
    }
}

// ── Inter-context free functions ──────────────────────────────────

/// Post a note to `ctx`; returns whether a wake was issued.
pub fn notify(ctx: &Context) -> bool {
    ctx.notify()
}

/// Request cooperative cancellation of `ctx`.
pub fn interrupt(ctx: &Context) {
    ctx.interrupt()
}

/// Request forced cancellation of `ctx`.
pub fn terminate(ctx: &Context) {
    ctx.terminate()
}

/// Give `ctx` the next turn.
///
/// A direct stack-to-stack jump is unsafe while the target sleeps on its
/// alarm, so the turn is handed over through the reactor as a notify.
pub fn yield_to(ctx: &Context) {
    notify(ctx);
}

/// Run `f` on the reactor thread, serialized with `ctx`'s executions.
///
/// With a single reactor thread the run queue is every context's strand;
/// delivery order follows submission order.
pub fn signal<F>(ctx: &Context, f: F)
where
    F: FnOnce() + 'static,
{
    let _ = ctx;
    reactor::with(|r| r.defer(Box::new(f)));
}

pub fn started(ctx: &Context) -> bool {
    ctx.started()
}

pub fn finished(ctx: &Context) -> bool {
    ctx.finished()
}

pub fn interruption(ctx: &Context) -> bool {
    ctx.interruption()
}

pub fn notes(ctx: &Context) -> i64 {
    ctx.notes()
}

pub fn id(ctx: &Context) -> CtxId {
    ctx.id()
}

pub fn name(ctx: &Context) -> String {
    ctx.name().to_owned()
}
