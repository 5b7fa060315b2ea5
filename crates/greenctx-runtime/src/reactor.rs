//! The reactor: run queue, alarms, cross-thread inbox
//!
//! One reactor is installed per runtime on the thread that runs it. It owns
//! the deferred-handler queue, the alarm min-heap, the registry of live
//! contexts and the saved registers of the scheduler side of every switch.
//!
//! Alarms use lazy cancellation: each context carries a sequence number and
//! heap entries record the sequence they were armed under; a canceled or
//! superseded entry is simply skipped when it surfaces. When idle, the loop
//! parks on a condvar until the earliest alarm deadline or a cross-thread
//! submission wakes it.

use crate::arch::{self, SavedRegs};
use crate::ctx::{Ctx, RunState};
use crate::offload;
use greenctx_core::{CtxId, Error, Result};

use crossbeam_queue::SegQueue;
use std::cell::{Cell, RefCell, UnsafeCell};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::rc::Rc;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// A deferred unit of work, run on the reactor thread outside any context
pub(crate) type Handler = Box<dyn FnOnce()>;

/// A unit of work submitted from a foreign thread
pub(crate) type SendHandler = Box<dyn FnOnce() + Send>;

thread_local! {
    static REACTOR: RefCell<Option<Rc<Reactor>>> = const { RefCell::new(None) };
}

/// State reachable from foreign threads: the inbox and the parking latch.
pub(crate) struct Shared {
    inbox: SegQueue<SendHandler>,
    park: Mutex<bool>,
    unpark: Condvar,
}

impl Shared {
    fn new() -> Self {
        Self {
            inbox: SegQueue::new(),
            park: Mutex::new(false),
            unpark: Condvar::new(),
        }
    }
}

/// Submit work from any thread and wake the reactor if it is parked.
pub(crate) fn post_remote(shared: &Shared, h: SendHandler) {
    shared.inbox.push(h);
    let mut pending = shared.park.lock().unwrap();
    *pending = true;
    drop(pending);
    shared.unpark.notify_one();
}

/// One armed alarm; min-ordered by deadline with id/seq tie-breaks.
struct AlarmEntry {
    deadline: Instant,
    id: CtxId,
    seq: u64,
}

impl PartialEq for AlarmEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id && self.seq == other.seq
    }
}

impl Eq for AlarmEntry {}

impl PartialOrd for AlarmEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AlarmEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.id.cmp(&other.id))
            .then(self.seq.cmp(&other.seq))
    }
}

pub(crate) struct Reactor {
    queue: RefCell<VecDeque<Handler>>,
    alarms: RefCell<BinaryHeap<Reverse<AlarmEntry>>>,
    ctxs: RefCell<HashMap<u64, Rc<Ctx>>>,
    sched_regs: UnsafeCell<SavedRegs>,
    shared: Arc<Shared>,
    offload: RefCell<Option<offload::Worker>>,
    offload_enabled: bool,
    default_stack_size: usize,
    park_timeout: Duration,
    turns: Cell<u64>,
}

impl Reactor {
    fn new(default_stack_size: usize, park_timeout: Duration, offload_enabled: bool) -> Self {
        Self {
            queue: RefCell::new(VecDeque::new()),
            alarms: RefCell::new(BinaryHeap::new()),
            ctxs: RefCell::new(HashMap::new()),
            sched_regs: UnsafeCell::new(SavedRegs::zeroed()),
            shared: Arc::new(Shared::new()),
            offload: RefCell::new(None),
            offload_enabled,
            default_stack_size,
            park_timeout,
            turns: Cell::new(0),
        }
    }

    /// Enqueue a handler for a later turn.
    pub(crate) fn defer(&self, h: Handler) {
        self.queue.borrow_mut().push_back(h);
    }

    pub(crate) fn shared_arc(&self) -> Arc<Shared> {
        self.shared.clone()
    }

    pub(crate) fn default_stack_size(&self) -> usize {
        self.default_stack_size
    }

    pub(crate) fn sched_regs_ptr(&self) -> *mut SavedRegs {
        self.sched_regs.get()
    }

    /// Turns executed so far; a cheap progress probe for diagnostics.
    pub(crate) fn turns(&self) -> u64 {
        self.turns.get()
    }

    pub(crate) fn register(&self, ctx: Rc<Ctx>) {
        self.ctxs.borrow_mut().insert(ctx.id().as_u64(), ctx);
    }

    pub(crate) fn get(&self, id: CtxId) -> Option<Rc<Ctx>> {
        self.ctxs.borrow().get(&id.as_u64()).cloned()
    }

    /// Arm a context's alarm for one suspension.
    pub(crate) fn arm_alarm(&self, id: CtxId, seq: u64, deadline: Instant) {
        self.alarms.borrow_mut().push(Reverse(AlarmEntry {
            deadline,
            id,
            seq,
        }));
    }

    /// First switch into a freshly spawned context.
    pub(crate) fn launch(&self, ctx: &Rc<Ctx>) {
        if ctx.state() != RunState::Spawning {
            return;
        }
        self.enter(ctx);
    }

    /// Queue a resume for a context whose wake was just issued.
    ///
    /// The context moves to Woken immediately so repeat wakes and late alarm
    /// firings become no-ops; the seq captured here goes stale if anything
    /// else happens to the context before the handler runs.
    pub(crate) fn schedule_resume(&self, ctx: &Rc<Ctx>) {
        ctx.set_state(RunState::Woken);
        let id = ctx.id();
        let seq = ctx.alarm_seq();
        self.defer(Box::new(move || {
            with(|r| {
                if let Some(ctx) = r.get(id) {
                    if ctx.state() == RunState::Woken && ctx.alarm_seq() == seq {
                        ctx.set_state(RunState::Running);
                        r.enter(&ctx);
                    }
                }
            })
        }));
    }

    /// Switch into a context; returns when it suspends or finishes.
    pub(crate) fn enter(&self, ctx: &Rc<Ctx>) {
        debug_assert!(!crate::tls::in_ctx());
        unsafe { arch::switch(self.sched_regs.get(), ctx.regs_ptr()) };
        debug_assert!(!crate::tls::in_ctx());

        // A finished context is reclaimed here, on the reactor stack, after
        // its own stack is guaranteed dormant.
        if ctx.state() == RunState::Finished {
            self.ctxs.borrow_mut().remove(&ctx.id().as_u64());
        }
    }

    /// Hand a blocking job to the offload worker, starting it on first use.
    pub(crate) fn offload_push(&self, job: offload::Job) -> Result<()> {
        if !self.offload_enabled {
            return Err(Error::Config("offload disabled by configuration"));
        }
        let mut slot = self.offload.borrow_mut();
        let worker = slot.get_or_insert_with(offload::Worker::start);
        worker.push(job);
        Ok(())
    }

    /// Drive the loop until `done` reports completion with nothing queued.
    pub(crate) fn run_until(&self, mut done: impl FnMut() -> bool) {
        loop {
            while let Some(h) = self.shared.inbox.pop() {
                h();
            }

            self.fire_due_alarms();

            let h = self.queue.borrow_mut().pop_front();
            if let Some(h) = h {
                self.turns.set(self.turns.get() + 1);
                h();
                continue;
            }

            if done() {
                break;
            }
            self.park();
        }
    }

    fn fire_due_alarms(&self) {
        let now = Instant::now();
        loop {
            let due = {
                let mut alarms = self.alarms.borrow_mut();
                match alarms.peek() {
                    Some(Reverse(e)) if e.deadline <= now => alarms.pop().map(|r| r.0),
                    _ => None,
                }
            };
            let Some(entry) = due else { break };

            // Skip entries canceled by a wake or superseded by a later arm.
            if let Some(ctx) = self.get(entry.id) {
                if ctx.alarm_seq() == entry.seq && ctx.state() == RunState::Suspended {
                    ctx.bump_alarm_seq();
                    self.schedule_resume(&ctx);
                }
            }
        }
    }

    fn park(&self) {
        // Approximate: a stale head entry only makes us wake early.
        let next = self
            .alarms
            .borrow()
            .peek()
            .map(|Reverse(e)| e.deadline);

        let mut pending = self.shared.park.lock().unwrap();
        if *pending {
            *pending = false;
            return;
        }
        if !self.shared.inbox.is_empty() {
            return;
        }
        let wait_for = match next {
            Some(d) => d
                .saturating_duration_since(Instant::now())
                .min(self.park_timeout),
            None => self.park_timeout,
        };
        if wait_for.is_zero() {
            return;
        }
        let (mut guard, _timed_out) = self.shared.unpark.wait_timeout(pending, wait_for).unwrap();
        *guard = false;
    }
}

/// Install a reactor on this thread for the duration of a runtime run.
pub(crate) fn install(
    default_stack_size: usize,
    park_timeout: Duration,
    offload_enabled: bool,
) -> Result<()> {
    REACTOR.with(|slot| {
        let mut slot = slot.borrow_mut();
        if slot.is_some() {
            return Err(Error::Config("a runtime is already active on this thread"));
        }
        *slot = Some(Rc::new(Reactor::new(
            default_stack_size,
            park_timeout,
            offload_enabled,
        )));
        Ok(())
    })
}

/// Tear the reactor down; discards any still-suspended contexts.
pub(crate) fn uninstall() {
    REACTOR.with(|slot| {
        *slot.borrow_mut() = None;
    });
}

/// Whether a reactor is installed on the calling thread.
pub(crate) fn installed() -> bool {
    REACTOR.with(|slot| slot.borrow().is_some())
}

/// Run against this thread's reactor. Panics outside a runtime; callers
/// with a recoverable story use `try_with`.
pub(crate) fn with<R>(f: impl FnOnce(&Reactor) -> R) -> R {
    let r = REACTOR
        .with(|slot| slot.borrow().clone())
        .expect("no runtime active on this thread");
    f(&r)
}

/// Like `with`, but surfaces the missing reactor as None.
pub(crate) fn try_with<R>(f: impl FnOnce(&Reactor) -> R) -> Option<R> {
    let r = REACTOR.with(|slot| slot.borrow().clone())?;
    Some(f(&r))
}
