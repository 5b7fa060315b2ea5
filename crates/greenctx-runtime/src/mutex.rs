//! Cooperative mutex with FIFO handoff
//!
//! Acquisition and release both happen on the reactor thread; the "lock" is
//! just an owner id plus a waiter queue. On unlock, ownership transfers
//! directly to the head waiter without passing through a free state, so a
//! late arrival can never barge in front of the queue.

use crate::reactor;
use crate::this_ctx;
use crate::tls;
use greenctx_core::{CtxId, Result};

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

/// A FIFO-fair cooperative mutex.
#[derive(Default)]
pub struct Mutex {
    owner: Cell<CtxId>,
    waiters: RefCell<VecDeque<CtxId>>,
}

/// RAII lock ownership; releases on drop.
pub struct MutexGuard<'a> {
    lock: &'a Mutex,
}

impl Mutex {
    pub const fn new() -> Self {
        Mutex {
            owner: Cell::new(CtxId::NONE),
            waiters: RefCell::new(VecDeque::new()),
        }
    }

    /// Acquire the lock, suspending while contended.
    pub fn lock(&self) -> Result<MutexGuard<'_>> {
        let me = this_ctx::id()?;
        debug_assert_ne!(self.owner.get(), me, "recursive lock");

        if self.owner.get().is_none() && self.waiters.borrow().is_empty() {
            self.owner.set(me);
            return Ok(MutexGuard { lock: self });
        }

        self.waiters.borrow_mut().push_back(me);
        loop {
            match this_ctx::wait() {
                // Handoff assigns the owner before the wake; anything else
                // was a spurious note.
                Ok(_) if self.owner.get() == me => return Ok(MutexGuard { lock: self }),
                Ok(_) => continue,
                Err(e) => {
                    self.remove_waiter(me);
                    if self.owner.get() == me {
                        // The handoff raced our cancellation; pass it on.
                        self.unlock_to_next();
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Acquire without ever yielding.
    pub fn try_lock(&self) -> Option<MutexGuard<'_>> {
        let me = tls::current_id();
        if me.is_none() {
            return None;
        }
        if self.owner.get().is_none() && self.waiters.borrow().is_empty() {
            self.owner.set(me);
            return Some(MutexGuard { lock: self });
        }
        None
    }

    /// Whether some context holds the lock.
    pub fn is_locked(&self) -> bool {
        self.owner.get().is_some()
    }

    /// Number of contexts queued for the lock.
    pub fn waiting(&self) -> usize {
        self.waiters.borrow().len()
    }

    fn unlock_to_next(&self) {
        loop {
            let next = self.waiters.borrow_mut().pop_front();
            let Some(id) = next else {
                self.owner.set(CtxId::NONE);
                return;
            };
            let handed = reactor::try_with(|r| match r.get(id) {
                Some(ctx) => {
                    self.owner.set(id);
                    ctx.note();
                    true
                }
                None => false,
            });
            if handed == Some(true) {
                return;
            }
        }
    }

    fn remove_waiter(&self, id: CtxId) {
        let mut waiters = self.waiters.borrow_mut();
        if let Some(at) = waiters.iter().position(|w| *w == id) {
            waiters.remove(at);
        }
    }
}

impl MutexGuard<'_> {
    /// Release explicitly; identical to dropping the guard.
    pub fn unlock(self) {}
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        debug_assert_eq!(
            self.lock.owner.get(),
            tls::current_id(),
            "guard dropped by a non-owner"
        );
        self.lock.unlock_to_next();
    }
}
