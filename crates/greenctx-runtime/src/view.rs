//! Producer/consumer rendezvous over a borrowed stack object
//!
//! A producer builds a value in its own frame and parks inside `notify`
//! while consumers examine it; single-threaded scheduling is what makes the
//! aliasing legal. Copying the value would defeat the point, so the view
//! hands out references under its mutex instead.
//!
//! The producer is blocked until every consumer that had entered `wait`
//! before the hand-off has observed the value and released its lock.
//! Consumers arriving after `notify` returns wait for the next round.

use crate::ctx;
use crate::dock::Dock;
use crate::mutex::{Mutex, MutexGuard};
use greenctx_core::Result;

use std::cell::Cell;
use std::ops::Deref;
use std::time::{Duration, Instant};

/// Single-producer/multi-consumer transient exchange of a `T` that lives on
/// the producer's stack.
pub struct View<T> {
    mutex: Mutex,
    dock: Dock,
    t: Cell<*const T>,
    waiting: Cell<usize>,
}

/// A consumer's window onto the shared value.
///
/// Holds the view's mutex; the producer cannot invalidate the value until
/// every guard is gone.
pub struct ViewGuard<'v, T> {
    _lock: MutexGuard<'v>,
    t: *const T,
}

impl<T> View<T> {
    pub fn new() -> Self {
        View {
            mutex: Mutex::new(),
            dock: Dock::new(),
            t: Cell::new(std::ptr::null()),
            waiting: Cell::new(0),
        }
    }

    /// Number of consumers registered for the current or next exchange.
    pub fn waiting(&self) -> usize {
        self.waiting.get()
    }

    /// Acquire the view's mutex; consumers pass the guard to `wait`.
    pub fn lock(&self) -> Result<MutexGuard<'_>> {
        self.mutex.lock()
    }

    /// Offer `value` to every currently waiting consumer.
    ///
    /// Returns immediately when no consumer is registered. Otherwise parks
    /// until the last of them has observed the value; only then is `value`
    /// safe to destroy. Cancellation is deferred for the duration -- the
    /// protocol must drain before the producer may unwind its frame.
    pub fn notify(&self, value: &T) -> Result<()> {
        if self.waiting.get() == 0 {
            return Ok(());
        }

        let _defer = ctx::defer_cancel();
        self.t.set(value as *const T);
        self.dock.notify_all();
        self.dock.wait_while(|| self.waiting.get() != 0)?;

        // Under the lock no consumer still holds a guard; the reference can
        // be withdrawn and the next round released.
        let _lock = self.mutex.lock()?;
        self.t.set(std::ptr::null());
        debug_assert_eq!(self.waiting.get(), 0);
        self.dock.notify_all();
        Ok(())
    }

    /// Wait under `lock` for a produced value.
    ///
    /// Releases the lock while parked and re-acquires it before returning;
    /// the returned guard keeps it held while the value is read.
    pub fn wait<'v>(&'v self, lock: MutexGuard<'v>) -> Result<ViewGuard<'v, T>> {
        self.wait_inner(lock, None)
    }

    /// Timed form of [`View::wait`]; an expired deadline is
    /// `Error::Timeout`.
    pub fn wait_until<'v>(
        &'v self,
        lock: MutexGuard<'v>,
        tp: Instant,
    ) -> Result<ViewGuard<'v, T>> {
        self.wait_inner(lock, Some(tp))
    }

    /// Timed form of [`View::wait`] over a duration.
    pub fn wait_for<'v>(&'v self, lock: MutexGuard<'v>, d: Duration) -> Result<ViewGuard<'v, T>> {
        self.wait_inner(lock, Some(Instant::now() + d))
    }

    fn wait_inner<'v>(
        &'v self,
        mut lock: MutexGuard<'v>,
        deadline: Option<Instant>,
    ) -> Result<ViewGuard<'v, T>> {
        // An exchange already in flight belongs to earlier arrivals; wait
        // for it to clear before registering for the next one.
        while !self.t.get().is_null() {
            drop(lock);
            self.park(deadline)?;
            lock = self.mutex.lock()?;
        }

        self.waiting.set(self.waiting.get() + 1);
        loop {
            if !self.t.get().is_null() {
                break;
            }
            drop(lock);
            let parked = self.park(deadline);
            let reacquired = match parked {
                Ok(()) => self.mutex.lock(),
                Err(e) => Err(e),
            };
            match reacquired {
                Ok(g) => lock = g,
                Err(e) => {
                    self.leave();
                    return Err(e);
                }
            }
        }

        let t = self.t.get();
        debug_assert!(!t.is_null());
        self.leave();
        Ok(ViewGuard { _lock: lock, t })
    }

    fn park(&self, deadline: Option<Instant>) -> Result<()> {
        match deadline {
            Some(tp) => self.dock.wait_until_or(tp),
            None => self.dock.wait(),
        }
    }

    fn leave(&self) {
        self.waiting.set(self.waiting.get() - 1);
        self.dock.notify_all();
    }
}

impl<T> Default for View<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for View<T> {
    fn drop(&mut self) {
        debug_assert_eq!(self.waiting.get(), 0, "view dropped with live consumers");
    }
}

impl<T> Deref for ViewGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Valid while this guard lives: the producer is parked until
        // `waiting` drains and cannot null the pointer without taking the
        // mutex this guard holds.
        unsafe { &*self.t }
    }
}
