//! Thread-local current-context pointer
//!
//! Models "who is running now" on the reactor thread. Null whenever the
//! reactor itself (or any plain handler) is executing. Written only by the
//! context entry shim and the continuation protocol; everyone else reads.

use crate::ctx::Ctx;
use greenctx_core::CtxId;
use std::cell::Cell;

thread_local! {
    static CURRENT: Cell<*const Ctx> = const { Cell::new(std::ptr::null()) };
}

#[inline]
pub(crate) fn set_current(ctx: *const Ctx) {
    CURRENT.with(|c| c.set(ctx));
}

#[inline]
pub(crate) fn clear_current() {
    CURRENT.with(|c| c.set(std::ptr::null()));
}

#[inline]
pub(crate) fn current_ptr() -> *const Ctx {
    CURRENT.with(|c| c.get())
}

/// Check whether a context is current on this thread
#[inline]
pub(crate) fn in_ctx() -> bool {
    !current_ptr().is_null()
}

/// Id of the current context, or NONE
#[inline]
pub(crate) fn current_id() -> CtxId {
    match with_current(|c| c.id()) {
        Some(id) => id,
        None => CtxId::NONE,
    }
}

/// Run `f` against the current context, if any.
///
/// The reference is only valid on the reactor thread while the context has
/// not finished; both hold for the duration of `f` because only the context
/// itself can reach its own finish.
#[inline]
pub(crate) fn with_current<R>(f: impl FnOnce(&Ctx) -> R) -> Option<R> {
    let p = current_ptr();
    if p.is_null() {
        None
    } else {
        Some(f(unsafe { &*p }))
    }
}
