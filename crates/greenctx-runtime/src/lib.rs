//! # greenctx-runtime
//!
//! The runtime half of greenctx: a single-threaded cooperative scheduler for
//! stackful contexts, layered over a reactor that owns a run queue, a timer
//! heap and a cross-thread inbox.
//!
//! Everything context-related executes on exactly one OS thread (the thread
//! that called [`Runtime::run`]). Contexts suspend by saving their registers
//! and switching back to the reactor; they are resumed by their per-context
//! alarm expiring or by a `notify`. The only kernel-level lock in the crate
//! is the offload bridge's queue mutex.
//!
//! This crate provides:
//! - Architecture-specific context switching (naked asm, x86_64 + aarch64)
//! - mmap'd context stacks with guard pages
//! - The reactor: deferred handlers, alarms, thread-safe submissions
//! - Context lifecycle, notification and interruption
//! - The current-context blocking API (`this_ctx`)
//! - Cooperative synchronizers: `Mutex`, `Dock`, `View`
//! - `Pool` worker pools and the `offload` OS-thread bridge
//! - The context profiler (`prof`)

pub mod arch;
pub mod config;
pub mod ctx;
pub mod dock;
pub mod mutex;
pub mod offload;
pub mod pool;
pub mod prof;
pub(crate) mod reactor;
pub mod runtime;
pub mod stack;
pub mod this_ctx;
pub(crate) mod tls;
pub mod view;

// Re-exports
pub use config::RuntimeConfig;
pub use ctx::{
    finished, interrupt, interruption, notes, notify, signal, spawn, started, terminate,
    yield_to, Builder, Context, Remote,
};
pub use dock::Dock;
pub use mutex::{Mutex, MutexGuard};
pub use offload::offload;
pub use pool::Pool;
pub use runtime::Runtime;
pub use view::{View, ViewGuard};

pub use greenctx_core::{Error, Flags, Result};

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Run a closure as the primary context of a fresh runtime.
    pub(crate) fn run<T, F>(f: F) -> T
    where
        F: FnOnce() -> Result<T> + 'static,
        T: 'static,
    {
        Runtime::new(RuntimeConfig::new())
            .expect("runtime config")
            .run(f)
            .expect("primary context failed")
    }
}
