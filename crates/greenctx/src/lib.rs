//! # greenctx - cooperative stackful context runtime
//!
//! Userspace contexts with synchronous-looking blocking primitives, all
//! serialized on one reactor thread. A context is a real stack plus saved
//! registers; it waits, sleeps and joins like a thread, but suspension only
//! ever happens at the points that ask for it.
//!
//! ## Quick start
//!
//! ```ignore
//! use greenctx::{this_ctx, Runtime, RuntimeConfig};
//!
//! fn main() -> greenctx::Result<()> {
//!     let mut rt = Runtime::new(RuntimeConfig::from_env())?;
//!     rt.run(|| {
//!         let mut worker = greenctx::spawn("worker", || {
//!             this_ctx::sleep(std::time::Duration::from_millis(10))?;
//!             Ok(())
//!         })?;
//!         worker.join()?;
//!         Ok(())
//!     })
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                      Context code                       │
//! │     this_ctx::{wait, sleep, yield_now}, Dock, Mutex,    │
//! │            View, Pool::submit, offload                  │
//! └─────────────────────────────────────────────────────────┘
//!                             │ suspend / resume
//!                             ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                        Reactor                          │
//! │      run queue · alarm heap · cross-thread inbox        │
//! └─────────────────────────────────────────────────────────┘
//!          │                  │                  │
//!          ▼                  ▼                  ▼
//!    guarded mmap        naked-asm          offload OS
//!       stacks         context switch      worker thread
//! ```
//!
//! Everything context-facing runs on the thread that called
//! [`Runtime::run`]; the offload worker is the only other thread, and it
//! talks back exclusively through the reactor's inbox.

// Core types
pub use greenctx_core::{CtxId, Error, Flags, LogLevel, Result, StackError};

// Logging macros and helpers
pub use greenctx_core::{kcrit, kdebug, kerror, kinfo, ktrace, kwarn};
pub use greenctx_core::{env_get, env_get_bool, log};

// Runtime surface
pub use greenctx_runtime::ctx::spawn;
pub use greenctx_runtime::{
    finished, interrupt, interruption, notes, notify, offload, signal, started, terminate,
    yield_to, Builder, Context, Dock, Mutex, MutexGuard, Pool, Remote, Runtime, RuntimeConfig,
    View, ViewGuard,
};

pub use greenctx_runtime::prof;
pub use greenctx_runtime::this_ctx;
pub use greenctx_runtime::runtime::{in_ctx, on_reactor_thread};
