//! # greenctx-core
//!
//! Core types for the greenctx cooperative context runtime.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! The scheduler, stacks and synchronizers live in `greenctx-runtime`.
//!
//! ## Modules
//!
//! - `id` - context identifier type
//! - `flags` - context flag bitset
//! - `error` - error types
//! - `log` - kernel-style debug printing macros
//! - `env` - environment variable utilities

pub mod env;
pub mod error;
pub mod flags;
pub mod id;
pub mod log;

// Re-exports for convenience
pub use env::{env_get, env_get_bool};
pub use error::{Error, Result, StackError};
pub use flags::Flags;
pub use id::CtxId;
pub use log::LogLevel;
