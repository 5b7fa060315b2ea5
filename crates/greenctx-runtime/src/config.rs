//! Runtime configuration
//!
//! Compile-time defaults with runtime environment overrides.
//!
//! # Environment Variables
//!
//! - `GCX_STACK_SIZE` - default usable stack bytes per context
//! - `GCX_PARK_TIMEOUT_MS` - upper bound on one idle reactor park
//! - `GCX_ENABLE_OFFLOAD` - allow the offload worker thread (0/1)
//!
//! # Example
//!
//! ```ignore
//! use greenctx_runtime::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_env()
//!     .default_stack_size(128 * 1024)
//!     .enable_offload(false);
//! ```

use crate::stack::MIN_STACK_SIZE;
use greenctx_core::env::{env_get, env_get_bool};
use greenctx_core::{Error, Result};
use std::time::Duration;

/// Compile-time defaults
pub mod defaults {
    /// Usable stack bytes per context
    pub const STACK_SIZE: usize = 256 * 1024;

    /// Idle park upper bound in milliseconds
    pub const PARK_TIMEOUT_MS: u64 = 100;

    /// Offload worker availability
    pub const ENABLE_OFFLOAD: bool = true;
}

/// Runtime configuration with builder-style setters.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Default usable stack size for contexts that do not pick their own
    pub default_stack_size: usize,
    /// Longest one idle reactor park may last
    pub park_timeout: Duration,
    /// Whether `offload` may start its worker thread
    pub enable_offload: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl RuntimeConfig {
    /// Compile-time defaults with environment overrides applied.
    pub fn from_env() -> Self {
        Self {
            default_stack_size: env_get("GCX_STACK_SIZE", defaults::STACK_SIZE),
            park_timeout: Duration::from_millis(env_get(
                "GCX_PARK_TIMEOUT_MS",
                defaults::PARK_TIMEOUT_MS,
            )),
            enable_offload: env_get_bool("GCX_ENABLE_OFFLOAD", defaults::ENABLE_OFFLOAD),
        }
    }

    /// Explicit defaults, no environment influence. Useful for tests.
    pub fn new() -> Self {
        Self {
            default_stack_size: defaults::STACK_SIZE,
            park_timeout: Duration::from_millis(defaults::PARK_TIMEOUT_MS),
            enable_offload: defaults::ENABLE_OFFLOAD,
        }
    }

    pub fn default_stack_size(mut self, size: usize) -> Self {
        self.default_stack_size = size;
        self
    }

    pub fn park_timeout(mut self, d: Duration) -> Self {
        self.park_timeout = d;
        self
    }

    pub fn enable_offload(mut self, enable: bool) -> Self {
        self.enable_offload = enable;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.default_stack_size < MIN_STACK_SIZE {
            return Err(Error::Config("default_stack_size below the minimum"));
        }
        if self.park_timeout.is_zero() {
            return Err(Error::Config("park_timeout must be non-zero"));
        }
        Ok(())
    }
}
