//! Environment variable utilities
//!
//! Generic `env_get<T>` for parsing environment variables with defaults.
//!
//! ```ignore
//! use greenctx_core::{env_get, env_get_bool};
//!
//! let stack: usize = env_get("GCX_STACK_SIZE", 512 * 1024);
//! let offload: bool = env_get_bool("GCX_ENABLE_OFFLOAD", true);
//! ```

use std::str::FromStr;

/// Get an environment variable parsed as `T`, or return the default
///
/// Works with any type implementing `FromStr`; unparsable values fall back
/// to the default.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Get an environment variable as a boolean
///
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true. Unset
/// returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_when_unset() {
        let v: usize = env_get("GCX_TEST_SURELY_UNSET_VAR", 7);
        assert_eq!(v, 7);
        assert!(env_get_bool("GCX_TEST_SURELY_UNSET_VAR", true));
    }

    #[test]
    fn test_parse() {
        std::env::set_var("GCX_TEST_ENV_PARSE", "123");
        let v: u64 = env_get("GCX_TEST_ENV_PARSE", 0);
        assert_eq!(v, 123);
        std::env::remove_var("GCX_TEST_ENV_PARSE");
    }

    #[test]
    fn test_bool_forms() {
        std::env::set_var("GCX_TEST_ENV_BOOL", "yes");
        assert!(env_get_bool("GCX_TEST_ENV_BOOL", false));
        std::env::set_var("GCX_TEST_ENV_BOOL", "0");
        assert!(!env_get_bool("GCX_TEST_ENV_BOOL", true));
        std::env::remove_var("GCX_TEST_ENV_BOOL");
    }
}
