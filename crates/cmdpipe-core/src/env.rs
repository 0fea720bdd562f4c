//! Environment variable helpers for configuration overrides
//!
//! ```ignore
//! use cmdpipe_core::env::{env_get, env_get_bool};
//!
//! let port: u16 = env_get("CMDPIPE_PORT", 9999);
//! let flush = env_get_bool("CMDPIPE_FLUSH_EPRINT", false);
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Get environment variable parsed as `T`, or return `default`
///
/// Unset variables and parse failures both fall back to the default.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Get environment variable as boolean
///
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true; any other
/// value is false. Unset returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Get environment variable as `Some(T)` if set and parseable
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Get environment variable as string, or return default
#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Get a millisecond count from the environment as a `Duration`
#[inline]
pub fn env_get_millis(key: &str, default: Duration) -> Duration {
    env_get_opt::<u64>(key)
        .map(Duration::from_millis)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("__CMDPIPE_TEST_UNSET__", 42);
        assert_eq!(val, 42);
        assert!(env_get_opt::<usize>("__CMDPIPE_TEST_UNSET__").is_none());
        assert_eq!(env_get_str("__CMDPIPE_TEST_UNSET__", "hello"), "hello");
        assert!(env_get_bool("__CMDPIPE_TEST_UNSET__", true));
    }

    #[test]
    fn test_env_get_with_set_var() {
        std::env::set_var("__CMDPIPE_TEST_NUM__", " 123 ");
        let val: usize = env_get("__CMDPIPE_TEST_NUM__", 0);
        assert_eq!(val, 123);
        std::env::remove_var("__CMDPIPE_TEST_NUM__");
    }

    #[test]
    fn test_env_get_invalid_parse() {
        std::env::set_var("__CMDPIPE_TEST_INVALID__", "not_a_number");
        let val: usize = env_get("__CMDPIPE_TEST_INVALID__", 99);
        assert_eq!(val, 99);
        std::env::remove_var("__CMDPIPE_TEST_INVALID__");
    }

    #[test]
    fn test_env_get_bool_variants() {
        for (raw, expected) in [("1", true), ("TRUE", true), ("on", true), ("0", false), ("garbage", false)] {
            std::env::set_var("__CMDPIPE_TEST_BOOL__", raw);
            assert_eq!(env_get_bool("__CMDPIPE_TEST_BOOL__", !expected), expected, "{}", raw);
        }
        std::env::remove_var("__CMDPIPE_TEST_BOOL__");
    }

    #[test]
    fn test_env_get_millis() {
        std::env::set_var("__CMDPIPE_TEST_MS__", "250");
        assert_eq!(
            env_get_millis("__CMDPIPE_TEST_MS__", Duration::ZERO),
            Duration::from_millis(250)
        );
        std::env::remove_var("__CMDPIPE_TEST_MS__");
        assert_eq!(
            env_get_millis("__CMDPIPE_TEST_MS__", Duration::from_secs(1)),
            Duration::from_secs(1)
        );
    }
}
