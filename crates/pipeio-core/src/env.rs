//! Environment variable helpers for the `PIPEIO_*` knobs.
//!
//! ```ignore
//! use pipeio_core::env::{env_get, env_get_bool};
//!
//! let workers: usize = env_get("PIPEIO_POOL_WORKERS", 4);
//! let trust: bool = env_get_bool("PIPEIO_TRUST_CACHE", true);
//! ```

use std::str::FromStr;

/// Parse `key` as `T`; `default` if unset or unparsable.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// `Some(T)` if `key` is set and parses.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Boolean knob. "1", "true", "yes", "on" are true and "0", "false",
/// "no", "off" are false (case-insensitive). Anything else, including
/// unset, yields `default`.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

/// Like `env_get`, but zero counts as unset.
#[inline]
pub fn env_get_nonzero(key: &str, default: usize) -> usize {
    match env_get_opt::<usize>(key) {
        Some(0) | None => default,
        Some(v) => v,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_uses_default() {
        let val: usize = env_get("__PIPEIO_TEST_UNSET__", 42);
        assert_eq!(val, 42);
        assert!(env_get_bool("__PIPEIO_TEST_UNSET__", true));
        assert!(env_get_opt::<u32>("__PIPEIO_TEST_UNSET__").is_none());
    }

    #[test]
    fn test_parse_and_fallback() {
        std::env::set_var("__PIPEIO_TEST_NUM__", " 123 ");
        assert_eq!(env_get::<usize>("__PIPEIO_TEST_NUM__", 0), 123);
        std::env::set_var("__PIPEIO_TEST_NUM__", "many");
        assert_eq!(env_get::<usize>("__PIPEIO_TEST_NUM__", 99), 99);
        std::env::remove_var("__PIPEIO_TEST_NUM__");
    }

    #[test]
    fn test_bool_variants() {
        for (raw, expect) in [("1", true), ("ON", true), ("no", false), ("off", false)] {
            std::env::set_var("__PIPEIO_TEST_BOOL__", raw);
            assert_eq!(env_get_bool("__PIPEIO_TEST_BOOL__", !expect), expect, "{}", raw);
        }
        std::env::set_var("__PIPEIO_TEST_BOOL__", "garbage");
        assert!(env_get_bool("__PIPEIO_TEST_BOOL__", true));
        std::env::remove_var("__PIPEIO_TEST_BOOL__");
    }

    #[test]
    fn test_nonzero() {
        std::env::set_var("__PIPEIO_TEST_NZ__", "0");
        assert_eq!(env_get_nonzero("__PIPEIO_TEST_NZ__", 8), 8);
        std::env::set_var("__PIPEIO_TEST_NZ__", "3");
        assert_eq!(env_get_nonzero("__PIPEIO_TEST_NZ__", 8), 3);
        std::env::remove_var("__PIPEIO_TEST_NZ__");
    }
}
