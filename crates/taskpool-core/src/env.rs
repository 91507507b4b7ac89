//! Environment variable utilities
//!
//! Used by the option types in `taskpool-runtime` to apply
//! `TASKPOOL_*` overrides on top of compiled defaults.
//!
//! ```ignore
//! let workers: usize = env_get("TASKPOOL_MAX_ACTIVE_WORKERS", 8);
//! let timeout = env_get_duration_ms("TASKPOOL_TIMEOUT_MS", None);
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Get environment variable parsed as type T, or return default
///
/// Unset and unparsable values both fall back to `default`.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Get environment variable as boolean
///
/// "1", "true", "yes", "on" (case-insensitive) are true, "0", "false",
/// "no", "off" are false. Unset or anything else returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

/// Get an optional duration given in milliseconds
///
/// `0`, `inf`, `infinite` and `none` mean "no limit" (`None`). A positive
/// integer is a limit in milliseconds. Unset or unparsable values return
/// the default.
pub fn env_get_duration_ms(key: &str, default: Option<Duration>) -> Option<Duration> {
    let Ok(val) = std::env::var(key) else {
        return default;
    };
    match val.trim().to_lowercase().as_str() {
        "0" | "inf" | "infinite" | "none" => None,
        other => other
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .unwrap_or(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test owns its variable names; tests run in parallel.

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("__TASKPOOL_TEST_UNSET__", 42);
        assert_eq!(val, 42);
    }

    #[test]
    fn test_env_get_with_set_var() {
        std::env::set_var("__TASKPOOL_TEST_NUM__", " 123 ");
        let val: usize = env_get("__TASKPOOL_TEST_NUM__", 0);
        assert_eq!(val, 123);
        std::env::remove_var("__TASKPOOL_TEST_NUM__");
    }

    #[test]
    fn test_env_get_invalid_parse() {
        std::env::set_var("__TASKPOOL_TEST_INVALID__", "not_a_number");
        let val: usize = env_get("__TASKPOOL_TEST_INVALID__", 99);
        assert_eq!(val, 99);
        std::env::remove_var("__TASKPOOL_TEST_INVALID__");
    }

    #[test]
    fn test_env_get_bool_variants() {
        let key = "__TASKPOOL_TEST_BOOL__";
        for v in ["1", "true", "TRUE", "yes", "on"] {
            std::env::set_var(key, v);
            assert!(env_get_bool(key, false), "{} should be true", v);
        }
        for v in ["0", "false", "no", "off"] {
            std::env::set_var(key, v);
            assert!(!env_get_bool(key, true), "{} should be false", v);
        }
        std::env::set_var(key, "garbage");
        assert!(env_get_bool(key, true));
        std::env::remove_var(key);
        assert!(!env_get_bool(key, false));
    }

    #[test]
    fn test_env_get_duration_ms() {
        let key = "__TASKPOOL_TEST_DURATION__";
        let fallback = Some(Duration::from_secs(1));

        assert_eq!(env_get_duration_ms(key, fallback), fallback);

        std::env::set_var(key, "250");
        assert_eq!(env_get_duration_ms(key, None), Some(Duration::from_millis(250)));

        for v in ["0", "inf", "Infinite", "none"] {
            std::env::set_var(key, v);
            assert_eq!(env_get_duration_ms(key, fallback), None);
        }

        std::env::set_var(key, "soon");
        assert_eq!(env_get_duration_ms(key, fallback), fallback);
        std::env::remove_var(key);
    }
}
