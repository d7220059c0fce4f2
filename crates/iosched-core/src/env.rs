//! Environment variable utilities
//!
//! Typed lookups with defaults, used by `IoSchedConfig::from_env` and the
//! log macros.
//!
//! ```ignore
//! use iosched_core::env::{env_get, env_get_tristate};
//!
//! let max_active: usize = env_get("IOS_MAX_ACTIVE", 32);
//! let sort: Option<bool> = env_get_tristate("IOS_SORT_QUEUE"); // None = auto
//! ```

use std::str::FromStr;

/// Parse `key` as `T`, falling back to `default` when unset or malformed.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Parse `key` as `T`; `None` when unset or malformed.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Boolean switch. `1|true|yes|on` is true, any other value is false,
/// unset returns `default`.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => parse_bool(&val).unwrap_or(false),
        Err(_) => default,
    }
}

/// Three-way switch for settings with an "auto" state.
///
/// `-1`/`auto` or unset gives `None`; otherwise a boolean.
pub fn env_get_tristate(key: &str) -> Option<bool> {
    let val = std::env::var(key).ok()?;
    match val.trim().to_ascii_lowercase().as_str() {
        "-1" | "auto" | "" => None,
        other => Some(parse_bool(other).unwrap_or(false)),
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
