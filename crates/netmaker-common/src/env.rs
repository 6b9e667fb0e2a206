//! Environment access for startup configuration
//!
//! Configuration is read once at startup through [`EnvSource`] so that tests
//! can hand in a plain map instead of mutating process-global state.

use std::collections::HashMap;
use std::str::FromStr;

/// Source of environment variables
#[cfg_attr(test, mockall::automock)]
pub trait EnvSource: Send + Sync {
    /// Value of `key`, or None when unset or not valid unicode
    fn var(&self, key: &str) -> Option<String>;
}

/// Reads from the process environment
#[derive(Clone, Copy, Debug, Default)]
pub struct OsEnv;

impl EnvSource for OsEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl EnvSource for HashMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

/// Value of `key` if set to a non-empty string
pub fn non_empty(env: &dyn EnvSource, key: &str) -> Option<String> {
    env.var(key).filter(|v| !v.is_empty())
}

/// First non-empty value among `keys`, checked in order
///
/// Used for variables that have a preferred name and a legacy alias.
pub fn first_non_empty(env: &dyn EnvSource, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| non_empty(env, key))
}

/// Parse `key` as `T`, falling back to `default` when unset, empty or unparseable
pub fn parse_or<T: FromStr>(env: &dyn EnvSource, key: &str, default: T) -> T {
    non_empty(env, key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Split a comma separated list, trimming whitespace around each entry
pub fn split_list(value: &str) -> Vec<String> {
    value.split(',').map(|s| s.trim().to_string()).collect()
}
