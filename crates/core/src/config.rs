//! Environment helpers shared by every taskhub config loader.
//!
//! Profile lookups: when `TASKHUB_PROFILE` is set (e.g. `PROD`), every key is
//! first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.

use std::env;
use std::str::FromStr;

/// Env var selecting the active profile.
pub const PROFILE_VAR: &str = "TASKHUB_PROFILE";

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

pub fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

pub fn env_or(key: &str, default: &str) -> String {
    env_opt(key).unwrap_or_else(|| default.to_string())
}

/// Active profile name, upper-cased (empty = default).
pub fn active_profile() -> String {
    env_or(PROFILE_VAR, "").to_uppercase()
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
pub fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

/// Parse a profiled env var. Unparseable values are logged and ignored.
pub fn profiled_env_parse<T: FromStr>(profile: &str, key: &str) -> Option<T> {
    let raw = profiled_env_opt(profile, key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable env override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profiled_lookup_prefers_prefixed_key() {
        env::set_var("TASKHUB_CORE_TEST_KEY", "plain");
        env::set_var("STAGING_TASKHUB_CORE_TEST_KEY", "staged");

        assert_eq!(
            profiled_env_opt("STAGING", "TASKHUB_CORE_TEST_KEY").as_deref(),
            Some("staged")
        );
        assert_eq!(
            profiled_env_opt("", "TASKHUB_CORE_TEST_KEY").as_deref(),
            Some("plain")
        );
        assert_eq!(
            profiled_env_opt("OTHER", "TASKHUB_CORE_TEST_KEY").as_deref(),
            Some("plain")
        );
    }

    #[test]
    fn parse_ignores_garbage() {
        env::set_var("TASKHUB_CORE_TEST_NUMBER", "not-a-number");
        assert_eq!(profiled_env_parse::<u64>("", "TASKHUB_CORE_TEST_NUMBER"), None);

        env::set_var("TASKHUB_CORE_TEST_NUMBER2", "17");
        assert_eq!(profiled_env_parse::<u64>("", "TASKHUB_CORE_TEST_NUMBER2"), Some(17));
    }

    #[test]
    fn empty_values_count_as_unset() {
        env::set_var("TASKHUB_CORE_TEST_EMPTY", "");
        assert_eq!(env_opt("TASKHUB_CORE_TEST_EMPTY"), None);
        assert_eq!(env_or("TASKHUB_CORE_TEST_EMPTY", "fallback"), "fallback");
    }
}
