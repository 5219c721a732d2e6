use std::path::Path;

use taskhub_core::config::{active_profile, profiled_env_parse};
use taskhub_core::KernelError;

use super::types::SchedulerConfig;

impl SchedulerConfig {
    /// Parse and validate a TOML string. The environment is not consulted.
    pub fn from_toml(toml_str: &str) -> Result<Self, KernelError> {
        let config = Self::parse(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML string, apply environment overrides, then validate.
    pub fn load(toml_str: &str) -> Result<Self, KernelError> {
        let mut config = Self::parse(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// [`load`](Self::load) the file at `path`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, KernelError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| KernelError::Config(format!("{}: {e}", path.display())))?;
        Self::load(&content)
    }

    fn parse(toml_str: &str) -> Result<Self, KernelError> {
        toml::from_str(toml_str).map_err(|e| KernelError::Config(e.to_string()))
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self, KernelError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    // ── Environment variable overrides ──────────────────────────────

    /// Apply environment variable overrides.
    ///
    /// Convention: `TASKHUB_<KEY>` overrides `<key>`; with `TASKHUB_PROFILE=PROD`
    /// the key `PROD_TASKHUB_<KEY>` wins when set.
    /// - `TASKHUB_HISTORY_LIMIT` -> `history_limit`
    /// - `TASKHUB_FAILURE_PENALTY_MS` -> `failure_penalty_ms`
    /// - `TASKHUB_FAILURE_PENALTY_PASSES` -> `failure_penalty_passes`
    /// - `TASKHUB_RECOVERY_AVOIDS_FAILED_ENGINE` -> `recovery_avoids_failed_engine`
    /// - `TASKHUB_MAX_RECOVERY_DEPTH` -> `max_recovery_depth`
    /// - `TASKHUB_REJECT_WITHOUT_ENGINES` -> `reject_without_engines`
    pub(crate) fn apply_env_overrides(&mut self) {
        let profile = active_profile();
        if let Some(v) = profiled_env_parse(&profile, "TASKHUB_HISTORY_LIMIT") {
            self.history_limit = v;
        }
        if let Some(v) = profiled_env_parse(&profile, "TASKHUB_FAILURE_PENALTY_MS") {
            self.failure_penalty_ms = v;
        }
        if let Some(v) = profiled_env_parse(&profile, "TASKHUB_FAILURE_PENALTY_PASSES") {
            self.failure_penalty_passes = v;
        }
        if let Some(v) = profiled_env_parse(&profile, "TASKHUB_RECOVERY_AVOIDS_FAILED_ENGINE") {
            self.recovery_avoids_failed_engine = v;
        }
        if let Some(v) = profiled_env_parse(&profile, "TASKHUB_MAX_RECOVERY_DEPTH") {
            self.max_recovery_depth = v;
        }
        if let Some(v) = profiled_env_parse(&profile, "TASKHUB_REJECT_WITHOUT_ENGINES") {
            self.reject_without_engines = v;
        }
    }
}
