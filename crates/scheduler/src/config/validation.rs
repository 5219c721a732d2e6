use taskhub_core::KernelError;

use super::types::SchedulerConfig;

/// Upper bound for a single wall-clock penalty: one hour.
const MAX_PENALTY_MS: u64 = 3_600_000;

impl SchedulerConfig {
    /// Validate the config.
    pub fn validate(&self) -> Result<(), KernelError> {
        self.validate_penalty()?;
        Ok(())
    }

    fn validate_penalty(&self) -> Result<(), KernelError> {
        if self.failure_penalty_ms > MAX_PENALTY_MS {
            return Err(KernelError::Config(format!(
                "failure_penalty_ms {} exceeds the maximum of {MAX_PENALTY_MS}",
                self.failure_penalty_ms
            )));
        }
        Ok(())
    }
}
