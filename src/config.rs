use crate::error::FeError;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityMode {
    /// fsync after every journal append.
    Full,
    OsBuffered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryMode {
    Strict,
    Permissive,
}

/// Runtime configuration for a frontend instance.
#[derive(Debug, Clone)]
pub struct FeConfig {
    /// Period of the alter job scheduler tick.
    pub alter_scheduler_interval_ms: u64,
    /// Upper bound on job steps executed concurrently within one tick.
    pub max_concurrent_job_steps: usize,
    /// Transient step failures tolerated before a job is marked FAILED.
    pub max_job_step_attempts: u32,
    pub retry_backoff_base_ms: u64,
    pub retry_backoff_max_ms: u64,
    pub alter_job_timeout_ms: u64,
    /// How long terminal jobs stay visible through introspection before purge.
    pub history_job_keep_ms: u64,
    /// Bound on waiting for a database write lock when publishing a job.
    pub db_lock_timeout_ms: u64,
    pub max_segment_bytes: u64,
    pub durability_mode: DurabilityMode,
    pub recovery_mode: RecoveryMode,
    pub hash_chain_required: bool,
}

impl Default for FeConfig {
    fn default() -> Self {
        Self {
            alter_scheduler_interval_ms: 1_000,
            max_concurrent_job_steps: 16,
            max_job_step_attempts: 10,
            retry_backoff_base_ms: 100,
            retry_backoff_max_ms: 30_000,
            alter_job_timeout_ms: 24 * 60 * 60 * 1_000,
            history_job_keep_ms: 7 * 24 * 60 * 60 * 1_000,
            db_lock_timeout_ms: 5_000,
            max_segment_bytes: 64 * 1024 * 1024,
            durability_mode: DurabilityMode::Full,
            recovery_mode: RecoveryMode::Strict,
            hash_chain_required: true,
        }
    }
}

impl FeConfig {
    pub fn development() -> Self {
        Self {
            durability_mode: DurabilityMode::OsBuffered,
            recovery_mode: RecoveryMode::Permissive,
            hash_chain_required: false,
            ..Self::default()
        }
    }

    /// Fast scheduler and no backoff, so jobs settle within a few milliseconds.
    pub fn for_tests() -> Self {
        Self {
            alter_scheduler_interval_ms: 10,
            retry_backoff_base_ms: 0,
            retry_backoff_max_ms: 0,
            db_lock_timeout_ms: 100,
            durability_mode: DurabilityMode::OsBuffered,
            ..Self::default()
        }
    }

    pub fn with_scheduler_interval_ms(mut self, interval_ms: u64) -> Self {
        self.alter_scheduler_interval_ms = interval_ms;
        self
    }

    pub fn strict_recovery(&self) -> bool {
        matches!(self.recovery_mode, RecoveryMode::Strict)
    }

    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_millis(self.alter_scheduler_interval_ms)
    }

    pub fn db_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.db_lock_timeout_ms)
    }

    /// Delay before retry number `attempt` (1-based), doubling up to the cap.
    pub fn retry_backoff_ms(&self, attempt: u32) -> u64 {
        let shift = attempt.saturating_sub(1).min(32);
        self.retry_backoff_base_ms
            .saturating_mul(1u64 << shift)
            .min(self.retry_backoff_max_ms)
    }

    pub fn validate(&self) -> Result<(), FeError> {
        if self.alter_scheduler_interval_ms == 0 {
            return Err(FeError::InvalidConfig {
                message: "alter_scheduler_interval_ms must be > 0".into(),
            });
        }
        if self.max_concurrent_job_steps == 0 {
            return Err(FeError::InvalidConfig {
                message: "max_concurrent_job_steps must be > 0".into(),
            });
        }
        if self.max_job_step_attempts == 0 {
            return Err(FeError::InvalidConfig {
                message: "max_job_step_attempts must be > 0".into(),
            });
        }
        if self.retry_backoff_base_ms > self.retry_backoff_max_ms {
            return Err(FeError::InvalidConfig {
                message: "retry_backoff_base_ms must be <= retry_backoff_max_ms".into(),
            });
        }
        if self.alter_job_timeout_ms == 0 {
            return Err(FeError::InvalidConfig {
                message: "alter_job_timeout_ms must be > 0".into(),
            });
        }
        if self.max_segment_bytes == 0 {
            return Err(FeError::InvalidConfig {
                message: "max_segment_bytes must be > 0".into(),
            });
        }
        Ok(())
    }
}
