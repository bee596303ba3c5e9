//! Chunk retry policies.

use std::time::Duration;

/// Strategy for spacing retries of a failed chunk.
///
/// Attempts are zero-based and counted per chunk, not per upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryPolicy {
    /// Every wait is the base interval.
    #[default]
    Constant,
    /// Waits grow linearly: `base * (attempt + 1)`.
    Linear,
    /// Waits double each attempt: `base * 2^attempt`.
    Exponential,
}

impl RetryPolicy {
    /// Returns the wait before retrying `attempt`.
    pub fn interval(&self, attempt: u32, base: Duration) -> Duration {
        match self {
            RetryPolicy::Constant => base,
            RetryPolicy::Linear => base.saturating_mul(attempt.saturating_add(1)),
            RetryPolicy::Exponential => {
                base.saturating_mul(2u32.saturating_pow(attempt))
            }
        }
    }
}
