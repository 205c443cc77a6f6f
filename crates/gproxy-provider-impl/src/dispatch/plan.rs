use std::time::Duration;

const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Per-request retry policy, assembled from configuration and tuning headers.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchPlan {
    /// Negative means every candidate may be tried.
    pub max_retries: i32,
    pub retry_delay: Duration,
    pub retry_backoff: f64,
    pub retry_on_zero_completion_tokens: bool,
}

impl Default for DispatchPlan {
    fn default() -> Self {
        Self {
            max_retries: -1,
            retry_delay: Duration::ZERO,
            retry_backoff: 1.0,
            retry_on_zero_completion_tokens: false,
        }
    }
}

impl DispatchPlan {
    pub fn max_attempts(&self, candidates: usize) -> usize {
        if self.max_retries < 0 {
            candidates
        } else {
            (self.max_retries as usize).saturating_add(1).min(candidates)
        }
    }

    /// Sleep before attempt `attempt` (0-based); `None` for the first attempt
    /// or when no delay is configured. Capped at one minute.
    pub fn delay_before(&self, attempt: usize) -> Option<Duration> {
        if attempt == 0 || self.retry_delay.is_zero() {
            return None;
        }
        let backoff = if self.retry_backoff.is_finite() && self.retry_backoff > 0.0 {
            self.retry_backoff
        } else {
            1.0
        };
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let secs = self.retry_delay.as_secs_f64() * backoff.powi(exponent);
        let delay = Duration::try_from_secs_f64(secs).unwrap_or(MAX_RETRY_DELAY);
        Some(delay.min(MAX_RETRY_DELAY))
    }
}
