use std::future::Future;
use std::time::Duration;

use error_stack::Report;
use tokio::time::sleep;
use tracing::warn;

/// Bounded exponential backoff: the delay doubles after every failed attempt
/// up to `max_backoff`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay slept after the given (1-based) failed attempt.
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Run `op` until it succeeds, fails with an error `is_transient` rejects, or
/// the attempt budget is spent. `op` receives the 1-based attempt number.
pub async fn with_backoff<T, C, F, Fut>(
    policy: &RetryPolicy,
    stage: &'static str,
    is_transient: impl Fn(&C) -> bool,
    mut op: F,
) -> Result<T, Report<C>>
where
    C: std::error::Error + Send + Sync + 'static,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, Report<C>>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(report) => {
                let transient = is_transient(report.current_context());
                if !transient || attempt >= max_attempts {
                    return Err(report.attach(format!(
                        "{stage}: gave up after {attempt} of {max_attempts} attempt(s)"
                    )));
                }
                let delay = policy.backoff_after(attempt);
                warn!(
                    stage,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %report.current_context(),
                    "transient failure, retrying"
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
