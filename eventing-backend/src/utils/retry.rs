use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{Span, info, warn};

/// Configuration for retrying operations.
///
/// # Fields
///
/// * `max_attempts` - The maximum number of attempts. If `None`, there is no limit on the number of attempts.
/// * `min_delay` - The delay after the first failed attempt.
/// * `max_delay` - The upper bound of the exponentially growing delay.
///
/// # Default Values
///
/// * `max_attempts`: `None` (no limit on attempts)
/// * `min_delay`: 1000 milliseconds
/// * `max_delay`: 10000 milliseconds
///
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: Option<usize>,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            min_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10000),
        }
    }
}

impl RetryConfig {
    pub fn delay(&self, attempt: usize) -> Duration {
        Duration::from_millis(reconnect_delay(
            attempt,
            self.min_delay.as_millis() as u64,
            self.max_delay.as_millis() as u64,
        ))
    }
}

/// Runs `operation` until it succeeds or the configured attempts are exhausted.
///
/// The last error is returned when giving up.
pub async fn retry<T, E, F, Fut>(config: &RetryConfig, span: &Span, mut operation: F) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= config.max_attempts.unwrap_or(usize::MAX) {
                    warn!(parent: span, "operation failed ({err}): no retry, current_attempt={attempt}");
                    return Err(err);
                }
                let delay = config.delay(attempt);
                info!(
                    parent: span,
                    "operation failed ({err}): retrying after {:?}, current_attempt={attempt}", delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

fn reconnect_delay(attempts: usize, min_delay_millis: u64, max_delay_millis: u64) -> u64 {
    let exp = attempts.saturating_sub(1) as u32;
    std::cmp::min(
        2_u64.saturating_pow(exp).saturating_mul(min_delay_millis),
        max_delay_millis,
    )
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use anyhow::{Result, anyhow};
    use tracing::Span;

    use super::{RetryConfig, reconnect_delay, retry};

    #[test]
    fn delay_grows_exponentially_up_to_max() {
        assert_eq!(reconnect_delay(1, 100, 1000), 100);
        assert_eq!(reconnect_delay(2, 100, 1000), 200);
        assert_eq!(reconnect_delay(3, 100, 1000), 400);
        assert_eq!(reconnect_delay(5, 100, 1000), 1000);
        assert_eq!(reconnect_delay(200, 100, 1000), 1000);
    }

    #[tokio::test]
    async fn retries_until_success() -> Result<()> {
        let config = RetryConfig {
            max_attempts: None,
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        };
        let calls = AtomicUsize::new(0);

        let value = retry(&config, &Span::none(), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(anyhow!("attempt {attempt} failed"))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await?;

        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        Ok(())
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let config = RetryConfig {
            max_attempts: Some(2),
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        };

        let result: Result<(), _> = retry(&config, &Span::none(), |attempt| async move {
            Err(anyhow!("attempt {attempt} failed"))
        })
        .await;

        assert_eq!(result.unwrap_err().to_string(), "attempt 2 failed");
    }
}
