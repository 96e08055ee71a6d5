//! Reconnection delays with exponential backoff.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// Upper bound for any reconnect delay.
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Parameters for exponential backoff.
#[derive(Debug, Clone)]
pub struct BackoffParams {
    /// Initial delay in milliseconds
    pub initial_ms: u64,
    /// Multiplier for each retry
    pub mult: f64,
    /// Maximum delay in milliseconds
    pub max_ms: u64,
    /// Maximum number of tries (None = unlimited)
    pub max_tries: Option<u32>,
}

impl Default for BackoffParams {
    fn default() -> Self {
        Self {
            initial_ms: 1_000,
            mult: 2.0,
            max_ms: MAX_RECONNECT_DELAY.as_millis() as u64,
            max_tries: None,
        }
    }
}

impl BackoffParams {
    /// Doubling delays starting at `initial`, capped at 30s.
    pub fn reconnect(initial: Duration, max_tries: Option<u32>) -> Self {
        Self {
            initial_ms: initial.as_millis() as u64,
            max_tries,
            ..Self::default()
        }
    }

    /// Constant delay between tries.
    pub fn fixed(delay: Duration, max_tries: Option<u32>) -> Self {
        Self {
            initial_ms: delay.as_millis() as u64,
            mult: 1.0,
            max_ms: delay.as_millis() as u64,
            max_tries,
        }
    }
}

/// Stateful delay sequence for a reconnect loop.
#[derive(Debug, Clone)]
pub struct Backoff {
    params: BackoffParams,
    current_ms: u64,
}

impl Backoff {
    pub fn new(params: BackoffParams) -> Self {
        Self {
            params,
            current_ms: 0,
        }
    }

    /// The delay to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        self.current_ms = if self.current_ms == 0 {
            self.params.initial_ms.min(self.params.max_ms)
        } else {
            ((self.current_ms as f64) * self.params.mult).min(self.params.max_ms as f64) as u64
        };
        Duration::from_millis(self.current_ms)
    }

    pub fn reset(&mut self) {
        self.current_ms = 0;
    }

    pub fn max_tries(&self) -> Option<u32> {
        self.params.max_tries
    }
}

/// Retry a function with exponential backoff.
///
/// # Arguments
///
/// * `f` - The async function to retry
/// * `can_retry` - Function to check if an error is retriable
/// * `params` - Backoff parameters
///
/// # Returns
///
/// The result of the function, or the last error if all retries failed.
pub async fn retry_with_backoff<F, Fut, T, E, R>(
    mut f: F,
    can_retry: R,
    params: &BackoffParams,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut backoff = Backoff::new(params.clone());
    let mut tries = 0u32;

    loop {
        match f().await {
            Ok(result) => {
                if tries > 0 {
                    debug!("Operation succeeded after {} transient failures", tries);
                }
                return Ok(result);
            }
            Err(e) => {
                tries += 1;

                if let Some(max) = params.max_tries {
                    if tries >= max {
                        return Err(e);
                    }
                }

                if !can_retry(&e) {
                    return Err(e);
                }

                let delay = backoff.next_delay();
                debug!(
                    "Operation failed with error {}, retrying in {} ms; retries = {}",
                    e,
                    delay.as_millis(),
                    tries
                );
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delays_double_and_cap() {
        let mut backoff = Backoff::new(BackoffParams::reconnect(
            Duration::from_secs(10),
            None,
        ));
        assert_eq!(backoff.next_delay(), Duration::from_secs(10));
        assert_eq!(backoff.next_delay(), Duration::from_secs(20));
        assert_eq!(backoff.next_delay(), Duration::from_secs(30));
        assert_eq!(backoff.next_delay(), Duration::from_secs(30));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(10));
    }

    #[test]
    fn test_fixed_delay() {
        let mut backoff = Backoff::new(BackoffParams::fixed(Duration::from_millis(250), Some(2)));
        assert_eq!(backoff.next_delay(), Duration::from_millis(250));
        assert_eq!(backoff.next_delay(), Duration::from_millis(250));
        assert_eq!(backoff.max_tries(), Some(2));
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_tries() {
        let calls = AtomicU32::new(0);
        let params = BackoffParams::fixed(Duration::from_millis(1), Some(3));

        let result: Result<(), String> = retry_with_backoff(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("nope".to_string()) }
            },
            |_| true,
            &params,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_stops_on_permanent_error() {
        let calls = AtomicU32::new(0);
        let params = BackoffParams::fixed(Duration::from_millis(1), None);

        let result: Result<(), String> = retry_with_backoff(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("fatal".to_string()) }
            },
            |e| e != "fatal",
            &params,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
