//! Bounded exponential backoff for transient sync failures.
//!
//! A batch gets a fixed attempt budget. Delays grow geometrically from a
//! small base and are capped, and every wait can be interrupted by the
//! shutdown signal so a draining engine never sits out a full backoff.

use std::time::Duration;

use tokio::sync::watch;

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
}

impl RetryConfig {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: Duration::from_secs(5),
            factor: 2.0,
        }
    }

    /// Delay to sleep after a failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let millis = self.base_delay.as_millis() as f64 * self.factor.powi(exp as i32);
        Duration::from_millis(millis as u64).min(self.max_delay)
    }
}

/// Sleeps out the backoff for `attempt`, returning early with
/// [`EngineError::Cancelled`] if the shutdown flag flips while waiting.
pub async fn backoff_sleep(
    config: &RetryConfig,
    attempt: u32,
    cancel: &mut watch::Receiver<bool>,
) -> EngineResult<()> {
    if *cancel.borrow() {
        return Err(EngineError::Cancelled);
    }
    let delay = config.delay_after(attempt);
    tokio::select! {
        _ = tokio::time::sleep(delay) => Ok(()),
        changed = cancel.changed() => {
            if changed.is_err() || *cancel.borrow() {
                Err(EngineError::Cancelled)
            } else {
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_and_cap() {
        let config = RetryConfig::new(5, Duration::from_millis(50));
        assert_eq!(config.delay_after(1), Duration::from_millis(50));
        assert_eq!(config.delay_after(2), Duration::from_millis(100));
        assert_eq!(config.delay_after(3), Duration::from_millis(200));
        assert_eq!(config.delay_after(30), Duration::from_secs(5));
    }

    #[test]
    fn zero_attempts_clamps_to_one() {
        let config = RetryConfig::new(0, Duration::from_millis(10));
        assert_eq!(config.max_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_is_cancellable() {
        let config = RetryConfig::new(3, Duration::from_secs(60));
        let (tx, rx) = watch::channel(false);
        let wait = tokio::spawn(async move {
            let mut rx2 = rx.clone();
            let res = backoff_sleep(&config, 1, &mut rx2).await;
            (res, rx.borrow().clone())
        });
        tx.send(true).unwrap();
        let (res, _) = wait.await.unwrap();
        assert!(matches!(res, Err(EngineError::Cancelled)));
    }
}
