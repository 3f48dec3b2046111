//! Named retry policies built on `backon`.
//!
//! | Policy | Min Delay | Max Delay | Retries | Use Case |
//! |--------|-----------|-----------|---------|----------|
//! | `health_check_policy` | 1s | 2s | 2 | Broker liveness checks |
//! | `network_policy` | 100ms | 2s | 3 | Sync fan-out, replica RPC connect |
//! | `fast_policy` | 5ms | 100ms | 3 | Follower apply lag on reads |
//!
//! The health check policy is jitter-free: a check is three attempts
//! spaced 1s then 2s apart.

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};

use crate::constants::{HEALTH_CHECK_ATTEMPTS, HEALTH_CHECK_BACKOFF_BASE};

/// Policy for health checks: `HEALTH_CHECK_ATTEMPTS` attempts, 1s then 2s between them.
pub fn health_check_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(HEALTH_CHECK_BACKOFF_BASE)
        .with_max_delay(HEALTH_CHECK_BACKOFF_BASE * 2)
        .with_factor(2.0)
        .with_max_times(HEALTH_CHECK_ATTEMPTS - 1)
}

/// Policy for manager-to-manager calls and transport reconnects.
pub fn network_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(3)
        .with_jitter()
}

/// Policy for short local waits, such as a follower catching up on applies.
pub fn fast_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(5))
        .with_max_delay(Duration::from_millis(100))
        .with_max_times(3)
        .with_jitter()
}

/// Run `operation` under [`network_policy`], retrying while `condition` holds.
pub async fn with_network_policy<F, Fut, T, E, C>(operation: F, condition: C) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    C: FnMut(&E) -> bool,
{
    operation.retry(network_policy()).when(condition).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use backon::BackoffBuilder;

    #[test]
    fn test_health_check_policy_schedule() {
        let delays: Vec<Duration> = health_check_policy().build().collect();
        assert_eq!(delays, vec![Duration::from_secs(1), Duration::from_secs(2)]);
    }

    #[test]
    fn test_network_policy_is_bounded() {
        let delays: Vec<Duration> = network_policy().build().collect();
        assert_eq!(delays.len(), 3);
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(4)));
    }

    #[tokio::test]
    async fn test_with_network_policy_stops_on_permanent_error() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let attempts = AtomicU32::new(0);
        let result: Result<(), &str> = with_network_policy(
            || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err("permanent")
            },
            |_| false,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fast_policy_is_bounded() {
        let delays: Vec<Duration> = fast_policy().build().collect();
        assert_eq!(delays.len(), 3);
    }
}
