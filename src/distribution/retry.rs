//! Unified retry policies for consistent backoff behavior across the core.
//!
//! This module replaces ad-hoc retry loops with standardized policies using
//! the `backon` crate.
//!
//! # Available Policies
//!
//! | Policy | Min Delay | Max Delay | Retries | Use Case |
//! |--------|-----------|-----------|---------|----------|
//! | `txn_policy` | 10ms | 1s | 10 | metadata transactions |
//! | `snap_request_policy` | 100ms | unbounded (doubling) | configurable | snapshot RPCs lost in the network |
//! | `audit_launch_policy` | 100ms | 100ms | configurable | audit front-door relaunch |
//!
//! # Example
//!
//! ```rust,no_run
//! use backon::Retryable;
//! use shardwise::distribution::retry;
//! use shardwise::distribution::DistributionError;
//!
//! async fn example() -> Result<(), DistributionError> {
//!     (|| async {
//!         // a fenced metadata write
//!         Ok::<_, DistributionError>(())
//!     })
//!     .retry(retry::txn_policy())
//!     .when(|e| matches!(e, DistributionError::Txn(_)))
//!     .await
//! }
//! ```

use std::time::Duration;

use backon::ExponentialBuilder;

use crate::constants::PREVENT_FAST_SPIN_DELAY;

/// Policy for transactions against the metadata keyspace.
///
/// Transient conflicts resolve quickly; fencing errors must not be retried,
/// so pair this with `.when(..)` filtering on `Txn(_)`.
pub fn txn_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_secs(1))
        .with_max_times(10)
        .with_jitter()
}

/// Policy for snapshot requests whose delivery is uncertain.
///
/// Doubles from `PREVENT_FAST_SPIN_DELAY` with no upper bound on the delay:
/// a snapshot in flight should back off rather than hammer a recovering
/// worker. The retry budget is the caller-supplied network-failure limit,
/// and the same snapshot UID is reused so duplicate deliveries are
/// idempotent on the receiver.
pub fn snap_request_policy(retry_limit: u32) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(PREVENT_FAST_SPIN_DELAY)
        .with_factor(2.0)
        .with_max_times(retry_limit as usize)
}

/// Policy for relaunching `launch_audit` from the request front door.
///
/// A flat, short pause: launch failures are dominated by bootstrap races
/// that resolve as soon as initialization completes.
pub fn audit_launch_policy(retry_limit: u32, delay: Duration) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(delay)
        .with_max_delay(delay)
        .with_factor(1.0)
        .with_max_times(retry_limit as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use backon::Retryable;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::distribution::DistributionError;

    #[tokio::test]
    async fn test_txn_policy_retries_transient() {
        let attempts = AtomicU32::new(0);
        let result = (|| async {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(DistributionError::Txn("conflict".to_string()))
            } else {
                Ok(42)
            }
        })
        .retry(txn_policy())
        .when(|e| matches!(e, DistributionError::Txn(_)))
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_txn_policy_does_not_retry_fencing() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = (|| async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(DistributionError::MoveKeysConflict)
        })
        .retry(txn_policy())
        .when(|e| matches!(e, DistributionError::Txn(_)))
        .await;
        assert_eq!(result, Err(DistributionError::MoveKeysConflict));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_snap_request_policy_budget() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = (|| async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(DistributionError::RequestMaybeDelivered)
        })
        .retry(snap_request_policy(2))
        .when(|e| matches!(e, DistributionError::RequestMaybeDelivered))
        .await;
        assert_eq!(result, Err(DistributionError::RequestMaybeDelivered));
        // initial attempt + 2 retries
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
