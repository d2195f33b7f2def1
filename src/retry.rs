//! Retry policies for single collaborator calls made by pipeline actions.
//!
//! Watcher and manager loops never use these: they run on fixed delays and
//! rely on the next full sync. Only one-shot side effects (saving a
//! collector config, creating an application) are retried, and only for
//! errors classified as transient by [`SyncError::is_transient`].
//!
//! | Policy | Min Delay | Max Delay | Retries | Use Case |
//! |--------|-----------|-----------|---------|----------|
//! | `storage_policy` | 10ms | 500ms | 3 | record save / delete / get |
//! | `api_policy` | 100ms | 2s | 3 | application create / delete |
//!
//! ```rust,no_run
//! use fleetwatch::retry;
//! use fleetwatch::error::SyncError;
//!
//! async fn example() -> Result<(), SyncError> {
//!     retry::with_storage_policy("save_config", || async { Ok::<_, SyncError>(()) }).await
//! }
//! ```

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tracing::debug;

use crate::error::{SyncError, SyncResult};

/// Policy for storage record operations.
pub fn storage_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_millis(500))
        .with_max_times(3)
        .with_jitter()
}

/// Policy for backend application API calls.
///
/// Longer delays than storage: a create that is rejected because the backend
/// is reconciling usually succeeds a second or two later.
pub fn api_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(3)
        .with_jitter()
}

/// Run `operation` with the storage policy, retrying transient errors.
pub async fn with_storage_policy<F, Fut, T>(operation_name: &str, operation: F) -> SyncResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = SyncResult<T>>,
{
    with_policy(operation_name, storage_policy(), operation).await
}

/// Run `operation` with the API policy, retrying transient errors.
pub async fn with_api_policy<F, Fut, T>(operation_name: &str, operation: F) -> SyncResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = SyncResult<T>>,
{
    with_policy(operation_name, api_policy(), operation).await
}

async fn with_policy<F, Fut, T>(
    operation_name: &str,
    policy: ExponentialBuilder,
    operation: F,
) -> SyncResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = SyncResult<T>>,
{
    operation
        .retry(policy)
        .when(SyncError::is_transient)
        .notify(|e: &SyncError, delay: Duration| {
            debug!(
                operation = operation_name,
                error = %e,
                delay_ms = delay.as_millis() as u64,
                "Retrying collaborator call"
            );
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_transient_error_is_retried() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result = with_storage_policy("test", || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(SyncError::Storage("unavailable".into()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result: SyncResult<()> = with_api_policy("test", || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(SyncError::UnknownClusterType("mesos".into()))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result: SyncResult<()> = with_storage_policy("test", || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(SyncError::Storage("down".into()))
            }
        })
        .await;

        assert!(result.is_err());
        // One initial attempt plus three retries.
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }
}
