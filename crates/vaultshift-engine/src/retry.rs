//! Transient-error retry around guarded remote calls

use crate::credentials::CredentialCoordinator;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use vaultshift_types::{Error, Result, RetryConfig};

/// Call the service through the credential guard, retrying transient errors
///
/// Authentication errors are absorbed by the guard and never count as an
/// attempt. Permanent errors return immediately. After `policy.max_attempts`
/// transient failures the last error is returned.
pub async fn call_with_retry<T, F, Fut>(
    credentials: &CredentialCoordinator,
    policy: &RetryConfig,
    cancel: &CancellationToken,
    operation: &str,
    mut call: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match credentials.guard(operation, &mut call).await {
            Err(err) if err.should_retry() && policy.allows_another(attempt) => {
                let delay = policy.delay_after(attempt);
                debug!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying after delay"
                );
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = cancel.cancelled() => return Err(Error::Cancelled),
                }
            }
            result => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::CredentialSettings;
    use crate::simulator::SimulatedBackupService;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn setup() -> (CredentialCoordinator, CancellationToken) {
        let service = Arc::new(SimulatedBackupService::new(Vec::new()));
        let cancel = CancellationToken::new();
        let credentials = CredentialCoordinator::new(
            service.clone(),
            service,
            CredentialSettings::default(),
            cancel.clone(),
        );
        (credentials, cancel)
    }

    fn policy(max_attempts: u32) -> RetryConfig {
        RetryConfig::new(
            max_attempts,
            Duration::from_millis(1),
            Duration::from_millis(5),
            2.0,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let (credentials, cancel) = setup();
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let value = call_with_retry(&credentials, &policy(3), &cancel, "start", || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::transient("throttled"))
            } else {
                Ok("job-1")
            }
        })
        .await
        .unwrap();

        assert_eq!(value, "job-1");
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_error() {
        let (credentials, cancel) = setup();
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let err = call_with_retry(&credentials, &policy(3), &cancel, "start", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Error::transient("throttled"))
        })
        .await
        .unwrap_err();

        assert!(err.should_retry());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let (credentials, cancel) = setup();
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let err = call_with_retry(&credentials, &policy(3), &cancel, "start", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Error::permanent("invalid vault"))
        })
        .await
        .unwrap_err();

        assert!(!err.is_recoverable());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let (credentials, cancel) = setup();
        let slow = RetryConfig::new(5, Duration::from_secs(30), Duration::from_secs(60), 2.0)
            .unwrap();
        cancel.cancel();

        let err = call_with_retry(&credentials, &slow, &cancel, "start", || async {
            Err::<(), _>(Error::transient("throttled"))
        })
        .await
        .unwrap_err();

        assert_eq!(err, Error::Cancelled);
    }
}
