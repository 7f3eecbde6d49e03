//! Retry logic with exponential backoff for remote cache requests

use crate::config::RetryConfig;
use crate::error::{Error, Result};
use crate::run_state::RunState;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder, backoff::Backoff};
use cachet_events::redact;
use std::error::Error as StdError;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry a remote request with exponential backoff.
///
/// Every failed attempt counts against the run's failure budget. Once the
/// budget is spent no further attempt is made, including the first one.
/// Cancelling the run aborts both an in-flight attempt and a pending backoff.
pub async fn retry_with_backoff<F, Fut, T>(
    config: &RetryConfig,
    run_state: &RunState,
    operation_name: &str,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut backoff = create_backoff(config);
    let cancel = run_state.cancellation_token();
    let mut retries = 0;

    loop {
        run_state.check()?;

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::Cancelled),
            outcome = f() => outcome,
        };

        let err = match outcome {
            Ok(result) => {
                if retries > 0 {
                    debug!(
                        operation = operation_name,
                        retries, "Remote request succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(err) => err,
        };

        let failures = run_state.record_failure();

        if !is_retryable(&err) {
            debug!(
                operation = operation_name,
                error = %redact(&err.to_string()),
                "Error is not retryable, failing immediately"
            );
            return Err(err);
        }
        if retries >= config.max_retries || run_state.is_tripped() {
            warn!(
                operation = operation_name,
                retries,
                failures,
                error = %redact(&err.to_string()),
                "Remote request failed after retries"
            );
            return Err(err);
        }
        let Some(delay) = backoff.next_backoff() else {
            return Err(err);
        };

        retries += 1;
        warn!(
            operation = operation_name,
            attempt = retries,
            failures,
            error = %redact(&err.to_string()),
            retry_in_ms = delay.as_millis(),
            "Remote request failed, retrying"
        );
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::Cancelled),
            () = tokio::time::sleep(delay) => {}
        }
    }
}

/// Create exponential backoff from config
fn create_backoff(config: &RetryConfig) -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(config.min_backoff_ms))
        .with_max_interval(Duration::from_millis(config.max_backoff_ms))
        .with_multiplier(config.multiplier)
        .with_randomization_factor(0.0)
        .with_max_elapsed_time(None) // max_retries bounds the attempts
        .build()
}

/// Determine if an error is retryable
///
/// 429 and 5xx (except 501) are transient; transport errors are retried
/// unless the server's certificate was rejected.
pub(crate) fn is_retryable(err: &Error) -> bool {
    match err {
        Error::UnexpectedStatus { status, .. } => {
            *status == 429 || ((500..600).contains(status) && *status != 501)
        }
        Error::Http { source } => !source.is_builder() && !is_certificate_error(source),
        _ => false,
    }
}

fn is_certificate_error(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(err) = current {
        if let Some(tls) = err.downcast_ref::<rustls::Error>()
            && matches!(
                tls,
                rustls::Error::InvalidCertificate(_) | rustls::Error::NoCertificatesPresented
            )
        {
            return true;
        }
        if let Some(io) = err.downcast_ref::<std::io::Error>()
            && let Some(inner) = io.get_ref()
            && is_certificate_error(inner)
        {
            return true;
        }
        current = err.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            min_backoff_ms: 10,
            max_backoff_ms: 100,
            multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn test_retry_success_first_attempt() {
        let state = RunState::new(3);
        let call_count = Arc::new(AtomicUsize::new(0));
        let call_count_clone = call_count.clone();

        let result = retry_with_backoff(&fast_config(2), &state, "test", move || {
            let cc = call_count_clone.clone();
            async move {
                cc.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Error>(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
        assert_eq!(state.failures(), 0);
    }

    #[tokio::test]
    async fn test_retry_success_after_failure() {
        let state = RunState::new(10);
        let call_count = Arc::new(AtomicUsize::new(0));
        let call_count_clone = call_count.clone();

        let result = retry_with_backoff(&fast_config(2), &state, "test", move || {
            let cc = call_count_clone.clone();
            async move {
                let count = cc.fetch_add(1, Ordering::SeqCst) + 1;
                if count < 3 {
                    Err(Error::unexpected_status(503, "fetch"))
                } else {
                    Ok::<_, Error>(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(call_count.load(Ordering::SeqCst), 3);
        assert_eq!(state.failures(), 2);
    }

    #[tokio::test]
    async fn test_retry_exhausted() {
        let state = RunState::new(10);
        let call_count = Arc::new(AtomicUsize::new(0));
        let call_count_clone = call_count.clone();

        let result = retry_with_backoff(&fast_config(1), &state, "test", move || {
            let cc = call_count_clone.clone();
            async move {
                cc.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>(Error::unexpected_status(500, "fetch"))
            }
        })
        .await;

        assert!(matches!(
            result.unwrap_err(),
            Error::UnexpectedStatus { status: 500, .. }
        ));
        assert_eq!(call_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_error() {
        let state = RunState::new(10);
        let call_count = Arc::new(AtomicUsize::new(0));
        let call_count_clone = call_count.clone();

        let result = retry_with_backoff(&fast_config(2), &state, "test", move || {
            let cc = call_count_clone.clone();
            async move {
                cc.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>(Error::unexpected_status(403, "fetch"))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(call_count.load(Ordering::SeqCst), 1); // Should not retry
        assert_eq!(state.failures(), 1);
    }

    #[tokio::test]
    async fn test_tripped_breaker_makes_no_attempt() {
        let state = RunState::new(1);
        state.record_failure();
        let call_count = Arc::new(AtomicUsize::new(0));
        let call_count_clone = call_count.clone();

        let result = retry_with_backoff(&fast_config(2), &state, "test", move || {
            let cc = call_count_clone.clone();
            async move {
                cc.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Error>(1)
            }
        })
        .await;

        assert!(result.unwrap_err().is_too_many_failures());
        assert_eq!(call_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_breaker_stops_retries_mid_request() {
        let state = RunState::new(2);
        let call_count = Arc::new(AtomicUsize::new(0));
        let call_count_clone = call_count.clone();

        let result = retry_with_backoff(&fast_config(5), &state, "test", move || {
            let cc = call_count_clone.clone();
            async move {
                cc.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>(Error::unexpected_status(502, "put"))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(call_count.load(Ordering::SeqCst), 2);
        assert!(state.is_tripped());
    }

    #[tokio::test]
    async fn test_cancellation_aborts_backoff() {
        let state = Arc::new(RunState::new(10));
        let config = RetryConfig {
            max_retries: 2,
            min_backoff_ms: 60_000,
            max_backoff_ms: 60_000,
            multiplier: 1.0,
        };
        let canceller = Arc::clone(&state);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let result = retry_with_backoff(&config, &state, "test", || async {
            Err::<i32, _>(Error::unexpected_status(503, "fetch"))
        })
        .await;

        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(state.failures(), 1);
    }

    #[test]
    fn test_status_classification() {
        for status in [429, 500, 502, 503, 504] {
            assert!(is_retryable(&Error::unexpected_status(status, "fetch")));
        }
        for status in [400, 401, 403, 404, 501] {
            assert!(!is_retryable(&Error::unexpected_status(status, "fetch")));
        }
        assert!(!is_retryable(&Error::Cancelled));
    }

    #[test]
    fn test_certificate_error_detected_through_io_wrapper() {
        let tls = rustls::Error::InvalidCertificate(rustls::CertificateError::UnknownIssuer);
        let io = std::io::Error::other(tls);
        assert!(is_certificate_error(&io));

        let plain = std::io::Error::other("connection reset");
        assert!(!is_certificate_error(&plain));
    }
}
