// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{EventPage, EventSource, FetchError};
use std::time::Duration;
use tracing::{info, warn};

/// Fetches one page, retrying up to `max_attempts` times with a fixed `delay`.
///
/// The delay does not grow between attempts. Every error class is retried the
/// same way, authentication failures included. After the last attempt the final
/// error is wrapped in [`FetchError::RetriesExhausted`].
pub async fn fetch_with_retry<S>(
    source: &S,
    marker: &str,
    max_attempts: u32,
    delay: Duration,
) -> Result<EventPage, FetchError>
where
    S: EventSource + ?Sized,
{
    let max_attempts = max_attempts.max(1);
    let mut last_error = None;

    for attempt in 0..max_attempts {
        if attempt > 0 {
            info!(
                attempt = attempt + 1,
                max_attempts,
                delay = ?delay,
                "retrying API request"
            );
            tokio::time::sleep(delay).await;
        }

        match source.fetch_page(marker).await {
            Ok(page) => {
                if attempt > 0 {
                    info!(retries = attempt, "API request recovered");
                }
                return Ok(page);
            }
            Err(e) => {
                warn!(attempt = attempt + 1, kind = ?e.kind(), error = %e, "API request failed");
                last_error = Some(e);
            }
        }
    }

    Err(FetchError::RetriesExhausted {
        attempts: max_attempts,
        last: Box::new(last_error.unwrap_or(FetchError::Protocol("no attempt made".into()))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    /// Fails the first `failures` calls, then succeeds.
    struct FlakySource {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl EventSource for FlakySource {
        async fn fetch_page(&self, marker: &str) -> Result<EventPage, FetchError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(FetchError::Server(503));
            }
            Ok(EventPage::new(Vec::new(), format!("{marker}-next")))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_with_fixed_delay() {
        let source = FlakySource {
            failures: 2,
            calls: AtomicU32::new(0),
        };
        let start = Instant::now();

        let page = fetch_with_retry(&source, "m", 3, Duration::from_secs(5))
            .await
            .expect("third attempt succeeds");

        assert_eq!(page.new_marker, "m-next");
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
        // Two fixed pauses, no growth.
        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_attempts_wrap_last_error() {
        let source = FlakySource {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        };

        let err = fetch_with_retry(&source, "", 4, Duration::from_millis(100))
            .await
            .expect_err("never succeeds");

        assert_eq!(source.calls.load(Ordering::SeqCst), 4);
        match err {
            FetchError::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 4);
                assert!(matches!(*last, FetchError::Server(503)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_first_success_makes_single_call() {
        let source = FlakySource {
            failures: 0,
            calls: AtomicU32::new(0),
        };
        fetch_with_retry(&source, "", 3, Duration::from_secs(60))
            .await
            .expect("success");
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }
}
