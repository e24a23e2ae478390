// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::Stats;
use crate::api::{fetch_with_retry, EventSource, FetchError};
use crate::cef::{Fields, Formatter};
use crate::config::Config;
use crate::marker::MarkerStore;
use crate::syslog::{format_message, truncate, DeliveryError, EventSink, HostnameStrategy};
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pause between two page fetches of the same cycle.
pub const PAGE_PAUSE: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("failed to fetch events page {page}: {source}")]
    Fetch {
        page: u32,
        #[source]
        source: FetchError,
    },

    #[error("failed to forward events of page {page} after {forwarded} events: {source}")]
    Delivery {
        page: u32,
        forwarded: usize,
        #[source]
        source: DeliveryError,
    },

    #[error("cycle cancelled after {pages} pages")]
    Cancelled { pages: u32 },
}

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub max_pages: u32,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    pub max_message_size: usize,
    pub page_pause: Duration,
}

impl ProcessorConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_pages: config.processing.max_pagination_requests,
            retry_attempts: config.processing.retry_attempts,
            retry_delay: config.retry_delay(),
            max_message_size: config.syslog.max_message_size,
            page_pause: PAGE_PAUSE,
        }
    }
}

/// What one cycle achieved, including cycles that stopped early.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleSummary {
    pub pages: u32,
    pub events_forwarded: usize,
    pub marker_updates: u32,
    pub marker_errors: u32,
    pub duration: Duration,
}

impl CycleSummary {
    pub fn events_per_second(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if self.events_forwarded == 0 || secs <= 0.0 {
            return 0.0;
        }
        self.events_forwarded as f64 / secs
    }
}

/// Drives fetch, forward and marker advancement for one cycle at a time.
pub struct Processor<S, K> {
    source: S,
    sink: K,
    marker: MarkerStore,
    formatter: Formatter,
    hostname: HostnameStrategy,
    config: ProcessorConfig,
    stats: Arc<Stats>,
}

impl<S, K> Processor<S, K>
where
    S: EventSource,
    K: EventSink,
{
    pub fn new(
        source: S,
        sink: K,
        marker: MarkerStore,
        formatter: Formatter,
        hostname: HostnameStrategy,
        config: ProcessorConfig,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            source,
            sink,
            marker,
            formatter,
            hostname,
            config,
            stats,
        }
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    pub fn marker(&self) -> &str {
        self.marker.get()
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    /// Releases the collector connection.
    pub async fn close(&mut self) {
        self.sink.close().await;
    }

    /// Runs one cycle, turning errors and panics into a plain outcome.
    ///
    /// Returns `false` only for cycles that should back off. Cancellation is not
    /// one of them.
    pub async fn process_with_recovery(&mut self, cancel: &CancellationToken) -> bool {
        match AssertUnwindSafe(self.run_cycle(cancel)).catch_unwind().await {
            Ok(Ok(_)) => true,
            Ok(Err(CycleError::Cancelled { pages })) => {
                info!(pages, "event processing cancelled");
                true
            }
            Ok(Err(e)) => {
                error!(error = %e, "event processing failed");
                self.stats.increment_failed_cycles();
                false
            }
            Err(panic) => {
                error!(panic = panic_message(&*panic), "panic recovered in event processing");
                self.stats.increment_failed_cycles();
                false
            }
        }
    }

    /// Fetches and forwards pages until the feed is drained, the page ceiling is
    /// hit, or a step fails. A summary is logged in every case.
    pub async fn run_cycle(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<CycleSummary, CycleError> {
        let start = Instant::now();
        let mut summary = CycleSummary::default();
        debug!(has_marker = !self.marker.get().is_empty(), "starting event processing cycle");

        let result = self.paginate(cancel, &mut summary).await;

        summary.duration = start.elapsed();
        info!(
            duration_ms = summary.duration.as_millis() as u64,
            events_processed = summary.events_forwarded,
            total_events = self.stats.snapshot().events_forwarded,
            events_per_second = format!("{:.2}", summary.events_per_second()),
            pages = summary.pages,
            marker_updates = summary.marker_updates,
            marker_errors = summary.marker_errors,
            success = result.is_ok(),
            "processing cycle complete"
        );
        result.map(|()| summary)
    }

    async fn paginate(
        &mut self,
        cancel: &CancellationToken,
        summary: &mut CycleSummary,
    ) -> Result<(), CycleError> {
        // Moves with every page even when the store could not persist it, so the
        // same page is not fetched twice within a cycle.
        let mut cursor = self.marker.get().to_string();

        while summary.pages < self.config.max_pages {
            if cancel.is_cancelled() {
                return Err(CycleError::Cancelled {
                    pages: summary.pages,
                });
            }

            let page_number = summary.pages + 1;
            self.stats.increment_page_fetches();
            let page = match fetch_with_retry(
                &self.source,
                &cursor,
                self.config.retry_attempts,
                self.config.retry_delay,
            )
            .await
            {
                Ok(page) => page,
                Err(source) => {
                    self.stats.increment_failed_fetches();
                    error!(page = page_number, error = %source, "failed to fetch events page");
                    return Err(CycleError::Fetch {
                        page: page_number,
                        source,
                    });
                }
            };
            summary.pages = page_number;
            debug!(
                page = page_number,
                event_count = page.events.len(),
                has_more = page.has_more,
                "fetched events page"
            );

            if !page.events.is_empty() {
                let (forwarded, result) = self.forward(&page.events).await;
                summary.events_forwarded += forwarded;
                self.stats.add_events_forwarded(forwarded as u64);
                if let Err(source) = result {
                    error!(page = page_number, forwarded, error = %source, "failed to forward events");
                    return Err(CycleError::Delivery {
                        page: page_number,
                        forwarded,
                        source,
                    });
                }
            }

            if !page.new_marker.is_empty() && page.new_marker != cursor {
                cursor = page.new_marker;
                match self.marker.update(&cursor) {
                    Ok(_) => {
                        summary.marker_updates += 1;
                        debug!(page = page_number, "marker updated");
                    }
                    Err(e) => {
                        summary.marker_errors += 1;
                        error!(error = %e, "failed to save marker");
                    }
                }
            }

            if !page.has_more {
                debug!("no more events available");
                break;
            }
            if summary.pages < self.config.max_pages {
                tokio::time::sleep(self.config.page_pause).await;
            }
        }

        if summary.pages >= self.config.max_pages {
            info!(max_pages = self.config.max_pages, "pagination limit reached for this cycle");
        }
        Ok(())
    }

    /// Sends events in order. Stops at the first event that could not be
    /// delivered after one reconnect, returning how many went out before it.
    async fn forward(&mut self, events: &[Fields]) -> (usize, Result<(), DeliveryError>) {
        let mut forwarded = 0;

        for fields in events {
            let message = self.formatter.format(fields);
            let line = format_message(self.hostname.hostname_for(fields), &message);
            let line = if line.len() > self.config.max_message_size {
                debug!(
                    original_size = line.len(),
                    max_size = self.config.max_message_size,
                    "truncating oversized message"
                );
                truncate(&line, self.config.max_message_size)
            } else {
                &line
            };

            if let Err(e) = self.sink.write(line).await {
                warn!(error = %e, "syslog write failed, attempting reconnect");
                if let Err(e) = self.sink.reconnect().await {
                    return (forwarded, Err(e));
                }
                if let Err(e) = self.sink.write(line).await {
                    return (forwarded, Err(e));
                }
            }
            forwarded += 1;
        }

        debug!(count = forwarded, "forwarded events batch");
        (forwarded, Ok(()))
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::EventPage;
    use async_trait::async_trait;
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tracing_test::traced_test;

    fn event(pairs: &[(&str, &str)]) -> Fields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    /// Always has more: one event per page and a fresh marker every call.
    struct EndlessSource {
        calls: AtomicU32,
    }

    #[async_trait]
    impl EventSource for EndlessSource {
        async fn fetch_page(&self, _marker: &str) -> Result<EventPage, FetchError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(EventPage::new(
                vec![event(&[("event_type", "Traffic"), ("seq", n.to_string().as_str())])],
                format!("m-{n}"),
            ))
        }
    }

    /// Serves a fixed list of responses, then empty pages.
    struct ScriptedSource {
        pages: Mutex<VecDeque<Result<EventPage, FetchError>>>,
        seen_markers: Mutex<Vec<String>>,
    }

    impl ScriptedSource {
        fn new(pages: Vec<Result<EventPage, FetchError>>) -> Self {
            Self {
                pages: Mutex::new(pages.into()),
                seen_markers: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl EventSource for ScriptedSource {
        async fn fetch_page(&self, marker: &str) -> Result<EventPage, FetchError> {
            self.seen_markers.lock().expect("lock").push(marker.to_string());
            self.pages
                .lock()
                .expect("lock")
                .pop_front()
                .unwrap_or_else(|| Ok(EventPage::new(Vec::new(), String::new())))
        }
    }

    struct PanickingSource;

    #[async_trait]
    impl EventSource for PanickingSource {
        async fn fetch_page(&self, _marker: &str) -> Result<EventPage, FetchError> {
            panic!("malformed record");
        }
    }

    /// Records lines. Writes numbered in `failing_writes` fail.
    #[derive(Default)]
    struct RecordingSink {
        lines: Vec<String>,
        write_calls: usize,
        failing_writes: Vec<usize>,
        reconnect_fails: bool,
        reconnects: u32,
        closed: bool,
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn write(&mut self, message: &str) -> Result<(), DeliveryError> {
            self.write_calls += 1;
            if self.failing_writes.contains(&self.write_calls) {
                return Err(DeliveryError::NotConnected);
            }
            self.lines.push(message.to_string());
            Ok(())
        }

        async fn reconnect(&mut self) -> Result<(), DeliveryError> {
            self.reconnects += 1;
            if self.reconnect_fails {
                return Err(DeliveryError::RateLimited {
                    retry_in: Duration::from_secs(5),
                });
            }
            Ok(())
        }

        async fn close(&mut self) {
            self.closed = true;
        }
    }

    fn processor<S: EventSource>(
        source: S,
        sink: RecordingSink,
        marker: MarkerStore,
        max_pages: u32,
    ) -> Processor<S, RecordingSink> {
        let formatter = Formatter::new(
            "Cato Networks",
            "SASE Platform",
            "1.0",
            BTreeMap::from([("src_ip".to_string(), "src".to_string())]),
            vec!["src".to_string()],
        );
        Processor::new(
            source,
            sink,
            marker,
            formatter,
            HostnameStrategy::Fixed("forwarder-host".to_string()),
            ProcessorConfig {
                max_pages,
                retry_attempts: 2,
                retry_delay: Duration::from_secs(1),
                max_message_size: 8192,
                page_pause: PAGE_PAUSE,
            },
            Arc::new(Stats::new()),
        )
    }

    fn temp_marker() -> (tempfile::TempDir, MarkerStore) {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = MarkerStore::open(dir.path().join("marker.txt")).expect("open");
        (dir, store)
    }

    #[tokio::test(start_paused = true)]
    async fn test_pagination_stops_at_ceiling() {
        let (_dir, marker) = temp_marker();
        let source = EndlessSource {
            calls: AtomicU32::new(0),
        };
        let mut processor = processor(source, RecordingSink::default(), marker, 10);

        let summary = processor
            .run_cycle(&CancellationToken::new())
            .await
            .expect("cycle");

        assert_eq!(summary.pages, 10);
        assert_eq!(summary.events_forwarded, 10);
        assert_eq!(processor.source.calls.load(Ordering::SeqCst), 10);
        assert_eq!(processor.marker(), "m-10");
        assert_eq!(processor.stats().snapshot().page_fetches, 10);
        assert_eq!(processor.sink().lines.len(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forwards_formatted_lines_and_advances_cursor() {
        let (dir, marker) = temp_marker();
        let source = ScriptedSource::new(vec![
            Ok(EventPage::new(
                vec![event(&[
                    ("event_type", "Threat"),
                    ("event_sub_type", "Login"),
                    ("src_ip", "1.2.3.4"),
                ])],
                "m-1".to_string(),
            )),
            Ok(EventPage::new(
                vec![event(&[("event_type", "Info")])],
                "m-2".to_string(),
            )),
        ]);
        let mut processor = processor(source, RecordingSink::default(), marker, 10);

        let summary = processor
            .run_cycle(&CancellationToken::new())
            .await
            .expect("cycle");

        // The third fetch returns an empty page, which ends pagination.
        assert_eq!(summary.pages, 3);
        assert_eq!(summary.events_forwarded, 2);
        assert_eq!(summary.marker_updates, 2);
        assert_eq!(
            *processor.source.seen_markers.lock().expect("lock"),
            vec!["", "m-1", "m-2"]
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("marker.txt")).expect("read"),
            "m-2"
        );

        let first = &processor.sink().lines[0];
        assert!(first.starts_with("<134>"), "{first}");
        assert!(
            first.contains(" forwarder-host CEF:0|Cato Networks|SASE Platform|1.0|Threat|Threat - Login|10|src=1.2.3.4"),
            "{first}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_failure_keeps_partial_count_and_marker() {
        let (_dir, mut marker) = temp_marker();
        marker.update("m-0").expect("seed marker");
        let events = (0..3)
            .map(|i| event(&[("seq", i.to_string().as_str())]))
            .collect();
        let source = ScriptedSource::new(vec![Ok(EventPage::new(events, "m-1".to_string()))]);
        let sink = RecordingSink {
            failing_writes: vec![3],
            reconnect_fails: true,
            ..Default::default()
        };
        let mut processor = processor(source, sink, marker, 10);

        let err = processor
            .run_cycle(&CancellationToken::new())
            .await
            .expect_err("delivery fails");

        match err {
            CycleError::Delivery {
                page, forwarded, ..
            } => {
                assert_eq!(page, 1);
                assert_eq!(forwarded, 2);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(processor.stats().snapshot().events_forwarded, 2);
        assert_eq!(processor.marker(), "m-0");
        assert_eq!(processor.sink().reconnects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_retried_once_after_reconnect() {
        let (_dir, marker) = temp_marker();
        let source = ScriptedSource::new(vec![Ok(EventPage::new(
            vec![event(&[("a", "1")]), event(&[("a", "2")])],
            "m-1".to_string(),
        ))]);
        let sink = RecordingSink {
            failing_writes: vec![1],
            ..Default::default()
        };
        let mut processor = processor(source, sink, marker, 10);

        let summary = processor
            .run_cycle(&CancellationToken::new())
            .await
            .expect("cycle");

        assert_eq!(summary.events_forwarded, 2);
        assert_eq!(processor.sink().reconnects, 1);
        assert_eq!(processor.sink().write_calls, 3);
        assert_eq!(processor.marker(), "m-1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_reconnect_failure_aborts() {
        let (_dir, marker) = temp_marker();
        let source = ScriptedSource::new(vec![Ok(EventPage::new(
            vec![event(&[("a", "1")])],
            "m-1".to_string(),
        ))]);
        let sink = RecordingSink {
            failing_writes: vec![1, 2],
            ..Default::default()
        };
        let mut processor = processor(source, sink, marker, 10);

        assert!(!processor.process_with_recovery(&CancellationToken::new()).await);
        assert_eq!(processor.sink().write_calls, 2);
        assert_eq!(processor.marker(), "");
        assert_eq!(processor.stats().snapshot().failed_cycles, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_marker_persist_failure_keeps_durable_value() {
        let dir = tempfile::tempdir().expect("temp dir");
        let state = dir.path().join("state");
        let path = state.join("marker.txt");
        let mut marker = MarkerStore::open(&path).expect("open");
        marker.update("durable").expect("seed marker");
        std::fs::remove_dir_all(&state).expect("remove dir");
        std::fs::write(&state, "blocks the marker directory").expect("write blocker");

        let source = ScriptedSource::new(vec![
            Ok(EventPage::new(vec![event(&[("a", "1")])], "m-1".to_string())),
            Ok(EventPage::new(vec![event(&[("a", "2")])], "m-2".to_string())),
        ]);
        let mut processor = processor(source, RecordingSink::default(), marker, 10);

        let summary = processor
            .run_cycle(&CancellationToken::new())
            .await
            .expect("persist failures do not fail the cycle");

        assert_eq!(summary.events_forwarded, 2);
        assert_eq!(summary.marker_errors, 2);
        assert_eq!(processor.marker(), "durable");
        // The in-cycle cursor still moved on.
        assert_eq!(
            *processor.source.seen_markers.lock().expect("lock"),
            vec!["durable", "m-1", "m-2"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_failure_fails_cycle() {
        let (_dir, marker) = temp_marker();
        let source = ScriptedSource::new(vec![
            Err(FetchError::Unauthorized),
            Err(FetchError::Unauthorized),
        ]);
        let mut processor = processor(source, RecordingSink::default(), marker, 10);

        assert!(!processor.process_with_recovery(&CancellationToken::new()).await);
        let stats = processor.stats().snapshot();
        assert_eq!(stats.page_fetches, 1);
        assert_eq!(stats.failed_fetches, 1);
        assert_eq!(stats.failed_cycles, 1);
        assert!(processor.sink().lines.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_is_not_a_failure() {
        let (_dir, marker) = temp_marker();
        let source = EndlessSource {
            calls: AtomicU32::new(0),
        };
        let mut processor = processor(source, RecordingSink::default(), marker, 10);
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(matches!(
            processor.run_cycle(&cancel).await,
            Err(CycleError::Cancelled { pages: 0 })
        ));
        assert!(processor.process_with_recovery(&cancel).await);
        assert_eq!(processor.source.calls.load(Ordering::SeqCst), 0);
        assert_eq!(processor.stats().snapshot().failed_cycles, 0);
    }

    /// Endless pages; fires `cancel` while serving page `cancel_on`.
    struct CancellingSource {
        inner: EndlessSource,
        cancel_on: u32,
        cancel: CancellationToken,
    }

    #[async_trait]
    impl EventSource for CancellingSource {
        async fn fetch_page(&self, marker: &str) -> Result<EventPage, FetchError> {
            let page = self.inner.fetch_page(marker).await;
            if self.inner.calls.load(Ordering::SeqCst) == self.cancel_on {
                self.cancel.cancel();
            }
            page
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_mid_cycle_keeps_progress() {
        let (_dir, marker) = temp_marker();
        let cancel = CancellationToken::new();
        let source = CancellingSource {
            inner: EndlessSource {
                calls: AtomicU32::new(0),
            },
            cancel_on: 2,
            cancel: cancel.clone(),
        };
        let mut processor = processor(source, RecordingSink::default(), marker, 10);

        assert!(processor.process_with_recovery(&cancel).await);

        // The page in flight completes; the next one is never requested.
        assert_eq!(processor.source.inner.calls.load(Ordering::SeqCst), 2);
        assert_eq!(processor.sink().lines.len(), 2);
        assert_eq!(processor.marker(), "m-2");
        let stats = processor.stats().snapshot();
        assert_eq!(stats.events_forwarded, 2);
        assert_eq!(stats.page_fetches, 2);
        assert_eq!(stats.failed_cycles, 0);
    }

    #[tokio::test]
    async fn test_panic_is_recovered() {
        let (_dir, marker) = temp_marker();
        let mut processor = processor(PanickingSource, RecordingSink::default(), marker, 10);

        assert!(!processor.process_with_recovery(&CancellationToken::new()).await);
        assert_eq!(processor.stats().snapshot().failed_cycles, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_lines_are_truncated() {
        let (_dir, marker) = temp_marker();
        let source = ScriptedSource::new(vec![Ok(EventPage::new(
            vec![event(&[("payload", "é".repeat(200).as_str())])],
            String::new(),
        ))]);
        let mut processor = processor(source, RecordingSink::default(), marker, 10);
        processor.config.max_message_size = 101;

        processor
            .run_cycle(&CancellationToken::new())
            .await
            .expect("cycle");

        let line = &processor.sink().lines[0];
        assert!(line.len() <= 101);
        assert!(line.starts_with("<134>"));
    }

    #[tokio::test]
    async fn test_close_releases_sink() {
        let (_dir, marker) = temp_marker();
        let mut processor = processor(
            ScriptedSource::new(Vec::new()),
            RecordingSink::default(),
            marker,
            10,
        );
        processor.close().await;
        assert!(processor.sink().closed);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_cycle_summary_is_logged_on_abort() {
        let (_dir, marker) = temp_marker();
        let source = ScriptedSource::new(vec![Err(FetchError::RateLimited), Err(FetchError::RateLimited)]);
        let mut processor = processor(source, RecordingSink::default(), marker, 10);

        assert!(processor.run_cycle(&CancellationToken::new()).await.is_err());
        assert!(logs_contain("failed to fetch events page"));
        assert!(logs_contain("processing cycle complete"));
    }

    #[test]
    fn test_events_per_second() {
        let summary = CycleSummary {
            events_forwarded: 50,
            duration: Duration::from_secs(2),
            ..Default::default()
        };
        assert!((summary.events_per_second() - 25.0).abs() < f64::EPSILON);
        assert_eq!(CycleSummary::default().events_per_second(), 0.0);
    }
}
