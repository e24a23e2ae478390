// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Timer loop around the cycle processor.
//!
//! The first cycle runs immediately. After a successful cycle the next one is
//! due after the fetch interval; after a failed one it is due after the current
//! backoff delay, which then doubles up to its ceiling.

use crate::api::EventSource;
use crate::processor::Processor;
use crate::syslog::EventSink;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Delay after the first failed cycle.
pub const BASE_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    pub base: Duration,
    pub max: Duration,
}

impl BackoffConfig {
    /// Ceilings below `base` are raised to `base`.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }
}

/// Delay applied between failed cycles.
#[derive(Debug)]
pub struct BackoffState {
    config: BackoffConfig,
    current: Duration,
}

impl BackoffState {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            current: config.base,
        }
    }

    /// Delay the next failure will be given.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Returns the delay to wait now and doubles it for the next failure.
    pub fn register_failure(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.config.max);
        delay
    }

    /// Back to base. Returns true if the delay had grown.
    pub fn register_success(&mut self) -> bool {
        let recovered = self.current > self.config.base;
        self.current = self.config.base;
        recovered
    }
}

/// One unit of scheduled work.
#[async_trait]
pub trait CycleRunner: Send {
    /// Runs one cycle; `false` means back off.
    async fn run_cycle(&mut self, cancel: &CancellationToken) -> bool;

    /// Called once after the loop stops.
    async fn shutdown(&mut self);
}

#[async_trait]
impl<S, K> CycleRunner for Processor<S, K>
where
    S: EventSource,
    K: EventSink,
{
    async fn run_cycle(&mut self, cancel: &CancellationToken) -> bool {
        self.process_with_recovery(cancel).await
    }

    async fn shutdown(&mut self) {
        self.close().await;
        let stats = self.stats().snapshot();
        info!(
            total_events_forwarded = stats.events_forwarded,
            total_api_requests = stats.page_fetches,
            failed_api_requests = stats.failed_fetches,
            failed_cycles = stats.failed_cycles,
            "final statistics"
        );
    }
}

pub struct Scheduler<R> {
    runner: R,
    interval: Duration,
    backoff: BackoffState,
}

impl<R: CycleRunner> Scheduler<R> {
    pub fn new(runner: R, interval: Duration, backoff: BackoffConfig) -> Self {
        Self {
            runner,
            interval,
            backoff: BackoffState::new(backoff),
        }
    }

    /// Runs cycles until `cancel` fires, then shuts the runner down.
    ///
    /// A cycle in flight is never interrupted; it observes `cancel` on its own.
    /// Messages on `reload` are logged and otherwise ignored.
    pub async fn run(mut self, cancel: CancellationToken, mut reload: mpsc::Receiver<()>) -> R {
        info!(interval = ?self.interval, "starting main processing loop");
        let mut reload_open = true;

        while !cancel.is_cancelled() {
            let success = self.runner.run_cycle(&cancel).await;
            let delay = self.next_delay(success);

            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = &mut sleep => break,
                    msg = reload.recv(), if reload_open => match msg {
                        Some(()) => info!("reload requested, configuration reload is not supported"),
                        None => reload_open = false,
                    },
                }
            }
        }

        info!("initiating graceful shutdown");
        self.runner.shutdown().await;
        self.runner
    }

    fn next_delay(&mut self, success: bool) -> Duration {
        if success {
            if self.backoff.register_success() {
                info!("processing recovered, resetting backoff");
            }
            return self.interval;
        }
        let delay = self.backoff.register_failure();
        warn!(backoff_delay = ?delay, "processing failed, applying backoff");
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tokio::time::Instant;

    #[test]
    fn test_backoff_doubles_and_resets() {
        let mut backoff = BackoffState::new(BackoffConfig::new(
            Duration::from_secs(1),
            Duration::from_secs(300),
        ));
        assert_eq!(backoff.current(), Duration::from_secs(1));

        let mut next = Vec::new();
        for _ in 0..3 {
            backoff.register_failure();
            next.push(backoff.current().as_secs());
        }
        assert_eq!(next, vec![2, 4, 8]);

        assert!(backoff.register_success());
        assert_eq!(backoff.current(), Duration::from_secs(1));
        assert!(!backoff.register_success());
    }

    #[test]
    fn test_backoff_never_exceeds_ceiling() {
        let mut backoff = BackoffState::new(BackoffConfig::new(
            Duration::from_secs(1),
            Duration::from_secs(300),
        ));
        let delays: Vec<u64> = (0..12).map(|_| backoff.register_failure().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 64, 128, 256, 300, 300, 300]);
    }

    #[test]
    fn test_ceiling_below_base_is_raised() {
        let config = BackoffConfig::new(Duration::from_secs(5), Duration::from_secs(1));
        let mut backoff = BackoffState::new(config);
        assert_eq!(backoff.register_failure(), Duration::from_secs(5));
        assert_eq!(backoff.current(), Duration::from_secs(5));
    }

    /// Replays outcomes and records when each cycle started.
    struct ScriptedRunner {
        outcomes: VecDeque<bool>,
        started: Vec<Instant>,
        origin: Instant,
        cancel_when_done: CancellationToken,
        shut_down: bool,
    }

    #[async_trait]
    impl CycleRunner for ScriptedRunner {
        async fn run_cycle(&mut self, _cancel: &CancellationToken) -> bool {
            self.started.push(Instant::now());
            let outcome = self.outcomes.pop_front().unwrap_or(true);
            if self.outcomes.is_empty() {
                self.cancel_when_done.cancel();
            }
            outcome
        }

        async fn shutdown(&mut self) {
            self.shut_down = true;
        }
    }

    impl ScriptedRunner {
        fn offsets(&self) -> Vec<u64> {
            self.started
                .iter()
                .map(|t| t.duration_since(self.origin).as_secs())
                .collect()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_back_off_and_success_restores_interval() {
        let cancel = CancellationToken::new();
        let runner = ScriptedRunner {
            outcomes: VecDeque::from([false, false, false, true, false, true]),
            started: Vec::new(),
            origin: Instant::now(),
            cancel_when_done: cancel.clone(),
            shut_down: false,
        };
        let (_reload_tx, reload_rx) = mpsc::channel(1);
        let scheduler = Scheduler::new(
            runner,
            Duration::from_secs(60),
            BackoffConfig::new(BASE_BACKOFF, Duration::from_secs(300)),
        );

        let runner = scheduler.run(cancel, reload_rx).await;

        // fail +1, fail +2, fail +4, ok +60, fail +1 (reset), ok
        assert_eq!(runner.offsets(), vec![0, 1, 3, 7, 67, 68]);
        assert!(runner.shut_down);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_wait() {
        let cancel = CancellationToken::new();
        let runner = ScriptedRunner {
            outcomes: VecDeque::from([true, true]),
            started: Vec::new(),
            origin: Instant::now(),
            cancel_when_done: CancellationToken::new(),
            shut_down: false,
        };
        let (reload_tx, reload_rx) = mpsc::channel(1);
        let scheduler = Scheduler::new(
            runner,
            Duration::from_secs(60),
            BackoffConfig::new(BASE_BACKOFF, Duration::from_secs(300)),
        );

        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            reload_tx.send(()).await.expect("send reload");
            tokio::time::sleep(Duration::from_secs(5)).await;
            stopper.cancel();
        });

        let start = Instant::now();
        let runner = scheduler.run(cancel, reload_rx).await;

        // The reload did not trigger a cycle; cancellation cut the wait short.
        assert_eq!(runner.offsets(), vec![0]);
        assert_eq!(start.elapsed(), Duration::from_secs(15));
        assert!(runner.shut_down);
    }
}
