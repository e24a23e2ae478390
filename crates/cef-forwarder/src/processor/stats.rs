// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::{PoisonError, RwLock};

/// Point-in-time copy of the process-wide counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub events_forwarded: u64,
    pub page_fetches: u64,
    pub failed_fetches: u64,
    pub failed_cycles: u64,
}

/// Counters shared across cycles. Written by the cycle, readable from anywhere.
#[derive(Debug, Default)]
pub struct Stats {
    inner: RwLock<StatsSnapshot>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_events_forwarded(&self, count: u64) {
        self.update(|s| s.events_forwarded += count);
    }

    pub fn increment_page_fetches(&self) {
        self.update(|s| s.page_fetches += 1);
    }

    pub fn increment_failed_fetches(&self) {
        self.update(|s| s.failed_fetches += 1);
    }

    pub fn increment_failed_cycles(&self) {
        self.update(|s| s.failed_cycles += 1);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        *self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, f: impl FnOnce(&mut StatsSnapshot)) {
        // A panicked writer cannot leave a counter half-updated.
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_counters_accumulate() {
        let stats = Stats::new();
        stats.add_events_forwarded(3);
        stats.add_events_forwarded(4);
        stats.increment_page_fetches();
        stats.increment_failed_fetches();
        stats.increment_failed_cycles();

        assert_eq!(
            stats.snapshot(),
            StatsSnapshot {
                events_forwarded: 7,
                page_fetches: 1,
                failed_fetches: 1,
                failed_cycles: 1,
            }
        );
    }

    #[test]
    fn test_concurrent_readers_see_writes() {
        let stats = Arc::new(Stats::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let stats = Arc::clone(&stats);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        stats.add_events_forwarded(1);
                        let _ = stats.snapshot();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread");
        }
        assert_eq!(stats.snapshot().events_forwarded, 400);
    }
}
