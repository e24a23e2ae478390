// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! One polling cycle: fetch pages, forward events, advance the marker.

mod cycle;
mod stats;

pub use cycle::{CycleError, CycleSummary, Processor, ProcessorConfig, PAGE_PAUSE};
pub use stats::{Stats, StatsSnapshot};
