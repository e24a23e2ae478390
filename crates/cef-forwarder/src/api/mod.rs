// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Events feed client.
//!
//! [`Client`] issues one GraphQL `eventsFeed` request per page. [`fetch_with_retry`]
//! repeats a page request with a fixed delay between attempts.

mod client;
mod retry;
pub mod types;

pub use client::{
    Client, ClientConfig, FetchError, FetchErrorKind, EVENTS_FEED_QUERY, PROBE_QUERY,
};
pub use retry::fetch_with_retry;
pub use types::EventPage;

use async_trait::async_trait;

/// A source of event pages addressed by marker.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Fetches the page following `marker`. An empty marker starts from the
    /// beginning of the feed.
    async fn fetch_page(&self, marker: &str) -> Result<EventPage, FetchError>;
}
