// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::types::{EventPage, EventsFeedResponse, Request, Variables};
use super::EventSource;
use crate::cef::Fields;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, USER_AGENT};
use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, warn};

/// GraphQL query retrieving one page of the events feed.
pub const EVENTS_FEED_QUERY: &str = "query eventsFeed($accountIDs: [ID!]!, $marker: String) {
  eventsFeed(accountIDs: $accountIDs, marker: $marker) {
    marker
    fetchedCount
    accounts {
      id
      errorString
      records {
        fieldsMap
      }
    }
  }
}";

/// Minimal query used to confirm credentials and account access.
pub const PROBE_QUERY: &str = "query eventsFeed($accountIDs: [ID!]!) {
  eventsFeed(accountIDs: $accountIDs) {
    marker
    fetchedCount
  }
}";

const API_KEY_HEADER: &str = "x-api-key";

/// Failure of a single page request.
///
/// The variants classify the failure for diagnostics. Retrying does not depend
/// on them.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("authentication failed (401) - check the API key")]
    Unauthorized,

    #[error("access forbidden (403) - ensure the events integration is enabled and the key can read the events feed")]
    Forbidden,

    #[error("rate limit exceeded (429) - reduce the polling frequency")]
    RateLimited,

    #[error("server error ({0}) - events API is experiencing issues")]
    Server(u16),

    #[error("API returned status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },

    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("failed to parse JSON response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("GraphQL error: {0}")]
    Protocol(String),

    #[error("invalid client configuration: {0}")]
    InvalidConfig(String),

    #[error("all {attempts} retry attempts failed, last error: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<FetchError>,
    },
}

/// Diagnostic class of a [`FetchError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    Auth,
    Permission,
    RateLimit,
    Server,
    Transport,
    Protocol,
    Unclassified,
}

impl FetchError {
    pub fn kind(&self) -> FetchErrorKind {
        match self {
            Self::Unauthorized => FetchErrorKind::Auth,
            Self::Forbidden => FetchErrorKind::Permission,
            Self::RateLimited => FetchErrorKind::RateLimit,
            Self::Server(_) => FetchErrorKind::Server,
            Self::Transport(_) => FetchErrorKind::Transport,
            Self::Decode(_) | Self::Protocol(_) => FetchErrorKind::Protocol,
            Self::UnexpectedStatus { .. } | Self::InvalidConfig(_) => {
                FetchErrorKind::Unclassified
            }
            Self::RetriesExhausted { last, .. } => last.kind(),
        }
    }
}

/// Maps a non-success status to its error class.
fn classify_status(status: StatusCode, body: String) -> FetchError {
    match status {
        StatusCode::UNAUTHORIZED => FetchError::Unauthorized,
        StatusCode::FORBIDDEN => FetchError::Forbidden,
        StatusCode::TOO_MANY_REQUESTS => FetchError::RateLimited,
        s if s.is_server_error() => FetchError::Server(s.as_u16()),
        s => FetchError::UnexpectedStatus {
            status: s.as_u16(),
            body,
        },
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub url: String,
    pub api_key: String,
    pub account_id: String,
    pub timeout: Duration,
}

impl ClientConfig {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            url: config.api.url.clone(),
            api_key: config.api.api_key.clone(),
            account_id: config.api.account_id.clone(),
            timeout: config.connection_timeout(),
        }
    }
}

/// Events feed client bound to one account.
#[derive(Debug, Clone)]
pub struct Client {
    http: reqwest::Client,
    url: String,
    account_id: String,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            API_KEY_HEADER,
            HeaderValue::from_str(&config.api_key)
                .map_err(|_| FetchError::InvalidConfig("API key is not a valid header".into()))?,
        );

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(user_agent())
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            http,
            url: config.url,
            account_id: config.account_id,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Issues [`PROBE_QUERY`] without a marker and returns the reported count.
    pub async fn probe(&self) -> Result<i64, FetchError> {
        let response = self.post_query(PROBE_QUERY, None).await?;
        let count = response
            .data
            .and_then(|data| data.events_feed)
            .map_or(0, |feed| feed.fetched_count);
        if count < 0 {
            return Err(FetchError::Protocol(format!(
                "unexpected fetchedCount: {count}"
            )));
        }
        Ok(count)
    }

    /// Sends `query` with the account variables and decodes the response.
    pub(crate) async fn post_query(
        &self,
        query: &str,
        marker: Option<&str>,
    ) -> Result<EventsFeedResponse, FetchError> {
        let request = Request {
            query,
            variables: Variables {
                account_ids: [self.account_id.as_str()],
                marker,
            },
        };

        debug!(url = %self.url, has_marker = marker.is_some(), "sending API request");

        let response = self.http.post(&self.url).json(&request).send().await?;
        let status = response.status();
        let body = response.bytes().await?;

        debug!(status = %status, body_size = body.len(), "received API response");

        if !status.is_success() {
            let body = String::from_utf8_lossy(&body).into_owned();
            error!(status = status.as_u16(), body = %body, "API HTTP error");
            return Err(classify_status(status, body));
        }

        let response: EventsFeedResponse = serde_json::from_slice(&body)?;
        if let Some(first) = response.errors.first() {
            error!(error = %first.message, "GraphQL error received");
            return Err(FetchError::Protocol(first.message.clone()));
        }
        Ok(response)
    }
}

#[async_trait]
impl EventSource for Client {
    async fn fetch_page(&self, marker: &str) -> Result<EventPage, FetchError> {
        let marker = (!marker.is_empty()).then_some(marker);
        let response = self.post_query(EVENTS_FEED_QUERY, marker).await?;
        let page = into_page(response);

        debug!(
            event_count = page.events.len(),
            has_more = page.has_more,
            new_marker = !page.new_marker.is_empty(),
            "parsed API response"
        );
        Ok(page)
    }
}

/// Collects the records of every account that did not report an error.
fn into_page(response: EventsFeedResponse) -> EventPage {
    let Some(feed) = response.data.and_then(|data| data.events_feed) else {
        return EventPage::default();
    };

    let mut events: Vec<Fields> = Vec::new();
    for account in feed.accounts {
        if let Some(err) = account.error_string.as_deref().filter(|e| !e.is_empty()) {
            warn!(account_id = %account.id, error = %err, "account error in response");
            continue;
        }
        events.extend(account.records.into_iter().map(|r| r.fields_map));
    }

    EventPage::new(events, feed.marker.unwrap_or_default())
}

pub(crate) fn user_agent() -> String {
    format!("cef-forwarder/{}", crate::VERSION)
}
