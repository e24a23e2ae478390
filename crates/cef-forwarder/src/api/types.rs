// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::cef::Fields;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// GraphQL request body.
#[derive(Debug, Serialize)]
pub struct Request<'a> {
    pub query: &'a str,
    pub variables: Variables<'a>,
}

#[derive(Debug, Serialize)]
pub struct Variables<'a> {
    #[serde(rename = "accountIDs")]
    pub account_ids: [&'a str; 1],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub marker: Option<&'a str>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EventsFeedResponse {
    #[serde(default)]
    pub data: Option<ResponseData>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub errors: Vec<GraphQlError>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ResponseData {
    #[serde(rename = "eventsFeed", default)]
    pub events_feed: Option<EventsFeed>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EventsFeed {
    #[serde(default)]
    pub marker: Option<String>,
    #[serde(rename = "fetchedCount", default, deserialize_with = "null_as_default")]
    pub fetched_count: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub accounts: Vec<AccountRecords>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AccountRecords {
    #[serde(default, deserialize_with = "null_as_default")]
    pub id: String,
    #[serde(rename = "errorString", default)]
    pub error_string: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub records: Vec<Record>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Record {
    #[serde(rename = "fieldsMap", default, deserialize_with = "non_null_fields")]
    pub fields_map: Fields,
}

/// Reads a nullable value, falling back to the type's default on `null`.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Reads a field map, dropping fields whose value is `null`.
fn non_null_fields<'de, D>(deserializer: D) -> Result<Fields, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<HashMap<String, Option<String>>> = Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(name, value)| value.map(|v| (name, v)))
        .collect())
}

#[derive(Debug, Deserialize)]
pub struct GraphQlError {
    pub message: String,
}

/// One page of events together with the marker to resume from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventPage {
    pub events: Vec<Fields>,
    /// Candidate marker returned by the feed, empty when none was returned.
    pub new_marker: String,
    /// Whether another request may return more events.
    pub has_more: bool,
}

impl EventPage {
    /// Builds a page, deriving `has_more` from the marker and event count.
    ///
    /// More data is assumed only when the feed returned both a marker and at
    /// least one event. A marker with an empty page ends pagination.
    pub fn new(events: Vec<Fields>, new_marker: String) -> Self {
        let has_more = !new_marker.is_empty() && !events.is_empty();
        Self {
            events,
            new_marker,
            has_more,
        }
    }
}
