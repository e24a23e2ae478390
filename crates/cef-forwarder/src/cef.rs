// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Conversion of event records into CEF messages.
//!
//! A message is `CEF:0|vendor|product|version|signature|name|severity|extension`.
//! Extension keys named in the ordered field list come first, the rest follow
//! sorted by key so the output does not depend on map iteration order.

use std::collections::{BTreeMap, HashMap};

/// Field carrying the event type, used as the CEF signature.
pub const EVENT_TYPE_FIELD: &str = "event_type";
/// Field carrying the event sub type, appended to the CEF name.
pub const EVENT_SUB_TYPE_FIELD: &str = "event_sub_type";

const UNKNOWN: &str = "Unknown";
/// Severity used for event types missing from [`SEVERITIES`].
pub const DEFAULT_SEVERITY: u8 = 5;

/// Event type to CEF severity. Matching is exact and case sensitive.
const SEVERITIES: [(&str, u8); 13] = [
    ("Threat", 10),
    ("Malware", 10),
    ("Attack", 9),
    ("Intrusion", 9),
    ("Security", 8),
    ("Policy Violation", 7),
    ("Warning", 6),
    ("Alert", 6),
    ("Connectivity", 5),
    ("Network", 4),
    ("Traffic", 3),
    ("Info", 2),
    ("Debug", 1),
];

/// An event record as returned by the feed: field name to value.
pub type Fields = HashMap<String, String>;

#[derive(Debug, Clone)]
pub struct Formatter {
    vendor: String,
    product: String,
    version: String,
    field_mappings: BTreeMap<String, String>,
    ordered_fields: Vec<String>,
}

impl Formatter {
    pub fn new(
        vendor: impl Into<String>,
        product: impl Into<String>,
        version: impl Into<String>,
        field_mappings: BTreeMap<String, String>,
        ordered_fields: Vec<String>,
    ) -> Self {
        Self {
            vendor: vendor.into(),
            product: product.into(),
            version: version.into(),
            field_mappings,
            ordered_fields,
        }
    }

    pub fn from_config(config: &crate::config::CefConfig) -> Self {
        Self::new(
            config.vendor.clone(),
            config.product.clone(),
            config.version.clone(),
            config.field_mappings.clone(),
            config.ordered_fields.clone(),
        )
    }

    pub fn field_mappings(&self) -> &BTreeMap<String, String> {
        &self.field_mappings
    }

    /// Formats one event as a CEF message.
    pub fn format(&self, fields: &Fields) -> String {
        let signature = field_or(fields, EVENT_TYPE_FIELD, UNKNOWN);
        let name = format!(
            "{} - {}",
            signature,
            field_or(fields, EVENT_SUB_TYPE_FIELD, UNKNOWN)
        );
        let severity = severity_for(signature);

        let mut message = format!(
            "CEF:0|{}|{}|{}|{}|{}|{}|",
            self.vendor, self.product, self.version, signature, name, severity
        );
        message.push_str(&self.extension(fields));
        message
    }

    fn extension(&self, fields: &Fields) -> String {
        let mut extensions: BTreeMap<&str, String> = BTreeMap::new();

        for (source, target) in &self.field_mappings {
            if let Some(value) = fields.get(source).filter(|v| !v.is_empty()) {
                extensions.insert(target.as_str(), sanitize_value(value));
            }
        }
        // Unmapped fields keep their original name; they win over a mapped key
        // of the same name.
        for (key, value) in fields {
            if !self.field_mappings.contains_key(key) && !value.is_empty() {
                extensions.insert(key.as_str(), sanitize_value(value));
            }
        }

        let mut parts = Vec::with_capacity(extensions.len());
        for field in &self.ordered_fields {
            if let Some(value) = extensions.remove(field.as_str()) {
                parts.push(format!("{field}={value}"));
            }
        }
        parts.extend(extensions.into_iter().map(|(k, v)| format!("{k}={v}")));
        parts.join(" ")
    }
}

/// CEF severity (1..=10) for an event type.
pub fn severity_for(event_type: &str) -> u8 {
    SEVERITIES
        .iter()
        .find(|(name, _)| *name == event_type)
        .map_or(DEFAULT_SEVERITY, |(_, severity)| *severity)
}

/// Escapes the characters that delimit CEF extension values.
pub fn sanitize_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '=' => out.push_str("\\="),
            '|' => out.push_str("\\|"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out
}

/// Reverses [`sanitize_value`]. Unknown escapes are kept verbatim.
pub fn unsanitize_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('=') => out.push('='),
            Some('|') => out.push('|'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn field_or<'a>(fields: &'a Fields, key: &str, default: &'a str) -> &'a str {
    fields
        .get(key)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .unwrap_or(default)
}
