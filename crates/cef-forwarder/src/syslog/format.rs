// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::cef::Fields;
use chrono::{Local, NaiveDateTime};

/// local0.info
pub const PRIORITY: u8 = 134;

/// Event fields searched, in order, for a source IP.
pub const SOURCE_IP_FIELDS: [&str; 5] = ["client_ip", "src_ip", "source_ip", "host_ip", "user_ip"];

/// Hostname used when the event carries no source IP.
pub const UNKNOWN_EVENT_HOST: &str = "unknown-host";
/// Hostname used when the machine hostname cannot be read.
pub const FALLBACK_HOSTNAME: &str = "cef-forwarder";

const TIMESTAMP_FORMAT: &str = "%b %e %H:%M:%S";

/// How the hostname part of each syslog line is chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostnameStrategy {
    /// Source IP taken from the event itself.
    EventIp,
    /// Fixed name, either configured or the machine hostname.
    Fixed(String),
}

impl HostnameStrategy {
    /// Resolves the strategy from the syslog settings. The machine hostname is
    /// read once here rather than per message.
    pub fn from_config(config: &crate::config::SyslogConfig) -> Self {
        if config.use_event_ip_as_source {
            return Self::EventIp;
        }
        if !config.custom_source_ip.is_empty() {
            return Self::Fixed(config.custom_source_ip.clone());
        }
        let name = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| FALLBACK_HOSTNAME.to_string());
        Self::Fixed(name)
    }

    pub fn hostname_for<'a>(&'a self, fields: &'a Fields) -> &'a str {
        match self {
            Self::EventIp => extract_source_ip(fields).unwrap_or(UNKNOWN_EVENT_HOST),
            Self::Fixed(name) => name.as_str(),
        }
    }
}

/// First non-empty source IP field of the event.
pub fn extract_source_ip(fields: &Fields) -> Option<&str> {
    SOURCE_IP_FIELDS
        .iter()
        .filter_map(|key| fields.get(*key))
        .map(String::as_str)
        .find(|ip| !ip.is_empty())
}

/// Frames `message` as `<priority>timestamp hostname message` using local time.
pub fn format_message(hostname: &str, message: &str) -> String {
    format_message_at(Local::now().naive_local(), hostname, message)
}

pub fn format_message_at(timestamp: NaiveDateTime, hostname: &str, message: &str) -> String {
    format!(
        "<{PRIORITY}>{} {hostname} {message}",
        timestamp.format(TIMESTAMP_FORMAT)
    )
}

/// Cuts `message` to at most `max_len` bytes without splitting a character.
pub fn truncate(message: &str, max_len: usize) -> &str {
    if message.len() <= max_len {
        return message;
    }
    let mut end = max_len;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    &message[..end]
}
