// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Syslog framing and the collector connection.

mod format;
mod writer;

pub use format::{
    extract_source_ip, format_message, format_message_at, truncate, HostnameStrategy,
    FALLBACK_HOSTNAME, PRIORITY, SOURCE_IP_FIELDS, UNKNOWN_EVENT_HOST,
};
pub use writer::{
    DeliveryError, EventSink, SyslogWriter, WriterConfig, MAX_RECONNECTS, RECONNECT_COOLDOWN,
};
