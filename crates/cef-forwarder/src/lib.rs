// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Security events feed to CEF/syslog forwarder.
//!
//! The crate polls a GraphQL events feed with a resumable marker, converts every
//! event into a CEF message and ships it to a syslog collector over a persistent
//! TCP or UDP connection. A [`scheduler::Scheduler`] drives one
//! [`processor::Processor`] cycle per tick and backs off exponentially while
//! cycles fail.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod api;
pub mod cef;
pub mod config;
pub mod logging;
pub mod marker;
pub mod preflight;
pub mod processor;
pub mod scheduler;
pub mod syslog;

/// Version reported in the startup banner and the API user agent.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
