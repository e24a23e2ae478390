// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! One-time startup checks of the marker file, the collector and the API.

use crate::api::{Client, ClientConfig};
use crate::config::Config;
use crate::syslog::{EventSink, SyslogWriter, WriterConfig};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use thiserror::Error;
use tracing::{error, info};

const PROBE_VALUE: &str = "preflight-test";

#[derive(Debug, Error)]
#[error("{failed} of {total} pre-flight checks failed")]
pub struct PreflightError {
    pub failed: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub name: &'static str,
    pub passed: bool,
    pub message: String,
    pub error: Option<String>,
}

impl CheckResult {
    fn pass(name: &'static str, message: String) -> Self {
        Self {
            name,
            passed: true,
            message,
            error: None,
        }
    }

    fn fail(name: &'static str, message: String, error: impl ToString) -> Self {
        Self {
            name,
            passed: false,
            message,
            error: Some(error.to_string()),
        }
    }
}

/// Runs every check in order and logs each outcome.
pub async fn run_all(config: &Config) -> Vec<CheckResult> {
    info!("running pre-flight checks");

    let results = vec![
        check_marker_file(&config.state.marker_file),
        check_syslog(WriterConfig::from_config(config)).await,
        check_api(ClientConfig::from_config(config)).await,
    ];

    for result in &results {
        if result.passed {
            info!(check = result.name, message = %result.message, "pre-flight check passed");
        } else {
            error!(
                check = result.name,
                message = %result.message,
                error = result.error.as_deref().unwrap_or_default(),
                "pre-flight check failed"
            );
        }
    }
    let failed = results.iter().filter(|r| !r.passed).count();
    info!(
        passed = results.len() - failed,
        failed,
        total = results.len(),
        "pre-flight checks complete"
    );
    results
}

/// Verifies the marker file can be written and read back.
///
/// Whatever the file held before is put back afterwards, so a saved marker
/// survives the check.
pub fn check_marker_file(path: &Path) -> CheckResult {
    const NAME: &str = "Marker File Access";

    let previous = match fs::read(path) {
        Ok(data) => Some(data),
        Err(e) if e.kind() == ErrorKind::NotFound => None,
        Err(e) => {
            return CheckResult::fail(
                NAME,
                format!("cannot read from marker file: {}", path.display()),
                e,
            )
        }
    };

    if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Err(e) = fs::create_dir_all(dir) {
            return CheckResult::fail(
                NAME,
                format!("cannot create marker directory: {}", dir.display()),
                e,
            );
        }
    }

    if let Err(e) = fs::write(path, PROBE_VALUE) {
        return CheckResult::fail(
            NAME,
            format!("cannot write to marker file: {}", path.display()),
            e,
        );
    }
    let read_back = fs::read(path);

    let restored = match &previous {
        Some(data) => fs::write(path, data),
        None => fs::remove_file(path),
    };
    if let Err(e) = restored {
        return CheckResult::fail(
            NAME,
            format!("cannot restore marker file: {}", path.display()),
            e,
        );
    }

    match read_back {
        Ok(data) if data == PROBE_VALUE.as_bytes() => CheckResult::pass(
            NAME,
            format!("marker file is readable and writable: {}", path.display()),
        ),
        Ok(data) => CheckResult::fail(
            NAME,
            "marker file read/write mismatch".to_string(),
            format!(
                "wrote '{PROBE_VALUE}' but read '{}'",
                String::from_utf8_lossy(&data)
            ),
        ),
        Err(e) => CheckResult::fail(
            NAME,
            format!("cannot read from marker file: {}", path.display()),
            e,
        ),
    }
}

/// Connects to the collector and sends one test line.
pub async fn check_syslog(config: WriterConfig) -> CheckResult {
    const NAME: &str = "Syslog Connectivity";
    let target = format!("{}://{}", config.protocol, config.address);

    let mut writer = match SyslogWriter::connect(config).await {
        Ok(writer) => writer,
        Err(e) => {
            return CheckResult::fail(
                NAME,
                format!("cannot connect to syslog server at {target}"),
                e,
            )
        }
    };

    let line = format!(
        "<14>1 {} preflight-test cef-forwarder - - - Pre-flight connectivity test",
        chrono::Local::now().to_rfc3339()
    );
    let result = writer.write(&line).await;
    writer.close().await;

    match result {
        Ok(()) => CheckResult::pass(NAME, format!("syslog server is reachable at {target}")),
        Err(e) => CheckResult::fail(NAME, format!("cannot write to syslog server at {target}"), e),
    }
}

/// Sends a minimal feed query to confirm the key and account are usable.
pub async fn check_api(config: ClientConfig) -> CheckResult {
    const NAME: &str = "Events API Connectivity";
    let account_id = config.account_id.clone();
    let url = config.url.clone();

    let client = match Client::new(config) {
        Ok(client) => client,
        Err(e) => return CheckResult::fail(NAME, "failed to create API client".to_string(), e),
    };

    match client.probe().await {
        Ok(_) => CheckResult::pass(
            NAME,
            format!("events API is accessible and authenticated (account: {account_id})"),
        ),
        Err(e) => {
            let message = match &e {
                crate::api::FetchError::Unauthorized => {
                    "API authentication failed - check your API key".to_string()
                }
                crate::api::FetchError::Forbidden => {
                    "API access forbidden - ensure the events integration is enabled".to_string()
                }
                crate::api::FetchError::Transport(_) => format!("cannot connect to events API at {url}"),
                other => format!("events API check failed: {other}"),
            };
            CheckResult::fail(NAME, message, e)
        }
    }
}

pub fn has_failures(results: &[CheckResult]) -> bool {
    results.iter().any(|r| !r.passed)
}

/// Bullet list of failed checks, empty when all passed.
pub fn format_failures(results: &[CheckResult]) -> String {
    let failures: Vec<String> = results
        .iter()
        .filter(|r| !r.passed)
        .map(|r| format!("  - {}: {}", r.name, r.message))
        .collect();
    if failures.is_empty() {
        return String::new();
    }
    format!("Pre-flight checks failed:\n{}", failures.join("\n"))
}

/// Turns failed checks into an error.
pub fn ensure_passed(results: &[CheckResult]) -> Result<(), PreflightError> {
    let failed = results.iter().filter(|r| !r.passed).count();
    if failed == 0 {
        Ok(())
    } else {
        Err(PreflightError {
            failed,
            total: results.len(),
        })
    }
}
