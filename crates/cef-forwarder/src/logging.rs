// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Global `tracing` subscriber setup.

use crate::config::LoggingConfig;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use thiserror::Error;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    #[error("failed to open log file {path}: {source}")]
    OpenFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to install subscriber: {0}")]
    Install(String),
}

/// Builds the filter directive for `level`, keeping HTTP and TLS internals quiet.
pub fn filter_directive(level: &str) -> String {
    format!("h2=off,hyper=off,rustls=off,reqwest=warn,{}", level.to_lowercase())
}

/// Installs the global subscriber described by `config`.
///
/// `output` is `stdout` (or empty), `stderr`, or a file path opened in append mode.
pub fn init(config: &LoggingConfig) -> Result<(), LoggingError> {
    let filter = EnvFilter::try_new(filter_directive(&config.level))?;

    let (writer, ansi) = match config.output.as_str() {
        "" | "stdout" => (BoxMakeWriter::new(std::io::stdout), true),
        "stderr" => (BoxMakeWriter::new(std::io::stderr), true),
        path => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| LoggingError::OpenFile {
                    path: PathBuf::from(path),
                    source,
                })?;
            (BoxMakeWriter::new(Mutex::new(file)), false)
        }
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_level(true)
        .with_target(false)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false);

    let result = if config.format == "json" {
        builder.json().with_ansi(false).try_init()
    } else {
        builder.with_ansi(ansi).try_init()
    };
    result.map_err(|e| LoggingError::Install(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_directive_is_parseable() {
        for level in ["debug", "info", "warn", "error", "INFO"] {
            let directive = filter_directive(level);
            assert!(directive.ends_with(&level.to_lowercase()));
            assert!(EnvFilter::try_new(directive).is_ok());
        }
    }

    #[test]
    fn test_init_fails_on_unwritable_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = LoggingConfig {
            output: dir
                .path()
                .join("missing")
                .join("forwarder.log")
                .to_string_lossy()
                .into_owned(),
            ..Default::default()
        };
        assert!(matches!(
            init(&config),
            Err(LoggingError::OpenFile { .. })
        ));
    }
}
