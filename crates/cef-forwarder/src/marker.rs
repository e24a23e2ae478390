// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Durable storage for the events feed marker.
//!
//! The marker is an opaque cursor issued by the feed. It is kept in a plain text
//! file so the forwarder resumes where it stopped after a restart. The in-memory
//! value only moves once the file write succeeded.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum MarkerError {
    #[error("failed to read marker file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to create directory for marker file {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write marker file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Holds the current marker and the file backing it.
#[derive(Debug)]
pub struct MarkerStore {
    path: PathBuf,
    marker: String,
}

impl MarkerStore {
    /// Opens the store, loading the saved marker.
    ///
    /// A missing file is a first run and yields an empty marker.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, MarkerError> {
        let path = path.into();
        let marker = match fs::read_to_string(&path) {
            Ok(data) => {
                let marker = data.trim().to_string();
                info!(
                    path = %path.display(),
                    has_marker = !marker.is_empty(),
                    "loaded marker from file"
                );
                marker
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(path = %path.display(), "no existing marker file found, starting fresh");
                String::new()
            }
            Err(source) => return Err(MarkerError::Read { path, source }),
        };
        Ok(Self { path, marker })
    }

    /// Current marker, empty when reading from the start of the feed.
    pub fn get(&self) -> &str {
        &self.marker
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persists `marker` if it is non-empty and differs from the current one.
    ///
    /// Returns `Ok(true)` when the marker moved, `Ok(false)` for a no-op. On error
    /// the previous marker stays current.
    pub fn update(&mut self, marker: &str) -> Result<bool, MarkerError> {
        if marker.is_empty() || marker == self.marker {
            return Ok(false);
        }
        self.save(marker)?;
        self.marker = marker.to_string();
        Ok(true)
    }

    fn save(&self, marker: &str) -> Result<(), MarkerError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| MarkerError::CreateDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        // Write then rename so a crash never leaves a half-written cursor behind.
        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, marker)
            .and_then(|()| fs::rename(&tmp_path, &self.path))
            .map_err(|source| {
                let _ = fs::remove_file(&tmp_path);
                MarkerError::Write {
                    path: self.path.clone(),
                    source,
                }
            })?;

        debug!(path = %self.path.display(), "saved marker to file");
        Ok(())
    }
}
