// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Persistent connection to the syslog collector.
//!
//! The writer never retries on its own. A failed write drops the connection and
//! the caller decides whether to [`EventSink::reconnect`]. Reconnects are rate
//! limited by a cooldown measured from the previous attempt and stop for good
//! once [`MAX_RECONNECTS`] consecutive attempts have failed.

use crate::config::{Config, Protocol};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

/// Minimum time between two reconnect attempts.
pub const RECONNECT_COOLDOWN: Duration = Duration::from_secs(5);
/// Consecutive failed reconnects after which the writer gives up.
pub const MAX_RECONNECTS: u32 = 10;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("no connection available")]
    NotConnected,

    #[error("reconnection rate limited, retry in {retry_in:?}")]
    RateLimited { retry_in: Duration },

    #[error("max reconnection attempts exceeded ({count}/{max})")]
    MaxReconnectsExceeded { count: u32, max: u32 },

    #[error("failed to resolve syslog address {address}: {reason}")]
    Resolve { address: String, reason: String },

    #[error("failed to connect to syslog server {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("syslog write failed: {0}")]
    Write(#[source] std::io::Error),

    #[error("syslog {operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },
}

/// Destination for formatted syslog lines.
#[async_trait]
pub trait EventSink: Send {
    /// Sends one line. Does not retry.
    async fn write(&mut self, message: &str) -> Result<(), DeliveryError>;

    /// Replaces the connection, subject to cooldown and the failure ceiling.
    async fn reconnect(&mut self) -> Result<(), DeliveryError>;

    async fn close(&mut self);
}

#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub address: String,
    pub protocol: Protocol,
    pub timeout: Duration,
    pub cooldown: Duration,
    pub max_reconnects: u32,
}

impl WriterConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            address: config.syslog_address(),
            protocol: config.syslog.protocol,
            timeout: config.connection_timeout(),
            cooldown: RECONNECT_COOLDOWN,
            max_reconnects: MAX_RECONNECTS,
        }
    }
}

enum Connection {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

pub struct SyslogWriter {
    config: WriterConfig,
    connection: Option<Connection>,
    failed_reconnects: u32,
    last_reconnect: Option<Instant>,
}

impl SyslogWriter {
    /// Opens the initial connection. Failure here is a startup error.
    pub async fn connect(config: WriterConfig) -> Result<Self, DeliveryError> {
        let connection = open(&config).await?;
        info!(
            address = %config.address,
            protocol = %config.protocol,
            "connected to syslog server"
        );
        Ok(Self {
            config,
            connection: Some(connection),
            failed_reconnects: 0,
            last_reconnect: None,
        })
    }

    /// Consecutive failed reconnect attempts.
    pub fn reconnect_count(&self) -> u32 {
        self.failed_reconnects
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub fn address(&self) -> &str {
        &self.config.address
    }
}

#[async_trait]
impl EventSink for SyslogWriter {
    async fn write(&mut self, message: &str) -> Result<(), DeliveryError> {
        let connection = self.connection.as_mut().ok_or(DeliveryError::NotConnected)?;

        let mut line = Vec::with_capacity(message.len() + 1);
        line.extend_from_slice(message.as_bytes());
        line.push(b'\n');

        let result = match connection {
            Connection::Tcp(stream) => timeout(self.config.timeout, stream.write_all(&line))
                .await
                .map(|r| r.map_err(DeliveryError::Write)),
            Connection::Udp(socket) => timeout(self.config.timeout, socket.send(&line))
                .await
                .map(|r| r.map(|_| ()).map_err(DeliveryError::Write)),
        }
        .unwrap_or(Err(DeliveryError::Timeout {
            operation: "write",
            timeout: self.config.timeout,
        }));

        if let Err(e) = &result {
            debug!(error = %e, "syslog write failed");
            self.connection = None;
        }
        result
    }

    async fn reconnect(&mut self) -> Result<(), DeliveryError> {
        if let Some(last) = self.last_reconnect {
            let elapsed = last.elapsed();
            if elapsed < self.config.cooldown {
                return Err(DeliveryError::RateLimited {
                    retry_in: self.config.cooldown - elapsed,
                });
            }
        }

        if self.failed_reconnects >= self.config.max_reconnects {
            error!(
                count = self.failed_reconnects,
                max = self.config.max_reconnects,
                "max reconnection attempts exceeded"
            );
            return Err(DeliveryError::MaxReconnectsExceeded {
                count: self.failed_reconnects,
                max: self.config.max_reconnects,
            });
        }

        self.close_connection().await;
        self.last_reconnect = Some(Instant::now());
        info!(
            attempt = self.failed_reconnects + 1,
            address = %self.config.address,
            "attempting syslog reconnection"
        );

        match open(&self.config).await {
            Ok(connection) => {
                self.connection = Some(connection);
                self.failed_reconnects = 0;
                info!("syslog reconnection successful");
                Ok(())
            }
            Err(e) => {
                // last_reconnect stays set: a failed attempt also starts the cooldown.
                self.failed_reconnects += 1;
                warn!(attempt = self.failed_reconnects, error = %e, "syslog reconnection failed");
                Err(e)
            }
        }
    }

    async fn close(&mut self) {
        if self.connection.is_some() {
            info!(address = %self.config.address, "closing syslog connection");
        }
        self.close_connection().await;
    }
}

impl SyslogWriter {
    async fn close_connection(&mut self) {
        if let Some(Connection::Tcp(mut stream)) = self.connection.take() {
            // The peer may already be gone.
            let _ = stream.shutdown().await;
        }
    }
}

async fn open(config: &WriterConfig) -> Result<Connection, DeliveryError> {
    let timed_out = DeliveryError::Timeout {
        operation: "connect",
        timeout: config.timeout,
    };
    timeout(config.timeout, open_inner(config))
        .await
        .unwrap_or(Err(timed_out))
}

async fn open_inner(config: &WriterConfig) -> Result<Connection, DeliveryError> {
    let connect_err = |source| DeliveryError::Connect {
        address: config.address.clone(),
        source,
    };

    match config.protocol {
        Protocol::Tcp => TcpStream::connect(config.address.as_str())
            .await
            .map(Connection::Tcp)
            .map_err(connect_err),
        Protocol::Udp => {
            let peer = resolve(&config.address).await?;
            let local: SocketAddr = if peer.is_ipv4() {
                ([0, 0, 0, 0], 0).into()
            } else {
                ([0u16; 8], 0).into()
            };
            let socket = UdpSocket::bind(local).await.map_err(connect_err)?;
            socket.connect(peer).await.map_err(connect_err)?;
            Ok(Connection::Udp(socket))
        }
    }
}

async fn resolve(address: &str) -> Result<SocketAddr, DeliveryError> {
    let mut addrs = tokio::net::lookup_host(address)
        .await
        .map_err(|e| DeliveryError::Resolve {
            address: address.to_string(),
            reason: e.to_string(),
        })?;
    addrs.next().ok_or_else(|| DeliveryError::Resolve {
        address: address.to_string(),
        reason: "no addresses returned".to_string(),
    })
}
