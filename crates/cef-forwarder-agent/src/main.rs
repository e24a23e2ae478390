// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use cef_forwarder::{
    api::{Client, ClientConfig},
    cef::Formatter,
    config::Config,
    logging,
    marker::MarkerStore,
    preflight,
    processor::{Processor, ProcessorConfig, Stats},
    scheduler::{BackoffConfig, Scheduler, BASE_BACKOFF},
    syslog::{HostnameStrategy, SyslogWriter, WriterConfig},
    VERSION,
};

/// Forwards security events from the events feed to a syslog collector as CEF.
#[derive(Debug, Parser)]
#[command(name = "cef-forwarder", version)]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log at debug level regardless of the configured level.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
pub async fn main() {
    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!("{e:#}");
        eprintln!("FATAL: {e:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config =
        Config::load(args.config.as_deref()).context("failed to load configuration")?;
    if args.verbose {
        config.logging.level = "debug".to_string();
    }
    logging::init(&config.logging).context("failed to initialize logger")?;

    info!(
        version = VERSION,
        pid = std::process::id(),
        config_file = %config.path.display(),
        "starting CEF forwarder"
    );
    info!(
        api_url = %config.api.url,
        account_id = %config.api.account_id,
        syslog_server = %config.syslog_address(),
        syslog_protocol = %config.syslog.protocol,
        fetch_interval_sec = config.processing.fetch_interval_seconds,
        max_events = config.processing.max_events_per_request,
        max_pagination = config.processing.max_pagination_requests,
        log_level = %config.logging.level,
        log_format = %config.logging.format,
        "configuration loaded"
    );

    config
        .validate()
        .context("configuration validation failed")?;

    let results = preflight::run_all(&config).await;
    if preflight::has_failures(&results) {
        eprintln!("\n{}\n", preflight::format_failures(&results));
    }
    preflight::ensure_passed(&results).context("pre-flight checks failed, cannot start service")?;
    info!("all pre-flight checks passed");

    let marker = MarkerStore::open(&config.state.marker_file)
        .context("failed to initialize marker store")?;
    info!(
        marker_file = %marker.path().display(),
        marker = marker.get(),
        "marker store initialized"
    );

    let formatter = Formatter::from_config(&config.cef);
    info!(
        vendor = %config.cef.vendor,
        product = %config.cef.product,
        field_mappings = formatter.field_mappings().len(),
        "CEF formatter initialized"
    );

    let client = Client::new(ClientConfig::from_config(&config))
        .context("failed to initialize API client")?;
    let writer = SyslogWriter::connect(WriterConfig::from_config(&config))
        .await
        .context("failed to initialize syslog connection")?;
    info!(
        api_url = client.url(),
        syslog_server = writer.address(),
        "API client and syslog writer initialized"
    );

    let processor = Processor::new(
        client,
        writer,
        marker,
        formatter,
        HostnameStrategy::from_config(&config.syslog),
        ProcessorConfig::from_config(&config),
        Arc::new(Stats::new()),
    );
    info!("all components initialized successfully");

    let cancel = CancellationToken::new();
    let (reload_tx, reload_rx) = mpsc::channel(1);
    let signals = signals::Signals::install().context("failed to install signal handlers")?;
    tokio::spawn(signals.forward(cancel.clone(), reload_tx));

    let scheduler = Scheduler::new(
        processor,
        config.fetch_interval(),
        BackoffConfig::new(BASE_BACKOFF, config.max_backoff()),
    );
    scheduler.run(cancel, reload_rx).await;

    info!("shutdown complete");
    Ok(())
}

#[cfg(unix)]
mod signals {
    use tokio::signal::unix::{signal, Signal, SignalKind};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use tracing::info;

    pub struct Signals {
        interrupt: Signal,
        terminate: Signal,
        quit: Signal,
        hangup: Signal,
    }

    impl Signals {
        pub fn install() -> std::io::Result<Self> {
            Ok(Self {
                interrupt: signal(SignalKind::interrupt())?,
                terminate: signal(SignalKind::terminate())?,
                quit: signal(SignalKind::quit())?,
                hangup: signal(SignalKind::hangup())?,
            })
        }

        /// SIGHUP requests a reload; the other signals cancel the service.
        pub async fn forward(mut self, cancel: CancellationToken, reload: mpsc::Sender<()>) {
            loop {
                let name = tokio::select! {
                    _ = self.interrupt.recv() => "SIGINT",
                    _ = self.terminate.recv() => "SIGTERM",
                    _ = self.quit.recv() => "SIGQUIT",
                    _ = self.hangup.recv() => {
                        info!(signal = "SIGHUP", "received signal");
                        // A reload already queued covers this one.
                        let _ = reload.try_send(());
                        continue;
                    }
                };
                info!(signal = name, "received signal");
                cancel.cancel();
                return;
            }
        }
    }
}

#[cfg(not(unix))]
mod signals {
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use tracing::{error, info};

    pub struct Signals;

    impl Signals {
        pub fn install() -> std::io::Result<Self> {
            Ok(Self)
        }

        pub async fn forward(self, cancel: CancellationToken, _reload: mpsc::Sender<()>) {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!(signal = "ctrl-c", "received signal"),
                Err(e) => error!(error = %e, "failed to listen for ctrl-c"),
            }
            cancel.cancel();
        }
    }
}
