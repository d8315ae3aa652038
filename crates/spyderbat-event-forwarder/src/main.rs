// Copyright 2022-Present Spyderbat, Inc. https://www.spyderbat.com/
// SPDX-License-Identifier: Apache-2.0

//! Spyderbat event forwarder binary.
//!
//! Startup order matters: logging first so every later step is visible,
//! then config, then the cheap local resources (dedup cache, sinks), then
//! the network-facing pieces. The API reachability probe runs before the
//! poll loop starts so a bad org uid or api key fails fast with a
//! diagnostic instead of retrying forever.
//!
//! Shutdown order is the reverse of the data flow: stop polling, then
//! drain the webhook, then exit. The source refresher is a daemon task
//! and dies with the process.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use spyderbat_forwarder_native::api::EventsApi;
use spyderbat_forwarder_native::checkpoint::IteratorCheckpoint;
use spyderbat_forwarder_native::config::Config;
use spyderbat_forwarder_native::dedup::{self, DedupCache};
use spyderbat_forwarder_native::enrich::Enricher;
use spyderbat_forwarder_native::filter::FilterEngine;
use spyderbat_forwarder_native::forwarder::{Forwarder, ForwarderConfig};
use spyderbat_forwarder_native::logger;
use spyderbat_forwarder_native::sinks::EventSinks;
use spyderbat_forwarder_native::sources::{self, SourceRegistry};
use spyderbat_forwarder_native::webhook::Webhook;

const PROXY_ENV_VARS: [&str; 6] = [
    "HTTP_PROXY",
    "http_proxy",
    "HTTPS_PROXY",
    "https_proxy",
    "NO_PROXY",
    "no_proxy",
];

#[derive(Parser)]
#[command(
    name = "spyderbat-event-forwarder",
    about = "Forwards Spyderbat security events to local sinks and webhooks"
)]
struct Cli {
    /// Path to the YAML config file.
    #[arg(short = 'c', long = "config", default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = logger::init() {
        eprintln!("fatal: failed to initialize logging: {e}");
        std::process::exit(1);
    }

    if let Err(e) = run(&cli).await {
        error!(error = %format!("{e:#}"), "fatal");
        std::process::exit(1);
    }
}

async fn run(cli: &Cli) -> anyhow::Result<()> {
    let user_agent = format!("sef/{}", env!("SEF_GIT_COMMIT"));
    info!(
        commit = env!("SEF_GIT_COMMIT"),
        arch = std::env::consts::ARCH,
        "starting spyderbat-event-forwarder"
    );

    let config = Config::load(&cli.config)?;
    info!(org_uid = %config.org_uid, "org uid");
    info!(api_host = %config.api_host, "api host");
    info!(log_path = %config.log_path.display(), "log path");
    info!(
        local_syslog_forwarding = config.local_syslog_forwarding,
        stdout = config.stdout,
        "local sinks"
    );
    if let Some(webhook) = &config.webhook {
        info!(
            endpoint = %webhook.endpoint,
            compression = %webhook.compression_algo,
            "webhook configured"
        );
    }
    for var in PROXY_ENV_VARS {
        if let Ok(value) = std::env::var(var) {
            if !value.is_empty() {
                info!(var, value = %value, "proxy environment");
            }
        }
    }

    // Failures here are only warnings: a proxy may resolve the host for
    // us even when local DNS cannot.
    match tokio::net::lookup_host((config.api_host.as_str(), 443)).await {
        Ok(_) => {}
        Err(e) => warn!(
            error = %e,
            api_host = %config.api_host,
            "unable to resolve api host; proxies may still succeed"
        ),
    }

    let api = Arc::new(
        EventsApi::new(&config, &user_agent).context("failed to build API client")?,
    );
    api.validate_reachability()
        .await
        .context("api is not reachable")?;
    info!("api reachability validated");

    let cache = DedupCache::new(&config.log_path, dedup::DEFAULT_CAPACITY)
        .context("failed to open dedup journal")?;
    let sinks = EventSinks::open(&config).context("failed to open sinks")?;
    let filter = FilterEngine::from_config(&config)?;
    let checkpoint = IteratorCheckpoint::new(&config.log_path);

    let registry = Arc::new(SourceRegistry::new());
    match sources::refresh(&api, &registry).await {
        Ok(count) => info!(sources = count, "loaded sources"),
        Err(e) => warn!(error = %e, "initial source refresh failed"),
    }

    let cancel = CancellationToken::new();
    tokio::spawn(sources::run_refresher(
        Arc::clone(&api),
        Arc::clone(&registry),
        cancel.clone(),
    ));
    tokio::spawn(watch_signals(cancel.clone()));

    let enricher = Enricher::new(registry, user_agent.clone());
    let webhook = Webhook::new(config.webhook.as_ref(), &user_agent)
        .context("failed to build webhook")?;

    let forwarder = Forwarder::new(ForwarderConfig {
        api,
        cache,
        enricher,
        filter,
        sinks,
        checkpoint,
        webhook: webhook.handle(),
    });
    let result = forwarder.run(cancel.clone()).await;

    // Drain queued events before exiting, even when the loop failed.
    webhook.shutdown().await;

    result?;
    info!("shutdown complete");
    Ok(())
}

async fn watch_signals(cancel: CancellationToken) {
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    let interrupt = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {}
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGINT");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = interrupt => {}
        () = terminate => {}
    }

    info!("shutdown signal received");
    cancel.cancel();
}
