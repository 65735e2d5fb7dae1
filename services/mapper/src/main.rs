//! portmap port mapper
//!
//! Forwards TCP connections from local ports to remote endpoints.
//!
//! This service:
//! - Loads proxy rules from a `proxy.properties` style rule file
//! - Binds one listener per rule, skipping ports that cannot be bound
//! - Accepts connections on all listeners from a single dispatcher
//! - Relays bytes between each client and its rule's remote endpoint

use anyhow::{Context, Result};
use clap::Parser;
use portmap_mapper::{AcceptDispatcher, Config, ListenerSet, LogFormat};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();
    init_tracing(&config);

    info!("Starting port mapper");

    let rules = portmap_rules::load_rules(&config.config).with_context(|| {
        format!(
            "failed to load proxy rules from {}",
            config.config.display()
        )
    })?;

    let dispatcher_config = config.dispatcher_config();
    info!(
        rules_file = %config.config.display(),
        rule_count = rules.len(),
        bind_host = %config.bind_host,
        pool_size = dispatcher_config.pool_size,
        buffer_size = dispatcher_config.relay.buffer_size,
        "Configuration loaded"
    );

    let listeners = ListenerSet::bind(rules.into_values(), config.bind_host).await;
    if !listeners.failures().is_empty() {
        warn!(
            skipped = listeners.failures().len(),
            listening = listeners.len(),
            "Some rules were skipped"
        );
    }

    let dispatcher = AcceptDispatcher::new(listeners, dispatcher_config)
        .context("cannot start the accept dispatcher")?;
    let stop = dispatcher.stop_handle();
    let pool = dispatcher.pool();

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, stopping");
                stop.stop();
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for the interrupt signal");
            }
        }
    });

    info!("Accept dispatcher configured. Hit Ctrl-C to exit...");
    let result = tokio::spawn(dispatcher.run())
        .await
        .context("accept dispatcher task failed")?;

    if !pool.drain(config.drain_timeout()).await {
        warn!(
            active_relays = pool.active(),
            "Drain timeout reached with relays still active"
        );
    }

    result.context("an unrecoverable error occurred while listening")?;
    info!("Port mapper stopped");
    Ok(())
}

fn init_tracing(config: &Config) {
    // Prefer RUST_LOG, fall back to --log-level
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into());
    let registry = tracing_subscriber::registry().with(filter);

    match config.log_format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}
