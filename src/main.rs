//! sluice demo server.
//!
//! Serves:
//! - `/gzip`: a text body, compressed when the client accepts gzip or deflate
//! - `/blocking`: a handler that runs on the worker pool
//! - `Upgrade: websocket`: a WebSocket echo
//! - everything else: the request body streamed back (chunked echo)

use std::path::PathBuf;

use clap::Parser;
use http::StatusCode;

use sluice::config::validation::validate_config;
use sluice::config::{load_config, ConfigError};
use sluice::handler::{
    shared, CompressionHandler, EchoHandler, Executor, HandlerChain, PathHandler,
};
use sluice::lifecycle::signals::trigger_on_signal;
use sluice::lifecycle::startup::build_runtime;
use sluice::net::Listener;
use sluice::observability::{logging, metrics};
use sluice::upgrade::{UpgradeManager, WebSocketAcceptor};
use sluice::{Exchange, Flow, HttpServer, ServerConfig, Shutdown};

/// Embeddable non-blocking HTTP/1.1 server, demo binary.
#[derive(Debug, Parser)]
#[command(name = "sluice", version, about)]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listener bind address (e.g. 127.0.0.1:8080).
    #[arg(short, long)]
    bind: Option<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ServerConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.listener.bind_address = bind;
        validate_config(&config).map_err(ConfigError::Validation)?;
    }

    let runtime = build_runtime(&config.threads)?;
    runtime.block_on(serve(config))
}

async fn serve(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    logging::init(&config.observability)?;
    tracing::info!("sluice v{} starting", env!("CARGO_PKG_VERSION"));

    tracing::info!(
        bind_address = %config.listener.bind_address,
        max_connections = config.listener.max_connections,
        buffer_size = config.buffers.buffer_size,
        pool_capacity = config.buffers.pool_capacity,
        tls = config.listener.tls.is_some(),
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        metrics::init_metrics(config.observability.metrics_address.parse()?)?;
    }

    let listener = Listener::bind(&config.listener).await?;

    let mut upgrades = UpgradeManager::new();
    upgrades.register(WebSocketAcceptor::echo());
    let server = HttpServer::new(config, routes()?).with_upgrades(upgrades);

    let shutdown = Shutdown::new();
    let signals = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = trigger_on_signal(signals).await {
            tracing::error!(error = %e, "Failed to install signal handlers");
        }
    });

    server.run(listener, shutdown).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

fn routes() -> sluice::Result<PathHandler> {
    let mut paths = PathHandler::new(EchoHandler);
    paths.add_prefix(
        "/gzip",
        HandlerChain::builder()
            .handler(CompressionHandler)
            .handler(|ex: &mut Exchange| -> sluice::Result<Flow> {
                ex.response_headers_mut()
                    .insert(http::header::CONTENT_TYPE, http::HeaderValue::from_static("text/plain"));
                ex.send(StatusCode::OK, "sluice compresses this body when you let it.\n".repeat(64))?;
                Ok(Flow::Done)
            })
            .build()?,
    )?;
    paths.add_prefix("/blocking", |_: &mut Exchange| -> sluice::Result<Flow> {
        Ok(Flow::Dispatch(
            Executor::Worker,
            shared(|ex: &mut Exchange| -> sluice::Result<Flow> {
                // Stands in for a blocking call (database, file system).
                std::thread::sleep(std::time::Duration::from_millis(50));
                let worker = std::thread::current().name().unwrap_or("worker").to_string();
                ex.send(StatusCode::OK, format!("handled on {}\n", worker))?;
                Ok(Flow::Done)
            }),
        ))
    })?;
    Ok(paths)
}
