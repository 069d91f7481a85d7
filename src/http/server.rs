//! HTTP server setup and the accept loop.
//!
//! # Responsibilities
//! - Assemble the root handler (upgrades first, then the application)
//! - Build the buffer pool and the per-connection driver from config
//! - Accept connections and spawn one task per connection
//! - Stop accepting on shutdown and drain live connections

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::buffer::BufferPool;
use crate::config::ServerConfig;
use crate::exchange::ExchangeSettings;
use crate::handler::{
    shared, DefaultErrorHandler, Dispatcher, ErrorHandler, Handler, HandlerChain, SharedHandler,
};
use crate::lifecycle::Shutdown;
use crate::net::tls::{load_server_config, TlsError};
use crate::net::{ConnectionTracker, Driver, DriverSettings, Listener, ListenerError};
use crate::upgrade::{UpgradeHandler, UpgradeManager};

/// Error type for running the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Listener(#[from] ListenerError),
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error(transparent)]
    Setup(#[from] crate::Error),
}

/// An HTTP/1.1 server: configuration, a root handler and optional upgrades.
pub struct HttpServer {
    config: ServerConfig,
    handler: SharedHandler,
    upgrades: Option<UpgradeManager>,
    error_handler: Arc<dyn ErrorHandler>,
    tls: Option<Arc<rustls::ServerConfig>>,
    pool: BufferPool,
}

impl std::fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpServer")
            .field("bind_address", &self.config.listener.bind_address)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl HttpServer {
    /// Create a server that hands every request to `handler`.
    pub fn new(config: ServerConfig, handler: impl Handler) -> Self {
        Self::with_shared(config, shared(handler))
    }

    pub fn with_shared(config: ServerConfig, handler: SharedHandler) -> Self {
        let pool = if config.buffers.preallocate {
            BufferPool::preallocated(config.buffers.buffer_size, config.buffers.pool_capacity)
        } else {
            BufferPool::new(config.buffers.buffer_size, config.buffers.pool_capacity)
        };
        Self {
            config,
            handler,
            upgrades: None,
            error_handler: Arc::new(DefaultErrorHandler),
            tls: None,
            pool,
        }
    }

    /// Offer protocol upgrades before the application handler sees a request.
    pub fn with_upgrades(mut self, manager: UpgradeManager) -> Self {
        self.upgrades = Some(manager);
        self
    }

    /// Replace the handler that answers failed exchanges.
    pub fn with_error_handler(mut self, handler: impl ErrorHandler) -> Self {
        self.error_handler = Arc::new(handler);
        self
    }

    /// Terminate TLS with `config`, overriding any certificate paths in the server config.
    pub fn with_tls(mut self, config: Arc<rustls::ServerConfig>) -> Self {
        self.tls = Some(config);
        self
    }

    /// The pool every connection of this server draws its buffers from.
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    fn root_handler(&self) -> Result<SharedHandler, ServerError> {
        match &self.upgrades {
            Some(manager) if !manager.is_empty() => {
                let chain = HandlerChain::builder()
                    .handler(UpgradeHandler::new(manager.clone()))
                    .shared(Arc::clone(&self.handler))
                    .build()?;
                Ok(shared(chain))
            }
            _ => Ok(Arc::clone(&self.handler)),
        }
    }

    fn build_driver(&self) -> Result<Driver, ServerError> {
        let limits = &self.config.limits;
        let exchange_settings = ExchangeSettings {
            surface_trailers: limits.surface_trailers,
            max_trailer_bytes: limits.max_trailer_bytes,
            max_drain_bytes: limits.max_drain_bytes,
            compression_level: limits.compression_level,
        };
        let driver = Driver::new(
            self.root_handler()?,
            Dispatcher::new(Arc::clone(&self.error_handler)),
            self.pool.clone(),
            exchange_settings,
            DriverSettings::from_config(&self.config),
        );

        let tls = match (&self.tls, &self.config.listener.tls) {
            (Some(config), _) => Some(Arc::clone(config)),
            (None, Some(paths)) => Some(load_server_config(
                Path::new(&paths.cert_path),
                Path::new(&paths.key_path),
            )?),
            (None, None) => None,
        };
        Ok(match tls {
            Some(config) => driver.with_tls(config),
            None => driver,
        })
    }

    /// Run the server, accepting connections on the given listener until `shutdown` fires.
    pub async fn run(self, listener: Listener, shutdown: Shutdown) -> Result<(), ServerError> {
        let driver = Arc::new(self.build_driver()?);
        let tracker = ConnectionTracker::new();
        let mut stop = shutdown.subscribe();

        tracing::info!(
            address = ?listener.local_addr().ok(),
            tls = driver.is_tls(),
            buffer_size = self.pool.buffer_size(),
            "HTTP server starting"
        );

        loop {
            let accepted = tokio::select! {
                _ = stop.recv() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, peer_addr, permit) = match accepted {
                Ok(accepted) => accepted,
                Err(ListenerError::Accept(e)) => {
                    tracing::warn!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    continue;
                }
                Err(ListenerError::Closed) => break,
                Err(e) => return Err(e.into()),
            };
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(peer_addr = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
            }

            let guard = tracker.track();
            let driver = Arc::clone(&driver);
            tokio::spawn(async move {
                let _permit = permit;
                let connection_id = guard.id();
                if let Err(e) = driver.serve(stream, connection_id, Some(peer_addr)).await {
                    if e.is_fatal_for_connection() {
                        tracing::debug!(connection_id = %connection_id, error = %e, "Connection failed");
                    } else {
                        tracing::warn!(connection_id = %connection_id, error = %e, "Connection failed");
                    }
                }
                drop(guard);
            });
        }

        listener.close();
        let grace = self.config.timeouts.shutdown_grace();
        tracing::info!(
            active_connections = tracker.active_count(),
            grace_ms = grace.as_millis() as u64,
            "Draining connections"
        );
        if !tracker.drain(grace).await {
            tracing::warn!(
                active_connections = tracker.active_count(),
                "Connections still open after the shutdown grace period"
            );
        }
        tracing::info!("HTTP server stopped");
        Ok(())
    }
}
