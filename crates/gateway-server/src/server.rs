//! HTTP server lifecycle.

use crate::{routes::create_router, shutdown::shutdown_signal, state::AppState};
use gateway_config::ServerConfig;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::info;

/// Server startup and runtime failures
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listener could not be bound
    #[error("cannot bind {address}: {source}")]
    Bind {
        /// Requested address
        address: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The server stopped with an I/O error
    #[error("server error: {0}")]
    Serve(#[source] std::io::Error),
}

/// The gateway HTTP server
#[derive(Debug)]
pub struct Server {
    config: ServerConfig,
    state: AppState,
}

impl Server {
    /// Create a server for `state` listening per `config`
    pub fn new(config: ServerConfig, state: AppState) -> Self {
        Self { config, state }
    }

    /// Bind and serve until a shutdown signal arrives
    ///
    /// # Errors
    /// Returns `ServerError` when the address cannot be bound or serving fails
    pub async fn run(self) -> Result<(), ServerError> {
        let address = self.config.bind_address();
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|source| ServerError::Bind {
                address: address.clone(),
                source,
            })?;

        let local = listener.local_addr().map_err(ServerError::Serve)?;
        info!(address = %local, "Gateway listening");

        let app = create_router(self.state).into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                shutdown_signal().await;
            })
            .await
            .map_err(ServerError::Serve)?;

        info!("Gateway stopped");
        Ok(())
    }
}
