//! HTTP and WebSocket server
//!
//! Routes room lifecycle requests to the hub and upgrades WebSocket requests
//! into session loops.

mod http;
mod protocol;
mod websocket;

pub use http::*;
pub use protocol::*;
pub use websocket::*;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::info;

use crate::config::ServerConfig;
use crate::hub::Hub;

/// The collaborative drawing server
pub struct Server {
    config: ServerConfig,
    hub: Arc<Hub>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Create a new server and its hub
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let hub = Arc::new(Hub::new(&config));
        Self {
            config,
            hub,
            shutdown_tx,
        }
    }

    /// Shared session state
    pub fn hub(&self) -> Arc<Hub> {
        Arc::clone(&self.hub)
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Build the route table
    pub fn router(&self) -> Router {
        let mut router = Router::new()
            .route("/health", get(health))
            .route("/rooms", post(create_room))
            .route("/rooms/{code}", get(validate_room))
            .route("/ws/{code}", get(room_ws));

        if self.config.lobby {
            router = router.route("/ws", get(lobby_ws));
        }

        router.with_state(Arc::clone(&self.hub))
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(&addr).await?;
        info!("Listening on http://{}", addr);
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown
    ///
    /// On shutdown every live connection is closed so each session runs its
    /// own cleanup.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let hub = Arc::clone(&self.hub);
        let sweeper = Arc::clone(&self.hub).start_sweeper();

        let served = axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("Shutdown signal received, closing connections");
                hub.close_all().await;
            })
            .await;
        sweeper.abort();
        served?;

        let rooms = self.hub.rooms().room_count().await;
        if rooms > 0 {
            info!("{} rooms still open at shutdown", rooms);
        }
        Ok(())
    }
}
