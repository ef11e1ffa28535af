//! Core server: accepts WebSocket connections and runs a bridge for each.

use crate::bridge::{self, Outcome};
use crate::config::ServerConfig;
use crate::session::SessionRegistry;
use crate::transport::websocket::{self, WebSocketConnection};
use persh_core::PershResult;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The persh server instance.
pub struct PershServer {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
}

impl PershServer {
    pub fn new(config: ServerConfig, registry: Arc<SessionRegistry>) -> Self {
        Self { config, registry }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Listen and serve until the listener goes away.
    pub async fn run(&self) -> PershResult<()> {
        let (addr, mut ws_rx) = websocket::start_listener(self.config.listen_addr).await?;

        info!(
            addr = %addr,
            max_sessions = self.config.session.max_sessions,
            shell = %self.config.session.shell.shell,
            "persh-server ready"
        );

        while let Some(conn) = ws_rx.recv().await {
            self.spawn_connection(conn);
        }
        Ok(())
    }

    fn spawn_connection(&self, conn: WebSocketConnection) {
        let registry = self.registry.clone();
        let WebSocketConnection {
            ws_stream,
            remote_addr,
            request,
        } = conn;

        debug!(
            remote = %remote_addr,
            session_id = ?request.session_id,
            "new connection"
        );

        tokio::spawn(async move {
            match bridge::serve(ws_stream, request, registry).await {
                Ok(Outcome::Rejected) => {
                    info!(remote = %remote_addr, "connection rejected");
                }
                Ok(outcome) => {
                    debug!(remote = %remote_addr, outcome = ?outcome, "connection closed");
                }
                Err(e) => {
                    warn!(remote = %remote_addr, error = %e, "connection error");
                }
            }
        });
    }
}
