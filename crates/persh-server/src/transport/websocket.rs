//! WebSocket listener using tokio-tungstenite.
//!
//! Accepts TCP connections, performs the upgrade, and captures the upgrade
//! request's query string as a [`ConnectRequest`]. Accepted connections are
//! handed to the server over a channel.

use crate::bridge::ConnectRequest;
use persh_core::{PershError, PershResult};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
    /// Parameters from the upgrade URL.
    pub request: ConnectRequest,
}

/// Bind `bind_addr` and start accepting.
///
/// Returns the bound address (useful with port 0) and a receiver that yields
/// upgraded connections.
pub async fn start_listener(
    bind_addr: SocketAddr,
) -> PershResult<(SocketAddr, mpsc::Receiver<WebSocketConnection>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| PershError::Transport(format!("WS bind failed on {bind_addr}: {e}")))?;
    let local_addr = tcp_listener.local_addr()?;

    info!(addr = %local_addr, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        match upgrade(stream).await {
                            Ok((ws_stream, request)) => {
                                debug!(remote = %addr, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                    request,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    Ok((local_addr, rx))
}

async fn upgrade(
    stream: TcpStream,
) -> PershResult<(WebSocketStream<TcpStream>, ConnectRequest)> {
    let mut query: Option<String> = None;
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        query = req.uri().query().map(str::to_owned);
        Ok(resp)
    };
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback)
        .await
        .map_err(|e| PershError::Transport(e.to_string()))?;
    Ok((ws_stream, ConnectRequest::from_query(query.as_deref())))
}
