//! Connection bridge: one instance per WebSocket connection.
//!
//! Resolves (or creates) the session named by the connect request, attaches
//! to it, and relays frames both ways:
//!
//! - client text `{"type":"resize",...}` resizes the PTY;
//! - any other client frame is raw PTY input;
//! - PTY output goes back as binary frames, scrollback replay first;
//! - a newly created session is announced once with a `session_id` frame;
//! - if the process exits while attached, a text notice precedes the close.
//!
//! The read loop races the session's done signal, so each bridge ends in
//! exactly one way: the session terminated, or the bridge detached.

use crate::session::{Outbound, Session, SessionRegistry};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use persh_core::{ClientControl, PershError, PershResult, ServerControl};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

/// Connection parameters taken from the upgrade request's query string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Session to reattach to; unknown or missing means "create one".
    pub session_id: Option<String>,
    pub name: String,
    pub cwd: String,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

impl ConnectRequest {
    /// Parse `session_id`, `name`, `cwd`, `cols` and `rows` from a query
    /// string. Unknown keys and malformed numbers are ignored.
    pub fn from_query(query: Option<&str>) -> Self {
        let mut request = Self::default();
        let Some(query) = query else {
            return request;
        };
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "session_id" if !value.is_empty() => request.session_id = Some(value.into_owned()),
                "name" => request.name = value.into_owned(),
                "cwd" => request.cwd = value.into_owned(),
                "cols" => request.cols = value.parse().ok(),
                "rows" => request.rows = value.parse().ok(),
                _ => {}
            }
        }
        request
    }
}

/// How a bridge ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The client went away; the session keeps running.
    Detached,
    /// The server closed the connection (superseded by a newer attach,
    /// too slow, or a failed write). The session keeps running.
    Dropped,
    /// The session's process exited while attached.
    Terminated,
    /// No session could be resolved or created.
    Rejected,
}

/// Run the protocol for one connection until it ends.
pub async fn serve<S>(
    ws: WebSocketStream<S>,
    request: ConnectRequest,
    registry: Arc<SessionRegistry>,
) -> PershResult<Outcome>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();

    let (session, created) = match resolve(&registry, &request).await {
        Ok(resolved) => resolved,
        Err(e) => {
            warn!(error = %e, "could not create session");
            reject(&mut sink, &e).await;
            return Ok(Outcome::Rejected);
        }
    };

    if created {
        let frame = ServerControl::SessionId {
            session_id: session.id().to_string(),
        };
        sink.send(Message::Text(frame.to_json().into()))
            .await
            .map_err(|e| PershError::Transport(format!("WS send failed: {e}")))?;
    }

    if let (Some(cols), Some(rows)) = (request.cols, request.rows) {
        if let Err(e) = session.resize(cols, rows) {
            debug!(session_id = %session.id(), error = %e, "ignoring initial size");
        }
    }

    let attached = match session.attach() {
        Ok(attached) => attached,
        Err(e) => {
            reject(&mut sink, &e).await;
            return Ok(Outcome::Rejected);
        }
    };
    let conn_id = attached.conn_id;

    // Replay goes out before the writer starts draining live output.
    if !attached.replay.is_empty() {
        if let Err(e) = sink.send(Message::Binary(attached.replay)).await {
            session.detach(conn_id);
            return Err(PershError::Transport(format!("WS send failed: {e}")));
        }
    }

    let mut writer = tokio::spawn(write_outbound(sink, attached.outbound));
    let mut writer_done = false;

    let outcome = loop {
        tokio::select! {
            biased;

            _ = session.terminated() => break Outcome::Terminated,

            _ = &mut writer => {
                writer_done = true;
                break Outcome::Dropped;
            }

            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => handle_text(&session, text).await,
                Some(Ok(Message::Binary(data))) => relay_input(&session, data).await,
                Some(Ok(Message::Close(_))) | None => break Outcome::Detached,
                // Pings are answered by tungstenite itself.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(session_id = %session.id(), conn_id, error = %e, "WS read failed");
                    break Outcome::Detached;
                }
            },
        }
    };

    if outcome != Outcome::Terminated {
        session.detach(conn_id);
    }
    if !writer_done {
        // Lets the exit notice (if any) reach the client before the close.
        let _ = writer.await;
    }

    info!(session_id = %session.id(), conn_id, outcome = ?outcome, "connection finished");
    Ok(outcome)
}

async fn resolve(
    registry: &SessionRegistry,
    request: &ConnectRequest,
) -> PershResult<(Arc<Session>, bool)> {
    if let Some(id) = request.session_id.as_deref() {
        if let Some(session) = registry.get(id).await {
            return Ok((session, false));
        }
        debug!(session_id = %id, "unknown session, creating a new one");
    }
    let session = registry.create(&request.name, &request.cwd).await?;
    Ok((session, true))
}

async fn handle_text(session: &Session, text: String) {
    match ClientControl::parse(&text) {
        Some(ClientControl::Resize { cols, rows }) => {
            if let Err(e) = session.resize(cols, rows) {
                warn!(session_id = %session.id(), error = %e, "resize failed");
            }
        }
        None => relay_input(session, text.into_bytes()).await,
    }
}

async fn relay_input(session: &Session, data: Vec<u8>) {
    if let Err(e) = session.write_input(data).await {
        // The pump will notice a dead PTY on its own.
        debug!(session_id = %session.id(), error = %e, "PTY write failed");
    }
}

async fn reject<S>(sink: &mut SplitSink<WebSocketStream<S>, Message>, error: &PershError)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = ServerControl::Error {
        message: error.to_string(),
    };
    let _ = sink.send(Message::Text(frame.to_json().into())).await;
    let _ = sink.close().await;
}

/// Drain the attachment's queue into the socket. Returns when the queue
/// closes or a write fails; either way the socket is done.
async fn write_outbound<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut outbound: mpsc::Receiver<Outbound>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(msg) = outbound.recv().await {
        let frame = match msg {
            Outbound::Output(bytes) => Message::Binary(bytes),
            Outbound::Notice(text) => Message::Text(text.into()),
        };
        if let Err(e) = sink.send(frame).await {
            // Dropping the receiver makes the pump detach us on its next chunk.
            debug!(error = %e, "WS write failed");
            return;
        }
    }
    let _ = sink.close().await;
}
