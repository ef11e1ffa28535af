//! persh-server: persistent shell sessions over WebSocket.
//!
//! Each session is a shell on a PTY that outlives its connections. Output is
//! kept in a bounded scrollback and replayed when a client reattaches by ID.

pub mod bridge;
pub mod config;
pub mod server;
pub mod session;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use bridge::{ConnectRequest, Outcome};
pub use config::{CliOverrides, ServerConfig};
pub use server::PershServer;
pub use session::{Session, SessionInfo, SessionOptions, SessionRegistry};
