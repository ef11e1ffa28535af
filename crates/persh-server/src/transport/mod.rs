//! Network transport for client connections.

pub mod websocket;
