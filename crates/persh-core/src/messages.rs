//! Control frames exchanged over a session attachment.
//!
//! Control frames travel as JSON text frames tagged by `type`. Raw terminal
//! bytes travel as binary frames and never pass through this module.

use serde::{Deserialize, Serialize};

/// Control frames sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientControl {
    /// Resize the session's terminal.
    Resize { cols: u16, rows: u16 },
}

/// Control frames sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerControl {
    /// Identifier of a freshly created session. Never sent on reconnect.
    SessionId { session_id: String },
    /// Session creation failed; the connection closes right after.
    Error { message: String },
}

impl ClientControl {
    /// Try to interpret a text frame as a control frame.
    ///
    /// Returns `None` for anything that is not a well-formed control frame;
    /// the caller then treats the text as terminal input.
    pub fn parse(text: &str) -> Option<Self> {
        // Cheap pre-check so ordinary keystrokes skip the JSON parser.
        if !text.trim_start().starts_with('{') {
            return None;
        }
        serde_json::from_str(text).ok()
    }

    pub fn to_json(&self) -> String {
        // Serializing a plain tagged enum cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl ServerControl {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}

/// Human-readable notice sent when the session's process exits while a
/// connection is attached.
pub fn exit_notice(exit_code: Option<u32>) -> String {
    match exit_code {
        Some(code) => format!("\r\n[process exited with code {code}]\r\n"),
        None => "\r\n[process exited]\r\n".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_resize() {
        let msg = ClientControl::parse(r#"{"type":"resize","cols":120,"rows":40}"#);
        assert_eq!(msg, Some(ClientControl::Resize { cols: 120, rows: 40 }));
    }

    #[test]
    fn resize_ignores_unknown_fields() {
        let msg = ClientControl::parse(r#"{"type":"resize","cols":100,"rows":30,"extra":true}"#);
        assert_eq!(msg, Some(ClientControl::Resize { cols: 100, rows: 30 }));
    }

    #[test]
    fn plain_text_is_not_control() {
        assert_eq!(ClientControl::parse("ls -la\r"), None);
        assert_eq!(ClientControl::parse(""), None);
    }

    #[test]
    fn unrecognized_json_is_not_control() {
        assert_eq!(ClientControl::parse(r#"{"type":"ping"}"#), None);
        assert_eq!(ClientControl::parse(r#"{"type":"resize","cols":-1,"rows":5}"#), None);
        assert_eq!(ClientControl::parse(r#"{"type":"resize","cols":80}"#), None);
        assert_eq!(ClientControl::parse("{not json"), None);
    }

    #[test]
    fn session_id_frame_shape() {
        let frame = ServerControl::SessionId {
            session_id: "7".into(),
        };
        assert_eq!(frame.to_json(), r#"{"type":"session_id","session_id":"7"}"#);
        assert_eq!(ServerControl::parse(&frame.to_json()), Some(frame));
    }

    #[test]
    fn notice_mentions_exit_code() {
        assert!(exit_notice(Some(3)).contains("code 3"));
        assert!(exit_notice(None).contains("process exited"));
    }
}
