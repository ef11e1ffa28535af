//! `persh attach`: open or reattach to a persistent session.
//!
//! Connects to the server, enters raw terminal mode and pipes the local
//! terminal to the remote PTY. Terminal resize events are forwarded as
//! resize frames. Ctrl+] detaches and leaves the session running.

use anyhow::{Context, Result};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use futures_util::{SinkExt, StreamExt};
use persh_core::{ClientControl, ServerControl};
use std::io::Write;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::config::{attach_url, AttachTarget};
use crate::terminal as term;

/// Local input, as seen by the I/O loop.
#[derive(Debug, PartialEq, Eq)]
enum LocalEvent {
    Input(Vec<u8>),
    Resize(u16, u16),
    Detach,
}

/// How the session loop ended.
#[derive(Debug, PartialEq, Eq)]
enum Ending {
    /// The user pressed Ctrl+].
    Detached,
    /// The server closed the connection, after an exit notice or not.
    Closed,
}

/// Attach to `session_id` (or create a session) on `host:port`.
pub async fn run(
    host: &str,
    port: u16,
    session_id: Option<String>,
    name: Option<String>,
    cwd: Option<String>,
) -> Result<()> {
    let (cols, rows) = term::get_terminal_size();
    let target = AttachTarget {
        session_id,
        name,
        cwd,
        cols,
        rows,
    };
    let url = attach_url(host, port, &target)?;
    debug!(url = %url, "connecting");

    let (ws, _response) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .with_context(|| format!("failed to connect to {host}:{port}"))?;
    info!(host = %host, port, cols, rows, "connected");

    let guard = term::RawModeGuard::enter().context("failed to enter raw terminal mode")?;

    let (tx_local, mut rx_local) = mpsc::channel::<LocalEvent>(64);
    let input_handle = tokio::task::spawn_blocking(move || read_local_events(tx_local));

    let (mut sink, mut stream) = ws.split();
    let mut stdout = std::io::stdout();

    let ending = loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Binary(data))) => {
                    stdout.write_all(&data)?;
                    stdout.flush()?;
                }
                Some(Ok(Message::Text(text))) => match ServerControl::parse(&text) {
                    Some(ServerControl::SessionId { session_id }) => {
                        eprint!("\r\npersh: session {session_id}\r\n");
                    }
                    Some(ServerControl::Error { message }) => {
                        anyhow::bail!("server refused session: {message}");
                    }
                    None => {
                        // Exit notice.
                        stdout.write_all(text.as_bytes())?;
                        stdout.flush()?;
                    }
                },
                Some(Ok(Message::Close(_))) | None => break Ending::Closed,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "connection lost");
                    break Ending::Closed;
                }
            },
            local = rx_local.recv() => match local {
                Some(LocalEvent::Input(bytes)) => {
                    sink.send(Message::Binary(bytes)).await.context("send failed")?;
                }
                Some(LocalEvent::Resize(c, r)) => {
                    let frame = ClientControl::Resize { cols: c, rows: r };
                    sink.send(Message::Text(frame.to_json()))
                        .await
                        .context("send failed")?;
                    debug!(cols = c, rows = r, "terminal resized");
                }
                Some(LocalEvent::Detach) | None => {
                    let _ = sink.close().await;
                    break Ending::Detached;
                }
            },
        }
    };

    // Closing the channel stops the input thread at its next poll.
    drop(rx_local);
    let _ = input_handle.await;
    drop(guard);

    match ending {
        Ending::Detached => eprintln!("\r\npersh: detached from {host}:{port}"),
        Ending::Closed => eprintln!("\r\npersh: connection to {host}:{port} closed"),
    }
    Ok(())
}

/// Read crossterm events until Ctrl+] or until the receiver goes away.
fn read_local_events(tx: mpsc::Sender<LocalEvent>) {
    while !tx.is_closed() {
        match event::poll(Duration::from_millis(100)) {
            Ok(false) => continue,
            Ok(true) => {}
            Err(e) => {
                warn!("crossterm poll error: {e}");
                break;
            }
        }
        let local = match event::read() {
            Ok(Event::Key(key)) => translate_key(&key),
            Ok(Event::Resize(cols, rows)) => Some(LocalEvent::Resize(cols, rows)),
            Ok(Event::Paste(text)) => Some(LocalEvent::Input(text.into_bytes())),
            Ok(_) => None,
            Err(e) => {
                warn!("crossterm event error: {e}");
                break;
            }
        };
        if let Some(local) = local {
            let detach = local == LocalEvent::Detach;
            if tx.blocking_send(local).is_err() || detach {
                break;
            }
        }
    }
}

fn translate_key(key: &KeyEvent) -> Option<LocalEvent> {
    if key.kind == KeyEventKind::Release {
        return None;
    }
    if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char(']') {
        return Some(LocalEvent::Detach);
    }
    key_event_to_bytes(key).map(LocalEvent::Input)
}

/// Convert a crossterm key event to raw bytes suitable for a PTY.
fn key_event_to_bytes(event: &KeyEvent) -> Option<Vec<u8>> {
    match event.code {
        KeyCode::Char(c) => {
            if event.modifiers.contains(KeyModifiers::CONTROL) {
                // Ctrl+A = 0x01, Ctrl+B = 0x02, etc.
                let byte = (c.to_ascii_lowercase() as u8).wrapping_sub(b'a').wrapping_add(1);
                if (1..=26).contains(&byte) {
                    return Some(vec![byte]);
                }
            }
            let mut buf = [0u8; 4];
            let s = c.encode_utf8(&mut buf);
            let mut bytes = s.as_bytes().to_vec();
            if event.modifiers.contains(KeyModifiers::ALT) {
                bytes.insert(0, 0x1b);
            }
            Some(bytes)
        }
        KeyCode::Enter => Some(vec![b'\r']),
        KeyCode::Backspace => Some(vec![0x7f]),
        KeyCode::Tab => Some(vec![b'\t']),
        KeyCode::BackTab => Some(b"\x1b[Z".to_vec()),
        KeyCode::Esc => Some(vec![0x1b]),
        KeyCode::Up => Some(b"\x1b[A".to_vec()),
        KeyCode::Down => Some(b"\x1b[B".to_vec()),
        KeyCode::Right => Some(b"\x1b[C".to_vec()),
        KeyCode::Left => Some(b"\x1b[D".to_vec()),
        KeyCode::Home => Some(b"\x1b[H".to_vec()),
        KeyCode::End => Some(b"\x1b[F".to_vec()),
        KeyCode::PageUp => Some(b"\x1b[5~".to_vec()),
        KeyCode::PageDown => Some(b"\x1b[6~".to_vec()),
        KeyCode::Insert => Some(b"\x1b[2~".to_vec()),
        KeyCode::Delete => Some(b"\x1b[3~".to_vec()),
        KeyCode::F(n) => {
            let seq = match n {
                1 => "\x1bOP",
                2 => "\x1bOQ",
                3 => "\x1bOR",
                4 => "\x1bOS",
                5 => "\x1b[15~",
                6 => "\x1b[17~",
                7 => "\x1b[18~",
                8 => "\x1b[19~",
                9 => "\x1b[20~",
                10 => "\x1b[21~",
                11 => "\x1b[23~",
                12 => "\x1b[24~",
                _ => return None,
            };
            Some(seq.as_bytes().to_vec())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(code: KeyCode, modifiers: KeyModifiers) -> KeyEvent {
        KeyEvent::new(code, modifiers)
    }

    #[test]
    fn ctrl_bracket_detaches() {
        let ev = key(KeyCode::Char(']'), KeyModifiers::CONTROL);
        assert_eq!(translate_key(&ev), Some(LocalEvent::Detach));
    }

    #[test]
    fn control_letters_map_to_c0_bytes() {
        let ev = key(KeyCode::Char('c'), KeyModifiers::CONTROL);
        assert_eq!(key_event_to_bytes(&ev), Some(vec![0x03]));
        let ev = key(KeyCode::Char('D'), KeyModifiers::CONTROL);
        assert_eq!(key_event_to_bytes(&ev), Some(vec![0x04]));
    }

    #[test]
    fn plain_and_alt_characters() {
        let ev = key(KeyCode::Char('é'), KeyModifiers::NONE);
        assert_eq!(key_event_to_bytes(&ev), Some("é".as_bytes().to_vec()));
        let ev = key(KeyCode::Char('b'), KeyModifiers::ALT);
        assert_eq!(key_event_to_bytes(&ev), Some(b"\x1bb".to_vec()));
    }

    #[test]
    fn special_keys() {
        let none = KeyModifiers::NONE;
        assert_eq!(key_event_to_bytes(&key(KeyCode::Enter, none)), Some(b"\r".to_vec()));
        assert_eq!(key_event_to_bytes(&key(KeyCode::Up, none)), Some(b"\x1b[A".to_vec()));
        assert_eq!(key_event_to_bytes(&key(KeyCode::F(5), none)), Some(b"\x1b[15~".to_vec()));
        assert_eq!(key_event_to_bytes(&key(KeyCode::F(13), none)), None);
    }

    #[test]
    fn key_release_is_ignored() {
        let mut ev = key(KeyCode::Char('a'), KeyModifiers::NONE);
        ev.kind = KeyEventKind::Release;
        assert_eq!(translate_key(&ev), None);
    }
}
