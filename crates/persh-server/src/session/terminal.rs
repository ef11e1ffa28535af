//! A long-lived terminal session.
//!
//! A [`Session`] owns one PTY process, its scrollback, and at most one
//! attached connection. A dedicated output pump reads the PTY for the whole
//! life of the process; connections come and go through [`Session::attach`]
//! and [`Session::detach`]. All shared state sits behind one mutex, and the
//! PTY itself never leaves this type.

use super::pty::{PtyHandle, PtyReader};
use super::registry::SessionInfo;
use super::scrollback::ScrollbackBuffer;
use persh_core::{exit_notice, PershError, PershResult};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Size of a single PTY read.
const READ_CHUNK: usize = 8192;

/// How long the exit notice may wait for room in a congested queue.
const NOTICE_TIMEOUT: Duration = Duration::from_secs(5);

/// How often the pump wakes up to check whether it should stop.
const PUMP_POLL: Duration = Duration::from_millis(100);

/// How long a removed session's process gets to exit after SIGHUP.
pub(crate) const KILL_GRACE: Duration = Duration::from_secs(2);

const PUMP_RUNNING: u8 = 0;
/// The process exited: stop at the first idle poll.
const PUMP_DRAIN: u8 = 1;
const PUMP_STOP: u8 = 2;

/// Something to deliver to the attached connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Raw PTY output.
    Output(Vec<u8>),
    /// Human-readable notice (sent as a text frame).
    Notice(String),
}

/// The receiving end of an attachment, handed to the connection.
///
/// `replay` must be written before anything read from `outbound`. The
/// outbound channel closes when the attachment ends (detach, eviction,
/// removal, or process exit).
#[derive(Debug)]
pub struct Attached {
    pub conn_id: u64,
    pub replay: Vec<u8>,
    pub outbound: mpsc::Receiver<Outbound>,
}

struct Attachment {
    conn_id: u64,
    tx: mpsc::Sender<Outbound>,
}

struct State {
    scrollback: ScrollbackBuffer,
    attached: Option<Attachment>,
    terminated: bool,
}

/// A PTY-backed shell that outlives the connections attached to it.
pub struct Session {
    id: String,
    name: String,
    cwd: PathBuf,
    created_at: SystemTime,
    pty: PtyHandle,
    state: Mutex<State>,
    done: watch::Sender<bool>,
    next_conn_id: AtomicU64,
    outbound_queue: usize,
    pump_mode: AtomicU8,
}

impl Session {
    pub(crate) fn new(
        id: String,
        name: String,
        cwd: PathBuf,
        pty: PtyHandle,
        scrollback_bytes: usize,
        outbound_queue: usize,
    ) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            id,
            name,
            cwd,
            created_at: SystemTime::now(),
            pty,
            state: Mutex::new(State {
                scrollback: ScrollbackBuffer::new(scrollback_bytes),
                attached: None,
                terminated: false,
            }),
            done,
            next_conn_id: AtomicU64::new(1),
            outbound_queue: outbound_queue.max(1),
            pump_mode: AtomicU8::new(PUMP_RUNNING),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // Nothing under this lock can leave it half-updated.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Attach a new connection. Any previous connection is evicted.
    ///
    /// The scrollback snapshot and the registration happen under the same
    /// lock, so `replay` followed by everything on `outbound` is gap-free.
    pub fn attach(&self) -> PershResult<Attached> {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (tx, outbound) = mpsc::channel(self.outbound_queue);

        let (replay, evicted) = {
            let mut state = self.state();
            if state.terminated {
                return Err(PershError::SessionTerminated(self.id.clone()));
            }
            let replay = state.scrollback.snapshot();
            let evicted = state.attached.replace(Attachment { conn_id, tx });
            (replay, evicted)
        };

        if let Some(old) = evicted {
            // Dropping the sender closes the old connection's outbound stream.
            info!(
                session_id = %self.id,
                conn_id = old.conn_id,
                replaced_by = conn_id,
                "evicting previous connection"
            );
        }
        info!(
            session_id = %self.id,
            conn_id,
            replay_bytes = replay.len(),
            "connection attached"
        );

        Ok(Attached {
            conn_id,
            replay,
            outbound,
        })
    }

    /// Detach `conn_id` if it is still the attached connection.
    ///
    /// Returns false for a stale detach from a superseded connection.
    pub fn detach(&self, conn_id: u64) -> bool {
        let mut state = self.state();
        let is_current = state
            .attached
            .as_ref()
            .is_some_and(|a| a.conn_id == conn_id);
        if is_current {
            state.attached = None;
            info!(session_id = %self.id, conn_id, "connection detached");
        } else {
            debug!(session_id = %self.id, conn_id, "ignoring stale detach");
        }
        is_current
    }

    /// Resize the terminal. Applies whether or not anyone is attached.
    pub fn resize(&self, cols: u16, rows: u16) -> PershResult<()> {
        if cols == 0 || rows == 0 {
            return Err(PershError::Pty(format!("invalid terminal size {cols}x{rows}")));
        }
        self.pty.resize(cols, rows)
    }

    /// Current terminal size as (cols, rows).
    pub fn size(&self) -> PershResult<(u16, u16)> {
        self.pty.size()
    }

    /// Feed input bytes to the process.
    pub async fn write_input(&self, data: Vec<u8>) -> PershResult<()> {
        self.pty.write(data).await
    }

    pub fn is_connected(&self) -> bool {
        self.state().attached.is_some()
    }

    /// Total PTY output seen so far, including evicted scrollback.
    pub fn output_bytes(&self) -> u64 {
        self.state().scrollback.total_written()
    }

    pub fn is_terminated(&self) -> bool {
        self.state().terminated
    }

    /// Whether the child process is still running.
    pub fn is_alive(&self) -> bool {
        self.pty.is_alive()
    }

    /// Subscribe to the one-shot termination signal.
    pub fn done_signal(&self) -> watch::Receiver<bool> {
        self.done.subscribe()
    }

    /// Resolve once the session has terminated.
    pub async fn terminated(&self) {
        let mut done = self.done_signal();
        // The sender lives as long as self, so this only returns on `true`.
        let _ = done.wait_for(|d| *d).await;
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            cwd: self.cwd.clone(),
            created_at: self
                .created_at
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            connected: self.is_connected(),
        }
    }

    /// Output pump: blocking PTY read loop. Returns once the PTY is done,
    /// the process has exited and its output is drained, or the session is
    /// being removed.
    pub(crate) fn pump(&self, mut reader: PtyReader) {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let mode = self.pump_mode.load(Ordering::Acquire);
            if mode == PUMP_STOP {
                debug!(session_id = %self.id, "output pump stopped");
                break;
            }
            match reader.read_timeout(&mut buf, PUMP_POLL) {
                Ok(None) if mode == PUMP_DRAIN => {
                    debug!(session_id = %self.id, "output drained after exit");
                    break;
                }
                Ok(None) => continue,
                Ok(Some(0)) => {
                    debug!(session_id = %self.id, "PTY reached EOF");
                    break;
                }
                Ok(Some(n)) => self.ingest(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    // EIO here is the normal "child side closed" signal.
                    debug!(session_id = %self.id, error = %e, "PTY read ended");
                    break;
                }
            }
        }
    }

    /// The process has exited; let the pump finish once output goes idle.
    pub(crate) fn drain_pump(&self) {
        let _ = self.pump_mode.compare_exchange(
            PUMP_RUNNING,
            PUMP_DRAIN,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Record a chunk and forward it to the attached connection.
    fn ingest(&self, chunk: &[u8]) {
        let mut state = self.state();
        state.scrollback.write(chunk);

        let Some(attachment) = state.attached.as_ref() else {
            return;
        };
        let conn_id = attachment.conn_id;
        match attachment.tx.try_send(Outbound::Output(chunk.to_vec())) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(
                    session_id = %self.id,
                    conn_id,
                    "attached connection fell behind, dropping it"
                );
                state.attached = None;
            }
            Err(TrySendError::Closed(_)) => {
                debug!(session_id = %self.id, conn_id, "attached connection gone, detaching");
                state.attached = None;
            }
        }
    }

    pub(crate) async fn wait_exit(&self) -> PershResult<u32> {
        self.pty.wait().await
    }

    /// Terminal transition, driven by the pump supervisor. Fires the done
    /// signal once and sends the exit notice to whoever is attached.
    pub(crate) async fn finish(&self, exit_code: Option<u32>) {
        let attachment = {
            let mut state = self.state();
            if state.terminated {
                return;
            }
            state.terminated = true;
            state.attached.take()
        };
        self.done.send_replace(true);
        self.pty.close();
        info!(session_id = %self.id, exit_code = ?exit_code, "session terminated");

        if let Some(attachment) = attachment {
            let notice = Outbound::Notice(exit_notice(exit_code));
            if attachment.tx.send_timeout(notice, NOTICE_TIMEOUT).await.is_err() {
                debug!(
                    session_id = %self.id,
                    conn_id = attachment.conn_id,
                    "exit notice not delivered"
                );
            }
        }
    }

    /// Explicit removal: close the attached connection, stop the pump, kill
    /// the process group, wait for the process and release the PTY.
    ///
    /// Completes the terminal transition itself, so it never depends on the
    /// PTY reaching EOF (a detached descendant may hold it open forever).
    pub(crate) async fn shutdown(&self) {
        self.pump_mode.store(PUMP_STOP, Ordering::Release);
        let attachment = {
            let mut state = self.state();
            state.terminated = true;
            state.attached.take()
        };
        self.done.send_replace(true);
        if let Some(attachment) = attachment {
            info!(
                session_id = %self.id,
                conn_id = attachment.conn_id,
                "closing attached connection"
            );
        }

        match self.pty.terminate(KILL_GRACE).await {
            Ok(code) => info!(session_id = %self.id, code, "session process stopped"),
            Err(e) => warn!(session_id = %self.id, error = %e, "failed to stop session process"),
        }
        self.pty.close();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("cwd", &self.cwd)
            .field("pid", &self.pty.pid())
            .finish()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::session::SessionOptions;
    use crate::test_support::{eventually, read_until, registry, registry_with};

    async fn next_notice(rx: &mut mpsc::Receiver<Outbound>) -> String {
        let wait = async {
            loop {
                match rx.recv().await {
                    Some(Outbound::Notice(text)) => return text,
                    Some(Outbound::Output(_)) => continue,
                    None => panic!("outbound closed without a notice"),
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .expect("no exit notice")
    }

    async fn drain_until_closed(rx: &mut mpsc::Receiver<Outbound>) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while rx.recv().await.is_some() {}
        })
        .await
        .expect("outbound never closed");
    }

    #[tokio::test]
    async fn replay_then_live_has_no_gap() {
        let options = SessionOptions {
            scrollback_bytes: 8,
            ..SessionOptions::default()
        };
        let reg = registry_with(
            "stty -echo; printf 0123456789; read x; printf ABCDEF; sleep 30",
            options,
        );
        let session = reg.create("gap", "").await.unwrap();
        eventually("initial output", || session.output_bytes() == 10).await;

        let mut attached = session.attach().unwrap();
        assert_eq!(attached.replay, b"23456789");

        session.write_input(b"go\n".to_vec()).await.unwrap();
        let mut live = Vec::new();
        read_until(&mut attached.outbound, &mut live, b"ABCDEF").await;
        assert_eq!(live, b"ABCDEF");

        reg.remove(session.id()).await;
    }

    #[tokio::test]
    async fn second_attach_evicts_first() {
        let reg = registry(
            "stty -echo; printf hi; while read line; do printf '%s' \"$line\"; done",
        );
        let session = reg.create("evict", "").await.unwrap();
        eventually("banner", || session.output_bytes() == 2).await;

        let mut first = session.attach().unwrap();
        let mut second = session.attach().unwrap();
        assert_eq!(first.replay, b"hi");
        assert_eq!(second.replay, b"hi");

        drain_until_closed(&mut first.outbound).await;
        assert!(session.is_connected());
        assert!(!session.detach(first.conn_id), "stale detach must be ignored");
        assert!(session.is_connected());

        session.write_input(b"one\n".to_vec()).await.unwrap();
        let mut live = Vec::new();
        read_until(&mut second.outbound, &mut live, b"one").await;
        assert_eq!(live, b"one");

        reg.remove(session.id()).await;
    }

    #[tokio::test]
    async fn detach_keeps_process_running() {
        let reg = registry("sleep 30");
        let session = reg.create("detach", "").await.unwrap();

        let mut attached = session.attach().unwrap();
        assert!(session.is_connected());
        assert!(session.detach(attached.conn_id));
        assert!(!session.is_connected());
        drain_until_closed(&mut attached.outbound).await;

        assert!(session.is_alive());
        assert!(!session.is_terminated());
        assert!(reg.get(session.id()).await.is_some());

        reg.remove(session.id()).await;
    }

    #[tokio::test]
    async fn exit_notice_goes_to_attached_connection() {
        let reg = registry("stty -echo; read x; exit 3");
        let session = reg.create("exit", "").await.unwrap();

        let mut attached = session.attach().unwrap();
        session.write_input(b"\n".to_vec()).await.unwrap();

        let notice = next_notice(&mut attached.outbound).await;
        assert!(notice.contains("code 3"), "notice was {notice:?}");
        drain_until_closed(&mut attached.outbound).await;

        tokio::time::timeout(Duration::from_secs(5), session.terminated())
            .await
            .expect("done signal never fired");
        assert!(*session.done_signal().borrow());
        assert!(reg.get(session.id()).await.is_none());
        assert_eq!(reg.count().await, 0);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn exit_is_reported_while_detached_descendant_holds_pty() {
        let reg = registry("stty -echo; setsid sleep 20 & read x; exit 4");
        let session = reg.create("escaped", "").await.unwrap();

        let mut attached = session.attach().unwrap();
        session.write_input(b"\n".to_vec()).await.unwrap();

        let notice = next_notice(&mut attached.outbound).await;
        assert!(notice.contains("code 4"), "notice was {notice:?}");
        drain_until_closed(&mut attached.outbound).await;
        tokio::time::timeout(Duration::from_secs(5), session.terminated())
            .await
            .expect("done signal never fired");
        assert_eq!(reg.count().await, 0);
        assert!(session.size().is_err());
    }

    #[tokio::test]
    async fn attach_after_exit_is_rejected() {
        let reg = registry("exit 0");
        let session = reg.create("gone", "").await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), session.terminated())
            .await
            .expect("session never terminated");

        let err = session.attach().unwrap_err();
        assert!(matches!(err, PershError::SessionTerminated(_)));
    }

    #[tokio::test]
    async fn resize_before_attach_persists() {
        let reg = registry("sleep 30");
        let session = reg.create("resize", "").await.unwrap();
        assert_eq!(session.size().unwrap(), (80, 24));

        session.resize(120, 40).unwrap();
        let _attached = session.attach().unwrap();
        assert_eq!(session.size().unwrap(), (120, 40));

        assert!(session.resize(0, 10).is_err());
        assert_eq!(session.size().unwrap(), (120, 40));

        reg.remove(session.id()).await;
    }
}
