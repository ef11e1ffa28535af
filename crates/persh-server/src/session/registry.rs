//! Session registry.
//!
//! Owns every live [`Session`], keyed by a process-lifetime-unique ID.
//! Handles creation (cwd validation, shell launch, pump start), lookup,
//! listing and removal. A session leaves the registry exactly once: either
//! its process exits, or it is removed explicitly.

use super::pty::{PtyHandle, PtyReader};
use super::scrollback::DEFAULT_SCROLLBACK_BYTES;
use super::terminal::{Session, KILL_GRACE};
use persh_core::{EnvironmentCustomizer, PershError, PershResult, ShellRequest};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Information returned when listing sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub name: String,
    pub cwd: PathBuf,
    /// Creation time, seconds since the Unix epoch.
    pub created_at: u64,
    /// Attachment state at snapshot time.
    pub connected: bool,
}

/// Settings applied to every session the registry creates.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub shell: ShellRequest,
    pub scrollback_bytes: usize,
    pub cols: u16,
    pub rows: u16,
    /// Max chunks queued for an attached connection before it is dropped.
    pub outbound_queue: usize,
    /// 0 = unlimited.
    pub max_sessions: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            shell: ShellRequest {
                shell: default_shell(),
                ..ShellRequest::default()
            },
            scrollback_bytes: DEFAULT_SCROLLBACK_BYTES,
            cols: 80,
            rows: 24,
            outbound_queue: 256,
            max_sessions: 0,
        }
    }
}

/// The user's login shell, falling back to `/bin/sh`.
pub fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

type SessionMap = Arc<RwLock<HashMap<String, Arc<Session>>>>;

/// Manages all live sessions.
pub struct SessionRegistry {
    sessions: SessionMap,
    next_id: AtomicU64,
    options: SessionOptions,
    customizer: Arc<dyn EnvironmentCustomizer>,
}

impl SessionRegistry {
    pub fn new(options: SessionOptions, customizer: Arc<dyn EnvironmentCustomizer>) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            options,
            customizer,
        }
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Create a session running the configured shell in `cwd`.
    ///
    /// An empty `cwd` means the server's own working directory. On error
    /// nothing is left running and no ID is consumed.
    pub async fn create(&self, name: &str, cwd: &str) -> PershResult<Arc<Session>> {
        let cwd = resolve_cwd(cwd)?;

        // Cheap early reject; the authoritative check happens at insert.
        let max = self.options.max_sessions;
        if max > 0 && self.count().await >= max {
            return Err(PershError::SessionLimit(max));
        }

        let launch = self.customizer.customize(&self.options.shell)?;
        launch
            .write_files()
            .map_err(|e| PershError::ProcessSpawn(format!("failed to prepare shell rc: {e}")))?;
        let (pty, reader) =
            PtyHandle::spawn(&launch, &cwd, self.options.cols, self.options.rows)?;

        let inserted = {
            let mut sessions = self.sessions.write().await;
            if max > 0 && sessions.len() >= max {
                Err(pty)
            } else {
                // The ID is taken under the lock, so a failed create never uses one up.
                let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
                let name = if name.trim().is_empty() {
                    format!("session-{id}")
                } else {
                    name.to_string()
                };
                let session = Arc::new(Session::new(
                    id.clone(),
                    name,
                    cwd,
                    pty,
                    self.options.scrollback_bytes,
                    self.options.outbound_queue,
                ));
                // Registered before the pump starts so a fast exit still finds the entry.
                sessions.insert(id, session.clone());
                Ok(session)
            }
        };
        let session = match inserted {
            Ok(session) => session,
            Err(pty) => {
                debug!("session limit reached while spawning, discarding new process");
                drop(reader);
                if let Err(e) = pty.terminate(KILL_GRACE).await {
                    warn!(error = %e, "failed to stop discarded process");
                }
                pty.close();
                return Err(PershError::SessionLimit(max));
            }
        };
        self.start_pump(session.clone(), reader);

        info!(
            session_id = %session.id(),
            name = %session.name(),
            cwd = %session.cwd().display(),
            "session created"
        );
        Ok(session)
    }

    /// Run the output pump for the whole life of the process, then tear the
    /// session down: reap the child, drain remaining output, leave the
    /// registry (unless already removed) and signal termination.
    fn start_pump(&self, session: Arc<Session>, reader: PtyReader) {
        let sessions = self.sessions.clone();
        tokio::spawn(async move {
            let pump = session.clone();
            let pump_task = tokio::task::spawn_blocking(move || pump.pump(reader));

            let exit_code = match session.wait_exit().await {
                Ok(code) => Some(code),
                Err(e) => {
                    debug!(session_id = %session.id(), error = %e, "could not read exit status");
                    None
                }
            };
            session.drain_pump();
            if let Err(e) = pump_task.await {
                warn!(session_id = %session.id(), error = %e, "output pump panicked");
            }

            if sessions.write().await.remove(session.id()).is_some() {
                info!(session_id = %session.id(), "session exited, removed from registry");
            }
            session.finish(exit_code).await;
        });
    }

    /// Look up a live session. Never creates one.
    pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .await
            .get(id)
            .filter(|s| !s.is_terminated())
            .cloned()
    }

    /// Snapshot of all sessions, oldest first.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .sessions
            .read()
            .await
            .values()
            .map(|s| s.info())
            .collect();
        infos.sort_by_key(|i| (i.created_at, i.id.parse::<u64>().unwrap_or(u64::MAX)));
        infos
    }

    /// Remove a session: close its connection, kill the process and wait
    /// for it. Returns false (and does nothing) for an unknown ID.
    pub async fn remove(&self, id: &str) -> bool {
        let removed = self.sessions.write().await.remove(id);
        match removed {
            Some(session) => {
                info!(session_id = %id, "removing session");
                session.shutdown().await;
                true
            }
            None => {
                debug!(session_id = %id, "remove: no such session");
                false
            }
        }
    }

    /// Remove every session (server shutdown).
    pub async fn close_all(&self) {
        let drained: Vec<Arc<Session>> = self
            .sessions
            .write()
            .await
            .drain()
            .map(|(_, s)| s)
            .collect();
        if !drained.is_empty() {
            info!(count = drained.len(), "closing all sessions");
        }
        futures_util::future::join_all(drained.iter().map(|s| s.shutdown())).await;
    }

    /// Number of live sessions.
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

fn resolve_cwd(cwd: &str) -> PershResult<PathBuf> {
    let path = if cwd.trim().is_empty() {
        std::env::current_dir()?
    } else {
        PathBuf::from(cwd)
    };
    match std::fs::metadata(&path) {
        Ok(meta) if meta.is_dir() => Ok(path),
        _ => Err(PershError::InvalidWorkingDirectory(path)),
    }
}
