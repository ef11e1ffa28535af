//! PTY wrapper using portable-pty.
//!
//! Opens a pseudo-terminal running a prepared launch spec in a given
//! working directory. The output side is handed out once at spawn time as a
//! [`PtyReader`]; everything else (input, resize, signals, wait, close) goes
//! through [`PtyHandle`].

use persh_core::{LaunchSpec, PershError, PershResult};
use portable_pty::{
    native_pty_system, ChildKiller, CommandBuilder, ExitStatus, MasterPty, PtySize,
};
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

#[cfg(unix)]
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};

type SharedChild = Arc<Mutex<Box<dyn portable_pty::Child + Send + Sync>>>;
type SharedWriter = Arc<Mutex<Option<Box<dyn Write + Send>>>>;

/// A managed PTY instance.
pub struct PtyHandle {
    /// Input side of the PTY. `None` once closed.
    writer: SharedWriter,
    /// The master, for resize. `None` once closed.
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    /// Child process handle, used for waiting.
    child: SharedChild,
    /// Fallback killer for platforms without process groups.
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    /// Set once the child has been reaped, so its pid is never signalled again.
    exited: Arc<AtomicBool>,
    pid: Option<u32>,
}

/// Output side of the PTY, owned by the session's pump.
pub struct PtyReader {
    inner: Box<dyn Read + Send>,
    /// Separate descriptor for the same master, used only to poll.
    #[cfg(unix)]
    poll_fd: Option<OwnedFd>,
}

impl PtyReader {
    /// Read output, waiting at most `timeout` for some to arrive.
    ///
    /// `Ok(None)` means nothing arrived in time; `Ok(Some(0))` is EOF.
    pub fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        #[cfg(unix)]
        if let Some(fd) = &self.poll_fd {
            if !wait_readable(fd, timeout)? {
                return Ok(None);
            }
        }
        self.inner.read(buf).map(Some)
    }
}

#[cfg(unix)]
fn wait_readable(fd: &OwnedFd, timeout: Duration) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd: fd.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    let millis = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);
    // SAFETY: `pfd` is a single valid pollfd and `fd` outlives the call.
    let n = unsafe { libc::poll(&mut pfd, 1, millis) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    // POLLHUP/POLLERR count as ready: the read reports what happened.
    Ok(n > 0)
}

impl PtyHandle {
    /// Spawn `launch` on a new PTY of the given size.
    ///
    /// Returns the handle plus the PTY output reader. Any failure leaves no
    /// process or descriptor behind.
    pub fn spawn(
        launch: &LaunchSpec,
        cwd: &Path,
        cols: u16,
        rows: u16,
    ) -> PershResult<(Self, PtyReader)> {
        let program = launch
            .argv
            .first()
            .ok_or_else(|| PershError::ProcessSpawn("empty command".into()))?;

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(pty_size(cols, rows))
            .map_err(|e| PershError::ProcessSpawn(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(program);
        for arg in &launch.argv[1..] {
            cmd.arg(arg);
        }
        for (key, value) in &launch.env {
            cmd.env(key, value);
        }
        cmd.cwd(cwd);

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PershError::ProcessSpawn(format!("failed to spawn {program}: {e}")))?;
        // The child holds its own copy; keeping ours would hide EOF from the reader.
        drop(pair.slave);

        let streams = open_streams(pair.master.as_ref());
        let (reader, writer) = match streams {
            Ok(streams) => streams,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(PershError::ProcessSpawn(format!("failed to open PTY streams: {e}")));
            }
        };

        let pid = child.process_id();
        let killer = child.clone_killer();
        info!(program = %program, pid = ?pid, cols, rows, "PTY spawned");

        Ok((
            Self {
                writer: Arc::new(Mutex::new(Some(writer))),
                master: Mutex::new(Some(pair.master)),
                child: Arc::new(Mutex::new(child)),
                killer: Mutex::new(killer),
                exited: Arc::new(AtomicBool::new(false)),
                pid,
            },
            reader,
        ))
    }

    /// Write input bytes to the PTY.
    ///
    /// The write may block on a child that stops reading, so it runs on the
    /// blocking pool.
    pub async fn write(&self, data: Vec<u8>) -> PershResult<()> {
        let writer = self.writer.clone();
        tokio::task::spawn_blocking(move || -> PershResult<()> {
            let mut writer = writer
                .lock()
                .map_err(|_| PershError::Pty("PTY writer lock poisoned".into()))?;
            let writer = writer.as_mut().ok_or_else(closed)?;
            writer.write_all(&data)?;
            writer.flush()?;
            Ok(())
        })
        .await
        .map_err(|e| PershError::Other(format!("join error: {e}")))?
    }

    /// Resize the PTY.
    pub fn resize(&self, cols: u16, rows: u16) -> PershResult<()> {
        let master = self
            .master
            .lock()
            .map_err(|_| PershError::Pty("PTY master lock poisoned".into()))?;
        master
            .as_ref()
            .ok_or_else(closed)?
            .resize(pty_size(cols, rows))
            .map_err(|e| PershError::Pty(format!("PTY resize failed: {e}")))?;
        debug!(cols, rows, "PTY resized");
        Ok(())
    }

    /// Current terminal size as (cols, rows).
    pub fn size(&self) -> PershResult<(u16, u16)> {
        let master = self
            .master
            .lock()
            .map_err(|_| PershError::Pty("PTY master lock poisoned".into()))?;
        let size = master
            .as_ref()
            .ok_or_else(closed)?
            .get_size()
            .map_err(|e| PershError::Pty(format!("PTY size query failed: {e}")))?;
        Ok((size.cols, size.rows))
    }

    /// Stop the child: SIGHUP to its process group, then SIGKILL if it is
    /// still running after `grace`. Returns the exit code once reaped.
    pub async fn terminate(&self, grace: Duration) -> PershResult<u32> {
        self.hangup()?;
        match tokio::time::timeout(grace, self.wait()).await {
            Ok(result) => result,
            Err(_) => {
                warn!(pid = ?self.pid, "child ignored SIGHUP, sending SIGKILL");
                self.force_kill()?;
                self.wait().await
            }
        }
    }

    #[cfg(unix)]
    fn hangup(&self) -> PershResult<()> {
        self.signal_group(libc::SIGHUP)
    }

    #[cfg(unix)]
    fn force_kill(&self) -> PershResult<()> {
        self.signal_group(libc::SIGKILL)
    }

    /// Signal the child's whole process group. The child is a session
    /// leader (portable-pty calls setsid), so its pgid is its pid.
    #[cfg(unix)]
    fn signal_group(&self, signal: libc::c_int) -> PershResult<()> {
        if self.exited.load(Ordering::Acquire) {
            return Ok(());
        }
        let Some(pid) = self.pid.and_then(|p| libc::pid_t::try_from(p).ok()) else {
            return self.kill_child();
        };
        if pid <= 0 {
            return self.kill_child();
        }
        // SAFETY: plain syscall; a negative pid addresses the process group.
        if unsafe { libc::kill(-pid, signal) } != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(PershError::Io(err));
            }
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn hangup(&self) -> PershResult<()> {
        self.kill_child()
    }

    #[cfg(not(unix))]
    fn force_kill(&self) -> PershResult<()> {
        self.kill_child()
    }

    fn kill_child(&self) -> PershResult<()> {
        let mut killer = self
            .killer
            .lock()
            .map_err(|_| PershError::Pty("killer lock poisoned".into()))?;
        killer.kill()?;
        Ok(())
    }

    /// Wait for the child process to exit. Returns the exit code.
    pub async fn wait(&self) -> PershResult<u32> {
        let child = self.child.clone();
        let exited = self.exited.clone();
        let status = tokio::task::spawn_blocking(move || -> PershResult<ExitStatus> {
            let mut child = child
                .lock()
                .map_err(|_| PershError::Pty("child lock poisoned".into()))?;
            let status = child.wait().map_err(PershError::Io)?;
            exited.store(true, Ordering::Release);
            Ok(status)
        })
        .await
        .map_err(|e| PershError::Other(format!("join error: {e}")))??;

        let code = status.exit_code();
        debug!(code, pid = ?self.pid, "PTY child exited");
        Ok(code)
    }

    /// Release the master and the input side. Input, resize and size fail
    /// afterwards.
    pub fn close(&self) {
        if let Ok(mut writer) = self.writer.lock() {
            writer.take();
        }
        if let Ok(mut master) = self.master.lock() {
            master.take();
        }
        debug!(pid = ?self.pid, "PTY closed");
    }

    /// Whether the child is still running.
    pub fn is_alive(&self) -> bool {
        if self.exited.load(Ordering::Acquire) {
            return false;
        }
        match self.child.try_lock() {
            Ok(mut child) => matches!(child.try_wait(), Ok(None)),
            // Someone is blocked in wait(), so it has not been reaped yet.
            Err(_) => true,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

type Streams = (PtyReader, Box<dyn Write + Send>);

fn open_streams(master: &(dyn MasterPty + Send)) -> Result<Streams, String> {
    let inner = master.try_clone_reader().map_err(|e| e.to_string())?;
    let writer = master.take_writer().map_err(|e| e.to_string())?;
    let reader = PtyReader {
        inner,
        #[cfg(unix)]
        poll_fd: Some(poll_fd(master).map_err(|e| e.to_string())?),
    };
    Ok((reader, writer))
}

#[cfg(unix)]
fn poll_fd(master: &(dyn MasterPty + Send)) -> io::Result<OwnedFd> {
    let raw = master
        .as_raw_fd()
        .ok_or_else(|| io::Error::new(io::ErrorKind::Unsupported, "PTY master has no fd"))?;
    // SAFETY: `raw` belongs to `master`, which is alive for this call; the
    // clone gets its own descriptor.
    unsafe { BorrowedFd::borrow_raw(raw) }.try_clone_to_owned()
}

fn closed() -> PershError {
    PershError::Pty("PTY closed".into())
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}
