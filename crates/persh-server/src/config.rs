//! Server configuration: TOML file + CLI overrides.

use crate::session::{default_shell, SessionOptions, DEFAULT_SCROLLBACK_BYTES};
use persh_core::{PershError, PershResult, ShellRequest};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub session: SessionSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

/// `[session]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionSection {
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default)]
    pub shell_flags: Vec<String>,
    #[serde(default)]
    pub extra_path: Vec<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default = "default_scrollback_bytes")]
    pub scrollback_bytes: usize,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_rc_dir")]
    pub rc_dir: String,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            shell_flags: Vec::new(),
            extra_path: Vec::new(),
            prompt: None,
            scrollback_bytes: default_scrollback_bytes(),
            cols: default_cols(),
            rows: default_rows(),
            outbound_queue: default_outbound_queue(),
            max_sessions: default_max_sessions(),
            rc_dir: default_rc_dir(),
        }
    }
}

fn default_bind() -> IpAddr {
    IpAddr::from([127, 0, 0, 1])
}
fn default_port() -> u16 {
    7681
}
fn default_scrollback_bytes() -> usize {
    DEFAULT_SCROLLBACK_BYTES
}
fn default_cols() -> u16 {
    80
}
fn default_rows() -> u16 {
    24
}
fn default_outbound_queue() -> usize {
    256
}
fn default_max_sessions() -> usize {
    64
}
fn default_rc_dir() -> String {
    "~/.persh/rc".to_string()
}

/// Values given on the command line; `None` keeps the file's value.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub bind: Option<IpAddr>,
    pub port: Option<u16>,
    pub shell: Option<String>,
    pub max_sessions: Option<usize>,
    pub scrollback_bytes: Option<usize>,
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub rc_dir: PathBuf,
    pub session: SessionOptions,
}

impl ServerConfig {
    /// Load config from a TOML file, then apply CLI overrides.
    ///
    /// A missing file means defaults.
    pub fn load(config_path: Option<&Path>, cli: CliOverrides) -> PershResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Self::from_file(file_config, cli)
    }

    fn from_file(file: ConfigFile, cli: CliOverrides) -> PershResult<Self> {
        let server = file.server;
        let session = file.session;

        let listen_addr = SocketAddr::new(
            cli.bind.unwrap_or(server.bind),
            cli.port.unwrap_or(server.port),
        );
        let shell = cli.shell.unwrap_or(session.shell);
        if shell.trim().is_empty() {
            return Err(PershError::Config("shell must not be empty".into()));
        }
        let (cols, rows) = (session.cols, session.rows);
        if cols == 0 || rows == 0 {
            return Err(PershError::Config(format!(
                "terminal size must be non-zero, got {cols}x{rows}"
            )));
        }

        Ok(Self {
            listen_addr,
            rc_dir: expand_tilde_str(&session.rc_dir),
            session: SessionOptions {
                shell: ShellRequest {
                    shell,
                    flags: session.shell_flags,
                    extra_path: session
                        .extra_path
                        .iter()
                        .map(|p| expand_tilde_str(p))
                        .collect(),
                    prompt: session.prompt,
                },
                scrollback_bytes: cli.scrollback_bytes.unwrap_or(session.scrollback_bytes),
                cols,
                rows,
                outbound_queue: session.outbound_queue,
                max_sessions: cli.max_sessions.unwrap_or(session.max_sessions),
            },
        })
    }
}

fn parse(content: &str) -> PershResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| PershError::Config(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
