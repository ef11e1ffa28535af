//! Shell environment customization.
//!
//! Turns a requested shell, extra PATH entries and prompt into a concrete
//! argv + environment + generated rc files, without touching the user's own
//! shell configuration. Generated files are content-addressed, so the same
//! request always produces the same launch spec.

use crate::error::{PershError, PershResult};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// What the caller wants the shell to look like.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellRequest {
    /// Shell program (name or absolute path).
    pub shell: String,
    /// Extra arguments passed before any generated ones.
    pub flags: Vec<String>,
    /// Directories prepended to PATH, in order.
    pub extra_path: Vec<PathBuf>,
    /// Prompt string (PS1 / PROMPT), if any.
    pub prompt: Option<String>,
}

/// A file that must exist before the shell starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedFile {
    pub path: PathBuf,
    pub contents: String,
}

/// Concrete launch instructions for a PTY process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchSpec {
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub files: Vec<GeneratedFile>,
}

impl LaunchSpec {
    /// A launch spec that runs `argv` as-is with no extra environment.
    pub fn command<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Write every generated file to disk. Files whose contents already
    /// match are left alone.
    pub fn write_files(&self) -> PershResult<()> {
        for file in &self.files {
            if let Ok(existing) = std::fs::read_to_string(&file.path) {
                if existing == file.contents {
                    continue;
                }
            }
            if let Some(parent) = file.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&file.path, &file.contents)?;
            debug!(path = %file.path.display(), "wrote shell rc file");
        }
        Ok(())
    }
}

/// Builds the launch spec for a session's shell.
///
/// Implementations must not do network I/O and must be deterministic.
pub trait EnvironmentCustomizer: Send + Sync {
    fn customize(&self, request: &ShellRequest) -> PershResult<LaunchSpec>;
}

/// Default customizer: rc files for bash and zsh, plain environment for
/// everything else.
#[derive(Debug, Clone)]
pub struct RcCustomizer {
    rc_dir: PathBuf,
    base_path: String,
}

impl RcCustomizer {
    /// Create a customizer that writes rc files under `rc_dir` and extends
    /// the current process PATH.
    pub fn new(rc_dir: impl Into<PathBuf>) -> Self {
        Self::with_base_path(rc_dir, std::env::var("PATH").unwrap_or_default())
    }

    pub fn with_base_path(rc_dir: impl Into<PathBuf>, base_path: impl Into<String>) -> Self {
        Self {
            rc_dir: rc_dir.into(),
            base_path: base_path.into(),
        }
    }

    fn path_value(&self, extra: &[PathBuf]) -> PershResult<String> {
        let mut entries: Vec<PathBuf> = extra.to_vec();
        entries.extend(std::env::split_paths(&self.base_path));
        let joined = std::env::join_paths(entries)
            .map_err(|e| PershError::ProcessSpawn(format!("invalid PATH entry: {e}")))?;
        Ok(joined.to_string_lossy().into_owned())
    }

    fn bash(&self, request: &ShellRequest, path: &str) -> LaunchSpec {
        // A login bash never reads --rcfile, so login startup is done by the rc.
        let (login, flags): (Vec<&String>, Vec<&String>) = request
            .flags
            .iter()
            .partition(|f| matches!(f.as_str(), "-l" | "--login"));

        let mut rc = String::from("# generated by persh\n");
        if login.is_empty() {
            rc.push_str("[ -f \"$HOME/.bashrc\" ] && . \"$HOME/.bashrc\"\n");
        } else {
            rc.push_str(BASH_LOGIN_STARTUP);
        }
        rc.push_str(&format!("export PATH={}\n", shell_quote(path)));
        if let Some(prompt) = &request.prompt {
            rc.push_str(&format!("PS1={}\n", shell_quote(prompt)));
        }

        let rc_path = self.rc_dir.join(format!("bashrc-{}", content_hash(&rc)));
        // bash only accepts long options before any short one.
        let mut argv = vec![
            request.shell.clone(),
            "--rcfile".into(),
            rc_path.to_string_lossy().into_owned(),
        ];
        argv.extend(flags.into_iter().cloned());
        argv.push("-i".into());

        let mut env = base_env();
        env.insert("PATH".into(), path.to_string());
        LaunchSpec {
            argv,
            env,
            files: vec![GeneratedFile {
                path: rc_path,
                contents: rc,
            }],
        }
    }

    fn zsh(&self, request: &ShellRequest, path: &str) -> LaunchSpec {
        let mut rc = String::from("# generated by persh\n");
        rc.push_str("[ -f \"$HOME/.zshrc\" ] && ZDOTDIR=\"$HOME\" . \"$HOME/.zshrc\"\n");
        rc.push_str(&format!("export PATH={}\n", shell_quote(path)));
        if let Some(prompt) = &request.prompt {
            rc.push_str(&format!("PROMPT={}\n", shell_quote(prompt)));
        }

        let zdotdir = self.rc_dir.join(format!("zsh-{}", content_hash(&rc)));
        let mut argv = vec![request.shell.clone()];
        argv.extend(request.flags.iter().cloned());

        let mut env = base_env();
        env.insert("PATH".into(), path.to_string());
        env.insert("ZDOTDIR".into(), zdotdir.to_string_lossy().into_owned());
        LaunchSpec {
            argv,
            env,
            files: vec![GeneratedFile {
                path: zdotdir.join(".zshrc"),
                contents: rc,
            }],
        }
    }

    fn plain(&self, request: &ShellRequest, path: &str) -> LaunchSpec {
        let mut argv = vec![request.shell.clone()];
        argv.extend(request.flags.iter().cloned());

        let mut env = base_env();
        env.insert("PATH".into(), path.to_string());
        if let Some(prompt) = &request.prompt {
            env.insert("PS1".into(), prompt.clone());
        }
        LaunchSpec {
            argv,
            env,
            files: Vec::new(),
        }
    }
}

impl EnvironmentCustomizer for RcCustomizer {
    fn customize(&self, request: &ShellRequest) -> PershResult<LaunchSpec> {
        if request.shell.trim().is_empty() {
            return Err(PershError::ProcessSpawn("no shell configured".into()));
        }
        let path = self.path_value(&request.extra_path)?;
        let spec = match shell_kind(&request.shell) {
            "bash" => self.bash(request, &path),
            "zsh" => self.zsh(request, &path),
            _ => self.plain(request, &path),
        };
        debug!(argv = ?spec.argv, files = spec.files.len(), "built shell launch spec");
        Ok(spec)
    }
}

/// What bash runs at login: the system profile, then the first user profile found.
const BASH_LOGIN_STARTUP: &str = r#"[ -f /etc/profile ] && . /etc/profile
for f in "$HOME/.bash_profile" "$HOME/.bash_login" "$HOME/.profile"; do
  if [ -f "$f" ]; then . "$f"; break; fi
done
unset f
"#;

fn base_env() -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("TERM".into(), "xterm-256color".into());
    env
}

fn shell_kind(shell: &str) -> &str {
    Path::new(shell)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(shell)
}

/// Single-quote a value for POSIX shells.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn content_hash(contents: &str) -> String {
    let digest = Sha256::digest(contents.as_bytes());
    hex::encode(&digest[..8])
}
