//! Client configuration at `~/.persh/client.toml`.
//!
//! Provides the default server host and port. CLI flags always override
//! config file values.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::Ipv6Addr;
use std::path::Path;
use tracing::debug;
use url::Url;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Default connection settings.
    #[serde(default)]
    pub default: DefaultConfig,
}

/// Default connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DefaultConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for DefaultConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7681
}

impl Config {
    /// Load configuration from a TOML file, returning defaults if the file
    /// does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;

        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }
}

/// What to attach to, and how big the local terminal is.
#[derive(Debug, Clone, Default)]
pub struct AttachTarget {
    pub session_id: Option<String>,
    pub name: Option<String>,
    pub cwd: Option<String>,
    pub cols: u16,
    pub rows: u16,
}

/// Build the WebSocket URL for an attach request.
pub fn attach_url(host: &str, port: u16, target: &AttachTarget) -> Result<Url> {
    if host.is_empty() {
        anyhow::bail!("empty host");
    }
    let authority = if host.parse::<Ipv6Addr>().is_ok() {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    };
    let mut url = Url::parse(&format!("ws://{authority}/"))
        .with_context(|| format!("invalid server address {authority}"))?;
    {
        let mut query = url.query_pairs_mut();
        if let Some(id) = &target.session_id {
            query.append_pair("session_id", id);
        }
        if let Some(name) = &target.name {
            query.append_pair("name", name);
        }
        if let Some(cwd) = &target.cwd {
            query.append_pair("cwd", cwd);
        }
        query.append_pair("cols", &target.cols.to_string());
        query.append_pair("rows", &target.rows.to_string());
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.default.host, "127.0.0.1");
        assert_eq!(cfg.default.port, 7681);
    }

    #[test]
    fn parse_partial_toml_config() {
        let cfg: Config = toml::from_str("[default]\nhost = \"devbox\"\n").unwrap();
        assert_eq!(cfg.default.host, "devbox");
        assert_eq!(cfg.default.port, 7681);
    }

    #[test]
    fn load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load(&dir.path().join("client.toml")).unwrap();
        assert_eq!(cfg.default.port, 7681);
    }

    #[test]
    fn load_rejects_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.toml");
        std::fs::write(&path, "[default]\nport = \"x\"\n").unwrap();
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn url_for_new_session() {
        let target = AttachTarget {
            name: Some("build box".into()),
            cwd: Some("/srv/app".into()),
            cols: 132,
            rows: 43,
            ..AttachTarget::default()
        };
        let url = attach_url("localhost", 7681, &target).unwrap();
        assert_eq!(url.scheme(), "ws");
        assert_eq!(url.port(), Some(7681));

        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("name".to_string(), "build box".to_string()),
                ("cwd".to_string(), "/srv/app".to_string()),
                ("cols".to_string(), "132".to_string()),
                ("rows".to_string(), "43".to_string()),
            ]
        );
    }

    #[test]
    fn url_for_reattach() {
        let target = AttachTarget {
            session_id: Some("12".into()),
            cols: 80,
            rows: 24,
            ..AttachTarget::default()
        };
        let url = attach_url("10.0.0.5", 9000, &target).unwrap();
        assert_eq!(url.as_str(), "ws://10.0.0.5:9000/?session_id=12&cols=80&rows=24");
    }

    #[test]
    fn url_for_ipv6_host() {
        let target = AttachTarget {
            cols: 80,
            rows: 24,
            ..AttachTarget::default()
        };
        let url = attach_url("::1", 7681, &target).unwrap();
        assert_eq!(url.host_str(), Some("[::1]"));
        assert_eq!(url.port(), Some(7681));
        assert_eq!(url.as_str(), "ws://[::1]:7681/?cols=80&rows=24");

        let bracketed = attach_url("[fe80::2]", 9000, &target).unwrap();
        assert_eq!(bracketed.host_str(), Some("[fe80::2]"));
    }

    #[test]
    fn empty_host_fails() {
        assert!(attach_url("", 7681, &AttachTarget::default()).is_err());
    }
}
