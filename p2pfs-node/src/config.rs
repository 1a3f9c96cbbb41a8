//! Load config from file and environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::node::NodeOptions;

/// Node configuration. File: ~/.config/p2pfs/config.toml or /etc/p2pfs/config.toml.
/// Env overrides: P2PFS_LISTEN_ADDR, P2PFS_DATA_DIR, P2PFS_BOOTSTRAP, P2PFS_BOOTSTRAP_URL,
/// P2PFS_IO_TIMEOUT_SECS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    /// TCP listen address (default 0.0.0.0:7070; port 0 picks any free port).
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Root of `chunks/` and `metadata/` (default ./p2pfs-data).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Per send/receive deadline in seconds (default 10).
    #[serde(default = "default_io_timeout_secs")]
    pub io_timeout_secs: u64,
    /// Outbound connect deadline in seconds (default 10).
    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,
    /// Bootstrap peer address registered on startup.
    #[serde(default)]
    pub bootstrap: Option<String>,
    /// HTTP bootstrap server used by `push` and `pull`, e.g. `http://10.0.0.1:8080`.
    #[serde(default)]
    pub bootstrap_url: Option<String>,
}

fn default_listen_addr() -> String {
    "0.0.0.0:7070".to_owned()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./p2pfs-data")
}
fn default_io_timeout_secs() -> u64 {
    10
}
fn default_dial_timeout_secs() -> u64 {
    10
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            data_dir: default_data_dir(),
            io_timeout_secs: default_io_timeout_secs(),
            dial_timeout_secs: default_dial_timeout_secs(),
            bootstrap: None,
            bootstrap_url: None,
        }
    }
}

impl NodeConfig {
    pub fn node_options(&self) -> NodeOptions {
        NodeOptions {
            listen_addr: self.listen_addr.clone(),
            io_timeout: Duration::from_secs(self.io_timeout_secs),
            dial_timeout: Duration::from_secs(self.dial_timeout_secs),
        }
    }

    /// Apply overrides from `lookup` (the process environment in `load`).
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(s) = lookup("P2PFS_LISTEN_ADDR") {
            self.listen_addr = s;
        }
        if let Some(s) = lookup("P2PFS_DATA_DIR") {
            self.data_dir = PathBuf::from(s);
        }
        if let Some(s) = lookup("P2PFS_BOOTSTRAP") {
            self.bootstrap = Some(s).filter(|s| !s.is_empty());
        }
        if let Some(s) = lookup("P2PFS_BOOTSTRAP_URL") {
            self.bootstrap_url = Some(s).filter(|s| !s.is_empty());
        }
        if let Some(s) = lookup("P2PFS_IO_TIMEOUT_SECS") {
            match s.parse::<u64>() {
                Ok(secs) => self.io_timeout_secs = secs,
                Err(_) => tracing::warn!(value = %s, "ignoring invalid P2PFS_IO_TIMEOUT_SECS"),
            }
        }
    }
}

/// Load config: an explicit file must exist and parse; otherwise merge default,
/// then the first config file found (if any), then env vars.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<NodeConfig> {
    let mut c = match explicit {
        Some(path) => read_file(path)?,
        None => load_file().unwrap_or_default(),
    };
    c.apply_overrides(|key| std::env::var(key).ok());
    Ok(c)
}

fn read_file(path: &Path) -> anyhow::Result<NodeConfig> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing config {}", path.display()))
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/p2pfs/config.toml"));
    }
    out.push(PathBuf::from("/etc/p2pfs/config.toml"));
    out
}

fn load_file() -> Option<NodeConfig> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    match read_file(&path) {
        Ok(c) => Some(c),
        Err(e) => {
            tracing::warn!(error = %format!("{e:#}"), "ignoring config file");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults() {
        let c = NodeConfig::default();
        assert_eq!(c.listen_addr, "0.0.0.0:7070");
        assert_eq!(c.node_options().io_timeout, Duration::from_secs(10));
        assert!(c.bootstrap.is_none());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let c: NodeConfig = toml::from_str("listen_addr = \"127.0.0.1:9000\"").unwrap();
        assert_eq!(c.listen_addr, "127.0.0.1:9000");
        assert_eq!(c.dial_timeout_secs, 10);
        assert_eq!(c.data_dir, PathBuf::from("./p2pfs-data"));
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(toml::from_str::<NodeConfig>("proxy_port = 3128").is_err());
    }

    #[test]
    fn env_overrides() {
        let env: HashMap<&str, &str> = [
            ("P2PFS_LISTEN_ADDR", "127.0.0.1:0"),
            ("P2PFS_BOOTSTRAP", "10.1.1.1:7070"),
            ("P2PFS_IO_TIMEOUT_SECS", "3"),
            ("P2PFS_BOOTSTRAP_URL", "http://10.1.1.1:8080"),
        ]
        .into_iter()
        .collect();
        let mut c = NodeConfig::default();
        c.apply_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.listen_addr, "127.0.0.1:0");
        assert_eq!(c.bootstrap.as_deref(), Some("10.1.1.1:7070"));
        assert_eq!(c.io_timeout_secs, 3);
        assert_eq!(c.bootstrap_url.as_deref(), Some("http://10.1.1.1:8080"));
    }

    #[test]
    fn invalid_numeric_override_is_ignored() {
        let mut c = NodeConfig::default();
        c.apply_overrides(|k| (k == "P2PFS_IO_TIMEOUT_SECS").then(|| "soon".to_owned()));
        assert_eq!(c.io_timeout_secs, 10);
    }

    #[test]
    fn explicit_file_errors_surface() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(Some(&dir.path().join("missing.toml"))).is_err());

        let path = dir.path().join("node.toml");
        std::fs::write(&path, "data_dir = \"/srv/p2pfs\"\nio_timeout_secs = 4\n").unwrap();
        let c = read_file(&path).unwrap();
        assert_eq!(c.data_dir, PathBuf::from("/srv/p2pfs"));
        assert_eq!(c.io_timeout_secs, 4);
    }
}
