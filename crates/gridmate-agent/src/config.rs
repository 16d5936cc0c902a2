use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Daemon configuration, loaded from `config.toml` in the state
/// directory. Every field has a default so a missing file just means
/// defaults.
#[derive(Deserialize, Debug, Clone)]
pub struct AgentConfig {
    /// TCP port the management RPC server listens on.
    #[serde(default = "default_rpc_port")]
    pub rpc_port: u16,
    /// Bind on all interfaces instead of loopback only. Remote callers
    /// always have to authenticate.
    #[serde(default)]
    pub allow_remote_rpc: bool,
    /// Version descriptor endpoint; empty disables the check.
    #[serde(default = "default_version_check_url")]
    pub version_check_url: String,
    /// Platform string reported to coordination servers. Defaults to a
    /// `<arch>-<os>` pair detected at startup.
    #[serde(default = "default_platform")]
    pub platform: String,
}

impl AgentConfig {
    pub fn load(state_dir: &Path) -> Result<Self> {
        let path = state_dir.join("config.toml");
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str(&contents).with_context(|| format!("invalid {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            rpc_port: default_rpc_port(),
            allow_remote_rpc: false,
            version_check_url: default_version_check_url(),
            platform: default_platform(),
        }
    }
}

fn default_rpc_port() -> u16 {
    24_680
}

fn default_version_check_url() -> String {
    "https://download.gridmate.dev/versions.json".to_string()
}

fn default_platform() -> String {
    format!("{}-{}", std::env::consts::ARCH, std::env::consts::OS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig::load(dir.path()).unwrap();
        assert_eq!(config.rpc_port, 24_680);
        assert!(!config.allow_remote_rpc);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.toml"), "rpc_port = 9000\n").unwrap();
        let config = AgentConfig::load(dir.path()).unwrap();
        assert_eq!(config.rpc_port, 9000);
        assert!(!config.version_check_url.is_empty());
    }
}
