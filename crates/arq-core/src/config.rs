use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Transport tuning (optional section in config.toml).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Hard ceiling on a single transfer in seconds.
    pub request_timeout_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            request_timeout_secs: 3600,
        }
    }
}

/// Global configuration loaded from `~/.config/arq/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArqConfig {
    /// Maximum jobs admitted to the download phase at once.
    pub max_active_downloads: usize,
    /// Maximum jobs admitted to the upload phase at once (preparing or
    /// handed to the transport).
    pub max_active_uploads: usize,
    /// Attempts ceiling per phase; a job whose counter reaches it is no
    /// longer admitted.
    pub max_attempts: u32,
    /// Where staged downloads are written. Defaults to the XDG state dir.
    #[serde(default)]
    pub staging_dir: Option<PathBuf>,
    /// Root directory the filesystem asset store resolves local refs
    /// against. Defaults to the current directory.
    #[serde(default)]
    pub asset_root: Option<PathBuf>,
    /// Optional transport tuning; if missing, built-in defaults are used.
    #[serde(default)]
    pub transport: Option<TransportConfig>,
}

impl Default for ArqConfig {
    fn default() -> Self {
        Self {
            max_active_downloads: 5,
            max_active_uploads: 3,
            max_attempts: 3,
            staging_dir: None,
            asset_root: None,
            transport: None,
        }
    }
}

impl ArqConfig {
    /// Transport tuning with defaults filled in.
    pub fn transport(&self) -> TransportConfig {
        self.transport.clone().unwrap_or_default()
    }
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("arq")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<ArqConfig> {
    let path = config_path()?;
    if !path.exists() {
        let default_cfg = ArqConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }

    let data = fs::read_to_string(&path)?;
    let cfg: ArqConfig = toml::from_str(&data)?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let cfg = ArqConfig::default();
        assert_eq!(cfg.max_active_downloads, 5);
        assert_eq!(cfg.max_active_uploads, 3);
        assert_eq!(cfg.max_attempts, 3);
        assert!(cfg.staging_dir.is_none());
        assert!(cfg.transport.is_none());
    }

    #[test]
    fn config_toml_roundtrip() {
        let cfg = ArqConfig::default();
        let toml = toml::to_string_pretty(&cfg).unwrap();
        let parsed: ArqConfig = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.max_active_downloads, cfg.max_active_downloads);
        assert_eq!(parsed.max_active_uploads, cfg.max_active_uploads);
        assert_eq!(parsed.max_attempts, cfg.max_attempts);
    }

    #[test]
    fn config_toml_custom_values() {
        let toml = r#"
            max_active_downloads = 2
            max_active_uploads = 1
            max_attempts = 5
            staging_dir = "/var/tmp/arq"
        "#;
        let cfg: ArqConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.max_active_downloads, 2);
        assert_eq!(cfg.max_active_uploads, 1);
        assert_eq!(cfg.max_attempts, 5);
        assert_eq!(cfg.staging_dir.as_deref(), Some(std::path::Path::new("/var/tmp/arq")));
        assert!(cfg.asset_root.is_none());
    }

    #[test]
    fn config_toml_transport_section() {
        let toml = r#"
            max_active_downloads = 5
            max_active_uploads = 3
            max_attempts = 3

            [transport]
            connect_timeout_secs = 10
            request_timeout_secs = 600
        "#;
        let cfg: ArqConfig = toml::from_str(toml).unwrap();
        let t = cfg.transport();
        assert_eq!(t.connect_timeout_secs, 10);
        assert_eq!(t.request_timeout_secs, 600);

        // Missing section falls back to defaults.
        let t = ArqConfig::default().transport();
        assert_eq!(t.connect_timeout_secs, 30);
        assert_eq!(t.request_timeout_secs, 3600);
    }
}
