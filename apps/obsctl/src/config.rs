//! obsctl configuration management.
//!
//! Configuration is stored as TOML:
//! - Linux/macOS: `~/.config/obsctl/obsctl.toml`
//! - Windows: `%APPDATA%/obsctl/obsctl.toml`

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub task: TaskConfig,

    #[serde(default)]
    pub log: LogConfig,
}

/// Backend the transfers run against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Root directory of the local object store.
    #[serde(default = "default_store_root")]
    pub root: PathBuf,
}

/// Transfer tunables; every one can be overridden on the command line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    #[serde(default = "default_partsize")]
    pub partsize: String,

    /// Files smaller than this go up in a single part.
    #[serde(default = "default_part_threshold")]
    pub part_threshold: String,

    /// Files transferred at once.
    #[serde(default = "default_tasknum")]
    pub tasknum: usize,

    /// Parts transferred at once within one file.
    #[serde(default = "default_parttasknum")]
    pub parttasknum: usize,

    #[serde(default = "default_true")]
    pub checkpoint: bool,

    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,

    /// Aggregate byte rate ceiling ("0" = unlimited).
    #[serde(default = "default_flowwidth")]
    pub flowwidth: String,

    /// JSON time-of-day rate table; takes precedence over `flowwidth`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flowpolicy: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
}

fn default_store_root() -> PathBuf {
    home_dir().join(".obsctl").join("store")
}

fn default_partsize() -> String {
    "5M".into()
}

fn default_part_threshold() -> String {
    "10M".into()
}

fn default_tasknum() -> usize {
    4
}

fn default_parttasknum() -> usize {
    8
}

fn default_true() -> bool {
    true
}

fn default_checkpoint_dir() -> PathBuf {
    home_dir().join(".obsctl").join("checkpoint")
}

fn default_flowwidth() -> String {
    "0".into()
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: default_store_root(),
        }
    }
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            partsize: default_partsize(),
            part_threshold: default_part_threshold(),
            tasknum: default_tasknum(),
            parttasknum: default_parttasknum(),
            checkpoint: default_true(),
            checkpoint_dir: default_checkpoint_dir(),
            flowwidth: default_flowwidth(),
            flowpolicy: None,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Loads configuration from `path` (or the per-user default), creating
    /// it with defaults if not found.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => config_path(),
        };

        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }
}

/// Returns the platform-specific configuration file path.
fn config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let appdata = std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(home_dir);
        appdata.join("obsctl").join("obsctl.toml")
    }

    #[cfg(not(target_os = "windows"))]
    {
        home_dir().join(".config").join("obsctl").join("obsctl.toml")
    }
}
