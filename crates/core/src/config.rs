//! Node configuration
//!
//! Read from `huddle.toml` in the platform config directory. Every field is
//! optional; command-line flags override whatever the file says.

use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

pub const CONFIG_FILE: &str = "huddle.toml";
pub const DEFAULT_LISTEN_PORT: u16 = 7340;
pub const DEFAULT_SNAPSHOT_EVERY: u64 = 200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Room path, normalized into a room id at startup
    pub room: String,
    /// Port to accept peers on; `None` disables listening
    pub listen_port: Option<u16>,
    /// Peer URLs to dial (`huddle://host:port/room`)
    pub peers: Vec<String>,
    /// Shared secret peers must present
    pub secret: Option<String>,
    /// Where the database lives; defaults to the platform data directory
    pub data_dir: Option<PathBuf>,
    /// Persisted updates between snapshots
    pub snapshot_every: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            room: String::new(),
            listen_port: Some(DEFAULT_LISTEN_PORT),
            peers: Vec::new(),
            secret: None,
            data_dir: None,
            snapshot_every: DEFAULT_SNAPSHOT_EVERY,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    /// Load from `path`, or the default location, falling back to defaults
    /// when no file exists
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match project_dirs() {
                Ok(dirs) => dirs.config_dir().join(CONFIG_FILE),
                Err(_) => return Ok(Self::default()),
            },
        };

        if path.exists() {
            Self::load(&path)
        } else {
            info!(path = %path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Directory holding the database
    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(project_dirs()?.data_dir().to_path_buf()),
        }
    }
}

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("dev", "huddle", "huddle").ok_or_else(|| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "Could not determine data directory",
        ))
    })
}
