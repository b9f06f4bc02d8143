//! Central path resolution for all FolioChat data files.
//!
//! Resolved once at startup from: CLI `--data-dir` > `FOLIOCHAT_DATA_DIR` env > `~/.foliochat`.
//! Callsites take a `DataDir` instead of constructing paths from `HOME`.

use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Priority: `explicit` arg > `FOLIOCHAT_DATA_DIR` env > `~/.foliochat` default.
    pub fn resolve(explicit: Option<&Path>) -> anyhow::Result<Self> {
        let root = if let Some(p) = explicit {
            p.to_path_buf()
        } else if let Ok(env_val) = std::env::var("FOLIOCHAT_DATA_DIR") {
            PathBuf::from(env_val)
        } else {
            dirs::home_dir()
                .ok_or_else(|| anyhow::anyhow!("HOME directory not found"))?
                .join(".foliochat")
        };
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn db_path(&self) -> PathBuf {
        self.root.join("foliochat.db")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    /// Create the root and log directories if missing.
    pub fn ensure_dirs(&self) -> io::Result<()> {
        std::fs::create_dir_all(self.log_dir())
    }
}
