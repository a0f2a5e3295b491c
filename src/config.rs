//! Configuration for the daemon and the client.
//!
//! Both read an optional TOML file; every field has a default. Environment
//! variables override the file, and command-line flags override both.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, SyncError};
use crate::protocol::timeouts;

pub const DEFAULT_ADDR: &str = "127.0.0.1:7070";

fn load_toml<T: for<'de> Deserialize<'de> + Default>(path: Option<&Path>) -> Result<T> {
    let Some(path) = path else {
        return Ok(T::default());
    };
    tracing::debug!(path = %path.display(), "loading config");
    let contents = std::fs::read_to_string(path)
        .map_err(|e| SyncError::Config(format!("{}: {e}", path.display())))?;
    toml::from_str(&contents).map_err(|e| SyncError::Config(format!("{}: {e}", path.display())))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub base_dir: PathBuf,
    pub idle_timeout_ms: u64,
    /// Apply reconciliation fixes at startup instead of only reporting.
    pub repair_on_start: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_ADDR.to_string(),
            base_dir: PathBuf::from("server_files"),
            idle_timeout_ms: timeouts::IDLE_MS,
            repair_on_start: false,
        }
    }
}

impl ServerConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config: Self = load_toml(path)?;
        if let Ok(bind) = std::env::var("FILESYNC_BIND") {
            config.bind = bind;
        }
        if let Ok(dir) = std::env::var("FILESYNC_SERVER_DIR") {
            config.base_dir = PathBuf::from(dir);
        }
        Ok(config)
    }

    pub fn layout(&self) -> ServerLayout {
        ServerLayout::new(&self.base_dir)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server: String,
    pub base_dir: PathBuf,
    pub idle_timeout_ms: u64,
    pub progress: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: DEFAULT_ADDR.to_string(),
            base_dir: PathBuf::from("client_files"),
            idle_timeout_ms: timeouts::IDLE_MS,
            progress: true,
        }
    }
}

impl ClientConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config: Self = load_toml(path)?;
        if let Ok(server) = std::env::var("FILESYNC_SERVER") {
            config.server = server;
        }
        Ok(config)
    }

    pub fn layout(&self) -> ClientLayout {
        ClientLayout::new(&self.base_dir)
    }
}

/// On-disk layout of the daemon: `tmp/`, `files/`, `files.db`.
#[derive(Debug, Clone)]
pub struct ServerLayout {
    pub scratch: PathBuf,
    pub content: PathBuf,
    pub database: PathBuf,
}

impl ServerLayout {
    pub fn new(base: &Path) -> Self {
        Self {
            scratch: base.join("tmp"),
            content: base.join("files"),
            database: base.join("files.db"),
        }
    }

    pub async fn create(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.scratch).await?;
        tokio::fs::create_dir_all(&self.content).await?;
        Ok(())
    }
}

/// On-disk layout of the client: `tmp/` and `downloads/`.
#[derive(Debug, Clone)]
pub struct ClientLayout {
    pub scratch: PathBuf,
    pub downloads: PathBuf,
}

impl ClientLayout {
    pub fn new(base: &Path) -> Self {
        Self {
            scratch: base.join("tmp"),
            downloads: base.join("downloads"),
        }
    }

    pub async fn create(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.scratch).await?;
        tokio::fs::create_dir_all(&self.downloads).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_means_defaults() {
        let server: ServerConfig = load_toml(None).unwrap();
        assert_eq!(server.bind, DEFAULT_ADDR);
        assert_eq!(server.base_dir, PathBuf::from("server_files"));
        assert_eq!(server.idle_timeout_ms, timeouts::IDLE_MS);
        assert!(!server.repair_on_start);

        let client: ClientConfig = load_toml(None).unwrap();
        assert_eq!(client.server, DEFAULT_ADDR);
        assert!(client.progress);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("filesyncd.toml");
        std::fs::write(&path, "bind = \"0.0.0.0:9000\"\nrepair_on_start = true\n").unwrap();
        let config: ServerConfig = load_toml(Some(&path)).unwrap();
        assert_eq!(config.bind, "0.0.0.0:9000");
        assert!(config.repair_on_start);
        assert_eq!(config.base_dir, PathBuf::from("server_files"));
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "bind = [").unwrap();
        let err = load_toml::<ClientConfig>(Some(&path)).unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[test]
    fn layouts_derive_from_base_dir() {
        let server = ServerLayout::new(Path::new("srv"));
        assert_eq!(server.scratch, PathBuf::from("srv/tmp"));
        assert_eq!(server.content, PathBuf::from("srv/files"));
        assert_eq!(server.database, PathBuf::from("srv/files.db"));
        let client = ClientLayout::new(Path::new("cli"));
        assert_eq!(client.downloads, PathBuf::from("cli/downloads"));
    }
}
