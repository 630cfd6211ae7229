//! Daemon configuration.
//!
//! Loaded from TOML or JSON depending on the file extension. Every field
//! has a default so a minimal config only names what it changes.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use coffer_store::{DiscSet, StoreBackend};

use crate::error::{ServerError, ServerResult};

/// One striped disc group in the configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscSetConfig {
    /// Root directories of the discs in the set.
    pub dirs: Vec<PathBuf>,
    /// Storage block size in bytes.
    pub block_size: u64,
}

/// TLS material for the listener.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TlsFiles {
    /// PEM file with the CA certificate(s) used to verify clients.
    pub ca_cert: PathBuf,
    /// PEM file with the server certificate chain.
    pub cert_chain: PathBuf,
    /// PEM file with the server private key.
    pub private_key: PathBuf,
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the TLS listener binds to.
    pub bind_addr: String,
    /// Path of the account database file.
    pub account_db: PathBuf,
    /// Configured disc sets, indexed by position.
    pub disc_sets: Vec<DiscSetConfig>,
    /// TLS certificate and key files.
    pub tls: TlsFiles,
    /// Seconds between housekeeping passes.
    pub housekeeping_interval_secs: u64,
    /// Seconds a session may spend streaming one file before the operation
    /// is abandoned.
    pub operation_timeout_secs: u64,
    /// Optional unix socket accepting the line-oriented control protocol
    /// (`h`, `t`, `r<hex>`), for operators and external tooling.
    pub control_socket: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:10301".to_string(),
            account_db: PathBuf::from("/etc/coffer/accounts.txt"),
            disc_sets: Vec::new(),
            tls: TlsFiles::default(),
            housekeeping_interval_secs: 3600,
            operation_timeout_secs: 300,
            control_socket: None,
        }
    }
}

impl ServerConfig {
    /// Loads a configuration file, choosing the parser by extension.
    pub fn from_file(path: &Path) -> ServerResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)
                .map_err(|e| ServerError::Config(format!("{}: {e}", path.display()))),
            "json" => serde_json::from_str(&contents)
                .map_err(|e| ServerError::Config(format!("{}: {e}", path.display()))),
            other => Err(ServerError::Config(format!(
                "unsupported config extension '{other}'"
            ))),
        }
    }

    /// Builds the store backend described by `disc_sets`.
    pub fn build_backend(&self) -> ServerResult<StoreBackend> {
        if self.disc_sets.is_empty() {
            return Err(ServerError::Config(
                "at least one disc set must be configured".into(),
            ));
        }
        let sets = self
            .disc_sets
            .iter()
            .map(|c| DiscSet::new(c.dirs.clone(), c.block_size))
            .collect();
        Ok(StoreBackend::new(sets))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.housekeeping_interval_secs, 3600);
        assert!(config.disc_sets.is_empty());
        assert!(config.build_backend().is_err());
    }

    #[test]
    fn test_from_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
bind_addr = "127.0.0.1:1234"
account_db = "/tmp/accounts.txt"
housekeeping_interval_secs = 60

[[disc_sets]]
dirs = ["/srv/d0", "/srv/d1", "/srv/d2"]
block_size = 4096
"#
        )
        .unwrap();

        let config = ServerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:1234");
        assert_eq!(config.housekeeping_interval_secs, 60);
        assert_eq!(config.disc_sets.len(), 1);
        let backend = config.build_backend().unwrap();
        assert_eq!(backend.disc_set_count(), 1);
        assert!(backend.disc_set(0).unwrap().striping_enabled());
    }

    #[test]
    fn test_from_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{
                "bind_addr": "127.0.0.1:9000",
                "disc_sets": [{{"dirs": ["/srv/one"], "block_size": 2048}}]
            }}"#
        )
        .unwrap();
        let config = ServerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:9000");
        assert_eq!(config.disc_sets[0].block_size, 2048);
    }

    #[test]
    fn test_unknown_extension_rejected() {
        let mut file = NamedTempFile::with_suffix(".yaml").unwrap();
        writeln!(file, "bind_addr: nope").unwrap();
        assert!(matches!(
            ServerConfig::from_file(file.path()),
            Err(ServerError::Config(_))
        ));
    }
}
