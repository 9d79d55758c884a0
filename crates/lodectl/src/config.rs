//! Service configuration, loaded from a YAML file.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Path to the tabular manifest file.
    pub manifest: PathBuf,
    /// DSN of the internal relational store.
    pub internal_dsn: String,
    /// Path of the keymap store.
    pub keymap: PathBuf,
    /// External SQL sources: backend name -> DSN.
    #[serde(default)]
    pub backends: BTreeMap<String, String>,
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    #[serde(default)]
    pub accesslog: AccessLogConfig,
    /// Scopes granted to every request. Absent means no authorization
    /// server: anonymous requests see open nodes only and bearer
    /// tokens are rejected.
    #[serde(default)]
    pub scopes: Option<Vec<String>>,
    /// Default push state path.
    #[serde(default)]
    pub push_state: Option<PathBuf>,
    /// Default client credentials file for push.
    #[serde(default)]
    pub credentials: Option<PathBuf>,
}

fn default_listen() -> SocketAddr {
    "127.0.0.1:8000".parse().expect("static address is valid")
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields, rename_all = "lowercase", tag = "sink")]
pub enum AccessLogConfig {
    #[default]
    Stdout,
    File {
        path: PathBuf,
        #[serde(default = "default_buffer")]
        buffer_size: usize,
    },
    Null,
}

fn default_buffer() -> usize {
    100
}

impl AccessLogConfig {
    pub fn buffer_size(&self) -> usize {
        match self {
            AccessLogConfig::File { buffer_size, .. } => *buffer_size,
            _ => 1,
        }
    }

    pub fn sink(&self) -> anyhow::Result<Box<dyn accesslog::Sink>> {
        Ok(match self {
            AccessLogConfig::Stdout => Box::new(accesslog::StdoutSink),
            AccessLogConfig::Null => Box::new(accesslog::NullSink),
            AccessLogConfig::File { path, .. } => Box::new(
                accesslog::FileSink::open(path)
                    .with_context(|| format!("opening access log {}", path.display()))?,
            ),
        })
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Config> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("opening config file {}", path.display()))?;
        serde_yaml::from_reader(file)
            .with_context(|| format!("parsing config file {}", path.display()))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_config_parses() {
        let config: Config = serde_yaml::from_str(
            "\
manifest: etc/manifest.csv
internal_dsn: postgres://localhost/lode
keymap: var/keymap.db
listen: 0.0.0.0:8080
backends:
  sqldb: sqlite:///var/ext.db
accesslog:
  sink: file
  path: var/access.log
scopes:
  - lode_admin
",
        )
        .unwrap();
        assert_eq!(config.listen.port(), 8080);
        assert_eq!(config.backends["sqldb"], "sqlite:///var/ext.db");
        assert_eq!(config.accesslog.buffer_size(), 100);
        assert_eq!(config.scopes, Some(vec!["lode_admin".to_string()]));
    }

    #[test]
    fn test_config_defaults() {
        let config: Config = serde_yaml::from_str(
            "\
manifest: etc/manifest.csv
internal_dsn: postgres://localhost/lode
keymap: var/keymap.db
",
        )
        .unwrap();
        assert_eq!(config.listen.port(), 8000);
        assert!(config.scopes.is_none());
        assert!(matches!(config.accesslog, AccessLogConfig::Stdout));
    }
}
