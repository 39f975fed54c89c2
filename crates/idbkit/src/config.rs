//! Engine configuration
//!
//! Backend selection is explicit: the engine never inspects the environment.
//! A config is built in code or loaded from JSON:
//!
//! ```json
//! { "backend": { "kind": "sqlite", "path": "/var/lib/app/idb" }, "log_filter": "idbkit=debug" }
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Which storage backend a factory uses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    /// Process memory, lost on exit
    Memory,
    /// One SQLite file per database under `path`
    Sqlite { path: PathBuf },
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Memory
    }
}

impl BackendConfig {
    /// The `kind` tag as written in config files.
    pub fn kind(&self) -> &'static str {
        match self {
            BackendConfig::Memory => "memory",
            BackendConfig::Sqlite { .. } => "sqlite",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend: BackendConfig,
    /// Default `EnvFilter` directive when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            log_filter: "info".to_string(),
        }
    }
}

impl Config {
    /// In-memory engine.
    pub fn memory() -> Self {
        Self::default()
    }

    /// Durable engine storing databases under `path`.
    pub fn sqlite(path: impl Into<PathBuf>) -> Self {
        Self {
            backend: BackendConfig::Sqlite { path: path.into() },
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_sqlite_config() {
        let config = Config::from_json(
            r#"{ "backend": { "kind": "sqlite", "path": "/tmp/idb" }, "log_filter": "debug" }"#,
        )
        .unwrap();
        assert_eq!(
            config,
            Config {
                backend: BackendConfig::Sqlite {
                    path: PathBuf::from("/tmp/idb")
                },
                log_filter: "debug".to_string(),
            }
        );
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        assert_eq!(Config::from_json("{}").unwrap(), Config::memory());
        let config = Config::from_json(r#"{ "backend": { "kind": "memory" } }"#).unwrap();
        assert_eq!(config.log_filter, "info");
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        let err = Config::from_json(r#"{ "backend": { "kind": "postgres" } }"#).unwrap_err();
        assert!(matches!(err, crate::Error::Serialization(_)));
    }

    #[test]
    fn test_kind_matches_serialized_tag() {
        for config in [Config::memory(), Config::sqlite("data")] {
            let json = serde_json::to_value(&config.backend).unwrap();
            assert_eq!(json["kind"], config.backend.kind());
        }
    }

    #[test]
    fn test_round_trips_through_json() {
        let config = Config::sqlite("data");
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(Config::from_json(&json).unwrap(), config);
    }
}
