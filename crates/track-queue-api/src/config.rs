//! Configuration types for the HTTP service

use crate::errors::ServiceError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use track_queue_core::{ConfigError, IngestConfig};
use tracing::info;

/// Prefix of environment variables that override file configuration
pub const ENV_PREFIX: &str = "TQ";

/// Service configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// HTTP server settings
    pub server: ServerConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Queue store and point store backends
    pub storage: StorageConfig,

    /// Worker, retry, health and dead-letter settings
    pub ingest: IngestConfig,
}

impl ServiceConfig {
    /// Load configuration from the standard locations
    ///
    /// Sources, later ones overriding earlier ones:
    ///  1. `/etc/track-queue/service.yaml`
    ///  2. `./config/service.yaml`
    ///  3. `explicit_path`, which must exist when given
    ///  4. environment variables prefixed `TQ__` (e.g. `TQ__SERVER__PORT=9090`)
    ///
    /// Every field has a default, so missing files produce a usable
    /// configuration. A malformed file or an uncoercible variable is an error.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self, ServiceError> {
        let mut builder = config::Config::builder()
            .add_source(
                config::File::with_name("/etc/track-queue/service")
                    .required(false)
                    .format(config::FileFormat::Yaml),
            )
            .add_source(
                config::File::with_name("config/service")
                    .required(false)
                    .format(config::FileFormat::Yaml),
            );

        if let Some(path) = explicit_path {
            info!(path = %path.display(), "Loading configuration from explicit path");
            builder = builder.add_source(
                config::File::from(path.to_path_buf())
                    .required(true)
                    .format(config::FileFormat::Yaml),
            );
        }

        let config: ServiceConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        Ok(config)
    }

    /// Reject configurations the service cannot start with
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.ingest.validate()?;
        self.storage.validate()?;

        if self.server.host.trim().is_empty() {
            return Err(ConfigError::Missing {
                key: "server.host".to_string(),
            });
        }
        Ok(())
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// How long workers get to finish their current cycle on shutdown
    pub shutdown_timeout_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            shutdown_timeout_seconds: 30,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,

    /// Enable JSON structured logging
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

/// Where queue entries live
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    /// Process memory; lost on restart
    #[default]
    Memory,
    /// Memory with a JSON snapshot under `storage.data_dir`
    Filesystem,
}

/// Where persisted points are written
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointBackend {
    #[default]
    Memory,
    Postgres,
}

/// Storage backend configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub queue_backend: QueueBackend,

    /// Directory for the filesystem queue snapshot
    pub data_dir: Option<PathBuf>,

    pub point_backend: PointBackend,

    /// PostgreSQL connection string for the postgres point backend
    pub database_url: Option<String>,

    /// Connection pool size for the postgres point backend
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            queue_backend: QueueBackend::Memory,
            data_dir: None,
            point_backend: PointBackend::Memory,
            database_url: None,
            max_connections: 10,
        }
    }
}

impl StorageConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_backend == QueueBackend::Filesystem && self.data_dir.is_none() {
            return Err(ConfigError::Missing {
                key: "storage.data_dir".to_string(),
            });
        }

        if self.point_backend == PointBackend::Postgres {
            if self.database_url.as_deref().map_or(true, str::is_empty) {
                return Err(ConfigError::Missing {
                    key: "storage.database_url".to_string(),
                });
            }
            if self.max_connections == 0 {
                return Err(ConfigError::Invalid {
                    key: "storage.max_connections".to_string(),
                    message: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
