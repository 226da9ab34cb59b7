//! Configuration for the request-execution core

use crate::telemetry::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use steward_idempotency::IdempotencyConfig;
use steward_storage::{InMemoryStewardStorage, StewardStorage};
use steward_tenancy::TenancyConfig;

/// Main configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StewardConfig {
    /// Idempotency guard timing
    #[serde(default)]
    pub idempotency: IdempotencyConfig,

    /// Tenant context policy
    #[serde(default)]
    pub tenancy: TenancyConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Storage backend
    #[serde(default)]
    pub storage: StorageConfig,

    /// Recovery sweep tuning
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

/// Storage configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (for development/testing)
    #[default]
    Memory,

    /// PostgreSQL storage
    Postgres {
        /// Connection URL
        url: String,

        /// Maximum connections in pool
        #[serde(default = "default_pool_size")]
        max_connections: u32,

        /// Connection timeout in seconds
        #[serde(default = "default_connection_timeout")]
        connect_timeout_secs: u64,
    },
}

/// Recovery sweep configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Stale invocations replayed concurrently
    #[serde(default = "default_recovery_concurrency")]
    pub concurrency: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            concurrency: default_recovery_concurrency(),
        }
    }
}

fn default_pool_size() -> u32 {
    10
}

fn default_connection_timeout() -> u64 {
    5
}

fn default_recovery_concurrency() -> usize {
    4
}

impl StewardConfig {
    /// Load configuration: defaults, then the optional file, then
    /// `STEWARD_`-prefixed environment variables (`STEWARD_IDEMPOTENCY__LEASE_MS`).
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&StewardConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("STEWARD")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }
}

impl StorageConfig {
    /// Open the configured backend.
    pub async fn open(&self) -> anyhow::Result<Arc<dyn StewardStorage>> {
        match self {
            StorageConfig::Memory => Ok(Arc::new(InMemoryStewardStorage::new())),
            #[cfg(feature = "postgres")]
            StorageConfig::Postgres {
                url,
                max_connections,
                connect_timeout_secs,
            } => {
                use anyhow::Context;

                let store = steward_storage::postgres::PostgresStewardStorage::connect_with_options(
                    url,
                    *max_connections,
                    *connect_timeout_secs,
                )
                .await
                .context("failed to open postgres storage")?;
                Ok(Arc::new(store))
            }
            #[cfg(not(feature = "postgres"))]
            StorageConfig::Postgres { .. } => {
                Err(anyhow::anyhow!("postgres storage requires the `postgres` feature"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::LogFormat;
    use steward_storage::OrganizationDirectory;

    #[test]
    fn test_default_config() {
        let config = StewardConfig::default();
        assert!(matches!(config.storage, StorageConfig::Memory));
        assert_eq!(config.idempotency.lease_ms, 60_000);
        assert!(config.tenancy.require_cross_tenant_reason);
        assert_eq!(config.recovery.concurrency, 4);
    }

    #[test]
    fn test_load_without_file_yields_defaults() {
        let config = StewardConfig::load(None).unwrap();
        assert_eq!(config.idempotency, IdempotencyConfig::default());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let path = std::env::temp_dir().join(format!("steward-config-{}.json", std::process::id()));
        std::fs::write(
            &path,
            serde_json::json!({
                "idempotency": { "lease_ms": 5000 },
                "logging": { "format": "json" },
                "storage": { "type": "postgres", "url": "postgres://localhost/steward" }
            })
            .to_string(),
        )
        .unwrap();

        let config = StewardConfig::load(path.to_str()).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.idempotency.lease_ms, 5000);
        assert_eq!(config.idempotency.wait_timeout_ms, 10_000);
        assert_eq!(config.logging.format, LogFormat::Json);
        match config.storage {
            StorageConfig::Postgres {
                url,
                max_connections,
                ..
            } => {
                assert_eq!(url, "postgres://localhost/steward");
                assert_eq!(max_connections, 10);
            }
            other => panic!("unexpected storage config: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_open_memory_storage() {
        let storage = StorageConfig::Memory.open().await.unwrap();
        let org = steward_types::OrganizationId::new("nobody");
        assert!(!storage.organization_exists(&org).await.unwrap());
    }
}
