//! Persistence for deployment records and secrets.
//!
//! Two backends:
//! - `memory`: maps behind `tokio::sync::RwLock`, for development and tests
//! - `postgres`: JSONB documents through SQLx
//!
//! Callers only see the [`DeploymentRepository`] and [`Vault`] traits.

mod error;
mod memory;
mod postgres;

pub use error::DbError;
pub use memory::{MemoryRepository, MemoryVault};
pub use postgres::{PgDeploymentRepository, PgVault};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hyde_id::DeploymentId;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use crate::model::Deployment;
use crate::secrets::Vault;

/// Deployment record store, treated as a key/value store.
#[async_trait]
pub trait DeploymentRepository: Send + Sync {
    /// Inserts a new record. Fails if the id is taken.
    async fn save(&self, deployment: &Deployment) -> Result<(), DbError>;

    async fn get(&self, id: &DeploymentId) -> Result<Deployment, DbError>;

    async fn list(&self) -> Result<Vec<Deployment>, DbError>;

    /// Replaces an existing record.
    async fn update(&self, deployment: &Deployment) -> Result<(), DbError>;

    async fn delete(&self, id: &DeploymentId) -> Result<(), DbError>;
}

/// Which backend to open.
#[derive(Debug, Clone)]
pub enum StoreBackend {
    Memory,
    Postgres(DbConfig),
}

/// Postgres pool settings.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_url: String,
    pub max_connections: u32,
    /// Idle connections kept open.
    pub min_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/hyde".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

impl DbConfig {
    /// `DATABASE_URL`, `DB_MAX_CONNECTIONS` and `DB_MIN_CONNECTIONS`, each
    /// falling back to the default.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let database_url = std::env::var("DATABASE_URL").unwrap_or(defaults.database_url);

        let max_connections = std::env::var("DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_connections);

        let min_connections = std::env::var("DB_MIN_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.min_connections);

        Self {
            database_url,
            max_connections,
            min_connections,
            ..defaults
        }
    }
}

/// Pool shared by the Postgres repository and vault.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(config: &DbConfig) -> Result<Self, DbError> {
        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connecting to database"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.database_url)
            .await
            .map_err(DbError::Connect)?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<(), DbError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(())
    }

    /// Applies the migrations shipped with the service.
    pub async fn run_migrations(&self) -> Result<(), DbError> {
        let candidates = [
            std::path::PathBuf::from("./migrations"),
            std::path::PathBuf::from("services/engine/migrations"),
            std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations"),
        ];

        for dir in &candidates {
            if let Ok(migrator) = sqlx::migrate::Migrator::new(dir.clone()).await {
                info!(migrations_dir = %dir.display(), "Running database migrations");
                migrator.run(&self.pool).await.map_err(DbError::Migration)?;
                return Ok(());
            }
        }

        Err(DbError::MigrationDirNotFound {
            tried: candidates
                .iter()
                .map(|dir| dir.display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
        })
    }
}

/// The opened repository and vault, plus the pool when one exists.
#[derive(Clone)]
pub struct Stores {
    pub repository: Arc<dyn DeploymentRepository>,
    pub vault: Arc<dyn Vault>,
    pub database: Option<Database>,
}

impl Stores {
    pub fn memory() -> Self {
        Self {
            repository: Arc::new(MemoryRepository::new()),
            vault: Arc::new(MemoryVault::new()),
            database: None,
        }
    }

    pub fn postgres(database: Database) -> Self {
        Self {
            repository: Arc::new(PgDeploymentRepository::new(database.pool().clone())),
            vault: Arc::new(PgVault::new(database.pool().clone())),
            database: Some(database),
        }
    }

    /// Opens the configured backend, migrating Postgres when `migrate` is set.
    pub async fn open(backend: &StoreBackend, migrate: bool) -> Result<Self, DbError> {
        match backend {
            StoreBackend::Memory => {
                info!("Using in-memory repository");
                Ok(Self::memory())
            }
            StoreBackend::Postgres(config) => {
                let database = Database::connect(config).await?;
                if migrate {
                    database.run_migrations().await?;
                }
                Ok(Self::postgres(database))
            }
        }
    }

    /// Reachability of the backing store; always healthy in memory.
    pub async fn health_check(&self) -> Result<(), DbError> {
        match &self.database {
            Some(database) => database.health_check().await,
            None => Ok(()),
        }
    }
}
