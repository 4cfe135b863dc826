//! # PostgreSQL Store
//!
//! Connection pooling and the [`Store`] implementation backing the engine.
//! Every engine operation runs inside one pooled transaction.

use async_trait::async_trait;
use secrecy::ExposeSecret;
use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::{debug, error, info, instrument};

use estate_core::store::{Session, Store};
use estate_core::EstateResult;

use crate::config::DatabaseConfig;
use crate::error::{DatabaseError, DatabaseResult};
use crate::migrations::{MigrationManager, MigrationReport};
use crate::session::PgSession;

/// Pooled PostgreSQL store
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    config: DatabaseConfig,
}

impl std::fmt::Debug for PgStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgStore")
            .field("pool_size", &self.pool.size())
            .field("max_connections", &self.config.max_connections)
            .finish()
    }
}

impl PgStore {
    /// Open the pool and verify the server answers
    #[instrument(skip(config), fields(max_connections = config.max_connections))]
    pub async fn connect(config: DatabaseConfig) -> DatabaseResult<Self> {
        config.validate()?;
        info!("Initializing database connection pool");

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .max_lifetime(config.max_lifetime)
            .connect(config.database_url.expose_secret())
            .await
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;

        let version: String = sqlx::query_scalar("SELECT version()")
            .fetch_one(&pool)
            .await?;
        info!(server = %version, "Connected to PostgreSQL");

        let store = Self { pool, config };
        if store.config.migrate_on_start {
            store.migrate().await?;
        }
        Ok(store)
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool, config: DatabaseConfig) -> Self {
        Self { pool, config }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Apply pending schema migrations
    pub async fn migrate(&self) -> DatabaseResult<MigrationReport> {
        MigrationManager::default().run(&self.pool).await
    }

    /// Check database health
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> DatabaseResult<()> {
        let (health,): (i32,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        if health == 1 {
            debug!("Database health check passed");
            Ok(())
        } else {
            error!(health, "Database health check failed");
            Err(DatabaseError::Connection(
                "health check returned unexpected result".to_string(),
            ))
        }
    }

    /// Pool usage snapshot
    pub fn stats(&self) -> PoolStats {
        let idle = self.pool.num_idle() as u32;
        PoolStats {
            size: self.pool.size(),
            idle,
            in_use: self.pool.size().saturating_sub(idle),
            max_connections: self.config.max_connections,
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("Database pool closed");
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> EstateResult<Box<dyn Session>> {
        let tx = self.pool.begin().await.map_err(DatabaseError::from)?;
        Ok(Box::new(PgSession::new(tx)))
    }
}

/// Connection pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    pub size: u32,
    pub idle: u32,
    pub in_use: u32,
    pub max_connections: u32,
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "pool size={} idle={} in_use={} max={}",
            self.size, self.idle, self.in_use, self.max_connections
        )
    }
}
