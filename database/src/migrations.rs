//! # Schema Migrations
//!
//! Migrations are embedded in the binary and applied in version order under
//! a PostgreSQL advisory lock, one transaction per migration. An applied
//! migration whose checksum no longer matches aborts the run.

use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::{Connection, PgConnection, PgPool};
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, error, info, instrument};

use crate::error::{DatabaseError, DatabaseResult};

/// Advisory lock key held while migrations run
const MIGRATION_LOCK_KEY: i64 = 0x6573_7461_7465; // "estate"

const MIGRATION_TABLE: &str = "schema_migrations";

/// One embedded schema change
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub sql: &'static str,
}

impl Migration {
    /// SHA-256 of the migration body
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.sql.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Migrations shipped with this crate
pub const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "init",
    sql: include_str!("../migrations/0001_init.sql"),
}];

/// Outcome of a migration run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub applied: Vec<i64>,
    pub already_applied: usize,
    pub total_time_ms: u64,
}

/// Applies embedded migrations
#[derive(Debug, Clone)]
pub struct MigrationManager {
    migrations: Vec<Migration>,
}

impl Default for MigrationManager {
    fn default() -> Self {
        Self::new(MIGRATIONS.to_vec())
    }
}

impl MigrationManager {
    pub fn new(mut migrations: Vec<Migration>) -> Self {
        migrations.sort_by_key(|m| m.version);
        Self { migrations }
    }

    /// Runs every pending migration
    #[instrument(skip(self, pool))]
    pub async fn run(&self, pool: &PgPool) -> DatabaseResult<MigrationReport> {
        info!("Starting migration run");
        let mut conn = pool.acquire().await?;

        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *conn)
            .await?;

        let result = self.run_locked(&mut conn).await;

        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *conn)
            .await?;

        match &result {
            Ok(report) => info!(applied = ?report.applied, "Migrations complete"),
            Err(e) => error!(error = %e, "Migration failed"),
        }
        result
    }

    async fn run_locked(&self, conn: &mut PgConnection) -> DatabaseResult<MigrationReport> {
        let start = Instant::now();

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                version BIGINT PRIMARY KEY,
                name TEXT NOT NULL,
                checksum TEXT NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                execution_time_ms BIGINT NOT NULL
            )",
            MIGRATION_TABLE
        ))
        .execute(&mut *conn)
        .await?;

        let applied: HashMap<i64, String> =
            sqlx::query_as::<_, (i64, String)>(&format!("SELECT version, checksum FROM {}", MIGRATION_TABLE))
                .fetch_all(&mut *conn)
                .await?
                .into_iter()
                .collect();

        let mut report = MigrationReport::default();
        for migration in &self.migrations {
            if let Some(recorded) = applied.get(&migration.version) {
                if *recorded != migration.checksum() {
                    return Err(DatabaseError::Migration(format!(
                        "checksum mismatch for applied migration {} ({})",
                        migration.version, migration.name
                    )));
                }
                report.already_applied += 1;
                continue;
            }

            self.apply(conn, migration).await?;
            report.applied.push(migration.version);
        }

        report.total_time_ms = start.elapsed().as_millis() as u64;
        Ok(report)
    }

    async fn apply(&self, conn: &mut PgConnection, migration: &Migration) -> DatabaseResult<()> {
        debug!(version = migration.version, name = migration.name, "Applying migration");
        let start = Instant::now();

        let mut tx = conn.begin().await?;
        sqlx::raw_sql(migration.sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                DatabaseError::Migration(format!("{} ({}): {}", migration.version, migration.name, e))
            })?;

        sqlx::query(&format!(
            "INSERT INTO {} (version, name, checksum, execution_time_ms) VALUES ($1, $2, $3, $4)",
            MIGRATION_TABLE
        ))
        .bind(migration.version)
        .bind(migration.name)
        .bind(migration.checksum())
        .bind(start.elapsed().as_millis() as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(version = migration.version, name = migration.name, "Applied migration");
        Ok(())
    }

    /// Versions in application order
    pub fn versions(&self) -> Vec<i64> {
        self.migrations.iter().map(|m| m.version).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_is_stable() {
        let migration = MIGRATIONS[0];
        assert_eq!(migration.checksum(), migration.checksum());
        assert_eq!(migration.checksum().len(), 64);
    }

    #[test]
    fn test_embedded_schema() {
        let sql = MIGRATIONS[0].sql;
        assert!(sql.contains("CREATE TABLE transactions"));
        assert!(sql.contains("withdrawal_requests_one_pending"));
        assert!(sql.contains("shares_available <= total_shares"));
    }

    #[test]
    fn test_migrations_sorted() {
        let manager = MigrationManager::new(vec![
            Migration {
                version: 3,
                name: "c",
                sql: "",
            },
            Migration {
                version: 1,
                name: "a",
                sql: "",
            },
        ]);
        assert_eq!(manager.versions(), vec![1, 3]);
    }
}
