//! # Estate Database
//!
//! PostgreSQL persistence for the fractional estate engine: a pooled
//! [`PgStore`] implementing the engine's store seam, embedded schema
//! migrations, and row mappings for every persisted entity.

pub mod config;
pub mod database;
pub mod error;
pub mod migrations;
pub mod session;
pub mod types;

pub use config::DatabaseConfig;
pub use database::{PgStore, PoolStats};
pub use error::{DatabaseError, DatabaseResult};
pub use migrations::{Migration, MigrationManager, MigrationReport, MIGRATIONS};
pub use session::PgSession;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
