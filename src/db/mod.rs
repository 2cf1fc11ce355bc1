//! Database module for persistent storage.
//!
//! Provides async PostgreSQL access using SQLx for:
//! - Guild configuration and role sets
//! - The resource registry and capability grants
//! - The append-only audit log
//! - Warn cases and the decayed points accumulator
//! - Mute cases and per-guild mute settings
//! - Antinuke incidents, snapshots and containment actions
//!
//! All tables live in the `tss` schema; that schema is a published contract
//! for external inspection tooling and is created by the embedded migrations.

pub(crate) mod antinuke;
pub mod audit;
pub(crate) mod capabilities;
pub(crate) mod guilds;
pub(crate) mod mutes;
pub(crate) mod registry;
pub(crate) mod warns;

pub use antinuke::{ACTION_CLOSE, AntinukeRepository, IncidentAction, IncidentRecord, SnapshotRecord};
pub use audit::{AuditEntry, AuditRepository};
pub use capabilities::CapabilityRepository;
pub use guilds::{GuildRecord, GuildRepository, RoleSet};
pub use mutes::{MuteCase, MuteMethod, MuteRepository};
pub use registry::{RegistryEntry, RegistryRepository, ResourceKind};
pub use warns::{PointsRow, WarnCase, WarnRepository};

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Database errors.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(sqlx::Error),
    #[error("migration error: {0}")]
    Migration(sqlx::migrate::MigrateError),
    #[error("guild is not registered")]
    MissingGuild,
    #[error("incident does not exist")]
    MissingIncident,
    #[error("stored document is not valid JSON: {0}")]
    BadDocument(serde_json::Error),
}

/// Database handle with connection pool.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connection acquire timeout - prevents connection storms from blocking
    /// indefinitely.
    const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

    /// Maximum time a connection can remain idle before being closed.
    const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

    /// Create a new database connection pool, running migrations if needed.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, DbError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Self::ACQUIRE_TIMEOUT)
            .idle_timeout(Some(Self::IDLE_TIMEOUT))
            .test_before_acquire(true)
            .connect(url)
            .await?;

        info!("Database connected");

        Self::run_migrations(&pool).await?;

        Ok(Self { pool })
    }

    /// Wrap an existing pool (used by the integration test harness).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run embedded migrations.
    pub async fn run_migrations(pool: &PgPool) -> Result<(), DbError> {
        sqlx::migrate!("./migrations")
            .run(pool)
            .await
            .map_err(DbError::Migration)?;

        info!("Database migrations checked/applied");
        Ok(())
    }

    /// Get guild repository.
    pub fn guilds(&self) -> GuildRepository<'_> {
        GuildRepository::new(&self.pool)
    }

    /// Get resource registry repository.
    pub fn registry(&self) -> RegistryRepository<'_> {
        RegistryRepository::new(&self.pool)
    }

    /// Get capability grant repository.
    pub fn capabilities(&self) -> CapabilityRepository<'_> {
        CapabilityRepository::new(&self.pool)
    }

    /// Get audit log repository.
    pub fn audit(&self) -> AuditRepository<'_> {
        AuditRepository::new(&self.pool)
    }

    /// Get warn repository.
    pub fn warns(&self) -> WarnRepository<'_> {
        WarnRepository::new(&self.pool)
    }

    /// Get mute repository.
    pub fn mutes(&self) -> MuteRepository<'_> {
        MuteRepository::new(&self.pool)
    }

    /// Get antinuke repository.
    pub fn antinuke(&self) -> AntinukeRepository<'_> {
        AntinukeRepository::new(&self.pool)
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        map_sqlx_error(err)
    }
}

impl From<sqlx::migrate::MigrateError> for DbError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DbError::Migration(err)
    }
}

/// Classify foreign-key violations so the engines can report NotFound for a
/// missing parent row instead of an opaque store error.
fn map_sqlx_error(err: sqlx::Error) -> DbError {
    if let sqlx::Error::Database(dbe) = &err {
        // 23503 = foreign_key_violation
        if dbe.code().as_deref() == Some("23503") {
            return match dbe.constraint() {
                Some(c) if c.contains("incident_id") => DbError::MissingIncident,
                Some(c) if c.contains("guild_id") => DbError::MissingGuild,
                _ => DbError::Sqlx(err),
            };
        }
    }
    DbError::Sqlx(err)
}
