//! Integration test common infrastructure.
//!
//! These tests exercise the real store contract (conditional inserts, row
//! locks, cascades) and need a PostgreSQL instance. Point
//! `TSSD_TEST_DATABASE_URL` at one to run them; without it every test
//! returns early. Each test isolates itself with unique guild ids, so the
//! suite is safe to run in parallel and repeatedly against the same
//! database.

use sqlx::postgres::PgPoolOptions;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tssd::{Config, Database};

static SEQ: AtomicI64 = AtomicI64::new(0);

/// Connect and migrate, or `None` when no test database is configured.
pub async fn test_db() -> Option<Database> {
    let url = std::env::var("TSSD_TEST_DATABASE_URL").ok()?;

    let pool = PgPoolOptions::new()
        .max_connections(4)
        .connect(&url)
        .await
        .expect("failed to connect to TSSD_TEST_DATABASE_URL");

    Database::run_migrations(&pool).await.expect("migrations failed");

    Some(Database::from_pool(pool))
}

/// A guild id no other test (or earlier run) uses.
pub fn unique_guild_id() -> i64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .as_nanos() as i64;
    // Nanos alone can collide across threads; mix in a process-wide sequence.
    (nanos & 0x7FFF_FFFF_FFFF_F000) | (SEQ.fetch_add(1, Ordering::Relaxed) & 0xFFF)
}

/// Daemon config for tests. Antinuke: threshold 3, ceiling 10, 15 min
/// cooldown.
pub fn test_config() -> Config {
    toml::from_str(
        r#"
        [database]
        url = "postgres://unused-in-tests/tss"

        [antinuke]
        burst_threshold = 3
        burst_ceiling = 10
        close_cooldown_secs = 900
        "#,
    )
    .expect("test config must parse")
}

/// Register a guild row so foreign keys resolve.
pub async fn seed_guild(db: &Database, guild_id: i64) {
    db.guilds()
        .upsert(guild_id, &format!("test-guild-{guild_id}"))
        .await
        .expect("guild upsert failed");
}
