//! Append-only audit log.
//!
//! Every engine writes a trail entry as the last step of a state change,
//! inside the same transaction as the change itself. Nothing in the engine
//! reads the log to make decisions; it exists for review tooling and
//! compliance.

use super::DbError;
use chrono::{DateTime, Utc};
use sqlx::{PgExecutor, PgPool};

/// One audit trail entry.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub id: i64,
    pub guild_id: i64,
    pub actor_id: Option<i64>,
    pub event: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Append an audit entry, returning its monotone id.
///
/// Generic over the executor so engines can write inside an open transaction.
pub async fn record<'e, E>(
    executor: E,
    guild_id: i64,
    actor_id: Option<i64>,
    event: &str,
    payload: serde_json::Value,
) -> Result<i64, DbError>
where
    E: PgExecutor<'e>,
{
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO tss.audit_log (guild_id, actor_id, event, payload)
        VALUES ($1, $2, $3, $4)
        RETURNING id
        "#,
    )
    .bind(guild_id)
    .bind(actor_id)
    .bind(event)
    .bind(payload)
    .fetch_one(executor)
    .await?;

    Ok(id)
}

/// Read access to the audit log.
pub struct AuditRepository<'a> {
    pool: &'a PgPool,
}

impl<'a> AuditRepository<'a> {
    /// Create a new audit repository.
    pub fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Append an entry outside any transaction.
    pub async fn record(
        &self,
        guild_id: i64,
        actor_id: Option<i64>,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<i64, DbError> {
        record(self.pool, guild_id, actor_id, event, payload).await
    }

    /// Most recent entries for a guild, newest first.
    pub async fn recent(&self, guild_id: i64, limit: i64) -> Result<Vec<AuditEntry>, DbError> {
        let rows = sqlx::query_as::<_, (i64, Option<i64>, String, serde_json::Value, DateTime<Utc>)>(
            r#"
            SELECT id, actor_id, event, payload, created_at
            FROM tss.audit_log
            WHERE guild_id = $1
            ORDER BY id DESC
            LIMIT $2
            "#,
        )
        .bind(guild_id)
        .bind(limit)
        .fetch_all(self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, actor_id, event, payload, created_at)| AuditEntry {
                id,
                guild_id,
                actor_id,
                event,
                payload,
                created_at,
            })
            .collect())
    }
}
