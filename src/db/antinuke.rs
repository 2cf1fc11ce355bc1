//! Repository for antinuke incidents, snapshots and containment actions.
//!
//! The per-guild "armed / incident open" state is never held in process
//! memory: it is derived from these rows so it survives restarts and is
//! visible to every worker. An incident counts as open while it has no
//! terminal `close` action and its latest activity (creation or last
//! containment action) is newer than the caller-supplied horizon.

use super::DbError;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

/// Action kind that terminates an incident.
pub const ACTION_CLOSE: &str = "close";

/// One detected anomaly; root of a containment episode.
#[derive(Debug, Clone)]
pub struct IncidentRecord {
    pub id: i64,
    pub guild_id: i64,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// Point-in-time capture of affected state, tied to an incident.
#[derive(Debug, Clone)]
pub struct SnapshotRecord {
    pub id: i64,
    pub incident_id: i64,
    pub state: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// One containment step. `actor_id` is `None` for autonomous engine actions.
#[derive(Debug, Clone)]
pub struct IncidentAction {
    pub id: i64,
    pub incident_id: i64,
    pub actor_id: Option<i64>,
    pub kind: String,
    pub created_at: DateTime<Utc>,
}

/// Condition selecting incidents still open relative to `$2` (the horizon):
/// no close action, and created or last acted upon after the horizon.
pub(crate) const OPEN_INCIDENT_COND: &str = r#"
    NOT EXISTS (
        SELECT 1 FROM tss.antinuke_actions a
        WHERE a.incident_id = i.id AND a.kind = 'close'
    )
    AND GREATEST(
        i.created_at,
        COALESCE(
            (SELECT MAX(a.created_at) FROM tss.antinuke_actions a WHERE a.incident_id = i.id),
            i.created_at
        )
    ) > $2
"#;

/// Repository for antinuke storage.
pub struct AntinukeRepository<'a> {
    pool: &'a PgPool,
}

impl<'a> AntinukeRepository<'a> {
    /// Create a new antinuke repository.
    pub fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Whether the guild has opted into antinuke monitoring.
    pub async fn is_armed(&self, guild_id: i64) -> Result<bool, DbError> {
        let armed: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM tss.antinuke_guilds WHERE guild_id = $1)",
        )
        .bind(guild_id)
        .fetch_one(self.pool)
        .await?;

        Ok(armed)
    }

    /// The open incident for a guild, if any, relative to the given horizon
    /// (`now - close cooldown`).
    pub async fn open_incident(
        &self,
        guild_id: i64,
        horizon: DateTime<Utc>,
    ) -> Result<Option<IncidentRecord>, DbError> {
        let row = sqlx::query_as::<_, (i64, String, DateTime<Utc>)>(&format!(
            r#"
            SELECT i.id, i.reason, i.created_at
            FROM tss.antinuke_incidents i
            WHERE i.guild_id = $1 AND {OPEN_INCIDENT_COND}
            ORDER BY i.created_at DESC
            LIMIT 1
            "#
        ))
        .bind(guild_id)
        .bind(horizon)
        .fetch_optional(self.pool)
        .await?;

        Ok(row.map(|(id, reason, created_at)| IncidentRecord {
            id,
            guild_id,
            reason,
            created_at,
        }))
    }

    /// Fetch one incident by id.
    pub async fn incident(&self, incident_id: i64) -> Result<Option<IncidentRecord>, DbError> {
        let row = sqlx::query_as::<_, (i64, String, DateTime<Utc>)>(
            r#"
            SELECT guild_id, reason, created_at
            FROM tss.antinuke_incidents
            WHERE id = $1
            "#,
        )
        .bind(incident_id)
        .fetch_optional(self.pool)
        .await?;

        Ok(row.map(|(guild_id, reason, created_at)| IncidentRecord {
            id: incident_id,
            guild_id,
            reason,
            created_at,
        }))
    }

    /// Incident history for a guild, newest first.
    pub async fn incidents(&self, guild_id: i64, limit: i64) -> Result<Vec<IncidentRecord>, DbError> {
        let rows = sqlx::query_as::<_, (i64, String, DateTime<Utc>)>(
            r#"
            SELECT id, reason, created_at
            FROM tss.antinuke_incidents
            WHERE guild_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(guild_id)
        .bind(limit)
        .fetch_all(self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, reason, created_at)| IncidentRecord {
                id,
                guild_id,
                reason,
                created_at,
            })
            .collect())
    }

    /// The most recent snapshot stored for an incident.
    pub async fn latest_snapshot(&self, incident_id: i64) -> Result<Option<SnapshotRecord>, DbError> {
        let row = sqlx::query_as::<_, (i64, serde_json::Value, DateTime<Utc>)>(
            r#"
            SELECT id, state, created_at
            FROM tss.antinuke_snapshots
            WHERE incident_id = $1
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(incident_id)
        .fetch_optional(self.pool)
        .await?;

        Ok(row.map(|(id, state, created_at)| SnapshotRecord {
            id,
            incident_id,
            state,
            created_at,
        }))
    }

    /// Containment history for an incident, in causal (insertion) order.
    pub async fn actions(&self, incident_id: i64) -> Result<Vec<IncidentAction>, DbError> {
        let rows = sqlx::query_as::<_, (i64, Option<i64>, String, DateTime<Utc>)>(
            r#"
            SELECT id, actor_id, kind, created_at
            FROM tss.antinuke_actions
            WHERE incident_id = $1
            ORDER BY id
            "#,
        )
        .bind(incident_id)
        .fetch_all(self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, actor_id, kind, created_at)| IncidentAction {
                id,
                incident_id,
                actor_id,
                kind,
                created_at,
            })
            .collect())
    }
}
