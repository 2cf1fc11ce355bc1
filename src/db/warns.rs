//! Repository for warn cases and the points accumulator.

use super::DbError;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

/// One immutable warning. Historical record: inserted once, never updated.
#[derive(Debug, Clone)]
pub struct WarnCase {
    pub id: i64,
    pub guild_id: i64,
    pub user_id: i64,
    pub moderator_id: i64,
    pub points: i32,
    pub reason: String,
    pub evidence: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The accumulator row for one (guild, user) pair.
#[derive(Debug, Clone, Copy)]
pub struct PointsRow {
    pub total: i32,
    pub last_decay_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Repository for warn storage.
pub struct WarnRepository<'a> {
    pool: &'a PgPool,
}

impl<'a> WarnRepository<'a> {
    /// Create a new warn repository.
    pub fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Load the raw per-guild warn config document, if one was ever saved.
    pub async fn load_config(&self, guild_id: i64) -> Result<Option<serde_json::Value>, DbError> {
        let row: Option<serde_json::Value> =
            sqlx::query_scalar("SELECT cfg FROM tss.warn_config WHERE guild_id = $1")
                .bind(guild_id)
                .fetch_optional(self.pool)
                .await?;

        Ok(row)
    }

    /// Save the per-guild warn config document.
    pub async fn save_config(&self, guild_id: i64, cfg: serde_json::Value) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO tss.warn_config (guild_id, cfg)
            VALUES ($1, $2)
            ON CONFLICT (guild_id) DO UPDATE SET cfg = EXCLUDED.cfg
            "#,
        )
        .bind(guild_id)
        .bind(cfg)
        .execute(self.pool)
        .await?;

        Ok(())
    }

    /// Fetch the accumulator row for a user.
    pub async fn points_row(&self, guild_id: i64, user_id: i64) -> Result<Option<PointsRow>, DbError> {
        let row = sqlx::query_as::<_, (i32, Option<DateTime<Utc>>, DateTime<Utc>)>(
            r#"
            SELECT total, last_decay_at, updated_at
            FROM tss.warn_points
            WHERE guild_id = $1 AND user_id = $2
            "#,
        )
        .bind(guild_id)
        .bind(user_id)
        .fetch_optional(self.pool)
        .await?;

        Ok(row.map(|(total, last_decay_at, updated_at)| PointsRow {
            total,
            last_decay_at,
            updated_at,
        }))
    }

    /// Creation time of the user's earliest case. Decay anchor of last
    /// resort when the accumulator row predates decay tracking.
    pub async fn earliest_case_at(
        &self,
        guild_id: i64,
        user_id: i64,
    ) -> Result<Option<DateTime<Utc>>, DbError> {
        let at: Option<DateTime<Utc>> = sqlx::query_scalar(
            r#"
            SELECT MIN(created_at)
            FROM tss.warn_cases
            WHERE guild_id = $1 AND user_id = $2
            "#,
        )
        .bind(guild_id)
        .bind(user_id)
        .fetch_one(self.pool)
        .await?;

        Ok(at)
    }

    /// Case history for a user, newest first, keyset-paginated by case id.
    pub async fn list_cases(
        &self,
        guild_id: i64,
        user_id: i64,
        limit: i64,
        before: Option<i64>,
    ) -> Result<Vec<WarnCase>, DbError> {
        let rows = sqlx::query_as::<
            _,
            (i64, i64, i32, String, Option<String>, DateTime<Utc>),
        >(
            r#"
            SELECT id, moderator_id, points, reason, evidence, created_at
            FROM tss.warn_cases
            WHERE guild_id = $1
              AND user_id = $2
              AND ($4::BIGINT IS NULL OR id < $4)
            ORDER BY id DESC
            LIMIT $3
            "#,
        )
        .bind(guild_id)
        .bind(user_id)
        .bind(limit)
        .bind(before)
        .fetch_all(self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, moderator_id, points, reason, evidence, created_at)| WarnCase {
                id,
                guild_id,
                user_id,
                moderator_id,
                points,
                reason,
                evidence,
                created_at,
            })
            .collect())
    }
}
