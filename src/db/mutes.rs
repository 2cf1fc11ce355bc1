//! Repository for mute cases and per-guild mute settings.

use super::DbError;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

/// How a mute is enforced on the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuteMethod {
    /// A dedicated "muted" role is granted to the user.
    Role { role_id: i64 },
    /// The platform's native communication timeout is used.
    Timeout,
}

impl MuteMethod {
    /// Storage representation: discriminator plus optional role id.
    pub fn to_columns(self) -> (&'static str, Option<i64>) {
        match self {
            Self::Role { role_id } => ("role", Some(role_id)),
            Self::Timeout => ("timeout", None),
        }
    }

    /// Rebuild from the stored columns.
    ///
    /// The CHECK constraint limits `method` to the two known discriminators;
    /// a role-method row without a role id is treated as a timeout mute so a
    /// damaged row cannot wedge the lift path.
    pub fn from_columns(method: &str, role_id: Option<i64>) -> Self {
        match (method, role_id) {
            ("role", Some(role_id)) => Self::Role { role_id },
            _ => Self::Timeout,
        }
    }
}

/// One mute instance.
///
/// Active while `unmuted_at` is `None`; stamped exactly once at lift and
/// immutable afterwards.
#[derive(Debug, Clone)]
pub struct MuteCase {
    pub id: i64,
    pub guild_id: i64,
    pub user_id: i64,
    pub moderator_id: i64,
    pub reason: String,
    pub evidence: Option<String>,
    pub created_at: DateTime<Utc>,
    pub until: Option<DateTime<Utc>>,
    pub unmuted_at: Option<DateTime<Utc>>,
    pub unmuted_by: Option<i64>,
    pub unmute_reason: Option<String>,
    pub method: MuteMethod,
}

impl MuteCase {
    /// Whether the case is still in force.
    pub fn is_active(&self) -> bool {
        self.unmuted_at.is_none()
    }
}

/// Row tuple shape shared by every query returning full mute cases.
pub(crate) type MuteCaseRow = (
    i64,
    i64,
    i64,
    i64,
    String,
    Option<String>,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
    Option<DateTime<Utc>>,
    Option<i64>,
    Option<String>,
    String,
    Option<i64>,
);

pub(crate) const MUTE_CASE_COLUMNS: &str = "id, guild_id, user_id, moderator_id, reason, evidence, \
     created_at, until, unmuted_at, unmuted_by, unmute_reason, method, role_id";

pub(crate) fn case_from_row(row: MuteCaseRow) -> MuteCase {
    let (
        id,
        guild_id,
        user_id,
        moderator_id,
        reason,
        evidence,
        created_at,
        until,
        unmuted_at,
        unmuted_by,
        unmute_reason,
        method,
        role_id,
    ) = row;
    MuteCase {
        id,
        guild_id,
        user_id,
        moderator_id,
        reason,
        evidence,
        created_at,
        until,
        unmuted_at,
        unmuted_by,
        unmute_reason,
        method: MuteMethod::from_columns(&method, role_id),
    }
}

/// Repository for mute storage.
pub struct MuteRepository<'a> {
    pool: &'a PgPool,
}

impl<'a> MuteRepository<'a> {
    /// Create a new mute repository.
    pub fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Load the raw per-guild mute config document, if one was ever saved.
    pub async fn load_config(&self, guild_id: i64) -> Result<Option<serde_json::Value>, DbError> {
        let row: Option<serde_json::Value> =
            sqlx::query_scalar("SELECT cfg FROM tss.mute_config WHERE guild_id = $1")
                .bind(guild_id)
                .fetch_optional(self.pool)
                .await?;

        Ok(row)
    }

    /// Save the per-guild mute config document.
    pub async fn save_config(&self, guild_id: i64, cfg: serde_json::Value) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO tss.mute_config (guild_id, cfg)
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

    /// The active (unlifted) case for a user, if any.
    pub async fn active_case(&self, guild_id: i64, user_id: i64) -> Result<Option<MuteCase>, DbError> {
        let row = sqlx::query_as::<_, MuteCaseRow>(&format!(
            r#"
            SELECT {MUTE_CASE_COLUMNS}
            FROM tss.mute_cases
            WHERE guild_id = $1 AND user_id = $2 AND unmuted_at IS NULL
            ORDER BY created_at DESC
            LIMIT 1
            "#
        ))
        .bind(guild_id)
        .bind(user_id)
        .fetch_optional(self.pool)
        .await?;

        Ok(row.map(case_from_row))
    }

    /// Mute history for a user, newest first.
    pub async fn history(
        &self,
        guild_id: i64,
        user_id: i64,
        limit: i64,
    ) -> Result<Vec<MuteCase>, DbError> {
        let rows = sqlx::query_as::<_, MuteCaseRow>(&format!(
            r#"
            SELECT {MUTE_CASE_COLUMNS}
            FROM tss.mute_cases
            WHERE guild_id = $1 AND user_id = $2
            ORDER BY id DESC
            LIMIT $3
            "#
        ))
        .bind(guild_id)
        .bind(user_id)
        .bind(limit)
        .fetch_all(self.pool)
        .await?;

        Ok(rows.into_iter().map(case_from_row).collect())
    }
}
