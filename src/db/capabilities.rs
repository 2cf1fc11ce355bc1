//! Repository for capability grants.

use super::DbError;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

/// Repository for role capability grants.
pub struct CapabilityRepository<'a> {
    pool: &'a PgPool,
}

impl<'a> CapabilityRepository<'a> {
    /// Create a new capability repository.
    pub fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Membership test: does any role in the set hold the capability?
    pub async fn any_role_has(
        &self,
        guild_id: i64,
        role_ids: &[i64],
        capability: &str,
    ) -> Result<bool, DbError> {
        if role_ids.is_empty() {
            return Ok(false);
        }

        let granted: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM tss.role_capabilities
                WHERE guild_id = $1
                  AND role_id = ANY($2)
                  AND capability = $3
            )
            "#,
        )
        .bind(guild_id)
        .bind(role_ids)
        .bind(capability)
        .fetch_one(self.pool)
        .await?;

        Ok(granted)
    }

    /// List capabilities granted to a role, with grant timestamps.
    pub async fn list_for_role(
        &self,
        guild_id: i64,
        role_id: i64,
    ) -> Result<Vec<(String, DateTime<Utc>)>, DbError> {
        let rows = sqlx::query_as::<_, (String, DateTime<Utc>)>(
            r#"
            SELECT capability, granted_at
            FROM tss.role_capabilities
            WHERE guild_id = $1 AND role_id = $2
            ORDER BY capability
            "#,
        )
        .bind(guild_id)
        .bind(role_id)
        .fetch_all(self.pool)
        .await?;

        Ok(rows)
    }
}
