//! Repository for guild configuration rows.

use super::DbError;
use sqlx::PgPool;

/// A guild configuration row.
#[derive(Debug, Clone)]
pub struct GuildRecord {
    pub guild_id: i64,
    pub name: String,
    pub modlog_channel_id: Option<i64>,
    pub admin_role_ids: Vec<i64>,
    pub moderator_role_ids: Vec<i64>,
}

/// Repository for guild rows.
pub struct GuildRepository<'a> {
    pool: &'a PgPool,
}

impl<'a> GuildRepository<'a> {
    /// Create a new guild repository.
    pub fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Create or rename a guild. Role sets and modlog settings are preserved
    /// on conflict; guilds are never deleted by the engine.
    pub async fn upsert(&self, guild_id: i64, name: &str) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO tss.guilds (guild_id, name)
            VALUES ($1, $2)
            ON CONFLICT (guild_id) DO UPDATE SET name = EXCLUDED.name
            "#,
        )
        .bind(guild_id)
        .bind(name)
        .execute(self.pool)
        .await?;

        Ok(())
    }

    /// Fetch a guild row.
    pub async fn get(&self, guild_id: i64) -> Result<Option<GuildRecord>, DbError> {
        let row = sqlx::query_as::<_, (i64, String, Option<i64>, Vec<i64>, Vec<i64>)>(
            r#"
            SELECT guild_id, name, modlog_channel_id, admin_role_ids, moderator_role_ids
            FROM tss.guilds
            WHERE guild_id = $1
            "#,
        )
        .bind(guild_id)
        .fetch_optional(self.pool)
        .await?;

        Ok(row.map(
            |(guild_id, name, modlog_channel_id, admin_role_ids, moderator_role_ids)| GuildRecord {
                guild_id,
                name,
                modlog_channel_id,
                admin_role_ids,
                moderator_role_ids,
            },
        ))
    }

    /// Set or clear the modlog channel.
    pub async fn set_modlog_channel(
        &self,
        guild_id: i64,
        channel_id: Option<i64>,
    ) -> Result<bool, DbError> {
        let result = sqlx::query("UPDATE tss.guilds SET modlog_channel_id = $2 WHERE guild_id = $1")
            .bind(guild_id)
            .bind(channel_id)
            .execute(self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Add a role to one of the role sets. The guard keeps the array
    /// duplicate-free under concurrent writers.
    pub async fn add_role(&self, guild_id: i64, role_id: i64, set: RoleSet) -> Result<bool, DbError> {
        let sql = match set {
            RoleSet::Admin => {
                r#"
                UPDATE tss.guilds
                   SET admin_role_ids = array_append(admin_role_ids, $2)
                 WHERE guild_id = $1 AND NOT ($2 = ANY(admin_role_ids))
                "#
            }
            RoleSet::Moderator => {
                r#"
                UPDATE tss.guilds
                   SET moderator_role_ids = array_append(moderator_role_ids, $2)
                 WHERE guild_id = $1 AND NOT ($2 = ANY(moderator_role_ids))
                "#
            }
        };

        let result = sqlx::query(sql)
            .bind(guild_id)
            .bind(role_id)
            .execute(self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Remove a role from one of the role sets.
    pub async fn remove_role(
        &self,
        guild_id: i64,
        role_id: i64,
        set: RoleSet,
    ) -> Result<bool, DbError> {
        let sql = match set {
            RoleSet::Admin => {
                r#"
                UPDATE tss.guilds
                   SET admin_role_ids = array_remove(admin_role_ids, $2)
                 WHERE guild_id = $1 AND $2 = ANY(admin_role_ids)
                "#
            }
            RoleSet::Moderator => {
                r#"
                UPDATE tss.guilds
                   SET moderator_role_ids = array_remove(moderator_role_ids, $2)
                 WHERE guild_id = $1 AND $2 = ANY(moderator_role_ids)
                "#
            }
        };

        let result = sqlx::query(sql)
            .bind(guild_id)
            .bind(role_id)
            .execute(self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

/// Which of the two configured role sets to mutate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleSet {
    Admin,
    Moderator,
}
