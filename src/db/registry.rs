//! Repository for the guild resource registry.
//!
//! Maps guild-scoped logical keys ("mute-role", "modlog-channel") to opaque
//! platform ids so engine code never hard-codes external handles.

use super::DbError;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::fmt;
use std::str::FromStr;

/// The kind of platform object a registry entry points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Role,
    Channel,
    Webhook,
    Emoji,
    Category,
}

impl ResourceKind {
    /// Stable storage representation, matches the schema CHECK constraint.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Role => "role",
            Self::Channel => "channel",
            Self::Webhook => "webhook",
            Self::Emoji => "emoji",
            Self::Category => "category",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "role" => Ok(Self::Role),
            "channel" => Ok(Self::Channel),
            "webhook" => Ok(Self::Webhook),
            "emoji" => Ok(Self::Emoji),
            "category" => Ok(Self::Category),
            _ => Err(()),
        }
    }
}

/// A resolved registry entry.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub guild_id: i64,
    pub key: String,
    pub kind: ResourceKind,
    pub external_id: i64,
    pub meta: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

/// Repository for resource registry entries.
pub struct RegistryRepository<'a> {
    pool: &'a PgPool,
}

impl<'a> RegistryRepository<'a> {
    /// Create a new registry repository.
    pub fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Look up an entry by logical key.
    pub async fn get(&self, guild_id: i64, key: &str) -> Result<Option<RegistryEntry>, DbError> {
        let row = sqlx::query_as::<_, (String, i64, serde_json::Value, DateTime<Utc>)>(
            r#"
            SELECT kind, external_id, meta, updated_at
            FROM tss.resource_registry
            WHERE guild_id = $1 AND key = $2
            "#,
        )
        .bind(guild_id)
        .bind(key)
        .fetch_optional(self.pool)
        .await?;

        row.map(|(kind, external_id, meta, updated_at)| {
            Ok(RegistryEntry {
                guild_id,
                key: key.to_string(),
                kind: parse_kind(&kind)?,
                external_id,
                meta,
                updated_at,
            })
        })
        .transpose()
    }

    /// List all entries for a guild, ordered by key.
    pub async fn list(&self, guild_id: i64) -> Result<Vec<RegistryEntry>, DbError> {
        let rows = sqlx::query_as::<_, (String, String, i64, serde_json::Value, DateTime<Utc>)>(
            r#"
            SELECT key, kind, external_id, meta, updated_at
            FROM tss.resource_registry
            WHERE guild_id = $1
            ORDER BY key
            "#,
        )
        .bind(guild_id)
        .fetch_all(self.pool)
        .await?;

        rows.into_iter()
            .map(|(key, kind, external_id, meta, updated_at)| {
                Ok(RegistryEntry {
                    guild_id,
                    key,
                    kind: parse_kind(&kind)?,
                    external_id,
                    meta,
                    updated_at,
                })
            })
            .collect()
    }

    /// Delete an entry. Returns whether a row was removed. Deleting and
    /// recreating is the only way to change a key's kind.
    pub async fn delete(&self, guild_id: i64, key: &str) -> Result<bool, DbError> {
        let result = sqlx::query("DELETE FROM tss.resource_registry WHERE guild_id = $1 AND key = $2")
            .bind(guild_id)
            .bind(key)
            .execute(self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

/// Decode a stored kind discriminator.
///
/// The CHECK constraint keeps the column within the known set, so a miss here
/// means the schema and this binary disagree.
pub(crate) fn parse_kind(raw: &str) -> Result<ResourceKind, DbError> {
    raw.parse().map_err(|()| {
        DbError::Sqlx(sqlx::Error::Decode(
            format!("unknown resource kind {raw:?}").into(),
        ))
    })
}
