//! Resource registry: guild-scoped logical keys for platform handles.
//!
//! Engines resolve "the mute role" or "the quarantine channel" through here
//! instead of carrying raw platform ids in code or config. A key's kind is
//! immutable once set; re-registering with another kind fails and requires
//! delete + recreate, so a key can never silently change meaning.

use crate::db::{Database, DbError, RegistryEntry, ResourceKind, audit};
use crate::error::{EngineError, EngineResult};
use chrono::{DateTime, Utc};
use serde_json::json;

/// Well-known registry keys the engines look up themselves.
pub mod keys {
    /// Role granted by role-method mutes.
    pub const MUTE_ROLE: &str = "mute-role";
}

/// Typed key/value store over `tss.resource_registry`.
pub struct Registry {
    db: Database,
}

impl Registry {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Resolve a logical key to its platform handle.
    pub async fn resolve(&self, guild_id: i64, key: &str) -> EngineResult<RegistryEntry> {
        self.db
            .registry()
            .get(guild_id, key)
            .await?
            .ok_or(EngineError::NotFound("registry key"))
    }

    /// Upsert a registry entry. Fails with `KindMismatch` when the key
    /// already exists under a different kind; the id and metadata of a
    /// same-kind entry are replaced in place.
    pub async fn register(
        &self,
        guild_id: i64,
        actor_id: i64,
        key: &str,
        kind: ResourceKind,
        external_id: i64,
        meta: serde_json::Value,
    ) -> EngineResult<RegistryEntry> {
        if key.is_empty() {
            return Err(EngineError::Validation("registry key must not be empty".into()));
        }

        let mut tx = self.db.pool().begin().await.map_err(DbError::from)?;

        // The kind guard lives in the upsert itself: a conflicting row of a
        // different kind makes the DO UPDATE a no-op and returns nothing.
        let row: Option<(DateTime<Utc>,)> = sqlx::query_as(
            r#"
            INSERT INTO tss.resource_registry (guild_id, key, kind, external_id, meta, updated_at)
            VALUES ($1, $2, $3, $4, $5, now())
            ON CONFLICT (guild_id, key) DO UPDATE
                SET external_id = EXCLUDED.external_id,
                    meta = EXCLUDED.meta,
                    updated_at = now()
                WHERE tss.resource_registry.kind = EXCLUDED.kind
            RETURNING updated_at
            "#,
        )
        .bind(guild_id)
        .bind(key)
        .bind(kind.as_str())
        .bind(external_id)
        .bind(&meta)
        .fetch_optional(&mut *tx)
        .await
        .map_err(DbError::from)?;

        let Some((updated_at,)) = row else {
            let have: Option<String> = sqlx::query_scalar(
                "SELECT kind FROM tss.resource_registry WHERE guild_id = $1 AND key = $2",
            )
            .bind(guild_id)
            .bind(key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(DbError::from)?;

            return Err(EngineError::KindMismatch {
                key: key.to_string(),
                have: have.unwrap_or_else(|| "unknown".into()),
                want: kind.as_str().to_string(),
            });
        };

        audit::record(
            &mut *tx,
            guild_id,
            Some(actor_id),
            "resource.registered",
            json!({ "key": key, "kind": kind.as_str(), "external_id": external_id }),
        )
        .await?;

        tx.commit().await.map_err(DbError::from)?;

        Ok(RegistryEntry {
            guild_id,
            key: key.to_string(),
            kind,
            external_id,
            meta,
            updated_at,
        })
    }

    /// Remove a registry entry. Returns false when the key was absent.
    pub async fn unregister(&self, guild_id: i64, actor_id: i64, key: &str) -> EngineResult<bool> {
        let mut tx = self.db.pool().begin().await.map_err(DbError::from)?;

        let removed: Option<(String,)> = sqlx::query_as(
            r#"
            DELETE FROM tss.resource_registry
            WHERE guild_id = $1 AND key = $2
            RETURNING kind
            "#,
        )
        .bind(guild_id)
        .bind(key)
        .fetch_optional(&mut *tx)
        .await
        .map_err(DbError::from)?;

        let Some((kind,)) = removed else {
            tx.commit().await.map_err(DbError::from)?;
            return Ok(false);
        };

        audit::record(
            &mut *tx,
            guild_id,
            Some(actor_id),
            "resource.unregistered",
            json!({ "key": key, "kind": kind }),
        )
        .await?;

        tx.commit().await.map_err(DbError::from)?;
        Ok(true)
    }

    /// All entries for a guild, ordered by key.
    pub async fn list(&self, guild_id: i64) -> EngineResult<Vec<RegistryEntry>> {
        Ok(self.db.registry().list(guild_id).await?)
    }
}
