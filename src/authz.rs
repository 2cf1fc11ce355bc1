//! Capability authorizer.
//!
//! Capabilities are flat named grants checked by membership, not a
//! hierarchy: an actor may perform a privileged operation iff at least one
//! of the roles they hold has a grant row for the capability's name. Every
//! engine consults this gate before a privileged mutation; a denial is a
//! surfaced error, never a silent no-op.

use crate::db::{Database, DbError, audit};
use crate::error::{EngineError, EngineResult};
use chrono::{DateTime, Utc};
use serde_json::json;

/// Capability names used by the built-in dispatch paths. Grants are free-form
/// strings; these are the ones the engines themselves check.
pub mod caps {
    /// Issue warnings.
    pub const WARN_ISSUE: &str = "warn.issue";
    /// Read a user's warn history.
    pub const WARN_LIST: &str = "warn.list";
    /// Apply or extend mutes.
    pub const MUTE_APPLY: &str = "mute.apply";
    /// Lift mutes.
    pub const MUTE_LIFT: &str = "mute.lift";
    /// Arm/disarm antinuke and run containment or rollback.
    pub const ANTINUKE_MANAGE: &str = "antinuke.manage";
    /// Modify the resource registry.
    pub const REGISTRY_WRITE: &str = "registry.write";
    /// Modify per-guild engine configuration.
    pub const CONFIG_WRITE: &str = "config.write";
}

/// Resolves whether a role set holds a named capability within a guild.
pub struct Authorizer {
    db: Database,
}

impl Authorizer {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Membership test. True iff any role in the set has a matching grant.
    /// No side effects.
    pub async fn has_capability(
        &self,
        guild_id: i64,
        role_ids: &[i64],
        capability: &str,
    ) -> EngineResult<bool> {
        Ok(self
            .db
            .capabilities()
            .any_role_has(guild_id, role_ids, capability)
            .await?)
    }

    /// Gate form of [`Self::has_capability`]: errors on a missing grant.
    pub async fn require_capability(
        &self,
        guild_id: i64,
        role_ids: &[i64],
        capability: &'static str,
    ) -> EngineResult<()> {
        if self.has_capability(guild_id, role_ids, capability).await? {
            Ok(())
        } else {
            Err(EngineError::AuthorizationDenied { capability })
        }
    }

    /// Grant a capability to a role. Returns false when the grant already
    /// existed. Grants carry no quantity or expiry; re-granting is a no-op.
    pub async fn grant(
        &self,
        guild_id: i64,
        role_id: i64,
        capability: &str,
        actor_id: i64,
    ) -> EngineResult<bool> {
        if capability.is_empty() {
            return Err(EngineError::Validation("capability name must not be empty".into()));
        }

        let mut tx = self.db.pool().begin().await.map_err(DbError::from)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO tss.role_capabilities (guild_id, role_id, capability)
            VALUES ($1, $2, $3)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(guild_id)
        .bind(role_id)
        .bind(capability)
        .execute(&mut *tx)
        .await
        .map_err(DbError::from)?
        .rows_affected()
            > 0;

        if inserted {
            audit::record(
                &mut *tx,
                guild_id,
                Some(actor_id),
                "capability.granted",
                json!({ "role_id": role_id, "capability": capability }),
            )
            .await?;
        }

        tx.commit().await.map_err(DbError::from)?;
        Ok(inserted)
    }

    /// Revoke a capability from a role. Returns false when no grant existed.
    pub async fn revoke(
        &self,
        guild_id: i64,
        role_id: i64,
        capability: &str,
        actor_id: i64,
    ) -> EngineResult<bool> {
        let mut tx = self.db.pool().begin().await.map_err(DbError::from)?;

        let removed = sqlx::query(
            r#"
            DELETE FROM tss.role_capabilities
            WHERE guild_id = $1 AND role_id = $2 AND capability = $3
            "#,
        )
        .bind(guild_id)
        .bind(role_id)
        .bind(capability)
        .execute(&mut *tx)
        .await
        .map_err(DbError::from)?
        .rows_affected()
            > 0;

        if removed {
            audit::record(
                &mut *tx,
                guild_id,
                Some(actor_id),
                "capability.revoked",
                json!({ "role_id": role_id, "capability": capability }),
            )
            .await?;
        }

        tx.commit().await.map_err(DbError::from)?;
        Ok(removed)
    }

    /// Capabilities granted to one role, with grant timestamps.
    pub async fn list_for_role(
        &self,
        guild_id: i64,
        role_id: i64,
    ) -> EngineResult<Vec<(String, DateTime<Utc>)>> {
        Ok(self.db.capabilities().list_for_role(guild_id, role_id).await?)
    }
}
