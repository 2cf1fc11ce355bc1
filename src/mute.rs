//! Mute engine: time-bounded mute lifecycle with a scheduled expiry sweep.
//!
//! A mute case is `Active` from creation until its single terminal
//! transition to `Lifted`, either explicitly or by the expiry sweep.
//! Exclusivity (one active case per guild/user) and the terminal transition
//! are both enforced with single conditional statements, so concurrent
//! workers cannot double-apply or double-lift; in-process locks guard
//! nothing here.

use crate::db::mutes::{MUTE_CASE_COLUMNS, MuteCaseRow, case_from_row};
use crate::db::{Database, DbError, MuteCase, MuteMethod, audit};
use crate::error::{EngineError, EngineResult};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

/// Per-guild mute tunables, stored as the JSONB `cfg` document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MuteConfig {
    /// Default mute length in minutes when the caller gives no duration.
    /// Zero means indefinite.
    #[serde(default = "default_minutes")]
    pub default_minutes: i64,
    /// Preferred enforcement method for new mutes.
    #[serde(default)]
    pub preferred_method: MutePreference,
}

impl Default for MuteConfig {
    fn default() -> Self {
        Self {
            default_minutes: default_minutes(),
            preferred_method: MutePreference::default(),
        }
    }
}

fn default_minutes() -> i64 {
    30
}

/// Which enforcement method new mutes should use.
///
/// `Role` needs a mute role in the resource registry; callers fall back to
/// the platform timeout when none is registered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutePreference {
    Role,
    #[default]
    Timeout,
}

/// Mute lifecycle manager.
pub struct MuteEngine {
    db: Database,
    cfg_cache: DashMap<i64, MuteConfig>,
}

impl MuteEngine {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            cfg_cache: DashMap::new(),
        }
    }

    /// Effective mute config for a guild: cached, stored, or default.
    pub async fn config(&self, guild_id: i64) -> EngineResult<MuteConfig> {
        if let Some(cfg) = self.cfg_cache.get(&guild_id) {
            return Ok(cfg.clone());
        }

        let cfg = match self.db.mutes().load_config(guild_id).await? {
            Some(doc) => serde_json::from_value(doc).unwrap_or_else(|e| {
                warn!(guild_id, error = %e, "stored mute config is invalid, using defaults");
                MuteConfig::default()
            }),
            None => MuteConfig::default(),
        };

        self.cfg_cache.insert(guild_id, cfg.clone());
        Ok(cfg)
    }

    /// Replace a guild's mute config (write-through cache).
    pub async fn set_config(
        &self,
        guild_id: i64,
        actor_id: i64,
        cfg: MuteConfig,
    ) -> EngineResult<()> {
        let doc = serde_json::to_value(&cfg).map_err(DbError::BadDocument)?;
        self.db.mutes().save_config(guild_id, doc.clone()).await?;
        self.cfg_cache.insert(guild_id, cfg);
        audit::record(
            self.db.pool(),
            guild_id,
            Some(actor_id),
            "mute.config_set",
            doc,
        )
        .await?;
        Ok(())
    }

    /// Apply a mute. Fails with `Conflict` while an active case exists for
    /// the pair; callers wanting a longer mute use [`Self::extend_mute`].
    /// `until = None` mutes indefinitely.
    pub async fn apply_mute(
        &self,
        guild_id: i64,
        user_id: i64,
        moderator_id: i64,
        reason: &str,
        evidence: Option<&str>,
        until: Option<DateTime<Utc>>,
        method: MuteMethod,
    ) -> EngineResult<MuteCase> {
        let (method_str, role_id) = method.to_columns();

        let mut tx = self.db.pool().begin().await.map_err(DbError::from)?;

        // Exclusivity check and insert as one conditional statement, per the
        // shared-store contract: no separate read-then-write window.
        let row: Option<MuteCaseRow> = sqlx::query_as(&format!(
            r#"
            INSERT INTO tss.mute_cases
                (guild_id, user_id, moderator_id, reason, evidence, until, method, role_id)
            SELECT $1, $2, $3, $4, $5, $6, $7, $8
            WHERE NOT EXISTS (
                SELECT 1 FROM tss.mute_cases
                WHERE guild_id = $1 AND user_id = $2 AND unmuted_at IS NULL
            )
            RETURNING {MUTE_CASE_COLUMNS}
            "#
        ))
        .bind(guild_id)
        .bind(user_id)
        .bind(moderator_id)
        .bind(reason)
        .bind(evidence)
        .bind(until)
        .bind(method_str)
        .bind(role_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(DbError::from)?;

        let Some(row) = row else {
            return Err(EngineError::Conflict("an active mute already exists"));
        };
        let case = case_from_row(row);

        audit::record(
            &mut *tx,
            guild_id,
            Some(moderator_id),
            "mute.applied",
            json!({
                "case_id": case.id,
                "user_id": user_id,
                "method": method_str,
                "until": until,
            }),
        )
        .await?;

        tx.commit().await.map_err(DbError::from)?;

        crate::metrics::record_mute_applied(method_str);

        Ok(case)
    }

    /// Move the active case's expiry. The case stays `Active`; only the
    /// deadline changes. Fails with `NotFound` when nothing is active.
    pub async fn extend_mute(
        &self,
        guild_id: i64,
        user_id: i64,
        actor_id: i64,
        new_until: DateTime<Utc>,
    ) -> EngineResult<MuteCase> {
        let mut tx = self.db.pool().begin().await.map_err(DbError::from)?;

        let row: Option<MuteCaseRow> = sqlx::query_as(&format!(
            r#"
            UPDATE tss.mute_cases
               SET until = $3
             WHERE guild_id = $1 AND user_id = $2 AND unmuted_at IS NULL
            RETURNING {MUTE_CASE_COLUMNS}
            "#
        ))
        .bind(guild_id)
        .bind(user_id)
        .bind(new_until)
        .fetch_optional(&mut *tx)
        .await
        .map_err(DbError::from)?;

        let Some(row) = row else {
            return Err(EngineError::NotFound("active mute"));
        };
        let case = case_from_row(row);

        audit::record(
            &mut *tx,
            guild_id,
            Some(actor_id),
            "mute.extended",
            json!({
                "case_id": case.id,
                "user_id": user_id,
                "until": new_until,
            }),
        )
        .await?;

        tx.commit().await.map_err(DbError::from)?;

        Ok(case)
    }

    /// Lift the active case, stamping who ended it and why. Fails with
    /// `NotFound` when nothing is active.
    pub async fn lift_mute(
        &self,
        guild_id: i64,
        user_id: i64,
        actor_id: i64,
        reason: &str,
    ) -> EngineResult<MuteCase> {
        let mut tx = self.db.pool().begin().await.map_err(DbError::from)?;

        let row: Option<MuteCaseRow> = sqlx::query_as(&format!(
            r#"
            UPDATE tss.mute_cases
               SET unmuted_at = now(), unmuted_by = $3, unmute_reason = $4
             WHERE guild_id = $1 AND user_id = $2 AND unmuted_at IS NULL
            RETURNING {MUTE_CASE_COLUMNS}
            "#
        ))
        .bind(guild_id)
        .bind(user_id)
        .bind(actor_id)
        .bind(reason)
        .fetch_optional(&mut *tx)
        .await
        .map_err(DbError::from)?;

        let Some(row) = row else {
            return Err(EngineError::NotFound("active mute"));
        };
        let case = case_from_row(row);

        audit::record(
            &mut *tx,
            guild_id,
            Some(actor_id),
            "mute.lifted",
            json!({
                "case_id": case.id,
                "user_id": user_id,
                "reason": reason,
            }),
        )
        .await?;

        tx.commit().await.map_err(DbError::from)?;

        crate::metrics::record_mute_lifted("manual");

        Ok(case)
    }

    /// Lift every active case whose deadline has passed. System action:
    /// `unmuted_by` stays NULL, reason is "expired".
    ///
    /// The conditional update makes the sweep idempotent: a case can only
    /// match while `unmuted_at IS NULL`, so concurrent sweeps lift each case
    /// exactly once and the losers see it as already gone. Returned cases
    /// still carry their enforcement method so the caller can emit the
    /// matching un-enforcement directives.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> EngineResult<Vec<MuteCase>> {
        let mut tx = self.db.pool().begin().await.map_err(DbError::from)?;

        let rows: Vec<MuteCaseRow> = sqlx::query_as(&format!(
            r#"
            UPDATE tss.mute_cases
               SET unmuted_at = $1, unmuted_by = NULL, unmute_reason = 'expired'
             WHERE unmuted_at IS NULL AND until IS NOT NULL AND until <= $1
            RETURNING {MUTE_CASE_COLUMNS}
            "#
        ))
        .bind(now)
        .fetch_all(&mut *tx)
        .await
        .map_err(DbError::from)?;

        let lifted: Vec<MuteCase> = rows.into_iter().map(case_from_row).collect();

        for case in &lifted {
            audit::record(
                &mut *tx,
                case.guild_id,
                None,
                "mute.expired",
                json!({
                    "case_id": case.id,
                    "user_id": case.user_id,
                }),
            )
            .await?;
        }

        tx.commit().await.map_err(DbError::from)?;

        if !lifted.is_empty() {
            debug!(count = lifted.len(), "expired mutes lifted");
            for _ in &lifted {
                crate::metrics::record_mute_lifted("expired");
            }
        }

        Ok(lifted)
    }

    /// The active case for a user, if any.
    pub async fn active_case(&self, guild_id: i64, user_id: i64) -> EngineResult<Option<MuteCase>> {
        Ok(self.db.mutes().active_case(guild_id, user_id).await?)
    }

    /// Mute history for a user, newest first.
    pub async fn history(
        &self,
        guild_id: i64,
        user_id: i64,
        limit: i64,
    ) -> EngineResult<Vec<MuteCase>> {
        let limit = limit.clamp(1, 100);
        Ok(self.db.mutes().history(guild_id, user_id, limit).await?)
    }
}

/// Parse a human duration ("15m", "2h", "1d", bare minutes, "0" for
/// indefinite) into minutes.
pub fn parse_duration_minutes(s: &str) -> Option<i64> {
    let t = s.trim().to_lowercase();
    if t == "0" {
        return Some(0);
    }
    if let Ok(n) = t.parse::<i64>() {
        return (n >= 0).then_some(n);
    }

    let unit = t.chars().last()?;
    let n = t[..t.len() - unit.len_utf8()].parse::<i64>().ok()?;
    if n < 0 {
        return None;
    }
    match unit {
        'm' => Some(n),
        'h' => Some(n.saturating_mul(60)),
        'd' => Some(n.saturating_mul(60 * 24)),
        _ => None,
    }
}
