//! Warn engine: points accumulation, lazy decay, threshold escalation.
//!
//! Points shrink over elapsed time without a dedicated scheduler: decay is a
//! pure function of `(now, last_decay_at, config)` applied on every read and
//! write of the accumulator. Threshold escalation is *reported*, never
//! applied - the caller decides whether the returned action becomes a
//! directive, so dry-run and confirmation flows stay possible.

use crate::db::{Database, DbError, WarnCase, audit};
use crate::error::{EngineError, EngineResult};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

/// Per-guild warn tunables, stored as the JSONB `cfg` document.
///
/// Field defaults keep partially-written documents loadable; a guild with no
/// row at all gets `WarnConfig::default()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarnConfig {
    /// Days per decay interval. Zero disables decay.
    #[serde(default = "default_decay_days")]
    pub decay_days: i64,
    /// Points removed per elapsed whole interval.
    #[serde(default = "default_decay_points")]
    pub decay_points: i32,
    /// Point total at which a timeout is suggested.
    #[serde(default = "default_timeout_pts")]
    pub timeout_pts: i32,
    /// Suggested timeout length in hours.
    #[serde(default = "default_timeout_hours")]
    pub timeout_hours: i64,
    /// Point total at which a kick is suggested.
    #[serde(default = "default_kick_pts")]
    pub kick_pts: i32,
    /// Point total at which a ban is suggested.
    #[serde(default = "default_ban_pts")]
    pub ban_pts: i32,
}

impl Default for WarnConfig {
    fn default() -> Self {
        Self {
            decay_days: default_decay_days(),
            decay_points: default_decay_points(),
            timeout_pts: default_timeout_pts(),
            timeout_hours: default_timeout_hours(),
            kick_pts: default_kick_pts(),
            ban_pts: default_ban_pts(),
        }
    }
}

impl WarnConfig {
    /// Escalation requires ascending tiers: timeout <= kick <= ban.
    fn thresholds_ascending(&self) -> bool {
        self.timeout_pts > 0 && self.timeout_pts <= self.kick_pts && self.kick_pts <= self.ban_pts
    }
}

fn default_decay_days() -> i64 {
    30
}
fn default_decay_points() -> i32 {
    3
}
fn default_timeout_pts() -> i32 {
    3
}
fn default_timeout_hours() -> i64 {
    12
}
fn default_kick_pts() -> i32 {
    6
}
fn default_ban_pts() -> i32 {
    9
}

/// Escalation suggested by a threshold crossing. Highest tier only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdAction {
    Timeout { hours: i64 },
    Kick,
    Ban,
}

impl ThresholdAction {
    /// Stable name for audit payloads and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::Kick => "kick",
            Self::Ban => "ban",
        }
    }
}

/// Result of issuing a warn.
#[derive(Debug, Clone)]
pub struct WarnOutcome {
    pub case: WarnCase,
    /// Post-update, post-decay total for the user.
    pub total: i32,
    /// Suggested escalation, if a threshold was met.
    pub action: Option<ThresholdAction>,
}

/// Warn points accumulator with time decay and threshold escalation.
pub struct WarnEngine {
    db: Database,
    cfg_cache: DashMap<i64, WarnConfig>,
}

impl WarnEngine {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            cfg_cache: DashMap::new(),
        }
    }

    /// Effective warn config for a guild: cached, stored, or default.
    pub async fn config(&self, guild_id: i64) -> EngineResult<WarnConfig> {
        if let Some(cfg) = self.cfg_cache.get(&guild_id) {
            return Ok(cfg.clone());
        }

        let cfg = match self.db.warns().load_config(guild_id).await? {
            Some(doc) => serde_json::from_value(doc).unwrap_or_else(|e| {
                warn!(guild_id, error = %e, "stored warn config is invalid, using defaults");
                WarnConfig::default()
            }),
            None => WarnConfig::default(),
        };

        self.cfg_cache.insert(guild_id, cfg.clone());
        Ok(cfg)
    }

    /// Replace a guild's warn config (write-through cache).
    pub async fn set_config(
        &self,
        guild_id: i64,
        actor_id: i64,
        cfg: WarnConfig,
    ) -> EngineResult<()> {
        let doc = serde_json::to_value(&cfg).map_err(DbError::BadDocument)?;
        self.db.warns().save_config(guild_id, doc.clone()).await?;
        self.cfg_cache.insert(guild_id, cfg);
        audit::record(
            self.db.pool(),
            guild_id,
            Some(actor_id),
            "warn.config_set",
            doc,
        )
        .await?;
        Ok(())
    }

    /// Issue a warning: insert the immutable case, recompute the accumulator
    /// (decay first, then add) and report the highest escalation tier the new
    /// total reaches.
    ///
    /// The case insert, the accumulator recompute and the audit entry are one
    /// transaction; the accumulator row is locked for the duration so
    /// concurrent warns against the same user serialize.
    pub async fn issue_warn(
        &self,
        guild_id: i64,
        user_id: i64,
        moderator_id: i64,
        points: i32,
        reason: &str,
        evidence: Option<&str>,
    ) -> EngineResult<WarnOutcome> {
        if points <= 0 {
            return Err(EngineError::Validation(format!(
                "warn points must be positive, got {points}"
            )));
        }

        let cfg = self.config(guild_id).await?;
        let now = Utc::now();

        let mut tx = self.db.pool().begin().await.map_err(DbError::from)?;

        let (case_id, created_at): (i64, DateTime<Utc>) = sqlx::query_as(
            r#"
            INSERT INTO tss.warn_cases (guild_id, user_id, moderator_id, points, reason, evidence)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, created_at
            "#,
        )
        .bind(guild_id)
        .bind(user_id)
        .bind(moderator_id)
        .bind(points)
        .bind(reason)
        .bind(evidence)
        .fetch_one(&mut *tx)
        .await
        .map_err(DbError::from)?;

        // Ensure the accumulator row exists, then take the row lock. Two
        // first warns racing both pass the insert (one wins, one no-ops) and
        // serialize on the lock.
        sqlx::query(
            r#"
            INSERT INTO tss.warn_points (guild_id, user_id, total, last_decay_at, updated_at)
            VALUES ($1, $2, 0, $3, $3)
            ON CONFLICT (guild_id, user_id) DO NOTHING
            "#,
        )
        .bind(guild_id)
        .bind(user_id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(DbError::from)?;

        let (stored, last_decay_at): (i32, Option<DateTime<Utc>>) = sqlx::query_as(
            r#"
            SELECT total, last_decay_at
            FROM tss.warn_points
            WHERE guild_id = $1 AND user_id = $2
            FOR UPDATE
            "#,
        )
        .bind(guild_id)
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(DbError::from)?;

        // Rows written before decay tracking anchor on the earliest case,
        // per the accumulator's definition.
        let anchor = match last_decay_at {
            Some(at) => at,
            None => {
                let earliest: Option<DateTime<Utc>> = sqlx::query_scalar(
                    "SELECT MIN(created_at) FROM tss.warn_cases WHERE guild_id = $1 AND user_id = $2",
                )
                .bind(guild_id)
                .bind(user_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(DbError::from)?;
                earliest.unwrap_or(now)
            }
        };

        let decay = decay_state(stored, anchor, now, &cfg);
        let total = decay.total.saturating_add(points);

        sqlx::query(
            r#"
            UPDATE tss.warn_points
               SET total = $3, last_decay_at = $4, updated_at = $5
             WHERE guild_id = $1 AND user_id = $2
            "#,
        )
        .bind(guild_id)
        .bind(user_id)
        .bind(total)
        .bind(decay.anchor)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(DbError::from)?;

        let action = evaluate_thresholds(total, &cfg);

        audit::record(
            &mut *tx,
            guild_id,
            Some(moderator_id),
            "warn.issued",
            json!({
                "case_id": case_id,
                "user_id": user_id,
                "points": points,
                "total": total,
                "action": action.map(|a| a.as_str()),
            }),
        )
        .await?;

        tx.commit().await.map_err(DbError::from)?;

        crate::metrics::record_warn_issued(action.map(|a| a.as_str()));

        Ok(WarnOutcome {
            case: WarnCase {
                id: case_id,
                guild_id,
                user_id,
                moderator_id,
                points,
                reason: reason.to_string(),
                evidence: evidence.map(str::to_string),
                created_at,
            },
            total,
            action,
        })
    }

    /// Current decayed point total for a user. Pure read; the stored row is
    /// not rewritten, the decay is recomputed against the same anchor next
    /// time.
    pub async fn get_points(&self, guild_id: i64, user_id: i64) -> EngineResult<i32> {
        let Some(row) = self.db.warns().points_row(guild_id, user_id).await? else {
            return Ok(0);
        };

        let anchor = match row.last_decay_at {
            Some(at) => at,
            None => match self.db.warns().earliest_case_at(guild_id, user_id).await? {
                Some(at) => at,
                None => return Ok(row.total),
            },
        };

        let cfg = self.config(guild_id).await?;
        Ok(decay_state(row.total, anchor, Utc::now(), &cfg).total)
    }

    /// Case history, newest first. `before` is an exclusive case-id cursor.
    pub async fn list_cases(
        &self,
        guild_id: i64,
        user_id: i64,
        limit: i64,
        before: Option<i64>,
    ) -> EngineResult<Vec<WarnCase>> {
        let limit = limit.clamp(1, 100);
        Ok(self
            .db
            .warns()
            .list_cases(guild_id, user_id, limit, before)
            .await?)
    }
}

/// Decayed view of a stored total: the pure function behind point reads.
/// Exposed for callers that already hold the accumulator row.
pub fn decayed_total(
    total: i32,
    last_decay_at: DateTime<Utc>,
    now: DateTime<Utc>,
    cfg: &WarnConfig,
) -> i32 {
    decay_state(total, last_decay_at, now, cfg).total
}

/// Outcome of applying pending decay to an accumulator value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DecayState {
    /// Decayed total, clamped at zero.
    total: i32,
    /// New decay anchor: advanced by the consumed whole intervals only, so
    /// partial-interval progress carries over to the next computation.
    anchor: DateTime<Utc>,
}

/// Apply pending decay: whole elapsed intervals times the per-interval
/// amount, never below zero.
fn decay_state(total: i32, anchor: DateTime<Utc>, now: DateTime<Utc>, cfg: &WarnConfig) -> DecayState {
    if cfg.decay_days <= 0 || cfg.decay_points <= 0 {
        return DecayState { total, anchor };
    }

    let interval_secs = cfg.decay_days * 86_400;
    let elapsed_secs = (now - anchor).num_seconds();
    if elapsed_secs < interval_secs {
        return DecayState { total, anchor };
    }

    let intervals = elapsed_secs / interval_secs;
    let removed = intervals.saturating_mul(cfg.decay_points as i64);
    let decayed = (total as i64 - removed).max(0) as i32;

    DecayState {
        total: decayed,
        anchor: anchor + Duration::seconds(intervals * interval_secs),
    }
}

/// Highest escalation tier the total reaches, evaluated ascending.
///
/// Non-ascending tier configs degrade to the defaults rather than blocking
/// the warn: moderation must not be stopped by a bad config document.
fn evaluate_thresholds(total: i32, cfg: &WarnConfig) -> Option<ThresholdAction> {
    let effective: std::borrow::Cow<'_, WarnConfig> = if cfg.thresholds_ascending() {
        std::borrow::Cow::Borrowed(cfg)
    } else {
        warn!(
            timeout_pts = cfg.timeout_pts,
            kick_pts = cfg.kick_pts,
            ban_pts = cfg.ban_pts,
            "warn thresholds are not ascending, falling back to defaults"
        );
        std::borrow::Cow::Owned(WarnConfig::default())
    };

    if total >= effective.ban_pts {
        Some(ThresholdAction::Ban)
    } else if total >= effective.kick_pts {
        Some(ThresholdAction::Kick)
    } else if total >= effective.timeout_pts {
        Some(ThresholdAction::Timeout {
            hours: effective.timeout_hours,
        })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decay_removes_whole_intervals_only() {
        let cfg = WarnConfig::default(); // 30d interval, 3 points each
        let now = Utc::now();

        // 61 days: two whole intervals, 9 - 2*3 = 3.
        let anchor = now - Duration::days(61);
        let state = decay_state(9, anchor, now, &cfg);
        assert_eq!(state.total, 3);
        // Anchor advanced by exactly 60 days, keeping the spare day.
        assert_eq!(state.anchor, anchor + Duration::days(60));

        // 29 days: nothing decays, anchor untouched.
        let anchor = now - Duration::days(29);
        let state = decay_state(9, anchor, now, &cfg);
        assert_eq!(state.total, 9);
        assert_eq!(state.anchor, anchor);
    }

    #[test]
    fn decay_clamps_at_zero() {
        let cfg = WarnConfig::default();
        let now = Utc::now();
        let state = decay_state(4, now - Duration::days(365), now, &cfg);
        assert_eq!(state.total, 0);
    }

    #[test]
    fn decay_disabled_when_interval_is_zero() {
        let cfg = WarnConfig {
            decay_days: 0,
            ..WarnConfig::default()
        };
        let now = Utc::now();
        let state = decay_state(9, now - Duration::days(400), now, &cfg);
        assert_eq!(state.total, 9);
    }

    #[test]
    fn thresholds_pick_highest_tier_only() {
        let cfg = WarnConfig::default(); // 3 / 6 / 9

        assert_eq!(evaluate_thresholds(2, &cfg), None);
        assert_eq!(
            evaluate_thresholds(3, &cfg),
            Some(ThresholdAction::Timeout { hours: 12 })
        );
        assert_eq!(evaluate_thresholds(7, &cfg), Some(ThresholdAction::Kick));
        assert_eq!(evaluate_thresholds(9, &cfg), Some(ThresholdAction::Ban));
        assert_eq!(evaluate_thresholds(40, &cfg), Some(ThresholdAction::Ban));
    }

    #[test]
    fn misconfigured_thresholds_fall_back_to_defaults() {
        let cfg = WarnConfig {
            timeout_pts: 10,
            kick_pts: 5,
            ban_pts: 1,
            ..WarnConfig::default()
        };

        // Defaults apply: 3 points suggests a timeout, not a ban.
        assert_eq!(
            evaluate_thresholds(3, &cfg),
            Some(ThresholdAction::Timeout { hours: 12 })
        );
        assert_eq!(evaluate_thresholds(9, &cfg), Some(ThresholdAction::Ban));
    }

    #[test]
    fn partial_config_document_fills_defaults() {
        let cfg: WarnConfig = serde_json::from_str(r#"{"kick_pts": 8}"#).unwrap();
        assert_eq!(cfg.kick_pts, 8);
        assert_eq!(cfg.decay_days, 30);
        assert_eq!(cfg.ban_pts, 9);
    }
}
