//! Antinuke engine: incident response for mass-destructive activity.
//!
//! Burst counts come from the event tap; this engine is policy only. A guild
//! that opted in is `Armed` until an incident opens, and returns to `Armed`
//! once the incident goes quiet for the configured cooldown. Both states are
//! derived from rows, never from process memory, so every worker sees the
//! same machine and restarts lose nothing.
//!
//! Containment never talks to the platform: the engine records what it
//! intends as ordered actions and hands [`Directive`]s to the external
//! applier.

pub mod snapshot;

use crate::config::AntinukeConfig;
use crate::db::{
    ACTION_CLOSE, Database, DbError, IncidentAction, IncidentRecord, antinuke::OPEN_INCIDENT_COND,
    audit,
};
use crate::directives::Directive;
use crate::error::{EngineError, EngineResult};
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use snapshot::GuildSnapshot;
use tracing::{info, warn};

/// How hard to react to an observed destructive burst.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BurstSeverity {
    /// Below the incident threshold; keep watching.
    Ignore,
    /// Open (or append to) an incident.
    Incident,
    /// Past the hard ceiling: contain the actor instead of chasing each
    /// destructive call, so remediation itself cannot be flooded.
    Quarantine,
}

/// Result of recording a suspicious burst.
#[derive(Debug, Clone)]
pub struct BurstOutcome {
    pub incident: IncidentRecord,
    /// False when the burst was appended to an already-open incident.
    pub newly_opened: bool,
}

/// Incident-response state machine over the antinuke tables.
pub struct AntinukeEngine {
    db: Database,
    policy: AntinukeConfig,
}

impl AntinukeEngine {
    pub fn new(db: Database, policy: AntinukeConfig) -> Self {
        Self { db, policy }
    }

    /// Classify a collaborator-supplied burst count against policy.
    pub fn assess_burst(&self, count: u32) -> BurstSeverity {
        assess_burst(&self.policy, count)
    }

    /// Horizon before which incident activity no longer counts as open.
    fn open_horizon(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::seconds(self.policy.close_cooldown_secs as i64)
    }

    /// Opt a guild into monitoring. Returns false if it already was.
    pub async fn arm(&self, guild_id: i64, actor_id: i64) -> EngineResult<bool> {
        let mut tx = self.db.pool().begin().await.map_err(DbError::from)?;

        let inserted = sqlx::query(
            "INSERT INTO tss.antinuke_guilds (guild_id) VALUES ($1) ON CONFLICT DO NOTHING",
        )
        .bind(guild_id)
        .execute(&mut *tx)
        .await
        .map_err(DbError::from)?
        .rows_affected()
            > 0;

        if inserted {
            audit::record(&mut *tx, guild_id, Some(actor_id), "antinuke.armed", json!({})).await?;
        }

        tx.commit().await.map_err(DbError::from)?;
        Ok(inserted)
    }

    /// Opt a guild out of monitoring. Returns false if it was not armed.
    pub async fn disarm(&self, guild_id: i64, actor_id: i64) -> EngineResult<bool> {
        let mut tx = self.db.pool().begin().await.map_err(DbError::from)?;

        let removed = sqlx::query("DELETE FROM tss.antinuke_guilds WHERE guild_id = $1")
            .bind(guild_id)
            .execute(&mut *tx)
            .await
            .map_err(DbError::from)?
            .rows_affected()
            > 0;

        if removed {
            audit::record(&mut *tx, guild_id, Some(actor_id), "antinuke.disarmed", json!({}))
                .await?;
        }

        tx.commit().await.map_err(DbError::from)?;
        Ok(removed)
    }

    /// Whether the guild is opted into monitoring.
    pub async fn is_armed(&self, guild_id: i64) -> EngineResult<bool> {
        Ok(self.db.antinuke().is_armed(guild_id).await?)
    }

    /// The open incident for a guild, if any.
    pub async fn open_incident(&self, guild_id: i64) -> EngineResult<Option<IncidentRecord>> {
        let horizon = self.open_horizon(Utc::now());
        Ok(self.db.antinuke().open_incident(guild_id, horizon).await?)
    }

    /// Record a suspicious burst. Opens a new incident, or appends to the
    /// guild's open one instead of creating a duplicate.
    ///
    /// Fails with `NotFound` when the guild never opted into monitoring.
    pub async fn record_suspicious_burst(
        &self,
        guild_id: i64,
        reason: &str,
        evidence: serde_json::Value,
    ) -> EngineResult<BurstOutcome> {
        let now = Utc::now();
        let horizon = self.open_horizon(now);

        let mut tx = self.db.pool().begin().await.map_err(DbError::from)?;

        let armed: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM tss.antinuke_guilds WHERE guild_id = $1)",
        )
        .bind(guild_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(DbError::from)?;
        if !armed {
            return Err(EngineError::NotFound("antinuke opt-in"));
        }

        // Dedup key is "an open incident exists": insert only when none does.
        let opened: Option<(i64, DateTime<Utc>)> = sqlx::query_as(&format!(
            r#"
            INSERT INTO tss.antinuke_incidents (guild_id, reason)
            SELECT $1, $3
            WHERE NOT EXISTS (
                SELECT 1 FROM tss.antinuke_incidents i
                WHERE i.guild_id = $1 AND {OPEN_INCIDENT_COND}
            )
            RETURNING id, created_at
            "#
        ))
        .bind(guild_id)
        .bind(horizon)
        .bind(reason)
        .fetch_optional(&mut *tx)
        .await
        .map_err(DbError::from)?;

        let outcome = match opened {
            Some((id, created_at)) => {
                audit::record(
                    &mut *tx,
                    guild_id,
                    None,
                    "incident.opened",
                    json!({ "incident_id": id, "reason": reason, "evidence": evidence }),
                )
                .await?;
                info!(guild_id, incident_id = id, reason, "antinuke incident opened");
                BurstOutcome {
                    incident: IncidentRecord {
                        id,
                        guild_id,
                        reason: reason.to_string(),
                        created_at,
                    },
                    newly_opened: true,
                }
            }
            None => {
                let existing: Option<(i64, String, DateTime<Utc>)> = sqlx::query_as(&format!(
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
                .fetch_optional(&mut *tx)
                .await
                .map_err(DbError::from)?;

                // The insert refused because an open incident existed, so the
                // row must be here; a miss means it closed mid-flight.
                let Some((id, open_reason, created_at)) = existing else {
                    return Err(EngineError::Conflict("incident state changed, retry"));
                };

                audit::record(
                    &mut *tx,
                    guild_id,
                    None,
                    "incident.noted",
                    json!({ "incident_id": id, "reason": reason, "evidence": evidence }),
                )
                .await?;
                BurstOutcome {
                    incident: IncidentRecord {
                        id,
                        guild_id,
                        reason: open_reason,
                        created_at,
                    },
                    newly_opened: false,
                }
            }
        };

        tx.commit().await.map_err(DbError::from)?;

        if outcome.newly_opened {
            crate::metrics::record_incident_opened();
        }

        Ok(outcome)
    }

    /// Store a point-in-time capture for an incident. Must run before the
    /// first containment action mutates live state, or rollback has nothing
    /// to replay.
    pub async fn snapshot(&self, incident_id: i64, state: &GuildSnapshot) -> EngineResult<i64> {
        let doc = serde_json::to_value(state).map_err(DbError::BadDocument)?;

        let mut tx = self.db.pool().begin().await.map_err(DbError::from)?;

        let guild_id = self.incident_guild(&mut tx, incident_id).await?;

        let snapshot_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO tss.antinuke_snapshots (incident_id, state)
            VALUES ($1, $2)
            RETURNING id
            "#,
        )
        .bind(incident_id)
        .bind(doc)
        .fetch_one(&mut *tx)
        .await
        .map_err(DbError::from)?;

        audit::record(
            &mut *tx,
            guild_id,
            None,
            "incident.snapshot",
            json!({
                "incident_id": incident_id,
                "snapshot_id": snapshot_id,
                "roles": state.roles.len(),
                "channels": state.channels.len(),
                "webhooks": state.webhooks.len(),
            }),
        )
        .await?;

        tx.commit().await.map_err(DbError::from)?;
        Ok(snapshot_id)
    }

    /// Append one containment step to the incident's ordered history.
    /// `actor_id = None` marks an autonomous engine action.
    pub async fn record_action(
        &self,
        incident_id: i64,
        actor_id: Option<i64>,
        kind: &str,
    ) -> EngineResult<IncidentAction> {
        if kind.is_empty() {
            return Err(EngineError::Validation("action kind must not be empty".into()));
        }
        if kind == ACTION_CLOSE {
            return Err(EngineError::Validation(
                "the close transition goes through close_incident".into(),
            ));
        }

        let mut tx = self.db.pool().begin().await.map_err(DbError::from)?;

        let guild_id = self.incident_guild(&mut tx, incident_id).await?;

        let (id, created_at): (i64, DateTime<Utc>) = sqlx::query_as(
            r#"
            INSERT INTO tss.antinuke_actions (incident_id, actor_id, kind)
            VALUES ($1, $2, $3)
            RETURNING id, created_at
            "#,
        )
        .bind(incident_id)
        .bind(actor_id)
        .bind(kind)
        .fetch_one(&mut *tx)
        .await
        .map_err(DbError::from)?;

        audit::record(
            &mut *tx,
            guild_id,
            actor_id,
            "incident.action",
            json!({ "incident_id": incident_id, "kind": kind }),
        )
        .await?;

        tx.commit().await.map_err(DbError::from)?;

        crate::metrics::record_incident_action(kind);

        Ok(IncidentAction {
            id,
            incident_id,
            actor_id,
            kind: kind.to_string(),
            created_at,
        })
    }

    /// Replay the incident's most recent snapshot as restorative directives
    /// for the external applier. The engine does not execute them.
    pub async fn rollback(&self, incident_id: i64, actor_id: Option<i64>) -> EngineResult<Vec<Directive>> {
        let incident = self
            .db
            .antinuke()
            .incident(incident_id)
            .await?
            .ok_or(EngineError::NotFound("incident"))?;

        let Some(record) = self.db.antinuke().latest_snapshot(incident_id).await? else {
            return Err(EngineError::NotFound("snapshot"));
        };

        let snap: GuildSnapshot =
            serde_json::from_value(record.state).map_err(DbError::BadDocument)?;
        if snap.is_empty() {
            warn!(incident_id, "rollback requested on an empty snapshot");
        }

        let directives = rollback_directives(incident.guild_id, &snap);

        let mut tx = self.db.pool().begin().await.map_err(DbError::from)?;

        sqlx::query(
            r#"
            INSERT INTO tss.antinuke_actions (incident_id, actor_id, kind)
            VALUES ($1, $2, 'rollback')
            "#,
        )
        .bind(incident_id)
        .bind(actor_id)
        .execute(&mut *tx)
        .await
        .map_err(DbError::from)?;

        audit::record(
            &mut *tx,
            incident.guild_id,
            actor_id,
            "incident.rollback",
            json!({
                "incident_id": incident_id,
                "snapshot_id": record.id,
                "directives": directives.len(),
            }),
        )
        .await?;

        tx.commit().await.map_err(DbError::from)?;

        crate::metrics::record_incident_action("rollback");

        Ok(directives)
    }

    /// Stamp the terminal close action on an incident. Returns false when it
    /// was already closed - safe to race from several workers.
    pub async fn close_incident(&self, incident_id: i64, actor_id: Option<i64>) -> EngineResult<bool> {
        let mut tx = self.db.pool().begin().await.map_err(DbError::from)?;

        let guild_id = self.incident_guild(&mut tx, incident_id).await?;

        let closed: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO tss.antinuke_actions (incident_id, actor_id, kind)
            SELECT $1, $2, 'close'
            WHERE NOT EXISTS (
                SELECT 1 FROM tss.antinuke_actions
                WHERE incident_id = $1 AND kind = 'close'
            )
            RETURNING id
            "#,
        )
        .bind(incident_id)
        .bind(actor_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(DbError::from)?;

        if closed.is_some() {
            audit::record(
                &mut *tx,
                guild_id,
                actor_id,
                "incident.closed",
                json!({ "incident_id": incident_id }),
            )
            .await?;
            info!(guild_id, incident_id, "antinuke incident closed");
        }

        tx.commit().await.map_err(DbError::from)?;
        Ok(closed.is_some())
    }

    /// Close every incident that has gone quiet for the cooldown. Returns the
    /// ids closed by this run; concurrent runs split the set between them.
    pub async fn sweep_closures(&self, now: DateTime<Utc>) -> EngineResult<Vec<i64>> {
        let horizon = self.open_horizon(now);

        let quiet: Vec<(i64,)> = sqlx::query_as(
            r#"
            SELECT i.id
            FROM tss.antinuke_incidents i
            WHERE NOT EXISTS (
                SELECT 1 FROM tss.antinuke_actions a
                WHERE a.incident_id = i.id AND a.kind = 'close'
            )
            AND GREATEST(
                i.created_at,
                COALESCE(
                    (SELECT MAX(a.created_at) FROM tss.antinuke_actions a WHERE a.incident_id = i.id),
                    i.created_at
                )
            ) <= $1
            ORDER BY i.id
            "#,
        )
        .bind(horizon)
        .fetch_all(self.db.pool())
        .await
        .map_err(DbError::from)?;

        let mut closed = Vec::new();
        for (id,) in quiet {
            if self.close_incident(id, None).await? {
                closed.push(id);
            }
        }

        Ok(closed)
    }

    /// Containment history for an incident, in causal order.
    pub async fn actions(&self, incident_id: i64) -> EngineResult<Vec<IncidentAction>> {
        Ok(self.db.antinuke().actions(incident_id).await?)
    }

    /// Resolve an incident's guild inside an open transaction, failing with
    /// `NotFound` when the incident does not exist.
    async fn incident_guild(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        incident_id: i64,
    ) -> EngineResult<i64> {
        let guild_id: Option<i64> =
            sqlx::query_scalar("SELECT guild_id FROM tss.antinuke_incidents WHERE id = $1")
                .bind(incident_id)
                .fetch_optional(&mut **tx)
                .await
                .map_err(DbError::from)?;

        guild_id.ok_or(EngineError::NotFound("incident"))
    }
}

/// Classify a burst count against the configured thresholds.
fn assess_burst(policy: &AntinukeConfig, count: u32) -> BurstSeverity {
    if count >= policy.burst_ceiling {
        BurstSeverity::Quarantine
    } else if count >= policy.burst_threshold {
        BurstSeverity::Incident
    } else {
        BurstSeverity::Ignore
    }
}

/// Turn a snapshot into the operations that would restore it.
fn rollback_directives(guild_id: i64, snap: &GuildSnapshot) -> Vec<Directive> {
    let mut out = Vec::with_capacity(snap.roles.len() + snap.channels.len() + snap.webhooks.len());

    for role in &snap.roles {
        out.push(Directive::RestoreRole {
            guild_id,
            role: role.clone(),
        });
    }
    for channel in &snap.channels {
        out.push(Directive::RestoreChannel {
            guild_id,
            channel: channel.clone(),
        });
    }
    for webhook in &snap.webhooks {
        out.push(Directive::EnableWebhook {
            guild_id,
            webhook_id: webhook.webhook_id,
        });
    }

    out
}

#[cfg(test)]
mod tests {
    use super::snapshot::{ChannelState, RoleState, WebhookState};
    use super::*;

    fn engine_policy(threshold: u32, ceiling: u32) -> AntinukeConfig {
        AntinukeConfig {
            burst_threshold: threshold,
            burst_ceiling: ceiling,
            close_cooldown_secs: 900,
        }
    }

    #[test]
    fn burst_severity_bounds() {
        let policy = engine_policy(5, 20);

        assert_eq!(assess_burst(&policy, 0), BurstSeverity::Ignore);
        assert_eq!(assess_burst(&policy, 4), BurstSeverity::Ignore);
        assert_eq!(assess_burst(&policy, 5), BurstSeverity::Incident);
        assert_eq!(assess_burst(&policy, 19), BurstSeverity::Incident);
        assert_eq!(assess_burst(&policy, 20), BurstSeverity::Quarantine);
    }

    #[test]
    fn rollback_replays_every_captured_object() {
        let snap = GuildSnapshot {
            roles: vec![RoleState {
                role_id: 1,
                name: "staff".into(),
                permissions: 8,
                position: 1,
            }],
            channels: vec![
                ChannelState {
                    channel_id: 2,
                    name: "general".into(),
                    kind: "text".into(),
                    parent_id: None,
                },
                ChannelState {
                    channel_id: 3,
                    name: "voice".into(),
                    kind: "voice".into(),
                    parent_id: Some(9),
                },
            ],
            webhooks: vec![WebhookState {
                webhook_id: 4,
                channel_id: 2,
                name: "feed".into(),
            }],
        };

        let directives = rollback_directives(77, &snap);
        assert_eq!(directives.len(), 4);
        assert!(matches!(
            directives[0],
            Directive::RestoreRole { guild_id: 77, ref role } if role.role_id == 1
        ));
        assert!(matches!(
            directives[1],
            Directive::RestoreChannel { ref channel, .. } if channel.channel_id == 2
        ));
        assert!(matches!(
            directives[3],
            Directive::EnableWebhook { webhook_id: 4, .. }
        ));
    }

    #[test]
    fn empty_snapshot_restores_nothing() {
        assert!(rollback_directives(1, &GuildSnapshot::default()).is_empty());
    }
}
