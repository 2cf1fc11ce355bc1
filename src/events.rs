//! Inbound event dispatch.
//!
//! The platform gateway (out of process) delivers semantic events with an
//! already-authenticated actor; this module is the single path from those
//! events through the capability gate into the engines. Identity is trusted,
//! capability is not: every privileged mutation checks the actor's role set
//! first. The returned [`Directive`]s are the engines' intended platform
//! operations, executed elsewhere.

use crate::antinuke::{AntinukeEngine, BurstSeverity, snapshot::GuildSnapshot};
use crate::authz::{Authorizer, caps};
use crate::config::Config;
use crate::db::{Database, MuteMethod, ResourceKind};
use crate::directives::Directive;
use crate::error::{EngineError, EngineResult};
use crate::mute::{MuteConfig, MuteEngine, MutePreference};
use crate::registry::{Registry, keys};
use crate::warn::{ThresholdAction, WarnConfig, WarnEngine};
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::{debug, warn};

/// The authenticated origin of an event.
#[derive(Debug, Clone)]
pub struct Actor {
    pub user_id: i64,
    /// Roles the actor currently holds, as reported by the gateway.
    pub role_ids: Vec<i64>,
}

/// Destructive activity classes the event tap reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestructiveKind {
    ChannelDelete,
    RoleDelete,
    MassBan,
    WebhookAbuse,
    PermissionEscalation,
}

impl DestructiveKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChannelDelete => "channel-delete",
            Self::RoleDelete => "role-delete",
            Self::MassBan => "mass-ban",
            Self::WebhookAbuse => "webhook-abuse",
            Self::PermissionEscalation => "permission-escalation",
        }
    }
}

/// One semantic event from the gateway.
#[derive(Debug, Clone)]
pub enum ModerationEvent {
    /// The gateway saw a guild; keeps the tenant row current.
    GuildSeen { guild_id: i64, name: String },
    /// A moderator issued a warning.
    WarnIssued {
        guild_id: i64,
        target_id: i64,
        points: i32,
        reason: String,
        evidence: Option<String>,
    },
    /// A moderator requested a mute. `duration_minutes`: `None` uses the
    /// guild default, `Some(0)` mutes indefinitely.
    MuteRequested {
        guild_id: i64,
        target_id: i64,
        duration_minutes: Option<i64>,
        reason: String,
        evidence: Option<String>,
    },
    /// A moderator moved an active mute's deadline.
    MuteExtendRequested {
        guild_id: i64,
        target_id: i64,
        new_until: DateTime<Utc>,
    },
    /// A moderator lifted a mute.
    UnmuteRequested {
        guild_id: i64,
        target_id: i64,
        reason: String,
    },
    /// The event tap observed a burst of destructive actions attributed to
    /// one platform actor within its sliding window.
    DestructiveBurst {
        guild_id: i64,
        kind: DestructiveKind,
        /// The platform account performing the destruction (not the caller).
        offender_id: i64,
        count: u32,
        /// Live-state capture collected by the tap, stored if an incident
        /// opens so rollback stays possible.
        snapshot: Option<GuildSnapshot>,
    },
    /// A privileged user asked for an incident rollback.
    RollbackRequested { guild_id: i64, incident_id: i64 },
    /// Opt the guild into antinuke monitoring.
    ArmRequested { guild_id: i64 },
    /// Opt the guild out of antinuke monitoring.
    DisarmRequested { guild_id: i64 },
    /// Replace the guild's warn tunables.
    SetWarnConfig { guild_id: i64, cfg: WarnConfig },
    /// Replace the guild's mute tunables.
    SetMuteConfig { guild_id: i64, cfg: MuteConfig },
}

impl ModerationEvent {
    /// Stable name for metrics and logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::GuildSeen { .. } => "guild_seen",
            Self::WarnIssued { .. } => "warn_issued",
            Self::MuteRequested { .. } => "mute_requested",
            Self::MuteExtendRequested { .. } => "mute_extend_requested",
            Self::UnmuteRequested { .. } => "unmute_requested",
            Self::DestructiveBurst { .. } => "destructive_burst",
            Self::RollbackRequested { .. } => "rollback_requested",
            Self::ArmRequested { .. } => "arm_requested",
            Self::DisarmRequested { .. } => "disarm_requested",
            Self::SetWarnConfig { .. } => "set_warn_config",
            Self::SetMuteConfig { .. } => "set_mute_config",
        }
    }
}

/// Routes events through the capability gate into the engines.
pub struct Dispatcher {
    authz: Authorizer,
    registry: Registry,
    pub warn: WarnEngine,
    pub mute: MuteEngine,
    pub antinuke: AntinukeEngine,
    db: Database,
}

impl Dispatcher {
    pub fn new(db: Database, config: &Config) -> Self {
        Self {
            authz: Authorizer::new(db.clone()),
            registry: Registry::new(db.clone()),
            warn: WarnEngine::new(db.clone()),
            mute: MuteEngine::new(db.clone()),
            antinuke: AntinukeEngine::new(db.clone(), config.antinuke.clone()),
            db,
        }
    }

    pub fn authorizer(&self) -> &Authorizer {
        &self.authz
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Handle one event, returning the directives the applier should run.
    pub async fn handle(&self, actor: &Actor, event: ModerationEvent) -> EngineResult<Vec<Directive>> {
        let name = event.name();
        let result = self.dispatch(actor, event).await;
        match &result {
            Ok(directives) => {
                crate::metrics::record_event(name, "ok");
                debug!(event = name, directives = directives.len(), "event handled");
            }
            Err(e) => {
                crate::metrics::record_event(name, e.error_code());
            }
        }
        result
    }

    async fn dispatch(&self, actor: &Actor, event: ModerationEvent) -> EngineResult<Vec<Directive>> {
        match event {
            ModerationEvent::GuildSeen { guild_id, name } => {
                self.db.guilds().upsert(guild_id, &name).await?;
                Ok(vec![])
            }

            ModerationEvent::WarnIssued {
                guild_id,
                target_id,
                points,
                reason,
                evidence,
            } => {
                self.authz
                    .require_capability(guild_id, &actor.role_ids, caps::WARN_ISSUE)
                    .await?;

                let outcome = self
                    .warn
                    .issue_warn(
                        guild_id,
                        target_id,
                        actor.user_id,
                        points,
                        &reason,
                        evidence.as_deref(),
                    )
                    .await?;

                Ok(escalation_directives(guild_id, target_id, outcome.total, outcome.action))
            }

            ModerationEvent::MuteRequested {
                guild_id,
                target_id,
                duration_minutes,
                reason,
                evidence,
            } => {
                self.authz
                    .require_capability(guild_id, &actor.role_ids, caps::MUTE_APPLY)
                    .await?;

                let cfg = self.mute.config(guild_id).await?;
                let minutes = duration_minutes.unwrap_or(cfg.default_minutes);
                let until = (minutes > 0).then(|| Utc::now() + Duration::minutes(minutes));

                let method = self.pick_method(guild_id, &cfg).await?;
                if method == MuteMethod::Timeout && until.is_none() {
                    // Platform timeouts always expire; an open-ended mute
                    // needs the role method.
                    return Err(EngineError::Validation(
                        "indefinite mute requires a registered mute role".into(),
                    ));
                }

                let case = self
                    .mute
                    .apply_mute(
                        guild_id,
                        target_id,
                        actor.user_id,
                        &reason,
                        evidence.as_deref(),
                        until,
                        method,
                    )
                    .await?;

                Ok(vec![match case.method {
                    MuteMethod::Role { role_id } => Directive::GrantRole {
                        guild_id,
                        user_id: target_id,
                        role_id,
                    },
                    MuteMethod::Timeout => Directive::SetTimeout {
                        guild_id,
                        user_id: target_id,
                        // Checked above: timeout mutes always carry a deadline.
                        until: case.until.unwrap_or_else(Utc::now),
                    },
                }])
            }

            ModerationEvent::MuteExtendRequested {
                guild_id,
                target_id,
                new_until,
            } => {
                self.authz
                    .require_capability(guild_id, &actor.role_ids, caps::MUTE_APPLY)
                    .await?;

                let case = self
                    .mute
                    .extend_mute(guild_id, target_id, actor.user_id, new_until)
                    .await?;

                // A role mute stays enforced by the role; only the native
                // timeout needs re-stamping on the platform.
                Ok(match case.method {
                    MuteMethod::Timeout => vec![Directive::SetTimeout {
                        guild_id,
                        user_id: target_id,
                        until: new_until,
                    }],
                    MuteMethod::Role { .. } => vec![],
                })
            }

            ModerationEvent::UnmuteRequested {
                guild_id,
                target_id,
                reason,
            } => {
                self.authz
                    .require_capability(guild_id, &actor.role_ids, caps::MUTE_LIFT)
                    .await?;

                let case = self
                    .mute
                    .lift_mute(guild_id, target_id, actor.user_id, &reason)
                    .await?;

                Ok(vec![unenforce_directive(&case)])
            }

            ModerationEvent::DestructiveBurst {
                guild_id,
                kind,
                offender_id,
                count,
                snapshot,
            } => {
                // System-observed, not a privileged request: there is no
                // acting moderator to gate here.
                self.handle_burst(guild_id, kind, offender_id, count, snapshot)
                    .await
            }

            ModerationEvent::RollbackRequested {
                guild_id,
                incident_id,
            } => {
                self.authz
                    .require_capability(guild_id, &actor.role_ids, caps::ANTINUKE_MANAGE)
                    .await?;

                self.antinuke.rollback(incident_id, Some(actor.user_id)).await
            }

            ModerationEvent::ArmRequested { guild_id } => {
                self.authz
                    .require_capability(guild_id, &actor.role_ids, caps::ANTINUKE_MANAGE)
                    .await?;

                self.antinuke.arm(guild_id, actor.user_id).await?;
                Ok(vec![])
            }

            ModerationEvent::DisarmRequested { guild_id } => {
                self.authz
                    .require_capability(guild_id, &actor.role_ids, caps::ANTINUKE_MANAGE)
                    .await?;

                self.antinuke.disarm(guild_id, actor.user_id).await?;
                Ok(vec![])
            }

            ModerationEvent::SetWarnConfig { guild_id, cfg } => {
                self.authz
                    .require_capability(guild_id, &actor.role_ids, caps::CONFIG_WRITE)
                    .await?;

                self.warn.set_config(guild_id, actor.user_id, cfg).await?;
                Ok(vec![])
            }

            ModerationEvent::SetMuteConfig { guild_id, cfg } => {
                self.authz
                    .require_capability(guild_id, &actor.role_ids, caps::CONFIG_WRITE)
                    .await?;

                self.mute.set_config(guild_id, actor.user_id, cfg).await?;
                Ok(vec![])
            }
        }
    }

    /// Burst policy: open/append an incident past the threshold, and past the
    /// hard ceiling stop chasing individual calls - quarantine the offender
    /// so remediation (and the audit trail) cannot be flooded.
    async fn handle_burst(
        &self,
        guild_id: i64,
        kind: DestructiveKind,
        offender_id: i64,
        count: u32,
        snapshot: Option<GuildSnapshot>,
    ) -> EngineResult<Vec<Directive>> {
        let severity = self.antinuke.assess_burst(count);
        if severity == BurstSeverity::Ignore {
            return Ok(vec![]);
        }
        if !self.antinuke.is_armed(guild_id).await? {
            debug!(guild_id, "destructive burst on unarmed guild ignored");
            return Ok(vec![]);
        }

        let reason = format!("{} burst", kind.as_str());
        let outcome = self
            .antinuke
            .record_suspicious_burst(
                guild_id,
                &reason,
                json!({ "kind": kind.as_str(), "offender_id": offender_id, "count": count }),
            )
            .await?;

        // Capture state before the first containment action of the episode.
        if outcome.newly_opened {
            match snapshot {
                Some(snap) => {
                    self.antinuke.snapshot(outcome.incident.id, &snap).await?;
                }
                None => {
                    warn!(
                        guild_id,
                        incident_id = outcome.incident.id,
                        "incident opened without a state snapshot; rollback will be unavailable"
                    );
                }
            }
        }

        if severity == BurstSeverity::Quarantine {
            self.antinuke
                .record_action(outcome.incident.id, None, "quarantine-actor")
                .await?;
            return Ok(vec![Directive::QuarantineActor {
                guild_id,
                user_id: offender_id,
                reason,
            }]);
        }

        Ok(vec![])
    }

    /// Choose the enforcement method for a new mute from guild preference
    /// and the registry.
    async fn pick_method(&self, guild_id: i64, cfg: &MuteConfig) -> EngineResult<MuteMethod> {
        if cfg.preferred_method != MutePreference::Role {
            return Ok(MuteMethod::Timeout);
        }

        match self.registry.resolve(guild_id, keys::MUTE_ROLE).await {
            Ok(entry) if entry.kind == ResourceKind::Role => Ok(MuteMethod::Role {
                role_id: entry.external_id,
            }),
            Ok(entry) => {
                warn!(
                    guild_id,
                    kind = %entry.kind,
                    "mute-role registry entry has the wrong kind, using platform timeout"
                );
                Ok(MuteMethod::Timeout)
            }
            Err(EngineError::NotFound(_)) => {
                debug!(guild_id, "no mute role registered, using platform timeout");
                Ok(MuteMethod::Timeout)
            }
            Err(e) => Err(e),
        }
    }
}

/// Translate a reported escalation into applier directives.
fn escalation_directives(
    guild_id: i64,
    user_id: i64,
    total: i32,
    action: Option<ThresholdAction>,
) -> Vec<Directive> {
    let Some(action) = action else {
        return vec![];
    };

    let reason = format!("warn threshold reached at {total} points");
    vec![match action {
        ThresholdAction::Timeout { hours } => Directive::SetTimeout {
            guild_id,
            user_id,
            until: Utc::now() + Duration::hours(hours),
        },
        ThresholdAction::Kick => Directive::Kick {
            guild_id,
            user_id,
            reason,
        },
        ThresholdAction::Ban => Directive::Ban {
            guild_id,
            user_id,
            reason,
        },
    }]
}

/// The directive that undoes a lifted mute's enforcement.
pub fn unenforce_directive(case: &crate::db::MuteCase) -> Directive {
    match case.method {
        MuteMethod::Role { role_id } => Directive::RevokeRole {
            guild_id: case.guild_id,
            user_id: case.user_id,
            role_id,
        },
        MuteMethod::Timeout => Directive::ClearTimeout {
            guild_id: case.guild_id,
            user_id: case.user_id,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escalation_maps_to_one_directive() {
        assert!(escalation_directives(1, 2, 2, None).is_empty());

        let d = escalation_directives(1, 2, 3, Some(ThresholdAction::Timeout { hours: 12 }));
        assert!(matches!(d[0], Directive::SetTimeout { guild_id: 1, user_id: 2, .. }));

        let d = escalation_directives(1, 2, 7, Some(ThresholdAction::Kick));
        assert!(matches!(d[0], Directive::Kick { .. }));

        let d = escalation_directives(1, 2, 11, Some(ThresholdAction::Ban));
        assert!(
            matches!(&d[0], Directive::Ban { reason, .. } if reason.contains("11 points"))
        );
    }

    #[test]
    fn unenforce_matches_method() {
        use crate::db::MuteCase;
        use chrono::Utc;

        let case = MuteCase {
            id: 1,
            guild_id: 10,
            user_id: 20,
            moderator_id: 30,
            reason: "spam".into(),
            evidence: None,
            created_at: Utc::now(),
            until: None,
            unmuted_at: Some(Utc::now()),
            unmuted_by: Some(30),
            unmute_reason: Some("appeal".into()),
            method: MuteMethod::Role { role_id: 99 },
        };
        assert!(matches!(
            unenforce_directive(&case),
            Directive::RevokeRole { role_id: 99, .. }
        ));

        let case = MuteCase {
            method: MuteMethod::Timeout,
            ..case
        };
        assert!(matches!(
            unenforce_directive(&case),
            Directive::ClearTimeout { guild_id: 10, user_id: 20 }
        ));
    }
}
