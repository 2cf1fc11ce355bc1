//! Outbound directives for the external-state applier.
//!
//! The engines never touch the platform themselves. Every operation that
//! should change live platform state (grant a role, clear a timeout, restore
//! a deleted channel) is expressed as a [`Directive`] and handed to the
//! collaborator that owns the platform connection. The applier reports
//! success or failure out of band; directives carry everything needed to
//! execute without further engine queries.

use crate::antinuke::snapshot::{ChannelState, RoleState};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// One intended platform operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Directive {
    /// Grant a role to a user (role-method mutes).
    GrantRole {
        guild_id: i64,
        user_id: i64,
        role_id: i64,
    },
    /// Remove a role from a user.
    RevokeRole {
        guild_id: i64,
        user_id: i64,
        role_id: i64,
    },
    /// Apply a platform-native communication timeout.
    SetTimeout {
        guild_id: i64,
        user_id: i64,
        until: DateTime<Utc>,
    },
    /// Clear a platform-native communication timeout.
    ClearTimeout { guild_id: i64, user_id: i64 },
    /// Remove the user from the guild.
    Kick {
        guild_id: i64,
        user_id: i64,
        reason: String,
    },
    /// Ban the user from the guild.
    Ban {
        guild_id: i64,
        user_id: i64,
        reason: String,
    },
    /// Recreate or repair a role to its snapshotted state.
    RestoreRole { guild_id: i64, role: RoleState },
    /// Recreate or repair a channel to its snapshotted state.
    RestoreChannel { guild_id: i64, channel: ChannelState },
    /// Re-enable a webhook disabled during containment.
    EnableWebhook { guild_id: i64, webhook_id: i64 },
    /// Disable a webhook implicated in an incident.
    DisableWebhook { guild_id: i64, webhook_id: i64 },
    /// Strip an actor of the ability to continue destructive operations.
    QuarantineActor {
        guild_id: i64,
        user_id: i64,
        reason: String,
    },
}
