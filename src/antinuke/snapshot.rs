//! Guild state snapshots.
//!
//! A snapshot is captured (by the event collaborator, which can see live
//! platform state) before the first containment action of an incident, so
//! rollback has something to replay. The structured payload is stored as
//! JSONB on the incident and never interpreted until rollback time.

use serde::{Deserialize, Serialize};

/// Point-in-time capture of the guild state an incident may damage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GuildSnapshot {
    #[serde(default)]
    pub roles: Vec<RoleState>,
    #[serde(default)]
    pub channels: Vec<ChannelState>,
    #[serde(default)]
    pub webhooks: Vec<WebhookState>,
}

impl GuildSnapshot {
    /// Whether the capture holds anything worth replaying.
    pub fn is_empty(&self) -> bool {
        self.roles.is_empty() && self.channels.is_empty() && self.webhooks.is_empty()
    }
}

/// Captured role layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleState {
    pub role_id: i64,
    pub name: String,
    pub permissions: i64,
    pub position: i32,
}

/// Captured channel layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelState {
    pub channel_id: i64,
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub parent_id: Option<i64>,
}

/// Captured webhook state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookState {
    pub webhook_id: i64,
    pub channel_id: i64,
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_round_trips_through_json() {
        let snap = GuildSnapshot {
            roles: vec![RoleState {
                role_id: 10,
                name: "mods".into(),
                permissions: 0x2000,
                position: 3,
            }],
            channels: vec![ChannelState {
                channel_id: 20,
                name: "general".into(),
                kind: "text".into(),
                parent_id: Some(5),
            }],
            webhooks: vec![],
        };
        let json = serde_json::to_value(&snap).unwrap();
        let back: GuildSnapshot = serde_json::from_value(json).unwrap();
        assert_eq!(snap, back);
    }

    #[test]
    fn missing_sections_default_to_empty() {
        let snap: GuildSnapshot = serde_json::from_str(r#"{"roles": []}"#).unwrap();
        assert!(snap.is_empty());
    }
}
