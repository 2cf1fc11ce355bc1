//! Registry, capability and guild-config integration tests, plus the
//! authorizer gate on the event dispatch path.

mod common;

use std::sync::Arc;
use tssd::db::{ResourceKind, RoleSet};
use tssd::registry::Registry;
use tssd::{Actor, Dispatcher, EngineError, ModerationEvent};

#[tokio::test]
async fn registry_resolves_and_guards_kinds() {
    let Some(db) = common::test_db().await else {
        return;
    };
    let guild = common::unique_guild_id();
    common::seed_guild(&db, guild).await;

    let registry = Registry::new(db.clone());

    let err = registry.resolve(guild, "mute-role").await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)), "{err}");

    registry
        .register(guild, 2001, "mute-role", ResourceKind::Role, 555, serde_json::json!({}))
        .await
        .unwrap();

    let entry = registry.resolve(guild, "mute-role").await.unwrap();
    assert_eq!(entry.kind, ResourceKind::Role);
    assert_eq!(entry.external_id, 555);

    // Same kind: upsert replaces the handle.
    registry
        .register(
            guild,
            2001,
            "mute-role",
            ResourceKind::Role,
            556,
            serde_json::json!({"note": "recreated"}),
        )
        .await
        .unwrap();
    let entry = registry.resolve(guild, "mute-role").await.unwrap();
    assert_eq!(entry.external_id, 556);

    // Different kind: refused, entry untouched.
    let err = registry
        .register(guild, 2001, "mute-role", ResourceKind::Channel, 999, serde_json::json!({}))
        .await
        .unwrap_err();
    match err {
        EngineError::KindMismatch { key, have, want } => {
            assert_eq!(key, "mute-role");
            assert_eq!(have, "role");
            assert_eq!(want, "channel");
        }
        other => panic!("expected KindMismatch, got {other}"),
    }
    let entry = registry.resolve(guild, "mute-role").await.unwrap();
    assert_eq!(entry.external_id, 556);

    // Delete + recreate is the kind-change path.
    assert!(registry.unregister(guild, 2001, "mute-role").await.unwrap());
    assert!(!registry.unregister(guild, 2001, "mute-role").await.unwrap());
    registry
        .register(guild, 2001, "mute-role", ResourceKind::Channel, 999, serde_json::json!({}))
        .await
        .unwrap();
    let entry = registry.resolve(guild, "mute-role").await.unwrap();
    assert_eq!(entry.kind, ResourceKind::Channel);
}

#[tokio::test]
async fn capability_grants_are_membership_only() {
    let Some(db) = common::test_db().await else {
        return;
    };
    let guild = common::unique_guild_id();
    common::seed_guild(&db, guild).await;

    let authz = tssd::authz::Authorizer::new(db.clone());
    let (mod_role, other_role) = (31, 32);

    assert!(!authz.has_capability(guild, &[mod_role], "warn.issue").await.unwrap());

    assert!(authz.grant(guild, mod_role, "warn.issue", 2001).await.unwrap());
    // Re-granting is a no-op: present or absent, no quantities.
    assert!(!authz.grant(guild, mod_role, "warn.issue", 2001).await.unwrap());

    assert!(authz.has_capability(guild, &[mod_role], "warn.issue").await.unwrap());
    assert!(
        authz
            .has_capability(guild, &[other_role, mod_role], "warn.issue")
            .await
            .unwrap()
    );
    assert!(!authz.has_capability(guild, &[other_role], "warn.issue").await.unwrap());
    assert!(!authz.has_capability(guild, &[], "warn.issue").await.unwrap());

    let granted = authz.list_for_role(guild, mod_role).await.unwrap();
    assert_eq!(granted.len(), 1);
    assert_eq!(granted[0].0, "warn.issue");

    assert!(authz.revoke(guild, mod_role, "warn.issue", 2001).await.unwrap());
    assert!(!authz.revoke(guild, mod_role, "warn.issue", 2001).await.unwrap());
    assert!(!authz.has_capability(guild, &[mod_role], "warn.issue").await.unwrap());
}

#[tokio::test]
async fn guild_role_sets_stay_duplicate_free() {
    let Some(db) = common::test_db().await else {
        return;
    };
    let guild = common::unique_guild_id();
    common::seed_guild(&db, guild).await;

    let guilds = db.guilds();

    assert!(guilds.add_role(guild, 41, RoleSet::Admin).await.unwrap());
    assert!(!guilds.add_role(guild, 41, RoleSet::Admin).await.unwrap());
    assert!(guilds.add_role(guild, 42, RoleSet::Moderator).await.unwrap());

    guilds.set_modlog_channel(guild, Some(9001)).await.unwrap();

    let record = guilds.get(guild).await.unwrap().unwrap();
    assert_eq!(record.admin_role_ids, vec![41]);
    assert_eq!(record.moderator_role_ids, vec![42]);
    assert_eq!(record.modlog_channel_id, Some(9001));

    assert!(guilds.remove_role(guild, 41, RoleSet::Admin).await.unwrap());
    assert!(!guilds.remove_role(guild, 41, RoleSet::Admin).await.unwrap());
    let record = guilds.get(guild).await.unwrap().unwrap();
    assert!(record.admin_role_ids.is_empty());
}

#[tokio::test]
async fn dispatch_gates_on_capability() {
    let Some(db) = common::test_db().await else {
        return;
    };
    let guild = common::unique_guild_id();

    let dispatcher = Arc::new(Dispatcher::new(db.clone(), &common::test_config()));
    let moderator = Actor {
        user_id: 2001,
        role_ids: vec![51],
    };

    // Tenant row arrives from the gateway.
    dispatcher
        .handle(
            &moderator,
            ModerationEvent::GuildSeen {
                guild_id: guild,
                name: "gate-test".into(),
            },
        )
        .await
        .unwrap();

    let warn_event = ModerationEvent::WarnIssued {
        guild_id: guild,
        target_id: 1001,
        points: 5,
        reason: "spam".into(),
        evidence: None,
    };

    // No grant: denied, and denial is an error, not a silent no-op.
    let err = dispatcher.handle(&moderator, warn_event.clone()).await.unwrap_err();
    assert!(
        matches!(err, EngineError::AuthorizationDenied { capability: "warn.issue" }),
        "{err}"
    );
    assert_eq!(dispatcher.warn.get_points(guild, 1001).await.unwrap(), 0);

    dispatcher
        .authorizer()
        .grant(guild, 51, "warn.issue", 2001)
        .await
        .unwrap();

    // 5 points crosses the default timeout threshold: one directive.
    let directives = dispatcher.handle(&moderator, warn_event).await.unwrap();
    assert_eq!(directives.len(), 1);
    assert!(matches!(
        directives[0],
        tssd::Directive::SetTimeout { user_id: 1001, .. }
    ));
    assert_eq!(dispatcher.warn.get_points(guild, 1001).await.unwrap(), 5);
}

#[tokio::test]
async fn dispatch_routes_mutes_through_registry_preference() {
    let Some(db) = common::test_db().await else {
        return;
    };
    let guild = common::unique_guild_id();

    let dispatcher = Arc::new(Dispatcher::new(db.clone(), &common::test_config()));
    let moderator = Actor {
        user_id: 2001,
        role_ids: vec![61],
    };

    dispatcher
        .handle(
            &moderator,
            ModerationEvent::GuildSeen {
                guild_id: guild,
                name: "mute-routing".into(),
            },
        )
        .await
        .unwrap();

    for cap in ["mute.apply", "mute.lift", "config.write"] {
        dispatcher.authorizer().grant(guild, 61, cap, 2001).await.unwrap();
    }

    // Prefer the role method and register the mute role.
    dispatcher
        .handle(
            &moderator,
            ModerationEvent::SetMuteConfig {
                guild_id: guild,
                cfg: tssd::mute::MuteConfig {
                    default_minutes: 30,
                    preferred_method: tssd::mute::MutePreference::Role,
                },
            },
        )
        .await
        .unwrap();
    dispatcher
        .registry()
        .register(guild, 2001, "mute-role", ResourceKind::Role, 888, serde_json::json!({}))
        .await
        .unwrap();

    let directives = dispatcher
        .handle(
            &moderator,
            ModerationEvent::MuteRequested {
                guild_id: guild,
                target_id: 1001,
                duration_minutes: None,
                reason: "flooding".into(),
                evidence: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(directives.len(), 1);
    assert!(matches!(
        directives[0],
        tssd::Directive::GrantRole { user_id: 1001, role_id: 888, .. }
    ));

    // Lifting emits the matching revoke.
    let directives = dispatcher
        .handle(
            &moderator,
            ModerationEvent::UnmuteRequested {
                guild_id: guild,
                target_id: 1001,
                reason: "resolved".into(),
            },
        )
        .await
        .unwrap();
    assert!(matches!(
        directives[0],
        tssd::Directive::RevokeRole { user_id: 1001, role_id: 888, .. }
    ));
}

#[tokio::test]
async fn dispatch_contains_burst_at_the_ceiling() {
    let Some(db) = common::test_db().await else {
        return;
    };
    let guild = common::unique_guild_id();

    let dispatcher = Arc::new(Dispatcher::new(db.clone(), &common::test_config()));
    let admin = Actor {
        user_id: 2001,
        role_ids: vec![71],
    };

    dispatcher
        .handle(
            &admin,
            ModerationEvent::GuildSeen {
                guild_id: guild,
                name: "burst-test".into(),
            },
        )
        .await
        .unwrap();
    dispatcher
        .authorizer()
        .grant(guild, 71, "antinuke.manage", 2001)
        .await
        .unwrap();
    dispatcher
        .handle(&admin, ModerationEvent::ArmRequested { guild_id: guild })
        .await
        .unwrap();

    let burst = |count| ModerationEvent::DestructiveBurst {
        guild_id: guild,
        kind: tssd::events::DestructiveKind::ChannelDelete,
        offender_id: 666,
        count,
        snapshot: Some(tssd::antinuke::snapshot::GuildSnapshot::default()),
    };

    // Below threshold (3): watched, no incident.
    assert!(dispatcher.handle(&admin, burst(2)).await.unwrap().is_empty());
    assert!(dispatcher.antinuke.open_incident(guild).await.unwrap().is_none());

    // Past threshold: incident opens, containment stays with the operators.
    assert!(dispatcher.handle(&admin, burst(4)).await.unwrap().is_empty());
    let open = dispatcher.antinuke.open_incident(guild).await.unwrap().unwrap();

    // Past the ceiling (10): the engine asks for the actor to be quarantined.
    let directives = dispatcher.handle(&admin, burst(25)).await.unwrap();
    assert_eq!(directives.len(), 1);
    assert!(matches!(
        directives[0],
        tssd::Directive::QuarantineActor { user_id: 666, .. }
    ));

    // Still one incident: the follow-up burst appended to it.
    assert_eq!(
        dispatcher.antinuke.open_incident(guild).await.unwrap().unwrap().id,
        open.id
    );
    let actions = dispatcher.antinuke.actions(open.id).await.unwrap();
    assert!(actions.iter().any(|a| a.kind == "quarantine-actor"));
}
