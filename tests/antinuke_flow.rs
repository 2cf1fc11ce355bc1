//! Antinuke engine integration tests: incident dedup, action ordering,
//! snapshot rollback, derived closure and cascade deletion.

mod common;

use tssd::EngineError;
use tssd::antinuke::AntinukeEngine;
use tssd::antinuke::snapshot::{ChannelState, GuildSnapshot, RoleState};
use tssd::directives::Directive;

fn engine(db: &tssd::Database) -> AntinukeEngine {
    AntinukeEngine::new(db.clone(), common::test_config().antinuke)
}

#[tokio::test]
async fn burst_requires_opt_in() {
    let Some(db) = common::test_db().await else {
        return;
    };
    let guild = common::unique_guild_id();
    common::seed_guild(&db, guild).await;

    let engine = engine(&db);
    let err = engine
        .record_suspicious_burst(guild, "channel-delete burst", serde_json::json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)), "{err}");
}

#[tokio::test]
async fn open_incident_deduplicates_bursts() {
    let Some(db) = common::test_db().await else {
        return;
    };
    let guild = common::unique_guild_id();
    common::seed_guild(&db, guild).await;

    let engine = engine(&db);
    assert!(engine.arm(guild, 2001).await.unwrap());
    // Arming twice is a no-op.
    assert!(!engine.arm(guild, 2001).await.unwrap());

    let first = engine
        .record_suspicious_burst(guild, "channel-delete burst", serde_json::json!({"count": 6}))
        .await
        .unwrap();
    assert!(first.newly_opened);

    let second = engine
        .record_suspicious_burst(guild, "role-delete burst", serde_json::json!({"count": 4}))
        .await
        .unwrap();
    assert!(!second.newly_opened);
    assert_eq!(second.incident.id, first.incident.id);

    // Exactly one incident row exists for the guild.
    let incidents = db.antinuke().incidents(guild, 10).await.unwrap();
    assert_eq!(incidents.len(), 1);

    // The machine reports Incident-Open.
    let open = engine.open_incident(guild).await.unwrap().unwrap();
    assert_eq!(open.id, first.incident.id);
}

#[tokio::test]
async fn actions_accumulate_in_causal_order() {
    let Some(db) = common::test_db().await else {
        return;
    };
    let guild = common::unique_guild_id();
    common::seed_guild(&db, guild).await;

    let engine = engine(&db);
    engine.arm(guild, 2001).await.unwrap();
    let incident = engine
        .record_suspicious_burst(guild, "mass-ban burst", serde_json::json!({}))
        .await
        .unwrap()
        .incident;

    for kind in ["revoke-role", "disable-webhook", "quarantine-actor"] {
        engine.record_action(incident.id, None, kind).await.unwrap();
    }
    engine.record_action(incident.id, Some(2001), "revoke-role").await.unwrap();

    let actions = engine.actions(incident.id).await.unwrap();
    let kinds: Vec<&str> = actions.iter().map(|a| a.kind.as_str()).collect();
    assert_eq!(
        kinds,
        vec!["revoke-role", "disable-webhook", "quarantine-actor", "revoke-role"]
    );
    assert!(actions.windows(2).all(|w| w[0].id < w[1].id));
    assert_eq!(actions[3].actor_id, Some(2001));

    // The close transition has its own path.
    let err = engine.record_action(incident.id, None, "close").await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)), "{err}");
}

#[tokio::test]
async fn rollback_replays_the_latest_snapshot() {
    let Some(db) = common::test_db().await else {
        return;
    };
    let guild = common::unique_guild_id();
    common::seed_guild(&db, guild).await;

    let engine = engine(&db);
    engine.arm(guild, 2001).await.unwrap();
    let incident = engine
        .record_suspicious_burst(guild, "channel-delete burst", serde_json::json!({}))
        .await
        .unwrap()
        .incident;

    // No snapshot yet: nothing to replay.
    let err = engine.rollback(incident.id, Some(2001)).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound("snapshot")), "{err}");

    let snap = GuildSnapshot {
        roles: vec![RoleState {
            role_id: 10,
            name: "staff".into(),
            permissions: 8,
            position: 2,
        }],
        channels: vec![ChannelState {
            channel_id: 20,
            name: "general".into(),
            kind: "text".into(),
            parent_id: None,
        }],
        webhooks: vec![],
    };
    engine.snapshot(incident.id, &snap).await.unwrap();

    let directives = engine.rollback(incident.id, Some(2001)).await.unwrap();
    assert_eq!(directives.len(), 2);
    assert!(matches!(directives[0], Directive::RestoreRole { ref role, .. } if role.role_id == 10));
    assert!(
        matches!(directives[1], Directive::RestoreChannel { ref channel, .. } if channel.channel_id == 20)
    );

    // The rollback itself is part of the containment history.
    let actions = engine.actions(incident.id).await.unwrap();
    assert!(actions.iter().any(|a| a.kind == "rollback"));
}

#[tokio::test]
async fn explicit_close_returns_the_guild_to_armed() {
    let Some(db) = common::test_db().await else {
        return;
    };
    let guild = common::unique_guild_id();
    common::seed_guild(&db, guild).await;

    let engine = engine(&db);
    engine.arm(guild, 2001).await.unwrap();
    let incident = engine
        .record_suspicious_burst(guild, "webhook-abuse burst", serde_json::json!({}))
        .await
        .unwrap()
        .incident;

    assert!(engine.close_incident(incident.id, Some(2001)).await.unwrap());
    // Closing twice is a no-op, not an error: sweeps may race.
    assert!(!engine.close_incident(incident.id, Some(2001)).await.unwrap());

    assert!(engine.open_incident(guild).await.unwrap().is_none());

    // Armed again: the next burst opens a fresh incident.
    let next = engine
        .record_suspicious_burst(guild, "second wave", serde_json::json!({}))
        .await
        .unwrap();
    assert!(next.newly_opened);
    assert_ne!(next.incident.id, incident.id);
}

#[tokio::test]
async fn closure_sweep_closes_only_quiet_incidents() {
    let Some(db) = common::test_db().await else {
        return;
    };
    let guild = common::unique_guild_id();
    common::seed_guild(&db, guild).await;

    let engine = engine(&db);
    engine.arm(guild, 2001).await.unwrap();

    // Backdate an incident past the cooldown; the sweep should close it.
    let (quiet_id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO tss.antinuke_incidents (guild_id, reason, created_at)
        VALUES ($1, 'old burst', now() - interval '2 hours')
        RETURNING id
        "#,
    )
    .bind(guild)
    .fetch_one(db.pool())
    .await
    .unwrap();

    let live = engine
        .record_suspicious_burst(guild, "fresh burst", serde_json::json!({}))
        .await
        .unwrap()
        .incident;

    let closed = engine.sweep_closures(chrono::Utc::now()).await.unwrap();
    assert!(closed.contains(&quiet_id));
    assert!(!closed.contains(&live.id));

    // The fresh incident is still the guild's open one.
    let open = engine.open_incident(guild).await.unwrap().unwrap();
    assert_eq!(open.id, live.id);
}

#[tokio::test]
async fn cascade_removes_snapshots_and_actions() {
    let Some(db) = common::test_db().await else {
        return;
    };
    let guild = common::unique_guild_id();
    common::seed_guild(&db, guild).await;

    let engine = engine(&db);
    engine.arm(guild, 2001).await.unwrap();
    let incident = engine
        .record_suspicious_burst(guild, "mass-ban burst", serde_json::json!({}))
        .await
        .unwrap()
        .incident;
    engine.snapshot(incident.id, &GuildSnapshot::default()).await.unwrap();
    engine.record_action(incident.id, None, "quarantine-actor").await.unwrap();

    sqlx::query("DELETE FROM tss.antinuke_incidents WHERE id = $1")
        .bind(incident.id)
        .execute(db.pool())
        .await
        .unwrap();

    let (snapshots,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM tss.antinuke_snapshots WHERE incident_id = $1")
            .bind(incident.id)
            .fetch_one(db.pool())
            .await
            .unwrap();
    let (actions,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM tss.antinuke_actions WHERE incident_id = $1")
            .bind(incident.id)
            .fetch_one(db.pool())
            .await
            .unwrap();
    assert_eq!((snapshots, actions), (0, 0));

    // Snapshot/action APIs against the gone incident now report NotFound.
    let err = engine.record_action(incident.id, None, "revoke-role").await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound("incident")), "{err}");
    let err = engine
        .snapshot(incident.id, &GuildSnapshot::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound("incident")), "{err}");
}
