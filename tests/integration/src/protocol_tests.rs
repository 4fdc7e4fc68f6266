//! Frame-level robustness tests

use std::time::Duration;

use rescuenet_core::{ClaimKind, CoordinatorConfig, Role};
use rescuenet_link::ServerMessage;

use crate::test_utils::{eventually, test_config, TestCoordinator};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_malformed_frames_only_affect_the_sender() {
    let harness = TestCoordinator::start(test_config()).await;
    let bystander = harness.vehicle(2).await;
    let mut raw = harness.raw().await;

    raw.send_text("{ this is not json").await;
    assert!(matches!(
        raw.next().await,
        ServerMessage::Error { code, .. } if code == "malformed"
    ));

    raw.send_text(r#"{"type":"claim_request","request_id":1,"kind":"marker","key":7}"#)
        .await;
    assert!(matches!(
        raw.next().await,
        ServerMessage::Error { request_id: Some(1), code, .. } if code == "not_registered"
    ));

    raw.send_text(r#"{"type":"register","request_id":2,"id":1}"#).await;
    raw.until(|m| matches!(m, ServerMessage::Registered { request_id: Some(2), .. }))
        .await;

    raw.send_text(r#"{"type":"claim_request","request_id":3,"kind":"marker","key":99999}"#)
        .await;
    let reply = raw.until(|m| m.request_id() == Some(3)).await;
    assert!(matches!(reply, ServerMessage::Error { code, .. } if code == "key_out_of_range"));

    raw.send_text(r#"{"type":"claim_request","request_id":4,"kind":"marker","key":7}"#)
        .await;
    let reply = raw.until(|m| m.request_id() == Some(4)).await;
    assert!(matches!(
        reply,
        ServerMessage::ClaimResult { granted: Some(true), .. }
    ));

    // The other connection never noticed any of it.
    assert!(bystander.is_connected());
    let denied = bystander.claim_marker(7).await.unwrap();
    assert_eq!(denied.current_holder, Some(1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reserved_and_out_of_range_ids_are_rejected() {
    let harness = TestCoordinator::start(test_config()).await;
    let mut raw = harness.raw().await;

    for (request_id, id, code) in [
        (1, 0, "invalid_participant"),
        (2, 99, "reserved_participant"),
        (3, 300, "invalid_participant"),
    ] {
        raw.send_text(&format!(
            r#"{{"type":"register","request_id":{},"id":{}}}"#,
            request_id, id
        ))
        .await;
        let reply = raw.until(|m| m.request_id() == Some(request_id)).await;
        assert!(
            matches!(&reply, ServerMessage::Error { code: got, .. } if got == code),
            "id {} gave {:?}",
            id,
            reply
        );
    }
    assert!(harness.coordinator.registry().is_empty());
}

// Current-thread runtime: the publishing loop below never yields, so the
// connection task cannot drain its backlog until the loop is done.
#[tokio::test]
async fn test_slow_subscriber_gets_resync() {
    let config = CoordinatorConfig {
        fanout_capacity: 4,
        ..test_config()
    };
    let harness = TestCoordinator::start(config).await;
    harness
        .coordinator
        .register(50, Role::Vehicle, Default::default())
        .unwrap();

    let mut raw = harness.raw().await;
    raw.send_text(r#"{"type":"register","request_id":1,"id":1}"#).await;
    raw.until(|m| matches!(m, ServerMessage::Registered { .. }))
        .await;

    for n in 0..50 {
        harness
            .coordinator
            .report_status(50, format!("tick {}", n), None)
            .unwrap();
    }
    let last_seq = harness.coordinator.last_seq();

    let resync = raw.until(|m| matches!(m, ServerMessage::Resync { .. })).await;
    match resync {
        ServerMessage::Resync { missed } => assert!(missed >= 40, "missed {}", missed),
        other => panic!("unexpected {:?}", other),
    }
    // The newest events still arrive, in order, after the notice.
    raw.until(|m| matches!(m, ServerMessage::Event(env) if env.seq == last_seq))
        .await;

    // Reconcile through a snapshot.
    raw.send_text(r#"{"type":"snapshot","request_id":2,"kind":"waypoint"}"#)
        .await;
    let reply = raw.until(|m| m.request_id() == Some(2)).await;
    assert!(matches!(
        reply,
        ServerMessage::Snapshot { kind: ClaimKind::Waypoint, ref claims, last_seq: seq, .. }
            if claims.is_empty() && seq >= last_seq
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dropped_socket_keeps_claims_but_unregister_frees_them() {
    let harness = TestCoordinator::start(test_config()).await;

    let mut dropped = harness.raw().await;
    dropped
        .send_text(r#"{"type":"register","request_id":1,"id":1}"#)
        .await;
    dropped
        .until(|m| matches!(m, ServerMessage::Registered { .. }))
        .await;
    dropped
        .send_text(r#"{"type":"claim_request","request_id":2,"kind":"waypoint","key":5}"#)
        .await;
    dropped.until(|m| m.request_id() == Some(2)).await;
    dropped.drop_abruptly();

    let coordinator = harness.coordinator.clone();
    assert!(
        eventually(Duration::from_secs(2), || std::future::ready(
            coordinator.participant(1).map(|p| !p.connected).unwrap_or(false)
        ))
        .await
    );
    assert_eq!(harness.coordinator.holder(ClaimKind::Waypoint, 5), Some(1));

    let mut polite = harness.raw().await;
    polite
        .send_text(r#"{"type":"register","request_id":1,"id":2}"#)
        .await;
    polite
        .until(|m| matches!(m, ServerMessage::Registered { .. }))
        .await;
    polite
        .send_text(r#"{"type":"claim_request","request_id":2,"kind":"waypoint","key":6}"#)
        .await;
    polite.until(|m| m.request_id() == Some(2)).await;
    polite
        .send_text(r#"{"type":"unregister","request_id":3}"#)
        .await;
    polite.until(|m| m.request_id() == Some(3)).await;

    assert!(
        eventually(Duration::from_secs(2), || std::future::ready(
            coordinator.holder(ClaimKind::Waypoint, 6).is_none()
        ))
        .await
    );
}
