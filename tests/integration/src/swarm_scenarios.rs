//! Mission scenarios driven through the vehicle client

use std::sync::Arc;
use std::time::Duration;

use rescuenet_coordination::{BarrierPhase, BarrierWait, Event, ReleaseCause};
use rescuenet_core::{ClaimKind, CoordinatorConfig, TargetSet};

use crate::test_utils::{eventually, test_config, TestCoordinator};

const SENTINEL: u32 = 99;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_takeoff_barrier_releases_everyone_once() {
    let harness = TestCoordinator::start(test_config()).await;
    let target = TargetSet::from_ids([1, 2, 3], SENTINEL);

    let mut waits = Vec::new();
    for id in 1..=3 {
        let client = Arc::new(harness.vehicle(id).await);
        let target = target.clone();
        waits.push(tokio::spawn(async move {
            client
                .join_takeoff_barrier(target, Some(Duration::from_secs(3)))
                .await
                .unwrap()
        }));
    }

    let mut outcomes = Vec::new();
    for wait in waits {
        outcomes.push(wait.await.unwrap());
    }
    assert!(outcomes.iter().all(BarrierWait::is_released));
    // Same barrier instance, same release edge.
    assert!(outcomes.windows(2).all(|pair| pair[0] == pair[1]));

    // A late joiner sees the release immediately.
    let late = harness.vehicle(4).await;
    let outcome = late
        .join_takeoff_barrier(target, Some(Duration::ZERO))
        .await
        .unwrap();
    assert_eq!(outcome, outcomes[0]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_team_takes_off_again() {
    let harness = TestCoordinator::start(test_config()).await;
    let team = [
        Arc::new(harness.vehicle(1).await),
        Arc::new(harness.vehicle(2).await),
    ];
    let target = TargetSet::from_ids([1, 2], SENTINEL);

    let mut rounds = Vec::new();
    for _ in 0..2 {
        let waits: Vec<_> = team
            .iter()
            .map(|client| {
                let client = client.clone();
                let target = target.clone();
                tokio::spawn(async move {
                    client
                        .join_takeoff_barrier(target, Some(Duration::from_secs(3)))
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut outcomes = Vec::new();
        for wait in waits {
            outcomes.push(wait.await.unwrap());
        }
        assert!(outcomes.iter().all(BarrierWait::is_released));
        assert_eq!(outcomes[0], outcomes[1]);
        rounds.push(outcomes[0]);
    }
    assert_ne!(rounds[0], rounds[1], "second takeoff must be a new barrier");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_partial_barrier_times_out() {
    let harness = TestCoordinator::start(test_config()).await;
    let vehicle = harness.vehicle(1).await;

    let outcome = vehicle
        .join_takeoff_barrier(
            TargetSet::from_ids([1, 2], SENTINEL),
            Some(Duration::from_millis(200)),
        )
        .await
        .unwrap();
    assert!(matches!(outcome, BarrierWait::TimedOut { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_marker_handover() {
    let harness = TestCoordinator::start(test_config()).await;
    let first = harness.vehicle(1).await;
    let second = harness.vehicle(2).await;

    assert!(first.claim_marker(7).await.unwrap().granted);

    let denied = second.claim_marker(7).await.unwrap();
    assert!(!denied.granted);
    assert_eq!(denied.current_holder, Some(1));
    assert!(!second.is_marker_available(7).await.unwrap());
    assert!(second.invalid_markers().await.unwrap().contains(&7));
    assert!(first.invalid_markers().await.unwrap().is_empty());

    assert!(first.release_marker(7).await.unwrap());
    let mut saw_release = false;
    assert!(
        eventually(Duration::from_secs(2), || {
            saw_release |= second.poll_notifications().iter().any(|e| {
                matches!(
                    e,
                    Event::ClaimReleased {
                        kind: ClaimKind::Marker,
                        key: 7,
                        cause: ReleaseCause::Voluntary,
                        ..
                    }
                )
            });
            std::future::ready(saw_release)
        })
        .await
    );
    assert!(second.claim_marker(7).await.unwrap().granted);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_completed_marker_stays_invalid() {
    let harness = TestCoordinator::start(test_config()).await;
    let first = harness.vehicle(1).await;
    let second = harness.vehicle(2).await;

    assert!(first.claim_marker(4).await.unwrap().granted);
    assert!(first.complete_marker(4).await.unwrap());
    assert!(!first.release_marker(4).await.unwrap());

    assert!(second.invalid_markers().await.unwrap().contains(&4));
    let denied = second.claim_marker(4).await.unwrap();
    assert!(!denied.granted);

    let (claims, _) = second.snapshot(ClaimKind::Marker).await.unwrap();
    assert_eq!(claims.len(), 1);
    assert_eq!(claims[0].completed_by, Some(1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_abandoned_waypoint_expires() {
    let config = CoordinatorConfig {
        claim_grace_ms: 300,
        ..test_config()
    };
    let harness = TestCoordinator::start(config).await;
    let first = harness.vehicle(1).await;
    let second = harness.vehicle(2).await;

    assert!(first.claim_waypoint(5).await.unwrap().granted);
    assert!(!second.is_waypoint_available(5).await.unwrap());

    // Vanish without saying goodbye; the claim survives until it expires.
    drop(first);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.coordinator.holder(ClaimKind::Waypoint, 5), Some(1));

    assert!(
        eventually(Duration::from_secs(2), || async {
            second.is_waypoint_available(5).await.unwrap()
        })
        .await
    );
    assert!(second.claim_waypoint(5).await.unwrap().granted);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_graceful_disconnect_releases_claims() {
    let harness = TestCoordinator::start(test_config()).await;
    let first = harness.vehicle(1).await;
    let second = harness.vehicle(2).await;

    first.claim_waypoint(8).await.unwrap();
    first.claim_marker(3).await.unwrap();
    first.disconnect().await.unwrap();

    assert!(
        eventually(Duration::from_secs(2), || async {
            second.is_marker_available(3).await.unwrap()
                && second.is_waypoint_available(8).await.unwrap()
        })
        .await
    );
    let participant = harness.coordinator.participant(1).unwrap();
    assert!(!participant.connected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_manual_takeoff_by_operator() {
    let harness = TestCoordinator::start(test_config()).await;
    let operator = harness.operator(200).await;

    let mut waits = Vec::new();
    for id in [1, 2] {
        let client = Arc::new(harness.vehicle(id).await);
        waits.push(tokio::spawn(async move {
            client
                .join_takeoff_barrier(
                    TargetSet::from_ids([SENTINEL], SENTINEL),
                    Some(Duration::from_secs(3)),
                )
                .await
                .unwrap()
        }));
    }

    let coordinator = harness.coordinator.clone();
    assert!(
        eventually(Duration::from_secs(2), || {
            let armed = coordinator.barriers().iter().any(|b| {
                b.target == TargetSet::Manual && b.phase == BarrierPhase::Armed && b.ready.len() == 2
            });
            std::future::ready(armed)
        })
        .await
    );

    let released = operator.manual_release().await.unwrap();
    assert_eq!(released.len(), 1);
    for wait in waits {
        assert!(wait.await.unwrap().is_released());
    }

    // The next manual takeoff waits for the operator again.
    let straggler = harness.vehicle(3).await;
    let outcome = straggler
        .join_takeoff_barrier(TargetSet::Manual, Some(Duration::from_millis(200)))
        .await
        .unwrap();
    assert!(matches!(outcome, BarrierWait::TimedOut { barrier } if barrier != released[0]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_vehicle_cannot_trigger_takeoff() {
    let harness = TestCoordinator::start(test_config()).await;
    let vehicle = harness.vehicle(1).await;

    let err = vehicle.manual_release().await.unwrap_err();
    assert_eq!(err.rejection_code(), Some("unauthorized"));
    let err = vehicle.request_landing(None).await.unwrap_err();
    assert_eq!(err.rejection_code(), Some("unauthorized"));
    // The connection survives the rejection.
    assert!(vehicle.claim_waypoint(1).await.unwrap().granted);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_landing_request_reaches_addressed_vehicles() {
    let harness = TestCoordinator::start(test_config()).await;
    let operator = harness.operator(200).await;
    let first = harness.vehicle(1).await;
    let second = harness.vehicle(2).await;

    operator
        .request_landing(Some([2].into_iter().collect()))
        .await
        .unwrap();

    assert!(
        eventually(Duration::from_secs(2), || std::future::ready(
            second.landing_requested()
        ))
        .await
    );
    assert!(!first.landing_requested());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_danger_and_status_are_relayed() {
    let harness = TestCoordinator::start(test_config()).await;
    let reporter = harness.vehicle(1).await;
    let listener = harness.vehicle(2).await;

    reporter.report_danger(4, 11, [12, -3, 40]).await.unwrap();
    reporter.send_status("Start Battery: 76%", Some(76)).unwrap();

    let mut danger = false;
    let mut status = false;
    assert!(
        eventually(Duration::from_secs(2), || {
            for event in listener.poll_notifications() {
                match event {
                    Event::DangerBroadcast {
                        reporter: 1,
                        marker: 4,
                        hazard: 11,
                        offset,
                    } => danger = offset == [12, -3, 40],
                    Event::StatusBroadcast {
                        participant: 1,
                        battery: Some(76),
                        ..
                    } => status = true,
                    _ => {}
                }
            }
            std::future::ready(danger && status)
        })
        .await
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reconnect_resumes_claims() {
    let harness = TestCoordinator::start(test_config()).await;
    let first = harness.vehicle(1).await;
    assert!(first.claim_waypoint(2).await.unwrap().granted);
    drop(first);

    let coordinator = harness.coordinator.clone();
    assert!(
        eventually(Duration::from_secs(2), || std::future::ready(
            !coordinator.participant(1).map(|p| p.connected).unwrap_or(true)
        ))
        .await
    );

    let again = rescuenet_link::SwarmClient::connect(
        harness.client_config(rescuenet_core::Role::Vehicle),
    )
    .await
    .unwrap();
    assert!(again.register_self(1, Default::default()).await.unwrap());
    assert_eq!(harness.coordinator.holder(ClaimKind::Waypoint, 2), Some(1));
    assert!(again.claim_waypoint(2).await.unwrap().granted);
}
