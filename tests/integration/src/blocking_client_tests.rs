//! The synchronous client used from a plain control loop

use std::collections::BTreeSet;
use std::time::Duration;

use rescuenet_coordination::BarrierWait;
use rescuenet_core::{Role, TargetSet};
use rescuenet_link::blocking::SwarmClient;

use crate::test_utils::{test_config, TestCoordinator};

#[test]
fn test_blocking_vehicle_loop() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();
    let harness = runtime.block_on(TestCoordinator::start(test_config()));

    let first = SwarmClient::connect(harness.client_config(Role::Vehicle)).unwrap();
    let second = SwarmClient::connect(harness.client_config(Role::Vehicle)).unwrap();
    assert!(!first.register_self(1, BTreeSet::new()).unwrap());
    assert!(!second.register_self(2, BTreeSet::new()).unwrap());

    let target = TargetSet::from_ids([1, 2], 99);
    let waiter = std::thread::spawn(move || {
        let outcome = first
            .join_takeoff_barrier(target, Some(Duration::from_secs(3)))
            .unwrap();
        (first, outcome)
    });
    let outcome = second
        .join_takeoff_barrier(TargetSet::from_ids([2, 1], 99), Some(Duration::from_secs(3)))
        .unwrap();
    let (first, first_outcome) = waiter.join().unwrap();
    assert!(matches!(outcome, BarrierWait::Released { .. }));
    assert_eq!(outcome, first_outcome);

    // Search phase: both vehicles spot marker 3.
    assert!(first.is_marker_available(3).unwrap());
    assert!(first.claim_marker(3).unwrap().granted);
    assert!(!second.claim_marker(3).unwrap().granted);
    assert!(second.invalid_markers().unwrap().contains(&3));

    first.send_status("Locked on marker 3", Some(64)).unwrap();
    assert!(first.complete_marker(3).unwrap());
    first.disconnect().unwrap();
    second.disconnect().unwrap();

    drop(harness);
    runtime.shutdown_timeout(Duration::from_secs(1));
}
