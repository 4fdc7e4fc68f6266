//! End-to-end tests for the RescueNet coordinator
//!
//! Every test starts a real coordinator on a loopback port and drives it
//! through the vehicle client or raw WebSocket frames:
//! - Takeoff barrier release, late joiners and operator-triggered takeoff
//! - Marker and waypoint contention, expiry and disconnect cleanup
//! - Protocol robustness: malformed frames, slow subscribers, reconnects

pub mod test_utils;

#[cfg(test)]
mod swarm_scenarios;

#[cfg(test)]
mod protocol_tests;

#[cfg(test)]
mod blocking_client_tests;
