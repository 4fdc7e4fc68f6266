//! RescueNet coordination core
//!
//! Central arbitration for a small fleet of search-and-rescue vehicles:
//! - Participant registry with heartbeat-based staleness
//! - Mutually exclusive claims on waypoints and markers, one lock per key
//! - Takeoff barriers released by a full target set or an operator trigger
//! - Event fan-out that never blocks on slow subscribers
//!
//! # Examples
//!
//! ```
//! use std::collections::BTreeSet;
//! use rescuenet_coordination::Coordinator;
//! use rescuenet_core::{ClaimKind, CoordinatorConfig, Role};
//!
//! let coordinator = Coordinator::new(CoordinatorConfig::default()).unwrap();
//! coordinator.register(1, Role::Vehicle, BTreeSet::new()).unwrap();
//! coordinator.register(2, Role::Vehicle, BTreeSet::new()).unwrap();
//!
//! assert!(coordinator.try_claim(ClaimKind::Marker, 7, 1).unwrap().granted);
//! let denied = coordinator.try_claim(ClaimKind::Marker, 7, 2).unwrap();
//! assert_eq!(denied.current_holder, Some(1));
//! ```

#![warn(missing_docs)]

pub mod barrier;
pub mod claims;
pub mod coordinator;
pub mod events;
pub mod fanout;
pub mod registry;

pub use barrier::{BarrierId, BarrierPhase, BarrierSnapshot, BarrierWait, JoinTicket};
pub use claims::{ClaimBoard, ClaimOutcome, ClaimRecord, ClaimTable};
pub use coordinator::{Coordinator, SweepReport};
pub use events::{Event, ReleaseCause};
pub use fanout::{Delivery, Envelope, FanOut, Subscription};
pub use registry::{Liveness, Participant, Registration, Registry};

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

// A panic while holding one of these locks cannot leave the guarded state
// half-written: every critical section assigns whole values.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
