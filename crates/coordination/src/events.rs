//! Events fanned out to every connected participant.
//!
//! The set of event kinds is closed. Free text only travels inside
//! [`Event::StatusBroadcast`], which carries no delivery guarantee.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use rescuenet_core::{ClaimKey, ClaimKind, ParticipantId, Role, TargetSet};

use crate::barrier::BarrierId;

/// Why a claim stopped being held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseCause {
    /// Holder released it
    Voluntary,
    /// Not refreshed within the grace period
    Expired,
    /// Holder closed its connection
    Disconnected,
    /// Holder stopped sending heartbeats
    Stale,
}

/// Coordination event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// A free key was granted to `holder`
    ClaimGranted {
        /// Claim table
        kind: ClaimKind,
        /// Claimed key
        key: ClaimKey,
        /// New holder
        holder: ParticipantId,
    },

    /// A held key became free again
    ClaimReleased {
        /// Claim table
        kind: ClaimKind,
        /// Released key
        key: ClaimKey,
        /// Holder that lost the claim
        holder: ParticipantId,
        /// What ended the claim
        cause: ReleaseCause,
    },

    /// A key was handled for good and will never be granted again
    ClaimCompleted {
        /// Claim table
        kind: ClaimKind,
        /// Completed key
        key: ClaimKey,
        /// Participant that completed it
        by: ParticipantId,
    },

    /// A takeoff barrier released its participants
    BarrierReleased {
        /// Barrier instance
        barrier: BarrierId,
        /// Target the barrier was formed for
        target: TargetSet,
        /// Participants that had joined at release time
        ready: BTreeSet<ParticipantId>,
        /// Position of this release in the global release order
        release_seq: u64,
    },

    /// A vehicle sees a hazard marker near the marker it is locked on
    DangerBroadcast {
        /// Reporting vehicle
        reporter: ParticipantId,
        /// Marker the vehicle is locked on
        marker: ClaimKey,
        /// Nearest hazard marker
        hazard: ClaimKey,
        /// Signed offset from hazard to marker (cm, camera frame)
        offset: [i32; 3],
    },

    /// Best-effort free-text status
    StatusBroadcast {
        /// Sender
        participant: ParticipantId,
        /// Status text
        text: String,
        /// Battery percentage, when reported
        battery: Option<u8>,
    },

    /// Operator asked vehicles to land
    LandingRequested {
        /// Vehicles that should land; `None` means every vehicle
        targets: Option<BTreeSet<ParticipantId>>,
        /// Operator that issued the request
        requested_by: ParticipantId,
    },

    /// A participant registered or reconnected
    ParticipantJoined {
        /// Participant id
        participant: ParticipantId,
        /// Declared role
        role: Role,
        /// True when the id was already known
        reconnect: bool,
    },

    /// A participant missed its heartbeat deadline
    ParticipantStale {
        /// Participant id
        participant: ParticipantId,
    },
}

impl Event {
    /// Claim key this event is ordered on, if any.
    pub fn claim_key(&self) -> Option<(ClaimKind, ClaimKey)> {
        match self {
            Event::ClaimGranted { kind, key, .. }
            | Event::ClaimReleased { kind, key, .. }
            | Event::ClaimCompleted { kind, key, .. } => Some((*kind, *key)),
            _ => None,
        }
    }

    /// Whether a landing request addresses `participant`.
    pub fn requests_landing_of(&self, participant: ParticipantId) -> bool {
        match self {
            Event::LandingRequested { targets: None, .. } => true,
            Event::LandingRequested {
                targets: Some(targets),
                ..
            } => targets.contains(&participant),
            _ => false,
        }
    }
}
