//! Core types shared by the coordinator, the wire protocol and the client.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Identity of one participant (vehicle, operator console or observer).
///
/// Small positive integer. Zero is never valid.
pub type ParticipantId = u32;

/// Numeric key of a waypoint or marker.
pub type ClaimKey = u32;

/// Which of the two claim tables a key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimKind {
    /// Search waypoint from the mission plan
    Waypoint,
    /// Detected marker (victim, hazard, exit)
    Marker,
}

impl ClaimKind {
    /// Both kinds, in table order.
    pub const ALL: [ClaimKind; 2] = [ClaimKind::Waypoint, ClaimKind::Marker];
}

impl fmt::Display for ClaimKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClaimKind::Waypoint => write!(f, "waypoint"),
            ClaimKind::Marker => write!(f, "marker"),
        }
    }
}

/// Role a participant declares when registering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Flying vehicle; may claim, join barriers and report
    #[default]
    Vehicle,
    /// Operator console; may additionally trigger manual release and landing
    Operator,
    /// Read-only dashboard subscribed to the event stream
    Observer,
}

impl Role {
    /// Whether this role may issue operator-only commands.
    pub fn is_operator(&self) -> bool {
        matches!(self, Role::Operator)
    }

    /// Whether this role may mutate claim or barrier state.
    pub fn can_act(&self) -> bool {
        !matches!(self, Role::Observer)
    }
}

/// Set of participants a takeoff barrier waits for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetSet {
    /// Release as soon as every listed participant has joined
    Participants(BTreeSet<ParticipantId>),
    /// Release only on an explicit operator trigger
    Manual,
}

impl TargetSet {
    /// Build a target set from a plain id list.
    ///
    /// A list made of only `sentinel` maps to [`TargetSet::Manual`], matching
    /// how the field scripts request an operator-triggered takeoff.
    pub fn from_ids<I>(ids: I, sentinel: ParticipantId) -> Self
    where
        I: IntoIterator<Item = ParticipantId>,
    {
        let set: BTreeSet<ParticipantId> = ids.into_iter().collect();
        if set.len() == 1 && set.contains(&sentinel) {
            TargetSet::Manual
        } else {
            TargetSet::Participants(set)
        }
    }

    /// Normalize a set that may still carry the legacy sentinel.
    pub fn normalize(self, sentinel: ParticipantId) -> Self {
        match self {
            TargetSet::Participants(set) => TargetSet::from_ids(set, sentinel),
            TargetSet::Manual => TargetSet::Manual,
        }
    }

    /// True for the operator-triggered variant.
    pub fn is_manual(&self) -> bool {
        matches!(self, TargetSet::Manual)
    }

    /// Whether `ready` covers every required participant.
    ///
    /// Manual sets are never satisfied by joins alone.
    pub fn is_satisfied_by(&self, ready: &BTreeSet<ParticipantId>) -> bool {
        match self {
            TargetSet::Participants(required) => required.is_subset(ready),
            TargetSet::Manual => false,
        }
    }
}

impl fmt::Display for TargetSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetSet::Manual => write!(f, "manual"),
            TargetSet::Participants(set) => {
                let ids: Vec<String> = set.iter().map(|id| id.to_string()).collect();
                write!(f, "[{}]", ids.join(","))
            }
        }
    }
}

/// Current wall-clock time in Unix milliseconds.
///
/// Only used for reporting; expiry decisions use monotonic instants.
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
