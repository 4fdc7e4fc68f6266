//! Claim tables for waypoints and markers.
//!
//! Each key owns its own lock. The outer map lock is only taken to find or
//! create a slot, so vehicles working on different keys never wait on each
//! other. Events for a key are published while its lock is held, which makes
//! every subscriber observe a key's transitions in commit order.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use rescuenet_core::{current_timestamp_ms, ClaimKey, ClaimKind, ParticipantId};

use crate::events::{Event, ReleaseCause};
use crate::fanout::FanOut;
use crate::{lock, read, write};

/// State of one waypoint or marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimState {
    /// Nobody holds it
    Free,
    /// Exclusively held
    Held {
        /// Current holder
        holder: ParticipantId,
        /// When the claim was first granted
        acquired_at: Instant,
        /// Last grant or re-claim by the holder
        refreshed_at: Instant,
    },
    /// Handled for good; never granted again
    Completed {
        /// Participant that completed it
        by: ParticipantId,
        /// Completion time (Unix ms)
        at_ms: u64,
    },
}

impl ClaimState {
    fn holder(&self) -> Option<ParticipantId> {
        match self {
            ClaimState::Held { holder, .. } => Some(*holder),
            ClaimState::Completed { by, .. } => Some(*by),
            ClaimState::Free => None,
        }
    }
}

/// Answer to a claim attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimOutcome {
    /// Whether the caller now holds the key
    pub granted: bool,
    /// Holder after the attempt, if any
    pub current_holder: Option<ParticipantId>,
}

/// Point-in-time view of one key, used for snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRecord {
    /// Claim table
    pub kind: ClaimKind,
    /// Key
    pub key: ClaimKey,
    /// Holder, when held
    pub holder: Option<ParticipantId>,
    /// How long the current holder has had it
    pub held_for_ms: Option<u64>,
    /// Completer, when completed
    pub completed_by: Option<ParticipantId>,
}

type Slot = Arc<Mutex<ClaimState>>;

/// Keyed-lock table for one claim kind.
#[derive(Debug)]
pub struct ClaimTable {
    kind: ClaimKind,
    slots: RwLock<HashMap<ClaimKey, Slot>>,
    fanout: Arc<FanOut>,
}

impl ClaimTable {
    /// Create an empty table publishing to `fanout`.
    pub fn new(kind: ClaimKind, fanout: Arc<FanOut>) -> Self {
        Self {
            kind,
            slots: RwLock::new(HashMap::new()),
            fanout,
        }
    }

    /// Kind of key stored in this table
    pub fn kind(&self) -> ClaimKind {
        self.kind
    }

    fn existing(&self, key: ClaimKey) -> Option<Slot> {
        read(&self.slots).get(&key).cloned()
    }

    fn slot(&self, key: ClaimKey) -> Slot {
        if let Some(slot) = self.existing(key) {
            return slot;
        }
        write(&self.slots)
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(ClaimState::Free)))
            .clone()
    }

    fn slots(&self) -> Vec<(ClaimKey, Slot)> {
        let mut slots: Vec<(ClaimKey, Slot)> = read(&self.slots)
            .iter()
            .map(|(key, slot)| (*key, slot.clone()))
            .collect();
        slots.sort_unstable_by_key(|(key, _)| *key);
        slots
    }

    /// Atomic check-and-set.
    ///
    /// Grants a free key, or refreshes the claim when `who` already holds it.
    /// Otherwise reports the current holder and changes nothing.
    pub fn try_claim(&self, key: ClaimKey, who: ParticipantId, now: Instant) -> ClaimOutcome {
        let slot = self.slot(key);
        let mut state = lock(&slot);

        match *state {
            ClaimState::Free => {
                *state = ClaimState::Held {
                    holder: who,
                    acquired_at: now,
                    refreshed_at: now,
                };
                self.fanout.publish(Event::ClaimGranted {
                    kind: self.kind,
                    key,
                    holder: who,
                });
                debug!(kind = %self.kind, key, participant = who, "Claim granted");
                ClaimOutcome {
                    granted: true,
                    current_holder: Some(who),
                }
            }
            ClaimState::Held {
                holder,
                acquired_at,
                ..
            } if holder == who => {
                *state = ClaimState::Held {
                    holder,
                    acquired_at,
                    refreshed_at: now,
                };
                ClaimOutcome {
                    granted: true,
                    current_holder: Some(who),
                }
            }
            other => ClaimOutcome {
                granted: false,
                current_holder: other.holder(),
            },
        }
    }

    /// Release `key` if `who` holds it. Releasing a free key is a no-op.
    pub fn release(&self, key: ClaimKey, who: ParticipantId) -> bool {
        let Some(slot) = self.existing(key) else {
            return false;
        };
        let mut state = lock(&slot);

        match *state {
            ClaimState::Held { holder, .. } if holder == who => {
                self.free(key, &mut state, holder, ReleaseCause::Voluntary);
                true
            }
            _ => false,
        }
    }

    /// Mark `key` as handled for good.
    ///
    /// Allowed for the holder, or for anyone while the key is free.
    pub fn complete(&self, key: ClaimKey, who: ParticipantId) -> bool {
        let slot = self.slot(key);
        let mut state = lock(&slot);

        let allowed = match *state {
            ClaimState::Free => true,
            ClaimState::Held { holder, .. } => holder == who,
            ClaimState::Completed { .. } => false,
        };
        if !allowed {
            return false;
        }

        *state = ClaimState::Completed {
            by: who,
            at_ms: current_timestamp_ms(),
        };
        self.fanout.publish(Event::ClaimCompleted {
            kind: self.kind,
            key,
            by: who,
        });
        info!(kind = %self.kind, key, participant = who, "Claim completed");
        true
    }

    fn free(&self, key: ClaimKey, state: &mut ClaimState, holder: ParticipantId, cause: ReleaseCause) {
        *state = ClaimState::Free;
        self.fanout.publish(Event::ClaimReleased {
            kind: self.kind,
            key,
            holder,
            cause,
        });
        debug!(kind = %self.kind, key, participant = holder, cause = ?cause, "Claim released");
    }

    /// Whether `key` is free right now.
    ///
    /// The answer may be stale by the time the caller acts on it; only the
    /// result of [`ClaimTable::try_claim`] is authoritative.
    pub fn is_available(&self, key: ClaimKey) -> bool {
        match self.existing(key) {
            Some(slot) => *lock(&slot) == ClaimState::Free,
            None => true,
        }
    }

    /// Current holder (or completer) of `key`
    pub fn holder(&self, key: ClaimKey) -> Option<ParticipantId> {
        self.existing(key).and_then(|slot| lock(&slot).holder())
    }

    /// Keys held or completed by anyone other than `exclude`.
    pub fn taken_by_others(&self, exclude: Option<ParticipantId>) -> BTreeSet<ClaimKey> {
        self.slots()
            .into_iter()
            .filter(|(_, slot)| match lock(slot).holder() {
                Some(holder) => Some(holder) != exclude,
                None => false,
            })
            .map(|(key, _)| key)
            .collect()
    }

    /// Keys currently held by `who` (completed keys excluded)
    pub fn held_by(&self, who: ParticipantId) -> Vec<ClaimKey> {
        self.slots()
            .into_iter()
            .filter(|(_, slot)| matches!(*lock(slot), ClaimState::Held { holder, .. } if holder == who))
            .map(|(key, _)| key)
            .collect()
    }

    /// Every non-free key, ordered by key.
    pub fn snapshot(&self, now: Instant) -> Vec<ClaimRecord> {
        self.slots()
            .into_iter()
            .filter_map(|(key, slot)| {
                let state = *lock(&slot);
                match state {
                    ClaimState::Free => None,
                    ClaimState::Held {
                        holder,
                        acquired_at,
                        ..
                    } => Some(ClaimRecord {
                        kind: self.kind,
                        key,
                        holder: Some(holder),
                        held_for_ms: Some(
                            now.saturating_duration_since(acquired_at).as_millis() as u64,
                        ),
                        completed_by: None,
                    }),
                    ClaimState::Completed { by, .. } => Some(ClaimRecord {
                        kind: self.kind,
                        key,
                        holder: None,
                        held_for_ms: None,
                        completed_by: Some(by),
                    }),
                }
            })
            .collect()
    }

    /// Revoke claims whose last refresh is older than `grace`.
    pub fn sweep_expired(&self, now: Instant, grace: Duration) -> Vec<ClaimKey> {
        let mut expired = Vec::new();

        for (key, slot) in self.slots() {
            let mut state = lock(&slot);
            if let ClaimState::Held {
                holder,
                refreshed_at,
                ..
            } = *state
            {
                if now.saturating_duration_since(refreshed_at) > grace {
                    info!(kind = %self.kind, key, participant = holder, "Claim expired");
                    self.free(key, &mut state, holder, ReleaseCause::Expired);
                    expired.push(key);
                }
            }
        }

        expired
    }

    /// Release every key held by `who`.
    pub fn release_all_held_by(&self, who: ParticipantId, cause: ReleaseCause) -> Vec<ClaimKey> {
        let mut released = Vec::new();

        for (key, slot) in self.slots() {
            let mut state = lock(&slot);
            if matches!(*state, ClaimState::Held { holder, .. } if holder == who) {
                self.free(key, &mut state, who, cause);
                released.push(key);
            }
        }

        released
    }
}

/// The two claim tables side by side.
#[derive(Debug)]
pub struct ClaimBoard {
    waypoints: ClaimTable,
    markers: ClaimTable,
}

impl ClaimBoard {
    /// Create both tables on the same fan-out.
    pub fn new(fanout: Arc<FanOut>) -> Self {
        Self {
            waypoints: ClaimTable::new(ClaimKind::Waypoint, fanout.clone()),
            markers: ClaimTable::new(ClaimKind::Marker, fanout),
        }
    }

    /// Table for `kind`
    pub fn table(&self, kind: ClaimKind) -> &ClaimTable {
        match kind {
            ClaimKind::Waypoint => &self.waypoints,
            ClaimKind::Marker => &self.markers,
        }
    }

    /// Markers other participants have locked onto or finished.
    ///
    /// The caller's own markers stay valid so it can keep tracking the
    /// marker it is already locked on.
    pub fn list_invalid(&self, exclude_holder: Option<ParticipantId>) -> BTreeSet<ClaimKey> {
        self.markers.taken_by_others(exclude_holder)
    }
}
