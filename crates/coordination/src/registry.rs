//! Participant registry
//!
//! Maps participant ids to their last-seen liveness, role and declared
//! capabilities. Entries are created on first registration and never removed:
//! a silent participant is only marked stale, so it can reconnect under the
//! same id and pick up where it left off.

use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use rescuenet_core::{current_timestamp_ms, CoreError, ParticipantId, Result, Role};

use crate::{read, write};

/// Liveness derived from the time since the last heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    /// Heard from recently
    Alive,
    /// Past 80% of the timeout
    Warning,
    /// Past the timeout
    Stale,
}

/// Registry entry for one participant.
#[derive(Debug, Clone, Serialize)]
pub struct Participant {
    /// Participant id
    pub id: ParticipantId,
    /// Declared role
    pub role: Role,
    /// Declared capability tags
    pub capabilities: BTreeSet<String>,
    /// First registration (Unix ms)
    pub registered_at_ms: u64,
    /// Last request or heartbeat (Unix ms)
    pub last_seen_ms: u64,
    /// Last request or heartbeat (monotonic)
    #[serde(skip)]
    pub last_seen: Instant,
    /// Registrations so far; 1 on first contact
    pub session: u64,
    /// Whether a connection is currently attached
    pub connected: bool,
    /// Set once the heartbeat deadline passed; cleared on next contact
    pub stale: bool,
    /// Last status text reported
    pub status: Option<String>,
    /// Last battery percentage reported
    pub battery: Option<u8>,
}

impl Participant {
    fn new(id: ParticipantId, role: Role, capabilities: BTreeSet<String>, now: Instant) -> Self {
        let now_ms = current_timestamp_ms();
        Self {
            id,
            role,
            capabilities,
            registered_at_ms: now_ms,
            last_seen_ms: now_ms,
            last_seen: now,
            session: 1,
            connected: true,
            stale: false,
            status: None,
            battery: None,
        }
    }

    fn touch(&mut self, now: Instant) {
        self.last_seen = now;
        self.last_seen_ms = current_timestamp_ms();
        self.stale = false;
    }

    /// Liveness at `now` for the given timeout.
    pub fn liveness(&self, now: Instant, timeout: Duration) -> Liveness {
        let elapsed = now.saturating_duration_since(self.last_seen);
        if elapsed >= timeout {
            Liveness::Stale
        } else if elapsed >= timeout * 4 / 5 {
            Liveness::Warning
        } else {
            Liveness::Alive
        }
    }
}

/// Result of a registration.
#[derive(Debug, Clone)]
pub struct Registration {
    /// Snapshot of the entry after registration
    pub participant: Participant,
    /// True when the id was already known
    pub reconnect: bool,
}

/// Process-wide participant registry.
#[derive(Debug, Default)]
pub struct Registry {
    participants: RwLock<HashMap<ParticipantId, Participant>>,
}

impl Registry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id`, or reattach a known id.
    ///
    /// Reconnection keeps the original registration time and bumps the
    /// session counter. Role and capabilities are replaced by the new
    /// declaration.
    pub fn register(
        &self,
        id: ParticipantId,
        role: Role,
        capabilities: BTreeSet<String>,
        now: Instant,
    ) -> Registration {
        let mut participants = write(&self.participants);

        if let Some(existing) = participants.get_mut(&id) {
            existing.touch(now);
            existing.session += 1;
            existing.connected = true;
            existing.role = role;
            existing.capabilities = capabilities;
            info!(participant = id, session = existing.session, "Participant reconnected");
            return Registration {
                participant: existing.clone(),
                reconnect: true,
            };
        }

        let participant = Participant::new(id, role, capabilities, now);
        participants.insert(id, participant.clone());
        info!(participant = id, role = ?role, "Participant registered");
        Registration {
            participant,
            reconnect: false,
        }
    }

    /// Record contact from `id`. Returns its role.
    pub fn touch(&self, id: ParticipantId, now: Instant) -> Result<Role> {
        let mut participants = write(&self.participants);
        let participant = participants
            .get_mut(&id)
            .ok_or(CoreError::UnknownParticipant { id })?;
        participant.touch(now);
        Ok(participant.role)
    }

    /// Store the latest status report.
    pub fn record_status(&self, id: ParticipantId, text: &str, battery: Option<u8>) {
        if let Some(participant) = write(&self.participants).get_mut(&id) {
            participant.status = Some(text.to_string());
            if battery.is_some() {
                participant.battery = battery;
            }
        }
    }

    /// Detach the connection of `id`; the entry stays.
    pub fn mark_disconnected(&self, id: ParticipantId) {
        if let Some(participant) = write(&self.participants).get_mut(&id) {
            participant.connected = false;
            debug!(participant = id, "Participant detached");
        }
    }

    /// Mark participants that crossed `timeout` as stale.
    ///
    /// Returns only the ids that became stale in this call.
    pub fn check_stale(&self, now: Instant, timeout: Duration) -> Vec<ParticipantId> {
        let mut participants = write(&self.participants);
        let mut newly_stale = Vec::new();

        for participant in participants.values_mut() {
            if !participant.stale && participant.liveness(now, timeout) == Liveness::Stale {
                participant.stale = true;
                newly_stale.push(participant.id);
            }
        }

        newly_stale.sort_unstable();
        newly_stale
    }

    /// Snapshot of one participant
    pub fn get(&self, id: ParticipantId) -> Option<Participant> {
        read(&self.participants).get(&id).cloned()
    }

    /// Role of a registered participant
    pub fn role_of(&self, id: ParticipantId) -> Option<Role> {
        read(&self.participants).get(&id).map(|p| p.role)
    }

    /// Snapshot of every participant, ordered by id
    pub fn all(&self) -> Vec<Participant> {
        let mut all: Vec<Participant> = read(&self.participants).values().cloned().collect();
        all.sort_by_key(|p| p.id);
        all
    }

    /// Number of known participants
    pub fn len(&self) -> usize {
        read(&self.participants).len()
    }

    /// True when nobody ever registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
