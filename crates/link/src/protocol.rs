//! Wire protocol between vehicles and the coordinator.
//!
//! Every frame is one JSON object with a `type` tag. Requests may carry a
//! `request_id`; the direct reply echoes it so a client can match replies to
//! requests while events stream in between.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use rescuenet_coordination::{BarrierId, BarrierPhase, ClaimRecord, Envelope};
use rescuenet_core::{ClaimKey, ClaimKind, ParticipantId, Role, TargetSet};

/// Protocol revision announced in [`ServerMessage::Welcome`].
pub const PROTOCOL_VERSION: u32 = 1;

/// Client to coordinator messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Identify this connection. Must come first.
    Register {
        /// Participant id
        id: ParticipantId,
        /// Declared role
        #[serde(default)]
        role: Role,
        /// Declared capability tags
        #[serde(default)]
        capabilities: BTreeSet<String>,
    },
    /// Try to claim a key
    ClaimRequest {
        /// Claim table
        kind: ClaimKind,
        /// Key
        key: ClaimKey,
    },
    /// Release a held key
    Release {
        /// Claim table
        kind: ClaimKind,
        /// Key
        key: ClaimKey,
    },
    /// Mark a key as handled for good
    Complete {
        /// Claim table
        kind: ClaimKind,
        /// Key
        key: ClaimKey,
    },
    /// Ask whether a key is free
    AvailabilityQuery {
        /// Claim table
        kind: ClaimKind,
        /// Key
        key: ClaimKey,
    },
    /// Ask for markers other participants have taken
    InvalidQuery {},
    /// Join the takeoff barrier for a target set
    JoinBarrier {
        /// Participants to wait for, or the manual sentinel
        targets: TargetSet,
    },
    /// Release manual barriers (operator only)
    ManualRelease {},
    /// Ask vehicles to land (operator only)
    RequestLanding {
        /// Vehicles to land; absent means all
        #[serde(default)]
        targets: Option<BTreeSet<ParticipantId>>,
    },
    /// Hazard seen near the locked-on marker
    DangerReport {
        /// Locked-on marker
        marker: ClaimKey,
        /// Nearest hazard marker
        hazard: ClaimKey,
        /// Signed offset hazard to marker
        offset: [i32; 3],
    },
    /// Free-text status
    Status {
        /// Status text
        text: String,
        /// Battery percentage
        #[serde(default)]
        battery: Option<u8>,
    },
    /// Pull the non-free keys of a table
    Snapshot {
        /// Claim table
        kind: ClaimKind,
    },
    /// Liveness signal; no reply
    Heartbeat {},
    /// Leave gracefully, releasing all claims
    Unregister {},
}

/// Framed client request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Echoed in the direct reply
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    /// Request body
    #[serde(flatten)]
    pub message: ClientMessage,
}

impl Request {
    /// Request with a correlation id
    pub fn new(request_id: u64, message: ClientMessage) -> Self {
        Self {
            request_id: Some(request_id),
            message,
        }
    }

    /// Fire-and-forget request
    pub fn oneway(message: ClientMessage) -> Self {
        Self {
            request_id: None,
            message,
        }
    }
}

/// Coordinator to client messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First frame on every connection
    Welcome {
        /// Service name and version
        server: String,
        /// Protocol revision
        protocol_version: u32,
    },
    /// Reply to `Register`
    Registered {
        /// Correlation id
        request_id: Option<u64>,
        /// Registered id
        participant: ParticipantId,
        /// True when the id was already known
        reconnect: bool,
        /// How often the client should send heartbeats
        heartbeat_interval_ms: u64,
        /// Id meaning "manual takeoff" in legacy target lists
        manual_sentinel_id: ParticipantId,
    },
    /// Reply to `ClaimRequest` and `AvailabilityQuery`
    ClaimResult {
        /// Correlation id
        request_id: Option<u64>,
        /// Claim table
        kind: ClaimKind,
        /// Key
        key: ClaimKey,
        /// Claim outcome; absent for availability queries
        granted: Option<bool>,
        /// Whether the key is free after the request
        available: bool,
        /// Holder after the request
        current_holder: Option<ParticipantId>,
    },
    /// Reply to `Release`
    Released {
        /// Correlation id
        request_id: Option<u64>,
        /// Claim table
        kind: ClaimKind,
        /// Key
        key: ClaimKey,
        /// Whether the caller held and released it
        released: bool,
    },
    /// Reply to `Complete`
    Completed {
        /// Correlation id
        request_id: Option<u64>,
        /// Claim table
        kind: ClaimKind,
        /// Key
        key: ClaimKey,
        /// Whether the key is now completed by the caller
        completed: bool,
    },
    /// Reply to `InvalidQuery`
    Invalid {
        /// Correlation id
        request_id: Option<u64>,
        /// Markers taken by other participants
        markers: BTreeSet<ClaimKey>,
    },
    /// Reply to `JoinBarrier`
    BarrierJoined {
        /// Correlation id
        request_id: Option<u64>,
        /// Barrier instance
        barrier: BarrierId,
        /// Normalized target
        target: TargetSet,
        /// Phase right after the join
        phase: BarrierPhase,
        /// Set when the barrier has already released
        release_seq: Option<u64>,
    },
    /// Reply to `ManualRelease`
    ManualReleased {
        /// Correlation id
        request_id: Option<u64>,
        /// Barriers released by this trigger
        barriers: Vec<BarrierId>,
    },
    /// Reply to `Snapshot`
    Snapshot {
        /// Correlation id
        request_id: Option<u64>,
        /// Claim table
        kind: ClaimKind,
        /// Non-free keys
        claims: Vec<ClaimRecord>,
        /// Last event sequence at snapshot time
        last_seq: u64,
    },
    /// Generic acknowledgment
    Ack {
        /// Correlation id
        request_id: Option<u64>,
    },
    /// Fan-out event
    Event(Envelope),
    /// Events were dropped for this connection; pull a snapshot
    Resync {
        /// Number of dropped events
        missed: u64,
    },
    /// Request rejected; the connection stays open
    Error {
        /// Correlation id
        request_id: Option<u64>,
        /// Machine-readable code
        code: String,
        /// Human-readable reason
        message: String,
    },
}

impl ServerMessage {
    /// Correlation id of a direct reply. Events and resync notices have none.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            ServerMessage::Registered { request_id, .. }
            | ServerMessage::ClaimResult { request_id, .. }
            | ServerMessage::Released { request_id, .. }
            | ServerMessage::Completed { request_id, .. }
            | ServerMessage::Invalid { request_id, .. }
            | ServerMessage::BarrierJoined { request_id, .. }
            | ServerMessage::ManualReleased { request_id, .. }
            | ServerMessage::Snapshot { request_id, .. }
            | ServerMessage::Ack { request_id }
            | ServerMessage::Error { request_id, .. } => *request_id,
            ServerMessage::Welcome { .. }
            | ServerMessage::Event(_)
            | ServerMessage::Resync { .. } => None,
        }
    }
}
