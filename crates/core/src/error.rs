//! Core error types
//!
//! Contention is never an error: a denied claim is a normal result. These
//! variants cover malformed or unauthorized requests, which are reported back
//! to the offending client while its connection stays open.

use thiserror::Error;

use crate::types::{ClaimKey, ClaimKind, ParticipantId};

/// Core error type for RescueNet
#[derive(Debug, Error)]
pub enum CoreError {
    /// Participant id outside `1..=max`
    #[error("Participant id {id} out of range (1..={max})")]
    InvalidParticipant {
        /// Offending id
        id: ParticipantId,
        /// Highest accepted id
        max: ParticipantId,
    },

    /// Participant id reserved for the manual takeoff sentinel
    #[error("Participant id {id} is reserved")]
    ReservedParticipant {
        /// Offending id
        id: ParticipantId,
    },

    /// Id was never registered with the coordinator
    #[error("Participant {id} is not registered")]
    UnknownParticipant {
        /// Offending id
        id: ParticipantId,
    },

    /// Connection issued a request before registering
    #[error("Register must be sent before any other request")]
    NotRegistered,

    /// Role is not allowed to perform the action
    #[error("Participant {id} may not {action}")]
    Unauthorized {
        /// Requesting participant
        id: ParticipantId,
        /// Rejected action
        action: &'static str,
    },

    /// Key outside the configured range for its table
    #[error("{kind} key {key} out of range (0..={max})")]
    KeyOutOfRange {
        /// Table the key was addressed to
        kind: ClaimKind,
        /// Offending key
        key: ClaimKey,
        /// Highest accepted key
        max: ClaimKey,
    },

    /// Barrier requested with no participants
    #[error("Barrier target set is empty")]
    EmptyTargetSet,

    /// Message could not be decoded
    #[error("Malformed request: {0}")]
    Malformed(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Stable machine-readable code sent to clients alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::InvalidParticipant { .. } => "invalid_participant",
            CoreError::ReservedParticipant { .. } => "reserved_participant",
            CoreError::UnknownParticipant { .. } => "unknown_participant",
            CoreError::NotRegistered => "not_registered",
            CoreError::Unauthorized { .. } => "unauthorized",
            CoreError::KeyOutOfRange { .. } => "key_out_of_range",
            CoreError::EmptyTargetSet => "empty_target_set",
            CoreError::Malformed(_) => "malformed",
            CoreError::Config(_) => "config",
            CoreError::Io(_) => "io",
        }
    }
}

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
