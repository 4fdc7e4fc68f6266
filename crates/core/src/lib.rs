//! Core functionality for the RescueNet swarm coordinator.
//!
//! This crate provides the fundamental types, errors, configuration and
//! logging setup shared by the coordination engine, the wire link and the
//! service binary.

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use config::CoordinatorConfig;
pub use error::{CoreError, Result};
pub use types::{
    current_timestamp_ms, ClaimKey, ClaimKind, ParticipantId, Role, TargetSet,
};
