//! RescueNet link layer
//!
//! JSON-over-WebSocket transport between vehicles and the coordinator:
//! - `protocol`: tagged request and reply messages
//! - `server`: per-connection tasks in front of a [`rescuenet_coordination::Coordinator`]
//! - `client`: async vehicle facade, with a `blocking` wrapper for plain loops

#![warn(missing_docs)]

pub mod blocking;
pub mod client;
pub mod error;
pub mod protocol;
pub mod server;

pub use client::{ClientConfig, SwarmClient};
pub use error::{LinkError, Result};
pub use protocol::{ClientMessage, Request, ServerMessage, PROTOCOL_VERSION};
pub use server::WsServer;
