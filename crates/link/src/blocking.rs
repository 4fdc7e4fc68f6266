//! Synchronous client for plain control loops
//!
//! Wraps the async [`crate::client::SwarmClient`] in a private runtime with a
//! single worker thread, so heartbeats and incoming events keep flowing
//! while the vehicle loop is busy between calls.

use std::collections::BTreeSet;
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};

use rescuenet_coordination::{BarrierId, BarrierWait, ClaimOutcome, ClaimRecord, Event};
use rescuenet_core::{ClaimKey, ClaimKind, ParticipantId, TargetSet};

use crate::client::{self, ClientConfig};
use crate::error::Result;

/// Blocking counterpart of [`client::SwarmClient`].
///
/// Must not be used from inside an async context.
#[derive(Debug)]
pub struct SwarmClient {
    inner: client::SwarmClient,
    runtime: Runtime,
}

impl SwarmClient {
    /// Connect to the coordinator
    pub fn connect(config: ClientConfig) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("rescuenet-link")
            .enable_all()
            .build()?;
        let inner = runtime.block_on(client::SwarmClient::connect(config))?;
        Ok(Self { inner, runtime })
    }

    /// Client configuration
    pub fn config(&self) -> &ClientConfig {
        self.inner.config()
    }

    /// Registered participant id
    pub fn participant(&self) -> Option<ParticipantId> {
        self.inner.participant()
    }

    /// See [`client::SwarmClient::register_self`]
    pub fn register_self(&self, id: ParticipantId, capabilities: BTreeSet<String>) -> Result<bool> {
        self.runtime
            .block_on(self.inner.register_self(id, capabilities))
    }

    /// See [`client::SwarmClient::join_takeoff_barrier`]
    pub fn join_takeoff_barrier(
        &self,
        targets: TargetSet,
        timeout: Option<Duration>,
    ) -> Result<BarrierWait> {
        self.runtime
            .block_on(self.inner.join_takeoff_barrier(targets, timeout))
    }

    /// Whether waypoint `key` is free
    pub fn is_waypoint_available(&self, key: ClaimKey) -> Result<bool> {
        self.runtime.block_on(self.inner.is_waypoint_available(key))
    }

    /// Whether marker `key` is free
    pub fn is_marker_available(&self, key: ClaimKey) -> Result<bool> {
        self.runtime.block_on(self.inner.is_marker_available(key))
    }

    /// Claim waypoint `key`
    pub fn claim_waypoint(&self, key: ClaimKey) -> Result<ClaimOutcome> {
        self.runtime.block_on(self.inner.claim_waypoint(key))
    }

    /// Claim marker `key`
    pub fn claim_marker(&self, key: ClaimKey) -> Result<ClaimOutcome> {
        self.runtime.block_on(self.inner.claim_marker(key))
    }

    /// Release waypoint `key`
    pub fn release_waypoint(&self, key: ClaimKey) -> Result<bool> {
        self.runtime.block_on(self.inner.release_waypoint(key))
    }

    /// Release marker `key`
    pub fn release_marker(&self, key: ClaimKey) -> Result<bool> {
        self.runtime.block_on(self.inner.release_marker(key))
    }

    /// Mark marker `key` as handled
    pub fn complete_marker(&self, key: ClaimKey) -> Result<bool> {
        self.runtime.block_on(self.inner.complete_marker(key))
    }

    /// Markers other participants hold or have completed
    pub fn invalid_markers(&self) -> Result<BTreeSet<ClaimKey>> {
        self.runtime.block_on(self.inner.invalid_markers())
    }

    /// Non-free keys of one table
    pub fn snapshot(&self, kind: ClaimKind) -> Result<(Vec<ClaimRecord>, u64)> {
        self.runtime.block_on(self.inner.snapshot(kind))
    }

    /// Relay a hazard association
    pub fn report_danger(&self, marker: ClaimKey, hazard: ClaimKey, offset: [i32; 3]) -> Result<()> {
        self.runtime
            .block_on(self.inner.report_danger(marker, hazard, offset))
    }

    /// Best-effort status line
    pub fn send_status(&self, text: impl Into<String>, battery: Option<u8>) -> Result<()> {
        self.inner.send_status(text, battery)
    }

    /// Send one heartbeat now
    pub fn heartbeat(&self) -> Result<()> {
        self.inner.heartbeat()
    }

    /// Release manual barriers (operator role)
    pub fn manual_release(&self) -> Result<Vec<BarrierId>> {
        self.runtime.block_on(self.inner.manual_release())
    }

    /// Ask vehicles to land (operator role)
    pub fn request_landing(&self, targets: Option<BTreeSet<ParticipantId>>) -> Result<()> {
        self.runtime.block_on(self.inner.request_landing(targets))
    }

    /// Drain buffered events
    pub fn poll_notifications(&self) -> Vec<Event> {
        self.inner.poll_notifications()
    }

    /// Events dropped since the last call
    pub fn take_missed(&self) -> u64 {
        self.inner.take_missed()
    }

    /// True once an operator asked this vehicle to land
    pub fn landing_requested(&self) -> bool {
        self.inner.landing_requested()
    }

    /// Leave gracefully
    pub fn disconnect(self) -> Result<()> {
        let Self { inner, runtime } = self;
        runtime.block_on(inner.disconnect())
    }
}
