//! Configuration management for the coordinator service.
//!
//! Durations are stored as milliseconds so the TOML file stays flat:
//!
//! ```toml
//! listen_addr = "0.0.0.0:9870"
//! claim_grace_ms = 10000
//! participant_timeout_ms = 15000
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[cfg(feature = "toml")]
use std::path::Path;

use crate::error::{CoreError, Result};
use crate::types::{ClaimKey, ClaimKind, ParticipantId};

/// Coordinator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Socket address the WebSocket server binds to
    pub listen_addr: String,
    /// A claim not refreshed for this long is revoked by the sweep
    pub claim_grace_ms: u64,
    /// A participant silent for this long is marked stale and loses its claims
    pub participant_timeout_ms: u64,
    /// Period of the expiry sweep
    pub sweep_interval_ms: u64,
    /// Heartbeat interval advertised to clients on registration
    pub heartbeat_interval_ms: u64,
    /// Per-subscriber event backlog before the oldest events are dropped
    pub fanout_capacity: usize,
    /// Highest participant id accepted
    pub max_participant_id: ParticipantId,
    /// Highest waypoint key accepted
    pub max_waypoint_key: ClaimKey,
    /// Highest marker key accepted
    pub max_marker_key: ClaimKey,
    /// Id that, alone in a takeoff list, means "wait for the operator"
    pub manual_sentinel_id: ParticipantId,
    /// Emit JSON logs instead of human-readable lines
    pub json_logs: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:9870".to_string(),
            claim_grace_ms: 10_000,
            participant_timeout_ms: 15_000,
            sweep_interval_ms: 1_000,
            heartbeat_interval_ms: 2_000,
            fanout_capacity: 1024,
            max_participant_id: 254,
            max_waypoint_key: 9_999,
            max_marker_key: 1_023,
            manual_sentinel_id: 99,
            json_logs: false,
        }
    }
}

impl CoordinatorConfig {
    /// Load configuration from a TOML file. Missing fields take defaults.
    #[cfg(feature = "toml")]
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&content).map_err(|e| CoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the coordinator cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.claim_grace_ms == 0 {
            return Err(CoreError::Config("claim_grace_ms must be > 0".into()));
        }
        if self.sweep_interval_ms == 0 {
            return Err(CoreError::Config("sweep_interval_ms must be > 0".into()));
        }
        if self.participant_timeout_ms <= self.heartbeat_interval_ms {
            return Err(CoreError::Config(format!(
                "participant_timeout_ms ({}) must exceed heartbeat_interval_ms ({})",
                self.participant_timeout_ms, self.heartbeat_interval_ms
            )));
        }
        if self.fanout_capacity == 0 {
            return Err(CoreError::Config("fanout_capacity must be > 0".into()));
        }
        if self.max_participant_id == 0 {
            return Err(CoreError::Config("max_participant_id must be > 0".into()));
        }
        Ok(())
    }

    /// Claim grace period.
    pub fn claim_grace(&self) -> Duration {
        Duration::from_millis(self.claim_grace_ms)
    }

    /// Participant staleness timeout.
    pub fn participant_timeout(&self) -> Duration {
        Duration::from_millis(self.participant_timeout_ms)
    }

    /// Expiry sweep period.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Highest key accepted for `kind`.
    pub fn max_key(&self, kind: ClaimKind) -> ClaimKey {
        match kind {
            ClaimKind::Waypoint => self.max_waypoint_key,
            ClaimKind::Marker => self.max_marker_key,
        }
    }

    /// Check that `id` may be used by a participant.
    pub fn check_participant(&self, id: ParticipantId) -> Result<()> {
        if id == 0 || id > self.max_participant_id {
            return Err(CoreError::InvalidParticipant {
                id,
                max: self.max_participant_id,
            });
        }
        if id == self.manual_sentinel_id {
            return Err(CoreError::ReservedParticipant { id });
        }
        Ok(())
    }

    /// Check that `key` is inside the table range for `kind`.
    pub fn check_key(&self, kind: ClaimKind, key: ClaimKey) -> Result<()> {
        let max = self.max_key(kind);
        if key > max {
            return Err(CoreError::KeyOutOfRange { kind, key, max });
        }
        Ok(())
    }
}
