//! The coordination core.
//!
//! `Coordinator` ties the registry, claim tables, barriers and fan-out
//! together. It validates every request against the configuration, keeps
//! participant liveness current and cleans up after participants that leave
//! or go silent. All operations except the barrier wait return immediately.

use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{info, warn};

use rescuenet_core::{
    ClaimKey, ClaimKind, CoordinatorConfig, CoreError, ParticipantId, Result, Role, TargetSet,
};

use crate::barrier::{BarrierId, BarrierRegistry, BarrierSnapshot, JoinTicket};
use crate::claims::{ClaimBoard, ClaimOutcome, ClaimRecord};
use crate::events::{Event, ReleaseCause};
use crate::fanout::{FanOut, Subscription};
use crate::registry::{Participant, Registration, Registry};

/// What one sweep pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Participants that went stale in this pass
    pub stale: Vec<ParticipantId>,
    /// Claims revoked (by staleness or expiry)
    pub revoked: Vec<(ClaimKind, ClaimKey)>,
}

impl SweepReport {
    /// True when the pass changed nothing
    pub fn is_empty(&self) -> bool {
        self.stale.is_empty() && self.revoked.is_empty()
    }
}

/// Single-authority coordination service state.
#[derive(Debug)]
pub struct Coordinator {
    config: CoordinatorConfig,
    registry: Registry,
    claims: ClaimBoard,
    barriers: BarrierRegistry,
    fanout: Arc<FanOut>,
}

impl Coordinator {
    /// Build a coordinator. The configuration is validated first.
    pub fn new(config: CoordinatorConfig) -> Result<Self> {
        config.validate()?;
        let fanout = Arc::new(FanOut::new(config.fanout_capacity));
        Ok(Self {
            registry: Registry::new(),
            claims: ClaimBoard::new(fanout.clone()),
            barriers: BarrierRegistry::new(fanout.clone()),
            fanout,
            config,
        })
    }

    /// Active configuration
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Participant registry (read access for observers and tests)
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Start receiving events
    pub fn subscribe(&self) -> Subscription {
        self.fanout.subscribe()
    }

    /// Sequence number of the last published event
    pub fn last_seq(&self) -> u64 {
        self.fanout.last_seq()
    }

    /// Register a participant or reattach a known id.
    pub fn register(
        &self,
        id: ParticipantId,
        role: Role,
        capabilities: BTreeSet<String>,
    ) -> Result<Registration> {
        self.config.check_participant(id)?;
        let registration = self.registry.register(id, role, capabilities, Instant::now());
        self.fanout.publish(Event::ParticipantJoined {
            participant: id,
            role,
            reconnect: registration.reconnect,
        });
        Ok(registration)
    }

    fn active(&self, id: ParticipantId) -> Result<Role> {
        self.registry.touch(id, Instant::now())
    }

    fn actor(&self, id: ParticipantId, action: &'static str) -> Result<()> {
        let role = self.active(id)?;
        if !role.can_act() {
            return Err(CoreError::Unauthorized { id, action });
        }
        Ok(())
    }

    fn operator(&self, id: ParticipantId, action: &'static str) -> Result<()> {
        let role = self.active(id)?;
        if !role.is_operator() {
            return Err(CoreError::Unauthorized { id, action });
        }
        Ok(())
    }

    /// Record a heartbeat.
    pub fn heartbeat(&self, id: ParticipantId) -> Result<()> {
        self.active(id).map(|_| ())
    }

    /// Attempt to claim `key`.
    pub fn try_claim(&self, kind: ClaimKind, key: ClaimKey, id: ParticipantId) -> Result<ClaimOutcome> {
        self.config.check_key(kind, key)?;
        self.actor(id, "claim")?;
        Ok(self.claims.table(kind).try_claim(key, id, Instant::now()))
    }

    /// Release `key` if `id` holds it.
    pub fn release(&self, kind: ClaimKind, key: ClaimKey, id: ParticipantId) -> Result<bool> {
        self.config.check_key(kind, key)?;
        self.actor(id, "release")?;
        Ok(self.claims.table(kind).release(key, id))
    }

    /// Mark `key` as handled for good.
    pub fn complete(&self, kind: ClaimKind, key: ClaimKey, id: ParticipantId) -> Result<bool> {
        self.config.check_key(kind, key)?;
        self.actor(id, "complete")?;
        Ok(self.claims.table(kind).complete(key, id))
    }

    /// Whether `key` is free right now.
    pub fn is_available(&self, kind: ClaimKind, key: ClaimKey) -> Result<bool> {
        self.config.check_key(kind, key)?;
        Ok(self.claims.table(kind).is_available(key))
    }

    /// Current holder (or completer) of `key`
    pub fn holder(&self, kind: ClaimKind, key: ClaimKey) -> Option<ParticipantId> {
        self.claims.table(kind).holder(key)
    }

    /// Markers taken by anyone other than `exclude_holder`.
    pub fn list_invalid(&self, exclude_holder: Option<ParticipantId>) -> BTreeSet<ClaimKey> {
        self.claims.list_invalid(exclude_holder)
    }

    /// Non-free keys of one table.
    pub fn snapshot(&self, kind: ClaimKind) -> Vec<ClaimRecord> {
        self.claims.table(kind).snapshot(Instant::now())
    }

    /// Join the takeoff barrier for `target`.
    pub fn join_barrier(&self, target: TargetSet, id: ParticipantId) -> Result<JoinTicket> {
        let target = target.normalize(self.config.manual_sentinel_id);
        if let TargetSet::Participants(ids) = &target {
            if ids.is_empty() {
                return Err(CoreError::EmptyTargetSet);
            }
            for &member in ids {
                self.config.check_participant(member)?;
            }
        }
        self.actor(id, "join a barrier")?;
        Ok(self.barriers.join(target, id))
    }

    /// Operator trigger for manual barriers.
    pub fn manual_release(&self, id: ParticipantId) -> Result<Vec<BarrierSnapshot>> {
        self.operator(id, "release takeoff")?;
        let released = self.barriers.manual_release();
        info!(operator = id, count = released.len(), "Manual takeoff release");
        Ok(released)
    }

    /// Record that `id` has received the release of `barrier`. Once every
    /// ready member has, the barrier is retired and its target set can be
    /// used for another takeoff.
    pub fn acknowledge_release(&self, barrier: BarrierId, id: ParticipantId) -> bool {
        self.barriers.acknowledge(barrier, id)
    }

    /// Snapshot of every live barrier
    pub fn barriers(&self) -> Vec<BarrierSnapshot> {
        self.barriers.all()
    }

    /// Ask vehicles to land. `None` addresses every vehicle.
    pub fn request_landing(
        &self,
        id: ParticipantId,
        targets: Option<BTreeSet<ParticipantId>>,
    ) -> Result<()> {
        self.operator(id, "request landing")?;
        info!(operator = id, targets = ?targets, "Landing requested");
        self.fanout.publish(Event::LandingRequested {
            targets,
            requested_by: id,
        });
        Ok(())
    }

    /// Relay a hazard association seen by a vehicle.
    pub fn report_danger(
        &self,
        id: ParticipantId,
        marker: ClaimKey,
        hazard: ClaimKey,
        offset: [i32; 3],
    ) -> Result<()> {
        self.config.check_key(ClaimKind::Marker, marker)?;
        self.config.check_key(ClaimKind::Marker, hazard)?;
        self.actor(id, "report danger")?;
        warn!(participant = id, marker, hazard, offset = ?offset, "Danger reported");
        self.fanout.publish(Event::DangerBroadcast {
            reporter: id,
            marker,
            hazard,
            offset,
        });
        Ok(())
    }

    /// Best-effort status relay.
    pub fn report_status(&self, id: ParticipantId, text: String, battery: Option<u8>) -> Result<()> {
        self.active(id)?;
        self.registry.record_status(id, &text, battery);
        self.fanout.publish(Event::StatusBroadcast {
            participant: id,
            text,
            battery,
        });
        Ok(())
    }

    /// Connection of `id` ended.
    ///
    /// A graceful close releases every claim and barrier membership at once.
    /// An abrupt drop keeps them so the vehicle can reconnect; the staleness
    /// check and the expiry sweep clean up if it never does.
    pub fn disconnect(&self, id: ParticipantId, graceful: bool) -> Vec<(ClaimKind, ClaimKey)> {
        self.registry.mark_disconnected(id);
        if !graceful {
            info!(participant = id, "Connection dropped; claims kept until timeout");
            return Vec::new();
        }
        info!(participant = id, "Participant left");
        self.abandon(id, ReleaseCause::Disconnected)
    }

    fn abandon(&self, id: ParticipantId, cause: ReleaseCause) -> Vec<(ClaimKind, ClaimKey)> {
        let mut released = Vec::new();
        for kind in ClaimKind::ALL {
            for key in self.claims.table(kind).release_all_held_by(id, cause) {
                released.push((kind, key));
            }
        }
        self.barriers.leave(id);
        released
    }

    /// One maintenance pass: staleness first, then claim expiry.
    pub fn sweep(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();

        for id in self
            .registry
            .check_stale(now, self.config.participant_timeout())
        {
            warn!(participant = id, "Participant stale");
            self.fanout.publish(Event::ParticipantStale { participant: id });
            report.revoked.extend(self.abandon(id, ReleaseCause::Stale));
            report.stale.push(id);
        }

        for kind in ClaimKind::ALL {
            for key in self
                .claims
                .table(kind)
                .sweep_expired(now, self.config.claim_grace())
            {
                report.revoked.push((kind, key));
            }
        }

        report
    }

    /// Run [`Coordinator::sweep`] every `sweep_interval` until the task is dropped.
    pub async fn run_sweeper(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.sweep_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            let report = self.sweep(Instant::now());
            if !report.is_empty() {
                info!(
                    stale = report.stale.len(),
                    revoked = report.revoked.len(),
                    "Sweep revoked claims"
                );
            }
        }
    }

    /// Snapshot of one participant
    pub fn participant(&self, id: ParticipantId) -> Option<Participant> {
        self.registry.get(id)
    }
}
