//! Takeoff barrier
//!
//! Vehicles that must take off together join a barrier keyed by the set of
//! participants they wait for. The barrier moves `Forming -> Armed ->
//! Released`; the readiness update and the release test happen under the
//! barrier's own lock, so concurrent joins cannot miss the release edge.
//!
//! Release is signalled twice: as a [`Event::BarrierReleased`] on the fan-out
//! and through a per-barrier `watch` channel that keeps the released value, so
//! a waiter that arrives after the edge still sees it.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

use rescuenet_core::{ParticipantId, TargetSet};

use crate::events::Event;
use crate::fanout::FanOut;
use crate::{lock, read, write};

/// Barrier instance identifier, unique for the coordinator's lifetime.
pub type BarrierId = u64;

/// Barrier lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BarrierPhase {
    /// Waiting for participants
    Forming,
    /// Release condition met (or, for manual barriers, someone is waiting on
    /// the operator)
    Armed,
    /// Released; immutable from here on until the barrier is retired
    Released,
}

/// Point-in-time view of a barrier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarrierSnapshot {
    /// Barrier instance
    pub id: BarrierId,
    /// Target set
    pub target: TargetSet,
    /// Participants that joined
    pub ready: BTreeSet<ParticipantId>,
    /// Current phase
    pub phase: BarrierPhase,
    /// Global release order, once released
    pub release_seq: Option<u64>,
}

#[derive(Debug)]
struct Barrier {
    id: BarrierId,
    target: TargetSet,
    ready: BTreeSet<ParticipantId>,
    observed: BTreeSet<ParticipantId>,
    phase: BarrierPhase,
    release_seq: Option<u64>,
    retired: bool,
    released_tx: watch::Sender<Option<u64>>,
}

impl Barrier {
    fn snapshot(&self) -> BarrierSnapshot {
        BarrierSnapshot {
            id: self.id,
            target: self.target.clone(),
            ready: self.ready.clone(),
            phase: self.phase,
            release_seq: self.release_seq,
        }
    }
}

/// Outcome of waiting on a barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BarrierWait {
    /// The barrier released
    Released {
        /// Barrier instance
        barrier: BarrierId,
        /// Global release order
        release_seq: u64,
    },
    /// The timeout elapsed first; the caller decides whether to proceed
    TimedOut {
        /// Barrier instance
        barrier: BarrierId,
    },
}

impl BarrierWait {
    /// True for [`BarrierWait::Released`]
    pub fn is_released(&self) -> bool {
        matches!(self, BarrierWait::Released { .. })
    }
}

/// Handle returned by a join, used to wait for the release edge.
#[derive(Debug)]
pub struct JoinTicket {
    snapshot: BarrierSnapshot,
    rx: watch::Receiver<Option<u64>>,
}

impl JoinTicket {
    /// Barrier state right after the join
    pub fn snapshot(&self) -> &BarrierSnapshot {
        &self.snapshot
    }

    /// Barrier instance
    pub fn barrier(&self) -> BarrierId {
        self.snapshot.id
    }

    /// Release sequence if the barrier has released, without waiting.
    pub fn released(&self) -> Option<u64> {
        *self.rx.borrow()
    }

    /// Wait for release, up to `timeout` when given.
    pub async fn wait(mut self, timeout: Option<Duration>) -> BarrierWait {
        let barrier = self.snapshot.id;
        let wait = self.rx.wait_for(|released| released.is_some());

        let released = match timeout {
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(result) => result.ok().and_then(|seq| *seq),
                Err(_) => None,
            },
            None => wait.await.ok().and_then(|seq| *seq),
        };

        match released {
            Some(release_seq) => BarrierWait::Released {
                barrier,
                release_seq,
            },
            None => BarrierWait::TimedOut { barrier },
        }
    }
}

type Slot = Arc<Mutex<Barrier>>;

/// All barriers of the mission, keyed by target set.
///
/// A barrier lives in the registry until every ready member has observed its
/// release (through its own join reply, the forwarded release event, or by
/// leaving). Manual barriers are retired as soon as the operator releases
/// them, so the next manual join waits for the operator again. The last
/// release of each concrete target set is remembered for participants outside
/// that set, who can only ever observe it.
#[derive(Debug)]
pub struct BarrierRegistry {
    barriers: RwLock<HashMap<TargetSet, Slot>>,
    retired: RwLock<HashMap<TargetSet, Slot>>,
    next_id: AtomicU64,
    release_counter: AtomicU64,
    fanout: Arc<FanOut>,
}

impl BarrierRegistry {
    /// Create an empty registry publishing to `fanout`.
    pub fn new(fanout: Arc<FanOut>) -> Self {
        Self {
            barriers: RwLock::new(HashMap::new()),
            retired: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            release_counter: AtomicU64::new(0),
            fanout,
        }
    }

    // Lock order: a barrier's mutex may be held while taking the map locks,
    // never the other way round.
    fn live(&self, target: &TargetSet) -> Option<Slot> {
        read(&self.barriers).get(target).cloned()
    }

    fn barrier_for(&self, target: &TargetSet) -> Slot {
        if let Some(barrier) = self.live(target) {
            return barrier;
        }

        write(&self.barriers)
            .entry(target.clone())
            .or_insert_with(|| {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                let (released_tx, _) = watch::channel(None);
                debug!(barrier = id, target = %target, "Barrier created");
                Arc::new(Mutex::new(Barrier {
                    id,
                    target: target.clone(),
                    ready: BTreeSet::new(),
                    observed: BTreeSet::new(),
                    phase: BarrierPhase::Forming,
                    release_seq: None,
                    retired: false,
                    released_tx,
                }))
            })
            .clone()
    }

    /// Last retired release of a concrete target set, for a joiner outside it.
    fn last_release_for(&self, target: &TargetSet, who: ParticipantId) -> Option<Slot> {
        match target {
            TargetSet::Participants(ids) if !ids.contains(&who) => {
                read(&self.retired).get(target).cloned()
            }
            _ => None,
        }
    }

    fn all_barriers(&self) -> Vec<Slot> {
        read(&self.barriers).values().cloned().collect()
    }

    fn release(&self, barrier: &mut Barrier) {
        let release_seq = self.release_counter.fetch_add(1, Ordering::SeqCst) + 1;
        barrier.phase = BarrierPhase::Released;
        barrier.release_seq = Some(release_seq);
        barrier.released_tx.send_replace(Some(release_seq));
        self.fanout.publish(Event::BarrierReleased {
            barrier: barrier.id,
            target: barrier.target.clone(),
            ready: barrier.ready.clone(),
            release_seq,
        });
        info!(
            barrier = barrier.id,
            target = %barrier.target,
            release_seq,
            "Takeoff barrier released"
        );
    }

    /// Drop a released barrier from the live map so the next join on its
    /// target set starts a fresh one. Outstanding tickets keep working.
    fn retire(&self, slot: &Slot, barrier: &mut Barrier) {
        if barrier.retired {
            return;
        }
        barrier.retired = true;

        {
            let mut live = write(&self.barriers);
            if live
                .get(&barrier.target)
                .is_some_and(|current| Arc::ptr_eq(current, slot))
            {
                live.remove(&barrier.target);
            }
        }
        if !barrier.target.is_manual() {
            write(&self.retired).insert(barrier.target.clone(), slot.clone());
        }
        debug!(barrier = barrier.id, target = %barrier.target, "Barrier retired");
    }

    fn observe(&self, slot: &Slot, barrier: &mut Barrier, who: ParticipantId) {
        barrier.observed.insert(who);
        if barrier.ready.is_subset(&barrier.observed) {
            self.retire(slot, barrier);
        }
    }

    fn ticket(barrier: &Barrier) -> JoinTicket {
        JoinTicket {
            snapshot: barrier.snapshot(),
            rx: barrier.released_tx.subscribe(),
        }
    }

    /// Join the barrier for `target`, creating it on first use.
    ///
    /// Joining a released barrier changes nothing and hands back a ticket that
    /// is already released. A member that has already observed the release
    /// starts the next barrier for the same target set instead.
    pub fn join(&self, target: TargetSet, who: ParticipantId) -> JoinTicket {
        loop {
            let slot = match self.live(&target) {
                Some(slot) => slot,
                None => match self.last_release_for(&target, who) {
                    Some(last) => return Self::ticket(&lock(&last)),
                    None => self.barrier_for(&target),
                },
            };
            let mut barrier = lock(&slot);
            if barrier.retired {
                // Retired between the lookup and the lock.
                continue;
            }

            if barrier.phase == BarrierPhase::Released {
                if barrier.observed.contains(&who) {
                    self.retire(&slot, &mut barrier);
                    continue;
                }
                if barrier.ready.contains(&who) {
                    self.observe(&slot, &mut barrier, who);
                }
                return Self::ticket(&barrier);
            }

            barrier.ready.insert(who);
            debug!(barrier = barrier.id, participant = who, "Joined takeoff barrier");

            if barrier.target.is_manual() {
                barrier.phase = BarrierPhase::Armed;
            } else if barrier.target.is_satisfied_by(&barrier.ready) {
                barrier.phase = BarrierPhase::Armed;
                self.release(&mut barrier);
                // The releasing join's own reply carries the release.
                self.observe(&slot, &mut barrier, who);
            }

            return Self::ticket(&barrier);
        }
    }

    /// Record that `who` has seen the release of barrier `id`.
    ///
    /// Returns false when the barrier is no longer live, has not released, or
    /// `who` was not one of its ready members.
    pub fn acknowledge(&self, id: BarrierId, who: ParticipantId) -> bool {
        for slot in self.all_barriers() {
            let mut barrier = lock(&slot);
            if barrier.id != id {
                continue;
            }
            if barrier.retired
                || barrier.phase != BarrierPhase::Released
                || !barrier.ready.contains(&who)
            {
                return false;
            }
            self.observe(&slot, &mut barrier, who);
            return true;
        }
        false
    }

    /// Release every armed manual barrier (operator trigger).
    ///
    /// Released manual barriers are retired at once.
    pub fn manual_release(&self) -> Vec<BarrierSnapshot> {
        let mut released = Vec::new();

        for slot in self.all_barriers() {
            let mut barrier = lock(&slot);
            if barrier.target.is_manual() && barrier.phase == BarrierPhase::Armed {
                self.release(&mut barrier);
                self.retire(&slot, &mut barrier);
                released.push(barrier.snapshot());
            }
        }

        released
    }

    /// Withdraw `who` from every barrier that has not released yet.
    ///
    /// For released barriers the departure counts as having observed the
    /// release, so it cannot keep them alive.
    pub fn leave(&self, who: ParticipantId) -> Vec<BarrierId> {
        let mut left = Vec::new();

        for slot in self.all_barriers() {
            let mut barrier = lock(&slot);
            if barrier.phase == BarrierPhase::Released {
                if barrier.ready.contains(&who) {
                    self.observe(&slot, &mut barrier, who);
                }
                continue;
            }
            if barrier.ready.remove(&who) {
                if barrier.ready.is_empty() {
                    barrier.phase = BarrierPhase::Forming;
                }
                debug!(barrier = barrier.id, participant = who, "Left takeoff barrier");
                left.push(barrier.id);
            }
        }

        left.sort_unstable();
        left
    }

    /// Snapshot of the live barrier for `target`, if one exists
    pub fn get(&self, target: &TargetSet) -> Option<BarrierSnapshot> {
        self.live(target).map(|slot| lock(&slot).snapshot())
    }

    /// Snapshot of every live barrier, ordered by id
    pub fn all(&self) -> Vec<BarrierSnapshot> {
        let mut all: Vec<BarrierSnapshot> = self
            .all_barriers()
            .iter()
            .map(|slot| lock(slot).snapshot())
            .collect();
        all.sort_by_key(|b| b.id);
        all
    }
}
