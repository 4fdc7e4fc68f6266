//! Notification fan-out.
//!
//! Every subscriber owns a bounded backlog. A subscriber that falls behind
//! loses its oldest events and is told how many it missed, so it can pull a
//! fresh snapshot instead. Publishing never waits on a subscriber.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::trace;

use crate::events::Event;
use crate::lock;

/// Event stamped with its global publication sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Monotonic sequence number, starting at 1
    pub seq: u64,
    /// Published event
    pub event: Event,
}

/// One step of a subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// Next event in order
    Event(Envelope),
    /// Backlog overflowed and this many events were dropped
    Lagged(u64),
}

/// Broadcast hub shared by the claim tables and barriers.
#[derive(Debug)]
pub struct FanOut {
    tx: broadcast::Sender<Envelope>,
    // Held only for the stamp-and-send step so sequence numbers leave in order.
    seq: Mutex<u64>,
}

impl FanOut {
    /// Create a hub where each subscriber may lag by `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            seq: Mutex::new(0),
        }
    }

    /// Deliver `event` to every current subscriber and return its sequence number.
    pub fn publish(&self, event: Event) -> u64 {
        let mut seq = lock(&self.seq);
        *seq += 1;
        let envelope = Envelope { seq: *seq, event };
        trace!(seq = envelope.seq, event = ?envelope.event, "publish");
        // No subscribers is fine: nobody is connected yet.
        let _ = self.tx.send(envelope);
        *seq
    }

    /// Start receiving events published from now on.
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
        }
    }

    /// Sequence number of the last published event.
    pub fn last_seq(&self) -> u64 {
        *lock(&self.seq)
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Receiving side of the fan-out held by one connection.
#[derive(Debug)]
pub struct Subscription {
    rx: broadcast::Receiver<Envelope>,
}

impl Subscription {
    /// Wait for the next delivery. Returns `None` once the hub is gone.
    pub async fn recv(&mut self) -> Option<Delivery> {
        match self.rx.recv().await {
            Ok(envelope) => Some(Delivery::Event(envelope)),
            Err(RecvError::Lagged(missed)) => Some(Delivery::Lagged(missed)),
            Err(RecvError::Closed) => None,
        }
    }

    /// Take the next delivery if one is ready.
    pub fn try_recv(&mut self) -> Option<Delivery> {
        match self.rx.try_recv() {
            Ok(envelope) => Some(Delivery::Event(envelope)),
            Err(TryRecvError::Lagged(missed)) => Some(Delivery::Lagged(missed)),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => None,
        }
    }

    /// Drain everything currently buffered.
    pub fn drain(&mut self) -> Vec<Delivery> {
        let mut out = Vec::new();
        while let Some(delivery) = self.try_recv() {
            out.push(delivery);
        }
        out
    }
}
