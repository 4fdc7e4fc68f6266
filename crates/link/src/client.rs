//! Vehicle-side client facade
//!
//! A `SwarmClient` owns one WebSocket connection and two background tasks: a
//! writer fed through a channel and a reader that routes direct replies to
//! their callers by `request_id`. Fan-out events land in a bounded inbox that
//! vehicle code drains with [`SwarmClient::poll_notifications`]. Barrier
//! releases are additionally recorded in a `watch` map so a waiter never
//! misses an edge that arrived before it started waiting.
//!
//! The facade never retries. Reconnect and backoff belong to the vehicle.

use futures_util::{SinkExt, Stream, StreamExt};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite, tungstenite::Message};
use tracing::{debug, info, warn};

use rescuenet_coordination::{BarrierId, BarrierWait, ClaimOutcome, ClaimRecord, Event};
use rescuenet_core::{ClaimKey, ClaimKind, ParticipantId, Role, TargetSet};

use crate::error::{LinkError, Result};
use crate::protocol::{ClientMessage, Request, ServerMessage};

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Coordinator URL, e.g. `ws://10.0.0.1:9870`
    pub url: String,
    /// Role declared on registration
    pub role: Role,
    /// Heartbeat period; `None` uses the interval the coordinator advertises
    pub heartbeat_interval: Option<Duration>,
    /// How long to wait for a direct reply
    pub request_timeout: Duration,
    /// Events buffered between polls before new ones are dropped
    pub inbox_capacity: usize,
    /// Detection cycles without a hazard before a danger association is
    /// considered gone. Read by vehicle code; the client does not use it.
    pub danger_grace_cycles: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9870".to_string(),
            role: Role::Vehicle,
            heartbeat_interval: None,
            request_timeout: Duration::from_secs(5),
            inbox_capacity: 256,
            danger_grace_cycles: 20,
        }
    }
}

impl ClientConfig {
    /// Default configuration pointing at `url`
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

/// State shared with the background tasks.
#[derive(Debug)]
struct Shared {
    pending: Mutex<HashMap<u64, oneshot::Sender<ServerMessage>>>,
    welcome: Mutex<Option<oneshot::Sender<String>>>,
    released: watch::Sender<BTreeMap<BarrierId, u64>>,
    participant: AtomicU32,
    missed: AtomicU64,
    landing: AtomicBool,
    closed: watch::Sender<bool>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn participant(&self) -> Option<ParticipantId> {
        match self.participant.load(Ordering::SeqCst) {
            0 => None,
            id => Some(id),
        }
    }

    fn route(&self, message: ServerMessage, inbox: &mpsc::Sender<Event>) {
        if let Some(request_id) = message.request_id() {
            match lock(&self.pending).remove(&request_id) {
                // The caller may have timed out already.
                Some(reply) => {
                    let _ = reply.send(message);
                }
                None => debug!(request_id, "Reply without a waiting request"),
            }
            return;
        }

        match message {
            ServerMessage::Welcome { server, .. } => {
                if let Some(tx) = lock(&self.welcome).take() {
                    let _ = tx.send(server);
                }
            }
            ServerMessage::Event(envelope) => {
                let event = envelope.event;
                if let Event::BarrierReleased {
                    barrier,
                    release_seq,
                    ..
                } = event
                {
                    self.released.send_modify(|released| {
                        released.insert(barrier, release_seq);
                    });
                }
                if let Some(id) = self.participant() {
                    if event.requests_landing_of(id) {
                        info!(participant = id, "Landing requested by operator");
                        self.landing.store(true, Ordering::SeqCst);
                    }
                }
                if let Err(mpsc::error::TrySendError::Full(_)) = inbox.try_send(event) {
                    self.missed.fetch_add(1, Ordering::SeqCst);
                }
            }
            ServerMessage::Resync { missed } => {
                warn!(missed, "Coordinator dropped events for this client");
                self.missed.fetch_add(missed, Ordering::SeqCst);
            }
            ServerMessage::Error { code, message, .. } => {
                warn!(code = %code, "Coordinator error: {}", message);
            }
            other => debug!(message = ?other, "Unsolicited message"),
        }
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn close(&self) {
        // Wakes barrier waiters, which hold no pending request.
        self.closed.send_replace(true);
        // Dropping the senders wakes every waiting request with `Disconnected`.
        lock(&self.pending).clear();
    }

    /// Wait until `barrier` is seen released or the connection drops.
    async fn released(&self, barrier: BarrierId) -> Result<u64> {
        let mut released = self.released.subscribe();
        let mut closed = self.closed.subscribe();
        tokio::select! {
            biased;
            seen = released.wait_for(|map| map.contains_key(&barrier)) => seen
                .ok()
                .and_then(|map| map.get(&barrier).copied())
                .ok_or(LinkError::Disconnected),
            _ = closed.wait_for(|closed| *closed) => Err(LinkError::Disconnected),
        }
    }
}

async fn read_loop<S>(mut stream: S, shared: Arc<Shared>, inbox: mpsc::Sender<Event>)
where
    S: Stream<Item = std::result::Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                Ok(message) => shared.route(message, &inbox),
                Err(e) => warn!("Undecodable frame from coordinator: {}", e),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("Connection to coordinator failed: {}", e);
                break;
            }
        }
    }
    debug!("Coordinator connection closed");
    shared.close();
}

/// Async client for one vehicle (or operator console).
#[derive(Debug)]
pub struct SwarmClient {
    config: ClientConfig,
    server: String,
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<Message>,
    inbox: Mutex<mpsc::Receiver<Event>>,
    next_request: AtomicU64,
    tasks: Vec<JoinHandle<()>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl SwarmClient {
    /// Open the connection and wait for the coordinator's greeting.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let (ws_stream, _) = connect_async(config.url.as_str()).await?;
        let (mut ws_sender, ws_receiver) = ws_stream.split();

        let (welcome_tx, welcome_rx) = oneshot::channel();
        let (released, _) = watch::channel(BTreeMap::new());
        let (closed, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            welcome: Mutex::new(Some(welcome_tx)),
            released,
            participant: AtomicU32::new(0),
            missed: AtomicU64::new(0),
            landing: AtomicBool::new(false),
            closed,
        });

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = ws_sender.send(message).await {
                    warn!("Error sending to coordinator: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let (inbox_tx, inbox) = mpsc::channel(config.inbox_capacity.max(1));
        let reader = tokio::spawn(read_loop(ws_receiver, shared.clone(), inbox_tx));

        let server = match tokio::time::timeout(config.request_timeout, welcome_rx).await {
            Ok(Ok(server)) => server,
            Ok(Err(_)) => {
                writer.abort();
                reader.abort();
                return Err(LinkError::Disconnected);
            }
            Err(_) => {
                writer.abort();
                reader.abort();
                return Err(LinkError::Timeout);
            }
        };
        info!(url = %config.url, server = %server, "Connected to coordinator");

        Ok(Self {
            config,
            server,
            shared,
            outbound,
            inbox: Mutex::new(inbox),
            next_request: AtomicU64::new(1),
            tasks: vec![writer, reader],
            heartbeat: Mutex::new(None),
        })
    }

    /// Client configuration
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Server identification from the greeting
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Registered participant id
    pub fn participant(&self) -> Option<ParticipantId> {
        self.shared.participant()
    }

    /// False once the connection has dropped
    pub fn is_connected(&self) -> bool {
        !self.shared.is_closed()
    }

    fn send(&self, request: Request) -> Result<()> {
        let json = serde_json::to_string(&request)?;
        self.outbound
            .send(Message::Text(json))
            .map_err(|_| LinkError::Disconnected)
    }

    async fn request(&self, message: ClientMessage) -> Result<ServerMessage> {
        let request_id = self.next_request.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        lock(&self.shared.pending).insert(request_id, tx);

        if self.shared.is_closed() {
            lock(&self.shared.pending).remove(&request_id);
            return Err(LinkError::Disconnected);
        }
        if let Err(e) = self.send(Request::new(request_id, message)) {
            lock(&self.shared.pending).remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(ServerMessage::Error { code, message, .. })) => {
                Err(LinkError::Rejected { code, message })
            }
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(LinkError::Disconnected),
            Err(_) => {
                lock(&self.shared.pending).remove(&request_id);
                Err(LinkError::Timeout)
            }
        }
    }

    /// Register as `id`. Returns true when the coordinator already knew the
    /// id (a reconnect). Starts the heartbeat task.
    pub async fn register_self(
        &self,
        id: ParticipantId,
        capabilities: BTreeSet<String>,
    ) -> Result<bool> {
        let reply = self
            .request(ClientMessage::Register {
                id,
                role: self.config.role,
                capabilities,
            })
            .await?;
        let (reconnect, advertised) = match reply {
            ServerMessage::Registered {
                reconnect,
                heartbeat_interval_ms,
                ..
            } => (reconnect, Duration::from_millis(heartbeat_interval_ms)),
            other => return Err(unexpected(other)),
        };
        self.shared.participant.store(id, Ordering::SeqCst);

        let period = self.config.heartbeat_interval.unwrap_or(advertised);
        self.start_heartbeat(period)?;
        info!(participant = id, reconnect, "Registered with coordinator");
        Ok(reconnect)
    }

    fn start_heartbeat(&self, period: Duration) -> Result<()> {
        let frame = Message::Text(serde_json::to_string(&Request::oneway(
            ClientMessage::Heartbeat {},
        ))?);
        let outbound = self.outbound.clone();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if outbound.send(frame.clone()).is_err() {
                    break;
                }
            }
        });
        if let Some(previous) = lock(&self.heartbeat).replace(task) {
            previous.abort();
        }
        Ok(())
    }

    /// Join the takeoff barrier for `targets` and wait for release.
    ///
    /// With a timeout, a `TimedOut` answer is re-checked once with a fresh
    /// join before it is returned, in case the release notification itself
    /// was dropped. Fails with [`LinkError::Disconnected`] if the connection
    /// drops while waiting, timeout or not.
    pub async fn join_takeoff_barrier(
        &self,
        targets: TargetSet,
        timeout: Option<Duration>,
    ) -> Result<BarrierWait> {
        let (barrier, release_seq) = self.join(targets.clone()).await?;
        if let Some(release_seq) = release_seq {
            return Ok(BarrierWait::Released {
                barrier,
                release_seq,
            });
        }

        let wait = self.shared.released(barrier);
        let seen = match timeout {
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(result) => Some(result?),
                Err(_) => None,
            },
            None => Some(wait.await?),
        };
        if let Some(release_seq) = seen {
            return Ok(BarrierWait::Released {
                barrier,
                release_seq,
            });
        }

        let rejoined = self.join(targets).await?;
        // The release may have landed while the rejoin was in flight.
        let late = self.shared.released.borrow().get(&barrier).copied();
        match (late, rejoined) {
            (Some(release_seq), _) => Ok(BarrierWait::Released {
                barrier,
                release_seq,
            }),
            (None, (barrier, Some(release_seq))) => Ok(BarrierWait::Released {
                barrier,
                release_seq,
            }),
            (None, (barrier, None)) => {
                warn!(barrier, "Takeoff barrier wait timed out");
                Ok(BarrierWait::TimedOut { barrier })
            }
        }
    }

    async fn join(&self, targets: TargetSet) -> Result<(BarrierId, Option<u64>)> {
        match self.request(ClientMessage::JoinBarrier { targets }).await? {
            ServerMessage::BarrierJoined {
                barrier,
                release_seq,
                ..
            } => Ok((barrier, release_seq)),
            other => Err(unexpected(other)),
        }
    }

    async fn availability(&self, kind: ClaimKind, key: ClaimKey) -> Result<bool> {
        match self
            .request(ClientMessage::AvailabilityQuery { kind, key })
            .await?
        {
            ServerMessage::ClaimResult { available, .. } => Ok(available),
            other => Err(unexpected(other)),
        }
    }

    async fn claim(&self, kind: ClaimKind, key: ClaimKey) -> Result<ClaimOutcome> {
        match self.request(ClientMessage::ClaimRequest { kind, key }).await? {
            ServerMessage::ClaimResult {
                granted,
                current_holder,
                ..
            } => Ok(ClaimOutcome {
                granted: granted.unwrap_or(false),
                current_holder,
            }),
            other => Err(unexpected(other)),
        }
    }

    async fn release(&self, kind: ClaimKind, key: ClaimKey) -> Result<bool> {
        match self.request(ClientMessage::Release { kind, key }).await? {
            ServerMessage::Released { released, .. } => Ok(released),
            other => Err(unexpected(other)),
        }
    }

    async fn ack(&self, message: ClientMessage) -> Result<()> {
        match self.request(message).await? {
            ServerMessage::Ack { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Whether waypoint `key` is free
    pub async fn is_waypoint_available(&self, key: ClaimKey) -> Result<bool> {
        self.availability(ClaimKind::Waypoint, key).await
    }

    /// Whether marker `key` is free
    pub async fn is_marker_available(&self, key: ClaimKey) -> Result<bool> {
        self.availability(ClaimKind::Marker, key).await
    }

    /// Claim waypoint `key`. Contention is a normal `granted: false` outcome.
    pub async fn claim_waypoint(&self, key: ClaimKey) -> Result<ClaimOutcome> {
        self.claim(ClaimKind::Waypoint, key).await
    }

    /// Claim marker `key`
    pub async fn claim_marker(&self, key: ClaimKey) -> Result<ClaimOutcome> {
        self.claim(ClaimKind::Marker, key).await
    }

    /// Release waypoint `key`; false when this client did not hold it
    pub async fn release_waypoint(&self, key: ClaimKey) -> Result<bool> {
        self.release(ClaimKind::Waypoint, key).await
    }

    /// Release marker `key`
    pub async fn release_marker(&self, key: ClaimKey) -> Result<bool> {
        self.release(ClaimKind::Marker, key).await
    }

    /// Mark marker `key` as handled (landed on) for the rest of the mission
    pub async fn complete_marker(&self, key: ClaimKey) -> Result<bool> {
        match self
            .request(ClientMessage::Complete {
                kind: ClaimKind::Marker,
                key,
            })
            .await?
        {
            ServerMessage::Completed { completed, .. } => Ok(completed),
            other => Err(unexpected(other)),
        }
    }

    /// Markers other participants hold or have completed
    pub async fn invalid_markers(&self) -> Result<BTreeSet<ClaimKey>> {
        match self.request(ClientMessage::InvalidQuery {}).await? {
            ServerMessage::Invalid { markers, .. } => Ok(markers),
            other => Err(unexpected(other)),
        }
    }

    /// Non-free keys of one table and the event sequence they reflect
    pub async fn snapshot(&self, kind: ClaimKind) -> Result<(Vec<ClaimRecord>, u64)> {
        match self.request(ClientMessage::Snapshot { kind }).await? {
            ServerMessage::Snapshot {
                claims, last_seq, ..
            } => Ok((claims, last_seq)),
            other => Err(unexpected(other)),
        }
    }

    /// Relay a hazard seen near the locked-on marker
    pub async fn report_danger(
        &self,
        marker: ClaimKey,
        hazard: ClaimKey,
        offset: [i32; 3],
    ) -> Result<()> {
        self.ack(ClientMessage::DangerReport {
            marker,
            hazard,
            offset,
        })
        .await
    }

    /// Best-effort status line; no reply is awaited
    pub fn send_status(&self, text: impl Into<String>, battery: Option<u8>) -> Result<()> {
        self.send(Request::oneway(ClientMessage::Status {
            text: text.into(),
            battery,
        }))
    }

    /// Send one heartbeat now
    pub fn heartbeat(&self) -> Result<()> {
        self.send(Request::oneway(ClientMessage::Heartbeat {}))
    }

    /// Release every manual barrier (operator role)
    pub async fn manual_release(&self) -> Result<Vec<BarrierId>> {
        match self.request(ClientMessage::ManualRelease {}).await? {
            ServerMessage::ManualReleased { barriers, .. } => Ok(barriers),
            other => Err(unexpected(other)),
        }
    }

    /// Ask vehicles to land; `None` addresses all (operator role)
    pub async fn request_landing(&self, targets: Option<BTreeSet<ParticipantId>>) -> Result<()> {
        self.ack(ClientMessage::RequestLanding { targets }).await
    }

    /// Drain buffered events without waiting
    pub fn poll_notifications(&self) -> Vec<Event> {
        let mut inbox = lock(&self.inbox);
        let mut events = Vec::new();
        while let Ok(event) = inbox.try_recv() {
            events.push(event);
        }
        events
    }

    /// Number of events dropped since the last call, here or on the
    /// coordinator. Non-zero means local state should be rebuilt from
    /// [`SwarmClient::snapshot`].
    pub fn take_missed(&self) -> u64 {
        self.shared.missed.swap(0, Ordering::SeqCst)
    }

    /// True once an operator asked this vehicle to land
    pub fn landing_requested(&self) -> bool {
        self.shared.landing.load(Ordering::SeqCst)
    }

    /// Leave gracefully: the coordinator releases every claim of this client.
    pub async fn disconnect(self) -> Result<()> {
        let result = if self.participant().is_some() {
            self.ack(ClientMessage::Unregister {}).await
        } else {
            Ok(())
        };
        let _ = self.outbound.send(Message::Close(None));
        if let Some(task) = lock(&self.heartbeat).take() {
            task.abort();
        }
        info!(participant = ?self.participant(), "Disconnected from coordinator");
        result
    }
}

impl Drop for SwarmClient {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.heartbeat).take() {
            task.abort();
        }
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn unexpected(message: ServerMessage) -> LinkError {
    LinkError::UnexpectedReply(format!("{:?}", message))
}
