//! WebSocket front end for the coordinator
//!
//! One task per connection. Each task multiplexes the client's requests and
//! the fan-out stream with `tokio::select!`, so a slow or broken client only
//! ever affects its own socket.

use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use rescuenet_coordination::{BarrierId, Coordinator, Delivery, Event, Subscription};
use rescuenet_core::{CoreError, ParticipantId};

use crate::error::Result;
use crate::protocol::{ClientMessage, Request, ServerMessage, PROTOCOL_VERSION};

/// What a connection has told us about itself so far.
#[derive(Debug, Default)]
struct Session {
    participant: Option<ParticipantId>,
    events: Option<Subscription>,
    closing: bool,
}

impl Session {
    fn participant(&self) -> std::result::Result<ParticipantId, CoreError> {
        self.participant.ok_or(CoreError::NotRegistered)
    }
}

/// WebSocket server state
pub struct WsServer {
    coordinator: Arc<Coordinator>,
}

impl WsServer {
    /// Create a server in front of `coordinator`
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }

    /// Coordinator served by this front end
    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Accept connections until the task is dropped
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        self.run_with_shutdown(listener, std::future::pending()).await
    }

    /// Accept connections until `shutdown` resolves
    pub async fn run_with_shutdown<F>(self: Arc<Self>, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let addr = listener.local_addr()?;
        info!("Coordinator listening on ws://{}", addr);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        debug!("New connection from {}", peer_addr);
                        let server = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                warn!("Connection {} ended with error: {}", peer_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                },
                _ = &mut shutdown => {
                    info!("Coordinator listener shutting down");
                    return Ok(());
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream, peer_addr: SocketAddr) -> Result<()> {
        let ws_stream = accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let welcome = ServerMessage::Welcome {
            server: format!("rescuenet-coordinator/{}", env!("CARGO_PKG_VERSION")),
            protocol_version: PROTOCOL_VERSION,
        };
        ws_sender
            .send(Message::Text(serde_json::to_string(&welcome)?))
            .await?;

        let mut session = Session::default();
        // Graceful means the client said goodbye; anything else keeps its claims.
        let mut graceful = false;

        let outcome: Result<()> = async {
            loop {
                tokio::select! {
                    frame = ws_receiver.next() => {
                        let text = match frame {
                            Some(Ok(Message::Text(text))) => text,
                            Some(Ok(Message::Binary(_))) => {
                                let reply = error_reply(None, &CoreError::Malformed("binary frames are not supported".into()));
                                ws_sender.send(Message::Text(serde_json::to_string(&reply)?)).await?;
                                continue;
                            }
                            Some(Ok(Message::Close(_))) => {
                                debug!("Client {} closed the connection", peer_addr);
                                graceful = true;
                                return Ok(());
                            }
                            Some(Ok(_)) => continue,
                            Some(Err(e)) => {
                                warn!("Error receiving from {}: {}", peer_addr, e);
                                return Ok(());
                            }
                            None => return Ok(()),
                        };

                        if let Some(reply) = self.handle_text(&mut session, &text) {
                            ws_sender.send(Message::Text(serde_json::to_string(&reply)?)).await?;
                        }
                        if session.closing {
                            graceful = true;
                            let _ = ws_sender.send(Message::Close(None)).await;
                            return Ok(());
                        }
                    }

                    delivery = next_delivery(&mut session.events) => {
                        let mut observed = None;
                        let message = match delivery {
                            Some(Delivery::Event(envelope)) => {
                                observed = observed_release(&session, &envelope.event);
                                ServerMessage::Event(envelope)
                            }
                            Some(Delivery::Lagged(missed)) => {
                                warn!(participant = ?session.participant, missed, "Subscriber lagged; asking for resync");
                                ServerMessage::Resync { missed }
                            }
                            None => return Ok(()),
                        };
                        ws_sender.send(Message::Text(serde_json::to_string(&message)?)).await?;
                        if let Some((barrier, id)) = observed {
                            self.coordinator.acknowledge_release(barrier, id);
                        }
                    }
                }
            }
        }
        .await;

        if let Some(id) = session.participant {
            let released = self.coordinator.disconnect(id, graceful);
            info!(
                participant = id,
                peer = %peer_addr,
                graceful,
                released = released.len(),
                "Connection closed"
            );
        }

        outcome
    }

    /// Decode one text frame and run it. Returns the direct reply, if any.
    fn handle_text(&self, session: &mut Session, text: &str) -> Option<ServerMessage> {
        let request: Request = match serde_json::from_str(text) {
            Ok(request) => request,
            Err(e) => {
                debug!("Malformed frame: {}", e);
                let request_id = serde_json::from_str::<serde_json::Value>(text)
                    .ok()
                    .and_then(|value| value.get("request_id").and_then(|id| id.as_u64()));
                return Some(error_reply(request_id, &CoreError::Malformed(e.to_string())));
            }
        };

        let request_id = request.request_id;
        match self.dispatch(session, request) {
            Ok(reply) => reply,
            Err(e) => {
                debug!(participant = ?session.participant, code = e.code(), "Request rejected: {}", e);
                Some(error_reply(request_id, &e))
            }
        }
    }

    fn dispatch(
        &self,
        session: &mut Session,
        request: Request,
    ) -> std::result::Result<Option<ServerMessage>, CoreError> {
        let request_id = request.request_id;
        let coordinator = &self.coordinator;

        if let ClientMessage::Register {
            id,
            role,
            capabilities,
        } = request.message
        {
            if let Some(existing) = session.participant {
                if existing != id {
                    return Err(CoreError::Malformed(format!(
                        "connection is already registered as {}",
                        existing
                    )));
                }
            }
            // Subscribe first so nothing published after the reply is missed.
            if session.events.is_none() {
                session.events = Some(coordinator.subscribe());
            }
            let registration = match coordinator.register(id, role, capabilities) {
                Ok(registration) => registration,
                Err(e) => {
                    if session.participant.is_none() {
                        session.events = None;
                    }
                    return Err(e);
                }
            };
            session.participant = Some(id);
            info!(participant = id, role = ?role, reconnect = registration.reconnect, "Participant registered");
            return Ok(Some(ServerMessage::Registered {
                request_id,
                participant: id,
                reconnect: registration.reconnect,
                heartbeat_interval_ms: coordinator.config().heartbeat_interval_ms,
                manual_sentinel_id: coordinator.config().manual_sentinel_id,
            }));
        }

        let id = session.participant()?;
        let reply = match request.message {
            ClientMessage::Register { .. } => None,
            ClientMessage::ClaimRequest { kind, key } => {
                let outcome = coordinator.try_claim(kind, key, id)?;
                Some(ServerMessage::ClaimResult {
                    request_id,
                    kind,
                    key,
                    granted: Some(outcome.granted),
                    available: false,
                    current_holder: outcome.current_holder,
                })
            }
            ClientMessage::Release { kind, key } => {
                let released = coordinator.release(kind, key, id)?;
                Some(ServerMessage::Released {
                    request_id,
                    kind,
                    key,
                    released,
                })
            }
            ClientMessage::Complete { kind, key } => {
                let completed = coordinator.complete(kind, key, id)?;
                Some(ServerMessage::Completed {
                    request_id,
                    kind,
                    key,
                    completed,
                })
            }
            ClientMessage::AvailabilityQuery { kind, key } => {
                coordinator.heartbeat(id)?;
                let available = coordinator.is_available(kind, key)?;
                Some(ServerMessage::ClaimResult {
                    request_id,
                    kind,
                    key,
                    granted: None,
                    available,
                    current_holder: coordinator.holder(kind, key),
                })
            }
            ClientMessage::InvalidQuery {} => {
                coordinator.heartbeat(id)?;
                Some(ServerMessage::Invalid {
                    request_id,
                    markers: coordinator.list_invalid(Some(id)),
                })
            }
            ClientMessage::JoinBarrier { targets } => {
                let ticket = coordinator.join_barrier(targets, id)?;
                let snapshot = ticket.snapshot();
                Some(ServerMessage::BarrierJoined {
                    request_id,
                    barrier: snapshot.id,
                    target: snapshot.target.clone(),
                    phase: snapshot.phase,
                    release_seq: snapshot.release_seq,
                })
            }
            ClientMessage::ManualRelease {} => {
                let released = coordinator.manual_release(id)?;
                Some(ServerMessage::ManualReleased {
                    request_id,
                    barriers: released.into_iter().map(|b| b.id).collect(),
                })
            }
            ClientMessage::RequestLanding { targets } => {
                coordinator.request_landing(id, targets)?;
                Some(ServerMessage::Ack { request_id })
            }
            ClientMessage::DangerReport {
                marker,
                hazard,
                offset,
            } => {
                coordinator.report_danger(id, marker, hazard, offset)?;
                Some(ServerMessage::Ack { request_id })
            }
            ClientMessage::Status { text, battery } => {
                coordinator.report_status(id, text, battery)?;
                request_id.map(|_| ServerMessage::Ack { request_id })
            }
            ClientMessage::Snapshot { kind } => {
                coordinator.heartbeat(id)?;
                // Read the sequence first: every event after it is still on the stream.
                let last_seq = coordinator.last_seq();
                Some(ServerMessage::Snapshot {
                    request_id,
                    kind,
                    claims: coordinator.snapshot(kind),
                    last_seq,
                })
            }
            ClientMessage::Heartbeat {} => {
                coordinator.heartbeat(id)?;
                None
            }
            ClientMessage::Unregister {} => {
                session.closing = true;
                Some(ServerMessage::Ack { request_id })
            }
        };
        Ok(reply)
    }
}

/// The barrier whose release this connection's participant is about to see.
fn observed_release(session: &Session, event: &Event) -> Option<(BarrierId, ParticipantId)> {
    match (session.participant, event) {
        (Some(id), Event::BarrierReleased { barrier, ready, .. }) if ready.contains(&id) => {
            Some((*barrier, id))
        }
        _ => None,
    }
}

async fn next_delivery(events: &mut Option<Subscription>) -> Option<Delivery> {
    match events {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

fn error_reply(request_id: Option<u64>, error: &CoreError) -> ServerMessage {
    ServerMessage::Error {
        request_id,
        code: error.code().to_string(),
        message: error.to_string(),
    }
}
