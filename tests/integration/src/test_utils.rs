//! Test utilities for end-to-end coordinator tests

use futures_util::{SinkExt, StreamExt};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use rescuenet_coordination::Coordinator;
use rescuenet_core::{logging, CoordinatorConfig, ParticipantId, Role};
use rescuenet_link::{ClientConfig, ServerMessage, SwarmClient, WsServer};

/// Timings short enough for tests but far apart enough to be unambiguous.
pub fn test_config() -> CoordinatorConfig {
    CoordinatorConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        claim_grace_ms: 10_000,
        participant_timeout_ms: 10_000,
        sweep_interval_ms: 50,
        heartbeat_interval_ms: 200,
        ..CoordinatorConfig::default()
    }
}

/// A coordinator with its sweeper and WebSocket front end, on a loopback port.
pub struct TestCoordinator {
    /// Shared coordinator state, for direct inspection
    pub coordinator: Arc<Coordinator>,
    /// `ws://` URL of the server
    pub url: String,
    shutdown: Option<oneshot::Sender<()>>,
    server: JoinHandle<()>,
    sweeper: JoinHandle<()>,
}

impl TestCoordinator {
    /// Start a coordinator with `config`. Must run inside a tokio runtime.
    pub async fn start(config: CoordinatorConfig) -> Self {
        logging::init("warn");

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind loopback");
        let addr = listener.local_addr().expect("local addr");
        let coordinator = Arc::new(Coordinator::new(config).expect("valid config"));
        let sweeper = tokio::spawn(coordinator.clone().run_sweeper());

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let server = Arc::new(WsServer::new(coordinator.clone()));
        let server = tokio::spawn(async move {
            let _ = server
                .run_with_shutdown(listener, async {
                    let _ = shutdown_rx.await;
                })
                .await;
        });

        Self {
            coordinator,
            url: format!("ws://{}", addr),
            shutdown: Some(shutdown),
            server,
            sweeper,
        }
    }

    /// Client configuration pointing at this server
    pub fn client_config(&self, role: Role) -> ClientConfig {
        ClientConfig {
            role,
            request_timeout: Duration::from_secs(2),
            ..ClientConfig::new(self.url.clone())
        }
    }

    /// Connect and register a vehicle
    pub async fn vehicle(&self, id: ParticipantId) -> SwarmClient {
        self.participant(id, Role::Vehicle).await
    }

    /// Connect and register an operator console
    pub async fn operator(&self, id: ParticipantId) -> SwarmClient {
        self.participant(id, Role::Operator).await
    }

    async fn participant(&self, id: ParticipantId, role: Role) -> SwarmClient {
        let client = SwarmClient::connect(self.client_config(role))
            .await
            .expect("connect");
        client
            .register_self(id, BTreeSet::new())
            .await
            .expect("register");
        client
    }

    /// Open a raw WebSocket connection
    pub async fn raw(&self) -> RawConnection {
        let (ws, _) = connect_async(self.url.as_str()).await.expect("connect");
        let mut raw = RawConnection { ws };
        assert!(matches!(raw.next().await, ServerMessage::Welcome { .. }));
        raw
    }
}

impl Drop for TestCoordinator {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.server.abort();
        self.sweeper.abort();
    }
}

/// Frame-level client for protocol tests
pub struct RawConnection {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl RawConnection {
    /// Send one text frame as-is
    pub async fn send_text(&mut self, text: &str) {
        self.ws
            .send(Message::Text(text.to_string()))
            .await
            .expect("send");
    }

    /// Next decoded server message, failing the test after two seconds
    pub async fn next(&mut self) -> ServerMessage {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(2), self.ws.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("connection closed")
                .expect("transport error");
            if let Message::Text(text) = frame {
                return serde_json::from_str(&text).expect("decodable server message");
            }
        }
    }

    /// Skip messages until one matches `pred`
    pub async fn until(&mut self, pred: impl Fn(&ServerMessage) -> bool) -> ServerMessage {
        loop {
            let message = self.next().await;
            if pred(&message) {
                return message;
            }
        }
    }

    /// Close the socket without a close handshake
    pub fn drop_abruptly(self) {
        drop(self.ws);
    }
}

/// Poll `check` every 20ms until it holds or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
