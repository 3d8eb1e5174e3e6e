//! Transport Session - the single authenticated STOMP-over-WebSocket connection.
//!
//! One background task per session owns the socket. It performs the
//! `CONNECT`/`SUBSCRIBE` handshake, forwards queued publishes, decodes inbound
//! `MESSAGE` frames into [`PushEvent`]s for the [`ListenerRegistry`] and, when
//! the link drops, retries on a fixed delay until `disconnect()` is called,
//! the last [`Transport`] handle is dropped, or the credential is gone or
//! rejected.

use chrono::{DateTime, Utc};
use futures::future::{self, BoxFuture};
use futures::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use url::Url;

use crate::config::{ClientConfig, TransportConfig};
use crate::credentials::Credentials;
use crate::error::{Error, Result};
use crate::event::PushEvent;
use crate::listeners::{ListenerRegistry, Subscription};
use crate::models::{EmpId, ReadReceiptPayload, RideId, SendPayload};
use crate::stomp::{Command, Frame};

// ============================================================================
// Connector
// ============================================================================

pub type FrameSink = Pin<Box<dyn Sink<String, Error = Error> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// An open text-frame duplex, before any STOMP handshake.
pub struct Link {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Opens the underlying connection for a session attempt.
pub trait Connector: Send + Sync + 'static {
    fn open(&self, url: Url) -> BoxFuture<'static, Result<Link>>;
}

/// Production connector over tokio-tungstenite.
pub struct WsConnector;

impl Connector for WsConnector {
    fn open(&self, url: Url) -> BoxFuture<'static, Result<Link>> {
        Box::pin(async move {
            let (ws_stream, _) = connect_async(url.as_str()).await?;
            let (write, read) = ws_stream.split();

            let sink = write.with(|text: String| future::ready(Ok::<_, Error>(WsMessage::Text(text))));
            let stream = read.filter_map(|msg| {
                future::ready(match msg {
                    Ok(WsMessage::Text(text)) => Some(Ok(text)),
                    Ok(WsMessage::Binary(bytes)) => String::from_utf8(bytes).ok().map(Ok),
                    Ok(WsMessage::Close(_)) => {
                        Some(Err(Error::WebSocket("closed by server".to_string())))
                    }
                    Ok(_) => None,
                    Err(e) => Some(Err(Error::from(e))),
                })
            });

            Ok(Link {
                sink: Box::pin(sink),
                stream: Box::pin(stream),
            })
        })
    }
}

// ============================================================================
// Session state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

struct SessionState {
    state: ConnectionState,
    /// Bumped on every connect/disconnect; a task only writes while its epoch is current.
    epoch: u64,
    retries: u32,
    attempts: u64,
    outbound: Option<mpsc::UnboundedSender<String>>,
    pending: VecDeque<String>,
    task: Option<JoinHandle<()>>,
}

struct Shared {
    url: Url,
    host: String,
    config: TransportConfig,
    credentials: Credentials,
    connector: Arc<dyn Connector>,
    listeners: ListenerRegistry,
    session: Mutex<SessionState>,
}

impl Shared {
    fn connect(self: &Arc<Self>) {
        let mut session = self.session.lock();
        if session.state != ConnectionState::Disconnected {
            tracing::debug!("connect() ignored, session is {:?}", session.state);
            return;
        }
        if self.credentials.token().is_none() {
            tracing::warn!("No credential available, chat transport not connecting");
            return;
        }

        session.state = ConnectionState::Connecting;
        session.epoch += 1;
        let epoch = session.epoch;
        session.task = Some(tokio::spawn(run_session(Arc::downgrade(self), epoch)));
    }

    /// Run `f` against the session state if `epoch` is still current.
    fn with_current(&self, epoch: u64, f: impl FnOnce(&mut SessionState)) -> bool {
        let mut session = self.session.lock();
        if session.epoch != epoch {
            return false;
        }
        f(&mut session);
        true
    }

    /// Open the link and complete the handshake. Frames that arrived after
    /// `CONNECTED` in the same read are handed back for dispatch.
    async fn establish(&self, token: &str) -> Result<(Link, Vec<Frame>)> {
        let mut link = self.connector.open(self.url.clone()).await?;
        link.sink.send(Frame::connect(&self.host, token).encode()).await?;

        let stream = &mut link.stream;
        let handshake = async {
            while let Some(text) = stream.next().await {
                let mut frames = Frame::decode_all(&text?)?.into_iter();
                while let Some(frame) = frames.next() {
                    match frame.command {
                        Command::Connected => return Ok(frames.collect::<Vec<_>>()),
                        Command::Error => {
                            return Err(Error::AuthRejected(
                                frame.get("message").unwrap_or("ERROR frame").to_string(),
                            ))
                        }
                        other => tracing::debug!("Ignoring {} before CONNECTED", other.as_str()),
                    }
                }
            }
            Err::<Vec<Frame>, Error>(Error::WebSocket("closed during handshake".to_string()))
        };
        let backlog = tokio::time::timeout(self.config.handshake_timeout(), handshake)
            .await
            .map_err(|_| Error::HandshakeTimeout)??;

        let subscription_id = format!("sub-{}", uuid::Uuid::new_v4());
        link.sink
            .send(Frame::subscribe(&subscription_id, &self.config.inbound_destination).encode())
            .await?;

        Ok((link, backlog))
    }

    /// Returns `false` when the server asked to terminate the session.
    fn handle_inbound(&self, text: &str) -> bool {
        match Frame::decode_all(text) {
            Ok(frames) => self.dispatch(frames),
            Err(e) => {
                tracing::debug!("Dropping undecodable frame: {}", e);
                true
            }
        }
    }

    fn dispatch(&self, frames: Vec<Frame>) -> bool {
        for frame in frames {
            match frame.command {
                Command::Message => {
                    if let Some(event) = PushEvent::decode(&frame.body) {
                        self.listeners.dispatch(&event);
                    }
                }
                Command::Error => {
                    tracing::warn!(
                        "Chat server sent ERROR: {}",
                        frame.get("message").unwrap_or_default()
                    );
                    return false;
                }
                other => tracing::debug!("Ignoring {} frame", other.as_str()),
            }
        }
        true
    }

    fn publish<T: Serialize>(self: &Arc<Self>, destination: &str, payload: &T) {
        if self.session.lock().state != ConnectionState::Connected {
            self.connect();
        }

        let body = match serde_json::to_string(payload) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!("Failed to encode publish for {}: {}", destination, e);
                return;
            }
        };
        let frame = Frame::send_json(destination, body).encode();

        let mut session = self.session.lock();
        let frame = match &session.outbound {
            Some(tx) => match tx.send(frame) {
                Ok(()) => return,
                Err(mpsc::error::SendError(frame)) => frame,
            },
            None => frame,
        };
        if session.pending.len() >= self.config.max_pending {
            session.pending.pop_front();
            tracing::warn!("Publish queue full, dropped oldest queued publish");
        }
        session.pending.push_back(frame);
    }

    fn send_message(self: &Arc<Self>, ride_id: RideId, to: EmpId, content: &str) {
        let payload = SendPayload {
            ride_id,
            to_emp_id: to,
            content,
        };
        self.publish(&self.config.send_destination, &payload);
    }

    fn send_read_receipt(self: &Arc<Self>, ride_id: RideId, other: EmpId, up_to: DateTime<Utc>) {
        let payload = ReadReceiptPayload {
            ride_id,
            other_emp_id: other,
            up_to,
        };
        self.publish(&self.config.read_destination, &payload);
    }
}

/// Session task. Holds the transport only weakly, so dropping the last
/// [`Transport`] ends the session as well.
async fn run_session(weak: Weak<Shared>, epoch: u64) {
    loop {
        let Some(shared) = weak.upgrade() else {
            tracing::debug!("Transport dropped, chat session ends");
            return;
        };
        let Some(token) = shared.credentials.token() else {
            tracing::warn!("Credential no longer available, chat transport stops retrying");
            break;
        };
        if !shared.with_current(epoch, |session| session.attempts += 1) {
            return;
        }

        let established = shared.establish(&token).await;
        drop(shared);
        match established {
            Ok((link, backlog)) => {
                pump(&weak, epoch, link, backlog).await;
                tracing::info!("Chat transport link closed");
            }
            Err(Error::AuthRejected(reason)) => {
                tracing::warn!("Chat server rejected credential: {}", reason);
                break;
            }
            Err(e) => tracing::warn!("Chat transport connect failed: {}", e),
        }

        let live = weak.upgrade().map_or(false, |shared| {
            shared.with_current(epoch, |session| {
                session.outbound = None;
                session.state = ConnectionState::Connecting;
                session.retries += 1;
            })
        });
        if !live {
            return;
        }
        tokio::time::sleep(reconnect_delay(&weak)).await;
    }

    if let Some(shared) = weak.upgrade() {
        shared.with_current(epoch, |session| {
            session.state = ConnectionState::Disconnected;
            session.outbound = None;
            session.task = None;
        });
    }
}

fn reconnect_delay(weak: &Weak<Shared>) -> std::time::Duration {
    weak.upgrade()
        .map(|shared| shared.config.reconnect_delay())
        .unwrap_or_default()
}

async fn pump(weak: &Weak<Shared>, epoch: u64, link: Link, backlog: Vec<Frame>) {
    let Link {
        mut sink,
        mut stream,
    } = link;
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    {
        let Some(shared) = weak.upgrade() else {
            return;
        };
        let live = shared.with_current(epoch, |session| {
            // Queued publishes go first so ordering is preserved.
            for frame in session.pending.drain(..) {
                let _ = tx.send(frame);
            }
            session.outbound = Some(tx);
            session.state = ConnectionState::Connected;
            session.retries = 0;
        });
        if !live {
            return;
        }
        tracing::info!("Chat transport connected");

        if !shared.dispatch(backlog) {
            return;
        }
    }

    loop {
        tokio::select! {
            out = rx.recv() => match out {
                Some(out) => {
                    if let Err(e) = sink.send(out).await {
                        tracing::debug!("Chat transport write failed: {}", e);
                        break;
                    }
                }
                // Sender dropped: disconnected, or the transport is gone.
                None => break,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(text)) => {
                    let Some(shared) = weak.upgrade() else {
                        break;
                    };
                    if !shared.handle_inbound(&text) {
                        break;
                    }
                }
                Some(Err(e)) => {
                    tracing::debug!("Chat transport read failed: {}", e);
                    break;
                }
                None => break,
            },
        }
    }
}

// ============================================================================
// Public handles
// ============================================================================

/// Owner of the single persistent connection. Cheap to clone.
#[derive(Clone)]
pub struct Transport {
    shared: Arc<Shared>,
}

impl Transport {
    pub fn new(config: &ClientConfig, credentials: Credentials) -> Result<Self> {
        Self::with_connector(config, credentials, Arc::new(WsConnector))
    }

    pub fn with_connector(
        config: &ClientConfig,
        credentials: Credentials,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        let url = config.ws_url()?;
        let host = url.host_str().unwrap_or(&config.server.host).to_string();

        Ok(Self {
            shared: Arc::new(Shared {
                url,
                host,
                config: config.transport.clone(),
                credentials,
                connector,
                listeners: ListenerRegistry::new(),
                session: Mutex::new(SessionState {
                    state: ConnectionState::Disconnected,
                    epoch: 0,
                    retries: 0,
                    attempts: 0,
                    outbound: None,
                    pending: VecDeque::new(),
                    task: None,
                }),
            }),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.session.lock().state
    }

    /// Reconnect attempts since the last successful handshake.
    pub fn retries(&self) -> u32 {
        self.shared.session.lock().retries
    }

    /// Underlying connection attempts over the transport's lifetime.
    pub fn attempts(&self) -> u64 {
        self.shared.session.lock().attempts
    }

    pub fn pending(&self) -> usize {
        self.shared.session.lock().pending.len()
    }

    /// Idempotent: a no-op while connecting or connected, and without a credential.
    /// Must be called from within a Tokio runtime.
    pub fn connect(&self) {
        self.shared.connect();
    }

    /// Tear down the connection and every registered listener. Safe to repeat.
    pub fn disconnect(&self) {
        let task = {
            let mut session = self.shared.session.lock();
            session.epoch += 1;
            session.state = ConnectionState::Disconnected;
            session.outbound = None;
            session.pending.clear();
            session.retries = 0;
            session.task.take()
        };
        if let Some(task) = task {
            task.abort();
            tracing::info!("Chat transport disconnected");
        }
        self.shared.listeners.clear();
    }

    pub fn add_listener<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&PushEvent) + Send + Sync + 'static,
    {
        self.shared.listeners.add(callback)
    }

    pub fn listener_count(&self) -> usize {
        self.shared.listeners.len()
    }

    /// Fire-and-forget; connects first when needed.
    pub fn send_message(&self, ride_id: RideId, to: EmpId, content: &str) {
        self.shared.send_message(ride_id, to, content);
    }

    pub fn send_read_receipt(&self, ride_id: RideId, other: EmpId, up_to: DateTime<Utc>) {
        self.shared.send_read_receipt(ride_id, other, up_to);
    }

    /// Weak publishing handle for listeners, which must not keep the session alive.
    pub fn publisher(&self) -> Publisher {
        Publisher {
            shared: Arc::downgrade(&self.shared),
        }
    }
}

#[derive(Clone)]
pub struct Publisher {
    shared: Weak<Shared>,
}

impl Publisher {
    pub fn send_message(&self, ride_id: RideId, to: EmpId, content: &str) {
        match self.shared.upgrade() {
            Some(shared) => shared.send_message(ride_id, to, content),
            None => tracing::debug!("Transport gone, message to {} dropped", to),
        }
    }

    pub fn send_read_receipt(&self, ride_id: RideId, other: EmpId, up_to: DateTime<Utc>) {
        match self.shared.upgrade() {
            Some(shared) => shared.send_read_receipt(ride_id, other, up_to),
            None => tracing::debug!("Transport gone, read receipt for ride {} dropped", ride_id),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;

    type Servers = tokio::sync::mpsc::UnboundedReceiver<FakeServer>;

    fn transport(token: Option<&str>) -> (Transport, Arc<FakeConnector>, Servers) {
        let (connector, servers) = FakeConnector::new();
        let credentials = match token {
            Some(token) => Credentials::with_token(token),
            None => Credentials::new(),
        };
        let transport =
            Transport::with_connector(&fast_config(), credentials, connector.clone()).unwrap();
        (transport, connector, servers)
    }

    #[tokio::test]
    async fn test_connect_is_single_flight() {
        let (transport, connector, mut servers) = transport(Some("tok"));

        transport.connect();
        transport.connect();
        assert_eq!(transport.state(), ConnectionState::Connecting);

        let mut server = servers.recv().await.unwrap();
        let connect = server.accept().await;
        assert_eq!(connect.get("Authorization"), Some("Bearer tok"));
        wait_for(&transport, ConnectionState::Connected).await;

        transport.connect();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(connector.opened(), 1);
        assert_eq!(transport.attempts(), 1);
    }

    #[tokio::test]
    async fn test_connect_without_credential_is_silent_noop() {
        let (transport, connector, _servers) = transport(None);
        transport.connect();
        assert_eq!(transport.state(), ConnectionState::Disconnected);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(connector.opened(), 0);
    }

    #[tokio::test]
    async fn test_events_fan_out_and_malformed_payloads_are_dropped() {
        let (transport, _connector, mut servers) = transport(Some("tok"));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let tx2 = tx.clone();
        let _a = transport.add_listener(move |event| {
            let _ = tx.send(("a", event.clone()));
        });
        let _b = transport.add_listener(move |event| {
            let _ = tx2.send(("b", event.clone()));
        });

        transport.connect();
        let mut server = servers.recv().await.unwrap();
        server.accept().await;

        server.push_event("{garbage");
        server.push_event(r#"{"type":"closed","rideId":9}"#);

        let mut seen = Vec::new();
        for _ in 0..2 {
            seen.push(rx.recv().await.unwrap());
        }
        seen.sort_by_key(|(who, _)| *who);
        assert_eq!(seen[0], ("a", PushEvent::Closed { ride_id: RideId(9) }));
        assert_eq!(seen[1], ("b", PushEvent::Closed { ride_id: RideId(9) }));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_while_offline_connects_and_flushes_in_order() {
        let (transport, _connector, mut servers) = transport(Some("tok"));

        transport.send_message(RideId(3), EmpId(8), "first");
        assert_eq!(transport.state(), ConnectionState::Connecting);
        transport.send_read_receipt(
            RideId(3),
            EmpId(8),
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap(),
        );
        assert_eq!(transport.pending(), 2);

        let mut server = servers.recv().await.unwrap();
        server.accept().await;

        let send = server.expect(Command::Send).await;
        assert_eq!(send.get("destination"), Some("/app/chat.send"));
        let body: serde_json::Value = serde_json::from_str(&send.body).unwrap();
        assert_eq!(body, serde_json::json!({"rideId": 3, "toEmpId": 8, "content": "first"}));

        let read = server.expect(Command::Send).await;
        assert_eq!(read.get("destination"), Some("/app/chat.read"));
        assert!(read.body.contains(r#""upTo":"2024-05-01T10:00:00.000Z""#));
        assert_eq!(transport.pending(), 0);
    }

    #[tokio::test]
    async fn test_pending_queue_is_bounded() {
        let (connector, _servers) = FakeConnector::new();
        connector.refuse.store(true, std::sync::atomic::Ordering::SeqCst);
        let mut config = fast_config();
        config.transport.max_pending = 2;
        let transport =
            Transport::with_connector(&config, Credentials::with_token("tok"), connector).unwrap();

        for text in ["one", "two", "three"] {
            transport.send_message(RideId(1), EmpId(2), text);
        }
        assert_eq!(transport.pending(), 2);
        transport.disconnect();
        assert_eq!(transport.pending(), 0);
    }

    #[tokio::test]
    async fn test_reconnects_after_drop_with_fixed_delay() {
        let (transport, connector, mut servers) = transport(Some("tok"));
        transport.connect();

        let mut first = servers.recv().await.unwrap();
        first.accept().await;
        wait_for(&transport, ConnectionState::Connected).await;

        drop(first);
        let mut second = servers.recv().await.unwrap();
        assert!(transport.retries() >= 1);
        second.accept().await;
        wait_for(&transport, ConnectionState::Connected).await;

        assert_eq!(connector.opened(), 2);
        assert_eq!(transport.retries(), 0);
    }

    #[tokio::test]
    async fn test_refused_connections_keep_retrying() {
        let (transport, connector, _servers) = transport(Some("tok"));
        connector.refuse.store(true, std::sync::atomic::Ordering::SeqCst);
        transport.connect();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(connector.opened() >= 3);
        assert_eq!(transport.state(), ConnectionState::Connecting);
        transport.disconnect();
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_rejected_credential_stops_retrying() {
        let (transport, connector, mut servers) = transport(Some("expired"));
        transport.connect();

        let mut server = servers.recv().await.unwrap();
        server.expect(Command::Connect).await;
        server.push(Frame::new(Command::Error).header("message", "Invalid token"));

        wait_for(&transport, ConnectionState::Disconnected).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(connector.opened(), 1);
    }

    #[tokio::test]
    async fn test_cleared_credential_stops_reconnect_loop() {
        let (connector, mut servers) = FakeConnector::new();
        let credentials = Credentials::with_token("tok");
        let transport =
            Transport::with_connector(&fast_config(), credentials.clone(), connector.clone())
                .unwrap();
        transport.connect();
        let mut server = servers.recv().await.unwrap();
        server.accept().await;
        wait_for(&transport, ConnectionState::Connected).await;

        credentials.clear();
        drop(server);
        wait_for(&transport, ConnectionState::Disconnected).await;
        assert_eq!(connector.opened(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_then_connect_never_overlaps_sockets() {
        let (transport, connector, mut servers) = transport(Some("tok"));
        let _sub = transport.add_listener(|_| {});
        transport.connect();
        let mut first = servers.recv().await.unwrap();
        first.accept().await;
        wait_for(&transport, ConnectionState::Connected).await;

        transport.disconnect();
        assert_eq!(transport.listener_count(), 0);
        transport.connect();
        assert_eq!(transport.state(), ConnectionState::Connecting);

        assert!(first.client_closed().await);
        let mut second = servers.recv().await.unwrap();
        second.accept().await;
        wait_for(&transport, ConnectionState::Connected).await;
        assert_eq!(connector.opened(), 2);

        transport.disconnect();
        transport.disconnect();
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_message_packed_with_connected_is_dispatched() {
        let (transport, _connector, mut servers) = transport(Some("tok"));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _sub = transport.add_listener(move |event| {
            let _ = tx.send(event.clone());
        });
        transport.connect();

        let mut server = servers.recv().await.unwrap();
        server.expect(Command::Connect).await;
        let connected = Frame::new(Command::Connected).header("version", "1.2").encode();
        let message = Frame::new(Command::Message)
            .header("destination", "/user/queue/messages")
            .with_body(r#"{"type":"closed","rideId":4}"#)
            .encode();
        server.push_raw(connected + &message);
        server.expect(Command::Subscribe).await;

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, PushEvent::Closed { ride_id: RideId(4) });
        wait_for(&transport, ConnectionState::Connected).await;
    }

    #[tokio::test]
    async fn test_dropping_transport_ends_session() {
        let (transport, connector, mut servers) = transport(Some("tok"));
        transport.connect();
        let mut server = servers.recv().await.unwrap();
        server.accept().await;
        wait_for(&transport, ConnectionState::Connected).await;

        drop(transport);
        assert!(server.client_closed().await);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(connector.opened(), 1);
    }

    #[tokio::test]
    async fn test_publisher_after_transport_dropped_is_noop() {
        let (transport, _connector, _servers) = transport(Some("tok"));
        let publisher = transport.publisher();
        transport.disconnect();
        drop(transport);
        publisher.send_message(RideId(1), EmpId(2), "dropped quietly");
    }
}
