//! RelayNet Peer
//!
//! Connects to a hub, authenticates, tracks the other members and exchanges
//! direct, correlated and routed frames.

use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock as StdRwLock, Weak};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;

use super::connection::{open, ConnectionError, FrameReader};
use super::{InactiveAction, NetworkConfig, PacketQueue, TlsError, Transmitter};
use crate::context::ProtocolContext;
use crate::correlation::ResponseFuture;
use crate::protocol::{
    Authenticate, Frame, HandlerContext, Identity, IdentityActive, IdentityInactive, IdentityKey,
    KeepAlive, MembershipSnapshot, Packet, RelayDelivery, RoutingOutcome, RoutingRequest,
    RoutingResultReply,
};

/// Peer errors
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Not connected")]
    NotConnected,

    #[error("Connection timeout")]
    Timeout,

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
}

pub type PeerResult<T> = Result<T, PeerError>;

/// Events emitted by the peer
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// Authenticated with the hub
    Connected {
        hub_addr: SocketAddr,
        members: Vec<Identity>,
    },
    /// Another peer authenticated
    MemberJoined { identity: Identity },
    /// Another peer went away
    MemberLeft { identity: Identity },
    /// Lost the hub connection
    Disconnected { reason: String },
}

/// Peer state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Disconnected,
    Connecting,
    Connected,
}

/// State the read loop needs
struct PeerShared {
    identity: Identity,
    context: Arc<ProtocolContext>,
    members: DashMap<IdentityKey, Identity>,
    event_tx: mpsc::Sender<PeerEvent>,
}

impl PeerShared {
    fn emit(&self, event: PeerEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            tracing::debug!("Peer event not delivered: {}", e);
        }
    }

    fn on_frame(
        &self,
        frame: Frame,
        transmitter: &Transmitter,
        snapshot_tx: &mut Option<oneshot::Sender<Vec<Identity>>>,
    ) {
        if self.context.correlator().complete(&frame) {
            return;
        }

        if let Some(snapshot) = frame.packet::<MembershipSnapshot>() {
            self.members.clear();
            for identity in &snapshot.identities {
                if identity.key() != self.identity.key() {
                    self.members.insert(identity.key(), identity.clone());
                }
            }
            match snapshot_tx.take() {
                Some(tx) => {
                    let _ = tx.send(snapshot.identities.clone());
                }
                None => tracing::debug!("Membership refreshed ({} members)", self.members.len()),
            }
            return;
        }

        if let Some(active) = frame.packet::<IdentityActive>() {
            let identity = active.identity.clone();
            if self.members.insert(identity.key(), identity.clone()).is_none() {
                tracing::info!("{} joined", identity);
                self.emit(PeerEvent::MemberJoined { identity });
            }
            return;
        }

        if let Some(inactive) = frame.packet::<IdentityInactive>() {
            if let Some((_, identity)) = self.members.remove(&inactive.identity.key()) {
                tracing::info!("{} left", identity);
                self.emit(PeerEvent::MemberLeft { identity });
            }
            return;
        }

        if let Some(delivery) = frame.packet::<RelayDelivery>() {
            self.deliver(delivery, frame.timestamp, transmitter);
            return;
        }

        if frame.is::<KeepAlive>() {
            return;
        }

        let ctx = HandlerContext {
            transmitter: transmitter.clone(),
            sender: None,
        };
        self.context.registry().dispatch(&frame, &ctx);
    }

    /// Unwrap a routed payload and dispatch it as if `origin` had sent it
    fn deliver(&self, delivery: &RelayDelivery, timestamp: i64, transmitter: &Transmitter) -> bool {
        let registry = self.context.registry();
        let tag = delivery.inner.tag;

        if !registry.is_allowed(tag, None) {
            tracing::warn!(
                "Dropped relayed frame from {}: packet tag {} not admitted",
                delivery.origin,
                tag
            );
            return false;
        }

        let mut body = delivery.inner.body.clone();
        let payload = match registry.decode_payload(tag, &mut body) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("Dropped relayed frame from {}: {}", delivery.origin, e);
                return false;
            }
        };

        let frame = Frame::from_payload(payload).with_timestamp(timestamp);
        let ctx = HandlerContext {
            transmitter: transmitter.clone(),
            sender: Some(delivery.origin.clone()),
        };
        registry.dispatch(&frame, &ctx);
        true
    }
}

fn routing_outcome(response: Option<Frame>) -> RoutingOutcome {
    let Some(frame) = response else {
        return RoutingOutcome::FailedTimeout;
    };
    match frame.packet::<RoutingResultReply>() {
        Some(reply) => reply.outcome,
        None => {
            tracing::warn!("Unexpected {} in answer to a routing request", frame.tag());
            RoutingOutcome::FailedUnknown
        }
    }
}

/// RelayNet Peer
pub struct Peer {
    /// Peer configuration
    config: NetworkConfig,
    shared: Arc<PeerShared>,
    /// Current state
    state: Arc<RwLock<PeerState>>,
    /// Event receiver (for consumers)
    event_rx: Option<mpsc::Receiver<PeerEvent>>,
    /// Current hub connection; detached while disconnected
    transmitter: Arc<StdRwLock<Transmitter>>,
    /// Shutdown signal
    shutdown_tx: Arc<RwLock<Option<mpsc::Sender<()>>>>,
    /// Read loop of the current connection
    reader_task: Mutex<Option<JoinHandle<()>>>,
    /// Set when the local side asked for the connection to end
    closing: Arc<AtomicBool>,
    keep_alive: AtomicBool,
}

impl Peer {
    /// Create a new peer with its own protocol context.
    ///
    /// An empty namespace or nil id in `identity` is filled in.
    pub fn new(config: NetworkConfig, identity: Identity) -> Self {
        let context = Arc::new(ProtocolContext::new(config.timings));
        Self::with_context(config, identity, context)
    }

    pub fn with_context(
        config: NetworkConfig,
        identity: Identity,
        context: Arc<ProtocolContext>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);

        Self {
            config,
            shared: Arc::new(PeerShared {
                identity: identity.normalized(),
                context,
                members: DashMap::new(),
                event_tx,
            }),
            state: Arc::new(RwLock::new(PeerState::Disconnected)),
            event_rx: Some(event_rx),
            transmitter: Arc::new(StdRwLock::new(Transmitter::detached())),
            shutdown_tx: Arc::new(RwLock::new(None)),
            reader_task: Mutex::new(None),
            closing: Arc::new(AtomicBool::new(false)),
            keep_alive: AtomicBool::new(false),
        }
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<PeerEvent>> {
        self.event_rx.take()
    }

    pub fn identity(&self) -> &Identity {
        &self.shared.identity
    }

    pub fn context(&self) -> &Arc<ProtocolContext> {
        &self.shared.context
    }

    /// Connect to a hub and authenticate
    pub async fn connect(&self, hub_addr: SocketAddr) -> PeerResult<()> {
        {
            let state = self.state.read().await;
            if *state != PeerState::Disconnected {
                return Err(PeerError::AlreadyConnected);
            }
        }

        {
            let mut state = self.state.write().await;
            *state = PeerState::Connecting;
        }

        tracing::info!("Connecting to {} as {}", hub_addr, self.shared.identity);

        match self.establish(hub_addr).await {
            Ok(members) => {
                {
                    let mut state = self.state.write().await;
                    if *state == PeerState::Connecting {
                        *state = PeerState::Connected;
                    }
                }
                tracing::info!("Authenticated with {} ({} members)", hub_addr, members.len());
                self.shared.emit(PeerEvent::Connected { hub_addr, members });
                Ok(())
            }
            Err(e) => {
                let mut state = self.state.write().await;
                *state = PeerState::Disconnected;
                Err(e)
            }
        }
    }

    async fn establish(&self, hub_addr: SocketAddr) -> PeerResult<Vec<Identity>> {
        let timeout = self.config.connect_timeout();

        // Connect with timeout
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(hub_addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(PeerError::Io(e)),
            Err(_) => return Err(PeerError::Timeout),
        };

        let (reader, transmitter) = if self.config.use_tls {
            let connector = super::trust_all_connector()?;
            let tls = connector
                .connect(&self.config.host, stream)
                .await
                .map_err(ConnectionError::TlsHandshake)?;
            open(tls, hub_addr, &self.shared.context)
        } else {
            open(stream, hub_addr, &self.shared.context)
        };

        let (snapshot_tx, snapshot_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);

        self.closing.store(false, Ordering::SeqCst);
        *self.transmitter.write().unwrap_or_else(|e| e.into_inner()) = transmitter.clone();
        *self.shutdown_tx.write().await = Some(shutdown_tx);

        let task = self.spawn_reader(reader, transmitter.clone(), snapshot_tx, shutdown_rx);
        *self.reader_task.lock().await = Some(task);

        let auth = Frame::new(Authenticate {
            identity: self.shared.identity.clone(),
        });
        if !transmitter.send(auth).await {
            self.stop_reader().await;
            return Err(PeerError::HandshakeFailed(
                "could not send authentication".to_string(),
            ));
        }

        match tokio::time::timeout(timeout, snapshot_rx).await {
            Ok(Ok(members)) => Ok(members),
            Ok(Err(_)) => {
                self.stop_reader().await;
                Err(PeerError::HandshakeFailed(
                    "connection closed during handshake".to_string(),
                ))
            }
            Err(_) => {
                self.stop_reader().await;
                Err(PeerError::Timeout)
            }
        }
    }

    /// Stop the read loop without applying the inactive action
    async fn abort(&self) {
        self.closing.store(true, Ordering::SeqCst);
        if let Some(tx) = &*self.shutdown_tx.read().await {
            let _ = tx.send(()).await;
        }
    }

    /// Stop the read loop and wait until it has cleaned up
    async fn stop_reader(&self) {
        self.abort().await;
        let task = self.reader_task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!("Peer read loop ended abnormally: {}", e);
            }
        }
    }

    fn spawn_reader(
        &self,
        mut reader: FrameReader,
        transmitter: Transmitter,
        snapshot_tx: oneshot::Sender<Vec<Identity>>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) -> JoinHandle<()> {
        let shared = self.shared.clone();
        let state = self.state.clone();
        let closing = self.closing.clone();
        let inactive_action = self.config.inactive_action;

        tokio::spawn(async move {
            let mut snapshot_tx = Some(snapshot_tx);

            let disconnect_reason = loop {
                tokio::select! {
                    // Receive frames from the hub
                    result = reader.recv() => {
                        match result {
                            Ok(Some(frame)) => shared.on_frame(frame, &transmitter, &mut snapshot_tx),
                            Ok(None) => {
                                break "Connection closed".to_string();
                            }
                            Err(e) => {
                                break format!("Error: {}", e);
                            }
                        }
                    }

                    // Shutdown signal
                    _ = shutdown_rx.recv() => {
                        break "Peer shutdown requested".to_string();
                    }
                }
            };

            // Clean up
            transmitter.close().await;
            shared.members.clear();

            {
                let mut s = state.write().await;
                *s = PeerState::Disconnected;
            }

            tracing::info!("Disconnected from hub: {}", disconnect_reason);
            shared.emit(PeerEvent::Disconnected {
                reason: disconnect_reason,
            });

            if closing.load(Ordering::SeqCst) {
                return;
            }
            match inactive_action {
                InactiveAction::Shutdown => {
                    tracing::info!("Hub connection lost, shutting down");
                    std::process::exit(0);
                }
                InactiveAction::Retry => {
                    tracing::info!("Hub connection lost; reconnecting is left to the application");
                }
            }
        })
    }

    /// Connect to a hub by hostname
    pub async fn connect_hostname(&self, hostname: &str, port: u16) -> PeerResult<()> {
        let addr = super::resolve_host(hostname, port).await?;
        self.connect(addr).await
    }

    /// Disconnect from the hub.
    ///
    /// Returns once the connection is closed and the peer is back in
    /// [`PeerState::Disconnected`], so it can connect again right away.
    pub async fn disconnect(&self) -> PeerResult<()> {
        {
            let state = self.state.read().await;
            if *state == PeerState::Disconnected {
                return Err(PeerError::NotConnected);
            }
        }

        self.stop_reader().await;
        Ok(())
    }

    /// The current hub connection
    pub fn transmitter(&self) -> Transmitter {
        self.transmitter
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Send a frame straight to the hub
    pub async fn send(&self, frame: Frame) -> bool {
        self.transmitter().send(frame).await
    }

    /// A paced outbound queue to the hub
    pub fn queue(&self) -> Arc<PacketQueue> {
        self.shared.context.queue(self.transmitter())
    }

    /// Send a request to the hub; resolves with the answer or `None`
    pub fn request(&self, frame: Frame) -> ResponseFuture {
        self.shared
            .context
            .correlator()
            .request(&self.transmitter(), frame)
    }

    /// Blocking variant of [`Peer::request`]; never call it on a runtime worker
    pub fn request_blocking(&self, frame: Frame) -> Option<Frame> {
        self.shared
            .context
            .correlator()
            .request_blocking(&self.transmitter(), frame)
    }

    /// Have the hub deliver `packet` to `target`
    pub async fn route<P: Packet>(&self, target: &Identity, packet: &P) -> RoutingOutcome {
        let request = Frame::new(RoutingRequest::new(target.clone(), packet));
        routing_outcome(self.request(request).await)
    }

    /// Blocking variant of [`Peer::route`]; never call it on a runtime worker
    pub fn route_blocking<P: Packet>(&self, target: &Identity, packet: &P) -> RoutingOutcome {
        let request = Frame::new(RoutingRequest::new(target.clone(), packet));
        routing_outcome(self.request_blocking(request))
    }

    /// Other peers currently connected to the hub
    pub fn members(&self) -> Vec<Identity> {
        self.shared
            .members
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// First member whose namespace matches, ignoring case
    pub fn find_member(&self, namespace: &str) -> Option<Identity> {
        self.shared
            .members
            .iter()
            .find(|entry| entry.value().namespace.eq_ignore_ascii_case(namespace))
            .map(|entry| entry.value().clone())
    }

    /// Send a keep-alive on every interval tick for as long as the peer lives.
    ///
    /// Returns false if already enabled.
    pub fn stay_active(&self) -> bool {
        if self.keep_alive.swap(true, Ordering::SeqCst) {
            tracing::debug!("Keep-alive already enabled");
            return false;
        }

        let slot: Weak<StdRwLock<Transmitter>> = Arc::downgrade(&self.transmitter);
        let period = self.shared.context.timings().keep_alive_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(slot) = slot.upgrade() else {
                    break;
                };
                let transmitter = slot.read().unwrap_or_else(|e| e.into_inner()).clone();
                if transmitter.is_open() {
                    transmitter.send_serial(Frame::new(KeepAlive));
                }
            }
        });
        true
    }

    /// Get the current state
    pub async fn state(&self) -> PeerState {
        *self.state.read().await
    }

    /// Check if connected
    pub async fn is_connected(&self) -> bool {
        *self.state.read().await == PeerState::Connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DocumentPacket, PacketTag};

    #[tokio::test]
    async fn test_peer_creation() {
        let peer = Peer::new(NetworkConfig::default(), Identity::generate("test-peer"));
        assert!(!peer.is_connected().await);
        assert!(peer.members().is_empty());
        assert!(matches!(peer.disconnect().await, Err(PeerError::NotConnected)));
    }

    #[test]
    fn test_identity_is_normalized() {
        let peer = Peer::new(
            NetworkConfig::default(),
            Identity::new("", uuid::Uuid::nil()),
        );
        assert!(peer.identity().is_complete());
        assert_eq!(peer.identity().namespace.len(), 8);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let peer = Peer::new(NetworkConfig::default(), Identity::generate("p"));
        assert!(peer.connect(addr).await.is_err());
        assert_eq!(peer.state().await, PeerState::Disconnected);
    }

    #[tokio::test]
    async fn test_send_while_disconnected_is_noop() {
        let peer = Peer::new(NetworkConfig::default(), Identity::generate("p"));
        assert!(!peer.send(Frame::new(KeepAlive)).await);
        assert_eq!(
            peer.route(&Identity::generate("q"), &KeepAlive).await,
            RoutingOutcome::FailedTimeout
        );
    }

    #[test]
    fn test_routing_outcome_mapping() {
        assert_eq!(routing_outcome(None), RoutingOutcome::FailedTimeout);
        assert_eq!(
            routing_outcome(Some(Frame::new(RoutingResultReply {
                outcome: RoutingOutcome::FailedNoClient
            }))),
            RoutingOutcome::FailedNoClient
        );
        assert_eq!(
            routing_outcome(Some(Frame::new(KeepAlive))),
            RoutingOutcome::FailedUnknown
        );
    }

    #[tokio::test]
    async fn test_membership_notices_update_cache() {
        let (event_tx, mut events) = mpsc::channel(8);
        let me = Identity::generate("me");
        let shared = PeerShared {
            identity: me.clone(),
            context: Arc::new(ProtocolContext::default()),
            members: DashMap::new(),
            event_tx,
        };
        let other = Identity::generate("other");
        let tx = Transmitter::detached();
        let (snap_tx, snap_rx) = oneshot::channel();
        let mut snap_tx = Some(snap_tx);

        shared.on_frame(
            Frame::new(MembershipSnapshot {
                identities: vec![other.clone(), me.clone()],
            }),
            &tx,
            &mut snap_tx,
        );
        assert_eq!(snap_rx.await.unwrap().len(), 2);
        assert_eq!(shared.members.len(), 1);

        // A repeated join is not re-announced
        shared.on_frame(Frame::new(IdentityActive { identity: other.clone() }), &tx, &mut snap_tx);
        assert!(events.try_recv().is_err());

        shared.on_frame(Frame::new(IdentityInactive { identity: other.clone() }), &tx, &mut snap_tx);
        assert!(matches!(events.try_recv(), Ok(PeerEvent::MemberLeft { identity }) if identity == other));
        assert!(shared.members.is_empty());
    }

    #[test]
    fn test_relayed_garbage_is_dropped() {
        let context = Arc::new(ProtocolContext::default());
        context.allow_packet(PacketTag::BYPASS_ALL);
        let (event_tx, _events) = mpsc::channel(8);
        let shared = PeerShared {
            identity: Identity::generate("me"),
            context,
            members: DashMap::new(),
            event_tx,
        };

        // Admitted by bypass but unregistered, then registered but malformed
        let unknown = RelayDelivery {
            origin: Identity::generate("o"),
            inner: crate::protocol::RawPayload::new(PacketTag(999), bytes::Bytes::new()),
        };
        assert!(!shared.deliver(&unknown, 0, &Transmitter::detached()));

        let malformed = RelayDelivery {
            origin: Identity::generate("o"),
            inner: crate::protocol::RawPayload::new(
                DocumentPacket::TAG,
                bytes::Bytes::from_static(b"\x00"),
            ),
        };
        assert!(!shared.deliver(&malformed, 0, &Transmitter::detached()));

        let valid = RelayDelivery {
            origin: Identity::generate("o"),
            inner: crate::protocol::RawPayload::from_packet(&DocumentPacket::new(
                serde_json::json!(true),
            )),
        };
        assert!(shared.deliver(&valid, 0, &Transmitter::detached()));
    }
}
