//! RelayNet Hub
//!
//! The hub accepts peer connections, authenticates them, keeps every peer
//! informed about who else is connected and relays routed payloads between
//! them.

use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};

use super::connection::{open, ConnectionError};
use super::{
    Membership, NetworkConfig, Relay, Session, SessionState, TlsError, Transmitter,
};
use crate::context::ProtocolContext;
use crate::correlation::ResponseFuture;
use crate::protocol::{
    Authenticate, Frame, HandlerContext, Identity, IdentityActive, IdentityInactive, KeepAlive,
    MembershipSnapshot, RoutingRequest,
};

/// Hub errors
#[derive(Error, Debug)]
pub enum HubError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    #[error("Hub already running")]
    AlreadyRunning,

    #[error("Hub not running")]
    NotRunning,

    #[error("Bind failed: {0}")]
    BindFailed(String),
}

pub type HubResult<T> = Result<T, HubError>;

/// Events emitted by the hub
#[derive(Debug, Clone)]
pub enum HubEvent {
    /// Hub started
    Started { bind_addr: SocketAddr },
    /// A peer completed authentication
    PeerAuthenticated { addr: SocketAddr, identity: Identity },
    /// A connection went away, authenticated or not
    PeerDisconnected {
        addr: SocketAddr,
        identity: Option<Identity>,
        reason: String,
    },
    /// Hub stopped
    Stopped,
}

/// State shared by the accept loop and every connection task
struct HubShared {
    context: Arc<ProtocolContext>,
    membership: Arc<Membership>,
    relay: Arc<Relay>,
    event_tx: mpsc::Sender<HubEvent>,
}

impl HubShared {
    fn emit(&self, event: HubEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            tracing::debug!("Hub event not delivered: {}", e);
        }
    }

    /// Handle a frame on an unauthenticated connection
    fn authenticate(
        &self,
        addr: SocketAddr,
        transmitter: &Transmitter,
        frame: &Frame,
    ) -> Option<Identity> {
        let Some(auth) = frame.packet::<Authenticate>() else {
            tracing::warn!("Dropped {} from unauthenticated {}", frame.tag(), addr);
            return None;
        };

        let session = match self
            .membership
            .admit(addr, auth.identity.clone(), transmitter.clone())
        {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!("Rejected authentication from {}: {}", addr, e);
                return None;
            }
        };
        let identity = session.identity;

        // Peer discovery: the newcomer learns everyone else, everyone else
        // learns the newcomer
        let others = self.membership.others(&identity);
        let snapshot = MembershipSnapshot {
            identities: others.iter().map(|s| s.identity.clone()).collect(),
        };
        transmitter.send_serial(Frame::new(snapshot));
        let notified = Membership::broadcast(
            &others,
            &Frame::new(IdentityActive {
                identity: identity.clone(),
            }),
        );

        tracing::info!(
            "{} authenticated from {} ({} members notified)",
            identity,
            addr,
            notified
        );
        self.emit(HubEvent::PeerAuthenticated {
            addr,
            identity: identity.clone(),
        });
        Some(identity)
    }

    /// Handle a frame from an authenticated peer
    fn on_frame(&self, identity: &Identity, transmitter: &Transmitter, frame: Frame) {
        if self.context.correlator().complete(&frame) {
            return;
        }

        if frame.is::<Authenticate>() {
            tracing::warn!("{} is already authenticated, dropped {}", identity, frame.tag());
            return;
        }

        if let Some(request) = frame.packet::<RoutingRequest>() {
            self.relay.submit(
                identity.clone(),
                transmitter.clone(),
                frame.correlation_id,
                request.clone(),
            );
            return;
        }

        if frame.is::<KeepAlive>() {
            tracing::trace!("Keep-alive from {}", identity);
            return;
        }

        let ctx = HandlerContext {
            transmitter: transmitter.clone(),
            sender: Some(identity.clone()),
        };
        self.context.registry().dispatch(&frame, &ctx);
    }

    async fn teardown(
        &self,
        addr: SocketAddr,
        state: &mut SessionState,
        transmitter: &Transmitter,
        reason: String,
    ) {
        self.membership.remove_pending(&addr);

        let identity = state.close();
        if let Some(identity) = &identity {
            let remaining = self.membership.others(identity);
            Membership::broadcast(
                &remaining,
                &Frame::new(IdentityInactive {
                    identity: identity.clone(),
                }),
            );
            self.membership.remove(identity);
            tracing::info!("{} disconnected: {}", identity, reason);
        } else {
            tracing::info!("Unauthenticated connection {} closed: {}", addr, reason);
        }

        transmitter.close().await;
        self.emit(HubEvent::PeerDisconnected {
            addr,
            identity,
            reason,
        });
    }
}

/// RelayNet Hub
pub struct Hub {
    /// Hub configuration
    config: NetworkConfig,
    shared: Arc<HubShared>,
    /// Event receiver (for consumers)
    event_rx: Option<mpsc::Receiver<HubEvent>>,
    /// Shutdown signal
    shutdown_tx: Option<mpsc::Sender<()>>,
    /// Whether the hub is running
    running: Arc<RwLock<bool>>,
    local_addr: Option<SocketAddr>,
}

impl Hub {
    /// Create a new hub with its own protocol context
    pub fn new(config: NetworkConfig) -> Self {
        let context = Arc::new(ProtocolContext::new(config.timings));
        Self::with_context(config, context)
    }

    pub fn with_context(config: NetworkConfig, context: Arc<ProtocolContext>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let membership = Arc::new(Membership::new());
        let relay = Arc::new(Relay::new(
            membership.clone(),
            context.timings().relay_delay,
        ));

        Self {
            config,
            shared: Arc::new(HubShared {
                context,
                membership,
                relay,
                event_tx,
            }),
            event_rx: Some(event_rx),
            shutdown_tx: None,
            running: Arc::new(RwLock::new(false)),
            local_addr: None,
        }
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<HubEvent>> {
        self.event_rx.take()
    }

    pub fn context(&self) -> &Arc<ProtocolContext> {
        &self.shared.context
    }

    /// Start the hub, returning the bound address
    pub async fn start(&mut self) -> HubResult<SocketAddr> {
        {
            let running = self.running.read().await;
            if *running {
                return Err(HubError::AlreadyRunning);
            }
        }

        let acceptor = if self.config.use_tls {
            let hostname = hostname::get()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "localhost".to_string());
            Some(super::self_signed_acceptor(&hostname)?)
        } else {
            None
        };

        let bind_addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            HubError::BindFailed(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;

        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);
        tracing::info!(
            "Hub listening on {}{}",
            local_addr,
            if acceptor.is_some() { " (TLS)" } else { "" }
        );

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);

        {
            let mut running = self.running.write().await;
            *running = true;
        }

        self.shared.emit(HubEvent::Started {
            bind_addr: local_addr,
        });

        let shared = self.shared.clone();
        let running = self.running.clone();

        // Spawn the accept loop
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                tracing::info!("New connection from {}", addr);
                                let shared = shared.clone();
                                let acceptor = acceptor.clone();

                                tokio::spawn(async move {
                                    match acceptor {
                                        Some(acceptor) => match acceptor.accept(stream).await {
                                            Ok(tls) => handle_connection(tls, addr, shared).await,
                                            Err(e) => tracing::warn!("TLS handshake with {} failed: {}", addr, e),
                                        },
                                        None => handle_connection(stream, addr, shared).await,
                                    }
                                });
                            }
                            Err(e) => {
                                tracing::error!("Accept error: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Hub shutdown requested");
                        break;
                    }
                }
            }

            let mut running = running.write().await;
            *running = false;

            shared.emit(HubEvent::Stopped);
        });

        Ok(local_addr)
    }

    /// Stop accepting and close every connection, authenticated or not
    pub async fn stop(&mut self) -> HubResult<()> {
        {
            let running = self.running.read().await;
            if !*running {
                return Err(HubError::NotRunning);
            }
        }

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }

        for session in self.shared.membership.snapshot() {
            session.transmitter.close().await;
        }
        for transmitter in self.shared.membership.pending_transmitters() {
            transmitter.close().await;
        }

        Ok(())
    }

    /// Check if the hub is running
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Identities of every authenticated peer
    pub fn members(&self) -> Vec<Identity> {
        self.shared.membership.identities()
    }

    pub fn session(&self, identity: &Identity) -> Option<Session> {
        self.shared.membership.lookup(identity)
    }

    /// Send a frame to a specific member
    pub async fn send_to(&self, identity: &Identity, frame: Frame) -> bool {
        match self.shared.membership.lookup(identity) {
            Some(session) => session.transmitter.send(frame).await,
            None => {
                tracing::warn!("No member {} to send {} to", identity, frame.tag());
                false
            }
        }
    }

    /// Send a frame to every member; returns how many accepted it
    pub fn broadcast(&self, frame: Frame) -> usize {
        Membership::broadcast(&self.shared.membership.snapshot(), &frame)
    }

    /// Ask a member and await its correlated answer
    pub async fn request(&self, identity: &Identity, frame: Frame) -> Option<Frame> {
        self.request_future(identity, frame)?.await
    }

    fn request_future(&self, identity: &Identity, frame: Frame) -> Option<ResponseFuture> {
        let Some(session) = self.shared.membership.lookup(identity) else {
            tracing::warn!("No member {} to request {} from", identity, frame.tag());
            return None;
        };
        Some(
            self.shared
                .context
                .correlator()
                .request(&session.transmitter, frame),
        )
    }

    /// Blocking variant of [`Hub::request`]; never call it on a runtime worker
    pub fn request_blocking(&self, identity: &Identity, frame: Frame) -> Option<Frame> {
        let Some(session) = self.shared.membership.lookup(identity) else {
            tracing::warn!("No member {} to request {} from", identity, frame.tag());
            return None;
        };
        self.shared
            .context
            .correlator()
            .request_blocking(&session.transmitter, frame)
    }
}

/// Drive one peer connection from accept to teardown
async fn handle_connection<S>(stream: S, addr: SocketAddr, shared: Arc<HubShared>)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut reader, transmitter) = open(stream, addr, &shared.context);
    shared.membership.add_pending(addr, transmitter.clone());

    let mut state = SessionState::Unauthenticated;

    // Main frame loop
    let disconnect_reason = loop {
        match reader.recv().await {
            Ok(Some(frame)) => match state.identity() {
                Some(identity) => shared.on_frame(identity, &transmitter, frame),
                None => {
                    if let Some(identity) = shared.authenticate(addr, &transmitter, &frame) {
                        state.authenticate(identity);
                    }
                }
            },
            Ok(None) => {
                break "Connection closed".to_string();
            }
            Err(e) => {
                break format!("Error: {}", e);
            }
        }
    };

    shared
        .teardown(addr, &mut state, &transmitter, disconnect_reason)
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Timings;
    use crate::network::{Peer, PeerEvent, PeerState};
    use crate::protocol::{
        handler_factory, DocumentPacket, Packet, PacketHandler, RoutingOutcome,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::{Duration, Instant};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    fn test_config() -> NetworkConfig {
        let timings = Timings {
            relay_delay: Duration::from_millis(10),
            ..Timings::default()
        };
        let mut config = NetworkConfig::new(0)
            .with_host("127.0.0.1")
            .with_timings(timings);
        config.connect_timeout_ms = 1000;
        config
    }

    async fn start_hub() -> (Hub, SocketAddr) {
        let mut hub = Hub::new(test_config());
        let addr = hub.start().await.unwrap();
        (hub, addr)
    }

    async fn connect(addr: SocketAddr, namespace: &str) -> (Arc<Peer>, mpsc::Receiver<PeerEvent>) {
        let mut peer = Peer::new(test_config(), Identity::generate(namespace));
        let events = peer.take_event_receiver().unwrap();
        peer.connect(addr).await.unwrap();
        (Arc::new(peer), events)
    }

    /// Next event that is not `Connected`
    async fn next_event(events: &mut mpsc::Receiver<PeerEvent>) -> PeerEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .expect("timed out waiting for peer event")
                .expect("event channel closed");
            if !matches!(event, PeerEvent::Connected { .. }) {
                return event;
            }
        }
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        let start = Instant::now();
        while !condition() {
            assert!(start.elapsed() < Duration::from_secs(2), "condition not met in time");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Records every `DocumentPacket` it sees, with the sender
    fn recorder(seen: Arc<Mutex<Vec<(serde_json::Value, Option<Identity>)>>>) -> crate::protocol::HandlerFactory {
        handler_factory(move || {
            let seen = seen.clone();
            move |frame: &Frame, ctx: &HandlerContext| {
                if let Some(doc) = frame.packet::<DocumentPacket>() {
                    seen.lock().unwrap().push((doc.document.clone(), ctx.sender.clone()));
                }
            }
        })
    }

    #[tokio::test]
    async fn test_hub_creation() {
        let hub = Hub::new(NetworkConfig::default());
        assert!(!hub.is_running().await);
        assert!(hub.members().is_empty());
    }

    #[tokio::test]
    async fn test_start_stop() {
        let mut hub = Hub::new(test_config());
        let mut events = hub.take_event_receiver().unwrap();

        let addr = hub.start().await.unwrap();
        assert!(hub.is_running().await);
        assert!(matches!(hub.start().await, Err(HubError::AlreadyRunning)));
        assert!(matches!(events.recv().await, Some(HubEvent::Started { bind_addr }) if bind_addr == addr));

        hub.stop().await.unwrap();
        assert!(matches!(events.recv().await, Some(HubEvent::Stopped)));
        assert!(!hub.is_running().await);
    }

    #[tokio::test]
    async fn test_handshake_delivers_exact_membership() {
        let (hub, addr) = start_hub().await;

        let (a, mut a_events) = connect(addr, "alpha").await;
        assert!(a.members().is_empty());

        let (b, _b_events) = connect(addr, "beta").await;
        assert_eq!(b.members(), vec![a.identity().clone()]);

        let (c, _c_events) = connect(addr, "gamma").await;
        let mut seen = c.members();
        seen.sort_by(|x, y| x.namespace.cmp(&y.namespace));
        assert_eq!(seen, vec![a.identity().clone(), b.identity().clone()]);

        // A hears about B then C, once each
        assert!(matches!(next_event(&mut a_events).await,
            PeerEvent::MemberJoined { identity } if identity == *b.identity()));
        assert!(matches!(next_event(&mut a_events).await,
            PeerEvent::MemberJoined { identity } if identity == *c.identity()));
        assert!(tokio::time::timeout(Duration::from_millis(100), a_events.recv())
            .await
            .is_err());

        assert_eq!(hub.members().len(), 3);
        assert_eq!(a.find_member("GAMMA"), Some(c.identity().clone()));
    }

    #[tokio::test]
    async fn test_route_delivers_once_and_reports_success() {
        let (_hub, addr) = start_hub().await;
        let (a, _a_events) = connect(addr, "alpha").await;
        let (b, _b_events) = connect(addr, "beta").await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        b.context().accept::<DocumentPacket>();
        b.context()
            .register_handler(DocumentPacket::TAG, recorder(seen.clone()));

        let payload = serde_json::json!({ "msg": "hello" });
        let outcome = a
            .route(b.identity(), &DocumentPacket::new(payload.clone()))
            .await;
        assert_eq!(outcome, RoutingOutcome::Success);

        wait_for(|| !seen.lock().unwrap().is_empty()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, payload);
        assert_eq!(seen[0].1.as_ref(), Some(a.identity()));
    }

    #[tokio::test]
    async fn test_route_to_absent_identity_is_no_client() {
        let (_hub, addr) = start_hub().await;
        let (a, _a_events) = connect(addr, "alpha").await;
        let (b, _b_events) = connect(addr, "beta").await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        b.context().accept::<DocumentPacket>();
        b.context()
            .register_handler(DocumentPacket::TAG, recorder(seen.clone()));

        let ghost = Identity::generate("ghost");
        let outcome = a
            .route(&ghost, &DocumentPacket::new(serde_json::json!(1)))
            .await;
        assert_eq!(outcome, RoutingOutcome::FailedNoClient);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_relayed_payload_needs_target_admission() {
        let (_hub, addr) = start_hub().await;
        let (a, _a_events) = connect(addr, "alpha").await;
        let (b, _b_events) = connect(addr, "beta").await;

        // B registers a handler but never admits the tag
        let seen = Arc::new(Mutex::new(Vec::new()));
        b.context().registry().register::<DocumentPacket>();
        b.context()
            .register_handler(DocumentPacket::TAG, recorder(seen.clone()));

        let outcome = a
            .route(b.identity(), &DocumentPacket::new(serde_json::json!(1)))
            .await;
        assert_eq!(outcome, RoutingOutcome::Success);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_route_off_runtime() {
        let (_hub, addr) = start_hub().await;
        let (a, _a_events) = connect(addr, "alpha").await;
        let (b, _b_events) = connect(addr, "beta").await;
        b.context().accept::<DocumentPacket>();

        let target = b.identity().clone();
        let peer = a.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            peer.route_blocking(&target, &DocumentPacket::new(serde_json::json!("sync")))
        })
        .await
        .unwrap();
        assert_eq!(outcome, RoutingOutcome::Success);
    }

    #[tokio::test]
    async fn test_disconnect_notifies_remaining_peers_once() {
        let (hub, addr) = start_hub().await;
        let (a, mut a_events) = connect(addr, "alpha").await;
        let (b, _b_events) = connect(addr, "beta").await;
        let (c, mut c_events) = connect(addr, "gamma").await;

        assert!(matches!(next_event(&mut a_events).await, PeerEvent::MemberJoined { .. }));
        assert!(matches!(next_event(&mut a_events).await, PeerEvent::MemberJoined { .. }));

        b.disconnect().await.unwrap();

        assert!(matches!(next_event(&mut a_events).await,
            PeerEvent::MemberLeft { identity } if identity == *b.identity()));
        assert!(matches!(next_event(&mut c_events).await,
            PeerEvent::MemberLeft { identity } if identity == *b.identity()));
        assert!(tokio::time::timeout(Duration::from_millis(100), a_events.recv())
            .await
            .is_err());

        wait_for(|| hub.members().len() == 2).await;
        assert_eq!(a.members(), vec![c.identity().clone()]);
    }

    #[tokio::test]
    async fn test_duplicate_identity_is_rejected() {
        let (hub, addr) = start_hub().await;
        let (a, _a_events) = connect(addr, "alpha").await;

        let mut config = test_config();
        config.connect_timeout_ms = 300;
        let twin = Peer::new(config, a.identity().clone());
        assert!(twin.connect(addr).await.is_err());
        assert!(!twin.is_connected().await);
        assert_eq!(hub.members().len(), 1);
    }

    #[tokio::test]
    async fn test_frames_before_authentication_are_dropped() {
        let (hub, addr) = start_hub().await;
        hub.context().accept::<DocumentPacket>();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        hub.context().register_handler(
            DocumentPacket::TAG,
            Arc::new(move || {
                let counter = counter.clone();
                Box::new(move |_: &Frame, _: &HandlerContext| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }) as Box<dyn PacketHandler>
            }),
        );

        // A raw client speaking the protocol by hand
        let client = ProtocolContext::default();
        client.accept::<DocumentPacket>();
        let stream = TcpStream::connect(addr).await.unwrap();
        let (mut reader, tx) = open(stream, addr, &client);

        tx.send(Frame::new(DocumentPacket::new(serde_json::json!("early")))).await;
        tx.send(Frame::new(Authenticate {
            identity: Identity::generate("raw"),
        }))
        .await;

        let snapshot = reader.recv().await.unwrap().unwrap();
        assert!(snapshot.packet::<MembershipSnapshot>().unwrap().identities.is_empty());

        tx.send(Frame::new(DocumentPacket::new(serde_json::json!("late")))).await;
        wait_for(|| count.load(Ordering::SeqCst) == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_hub_request_and_handler_respond() {
        let (hub, addr) = start_hub().await;
        let (a, _a_events) = connect(addr, "alpha").await;

        a.context().accept::<DocumentPacket>();
        a.context().register_handler(
            DocumentPacket::TAG,
            handler_factory(|| {
                |frame: &Frame, ctx: &HandlerContext| {
                    if let Some(doc) = frame.packet::<DocumentPacket>() {
                        let echoed = serde_json::json!({ "echo": doc.document });
                        ctx.respond(frame, DocumentPacket::new(echoed));
                    }
                }
            }),
        );

        let response = hub
            .request(
                a.identity(),
                Frame::new(DocumentPacket::new(serde_json::json!("ping"))),
            )
            .await
            .expect("no response");
        assert_eq!(
            response.packet::<DocumentPacket>().unwrap().document,
            serde_json::json!({ "echo": "ping" })
        );

        // Unknown member yields nothing
        assert!(hub
            .request(&Identity::generate("nobody"), Frame::new(DocumentPacket::new(serde_json::json!(0))))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_peer_reconnects_right_after_disconnect() {
        let (hub, addr) = start_hub().await;
        let (a, _a_events) = connect(addr, "alpha").await;

        a.disconnect().await.unwrap();
        assert_eq!(a.state().await, PeerState::Disconnected);
        assert!(a.members().is_empty());

        wait_for(|| hub.members().is_empty()).await;
        a.connect(addr).await.unwrap();
        assert!(a.is_connected().await);
        wait_for(|| hub.members().len() == 1).await;
    }

    #[tokio::test]
    async fn test_stop_closes_unauthenticated_connections() {
        let (mut hub, addr) = start_hub().await;
        let mut raw = TcpStream::connect(addr).await.unwrap();
        wait_for(|| hub.shared.membership.pending_count() == 1).await;

        hub.stop().await.unwrap();

        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_secs(2), raw.read(&mut buf))
            .await
            .expect("connection left open");
        assert!(matches!(read, Ok(0) | Err(_)));
    }

    #[tokio::test]
    async fn test_late_duplicate_response_is_not_dispatched() {
        let (hub, addr) = start_hub().await;
        let (a, _a_events) = connect(addr, "alpha").await;

        // Hub answers once right away and again after the request finished
        hub.context().accept::<DocumentPacket>();
        hub.context().register_handler(
            DocumentPacket::TAG,
            handler_factory(|| {
                |frame: &Frame, ctx: &HandlerContext| {
                    ctx.respond(frame, DocumentPacket::new(serde_json::json!("first")));
                    let ctx = ctx.clone();
                    let frame = frame.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        ctx.respond(&frame, DocumentPacket::new(serde_json::json!("duplicate")));
                    });
                }
            }),
        );

        let seen = Arc::new(Mutex::new(Vec::new()));
        a.context().accept::<DocumentPacket>();
        a.context().register_handler(DocumentPacket::TAG, recorder(seen.clone()));

        let response = a
            .request(Frame::new(DocumentPacket::new(serde_json::json!("ping"))))
            .await
            .expect("no response");
        assert_eq!(
            response.packet::<DocumentPacket>().unwrap().document,
            serde_json::json!("first")
        );

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(seen.lock().unwrap().is_empty());
        assert!(a.context().correlator().pending().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unanswered_request_times_out_in_both_flows() {
        let timings = Timings {
            request_timeout: Duration::from_millis(200),
            response_deadline: Duration::from_millis(300),
            ..Timings::default()
        };
        let mut hub = Hub::new(test_config().with_timings(timings));
        let addr = hub.start().await.unwrap();
        let (a, _a_events) = connect(addr, "alpha").await;
        let hub = Arc::new(hub);

        // The peer never answers a keep-alive
        let start = Instant::now();
        assert!(hub.request(a.identity(), Frame::new(KeepAlive)).await.is_none());
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(280) && elapsed < Duration::from_millis(1500));

        let target = a.identity().clone();
        let blocking_hub = hub.clone();
        let start = Instant::now();
        let response = tokio::task::spawn_blocking(move || {
            blocking_hub.request_blocking(&target, Frame::new(KeepAlive))
        })
        .await
        .unwrap();
        assert!(response.is_none());
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(180) && elapsed < Duration::from_millis(1500));
        assert!(hub.context().correlator().pending().is_empty());
    }
}
