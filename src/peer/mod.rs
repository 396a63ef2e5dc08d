#[cfg(test)]
mod peer_test;

pub mod peer_config;
pub(crate) mod retry_queue;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

pub use peer_config::PeerConfig;
pub use retry_queue::OnTimeoutFn;

use retry_queue::{RetryQueue, RetryQueueEntry};

use crate::bus::{ListenerId, MessageBus};
use crate::connection::registry::ConnectionRegistry;
use crate::connection::{Connection, ConnectionState};
use crate::error::{Error, Result};
use crate::gossip::RpsEngine;
use crate::media::MediaFetcher;
use crate::message::{Message, MessageType, PeerId, BROADCAST_TO};
use crate::origin::OriginClient;
use crate::transport::{
    SignalingLink, TransportConnector, TransportEvent, SIGNAL_ID,
};

/// Which of the send rules resolved a message.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum SendOutcome {
    /// Addressed to this node; dispatched on the local bus.
    Dispatched,
    /// Handed to the open connection of its destination.
    Sent,
    /// Sent to the next hop popped off the message's route.
    Routed,
    /// Fanned out to open connections (or the signaling fallback).
    Broadcast,
    /// Parked in the retry queue until the destination connects.
    Queued,
}

/// A mesh node: routes, forwards and broadcasts envelopes over whatever
/// duplex transport it is given, runs the connection handshake, and hosts
/// the gossip and media engines its configuration enables.
///
/// One spawned event loop consumes every transport event, so handlers
/// observe messages in a serialized order; the engines talk back to the
/// mesh exclusively through an outbound message channel.
pub struct Peer {
    internal: Arc<PeerInternal>,
    done_tx: Mutex<Option<mpsc::Sender<()>>>,
    receivers: Mutex<Option<LoopReceivers>>,
    listener_ids: Mutex<Vec<(MessageType, ListenerId)>>,
}

struct LoopReceivers {
    events_rx: mpsc::Receiver<TransportEvent>,
    outbound_rx: mpsc::UnboundedReceiver<Message>,
}

pub(crate) struct PeerInternal {
    config: PeerConfig,
    id: Mutex<PeerId>,
    bus: Arc<MessageBus>,
    registry: ConnectionRegistry,
    queue: RetryQueue,
    connector: Arc<dyn TransportConnector>,
    signaling: Arc<dyn SignalingLink>,
    events_tx: mpsc::Sender<TransportEvent>,
    gossip: Option<Arc<RpsEngine>>,
    media: Option<Arc<MediaFetcher>>,
    closed: AtomicBool,
}

impl Peer {
    pub fn new(
        config: PeerConfig,
        connector: Arc<dyn TransportConnector>,
        signaling: Arc<dyn SignalingLink>,
        origin: Option<Arc<dyn OriginClient>>,
    ) -> Result<Self> {
        let bus = Arc::new(MessageBus::new());
        let (events_tx, events_rx) = mpsc::channel(64);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let gossip = config.gossip.clone().map(|gossip_config| {
            Arc::new(RpsEngine::new(
                gossip_config,
                Arc::clone(&bus),
                outbound_tx.clone(),
            ))
        });

        let media = match config.media.clone() {
            Some(media_config) => {
                let origin = origin.ok_or_else(|| {
                    Error::Other("the media extension needs an origin client".to_owned())
                })?;
                Some(Arc::new(MediaFetcher::new(
                    media_config,
                    Arc::clone(&bus),
                    outbound_tx.clone(),
                    origin,
                )))
            }
            None => None,
        };

        Ok(Peer {
            internal: Arc::new(PeerInternal {
                config,
                id: Mutex::new(String::new()),
                bus,
                registry: ConnectionRegistry::new(),
                queue: RetryQueue::new(),
                connector,
                signaling,
                events_tx,
                gossip,
                media,
                closed: AtomicBool::new(false),
            }),
            done_tx: Mutex::new(None),
            receivers: Mutex::new(Some(LoopReceivers {
                events_rx,
                outbound_rx,
            })),
            listener_ids: Mutex::new(vec![]),
        })
    }

    /// Attaches to signaling, registers the handshake handlers, starts the
    /// enabled engines and spawns the event loop plus the retry ticker.
    pub async fn start(&self) -> Result<()> {
        let receivers = self
            .receivers
            .lock()
            .await
            .take()
            .ok_or(Error::ErrClosed)?;

        self.internal
            .registry
            .set_signal(Arc::new(Connection::signal(Arc::clone(
                &self.internal.signaling,
            ))))
            .await;
        self.internal
            .signaling
            .attach(self.internal.events_tx.clone())
            .await?;

        if let Some(id) = self.internal.config.peer_id.clone() {
            self.internal.adopt_id(&id).await;
        }

        {
            let mut ids = self.listener_ids.lock().await;

            macro_rules! handler {
                ($kind:expr, $method:ident) => {{
                    let internal = Arc::clone(&self.internal);
                    ids.push((
                        $kind,
                        self.internal
                            .bus
                            .on(
                                $kind,
                                Box::new(move |m| {
                                    let internal = Arc::clone(&internal);
                                    Box::pin(async move { internal.$method(m).await })
                                }),
                            )
                            .await,
                    ));
                }};
            }

            handler!(MessageType::RequestPeer, on_request_peer);
            handler!(MessageType::Offer, on_offer);
            handler!(MessageType::Answer, on_answer);
            handler!(MessageType::IceCandidate, on_remote_candidate);
        }

        if let Some(gossip) = &self.internal.gossip {
            gossip.start().await;
        }
        if let Some(media) = &self.internal.media {
            media.start().await;
        }

        let (done_tx, mut done_rx) = mpsc::channel(1);
        *self.done_tx.lock().await = Some(done_tx);

        let internal = Arc::clone(&self.internal);
        let mut events_rx = receivers.events_rx;
        let mut outbound_rx = receivers.outbound_rx;
        let tick = self.internal.config.queue_timeout;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            loop {
                tokio::select! {
                    Some(event) = events_rx.recv() => internal.handle_event(event).await,
                    Some(message) = outbound_rx.recv() => {
                        if let Err(err) = internal.send(message).await {
                            log::debug!("outbound send failed: {}", err);
                        }
                    }
                    _ = ticker.tick() => internal.queue_tick().await,
                    _ = done_rx.recv() => break,
                }
            }
        });

        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        if self.internal.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.done_tx.lock().await.take();
        if let Some(gossip) = &self.internal.gossip {
            gossip.close().await;
        }
        if let Some(media) = &self.internal.media {
            media.close().await;
        }
        for (kind, id) in self.listener_ids.lock().await.drain(..) {
            self.internal.bus.remove_listener(kind, id).await;
        }
        self.internal.registry.close_all().await;
        Ok(())
    }

    /// The identity assigned by signaling (empty until first contact).
    pub async fn id(&self) -> PeerId {
        self.internal.id.lock().await.clone()
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.internal.bus
    }

    pub fn gossip(&self) -> Option<&Arc<RpsEngine>> {
        self.internal.gossip.as_ref()
    }

    pub fn media(&self) -> Option<&Arc<MediaFetcher>> {
        self.internal.media.as_ref()
    }

    pub async fn send(&self, message: Message) -> Result<SendOutcome> {
        self.internal.send(message).await
    }

    /// Like [`Peer::send`], but a message that ends up queued expires after
    /// `timeout`, firing `on_timeout` exactly once.
    pub async fn send_with_timeout(
        &self,
        message: Message,
        timeout: Duration,
        on_timeout: OnTimeoutFn,
    ) -> Result<SendOutcome> {
        self.internal
            .send_with(message, Some(timeout), Some(on_timeout))
            .await
    }

    /// Asks the mesh (or one specific peer) for a connection back to us.
    pub async fn request_peer(&self, target: Option<&str>) -> Result<SendOutcome> {
        let self_id = self
            .internal
            .self_id()
            .await
            .ok_or_else(|| Error::Other("peer has no identity yet".to_owned()))?;
        let to = target.unwrap_or(BROADCAST_TO);
        self.internal
            .send(Message::forwardable(
                MessageType::RequestPeer,
                self_id,
                to,
                self.internal.config.ttl,
            ))
            .await
    }

    pub async fn pending_messages(&self) -> usize {
        self.internal.queue.len().await
    }

    pub async fn connection_state(&self, remote: &str) -> Option<ConnectionState> {
        self.internal
            .registry
            .get(remote)
            .await
            .map(|c| c.state())
    }

    pub async fn open_remotes(&self) -> Vec<PeerId> {
        self.internal.registry.open_remotes().await
    }
}

impl PeerInternal {
    async fn self_id(&self) -> Option<PeerId> {
        let id = self.id.lock().await.clone();
        if id.is_empty() {
            None
        } else {
            Some(id)
        }
    }

    async fn adopt_id(&self, id: &str) {
        *self.id.lock().await = id.to_owned();
        if let Some(gossip) = &self.gossip {
            gossip.set_self_id(id).await;
        }
        if let Some(media) = &self.media {
            media.set_self_id(id).await;
        }
        log::info!("peer identity: {}", id);
    }

    async fn handle_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Open { remote } => self.on_channel_open(&remote).await,
            TransportEvent::Message { remote, payload } => {
                match Message::unmarshal(&payload) {
                    Ok(message) => self.on_message(&remote, message).await,
                    Err(err) => log::warn!("undecodable frame from {}: {}", remote, err),
                }
            }
            TransportEvent::Close { remote } => self.on_channel_close(&remote).await,
            TransportEvent::IceCandidate { remote, candidate } => {
                self.on_local_candidate(&remote, candidate).await
            }
            TransportEvent::Error { remote, reason } => {
                log::warn!("transport error with {}: {}", remote, reason);
                self.registry.teardown(&remote).await;
            }
        }
    }

    /// A channel opened: promote the connection, flush everything queued
    /// for that remote (enqueue order), and announce it locally.
    async fn on_channel_open(&self, remote: &str) {
        let conn = match self.registry.get(remote).await {
            Some(c) => c,
            None => {
                log::warn!("open event for unknown connection {}", remote);
                return;
            }
        };
        conn.set_state(ConnectionState::Open);
        log::debug!("connection to {} open", remote);

        for entry in self.queue.take_for(remote).await {
            if let Err(err) = conn.send_message(&entry.message).await {
                log::warn!("flushing queued {} to {} failed: {}", entry.message.kind, remote, err);
            }
        }

        if let Some(self_id) = self.self_id().await {
            self.bus
                .dispatch(Message::new(MessageType::Connected, remote, self_id))
                .await;
        }
    }

    async fn on_channel_close(&self, remote: &str) {
        if let Some(conn) = self.registry.remove(remote).await {
            conn.set_state(ConnectionState::Closed);
            log::debug!("connection to {} closed", remote);
        }
        if let Some(self_id) = self.self_id().await {
            self.bus
                .dispatch(Message::new(MessageType::Disconnected, remote, self_id))
                .await;
        }
    }

    /// Our transport produced a candidate: trickle it to the remote.
    async fn on_local_candidate(&self, remote: &str, candidate: String) {
        let self_id = match self.self_id().await {
            Some(id) => id,
            None => return,
        };
        let message =
            Message::forwardable(MessageType::IceCandidate, self_id, remote, self.config.ttl)
                .with_data(serde_json::Value::String(candidate));
        if let Err(err) = self.send(message).await {
            log::debug!("candidate for {} undeliverable: {}", remote, err);
        }
    }

    /// One inbound envelope, from a peer channel or the signaling link.
    async fn on_message(self: &Arc<Self>, via: &str, message: Message) {
        log::trace!("{} from {} via {}", message.kind, message.from, via);

        if via == SIGNAL_ID && self.discard_signal_frame(&message).await {
            return;
        }

        let self_id = self.id.lock().await.clone();
        if message.to == self_id || message.is_broadcast() {
            self.bus.dispatch(message).await;
        } else {
            self.forward(message).await;
        }
    }

    /// The signaling-specific receive rules. Returns true when the frame
    /// was consumed (or must be discarded).
    async fn discard_signal_frame(&self, message: &Message) -> bool {
        let self_id = self.id.lock().await.clone();

        // Echo of our own broadcast through the rendezvous tier.
        if !self_id.is_empty() && message.from == self_id {
            return true;
        }

        // First contact assigns our identity and seeds the gossip view.
        if message.kind == MessageType::FirstView {
            if self_id.is_empty() {
                self.adopt_id(&message.to).await;
            }
            self.bus.dispatch(message.clone()).await;
            return true;
        }

        // Stale broadcast replays are recognizable by their sender order.
        if message.kind == MessageType::RequestPeer
            && !self_id.is_empty()
            && message.from.as_str() < self_id.as_str()
        {
            log::trace!("discarding stale request-peer from {}", message.from);
            return true;
        }

        false
    }

    /// TTL-bounded store-and-forward for messages addressed elsewhere.
    async fn forward(&self, mut message: Message) {
        if !message.kind.is_forwardable() {
            log::debug!(
                "not forwarding {} addressed to {}",
                message.kind,
                message.to
            );
            return;
        }
        let ttl = message.ttl.unwrap_or(0);
        if ttl == 0 {
            log::trace!("ttl exhausted for {} to {}", message.kind, message.to);
            return;
        }
        let self_id = match self.self_id().await {
            Some(id) => id,
            None => return,
        };

        message.ttl = Some(ttl - 1);
        message.forward_by.get_or_insert_with(Vec::new).push(self_id);

        if let Err(err) = self.send(message).await {
            log::debug!("forward failed: {}", err);
        }
    }

    pub(crate) async fn send(&self, message: Message) -> Result<SendOutcome> {
        self.send_with(message, None, None).await
    }

    /// Resolves a message along the first matching rule: local dispatch,
    /// open connection, route next-hop, broadcast (forwardable types), or
    /// the retry queue plus a `request-peer` for the missing connection.
    pub(crate) async fn send_with(
        &self,
        mut message: Message,
        timeout: Option<Duration>,
        on_timeout: Option<OnTimeoutFn>,
    ) -> Result<SendOutcome> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ErrClosed);
        }
        message.validate()?;

        let self_id = self.id.lock().await.clone();

        if !self_id.is_empty() && message.to == self_id {
            self.bus.dispatch(message).await;
            return Ok(SendOutcome::Dispatched);
        }

        if let Some(conn) = self.registry.get_open(&message.to).await {
            match conn.send_message(&message).await {
                Ok(()) => return Ok(SendOutcome::Sent),
                Err(err) => log::debug!("direct send to {} failed: {}", message.to, err),
            }
        }

        if let Some(hop) = message.route.as_ref().and_then(|r| r.last().cloned()) {
            if let Some(conn) = self.registry.get_open(&hop).await {
                if let Some(route) = message.route.as_mut() {
                    route.pop();
                }
                match conn.send_message(&message).await {
                    Ok(()) => return Ok(SendOutcome::Routed),
                    Err(err) => {
                        log::debug!("routed send via {} failed: {}", hop, err);
                        if let Some(route) = message.route.as_mut() {
                            route.push(hop);
                        }
                    }
                }
            }
        }

        if message.kind.is_forwardable() {
            return self.broadcast(message).await;
        }

        let to = message.to.clone();
        self.queue
            .push(RetryQueueEntry::new(message, timeout, on_timeout))
            .await;
        log::debug!("queued message for {}, requesting a connection", to);
        if !self_id.is_empty() {
            let request =
                Message::forwardable(MessageType::RequestPeer, self_id, to, self.config.ttl);
            if let Err(err) = self.broadcast(request).await {
                log::debug!("request-peer broadcast failed: {}", err);
            }
        }
        Ok(SendOutcome::Queued)
    }

    /// Fan-out to every open connection not already past this message;
    /// with nobody to talk to, the signaling link carries it instead, with
    /// its TTL zeroed so the rendezvous tier never re-propagates.
    async fn broadcast(&self, message: Message) -> Result<SendOutcome> {
        let skip = message.already_handled_by();
        let self_id = self.id.lock().await.clone();

        let targets: Vec<Arc<Connection>> = self
            .registry
            .open_connections()
            .await
            .into_iter()
            .filter(|c| c.remote_id() != self_id && !skip.iter().any(|id| id == c.remote_id()))
            .collect();

        if !targets.is_empty() {
            for conn in &targets {
                if let Err(err) = conn.send_message(&message).await {
                    log::debug!("broadcast to {} failed: {}", conn.remote_id(), err);
                }
            }
            return Ok(SendOutcome::Broadcast);
        }

        match self.registry.signal().await {
            Some(signal) => {
                let mut fallback = message;
                if fallback.ttl.is_some() {
                    fallback.ttl = Some(0);
                }
                signal.send_message(&fallback).await?;
                Ok(SendOutcome::Broadcast)
            }
            None => Err(Error::ErrUnknownTransport),
        }
    }

    /// One retry-queue pass: deliver what can be delivered, expire what
    /// ran out of time, keep the rest.
    async fn queue_tick(&self) {
        let entries = self.queue.drain_all().await;
        if entries.is_empty() {
            return;
        }
        let now = Instant::now();
        let mut kept = vec![];

        for mut entry in entries {
            if let Some(conn) = self.registry.get_open(&entry.message.to).await {
                if conn.send_message(&entry.message).await.is_ok() {
                    continue;
                }
            }
            if entry.expired(now) {
                log::debug!(
                    "queued {} for {} expired",
                    entry.message.kind,
                    entry.message.to
                );
                if let Some(on_timeout) = entry.on_timeout.take() {
                    on_timeout().await;
                }
                continue;
            }
            kept.push(entry);
        }

        self.queue.requeue_front(kept).await;
    }

    /// `request-peer`: the responder half of the handshake. Create the
    /// channel, offer, and send the offer back along the inverse path.
    async fn on_request_peer(self: Arc<Self>, m: Message) {
        let self_id = match self.self_id().await {
            Some(id) => id,
            None => return,
        };
        if m.from == self_id {
            return;
        }
        if self.registry.get_live(&m.from).await.is_some() {
            log::trace!("ignoring request-peer from already-known {}", m.from);
            return;
        }

        log::debug!("answering request-peer from {}", m.from);
        if let Err(err) = self.initiate_offer(&m, &self_id).await {
            log::warn!("handshake with {} failed: {}", m.from, err);
            self.registry.teardown(&m.from).await;
        }
    }

    async fn initiate_offer(&self, m: &Message, self_id: &str) -> Result<()> {
        let transport = self
            .connector
            .connect(&m.from, self.events_tx.clone())
            .await?;
        let conn = Arc::new(Connection::new(m.from.clone(), transport));
        conn.mark_initiated_offer();
        self.registry.insert(Arc::clone(&conn)).await;

        let offer = conn.transport().create_offer().await?;
        conn.transport().set_local_description(&offer).await?;

        let reply = Message::forwardable(
            MessageType::Offer,
            self_id,
            m.from.clone(),
            self.config.ttl,
        )
        .with_data(serde_json::Value::String(offer))
        .with_route(m.forward_by.clone().unwrap_or_default());
        self.send(reply).await?;
        Ok(())
    }

    /// `offer`: the requester half. Tie-break a simultaneous open by id
    /// order, then answer.
    async fn on_offer(self: Arc<Self>, m: Message) {
        let self_id = match self.self_id().await {
            Some(id) => id,
            None => return,
        };
        if m.from == self_id {
            return;
        }
        let sdp: String = match m.data_as() {
            Ok(s) => s,
            Err(err) => {
                log::warn!("offer from {} without sdp: {}", m.from, err);
                return;
            }
        };

        if let Some(existing) = self.registry.get_live(&m.from).await {
            if existing.is_open() {
                log::trace!("ignoring offer from connected {}", m.from);
                return;
            }
            if existing.initiated_offer() {
                // Both sides offered at once; the smaller id yields and
                // answers the other's offer instead.
                if self_id.as_str() < m.from.as_str() {
                    log::debug!("simultaneous open with {}, yielding", m.from);
                    self.registry.teardown(&m.from).await;
                } else {
                    log::debug!("simultaneous open with {}, keeping our offer", m.from);
                    return;
                }
            } else {
                log::trace!("ignoring duplicate offer from {}", m.from);
                return;
            }
        }

        if let Err(err) = self.accept_offer(&m, &sdp, &self_id).await {
            log::warn!("handshake with {} failed: {}", m.from, err);
            self.registry.teardown(&m.from).await;
        }
    }

    async fn accept_offer(&self, m: &Message, sdp: &str, self_id: &str) -> Result<()> {
        let transport = self
            .connector
            .connect(&m.from, self.events_tx.clone())
            .await?;
        let conn = Arc::new(Connection::new(m.from.clone(), transport));
        self.registry.insert(Arc::clone(&conn)).await;

        self.registry.apply_remote_description(&conn, sdp).await?;
        let answer = conn.transport().create_answer().await?;
        conn.transport().set_local_description(&answer).await?;

        let reply = Message::forwardable(
            MessageType::Answer,
            self_id,
            m.from.clone(),
            self.config.ttl,
        )
        .with_data(serde_json::Value::String(answer))
        .with_route(m.forward_by.clone().unwrap_or_default());
        self.send(reply).await?;
        Ok(())
    }

    /// `answer`: complete our side of the negotiation.
    async fn on_answer(self: Arc<Self>, m: Message) {
        let self_id = match self.self_id().await {
            Some(id) => id,
            None => return,
        };
        if m.from == self_id {
            return;
        }
        let sdp: String = match m.data_as() {
            Ok(s) => s,
            Err(err) => {
                log::warn!("answer from {} without sdp: {}", m.from, err);
                return;
            }
        };

        match self.registry.get_live(&m.from).await {
            Some(conn) if conn.initiated_offer() && !conn.is_open() => {
                if let Err(err) = self.registry.apply_remote_description(&conn, &sdp).await {
                    log::warn!("handshake with {} failed: {}", m.from, err);
                    self.registry.teardown(&m.from).await;
                }
            }
            _ => log::debug!("unexpected answer from {}", m.from),
        }
    }

    /// `icecandidate`: apply directly once the remote description is in,
    /// buffer otherwise.
    async fn on_remote_candidate(self: Arc<Self>, m: Message) {
        let candidate: String = match m.data_as() {
            Ok(c) => c,
            Err(err) => {
                log::warn!("candidate from {} undecodable: {}", m.from, err);
                return;
            }
        };

        match self.registry.get_live(&m.from).await {
            Some(conn) if conn.remote_described() => {
                if let Err(err) = conn.transport().add_ice_candidate(&candidate).await {
                    log::warn!("candidate from {} rejected: {}", m.from, err);
                }
            }
            _ => {
                log::trace!("buffering early candidate from {}", m.from);
                self.registry.buffer_candidate(&m.from, candidate).await;
            }
        }
    }
}
