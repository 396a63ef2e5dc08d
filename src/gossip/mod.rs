
pub mod descriptor;
pub mod gossip_config;
pub mod view;

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

pub use descriptor::{DescriptorUpdate, NodeDescriptor};
pub use gossip_config::GossipConfig;
pub use view::{GossipThread, SelectionPolicy, View};

use crate::bus::{ListenerId, MessageBus};
use crate::message::{Message, MessageType, PeerId};
use view::{gen_buffer, increment_age, merge_view, select_remote_peer};

/// Random peer sampling engine. An active task periodically exchanges view
/// buffers with one remote; a passive handler answers the exchanges others
/// start. Both converge every node's view towards a uniform random sample
/// of the network.
///
/// The engine owns the view and publishes it only as whole-value
/// `gossip:view-update` snapshots on the bus; nothing else mutates it.
pub struct RpsEngine {
    internal: Arc<RpsInternal>,
    done_tx: Mutex<Option<mpsc::Sender<()>>>,
    listener_ids: Mutex<Vec<(MessageType, ListenerId)>>,
}

pub(crate) struct RpsInternal {
    config: GossipConfig,
    bus: Arc<MessageBus>,
    outbound: mpsc::UnboundedSender<Message>,
    self_id: Mutex<PeerId>,
    descriptor: Mutex<NodeDescriptor>,
    view: Mutex<View>,
    /// Listener awaiting the answer of the in-flight active exchange.
    /// Cleared when the answer lands, abandoned at the next tick otherwise.
    pending_exchange: Mutex<Option<ListenerId>>,
}

impl RpsEngine {
    pub fn new(
        config: GossipConfig,
        bus: Arc<MessageBus>,
        outbound: mpsc::UnboundedSender<Message>,
    ) -> Self {
        RpsEngine {
            internal: Arc::new(RpsInternal {
                config,
                bus,
                outbound,
                self_id: Mutex::new(String::new()),
                descriptor: Mutex::new(NodeDescriptor::new("")),
                view: Mutex::new(vec![]),
                pending_exchange: Mutex::new(None),
            }),
            done_tx: Mutex::new(None),
            listener_ids: Mutex::new(vec![]),
        }
    }

    /// Adopts the identity assigned by the signaling service.
    pub async fn set_self_id(&self, id: &str) {
        *self.internal.self_id.lock().await = id.to_owned();
        self.internal.descriptor.lock().await.id = id.to_owned();
    }

    pub async fn view(&self) -> View {
        self.internal.view.lock().await.clone()
    }

    pub async fn descriptor(&self) -> NodeDescriptor {
        self.internal.descriptor.lock().await.clone()
    }

    /// Registers the passive handlers and spawns the active task.
    pub async fn start(&self) {
        let mut ids = self.listener_ids.lock().await;

        let internal = Arc::clone(&self.internal);
        ids.push((
            MessageType::FirstView,
            self.internal
                .bus
                .on(
                    MessageType::FirstView,
                    Box::new(move |m| {
                        let internal = Arc::clone(&internal);
                        Box::pin(async move { internal.on_first_view(m).await })
                    }),
                )
                .await,
        ));

        let internal = Arc::clone(&self.internal);
        ids.push((
            MessageType::GossipRequestExchange,
            self.internal
                .bus
                .on(
                    MessageType::GossipRequestExchange,
                    Box::new(move |m| {
                        let internal = Arc::clone(&internal);
                        Box::pin(async move { internal.on_request_exchange(m).await })
                    }),
                )
                .await,
        ));

        let internal = Arc::clone(&self.internal);
        ids.push((
            MessageType::GossipDescriptorUpdate,
            self.internal
                .bus
                .on(
                    MessageType::GossipDescriptorUpdate,
                    Box::new(move |m| {
                        let internal = Arc::clone(&internal);
                        Box::pin(async move { internal.on_descriptor_update(m).await })
                    }),
                )
                .await,
        ));

        let (done_tx, mut done_rx) = mpsc::channel(1);
        *self.done_tx.lock().await = Some(done_tx);

        let internal = Arc::clone(&self.internal);
        let period = self.internal.config.gossip_period;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => internal.active_round().await,
                    _ = done_rx.recv() => break,
                }
            }
        });
    }

    pub async fn close(&self) {
        self.done_tx.lock().await.take();
        let bus = &self.internal.bus;
        for (kind, id) in self.listener_ids.lock().await.drain(..) {
            bus.remove_listener(kind, id).await;
        }
        if let Some(id) = self.internal.pending_exchange.lock().await.take() {
            bus.remove_listener(MessageType::GossipAnswerExchange, id)
                .await;
        }
    }
}

impl RpsInternal {
    async fn self_id(&self) -> Option<PeerId> {
        let id = self.self_id.lock().await.clone();
        if id.is_empty() {
            None
        } else {
            Some(id)
        }
    }

    /// One tick of the active thread.
    async fn active_round(self: &Arc<Self>) {
        // An exchange still waiting from the previous tick is abandoned.
        if let Some(id) = self.pending_exchange.lock().await.take() {
            self.bus
                .remove_listener(MessageType::GossipAnswerExchange, id)
                .await;
            log::debug!("gossip exchange went unanswered, abandoning it");
        }

        let self_id = match self.self_id().await {
            Some(id) => id,
            None => return,
        };

        let (remote, buffer) = {
            let view = self.view.lock().await;
            if view.is_empty() {
                return;
            }
            let remote = match select_remote_peer(self.config.policy, &view) {
                Some(d) => d.id.clone(),
                None => return,
            };
            let own = self.descriptor.lock().await.clone();
            let buffer = gen_buffer(
                GossipThread::Active,
                &remote,
                &own,
                &view,
                self.config.view_size,
                self.config.healing,
            );
            (remote, buffer)
        };

        let data = match serde_json::to_value(&buffer) {
            Ok(v) => v,
            Err(err) => {
                log::error!("failed to encode gossip buffer: {}", err);
                return;
            }
        };
        let request = Message::new(
            MessageType::GossipRequestExchange,
            self_id.clone(),
            remote.clone(),
        )
        .with_data(data);

        // Listener goes in before the request leaves, so a fast answer
        // cannot slip past it.
        let internal = Arc::clone(self);
        let sent = buffer;
        let sid = self_id.clone();
        let listener_id = self
            .bus
            .once_from(
                MessageType::GossipAnswerExchange,
                remote.clone(),
                Box::new(move |m| {
                    let internal = Arc::clone(&internal);
                    let sent = sent.clone();
                    let sid = sid.clone();
                    Box::pin(async move {
                        internal.pending_exchange.lock().await.take();
                        match m.data_as::<View>() {
                            Ok(received) => {
                                internal.merge_and_publish(&received, &sent, &sid, true).await
                            }
                            Err(err) => log::warn!("bad gossip answer payload: {}", err),
                        }
                    })
                }),
            )
            .await;
        *self.pending_exchange.lock().await = Some(listener_id);

        log::trace!("gossip exchange with {}", remote);
        if self.outbound.send(request).is_err() {
            log::debug!("peer loop gone, dropping gossip request");
        }
    }

    /// The passive thread: answer, then merge what was received.
    async fn on_request_exchange(&self, m: Message) {
        let self_id = match self.self_id().await {
            Some(id) => id,
            None => return,
        };
        let received: View = match m.data_as() {
            Ok(v) => v,
            Err(err) => {
                log::warn!("bad gossip request payload: {}", err);
                return;
            }
        };

        let buffer = {
            let view = self.view.lock().await;
            let own = self.descriptor.lock().await.clone();
            gen_buffer(
                GossipThread::Passive,
                &m.from,
                &own,
                &view,
                self.config.view_size,
                self.config.healing,
            )
        };

        match serde_json::to_value(&buffer) {
            Ok(data) => {
                let answer = Message::new(
                    MessageType::GossipAnswerExchange,
                    self_id.clone(),
                    m.from.clone(),
                )
                .with_data(data);
                if self.outbound.send(answer).is_err() {
                    log::debug!("peer loop gone, dropping gossip answer");
                }
            }
            Err(err) => log::error!("failed to encode gossip buffer: {}", err),
        }

        self.merge_and_publish(&received, &buffer, &self_id, true).await;
    }

    /// Bootstrap descriptors from the signaling tier seed the view as-is,
    /// without an aging pass.
    async fn on_first_view(&self, m: Message) {
        // The peer adopts the assigned id before this dispatch runs; the
        // fallback covers an engine driven without one.
        let self_id = match self.self_id().await {
            Some(id) => id,
            None => m.to.clone(),
        };
        let received: View = match m.data_as() {
            Ok(v) => v,
            Err(err) => {
                log::warn!("bad first-view payload: {}", err);
                return;
            }
        };
        if received.is_empty() {
            return;
        }
        self.merge_and_publish(&received, &[], &self_id, false).await;
    }

    async fn on_descriptor_update(&self, m: Message) {
        let update: DescriptorUpdate = match m.data_as() {
            Ok(u) => u,
            Err(err) => {
                log::warn!("bad descriptor update payload: {}", err);
                return;
            }
        };
        self.descriptor
            .lock()
            .await
            .set_extension(&update.path, update.value);
    }

    /// Merges against the view as it is *now*, not as it was when the
    /// exchange started; concurrent passive exchanges may have run in
    /// between. The sent buffer travels by value so swap-pruning stays
    /// well-defined.
    async fn merge_and_publish(&self, received: &View, sent: &[NodeDescriptor], self_id: &str, age: bool) {
        let snapshot = {
            let mut view = self.view.lock().await;
            let mut merged = merge_view(
                received,
                sent,
                &view,
                self_id,
                self.config.view_size,
                self.config.healing,
                self.config.swap,
            );
            if age {
                increment_age(&mut merged);
            }
            assert!(
                merged.len() <= self.config.view_size,
                "view exceeds C after merge"
            );
            *view = merged.clone();
            merged
        };

        match serde_json::to_value(&snapshot) {
            Ok(data) => {
                let update =
                    Message::new(MessageType::GossipViewUpdate, self_id, self_id).with_data(data);
                self.bus.dispatch(update).await;
            }
            Err(err) => log::error!("failed to encode view snapshot: {}", err),
        }
    }
}
