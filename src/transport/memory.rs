use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};

use super::{SignalingLink, TransportConnection, TransportConnector, TransportEvent, SIGNAL_ID};
use crate::error::{Error, Result};
use crate::message::{Message, MessageType, PeerId};

/// In-process transport fabric. Plays the role a WebRTC stack plays in a
/// browser deployment: it pairs per-peer duplex channels, walks them
/// through a simulated offer/answer/ICE dance, and routes signaling frames
/// between every attached peer. Deterministic, ordered and reliable, which
/// is exactly what multi-peer tests need.
#[derive(Default)]
pub struct MemoryRouter {
    inner: Mutex<RouterInner>,
}

#[derive(Default)]
struct RouterInner {
    /// Directed endpoints, keyed (local, remote). A live pair has both
    /// directions present.
    conns: HashMap<(PeerId, PeerId), Arc<MemoryConnection>>,
    /// Event channels of peers attached to the signaling tier.
    attached: HashMap<PeerId, mpsc::Sender<TransportEvent>>,
    /// Attachment order, for deterministic broadcast delivery.
    attach_order: Vec<PeerId>,
    next_assigned: u32,
}

impl MemoryRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(MemoryRouter::default())
    }

    /// A connector producing channels owned by `local_id`.
    pub fn connector(self: &Arc<Self>, local_id: impl Into<PeerId>) -> MemoryConnector {
        MemoryConnector {
            local: local_id.into(),
            router: Arc::clone(self),
        }
    }

    /// A signaling link for one peer. With `preset` the service assigns
    /// that id, otherwise it hands out `peer-<n>`.
    pub fn signaling(self: &Arc<Self>, preset: Option<&str>) -> MemorySignaling {
        MemorySignaling {
            router: Arc::clone(self),
            preset: preset.map(|s| s.to_owned()),
            local: Mutex::new(None),
        }
    }

    async fn register(
        &self,
        local: PeerId,
        remote: PeerId,
        conn: Arc<MemoryConnection>,
    ) {
        let mut inner = self.inner.lock().await;
        inner.conns.insert((local, remote), conn);
    }

    /// Opens the pair once both directions exist and both ends have both
    /// descriptions applied.
    async fn maybe_open(&self, a: &str, b: &str) {
        let opened = {
            let inner = self.inner.lock().await;
            let ab = inner.conns.get(&(a.to_owned(), b.to_owned()));
            let ba = inner.conns.get(&(b.to_owned(), a.to_owned()));
            match (ab, ba) {
                (Some(ab), Some(ba)) => {
                    if ab.negotiated().await
                        && ba.negotiated().await
                        && !ab.open.swap(true, Ordering::SeqCst)
                    {
                        ba.open.store(true, Ordering::SeqCst);
                        Some((Arc::clone(ab), Arc::clone(ba)))
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };

        if let Some((ab, ba)) = opened {
            let _ = ab
                .events
                .send(TransportEvent::Open {
                    remote: ab.remote.clone(),
                })
                .await;
            let _ = ba
                .events
                .send(TransportEvent::Open {
                    remote: ba.remote.clone(),
                })
                .await;
        }
    }

    async fn deliver(&self, from: &str, to: &str, payload: Bytes) -> Result<()> {
        let target = {
            let inner = self.inner.lock().await;
            inner
                .conns
                .get(&(to.to_owned(), from.to_owned()))
                .map(|c| (Arc::clone(c), c.events.clone()))
        };
        match target {
            Some((conn, events)) if conn.open.load(Ordering::SeqCst) => {
                events
                    .send(TransportEvent::Message {
                        remote: from.to_owned(),
                        payload,
                    })
                    .await
                    .map_err(|_| Error::ErrUnknownTransport)
            }
            _ => Err(Error::ErrUnknownTransport),
        }
    }

    async fn drop_pair(&self, a: &str, b: &str) {
        let (ab, ba) = {
            let mut inner = self.inner.lock().await;
            (
                inner.conns.remove(&(a.to_owned(), b.to_owned())),
                inner.conns.remove(&(b.to_owned(), a.to_owned())),
            )
        };
        for conn in [ab, ba].into_iter().flatten() {
            conn.open.store(false, Ordering::SeqCst);
            conn.closed.store(true, Ordering::SeqCst);
            let _ = conn
                .events
                .send(TransportEvent::Close {
                    remote: conn.remote.clone(),
                })
                .await;
        }
    }
}

pub struct MemoryConnector {
    local: PeerId,
    router: Arc<MemoryRouter>,
}

#[async_trait]
impl TransportConnector for MemoryConnector {
    async fn connect(
        &self,
        remote_id: &str,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Arc<dyn TransportConnection>> {
        let conn = Arc::new(MemoryConnection {
            local: self.local.clone(),
            remote: remote_id.to_owned(),
            events,
            router: Arc::downgrade(&self.router),
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            negotiation: Mutex::new(Negotiation::default()),
        });
        self.router
            .register(self.local.clone(), remote_id.to_owned(), Arc::clone(&conn))
            .await;
        Ok(conn)
    }
}

#[derive(Default)]
struct Negotiation {
    local_desc: Option<String>,
    remote_desc: Option<String>,
    remote_candidates: Vec<String>,
}

pub struct MemoryConnection {
    local: PeerId,
    remote: PeerId,
    events: mpsc::Sender<TransportEvent>,
    router: Weak<MemoryRouter>,
    open: AtomicBool,
    closed: AtomicBool,
    negotiation: Mutex<Negotiation>,
}

impl MemoryConnection {
    async fn negotiated(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let n = self.negotiation.lock().await;
        n.local_desc.is_some() && n.remote_desc.is_some()
    }

    fn router(&self) -> Result<Arc<MemoryRouter>> {
        self.router.upgrade().ok_or(Error::ErrClosed)
    }

    pub async fn remote_candidate_count(&self) -> usize {
        self.negotiation.lock().await.remote_candidates.len()
    }
}

#[async_trait]
impl TransportConnection for MemoryConnection {
    async fn create_offer(&self) -> Result<String> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ErrClosed);
        }
        Ok(format!("sdp:offer:{}:{}", self.local, self.remote))
    }

    async fn create_answer(&self) -> Result<String> {
        let n = self.negotiation.lock().await;
        if n.remote_desc.is_none() {
            return Err(Error::ErrHandshakeFailure(
                "answer without remote offer".to_owned(),
            ));
        }
        Ok(format!("sdp:answer:{}:{}", self.local, self.remote))
    }

    async fn set_local_description(&self, sdp: &str) -> Result<()> {
        {
            let mut n = self.negotiation.lock().await;
            n.local_desc = Some(sdp.to_owned());
        }
        // Trickle two synthetic candidates to the owning peer.
        for i in 0..2 {
            let _ = self
                .events
                .send(TransportEvent::IceCandidate {
                    remote: self.remote.clone(),
                    candidate: format!("candidate:{}:{}", self.local, i),
                })
                .await;
        }
        self.router()?.maybe_open(&self.local, &self.remote).await;
        Ok(())
    }

    async fn set_remote_description(&self, sdp: &str) -> Result<()> {
        {
            let mut n = self.negotiation.lock().await;
            n.remote_desc = Some(sdp.to_owned());
        }
        self.router()?.maybe_open(&self.local, &self.remote).await;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &str) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ErrClosed);
        }
        let mut n = self.negotiation.lock().await;
        n.remote_candidates.push(candidate.to_owned());
        Ok(())
    }

    async fn send(&self, payload: Bytes) -> Result<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(Error::ErrUnknownTransport);
        }
        self.router()?
            .deliver(&self.local, &self.remote, payload)
            .await
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let router = self.router()?;
        if self.open.load(Ordering::SeqCst) {
            router.drop_pair(&self.local, &self.remote).await;
        } else {
            // Discarding a never-opened connection (e.g. the yielding side
            // of a simultaneous open) must not disturb the counterpart's
            // in-flight handshake.
            let mut inner = router.inner.lock().await;
            if let Some(existing) = inner.conns.get(&(self.local.clone(), self.remote.clone())) {
                if std::ptr::eq(existing.as_ref(), self) {
                    inner.conns.remove(&(self.local.clone(), self.remote.clone()));
                }
            }
        }
        Ok(())
    }
}

/// The rendezvous tier of the in-memory fabric. Routes envelopes between
/// attached peers: a frame for a known peer goes to that peer alone, every
/// other frame is fanned out to all attached peers (including the sender,
/// so the echo-discard rule gets exercised).
pub struct MemorySignaling {
    router: Arc<MemoryRouter>,
    preset: Option<PeerId>,
    local: Mutex<Option<PeerId>>,
}

#[async_trait]
impl SignalingLink for MemorySignaling {
    async fn attach(&self, events: mpsc::Sender<TransportEvent>) -> Result<()> {
        let (assigned, others) = {
            let mut inner = self.router.inner.lock().await;
            let assigned = match self.preset {
                Some(ref id) => id.clone(),
                None => {
                    inner.next_assigned += 1;
                    format!("peer-{}", inner.next_assigned)
                }
            };
            let others: Vec<PeerId> = inner.attach_order.clone();
            inner.attached.insert(assigned.clone(), events.clone());
            inner.attach_order.push(assigned.clone());
            (assigned, others)
        };
        *self.local.lock().await = Some(assigned.clone());

        // First contact: hand out the assigned id and seed descriptors for
        // every peer already known to the rendezvous service.
        let descriptors: Vec<serde_json::Value> = others
            .iter()
            .map(|id| serde_json::json!({ "id": id, "age": 0 }))
            .collect();
        let first_view = Message::new(MessageType::FirstView, SIGNAL_ID, assigned)
            .with_data(serde_json::Value::Array(descriptors));
        events
            .send(TransportEvent::Message {
                remote: SIGNAL_ID.to_owned(),
                payload: first_view.marshal()?,
            })
            .await
            .map_err(|_| Error::ErrClosed)
    }

    async fn send(&self, payload: Bytes) -> Result<()> {
        let message = Message::unmarshal(&payload)?;
        let targets = {
            let inner = self.router.inner.lock().await;
            match inner.attached.get(&message.to) {
                Some(events) => vec![events.clone()],
                None => inner
                    .attach_order
                    .iter()
                    .filter_map(|id| inner.attached.get(id).cloned())
                    .collect(),
            }
        };
        for events in targets {
            let _ = events
                .send(TransportEvent::Message {
                    remote: SIGNAL_ID.to_owned(),
                    payload: payload.clone(),
                })
                .await;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(id) = self.local.lock().await.take() {
            let mut inner = self.router.inner.lock().await;
            inner.attached.remove(&id);
            inner.attach_order.retain(|other| *other != id);
        }
        Ok(())
    }
}
