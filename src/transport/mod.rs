pub mod memory;


use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::message::PeerId;

/// Registry key of the signaling entry. Not a routable peer id.
pub const SIGNAL_ID: &str = "signal";

/// What a duplex transport reports back to its owning peer. All events of
/// all connections funnel into one channel, whose single consumer is the
/// peer's event loop; that is what serializes dispatch.
#[derive(Debug)]
pub enum TransportEvent {
    /// The channel to `remote` reached the open state.
    Open { remote: PeerId },
    /// One transport message arrived from `remote` (or from the signaling
    /// tier when `remote` is [`SIGNAL_ID`]).
    Message { remote: PeerId, payload: Bytes },
    /// The channel to `remote` closed.
    Close { remote: PeerId },
    /// The local transport produced an ICE candidate for the in-flight
    /// handshake with `remote`.
    IceCandidate { remote: PeerId, candidate: String },
    /// The transport gave up on `remote` (SDP or ICE failure).
    Error { remote: PeerId, reason: String },
}

/// One message-oriented, ordered, reliable duplex channel to a single
/// remote peer. SDP descriptions and ICE candidates are opaque strings;
/// the core never looks inside them.
#[async_trait]
pub trait TransportConnection: Send + Sync {
    async fn create_offer(&self) -> Result<String>;
    async fn create_answer(&self) -> Result<String>;
    async fn set_local_description(&self, sdp: &str) -> Result<()>;
    async fn set_remote_description(&self, sdp: &str) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: &str) -> Result<()>;
    async fn send(&self, payload: Bytes) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// Factory for per-remote channels. `events` is the owning peer's event
/// channel; everything the new channel reports goes through it.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(
        &self,
        remote_id: &str,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Arc<dyn TransportConnection>>;
}

/// The single bidirectional link to the rendezvous service. Carries the
/// same envelope as peer channels; inbound frames surface as
/// [`TransportEvent::Message`] with `remote == SIGNAL_ID`.
#[async_trait]
pub trait SignalingLink: Send + Sync {
    /// Starts delivering inbound frames to `events`. The service answers a
    /// fresh attachment with a `first-view` carrying the assigned peer id.
    async fn attach(&self, events: mpsc::Sender<TransportEvent>) -> Result<()>;
    async fn send(&self, payload: Bytes) -> Result<()>;
    async fn close(&self) -> Result<()>;
}
