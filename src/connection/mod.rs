#[cfg(test)]
mod connection_test;

pub mod registry;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{Error, Result};
use crate::message::{Message, PeerId};
use crate::transport::{SignalingLink, TransportConnection, SIGNAL_ID};

/// ConnectionState tracks one remote across the offer/answer handshake.
/// `Closed` is terminal; a later handshake with the same remote gets a
/// fresh `Connection`.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum ConnectionState {
    Unspecified = 0,

    /// The handshake is in flight: an offer or answer has been exchanged
    /// but the data channel has not opened yet.
    Connecting,

    /// The data channel is open and messages flow.
    Open,

    /// The channel closed or the handshake was abandoned.
    Closed,
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Unspecified
    }
}

const CONNECTION_STATE_CONNECTING_STR: &str = "connecting";
const CONNECTION_STATE_OPEN_STR: &str = "open";
const CONNECTION_STATE_CLOSED_STR: &str = "close";

impl From<&str> for ConnectionState {
    fn from(raw: &str) -> Self {
        match raw {
            CONNECTION_STATE_CONNECTING_STR => ConnectionState::Connecting,
            CONNECTION_STATE_OPEN_STR => ConnectionState::Open,
            CONNECTION_STATE_CLOSED_STR => ConnectionState::Closed,
            _ => ConnectionState::Unspecified,
        }
    }
}

impl From<u8> for ConnectionState {
    fn from(v: u8) -> Self {
        match v {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Open,
            3 => ConnectionState::Closed,
            _ => ConnectionState::Unspecified,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            ConnectionState::Connecting => CONNECTION_STATE_CONNECTING_STR,
            ConnectionState::Open => CONNECTION_STATE_OPEN_STR,
            ConnectionState::Closed => CONNECTION_STATE_CLOSED_STR,
            ConnectionState::Unspecified => "unspecified",
        };
        write!(f, "{}", s)
    }
}

/// One negotiated channel to a remote peer, or the distinguished signaling
/// entry. Owns outbound sends; open/close events surface on the peer's
/// event loop, which updates the state here.
pub struct Connection {
    remote_id: PeerId,
    state: AtomicU8,
    /// Set on the side that created the channel and sent the offer; the
    /// simultaneous-open tie-break needs to know which side we were.
    initiated_offer: AtomicBool,
    /// Whether the remote description has been applied; candidates arriving
    /// earlier must be buffered.
    remote_described: AtomicBool,
    transport: Arc<dyn TransportConnection>,
}

impl Connection {
    pub fn new(remote_id: impl Into<PeerId>, transport: Arc<dyn TransportConnection>) -> Self {
        Connection {
            remote_id: remote_id.into(),
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            initiated_offer: AtomicBool::new(false),
            remote_described: AtomicBool::new(false),
            transport,
        }
    }

    /// Wraps the signaling link as the always-open `signal` registry entry.
    pub fn signal(link: Arc<dyn SignalingLink>) -> Self {
        let conn = Connection::new(SIGNAL_ID, Arc::new(SignalingAdapter { link }));
        conn.set_state(ConnectionState::Open);
        conn
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn is_signal(&self) -> bool {
        self.remote_id == SIGNAL_ID
    }

    pub fn state(&self) -> ConnectionState {
        self.state.load(Ordering::SeqCst).into()
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn mark_initiated_offer(&self) {
        self.initiated_offer.store(true, Ordering::SeqCst);
    }

    pub fn initiated_offer(&self) -> bool {
        self.initiated_offer.load(Ordering::SeqCst)
    }

    pub fn mark_remote_described(&self) {
        self.remote_described.store(true, Ordering::SeqCst);
    }

    pub fn remote_described(&self) -> bool {
        self.remote_described.load(Ordering::SeqCst)
    }

    pub fn transport(&self) -> &Arc<dyn TransportConnection> {
        &self.transport
    }

    /// Serializes the envelope and hands it to the transport. Refused
    /// unless the connection is open.
    pub async fn send_message(&self, message: &Message) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ErrUnknownTransport);
        }
        self.transport.send(message.marshal()?).await
    }

    pub async fn close(&self) -> Result<()> {
        self.set_state(ConnectionState::Closed);
        self.transport.close().await
    }
}

/// Presents the signaling link through the transport-connection interface
/// so the registry can hold it next to peer channels. Negotiation makes no
/// sense on it and is refused.
struct SignalingAdapter {
    link: Arc<dyn SignalingLink>,
}

#[async_trait]
impl TransportConnection for SignalingAdapter {
    async fn create_offer(&self) -> Result<String> {
        Err(Error::ErrSignalingNegotiation)
    }

    async fn create_answer(&self) -> Result<String> {
        Err(Error::ErrSignalingNegotiation)
    }

    async fn set_local_description(&self, _sdp: &str) -> Result<()> {
        Err(Error::ErrSignalingNegotiation)
    }

    async fn set_remote_description(&self, _sdp: &str) -> Result<()> {
        Err(Error::ErrSignalingNegotiation)
    }

    async fn add_ice_candidate(&self, _candidate: &str) -> Result<()> {
        Err(Error::ErrSignalingNegotiation)
    }

    async fn send(&self, payload: Bytes) -> Result<()> {
        self.link.send(payload).await
    }

    async fn close(&self) -> Result<()> {
        self.link.close().await
    }
}
