
use std::fmt;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Opaque peer identity, assigned by the signaling service on first contact.
pub type PeerId = String;

/// Wire sentinel for a broadcast destination. Kept as a string uniformly,
/// matching the envelope's other id fields.
pub const BROADCAST_TO: &str = "-1";

const MESSAGE_TYPE_REQUEST_PEER_STR: &str = "request-peer";
const MESSAGE_TYPE_OFFER_STR: &str = "offer";
const MESSAGE_TYPE_ANSWER_STR: &str = "answer";
const MESSAGE_TYPE_ICE_CANDIDATE_STR: &str = "icecandidate";
const MESSAGE_TYPE_FIRST_VIEW_STR: &str = "first-view";
const MESSAGE_TYPE_GOSSIP_REQUEST_EXCHANGE_STR: &str = "gossip:request-exchange";
const MESSAGE_TYPE_GOSSIP_ANSWER_EXCHANGE_STR: &str = "gossip:answer-exchange";
const MESSAGE_TYPE_GOSSIP_VIEW_UPDATE_STR: &str = "gossip:view-update";
const MESSAGE_TYPE_GOSSIP_DESCRIPTOR_UPDATE_STR: &str = "gossip:descriptor-update";
const MESSAGE_TYPE_MEDIA_REQUEST_METADATA_STR: &str = "media:request-metadata";
const MESSAGE_TYPE_MEDIA_METADATA_STR: &str = "media:metadata";
const MESSAGE_TYPE_MEDIA_REQUEST_HEAD_STR: &str = "media:request-head";
const MESSAGE_TYPE_MEDIA_HEAD_STR: &str = "media:head";
const MESSAGE_TYPE_MEDIA_REQUEST_PART_STR: &str = "media:request-part";
const MESSAGE_TYPE_MEDIA_PART_STR: &str = "media:part";
const MESSAGE_TYPE_CONNECTED_STR: &str = "connected";
const MESSAGE_TYPE_DISCONNECTED_STR: &str = "disconnected";

/// The closed set of wire tags understood by the mesh.
///
/// Connection-related types are the only forwardable ones; gossip and media
/// types travel a single hop between already-connected pairs; `connected`
/// and `disconnected` never leave the local bus.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    Unspecified,

    /// Asks any reachable peer (or one specific peer) to open a connection
    /// back to the sender.
    RequestPeer,
    /// SDP offer answering a `request-peer`.
    Offer,
    /// SDP answer accepting an offer.
    Answer,
    /// A trickled ICE candidate for an in-flight handshake.
    IceCandidate,

    /// Bootstrap message from the signaling tier carrying the assigned peer
    /// id and an initial set of descriptors.
    FirstView,
    GossipRequestExchange,
    GossipAnswerExchange,
    GossipViewUpdate,
    GossipDescriptorUpdate,

    MediaRequestMetadata,
    MediaMetadata,
    MediaRequestHead,
    MediaHead,
    MediaRequestPart,
    MediaPart,

    /// Local event: a connection to `from` reached the open state.
    Connected,
    /// Local event: the connection to `from` closed.
    Disconnected,
}

impl Default for MessageType {
    fn default() -> Self {
        MessageType::Unspecified
    }
}

impl From<&str> for MessageType {
    fn from(raw: &str) -> Self {
        match raw {
            MESSAGE_TYPE_REQUEST_PEER_STR => MessageType::RequestPeer,
            MESSAGE_TYPE_OFFER_STR => MessageType::Offer,
            MESSAGE_TYPE_ANSWER_STR => MessageType::Answer,
            MESSAGE_TYPE_ICE_CANDIDATE_STR => MessageType::IceCandidate,
            MESSAGE_TYPE_FIRST_VIEW_STR => MessageType::FirstView,
            MESSAGE_TYPE_GOSSIP_REQUEST_EXCHANGE_STR => MessageType::GossipRequestExchange,
            MESSAGE_TYPE_GOSSIP_ANSWER_EXCHANGE_STR => MessageType::GossipAnswerExchange,
            MESSAGE_TYPE_GOSSIP_VIEW_UPDATE_STR => MessageType::GossipViewUpdate,
            MESSAGE_TYPE_GOSSIP_DESCRIPTOR_UPDATE_STR => MessageType::GossipDescriptorUpdate,
            MESSAGE_TYPE_MEDIA_REQUEST_METADATA_STR => MessageType::MediaRequestMetadata,
            MESSAGE_TYPE_MEDIA_METADATA_STR => MessageType::MediaMetadata,
            MESSAGE_TYPE_MEDIA_REQUEST_HEAD_STR => MessageType::MediaRequestHead,
            MESSAGE_TYPE_MEDIA_HEAD_STR => MessageType::MediaHead,
            MESSAGE_TYPE_MEDIA_REQUEST_PART_STR => MessageType::MediaRequestPart,
            MESSAGE_TYPE_MEDIA_PART_STR => MessageType::MediaPart,
            MESSAGE_TYPE_CONNECTED_STR => MessageType::Connected,
            MESSAGE_TYPE_DISCONNECTED_STR => MessageType::Disconnected,
            _ => MessageType::Unspecified,
        }
    }
}

impl From<String> for MessageType {
    fn from(raw: String) -> Self {
        MessageType::from(raw.as_str())
    }
}

impl From<MessageType> for String {
    fn from(t: MessageType) -> Self {
        t.to_string()
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            MessageType::RequestPeer => MESSAGE_TYPE_REQUEST_PEER_STR,
            MessageType::Offer => MESSAGE_TYPE_OFFER_STR,
            MessageType::Answer => MESSAGE_TYPE_ANSWER_STR,
            MessageType::IceCandidate => MESSAGE_TYPE_ICE_CANDIDATE_STR,
            MessageType::FirstView => MESSAGE_TYPE_FIRST_VIEW_STR,
            MessageType::GossipRequestExchange => MESSAGE_TYPE_GOSSIP_REQUEST_EXCHANGE_STR,
            MessageType::GossipAnswerExchange => MESSAGE_TYPE_GOSSIP_ANSWER_EXCHANGE_STR,
            MessageType::GossipViewUpdate => MESSAGE_TYPE_GOSSIP_VIEW_UPDATE_STR,
            MessageType::GossipDescriptorUpdate => MESSAGE_TYPE_GOSSIP_DESCRIPTOR_UPDATE_STR,
            MessageType::MediaRequestMetadata => MESSAGE_TYPE_MEDIA_REQUEST_METADATA_STR,
            MessageType::MediaMetadata => MESSAGE_TYPE_MEDIA_METADATA_STR,
            MessageType::MediaRequestHead => MESSAGE_TYPE_MEDIA_REQUEST_HEAD_STR,
            MessageType::MediaHead => MESSAGE_TYPE_MEDIA_HEAD_STR,
            MessageType::MediaRequestPart => MESSAGE_TYPE_MEDIA_REQUEST_PART_STR,
            MessageType::MediaPart => MESSAGE_TYPE_MEDIA_PART_STR,
            MessageType::Connected => MESSAGE_TYPE_CONNECTED_STR,
            MessageType::Disconnected => MESSAGE_TYPE_DISCONNECTED_STR,
            MessageType::Unspecified => "unspecified",
        };
        write!(f, "{}", s)
    }
}

impl MessageType {
    /// Whether TTL-bounded mesh forwarding applies to this type.
    pub fn is_forwardable(&self) -> bool {
        matches!(
            *self,
            MessageType::RequestPeer
                | MessageType::Offer
                | MessageType::Answer
                | MessageType::IceCandidate
        )
    }

    pub fn is_gossip(&self) -> bool {
        matches!(
            *self,
            MessageType::FirstView
                | MessageType::GossipRequestExchange
                | MessageType::GossipAnswerExchange
                | MessageType::GossipViewUpdate
                | MessageType::GossipDescriptorUpdate
        )
    }

    pub fn is_media(&self) -> bool {
        matches!(
            *self,
            MessageType::MediaRequestMetadata
                | MessageType::MediaMetadata
                | MessageType::MediaRequestHead
                | MessageType::MediaHead
                | MessageType::MediaRequestPart
                | MessageType::MediaPart
        )
    }

    /// Local events are dispatched on the bus but never serialized.
    pub fn is_local_event(&self) -> bool {
        matches!(*self, MessageType::Connected | MessageType::Disconnected)
    }
}

/// The single on-wire envelope. One JSON object per transport message.
///
/// Only `type`, `from` and `to` are always present; `ttl` and `forwardBy`
/// are mandatory for forwardable types and absent otherwise; the payload
/// fields carry whatever the type calls for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub from: PeerId,
    pub to: PeerId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u32>,
    #[serde(rename = "forwardBy", skip_serializing_if = "Option::is_none")]
    pub forward_by: Option<Vec<PeerId>>,
    /// Inverse delivery path for handshake responses; intermediate hops pop
    /// from the back instead of re-broadcasting.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<Vec<PeerId>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number: Option<String>,
}

impl Message {
    pub fn new(kind: MessageType, from: impl Into<PeerId>, to: impl Into<PeerId>) -> Self {
        Message {
            kind,
            from: from.into(),
            to: to.into(),
            ttl: None,
            forward_by: None,
            route: None,
            data: None,
            url: None,
            number: None,
        }
    }

    /// A forwardable message starts with a full TTL and an empty forward
    /// history.
    pub fn forwardable(
        kind: MessageType,
        from: impl Into<PeerId>,
        to: impl Into<PeerId>,
        ttl: u32,
    ) -> Self {
        let mut m = Message::new(kind, from, to);
        m.ttl = Some(ttl);
        m.forward_by = Some(vec![]);
        m
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_number(mut self, number: impl Into<String>) -> Self {
        self.number = Some(number.into());
        self
    }

    pub fn with_route(mut self, route: Vec<PeerId>) -> Self {
        self.route = Some(route);
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.to == BROADCAST_TO
    }

    /// Checks the envelope invariants. Malformed messages are dropped at
    /// dispatch, so every consumer downstream can rely on these.
    pub fn validate(&self) -> Result<()> {
        if self.kind == MessageType::Unspecified {
            return Err(Error::ErrMalformedMessage("unknown type tag".to_owned()));
        }
        if self.from.is_empty() {
            return Err(Error::ErrMalformedMessage("empty from".to_owned()));
        }
        if self.to.is_empty() {
            return Err(Error::ErrMalformedMessage("empty to".to_owned()));
        }
        if self.kind.is_forwardable() {
            if self.ttl.is_none() {
                return Err(Error::ErrMalformedMessage(format!(
                    "{} without ttl",
                    self.kind
                )));
            }
            match self.forward_by {
                None => {
                    return Err(Error::ErrMalformedMessage(format!(
                        "{} without forwardBy",
                        self.kind
                    )))
                }
                Some(ref fwd) => {
                    if fwd.contains(&self.from) {
                        return Err(Error::ErrMalformedMessage(
                            "from listed in forwardBy".to_owned(),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// The peers this message must not be sent back to.
    pub fn already_handled_by(&self) -> Vec<PeerId> {
        let mut handled = vec![self.from.clone()];
        if let Some(ref fwd) = self.forward_by {
            handled.extend(fwd.iter().cloned());
        }
        handled
    }

    pub fn marshal(&self) -> Result<Bytes> {
        let v = serde_json::to_vec(self)?;
        Ok(Bytes::from(v))
    }

    pub fn unmarshal(raw: &[u8]) -> Result<Message> {
        let m: Message = serde_json::from_slice(raw)?;
        Ok(m)
    }

    /// Deserializes the `data` payload into a concrete type.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T> {
        let v = self
            .data
            .clone()
            .ok_or_else(|| Error::ErrMalformedMessage("missing data".to_owned()))?;
        Ok(serde_json::from_value(v)?)
    }

    /// Reads the `data` payload as a plain byte array. Media payloads ride
    /// the wire as untyped arrays, which serialize smaller than typed ones.
    pub fn data_as_bytes(&self) -> Result<Bytes> {
        let v: Vec<u8> = self.data_as()?;
        Ok(Bytes::from(v))
    }

    pub fn bytes_as_value(data: &[u8]) -> serde_json::Value {
        serde_json::Value::Array(
            data.iter()
                .map(|b| serde_json::Value::from(*b as u64))
                .collect(),
        )
    }
}
