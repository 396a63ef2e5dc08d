use std::string::FromUtf8Error;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// Indicates a message is missing a required envelope field.
    #[error("malformed message: {0}")]
    ErrMalformedMessage(String),

    /// Indicates a send was attempted on a closed or unknown connection.
    #[error("no open connection to remote")]
    ErrUnknownTransport,

    /// Indicates the offer/answer/ICE negotiation with a remote failed.
    #[error("handshake with remote failed: {0}")]
    ErrHandshakeFailure(String),

    /// Indicates the origin server answered with a non-success status.
    #[error("origin fetch failed with status {status}")]
    ErrOriginFetch { status: u16 },

    /// Indicates a media part arrived that was never requested or has
    /// already been collected.
    #[error("part {0} is not pending")]
    ErrUnexpectedPart(u32),

    /// Indicates a queued message expired before its destination connected.
    #[error("retry queue entry timed out")]
    ErrTimeoutExpired,

    /// Indicates the peer is closed.
    #[error("the peer is closed")]
    ErrClosed,

    /// Indicates a media operation referenced an untracked URL.
    #[error("unknown media url")]
    ErrUnknownMedia,

    /// Indicates a media operation that requires metadata ran before the
    /// metadata arrived.
    #[error("media has no metadata yet")]
    ErrNoMetadata,

    /// Indicates SDP negotiation was attempted on the signaling entry.
    #[error("the signaling link cannot be negotiated with")]
    ErrSignalingNegotiation,

    /// Indicates a part reference that does not parse as "P" or "P:C:N".
    #[error("invalid part number")]
    ErrInvalidPartNumber,

    /// Indicates an active gossip exchange is already awaiting its answer.
    #[error("a gossip exchange is already pending")]
    ErrExchangePending,

    #[error("parse int: {0}")]
    ParseInt(#[from] std::num::ParseIntError),
    #[error("parse url: {0}")]
    ParseUrl(#[from] url::ParseError),
    #[error("utf-8 error: {0}")]
    Utf8(#[from] FromUtf8Error),
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::ErrMalformedMessage(e.to_string())
    }
}
