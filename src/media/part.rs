use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};

const PART_STATUS_NEEDED_STR: &str = "needed";
const PART_STATUS_PENDING_STR: &str = "pending";
const PART_STATUS_AVAILABLE_STR: &str = "available";
const PART_STATUS_ADDED_STR: &str = "added";

/// Lifecycle of one part. Progress is monotone except for the
/// `Pending -> Needed` rollback when the origin fallback fails too.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum PartStatus {
    /// Not requested from anywhere yet.
    Needed,
    /// A request is in flight (peer or origin).
    Pending,
    /// All bytes collected, waiting for the playback sink.
    Available,
    /// Handed to the playback sink.
    Added,
}

impl Default for PartStatus {
    fn default() -> Self {
        PartStatus::Needed
    }
}

impl From<&str> for PartStatus {
    fn from(raw: &str) -> Self {
        match raw {
            PART_STATUS_PENDING_STR => PartStatus::Pending,
            PART_STATUS_AVAILABLE_STR => PartStatus::Available,
            PART_STATUS_ADDED_STR => PartStatus::Added,
            _ => PartStatus::Needed,
        }
    }
}

impl fmt::Display for PartStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            PartStatus::Needed => PART_STATUS_NEEDED_STR,
            PartStatus::Pending => PART_STATUS_PENDING_STR,
            PartStatus::Available => PART_STATUS_AVAILABLE_STR,
            PartStatus::Added => PART_STATUS_ADDED_STR,
        };
        write!(f, "{}", s)
    }
}

/// Wire reference to a part or to one chunk of it: `"P"` for a whole part,
/// `"P:C:N"` for chunk `C` of `N`.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum PartRef {
    Whole(u32),
    Chunk { part: u32, index: u32, total: u32 },
}

impl PartRef {
    pub fn part_number(&self) -> u32 {
        match *self {
            PartRef::Whole(part) => part,
            PartRef::Chunk { part, .. } => part,
        }
    }
}

impl FromStr for PartRef {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        let fields: Vec<&str> = raw.split(':').collect();
        match fields.as_slice() {
            [part] => Ok(PartRef::Whole(part.parse()?)),
            [part, index, total] => {
                let parsed = PartRef::Chunk {
                    part: part.parse()?,
                    index: index.parse()?,
                    total: total.parse()?,
                };
                if let PartRef::Chunk { index, total, .. } = parsed {
                    if total == 0 || index >= total {
                        return Err(Error::ErrInvalidPartNumber);
                    }
                }
                Ok(parsed)
            }
            _ => Err(Error::ErrInvalidPartNumber),
        }
    }
}

impl fmt::Display for PartRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            PartRef::Whole(part) => write!(f, "{}", part),
            PartRef::Chunk { part, index, total } => write!(f, "{}:{}:{}", part, index, total),
        }
    }
}

/// One cluster's bytes and the collection state getting there. Chunks
/// gather in `chunks` until the announced count is reached, then collapse
/// into `bytes`. The bytes stay around after playback so the part can be
/// served to other peers.
#[derive(Debug, Default)]
pub struct Part {
    pub part_number: u32,
    pub status: PartStatus,
    bytes: Option<Bytes>,
    chunks: BTreeMap<u32, Bytes>,
    expected_chunks: Option<u32>,
}

impl Part {
    pub fn new(part_number: u32) -> Self {
        Part {
            part_number,
            ..Default::default()
        }
    }

    pub fn bytes(&self) -> Option<&Bytes> {
        self.bytes.as_ref()
    }

    pub fn has_bytes(&self) -> bool {
        self.bytes.is_some()
    }

    /// Stores one whole-part payload and makes the part available.
    pub fn accept_whole(&mut self, data: Bytes) {
        self.bytes = Some(data);
        self.chunks.clear();
        self.expected_chunks = None;
        self.status = PartStatus::Available;
    }

    /// Stores one chunk; returns true when the part just became complete.
    pub fn accept_chunk(&mut self, index: u32, total: u32, data: Bytes) -> Result<bool> {
        match self.expected_chunks {
            Some(expected) if expected != total => {
                return Err(Error::ErrInvalidPartNumber);
            }
            _ => self.expected_chunks = Some(total),
        }
        self.chunks.insert(index, data);
        if self.chunks.len() as u32 != total {
            return Ok(false);
        }

        let mut assembled = BytesMut::new();
        for chunk in self.chunks.values() {
            assembled.extend_from_slice(chunk);
        }
        self.bytes = Some(assembled.freeze());
        self.chunks.clear();
        self.expected_chunks = None;
        self.status = PartStatus::Available;
        Ok(true)
    }
}

/// Splits a buffer into ceil(len / chunk_size) slices of at most
/// `chunk_size` bytes. Slicing `Bytes` is zero-copy.
pub fn chunk_bytes(data: &Bytes, chunk_size: usize) -> Vec<Bytes> {
    assert!(chunk_size > 0, "chunk size must be positive");
    if data.is_empty() {
        return vec![Bytes::new()];
    }
    let mut chunks = Vec::with_capacity((data.len() + chunk_size - 1) / chunk_size);
    let mut at = 0;
    while at < data.len() {
        let end = (at + chunk_size).min(data.len());
        chunks.push(data.slice(at..end));
        at = end;
    }
    chunks
}
