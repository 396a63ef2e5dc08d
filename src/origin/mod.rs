use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// Inclusive byte range, the way HTTP `Range` headers spell it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        ByteRange { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bytes={}-{}", self.start, self.end)
    }
}

/// The source of last resort. One byte-range fetch per media part, one
/// JSON fetch for the metadata document. Implementations check the HTTP
/// status themselves: 200 for whole fetches, 206 for ranges; anything else
/// surfaces as [`crate::Error::ErrOriginFetch`].
#[async_trait]
pub trait OriginClient: Send + Sync {
    async fn fetch_json(&self, url: &str) -> Result<serde_json::Value>;
    async fn fetch_range(&self, url: &str, range: ByteRange) -> Result<Bytes>;
    async fn fetch(&self, url: &str) -> Result<Bytes>;
}
