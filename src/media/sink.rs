use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// The opaque playback consumer. Ordering is the caller's problem: the
/// fetcher appends parts in part order and `append` resolves once the sink
/// is ready for the next buffer.
#[async_trait]
pub trait PlaybackSink: Send + Sync {
    /// Hands over the initialization prefix that precedes the first part.
    async fn init(&self, head: Bytes) -> Result<()>;
    /// Appends one part; resolves when the sink is idle again.
    async fn append(&self, data: Bytes) -> Result<()>;
    /// No further parts will come.
    async fn end_of_stream(&self) -> Result<()>;
}
