use std::time::Duration;

/// How long a part request to a remote peer may stay unanswered before the
/// origin takes over.
pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_millis(5000);
/// Parts requested in flight once the head is in place.
pub const DEFAULT_CONCURRENT_PARTS: usize = 3;
/// Conservative fit under the 64 KB datachannel message ceiling.
pub const DEFAULT_CHUNK_SIZE: usize = 17_500;

#[derive(Debug, Clone)]
pub struct MediaConfig {
    pub download_timeout: Duration,
    pub concurrent_parts: usize,
    pub chunk_size: usize,
    /// Start fetching metadata as soon as a media is added.
    pub autoload: bool,
}

impl Default for MediaConfig {
    fn default() -> Self {
        MediaConfig {
            download_timeout: DEFAULT_DOWNLOAD_TIMEOUT,
            concurrent_parts: DEFAULT_CONCURRENT_PARTS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            autoload: true,
        }
    }
}
