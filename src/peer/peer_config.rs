use std::time::Duration;

use url::Url;

use crate::gossip::GossipConfig;
use crate::media::MediaConfig;
use crate::message::PeerId;

/// Max residual forwards for messages this peer originates.
pub const DEFAULT_TTL: u32 = 3;
/// Retry-queue tick period.
pub const DEFAULT_QUEUE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Peer construction options. Everything is optional; the extension
/// configs switch their engine on.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Fixed identity. Leave `None` to adopt the id the signaling service
    /// assigns on first contact.
    pub peer_id: Option<PeerId>,
    pub ttl: u32,
    /// How often the retry queue re-examines its entries.
    pub queue_timeout: Duration,
    /// Rendezvous endpoint, recorded for the signaling collaborator.
    pub signal_url: Option<Url>,
    pub gossip: Option<GossipConfig>,
    pub media: Option<MediaConfig>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        PeerConfig {
            peer_id: None,
            ttl: DEFAULT_TTL,
            queue_timeout: DEFAULT_QUEUE_TIMEOUT,
            signal_url: None,
            gossip: None,
            media: None,
        }
    }
}
