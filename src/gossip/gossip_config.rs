use std::time::Duration;

use super::view::SelectionPolicy;

/// Max view size (`C`).
pub const DEFAULT_VIEW_SIZE: usize = 10;
/// Healing parameter (`H`): oldest descriptors preferred for dropping.
pub const DEFAULT_HEALING: usize = 0;
/// Swap parameter (`S`): sent-and-echoed descriptors preferred next.
pub const DEFAULT_SWAP: usize = 0;
/// Active-thread tick.
pub const DEFAULT_GOSSIP_PERIOD: Duration = Duration::from_millis(2500);

#[derive(Debug, Clone)]
pub struct GossipConfig {
    pub view_size: usize,
    pub healing: usize,
    pub swap: usize,
    pub gossip_period: Duration,
    pub policy: SelectionPolicy,
}

impl Default for GossipConfig {
    fn default() -> Self {
        GossipConfig {
            view_size: DEFAULT_VIEW_SIZE,
            healing: DEFAULT_HEALING,
            swap: DEFAULT_SWAP,
            gossip_period: DEFAULT_GOSSIP_PERIOD,
            policy: SelectionPolicy::default(),
        }
    }
}
