use std::collections::HashMap;

use bytes::Bytes;
use rand::seq::SliceRandom;

use super::metadata::MediaMetadata;
use super::part::{Part, PartStatus};
use crate::message::PeerId;

/// Where a part request goes: one peer known to hold it, or the origin
/// server when nobody does.
#[derive(Debug, Clone, PartialEq)]
pub enum PartSource {
    Remote(PeerId),
    Origin,
}

/// Per-URL download state: metadata, head, the parts and their lifecycle,
/// plus the remote-availability table the gossip view keeps refreshed.
#[derive(Debug, Default)]
pub struct Media {
    pub url: String,
    pub meta_url: String,
    pub metadata: Option<MediaMetadata>,
    pub head: Option<Bytes>,
    pub parts: Vec<Part>,
    /// remote peer id -> part numbers it advertises for this URL.
    pub remotes: HashMap<PeerId, Vec<u32>>,
    pub complete: bool,
}

impl Media {
    pub fn new(url: impl Into<String>, meta_url: impl Into<String>) -> Self {
        Media {
            url: url.into(),
            meta_url: meta_url.into(),
            ..Default::default()
        }
    }

    /// Installs the metadata and lays out one `Needed` part per cluster.
    pub fn init_parts(&mut self, metadata: MediaMetadata) {
        self.parts = (0..metadata.part_count() as u32).map(Part::new).collect();
        self.metadata = Some(metadata);
    }

    /// Whether this node holds the bytes of `part`. Out-of-range numbers
    /// (negative included) are simply not held.
    pub fn peer_has_part(&self, part: i64) -> bool {
        if part < 0 {
            return false;
        }
        self.parts
            .get(part as usize)
            .map_or(false, |p| p.has_bytes())
    }

    /// Whether `remote` advertises `part` for this URL.
    pub fn remote_has_part(&self, remote: &str, part: u32) -> bool {
        self.remotes
            .get(remote)
            .map_or(false, |parts| parts.contains(&part))
    }

    /// The part numbers this node can serve right now.
    pub fn held_parts(&self) -> Vec<u32> {
        self.parts
            .iter()
            .filter(|p| p.has_bytes())
            .map(|p| p.part_number)
            .collect()
    }

    /// Picks the next `n` parts to request, in part order, marking each
    /// one `Pending`. Each part goes to a uniformly random advertiser, or
    /// to the origin when no remote has it.
    pub fn next_parts_to_download(&mut self, n: usize) -> Vec<(PartSource, u32)> {
        let mut picked = vec![];
        let mut rng = rand::thread_rng();

        for part in self.parts.iter_mut() {
            if picked.len() == n {
                break;
            }
            if part.status != PartStatus::Needed {
                continue;
            }

            let holders: Vec<&PeerId> = self
                .remotes
                .iter()
                .filter(|(_, parts)| parts.contains(&part.part_number))
                .map(|(id, _)| id)
                .collect();
            let source = match holders.choose(&mut rng) {
                Some(id) => PartSource::Remote((*id).clone()),
                None => PartSource::Origin,
            };

            part.status = PartStatus::Pending;
            picked.push((source, part.part_number));
        }

        picked
    }

    /// Lowest-numbered part ready for the sink, marked `Added` on the way
    /// out. The bytes stay behind for serving.
    pub fn take_lowest_available(&mut self) -> Option<(u32, Bytes)> {
        let part = self
            .parts
            .iter_mut()
            .filter(|p| p.status == PartStatus::Available)
            .min_by_key(|p| p.part_number)?;
        let bytes = part.bytes()?.clone();
        part.status = PartStatus::Added;
        Some((part.part_number, bytes))
    }

    pub fn all_added(&self) -> bool {
        !self.parts.is_empty() && self.parts.iter().all(|p| p.status == PartStatus::Added)
    }
}
