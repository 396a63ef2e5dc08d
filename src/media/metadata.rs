use serde::{Deserialize, Serialize};

use crate::origin::ByteRange;

/// One metadata-defined byte range of the media, beginning at a keyframe.
/// Cluster `i` spans `[offset_i, offset_{i+1} - 1]`; the last one runs to
/// the end of the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub offset: u64,
    pub timecode: f64,
}

/// The JSON document fetched from the metadata URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaMetadata {
    pub size: u64,
    pub duration: f64,
    pub clusters: Vec<Cluster>,
}

impl MediaMetadata {
    pub fn part_count(&self) -> usize {
        self.clusters.len()
    }

    /// The byte prefix before the first cluster, needed to initialize the
    /// playback sink. `None` when the first cluster starts at byte zero.
    pub fn head_range(&self) -> Option<ByteRange> {
        let first = self.clusters.first()?;
        if first.offset == 0 {
            return None;
        }
        Some(ByteRange::new(0, first.offset - 1))
    }

    pub fn part_range(&self, part: usize) -> Option<ByteRange> {
        let cluster = self.clusters.get(part)?;
        let end = match self.clusters.get(part + 1) {
            Some(next) => next.offset - 1,
            None => self.size - 1,
        };
        Some(ByteRange::new(cluster.offset, end))
    }
}
