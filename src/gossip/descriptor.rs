use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::PeerId;

/// What one node knows about another: its id, how many gossip rounds have
/// passed since that node last refreshed it, and whatever extension state
/// the node chose to publish (the media layer contributes the part numbers
/// it holds, keyed by URL, under `"media"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub id: PeerId,
    pub age: u32,
    #[serde(flatten)]
    pub extensions: serde_json::Map<String, Value>,
}

impl NodeDescriptor {
    pub fn new(id: impl Into<PeerId>) -> Self {
        NodeDescriptor {
            id: id.into(),
            age: 0,
            extensions: serde_json::Map::new(),
        }
    }

    pub fn with_age(id: impl Into<PeerId>, age: u32) -> Self {
        let mut d = NodeDescriptor::new(id);
        d.age = age;
        d
    }

    /// A copy advertising this node as fresh.
    pub fn refreshed(&self) -> Self {
        let mut d = self.clone();
        d.age = 0;
        d
    }

    /// The part numbers this node advertises for `url`, if any.
    pub fn parts_for(&self, url: &str) -> Option<Vec<u32>> {
        let media = self.extensions.get("media")?.as_object()?;
        let parts = media.get(url)?.as_array()?;
        Some(
            parts
                .iter()
                .filter_map(|v| v.as_u64().map(|n| n as u32))
                .collect(),
        )
    }

    pub fn advertises(&self, url: &str) -> bool {
        self.extensions
            .get("media")
            .and_then(|m| m.as_object())
            .map_or(false, |m| m.contains_key(url))
    }

    /// Sets a nested extension value, creating intermediate objects. An
    /// empty path is ignored.
    pub fn set_extension(&mut self, path: &[String], value: Value) {
        let (last, parents) = match path.split_last() {
            Some(split) => split,
            None => return,
        };
        let mut cursor = &mut self.extensions;
        for key in parents {
            let entry = cursor
                .entry(key.clone())
                .or_insert_with(|| Value::Object(serde_json::Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(serde_json::Map::new());
            }
            cursor = match entry.as_object_mut() {
                Some(map) => map,
                None => return,
            };
        }
        cursor.insert(last.clone(), value);
    }
}

/// Payload of a `gossip:descriptor-update`: assign `value` at `path` inside
/// the own descriptor's extension fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescriptorUpdate {
    pub path: Vec<String>,
    pub value: Value,
}
