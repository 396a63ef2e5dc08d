use std::fmt;

use rand::seq::SliceRandom;
use rand::Rng;

use super::descriptor::NodeDescriptor;

/// A node's partial knowledge of the network: an ordered set of
/// descriptors with unique ids, never containing the node itself, never
/// larger than the configured view size.
pub type View = Vec<NodeDescriptor>;

/// Which half of the exchange a buffer is generated for. The active side
/// reserves one slot for its own fresh descriptor.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum GossipThread {
    Active,
    Passive,
}

const SELECTION_POLICY_RANDOM_STR: &str = "random";
const SELECTION_POLICY_OLDEST_STR: &str = "oldest";

/// How the active thread picks its exchange partner.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum SelectionPolicy {
    Random,
    Oldest,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        SelectionPolicy::Random
    }
}

impl From<&str> for SelectionPolicy {
    fn from(raw: &str) -> Self {
        match raw {
            SELECTION_POLICY_OLDEST_STR => SelectionPolicy::Oldest,
            _ => SelectionPolicy::Random,
        }
    }
}

impl fmt::Display for SelectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            SelectionPolicy::Random => SELECTION_POLICY_RANDOM_STR,
            SelectionPolicy::Oldest => SELECTION_POLICY_OLDEST_STR,
        };
        write!(f, "{}", s)
    }
}

pub(crate) fn position_of(view: &[NodeDescriptor], id: &str) -> Option<usize> {
    view.iter().position(|d| d.id == id)
}

/// The oldest descriptor, first one winning ties.
pub fn oldest_descriptor(view: &[NodeDescriptor]) -> Option<&NodeDescriptor> {
    let mut oldest: Option<&NodeDescriptor> = None;
    for d in view {
        match oldest {
            Some(o) if d.age <= o.age => {}
            _ => oldest = Some(d),
        }
    }
    oldest
}

/// Picks the exchange partner for an active round.
pub fn select_remote_peer<'a>(
    policy: SelectionPolicy,
    view: &'a [NodeDescriptor],
) -> Option<&'a NodeDescriptor> {
    match policy {
        SelectionPolicy::Oldest => oldest_descriptor(view),
        SelectionPolicy::Random => view.choose(&mut rand::thread_rng()),
    }
}

/// Ages every descriptor by one round.
pub fn increment_age(view: &mut View) {
    for d in view.iter_mut() {
        d.age = d.age.saturating_add(1);
    }
}

/// Builds the buffer sent to `distant_id` during an exchange.
///
/// The buffer never mentions the addressee; it holds about half the view,
/// preferring young descriptors when the healing parameter `h` sets some
/// of the oldest aside. The active side prepends its own descriptor, aged
/// zero, in the slot the halved target leaves free.
pub fn gen_buffer(
    thread: GossipThread,
    distant_id: &str,
    own: &NodeDescriptor,
    view: &[NodeDescriptor],
    c: usize,
    h: usize,
) -> View {
    let target = match thread {
        GossipThread::Passive => c / 2,
        GossipThread::Active => (c / 2).saturating_sub(1),
    };

    let mut filtered: View = view.iter().filter(|d| d.id != distant_id).cloned().collect();

    let selected = if filtered.len() <= target {
        filtered
    } else {
        filtered.sort_by_key(|d| d.age);
        let head_len = filtered.len().saturating_sub(h);
        let (head, tail) = filtered.split_at(head_len);
        let mut rng = rand::thread_rng();
        if target < head.len() {
            head.choose_multiple(&mut rng, target).cloned().collect()
        } else if target == head.len() {
            head.to_vec()
        } else {
            let mut out: View = head.to_vec();
            out.extend(
                tail.choose_multiple(&mut rng, target - head.len())
                    .cloned(),
            );
            out
        }
    };

    match thread {
        GossipThread::Passive => selected,
        GossipThread::Active => {
            let mut out = vec![own.refreshed()];
            out.extend(selected);
            out
        }
    }
}

/// Merges an exchange's received buffer into the current view and bounds
/// the result back to `c` descriptors.
///
/// Received descriptors replace present ones only when strictly younger.
/// Over-capacity is shed in order: up to `h` of the oldest, then up to `s`
/// of the descriptors that were in the sent buffer, then uniformly at
/// random.
pub fn merge_view(
    received: &[NodeDescriptor],
    sent: &[NodeDescriptor],
    view: &[NodeDescriptor],
    self_id: &str,
    c: usize,
    h: usize,
    s: usize,
) -> View {
    let mut merged: View = view.to_vec();

    for d in received {
        if d.id == self_id {
            continue;
        }
        match position_of(&merged, &d.id) {
            None => merged.push(d.clone()),
            Some(at) => {
                if d.age < merged[at].age {
                    merged[at] = d.clone();
                }
            }
        }
    }

    merged.sort_by_key(|d| d.age);

    if merged.len() > c {
        let drop = (merged.len() - c).min(h);
        merged.truncate(merged.len() - drop);
    }

    if merged.len() > c {
        let mut rng = rand::thread_rng();
        let mut droppable: Vec<usize> = merged
            .iter()
            .enumerate()
            .filter(|(_, d)| position_of(sent, &d.id).is_some())
            .map(|(i, _)| i)
            .collect();
        droppable.shuffle(&mut rng);
        droppable.truncate((merged.len() - c).min(s));
        droppable.sort_unstable_by(|a, b| b.cmp(a));
        for i in droppable {
            merged.remove(i);
        }
    }

    let mut rng = rand::thread_rng();
    while merged.len() > c {
        let victim = rng.gen_range(0..merged.len());
        merged.remove(victim);
    }

    merged
}
