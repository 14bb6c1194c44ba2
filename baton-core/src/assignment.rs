//! Deterministic datum to node assignment.
//!
//! Every member computes the same ready-node order independently, so the
//! same datum id maps to the same nodes everywhere without a coordinator.

use smol_str::SmolStr;
use std::cmp::Ordering;

/// Position of a node in the cluster-wide order: start time first, name
/// second for uniqueness. Compared field by field, never as a formatted
/// string, so keys of different digit counts order numerically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeOrderKey {
    pub sort_by: i64,
    pub name: SmolStr,
}

impl NodeOrderKey {
    pub fn new(sort_by: i64, name: impl Into<SmolStr>) -> Self {
        Self {
            sort_by,
            name: name.into(),
        }
    }
}

impl Ord for NodeOrderKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_by
            .cmp(&other.sort_by)
            .then_with(|| self.name.as_str().cmp(other.name.as_str()))
    }
}

impl PartialOrd for NodeOrderKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Sorts `nodes` in place by their order keys.
pub fn sort_nodes<T>(nodes: &mut [(NodeOrderKey, T)]) {
    nodes.sort_by(|left, right| left.0.cmp(&right.0));
}

/// Picks `copies` nodes for datum `id`: entry `i` is
/// `nodes[(id + i) mod nodes.len()]`. The first entry is the primary.
///
/// Returns an empty list when there are no nodes. Negative ids wrap with a
/// Euclidean remainder; `copies` larger than the node count repeats nodes.
pub fn select_nodes<T: Clone>(nodes: &[T], id: i64, copies: usize) -> Vec<T> {
    if nodes.is_empty() {
        return Vec::new();
    }

    let len = nodes.len() as i128;
    (0..copies)
        .map(|offset| {
            let index = (i128::from(id) + offset as i128).rem_euclid(len) as usize;
            nodes[index].clone()
        })
        .collect()
}
