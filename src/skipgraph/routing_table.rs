//! Per-node routing state: one pair of ordered neighbour lists per level.
//!
//! Invariants kept here: left entries have keys below the owner's, right
//! entries above; lists are ascending; the owner never appears in its own
//! table. Level `l + 1` membership-prefix agreement is the join protocol's
//! responsibility.

use crate::skipgraph::membership::MembershipVector;
use crate::skipgraph::node::SgNode;
use crate::skipgraph::{Direction, Key};
use std::collections::HashSet;
use std::fmt;

/// Default bound on retained neighbours per side per level.
pub const DEFAULT_NB_SIZE: usize = 4;

#[derive(Debug, Clone, Default)]
struct Level {
    left: Vec<SgNode>,
    right: Vec<SgNode>,
}

impl Level {
    fn side(&self, side: Direction) -> &Vec<SgNode> {
        match side {
            Direction::Left => &self.left,
            Direction::Right => &self.right,
        }
    }

    fn side_mut(&mut self, side: Direction) -> &mut Vec<SgNode> {
        match side {
            Direction::Left => &mut self.left,
            Direction::Right => &mut self.right,
        }
    }

    fn is_empty(&self) -> bool {
        self.left.is_empty() && self.right.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct RoutingTable {
    key: Key,
    mv: MembershipVector,
    nb_size: usize,
    levels: Vec<Level>,
}

impl RoutingTable {
    /// Table with `mv.len() + 1` levels, retaining `nb_size` neighbours per
    /// side per level (the ones closest to the owner).
    pub fn new(key: Key, mv: MembershipVector, nb_size: usize) -> Self {
        let height = mv.len() + 1;
        Self {
            key,
            mv,
            nb_size: nb_size.max(1),
            levels: vec![Level::default(); height],
        }
    }

    pub fn key(&self) -> Key {
        self.key
    }

    pub fn mv(&self) -> &MembershipVector {
        &self.mv
    }

    /// Number of levels.
    pub fn height(&self) -> usize {
        self.levels.len()
    }

    /// The immediate neighbour on a side: last of the left list, first of the
    /// right list. Out-of-range levels have no neighbour.
    pub fn get(&self, level: usize, side: Direction) -> Option<&SgNode> {
        let nbs = self.levels.get(level)?.side(side);
        match side {
            Direction::Left => nbs.last(),
            Direction::Right => nbs.first(),
        }
    }

    /// The farthest safe hop towards `target`: on the right side, the
    /// largest-keyed neighbour not beyond the target; on the left, the
    /// smallest-keyed neighbour not below it. Falls back to the first entry
    /// on that side when no neighbour qualifies.
    pub fn get_best(&self, level: usize, side: Direction, target: Key) -> Option<&SgNode> {
        let nbs = self.levels.get(level)?.side(side);
        match side {
            Direction::Right => nbs
                .iter()
                .rev()
                .find(|n| n.key <= target)
                .or_else(|| nbs.first()),
            Direction::Left => nbs
                .iter()
                .find(|n| n.key >= target)
                .or_else(|| nbs.first()),
        }
    }

    /// Insert a neighbour, keeping the list sorted. Duplicate keys, empty
    /// descriptors, the owner itself, and `None` are no-ops. The list is then
    /// re-bounded to the `nb_size` entries closest to the owner.
    pub fn set(&mut self, level: usize, side: Direction, node: Option<SgNode>) {
        let Some(node) = node else { return };
        if node.is_empty() || node.key == self.key {
            return;
        }
        let nb_size = self.nb_size;
        let Some(entry) = self.levels.get_mut(level) else {
            return;
        };
        let nbs = entry.side_mut(side);
        match nbs.binary_search_by_key(&node.key, |n| n.key) {
            Ok(_) => return,
            Err(pos) => nbs.insert(pos, node),
        }
        if nbs.len() > nb_size {
            match side {
                // Closest-to-owner entries sit at the tail of the left list
                // and the head of the right list.
                Direction::Left => {
                    let excess = nbs.len() - nb_size;
                    nbs.drain(..excess);
                }
                Direction::Right => nbs.truncate(nb_size),
            }
        }
    }

    /// Install `node` as the immediate neighbour on a side, dropping every
    /// entry between the owner and the new neighbour. Used when a departed
    /// range of the level chain is being spliced out; `None` clears the side
    /// (no live neighbour remains at this level).
    pub fn set_immediate(&mut self, level: usize, side: Direction, node: Option<SgNode>) {
        {
            let Some(entry) = self.levels.get_mut(level) else {
                return;
            };
            let nbs = entry.side_mut(side);
            match &node {
                Some(n) => match side {
                    Direction::Left => nbs.retain(|nb| nb.key < n.key),
                    Direction::Right => nbs.retain(|nb| nb.key > n.key),
                },
                None => nbs.clear(),
            }
        }
        self.set(level, side, node);
    }

    /// Remove every occurrence of `key` at every level and side.
    pub fn remove_node(&mut self, key: Key) {
        for level in &mut self.levels {
            level.left.retain(|n| n.key != key);
            level.right.retain(|n| n.key != key);
        }
    }

    /// All unique descriptors present anywhere in the table.
    pub fn all_nodes(&self) -> Vec<SgNode> {
        let mut seen = HashSet::new();
        let mut nodes = Vec::new();
        for level in &self.levels {
            for n in level.left.iter().chain(level.right.iter()) {
                if seen.insert(n.key) {
                    nodes.push(n.clone());
                }
            }
        }
        nodes
    }
}

impl fmt::Display for RoutingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, level) in self.levels.iter().enumerate().rev() {
            if level.is_empty() {
                continue;
            }
            let fmt_side = |nbs: &[SgNode]| {
                nbs.iter()
                    .map(|n| n.key.to_string())
                    .collect::<Vec<_>>()
                    .join(",")
            };
            writeln!(
                f,
                "Level {}: LEFT=[{}], RIGHT=[{}]",
                i,
                fmt_side(&level.left),
                fmt_side(&level.right)
            )?;
        }
        write!(f, "=== RT node {} (MV: {}) ===", self.key, self.mv)
    }
}
