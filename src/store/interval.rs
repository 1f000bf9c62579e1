//! Nested-set interval arithmetic.
//!
//! Everything here is pure: the storage layer reads the bounds it needs,
//! asks this module what to shift and where to put things, then issues the
//! corresponding range updates inside one transaction.

use super::types::{Node, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Enter/exit numbers of a node plus its depth
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub left: i64,
    pub right: i64,
    pub depth: i64,
}

impl Interval {
    /// Interval space occupied by the node and all of its descendants
    pub fn width(&self) -> i64 {
        self.right - self.left + 1
    }

    /// Strict containment: `other` is a proper descendant
    pub fn contains(&self, other: &Interval) -> bool {
        self.left < other.left && other.right < self.right
    }

    /// Containment or equality: `other` is this node or a descendant
    pub fn encloses(&self, other: &Interval) -> bool {
        self.left <= other.left && other.right <= self.right
    }
}

/// The parts of a parent node the allocator needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParentBound {
    pub right: i64,
    pub depth: i64,
}

impl From<&Node> for ParentBound {
    fn from(node: &Node) -> Self {
        ParentBound {
            right: node.right,
            depth: node.depth,
        }
    }
}

/// Space opened at `at`: every bound `>= at` moves up by `width`.
///
/// The boundary is inclusive, so a parent whose `right == at` (and every
/// ancestor, whose `right` is larger still) is widened, while the parent's
/// own `left` stays put.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    pub at: i64,
    pub width: i64,
}

impl Gap {
    pub fn apply(&self, interval: Interval) -> Interval {
        let bump = |bound: i64| if bound >= self.at { bound + self.width } else { bound };
        Interval {
            left: bump(interval.left),
            right: bump(interval.right),
            depth: interval.depth,
        }
    }
}

/// Space removed after `after`: every bound `> after` moves down by `width`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Closure {
    pub after: i64,
    pub width: i64,
}

impl Closure {
    /// Closure for removing the subtree rooted at `interval`
    pub fn of(interval: Interval) -> Self {
        Closure {
            after: interval.right,
            width: interval.width(),
        }
    }

    pub fn apply(&self, interval: Interval) -> Interval {
        let drop = |bound: i64| if bound > self.after { bound - self.width } else { bound };
        Interval {
            left: drop(interval.left),
            right: drop(interval.right),
            depth: interval.depth,
        }
    }
}

/// Result of allocating an interval for a single new node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub interval: Interval,
    /// Must be applied to existing rows before the new node is inserted
    pub gap: Option<Gap>,
}

/// Interval for a new leaf.
///
/// Roots go after the tree's current maximum `right` (or start at 1 in an
/// empty tree). Children take the slot just before the parent's closing
/// bound, which requires a 2-wide gap at the parent's `right`.
pub fn allocate(parent: Option<ParentBound>, current_max_right: Option<i64>) -> Allocation {
    match parent {
        Some(parent) => Allocation {
            interval: Interval {
                left: parent.right,
                right: parent.right + 1,
                depth: parent.depth + 1,
            },
            gap: Some(Gap {
                at: parent.right,
                width: 2,
            }),
        },
        None => {
            let left = current_max_right.map_or(1, |max| max + 1);
            Allocation {
                interval: Interval {
                    left,
                    right: left + 1,
                    depth: 0,
                },
                gap: None,
            }
        }
    }
}

/// Where a moved subtree should land
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// As the last child (interval-wise) of this parent
    Parent(ParentBound),
    /// As a new root; carries the largest `right` outside the moved subtree
    Root { max_right_outside: Option<i64> },
}

/// Every shift needed to relocate one subtree, computed from reads taken
/// before any write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MovePlan {
    /// Old interval of the subtree root
    pub subtree: Interval,
    /// Applied to everything outside the subtree first
    pub close: Closure,
    /// Applied to everything outside the subtree after `close`
    pub open: Option<Gap>,
    /// Added to both bounds of every moved node
    pub offset: i64,
    /// Added to the depth of every moved node
    pub depth_delta: i64,
}

impl MovePlan {
    /// New left bound of the subtree root
    pub fn new_left(&self) -> i64 {
        self.subtree.left + self.offset
    }

    /// New interval of a node inside the moved subtree
    pub fn relocate(&self, interval: Interval) -> Interval {
        Interval {
            left: interval.left + self.offset,
            right: interval.right + self.offset,
            depth: interval.depth + self.depth_delta,
        }
    }

    /// New interval of any node in the tree
    pub fn apply(&self, interval: Interval) -> Interval {
        if self.subtree.encloses(&interval) {
            return self.relocate(interval);
        }
        let closed = self.close.apply(interval);
        match self.open {
            Some(gap) => gap.apply(closed),
            None => closed,
        }
    }
}

/// Plan the relocation of the subtree rooted at `subtree`.
///
/// The destination must lie outside the subtree; callers reject cycles
/// before planning.
pub fn plan_move(subtree: Interval, destination: Destination) -> MovePlan {
    let close = Closure::of(subtree);
    let after_close = |bound: i64| {
        if bound > close.after {
            bound - close.width
        } else {
            bound
        }
    };

    let (new_left, new_depth, open) = match destination {
        Destination::Parent(parent) => {
            let at = after_close(parent.right);
            let gap = Gap {
                at,
                width: close.width,
            };
            (at, parent.depth + 1, Some(gap))
        }
        Destination::Root { max_right_outside } => {
            let left = max_right_outside.map_or(1, |max| after_close(max) + 1);
            (left, 0, None)
        }
    };

    MovePlan {
        subtree,
        close,
        open,
        offset: new_left - subtree.left,
        depth_delta: new_depth - subtree.depth,
    }
}

// ============================================================================
// Structure checks
// ============================================================================

/// Lightweight node representation (just structure, no data)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Skeleton {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    pub interval: Interval,
}

impl From<&Node> for Skeleton {
    fn from(node: &Node) -> Self {
        Skeleton {
            id: node.id,
            parent: node.parent_id,
            interval: node.interval(),
        }
    }
}

/// A broken nested-set invariant
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    #[error("node {node} has interval [{left}, {right}] with left >= right")]
    EmptyInterval { node: NodeId, left: i64, right: i64 },

    #[error("node {node} has interval [{left}, {right}] of even span")]
    EvenSpan { node: NodeId, left: i64, right: i64 },

    #[error("intervals of {a} and {b} partially overlap")]
    PartialOverlap { a: NodeId, b: NodeId },

    #[error("node {node} has depth {actual}, expected {expected}")]
    DepthMismatch {
        node: NodeId,
        expected: i64,
        actual: i64,
    },

    #[error("parent {parent} does not enclose child {node}")]
    ParentNotEnclosing { node: NodeId, parent: NodeId },

    #[error("node {node} references missing parent {parent}")]
    MissingParent { node: NodeId, parent: NodeId },

    #[error("interval of {ancestor} contains {descendant}, which is not below it")]
    AncestryMismatch { ancestor: NodeId, descendant: NodeId },

    #[error("node {node} is on a parent cycle")]
    ParentCycle { node: NodeId },
}

/// Every invariant violation in one tree's node set. Empty means healthy.
pub fn check(nodes: &[Skeleton]) -> Vec<Violation> {
    let by_id: HashMap<NodeId, &Skeleton> = nodes.iter().map(|n| (n.id, n)).collect();
    let mut violations = Vec::new();

    for node in nodes {
        let Interval { left, right, depth } = node.interval;
        if left >= right {
            violations.push(Violation::EmptyInterval {
                node: node.id,
                left,
                right,
            });
        } else if (right - left) % 2 == 0 {
            violations.push(Violation::EvenSpan {
                node: node.id,
                left,
                right,
            });
        }

        match node.parent {
            None if depth != 0 => violations.push(Violation::DepthMismatch {
                node: node.id,
                expected: 0,
                actual: depth,
            }),
            None => {}
            Some(parent_id) => match by_id.get(&parent_id) {
                None => violations.push(Violation::MissingParent {
                    node: node.id,
                    parent: parent_id,
                }),
                Some(parent) => {
                    if parent.interval.depth + 1 != depth {
                        violations.push(Violation::DepthMismatch {
                            node: node.id,
                            expected: parent.interval.depth + 1,
                            actual: depth,
                        });
                    }
                    if !parent.interval.contains(&node.interval) {
                        violations.push(Violation::ParentNotEnclosing {
                            node: node.id,
                            parent: parent_id,
                        });
                    }
                }
            },
        }
    }

    let mut sorted: Vec<&Skeleton> = nodes.iter().collect();
    sorted.sort_by_key(|n| (n.interval.left, n.interval.right));

    for (i, a) in sorted.iter().enumerate() {
        for b in &sorted[i + 1..] {
            if b.interval.left > a.interval.right {
                break;
            }
            if a.interval.contains(&b.interval) {
                if !has_ancestor(&by_id, b, a.id) {
                    violations.push(Violation::AncestryMismatch {
                        ancestor: a.id,
                        descendant: b.id,
                    });
                }
            } else {
                violations.push(Violation::PartialOverlap { a: a.id, b: b.id });
            }
        }
    }

    violations
}

/// Walks `node`'s parent chain looking for `ancestor`; bounded so cycles terminate.
fn has_ancestor(by_id: &HashMap<NodeId, &Skeleton>, node: &Skeleton, ancestor: NodeId) -> bool {
    let mut current = node.parent;
    for _ in 0..by_id.len() {
        match current {
            Some(id) if id == ancestor => return true,
            Some(id) => current = by_id.get(&id).and_then(|n| n.parent),
            None => return false,
        }
    }
    false
}

/// Fresh intervals for every node, derived from parent links alone.
///
/// `nodes` must be in sibling display order; children are numbered in the
/// order they appear. Nodes whose parent is absent from the set become
/// roots. Existing intervals are ignored.
pub fn renumber(nodes: &[Skeleton]) -> Result<Vec<(NodeId, Interval)>, Violation> {
    let present: HashSet<NodeId> = nodes.iter().map(|n| n.id).collect();
    let mut children: HashMap<Option<NodeId>, Vec<NodeId>> = HashMap::new();
    for node in nodes {
        let parent = node.parent.filter(|p| present.contains(p));
        children.entry(parent).or_default().push(node.id);
    }

    let mut numbered: Vec<(NodeId, Interval)> = Vec::with_capacity(nodes.len());
    let mut index: HashMap<NodeId, usize> = HashMap::with_capacity(nodes.len());
    let mut next = 1;

    let mut stack: Vec<(NodeId, i64, bool)> = children
        .get(&None)
        .map(|roots| roots.iter().rev().map(|id| (*id, 0, false)).collect())
        .unwrap_or_default();

    while let Some((id, depth, exiting)) = stack.pop() {
        if exiting {
            if let Some(&i) = index.get(&id) {
                numbered[i].1.right = next;
                next += 1;
            }
            continue;
        }

        index.insert(id, numbered.len());
        numbered.push((
            id,
            Interval {
                left: next,
                right: next,
                depth,
            },
        ));
        next += 1;

        stack.push((id, depth, true));
        if let Some(kids) = children.get(&Some(id)) {
            stack.extend(kids.iter().rev().map(|kid| (*kid, depth + 1, false)));
        }
    }

    if let Some(stranded) = nodes.iter().find(|n| !index.contains_key(&n.id)) {
        return Err(Violation::ParentCycle { node: stranded.id });
    }

    Ok(numbered)
}
