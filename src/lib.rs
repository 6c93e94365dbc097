//! # avl-rs
//!
//! An arena-backed AVL tree that doubles as an ordered multiset.
//!
//! Equal elements are all retained: a duplicate is routed to the right of
//! every equal element already present, so the tree holds one node per
//! inserted value.
//!
//! ## Example
//!
//! ```rust
//! use avl_rs::AvlTree;
//!
//! let mut tree = AvlTree::new();
//! for v in [4, 2, 6, 1, 3, 5, 7] {
//!     tree.insert(v);
//! }
//! tree.insert(4);
//!
//! assert_eq!(tree.len(), 8);
//! assert_eq!(tree.get(&4), Some(&4));
//! assert_eq!(tree.remove(&4), Some(4));
//! assert!(tree.contains(&4));
//! assert!(tree.is_balanced());
//! ```

#![deny(unsafe_code)]

mod tracing_helpers;

use std::collections::TryReserveError;
use std::fmt;

use crate::tracing_helpers::{debug_log, trace_log, warn_log};

// =============================================================================
// Configuration
// =============================================================================

/// Smallest capacity reserved for a per-operation ancestor path.
const MIN_PATH_CAPACITY: usize = 16;

// =============================================================================
// Directions, node ids and nodes
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Dir {
    Left = 0,
    Right = 1,
}

impl Dir {
    /// Side of `pivot` on which `value` belongs.
    ///
    /// Anything not strictly less than `pivot` goes right, so duplicates
    /// accumulate on the right of their equals.
    #[inline]
    fn toward<T: Ord>(value: &T, pivot: &T) -> Self {
        if value < pivot {
            Dir::Left
        } else {
            Dir::Right
        }
    }

    #[inline]
    fn opposite(self) -> Self {
        match self {
            Dir::Left => Dir::Right,
            Dir::Right => Dir::Left,
        }
    }

    /// Contribution of this side to a balance factor.
    #[inline]
    fn sign(self) -> i8 {
        match self {
            Dir::Left => -1,
            Dir::Right => 1,
        }
    }

    #[inline]
    fn index(self) -> usize {
        self as usize
    }
}

/// Index of a node in the arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct NodeId(u32);

impl NodeId {
    #[inline]
    fn index(self) -> usize {
        self.0 as usize
    }
}

type Link = Option<NodeId>;

#[derive(Clone)]
struct Node<T> {
    value: T,
    /// `height(right) - height(left)`.
    balance: i8,
    children: [Link; 2],
}

impl<T> Node<T> {
    #[inline]
    fn leaf(value: T) -> Self {
        Self {
            value,
            balance: 0,
            children: [None, None],
        }
    }

    #[inline]
    fn child(&self, dir: Dir) -> Link {
        self.children[dir.index()]
    }

    #[inline]
    fn set_child(&mut self, dir: Dir, link: Link) {
        self.children[dir.index()] = link;
    }
}

// =============================================================================
// Node arena
// =============================================================================

#[derive(Clone)]
enum Entry<T> {
    Occupied(Node<T>),
    /// Released slot; links to the next free slot.
    Vacant(Link),
}

/// Slab of nodes addressed by [`NodeId`], with an intrusive free list.
#[derive(Clone)]
struct NodeArena<T> {
    entries: Vec<Entry<T>>,
    free_head: Link,
    live: usize,
}

impl<T> NodeArena<T> {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            free_head: None,
            live: 0,
        }
    }

    #[inline]
    fn len(&self) -> usize {
        self.live
    }

    /// Bytes reserved for node storage.
    fn capacity_bytes(&self) -> usize {
        self.entries.capacity() * std::mem::size_of::<Entry<T>>()
    }

    /// Make sure the next `alloc` cannot reallocate.
    fn try_reserve_one(&mut self) -> Result<(), TryReserveError> {
        if self.free_head.is_none() {
            self.entries.try_reserve(1)?;
        }
        Ok(())
    }

    /// # Panics
    ///
    /// Panics if the arena would exceed `u32::MAX` entries.
    fn alloc(&mut self, node: Node<T>) -> NodeId {
        let id = match self.free_head {
            Some(id) => {
                let next = match &self.entries[id.index()] {
                    Entry::Vacant(next) => *next,
                    Entry::Occupied(_) => unreachable!("free list points at live node {id:?}"),
                };
                self.free_head = next;
                self.entries[id.index()] = Entry::Occupied(node);
                id
            }
            None => {
                let raw = u32::try_from(self.entries.len())
                    .expect("node arena exceeds u32::MAX entries");
                self.entries.push(Entry::Occupied(node));
                NodeId(raw)
            }
        };
        self.live += 1;
        id
    }

    /// Release a node and hand back its contents.
    fn free(&mut self, id: NodeId) -> Node<T> {
        let entry = std::mem::replace(&mut self.entries[id.index()], Entry::Vacant(self.free_head));
        let Entry::Occupied(node) = entry else {
            unreachable!("node {id:?} released twice");
        };
        self.free_head = Some(id);
        self.live -= 1;
        node
    }

    #[inline]
    fn get(&self, id: NodeId) -> &Node<T> {
        match &self.entries[id.index()] {
            Entry::Occupied(node) => node,
            Entry::Vacant(_) => unreachable!("vacant node {id:?} reached from a live link"),
        }
    }

    #[inline]
    fn get_mut(&mut self, id: NodeId) -> &mut Node<T> {
        match &mut self.entries[id.index()] {
            Entry::Occupied(node) => node,
            Entry::Vacant(_) => unreachable!("vacant node {id:?} reached from a live link"),
        }
    }

    /// Number of entries, live or vacant. Upper bound for any `NodeId`.
    #[inline]
    fn slots(&self) -> usize {
        self.entries.len()
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.free_head = None;
        self.live = 0;
    }

    /// Drop trailing vacant entries, rebuild the free list, release spare capacity.
    fn shrink_to_fit(&mut self) {
        while matches!(self.entries.last(), Some(Entry::Vacant(_))) {
            self.entries.pop();
        }
        self.free_head = None;
        for (i, entry) in self.entries.iter_mut().enumerate().rev() {
            if let Entry::Vacant(next) = entry {
                *next = self.free_head;
                self.free_head = Some(NodeId(i as u32));
            }
        }
        self.entries.shrink_to_fit();
    }
}

// =============================================================================
// Slots and ancestor paths
// =============================================================================

/// A place that holds a link: the root, or one child field of a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Slot {
    Root,
    Child(NodeId, Dir),
}

/// How the mutated subtree's height moved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum HeightChange {
    Grew,
    Shrank,
}

impl HeightChange {
    #[inline]
    fn sign(self) -> i8 {
        match self {
            HeightChange::Grew => 1,
            HeightChange::Shrank => -1,
        }
    }
}

/// Ancestors traversed by one operation, root first, with the side taken at each.
struct Path {
    steps: Vec<(NodeId, Dir)>,
}

impl Path {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            steps: Vec::with_capacity(capacity),
        }
    }

    fn try_with_capacity(capacity: usize) -> Result<Self, TryReserveError> {
        let mut steps = Vec::new();
        steps.try_reserve(capacity)?;
        Ok(Self { steps })
    }

    #[inline]
    fn push(&mut self, id: NodeId, dir: Dir) {
        self.steps.push((id, dir));
    }

    #[inline]
    fn pop(&mut self) -> Option<(NodeId, Dir)> {
        self.steps.pop()
    }

    /// Slot holding the node that was popped last.
    #[inline]
    fn parent_slot(&self) -> Slot {
        match self.steps.last() {
            Some(&(id, dir)) => Slot::Child(id, dir),
            None => Slot::Root,
        }
    }

    #[inline]
    #[cfg_attr(not(feature = "tracing"), allow(dead_code))]
    fn len(&self) -> usize {
        self.steps.len()
    }
}

// =============================================================================
// Errors
// =============================================================================

/// A structural defect found by [`AvlTree::verify`].
///
/// `node` fields are arena indices, stable for the lifetime of the node.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvariantError {
    #[error("node {node} stores balance factor {balance}, outside -1..=1")]
    BalanceOutOfRange { node: usize, balance: i8 },
    #[error("node {node} stores balance factor {stored} but its subtrees differ in height by {actual}")]
    BalanceMismatch {
        node: usize,
        stored: i8,
        actual: isize,
    },
    #[error("node {node} is out of order with respect to one of its ancestors")]
    OrderViolation { node: usize },
    #[error("node {node} is reachable along more than one path")]
    NodeRevisited { node: usize },
    #[error("{reachable} nodes are reachable from the root but the tree tracks {len}")]
    CountMismatch { reachable: usize, len: usize },
}

// =============================================================================
// AvlTree
// =============================================================================

/// A height-balanced binary search tree holding any number of equal elements.
///
/// Nodes live in an arena and refer to their children by index, so dropping
/// or clearing the tree never recurses, whatever its shape.
#[derive(Clone)]
pub struct AvlTree<T> {
    nodes: NodeArena<T>,
    root: Link,
}

impl<T> AvlTree<T> {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Creates an empty tree with room for `capacity` nodes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            nodes: NodeArena::with_capacity(capacity),
            root: None,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Number of nodes on the longest root-to-leaf path; `0` when empty.
    ///
    /// Derived from the stored balance factors by following the taller side
    /// at every level, so it is exact for any tree that passes [`verify`].
    ///
    /// [`verify`]: AvlTree::verify
    pub fn height(&self) -> usize {
        let mut height = 0;
        let mut current = self.root;
        while let Some(id) = current {
            height += 1;
            let node = self.nodes.get(id);
            let taller = if node.balance < 0 { Dir::Left } else { Dir::Right };
            current = node.child(taller);
        }
        height
    }

    pub fn memory_usage(&self) -> usize {
        self.nodes.capacity_bytes()
    }

    pub fn shrink_to_fit(&mut self) {
        self.nodes.shrink_to_fit();
    }

    /// Removes every element.
    ///
    /// Nodes are released one by one from an explicit work list, so the cost
    /// never depends on call-stack depth.
    pub fn clear(&mut self) {
        debug_log!(len = self.len(), "clearing tree");
        let mut pending: Vec<NodeId> = Vec::with_capacity(MIN_PATH_CAPACITY);
        pending.extend(self.root.take());
        while let Some(id) = pending.pop() {
            let node = self.nodes.free(id);
            pending.extend(node.children.into_iter().flatten());
        }
        debug_assert_eq!(self.nodes.len(), 0, "clear left unreachable nodes behind");
        self.nodes.clear();
    }

    /// Upper bound on the ancestor path of any operation on this tree.
    ///
    /// AVL height is below `1.45 * log2(n + 2)`; `bits * 1.5` covers it.
    fn path_capacity(&self) -> usize {
        let bits = (usize::BITS - (self.len() + 2).leading_zeros()) as usize;
        MIN_PATH_CAPACITY.max(bits + bits / 2 + 2)
    }

    #[inline]
    fn link(&self, slot: Slot) -> Link {
        match slot {
            Slot::Root => self.root,
            Slot::Child(id, dir) => self.nodes.get(id).child(dir),
        }
    }

    #[inline]
    fn set_link(&mut self, slot: Slot, link: Link) {
        match slot {
            Slot::Root => self.root = link,
            Slot::Child(id, dir) => self.nodes.get_mut(id).set_child(dir, link),
        }
    }

    /// Single rotation of the subtree in `slot`; its root moves down toward `down`.
    ///
    /// The child on the opposite side rises into `slot` and is returned.
    /// Balance factors are left untouched.
    fn rotate(&mut self, slot: Slot, down: Dir) -> NodeId {
        let up = down.opposite();
        let root = self.link(slot).expect("rotation of an empty slot");
        let pivot = self
            .nodes
            .get(root)
            .child(up)
            .expect("rotation needs a child on the rising side");
        let inner = self.nodes.get(pivot).child(down);

        self.nodes.get_mut(root).set_child(up, inner);
        self.nodes.get_mut(pivot).set_child(down, Some(root));
        self.set_link(slot, Some(pivot));

        trace_log!(root = root.0, pivot = pivot.0, down = ?down, "rotate");
        pivot
    }

    /// Repair the node `id` in `slot` whose balance factor reached ±2.
    ///
    /// Returns the new root of the subtree.
    fn rebalance(&mut self, slot: Slot, id: NodeId) -> NodeId {
        let balance = self.nodes.get(id).balance;
        debug_assert_eq!(balance.abs(), 2);

        let heavy = if balance > 0 { Dir::Right } else { Dir::Left };
        let s = heavy.sign();
        let child = self
            .nodes
            .get(id)
            .child(heavy)
            .expect("heavy side of an unbalanced node is empty");
        let child_balance = self.nodes.get(child).balance;

        if child_balance == -s {
            // Child leans the other way: lift the grandchild with two rotations.
            let grandchild = self
                .nodes
                .get(child)
                .child(heavy.opposite())
                .expect("inner grandchild of a zig-zag is empty");
            let g = self.nodes.get(grandchild).balance;

            self.rotate(Slot::Child(id, heavy), heavy);
            let top = self.rotate(slot, heavy.opposite());
            debug_assert_eq!(top, grandchild);

            self.nodes.get_mut(id).balance = if g == s { -s } else { 0 };
            self.nodes.get_mut(child).balance = if g == -s { s } else { 0 };
            self.nodes.get_mut(grandchild).balance = 0;
            top
        } else {
            let top = self.rotate(slot, heavy.opposite());
            if child_balance == 0 {
                // Only reachable on removal; the subtree keeps its height.
                self.nodes.get_mut(child).balance = -s;
                self.nodes.get_mut(id).balance = s;
            } else {
                self.nodes.get_mut(child).balance = 0;
                self.nodes.get_mut(id).balance = 0;
            }
            top
        }
    }

    /// Walk `path` from the mutation point back to the root, updating balance
    /// factors and rotating where a factor reaches ±2.
    ///
    /// Stops as soon as a subtree's height is known to be unchanged; the rest
    /// of the path is dropped with it.
    fn retrace(&mut self, mut path: Path, change: HeightChange) {
        while let Some((id, dir)) = path.pop() {
            let node = self.nodes.get_mut(id);
            node.balance += dir.sign() * change.sign();
            let unbalanced = node.balance.abs() > 1;

            let top = if unbalanced {
                self.rebalance(path.parent_slot(), id)
            } else {
                id
            };

            let balance = self.nodes.get(top).balance;
            let settled = match change {
                HeightChange::Grew => balance == 0,
                HeightChange::Shrank => balance != 0,
            };
            if settled {
                trace_log!(remaining = path.len(), change = ?change, "retrace settled");
                return;
            }
        }
    }
}

impl<T: Ord> AvlTree<T> {
    /// Returns some element equal to `value`.
    ///
    /// When duplicates are present, which of the equal elements is returned
    /// is unspecified.
    pub fn get(&self, value: &T) -> Option<&T> {
        let mut current = self.root;
        while let Some(id) = current {
            let node = self.nodes.get(id);
            if node.value == *value {
                return Some(&node.value);
            }
            current = node.child(Dir::toward(value, &node.value));
        }
        None
    }

    pub fn contains(&self, value: &T) -> bool {
        self.get(value).is_some()
    }

    /// Adds `value`, keeping any equal elements already present.
    pub fn insert(&mut self, value: T) {
        if self.root.is_none() {
            self.root = Some(self.nodes.alloc(Node::leaf(value)));
            return;
        }

        let mut path = Path::with_capacity(self.path_capacity());
        let slot = self.insertion_slot(&value, &mut path);
        let id = self.nodes.alloc(Node::leaf(value));
        self.set_link(slot, Some(id));
        self.retrace(path, HeightChange::Grew);
    }

    /// Like [`insert`], but reports allocation failure instead of aborting.
    ///
    /// All storage the insertion needs is reserved before the tree is touched,
    /// so on `Err` the tree is unchanged and `value` is dropped.
    ///
    /// [`insert`]: AvlTree::insert
    pub fn try_insert(&mut self, value: T) -> Result<(), TryReserveError> {
        self.nodes.try_reserve_one()?;
        let mut path = Path::try_with_capacity(self.path_capacity())?;

        let slot = self.insertion_slot(&value, &mut path);
        let id = self.nodes.alloc(Node::leaf(value));
        self.set_link(slot, Some(id));
        self.retrace(path, HeightChange::Grew);
        Ok(())
    }

    /// Removes one element equal to `value` and returns it.
    ///
    /// Returns `None` and leaves the tree untouched if no element matches.
    pub fn remove(&mut self, value: &T) -> Option<T> {
        let mut path = Path::with_capacity(self.path_capacity());
        let slot = self.locate(Slot::Root, value, &mut path);
        let target = self.link(slot)?;

        let removed = self.unlink(slot, target, &mut path);
        self.retrace(path, HeightChange::Shrank);
        Some(removed)
    }

    /// Checks every structural invariant and returns the tree height.
    ///
    /// Heights are recomputed from scratch with an explicit stack, ignoring the
    /// stored balance factors, so arbitrarily corrupt shapes are reported
    /// rather than overflowing the call stack. For every node this checks
    /// that the stored factor is in `-1..=1` and matches the actual subtree
    /// heights, and that left descendants compare `<=` and right descendants
    /// `>=` to it. It also checks that no node is reachable twice and that
    /// the reachable count equals [`len`].
    ///
    /// [`len`]: AvlTree::len
    pub fn verify(&self) -> Result<usize, InvariantError> {
        let result = self.walk_invariants();
        if let Err(_err) = &result {
            warn_log!(error = %_err, "avl invariant violated");
        }
        result
    }

    /// `true` iff [`verify`] finds no defect.
    ///
    /// [`verify`]: AvlTree::verify
    pub fn is_balanced(&self) -> bool {
        self.verify().is_ok()
    }

    /// Descend from `start` toward `value`, recording every step in `path`.
    ///
    /// Stops on the first node equal to `value` or on the empty slot where it
    /// would be inserted, and returns that slot.
    fn locate(&self, start: Slot, value: &T, path: &mut Path) -> Slot {
        let mut slot = start;
        while let Some(id) = self.link(slot) {
            let node = self.nodes.get(id);
            if node.value == *value {
                break;
            }
            let dir = Dir::toward(value, &node.value);
            path.push(id, dir);
            slot = Slot::Child(id, dir);
        }
        slot
    }

    /// Empty slot for a new `value`, passing right of every equal element met.
    fn insertion_slot(&self, value: &T, path: &mut Path) -> Slot {
        let mut slot = self.locate(Slot::Root, value, path);
        while let Some(equal) = self.link(slot) {
            path.push(equal, Dir::Right);
            slot = self.locate(Slot::Child(equal, Dir::Right), value, path);
        }
        slot
    }

    /// Detach the node `target` held in `slot` and return its value.
    ///
    /// A node with two children takes over its in-order successor's value and
    /// the successor node is released instead; the steps down to it extend
    /// `path`.
    fn unlink(&mut self, slot: Slot, target: NodeId, path: &mut Path) -> T {
        let node = self.nodes.get(target);
        let (slot, victim) = match (node.child(Dir::Left), node.child(Dir::Right)) {
            (Some(_), Some(right)) => {
                path.push(target, Dir::Right);
                let mut slot = Slot::Child(target, Dir::Right);
                let mut current = right;
                while let Some(left) = self.nodes.get(current).child(Dir::Left) {
                    path.push(current, Dir::Left);
                    slot = Slot::Child(current, Dir::Left);
                    current = left;
                }
                (slot, current)
            }
            _ => (slot, target),
        };

        let released = self.nodes.free(victim);
        let orphan = released.child(Dir::Left).or(released.child(Dir::Right));
        self.set_link(slot, orphan);

        if victim == target {
            released.value
        } else {
            std::mem::replace(&mut self.nodes.get_mut(target).value, released.value)
        }
    }

    fn walk_invariants(&self) -> Result<usize, InvariantError> {
        enum Visit<'a, T> {
            Enter {
                link: Link,
                low: Option<&'a T>,
                high: Option<&'a T>,
            },
            Exit(NodeId),
        }

        let mut seen = vec![false; self.nodes.slots()];
        let mut reachable = 0usize;
        let mut heights: Vec<usize> = Vec::new();
        let mut stack = vec![Visit::Enter {
            link: self.root,
            low: None,
            high: None,
        }];

        while let Some(visit) = stack.pop() {
            match visit {
                Visit::Enter { link: None, .. } => heights.push(0),
                Visit::Enter {
                    link: Some(id),
                    low,
                    high,
                } => {
                    let node = id.index();
                    if std::mem::replace(&mut seen[node], true) {
                        return Err(InvariantError::NodeRevisited { node });
                    }
                    reachable += 1;

                    let current = self.nodes.get(id);
                    let below_low = low.is_some_and(|low| current.value < *low);
                    let above_high = high.is_some_and(|high| current.value > *high);
                    if below_low || above_high {
                        return Err(InvariantError::OrderViolation { node });
                    }

                    stack.push(Visit::Exit(id));
                    stack.push(Visit::Enter {
                        link: current.child(Dir::Right),
                        low: Some(&current.value),
                        high,
                    });
                    stack.push(Visit::Enter {
                        link: current.child(Dir::Left),
                        low,
                        high: Some(&current.value),
                    });
                }
                Visit::Exit(id) => {
                    let right = heights.pop().unwrap_or_default();
                    let left = heights.pop().unwrap_or_default();
                    let node = id.index();
                    let stored = self.nodes.get(id).balance;
                    if !(-1..=1).contains(&stored) {
                        return Err(InvariantError::BalanceOutOfRange {
                            node,
                            balance: stored,
                        });
                    }
                    let actual = right as isize - left as isize;
                    if isize::from(stored) != actual {
                        return Err(InvariantError::BalanceMismatch {
                            node,
                            stored,
                            actual,
                        });
                    }
                    heights.push(left.max(right) + 1);
                }
            }
        }

        if reachable != self.len() {
            return Err(InvariantError::CountMismatch {
                reachable,
                len: self.len(),
            });
        }
        Ok(heights.pop().unwrap_or_default())
    }
}

impl<T> Default for AvlTree<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for AvlTree<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AvlTree")
            .field("len", &self.len())
            .field("height", &self.height())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
impl<T> AvlTree<T> {
    /// Elements in order, collected without recursion.
    fn in_order(&self) -> Vec<&T> {
        let mut out = Vec::with_capacity(self.len());
        let mut stack = Vec::new();
        let mut current = self.root;
        loop {
            while let Some(id) = current {
                stack.push(id);
                current = self.nodes.get(id).child(Dir::Left);
            }
            let Some(id) = stack.pop() else { break };
            let node = self.nodes.get(id);
            out.push(&node.value);
            current = node.child(Dir::Right);
        }
        out
    }

    /// Pre-order `(value, balance, has_left, has_right)` snapshot of the shape.
    fn shape(&self) -> Vec<(&T, i8, bool, bool)> {
        let mut out = Vec::with_capacity(self.len());
        let mut stack: Vec<NodeId> = self.root.into_iter().collect();
        while let Some(id) = stack.pop() {
            let node = self.nodes.get(id);
            let left = node.child(Dir::Left);
            let right = node.child(Dir::Right);
            out.push((&node.value, node.balance, left.is_some(), right.is_some()));
            stack.extend(right);
            stack.extend(left);
        }
        out
    }

    fn root_value(&self) -> Option<&T> {
        self.root.map(|id| &self.nodes.get(id).value)
    }
}


#[cfg(test)]
mod proptests;
