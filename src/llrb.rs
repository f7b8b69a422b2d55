use bytemuck::{Pod, Zeroable};
use colored::Colorize;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use std::cmp::Ordering;
use thiserror::Error;

use crate::arena::{Dir, FromSlice, NodeArena, ZeroCopy, SENTINEL};

#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive)]
pub enum Color {
    Black = 0,
    Red = 1,
}

/// Path mark of a node. `Regular` nodes belong to the preferred path stored
/// by their enclosing tree; an `External` node is the root of a detached
/// subtree hanging off that path. The third state of the scheme, the shared
/// null node, is not a mark: it is the arena slot `SENTINEL` itself.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive)]
pub enum Mark {
    Regular = 0,
    External = 1,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TreeError {
    #[error("tree is empty")]
    EmptyTree,
    #[error("key {0} is not in the tree")]
    KeyNotFound(u64),
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct LlrbNode {
    pub key: u64,
    /// Depth of this key in the fixed reference tree; 0 for map-style use.
    pub depth: i32,
    /// Aggregates over the enclosing subtree, maintained on every mutation.
    /// Detached (`External`) children count as empty.
    pub size: u32,
    pub height: i32,
    pub min_depth: i32,
    pub max_depth: i32,
    _padding: u32,
}

unsafe impl Zeroable for LlrbNode {}
unsafe impl Pod for LlrbNode {}

impl LlrbNode {
    pub fn new(key: u64, depth: i32) -> Self {
        Self {
            key,
            depth,
            size: 1,
            height: 0,
            min_depth: depth,
            max_depth: depth,
            _padding: 0,
        }
    }
}

/// A left-leaning red-black tree over an index arena.
///
/// Besides the usual ordered-map operations this tree supports the surgery
/// needed to maintain a forest of preferred paths: `split_at`, `join_at`,
/// `extract_min_at`, `extract_max_at`, and the depth-threshold boundary
/// queries `predecessor_at` / `successor_at`. The surgery operates on raw
/// subtree indices so that several logically separate trees can share one
/// arena and exchange nodes without copying.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct Llrb<const MAX_SIZE: usize> {
    pub root: u64,
    _padding: u64,
    arena: NodeArena<LlrbNode, MAX_SIZE>,
}

unsafe impl<const MAX_SIZE: usize> Zeroable for Llrb<MAX_SIZE> {}
unsafe impl<const MAX_SIZE: usize> Pod for Llrb<MAX_SIZE> {}
impl<const MAX_SIZE: usize> ZeroCopy for Llrb<MAX_SIZE> {}

impl<const MAX_SIZE: usize> Default for Llrb<MAX_SIZE> {
    fn default() -> Self {
        Self::assert_proper_alignment();
        Llrb {
            root: SENTINEL as u64,
            _padding: 0,
            arena: NodeArena::<LlrbNode, MAX_SIZE>::default(),
        }
    }
}

impl<const MAX_SIZE: usize> FromSlice for Llrb<MAX_SIZE> {
    fn new_from_slice(slice: &mut [u8]) -> &mut Self {
        Self::assert_proper_alignment();
        let tree = Self::load_mut_bytes(slice).unwrap();
        tree.initialize();
        tree
    }
}

impl<const MAX_SIZE: usize> Llrb<MAX_SIZE> {
    fn assert_proper_alignment() {
        assert!(std::mem::size_of::<LlrbNode>() % std::mem::align_of::<LlrbNode>() == 0);
        assert!(std::mem::size_of::<LlrbNode>() % 8_usize == 0);
    }

    pub fn new() -> Self {
        Self::default()
    }

    #[inline(always)]
    pub fn initialize(&mut self) {
        self.arena.initialize();
    }

    pub fn len(&self) -> usize {
        self.arena.size as usize
    }

    pub fn capacity(&self) -> usize {
        MAX_SIZE - 1
    }

    pub fn get_node(&self, node: u32) -> &LlrbNode {
        self.arena.get(node).get_value()
    }

    fn get_node_mut(&mut self, node: u32) -> &mut LlrbNode {
        self.arena.get_mut(node).get_value_mut()
    }

    // ------------------------------------------------------------------
    // Empty-aware accessors. A link is empty when it is the sentinel or a
    // detached subtree root; every traversal and aggregate below bottoms
    // out on that notion, which is what keeps detached subtrees opaque to
    // the tree they hang off of.
    // ------------------------------------------------------------------

    #[inline(always)]
    pub fn is_dummy(&self, node: u32) -> bool {
        node == SENTINEL
    }

    pub fn mark(&self, node: u32) -> Mark {
        match FromPrimitive::from_u32(self.arena.mark(node)) {
            Some(mark) => mark,
            None => panic!("corrupt mark on node {}", node),
        }
    }

    #[inline(always)]
    pub fn is_external(&self, node: u32) -> bool {
        node != SENTINEL && self.arena.mark(node) == Mark::External as u32
    }

    #[inline(always)]
    pub fn is_empty(&self, node: u32) -> bool {
        node == SENTINEL || self.is_external(node)
    }

    #[inline(always)]
    pub fn key(&self, node: u32) -> u64 {
        self.get_node(node).key
    }

    #[inline(always)]
    pub fn left(&self, node: u32) -> u32 {
        self.arena.link(node, Dir::Left)
    }

    #[inline(always)]
    pub fn right(&self, node: u32) -> u32 {
        self.arena.link(node, Dir::Right)
    }

    #[inline(always)]
    pub fn is_red(&self, node: u32) -> bool {
        !self.is_empty(node) && self.arena.color(node) == Color::Red as u32
    }

    #[inline(always)]
    pub fn size(&self, node: u32) -> u32 {
        if self.is_empty(node) {
            0
        } else {
            self.get_node(node).size
        }
    }

    #[inline(always)]
    pub fn height(&self, node: u32) -> i32 {
        if self.is_empty(node) {
            -1
        } else {
            self.get_node(node).height
        }
    }

    #[inline(always)]
    pub fn depth(&self, node: u32) -> i32 {
        if self.is_empty(node) {
            i32::MIN
        } else {
            self.get_node(node).depth
        }
    }

    #[inline(always)]
    pub fn min_depth(&self, node: u32) -> i32 {
        if self.is_empty(node) {
            i32::MAX
        } else {
            self.get_node(node).min_depth
        }
    }

    #[inline(always)]
    pub fn max_depth(&self, node: u32) -> i32 {
        if self.is_empty(node) {
            i32::MIN
        } else {
            self.get_node(node).max_depth
        }
    }

    // ------------------------------------------------------------------
    // Link and color plumbing
    // ------------------------------------------------------------------

    #[inline(always)]
    pub(crate) fn set_left(&mut self, node: u32, child: u32) {
        self.arena.set_link(node, Dir::Left, child);
    }

    #[inline(always)]
    pub(crate) fn set_right(&mut self, node: u32, child: u32) {
        self.arena.set_link(node, Dir::Right, child);
    }

    pub fn set_mark(&mut self, node: u32, mark: Mark) {
        self.arena.set_mark(node, mark as u32);
    }

    #[inline(always)]
    fn color_red(&mut self, node: u32) {
        self.arena.set_color(node, Color::Red as u32);
    }

    #[inline(always)]
    fn color_black(&mut self, node: u32) {
        self.arena.set_color(node, Color::Black as u32);
    }

    #[inline(always)]
    fn set_color(&mut self, node: u32, color: u32) {
        self.arena.set_color(node, color);
    }

    #[inline(always)]
    fn color_of(&self, node: u32) -> u32 {
        self.arena.color(node)
    }

    pub(crate) fn allocate(&mut self, key: u64, depth: i32) -> u32 {
        self.arena.add_node(LlrbNode::new(key, depth))
    }

    fn free_node(&mut self, node: u32) {
        self.arena.release(node);
    }

    /// Recompute the aggregates of `node` from its children.
    pub(crate) fn update(&mut self, node: u32) {
        let (l, r) = (self.left(node), self.right(node));
        let size = self.size(l) + self.size(r) + 1;
        let height = self.height(l) + if self.is_red(l) { 0 } else { 1 };
        let min_depth = self.min_depth(l).min(self.min_depth(r));
        let max_depth = self.max_depth(l).max(self.max_depth(r));
        let value = self.get_node_mut(node);
        value.size = size;
        value.height = height;
        value.min_depth = value.depth.min(min_depth);
        value.max_depth = value.depth.max(max_depth);
    }

    /// Unlink both children of `node`, recolor it black, and return the
    /// previous links.
    pub fn detach(&mut self, node: u32) -> (u32, u32) {
        debug_assert!(!self.is_dummy(node));
        let (l, r) = (self.left(node), self.right(node));
        self.set_left(node, SENTINEL);
        self.set_right(node, SENTINEL);
        self.color_black(node);
        self.update(node);
        (l, r)
    }

    // ------------------------------------------------------------------
    // Rebalancing primitives
    // ------------------------------------------------------------------

    fn rotate_left(&mut self, h: u32) -> u32 {
        let x = self.right(h);
        debug_assert!(self.is_red(x));
        self.set_right(h, self.left(x));
        self.set_left(x, h);
        self.set_color(x, self.color_of(h));
        self.color_red(h);
        self.update(h);
        self.update(x);
        x
    }

    fn rotate_right(&mut self, h: u32) -> u32 {
        let x = self.left(h);
        debug_assert!(self.is_red(x));
        self.set_left(h, self.right(x));
        self.set_right(x, h);
        self.set_color(x, self.color_of(h));
        self.color_red(h);
        self.update(h);
        self.update(x);
        x
    }

    fn flip_colors(&mut self, h: u32) {
        debug_assert!(!self.is_empty(self.left(h)) && !self.is_empty(self.right(h)));
        self.flip_one(h);
        self.flip_one(self.left(h));
        self.flip_one(self.right(h));
    }

    #[inline(always)]
    fn flip_one(&mut self, node: u32) {
        self.set_color(node, 1 - self.color_of(node));
    }

    /// Restore the left-leaning invariants on the way back up a mutating
    /// recursion, then recompute aggregates.
    fn balance(&mut self, mut h: u32) -> u32 {
        if self.is_red(self.right(h)) && !self.is_red(self.left(h)) {
            h = self.rotate_left(h);
        }
        if self.is_red(self.left(h)) && self.is_red(self.left(self.left(h))) {
            h = self.rotate_right(h);
        }
        if self.is_red(self.left(h)) && self.is_red(self.right(h)) {
            self.flip_colors(h);
        }
        self.update(h);
        h
    }

    fn move_red_left(&mut self, mut h: u32) -> u32 {
        self.flip_colors(h);
        if self.is_red(self.left(self.right(h))) {
            let r = self.rotate_right(self.right(h));
            self.set_right(h, r);
            h = self.rotate_left(h);
            self.flip_colors(h);
        }
        h
    }

    fn move_red_right(&mut self, mut h: u32) -> u32 {
        self.flip_colors(h);
        if self.is_red(self.left(self.left(h))) {
            h = self.rotate_right(h);
            self.flip_colors(h);
        }
        h
    }

    // ------------------------------------------------------------------
    // Ordered-map operations
    // ------------------------------------------------------------------

    /// Descend from `root` by key. Returns `(node, parent)`. The walk stops
    /// on the key, on a detached subtree root (which is returned so the
    /// caller can see where the path detours), or on the sentinel; an
    /// absent key yields `(SENTINEL, SENTINEL)`.
    pub fn search_at(&self, root: u32, key: u64) -> (u32, u32) {
        let mut parent = SENTINEL;
        let mut node = root;
        loop {
            if self.is_dummy(node) {
                return (SENTINEL, SENTINEL);
            }
            if self.is_external(node) {
                return (node, parent);
            }
            match key.cmp(&self.key(node)) {
                Ordering::Equal => return (node, parent),
                Ordering::Less => {
                    parent = node;
                    node = self.left(node);
                }
                Ordering::Greater => {
                    parent = node;
                    node = self.right(node);
                }
            }
        }
    }

    pub fn contains(&self, key: u64) -> bool {
        let (node, _) = self.search_at(self.root as u32, key);
        !self.is_dummy(node) && !self.is_external(node)
    }

    /// Insert `key` into the set. Returns the arena index of the key's
    /// node, or `None` when the arena is full. Re-inserting a present key
    /// leaves the tree unchanged.
    pub fn insert(&mut self, key: u64) -> Option<u32> {
        let root = self.root as u32;
        let (existing, _) = self.search_at(root, key);
        if !self.is_dummy(existing) && !self.is_external(existing) {
            return Some(existing);
        }
        if self.len() >= self.capacity() {
            return None;
        }
        let x = self.allocate(key, 0);
        self.color_red(x);
        let new_root = self.insert_at(root, x);
        self.color_black(new_root);
        self.root = new_root as u64;
        Some(x)
    }

    fn insert_at(&mut self, h: u32, x: u32) -> u32 {
        debug_assert!(!self.is_external(h));
        if self.is_dummy(h) {
            return x;
        }
        if self.key(x) < self.key(h) {
            let l = self.insert_at(self.left(h), x);
            self.set_left(h, l);
        } else {
            let r = self.insert_at(self.right(h), x);
            self.set_right(h, r);
        }
        self.balance(h)
    }

    pub fn min(&self) -> Result<u64, TreeError> {
        self.min_at(self.root as u32).map(|node| self.key(node))
    }

    pub fn max(&self) -> Result<u64, TreeError> {
        self.max_at(self.root as u32).map(|node| self.key(node))
    }

    pub fn min_at(&self, h: u32) -> Result<u32, TreeError> {
        if self.is_dummy(h) {
            return Err(TreeError::EmptyTree);
        }
        Ok(self.min_index(h))
    }

    pub fn max_at(&self, h: u32) -> Result<u32, TreeError> {
        if self.is_dummy(h) {
            return Err(TreeError::EmptyTree);
        }
        Ok(self.max_index(h))
    }

    fn min_index(&self, h: u32) -> u32 {
        let mut node = h;
        while !self.is_empty(self.left(node)) {
            node = self.left(node);
        }
        node
    }

    fn max_index(&self, h: u32) -> u32 {
        let mut node = h;
        while !self.is_empty(self.right(node)) {
            node = self.right(node);
        }
        node
    }

    /// Remove `key` from the set. Returns false when absent.
    pub fn remove(&mut self, key: u64) -> bool {
        if !self.contains(key) {
            return false;
        }
        let mut root = self.root as u32;
        if !self.is_red(self.left(root)) && !self.is_red(self.right(root)) {
            self.color_red(root);
        }
        root = self.remove_at(root, key);
        self.color_black(root);
        self.root = root as u64;
        true
    }

    fn remove_at(&mut self, mut h: u32, key: u64) -> u32 {
        if key < self.key(h) {
            if !self.is_red(self.left(h)) && !self.is_red(self.left(self.left(h))) {
                h = self.move_red_left(h);
            }
            let l = self.remove_at(self.left(h), key);
            self.set_left(h, l);
        } else {
            if self.is_red(self.left(h)) {
                h = self.rotate_right(h);
            }
            if key == self.key(h) && self.is_empty(self.right(h)) {
                self.free_node(h);
                return SENTINEL;
            }
            if !self.is_red(self.right(h)) && !self.is_red(self.left(self.right(h))) {
                h = self.move_red_right(h);
            }
            if key == self.key(h) {
                // Replace this node's payload with its in-order successor
                // and delete the successor's slot instead.
                let (m, rest) = self.extract_min_rec(self.right(h));
                let successor = *self.get_node(m);
                let value = self.get_node_mut(h);
                value.key = successor.key;
                value.depth = successor.depth;
                self.free_node(m);
                self.set_right(h, rest);
            } else {
                let r = self.remove_at(self.right(h), key);
                self.set_right(h, r);
            }
        }
        self.balance(h)
    }

    pub fn remove_min(&mut self) -> Result<u64, TreeError> {
        let (m, rest) = self.extract_min_at(self.root as u32)?;
        self.root = rest as u64;
        let key = self.key(m);
        self.free_node(m);
        Ok(key)
    }

    pub fn remove_max(&mut self) -> Result<u64, TreeError> {
        let (rest, m) = self.extract_max_at(self.root as u32)?;
        self.root = rest as u64;
        let key = self.key(m);
        self.free_node(m);
        Ok(key)
    }

    // ------------------------------------------------------------------
    // Forest surgery
    // ------------------------------------------------------------------

    /// Unlink the minimum node of the tree rooted at `h` and return
    /// `(min, rest)`. The minimum's left link (always an empty link) is
    /// preserved for the caller to inspect; its right link has been spliced
    /// into `rest`, so the caller must `detach` the node before reusing it.
    pub fn extract_min_at(&mut self, h: u32) -> Result<(u32, u32), TreeError> {
        if self.is_dummy(h) {
            return Err(TreeError::EmptyTree);
        }
        if !self.is_red(self.left(h)) && !self.is_red(self.right(h)) {
            self.color_red(h);
        }
        let (m, rest) = self.extract_min_rec(h);
        self.color_black(rest);
        Ok((m, rest))
    }

    fn extract_min_rec(&mut self, mut h: u32) -> (u32, u32) {
        if self.is_empty(self.left(h)) {
            return (h, self.right(h));
        }
        if !self.is_red(self.left(h)) && !self.is_red(self.left(self.left(h))) {
            h = self.move_red_left(h);
        }
        let (m, rest) = self.extract_min_rec(self.left(h));
        self.set_left(h, rest);
        (m, self.balance(h))
    }

    /// Mirror image of `extract_min_at`: returns `(rest, max)` with the
    /// maximum's right link preserved and its left link spliced into
    /// `rest`.
    pub fn extract_max_at(&mut self, h: u32) -> Result<(u32, u32), TreeError> {
        if self.is_dummy(h) {
            return Err(TreeError::EmptyTree);
        }
        if !self.is_red(self.left(h)) && !self.is_red(self.right(h)) {
            self.color_red(h);
        }
        let (rest, m) = self.extract_max_rec(h);
        self.color_black(rest);
        Ok((rest, m))
    }

    fn extract_max_rec(&mut self, mut h: u32) -> (u32, u32) {
        if self.is_red(self.left(h)) {
            h = self.rotate_right(h);
        }
        if self.is_empty(self.right(h)) {
            return (self.left(h), h);
        }
        if !self.is_red(self.right(h)) && !self.is_red(self.left(self.right(h))) {
            h = self.move_red_right(h);
        }
        let (rest, m) = self.extract_max_rec(self.right(h));
        self.set_right(h, rest);
        (self.balance(h), m)
    }

    /// Concatenate `t1`, the isolated node `x`, and `t2` into one balanced
    /// tree. All keys of `t1` must be smaller than `x.key`, all keys of
    /// `t2` larger; `x` must have been detached and both inputs must be
    /// black-rooted (or empty). Returns the new black root.
    pub fn join_at(&mut self, t1: u32, x: u32, t2: u32) -> u32 {
        debug_assert!(!self.is_dummy(x));
        debug_assert!(self.left(x) == SENTINEL && self.right(x) == SENTINEL);
        let root = self.join_rec(t1, x, t2);
        self.color_black(root);
        root
    }

    fn join_rec(&mut self, t1: u32, x: u32, t2: u32) -> u32 {
        let h1 = self.height(t1);
        let h2 = self.height(t2);
        if h1 > h2 {
            // Walk down the right spine of the taller side until the black
            // heights meet.
            let merged = self.join_rec(self.right(t1), x, t2);
            self.set_right(t1, merged);
            return self.balance(t1);
        }
        if h1 < h2 || self.is_red(t2) {
            let merged = self.join_rec(t1, x, self.left(t2));
            self.set_left(t2, merged);
            return self.balance(t2);
        }
        self.set_left(x, t1);
        self.set_right(x, t2);
        self.color_red(x);
        self.balance(x)
    }

    /// Split the tree rooted at `h` around `key`, which must be present.
    /// Returns `(left, node, right)` where both halves are black-rooted
    /// trees and `node` is detached. On `KeyNotFound` the input tree has
    /// already been dismantled and must be discarded.
    pub fn split_at(&mut self, h: u32, key: u64) -> Result<(u32, u32, u32), TreeError> {
        if self.is_empty(h) {
            return Err(TreeError::KeyNotFound(key));
        }
        let (hl, hr) = self.detach(h);
        match key.cmp(&self.key(h)) {
            Ordering::Equal => {
                self.color_black(hl);
                self.color_black(hr);
                Ok((hl, h, hr))
            }
            Ordering::Less => {
                let (l, x, r) = self.split_at(hl, key)?;
                self.color_black(hr);
                let right = self.join_at(r, h, hr);
                Ok((l, x, right))
            }
            Ordering::Greater => {
                let (l, x, r) = self.split_at(hr, key)?;
                self.color_black(hl);
                let left = self.join_at(hl, h, l);
                Ok((left, x, r))
            }
        }
    }

    // ------------------------------------------------------------------
    // Reference-order boundary queries
    // ------------------------------------------------------------------

    /// Walk the tree rooted at `h` for the left boundary of the region
    /// whose reference depth reaches `threshold`. Returns `(boundary, top)`
    /// where `top` is the key of the shallowest node at or past the
    /// threshold encountered left-first, and `boundary` is the largest key
    /// left of the region (`None` when the region starts at the minimum).
    pub fn predecessor_at(&self, h: u32, threshold: i32) -> (Option<u64>, u64) {
        assert!(
            self.max_depth(h) >= threshold,
            "no node at depth {} under node {}",
            threshold,
            h
        );
        let left = self.left(h);
        if self.max_depth(left) >= threshold {
            return self.predecessor_at(left, threshold);
        }
        if self.depth(h) >= threshold {
            let boundary = if self.is_empty(left) {
                None
            } else {
                Some(self.key(self.max_index(left)))
            };
            return (boundary, self.key(h));
        }
        let (boundary, top) = self.predecessor_at(self.right(h), threshold);
        (boundary.or(Some(self.key(h))), top)
    }

    /// Mirror image of `predecessor_at`: right boundary of the deep region,
    /// found right-first.
    pub fn successor_at(&self, h: u32, threshold: i32) -> (Option<u64>, u64) {
        assert!(
            self.max_depth(h) >= threshold,
            "no node at depth {} under node {}",
            threshold,
            h
        );
        let right = self.right(h);
        if self.max_depth(right) >= threshold {
            return self.successor_at(right, threshold);
        }
        if self.depth(h) >= threshold {
            let boundary = if self.is_empty(right) {
                None
            } else {
                Some(self.key(self.min_index(right)))
            };
            return (boundary, self.key(h));
        }
        let (boundary, top) = self.successor_at(self.left(h), threshold);
        (boundary.or(Some(self.key(h))), top)
    }

    // ------------------------------------------------------------------
    // Traversal and diagnostics
    // ------------------------------------------------------------------

    /// In-order iterator over the physical subtree below `root`, detached
    /// subtrees included.
    pub fn iter_from(&self, root: u32) -> LlrbIterator<'_, MAX_SIZE> {
        LlrbIterator {
            tree: self,
            stack: vec![],
            node: root,
        }
    }

    pub fn iter(&self) -> LlrbIterator<'_, MAX_SIZE> {
        self.iter_from(self.root as u32)
    }

    pub fn pretty_print(&self) {
        println!("{}", self.pretty_string());
    }

    pub(crate) fn pretty_string(&self) -> String {
        let mut s = String::new();
        let mut stack = vec![(self.root as u32, "".to_string(), "".to_string())];
        while let Some((node, mut padding, pointer)) = stack.pop() {
            if node == SENTINEL {
                continue;
            }
            let value = self.get_node(node);
            s.push_str(&padding);
            s.push_str(&pointer);
            let label = format!("{} (d={})", value.key, value.depth);
            if self.is_red(node) {
                s.push_str(&format!("{}", label.red()));
            } else if self.is_external(node) {
                s.push_str(&format!("{}", label.dimmed()));
            } else {
                s.push_str(&label);
            }
            s.push('\n');
            padding.push_str("│  ");

            let right_pointer = "└──".to_string();
            let left_pointer = if self.right(node) != SENTINEL {
                "├──".to_string()
            } else {
                "└──".to_string()
            };

            stack.push((self.right(node), padding.clone(), right_pointer));
            stack.push((self.left(node), padding.clone(), left_pointer));
        }
        s
    }

    /// Check the red-black shape of the tree rooted at `root`: black root,
    /// no red right links, no two reds in a row, and equal black-link
    /// counts on every path down to an empty link. `root` itself is treated
    /// as occupied regardless of its mark, so a detached root can be
    /// validated as the head of its own tree.
    pub fn is_valid_llrb(&self, root: u32) -> bool {
        if self.is_dummy(root) {
            return true;
        }
        !self.is_red(root) && self.black_links(root).is_some()
    }

    fn black_links(&self, h: u32) -> Option<i32> {
        let (l, r) = (self.left(h), self.right(h));
        if self.is_red(r) {
            return None;
        }
        if self.is_red(h) && self.is_red(l) {
            return None;
        }
        let lb = if self.is_empty(l) { 0 } else { self.black_links(l)? };
        let rb = if self.is_empty(r) { 0 } else { self.black_links(r)? };
        let through_left = lb + if self.is_red(l) { 0 } else { 1 };
        let through_right = rb + if self.is_red(r) { 0 } else { 1 };
        if through_left == through_right {
            Some(through_left)
        } else {
            None
        }
    }

    /// Check key ordering over the physical subtree, detached subtrees
    /// included.
    pub fn is_bst(&self, root: u32) -> bool {
        self.check_bst(root, None, None)
    }

    fn check_bst(&self, h: u32, lo: Option<u64>, hi: Option<u64>) -> bool {
        if self.is_dummy(h) {
            return true;
        }
        let key = self.key(h);
        if lo.map_or(false, |bound| key <= bound) || hi.map_or(false, |bound| key >= bound) {
            return false;
        }
        self.check_bst(self.left(h), lo, Some(key)) && self.check_bst(self.right(h), Some(key), hi)
    }

    /// Check that every stored aggregate in the tree rooted at `root`
    /// equals its recomputation from the children. Like `is_valid_llrb`,
    /// `root` is treated as occupied; recursion stops at empty links.
    pub fn aggregates_consistent(&self, root: u32) -> bool {
        if self.is_dummy(root) {
            return true;
        }
        let (l, r) = (self.left(root), self.right(root));
        if !self.is_empty(l) && !self.aggregates_consistent(l) {
            return false;
        }
        if !self.is_empty(r) && !self.aggregates_consistent(r) {
            return false;
        }
        let value = self.get_node(root);
        value.size == self.size(l) + self.size(r) + 1
            && value.height == self.height(l) + if self.is_red(l) { 0 } else { 1 }
            && value.min_depth == value.depth.min(self.min_depth(l)).min(self.min_depth(r))
            && value.max_depth == value.depth.max(self.max_depth(l)).max(self.max_depth(r))
    }
}

pub struct LlrbIterator<'a, const MAX_SIZE: usize> {
    tree: &'a Llrb<MAX_SIZE>,
    stack: Vec<u32>,
    node: u32,
}

impl<'a, const MAX_SIZE: usize> Iterator for LlrbIterator<'a, MAX_SIZE> {
    type Item = u32;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.stack.is_empty() || self.node != SENTINEL {
            if self.node != SENTINEL {
                self.stack.push(self.node);
                self.node = self.tree.left(self.node);
            } else {
                let node = self.stack.pop().unwrap();
                self.node = self.tree.right(node);
                return Some(node);
            }
        }
        None
    }
}

#[cfg(test)]
fn assert_shape<const MAX_SIZE: usize>(tree: &Llrb<MAX_SIZE>) {
    let root = tree.root as u32;
    assert!(tree.is_valid_llrb(root));
    assert!(tree.is_bst(root));
    assert!(tree.aggregates_consistent(root));
}

#[cfg(test)]
fn scrambled_keys(n: u64) -> Vec<u64> {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    (0..n)
        .map(|k| {
            let mut hasher = DefaultHasher::new();
            k.hash(&mut hasher);
            hasher.finish()
        })
        .collect()
}

#[test]
fn test_insert_ascending_keeps_balance() {
    type Tree = Llrb<128>;
    let mut buf = vec![0u8; std::mem::size_of::<Tree>()];
    let tree = Tree::new_from_slice(buf.as_mut_slice());
    for key in 1..=64u64 {
        tree.insert(key).unwrap();
        assert_shape(tree);
    }
    assert_eq!(tree.len(), 64);
    for key in 1..=64u64 {
        assert!(tree.contains(key));
    }
    assert!(!tree.contains(0));
    assert!(!tree.contains(65));
}

#[test]
fn test_insert_duplicate_leaves_set_unchanged() {
    type Tree = Llrb<16>;
    let mut buf = vec![0u8; std::mem::size_of::<Tree>()];
    let tree = Tree::new_from_slice(buf.as_mut_slice());
    let first = tree.insert(7).unwrap();
    let second = tree.insert(7).unwrap();
    assert_eq!(first, second);
    assert_eq!(tree.len(), 1);
    assert_shape(tree);
}

#[test]
fn test_insert_returns_none_when_full() {
    type Tree = Llrb<4>;
    let mut buf = vec![0u8; std::mem::size_of::<Tree>()];
    let tree = Tree::new_from_slice(buf.as_mut_slice());
    assert!(tree.insert(1).is_some());
    assert!(tree.insert(2).is_some());
    assert!(tree.insert(3).is_some());
    assert!(tree.insert(4).is_none());
    assert_eq!(tree.len(), tree.capacity());
}

#[test]
fn test_min_max_and_empty_errors() {
    type Tree = Llrb<32>;
    let mut buf = vec![0u8; std::mem::size_of::<Tree>()];
    let tree = Tree::new_from_slice(buf.as_mut_slice());
    assert_eq!(tree.min(), Err(TreeError::EmptyTree));
    assert_eq!(tree.max(), Err(TreeError::EmptyTree));
    assert_eq!(tree.remove_min(), Err(TreeError::EmptyTree));
    assert_eq!(tree.remove_max(), Err(TreeError::EmptyTree));
    for key in [9u64, 2, 14, 5, 11] {
        tree.insert(key).unwrap();
    }
    assert_eq!(tree.min(), Ok(2));
    assert_eq!(tree.max(), Ok(14));
}

#[test]
fn test_remove_scrambled_order() {
    type Tree = Llrb<128>;
    let mut buf = vec![0u8; std::mem::size_of::<Tree>()];
    let tree = Tree::new_from_slice(buf.as_mut_slice());
    let keys = scrambled_keys(64);
    for &key in keys.iter() {
        tree.insert(key).unwrap();
        assert_shape(tree);
    }
    for &key in keys.iter() {
        assert!(tree.remove(key));
        assert!(!tree.contains(key));
        assert_shape(tree);
    }
    assert_eq!(tree.len(), 0);
}

#[test]
fn test_remove_absent_returns_unchanged() {
    type Tree = Llrb<16>;
    let mut buf = vec![0u8; std::mem::size_of::<Tree>()];
    let tree = Tree::new_from_slice(buf.as_mut_slice());
    for key in [4u64, 8, 12] {
        tree.insert(key).unwrap();
    }
    assert!(!tree.remove(5));
    assert_eq!(tree.len(), 3);
    assert_shape(tree);
}

#[test]
fn test_remove_min_and_max_walk_both_ends() {
    type Tree = Llrb<64>;
    let mut buf = vec![0u8; std::mem::size_of::<Tree>()];
    let tree = Tree::new_from_slice(buf.as_mut_slice());
    for key in 1..=16u64 {
        tree.insert(key).unwrap();
    }
    for expected in 1..=8u64 {
        assert_eq!(tree.remove_min(), Ok(expected));
        assert_shape(tree);
    }
    for expected in (9..=16u64).rev() {
        assert_eq!(tree.remove_max(), Ok(expected));
        assert_shape(tree);
    }
    assert_eq!(tree.len(), 0);
}

#[test]
fn test_search_at_returns_node_and_parent() {
    type Tree = Llrb<32>;
    let mut buf = vec![0u8; std::mem::size_of::<Tree>()];
    let tree = Tree::new_from_slice(buf.as_mut_slice());
    for key in 1..=7u64 {
        tree.insert(key).unwrap();
    }
    let root = tree.root as u32;
    let (node, parent) = tree.search_at(root, tree.key(root));
    assert_eq!(node, root);
    assert_eq!(parent, SENTINEL);
    let (node, parent) = tree.search_at(root, 1);
    assert_eq!(tree.key(node), 1);
    assert!(tree.left(parent) == node || tree.right(parent) == node);
    assert_eq!(tree.search_at(root, 99), (SENTINEL, SENTINEL));
}

#[test]
/// Splitting at any present key and joining the three parts back must
/// reproduce the original key set with all shape invariants intact.
fn test_split_join_roundtrip() {
    type Tree = Llrb<64>;
    for split_key in [1u64, 7, 16, 25, 31] {
        let mut buf = vec![0u8; std::mem::size_of::<Tree>()];
        let tree = Tree::new_from_slice(buf.as_mut_slice());
        for key in 1..=31u64 {
            tree.insert(key).unwrap();
        }
        let (left, x, right) = tree.split_at(tree.root as u32, split_key).unwrap();
        assert_eq!(tree.key(x), split_key);
        assert_eq!(tree.left(x), SENTINEL);
        assert_eq!(tree.right(x), SENTINEL);
        assert!(tree.is_valid_llrb(left) && tree.is_valid_llrb(right));
        assert!(tree.aggregates_consistent(left) && tree.aggregates_consistent(right));
        let left_keys: Vec<u64> = tree.iter_from(left).map(|n| tree.key(n)).collect();
        let right_keys: Vec<u64> = tree.iter_from(right).map(|n| tree.key(n)).collect();
        assert_eq!(left_keys, (1..split_key).collect::<Vec<u64>>());
        assert_eq!(right_keys, (split_key + 1..=31).collect::<Vec<u64>>());

        let joined = tree.join_at(left, x, right);
        tree.root = joined as u64;
        assert_shape(tree);
        let keys: Vec<u64> = tree.iter().map(|n| tree.key(n)).collect();
        assert_eq!(keys, (1..=31).collect::<Vec<u64>>());

        // Splitting the joined tree at the same key recovers the halves.
        let (left2, x2, right2) = tree.split_at(joined, split_key).unwrap();
        assert_eq!(tree.key(x2), split_key);
        let left2_keys: Vec<u64> = tree.iter_from(left2).map(|n| tree.key(n)).collect();
        let right2_keys: Vec<u64> = tree.iter_from(right2).map(|n| tree.key(n)).collect();
        assert_eq!(left2_keys, (1..split_key).collect::<Vec<u64>>());
        assert_eq!(right2_keys, (split_key + 1..=31).collect::<Vec<u64>>());
        assert!(tree.is_valid_llrb(left2) && tree.is_valid_llrb(right2));
    }
}

#[test]
fn test_split_absent_key_is_reported() {
    type Tree = Llrb<32>;
    let mut buf = vec![0u8; std::mem::size_of::<Tree>()];
    let tree = Tree::new_from_slice(buf.as_mut_slice());
    for key in [2u64, 4, 6, 8] {
        tree.insert(key).unwrap();
    }
    assert_eq!(
        tree.split_at(tree.root as u32, 5),
        Err(TreeError::KeyNotFound(5))
    );
}

#[test]
/// Extracting the minimum and re-adding its key restores the key set.
fn test_extract_min_then_reinsert() {
    type Tree = Llrb<64>;
    let mut buf = vec![0u8; std::mem::size_of::<Tree>()];
    let tree = Tree::new_from_slice(buf.as_mut_slice());
    let keys = scrambled_keys(20);
    for &key in keys.iter() {
        tree.insert(key).unwrap();
    }
    let smallest = tree.min().unwrap();
    let (m, rest) = tree.extract_min_at(tree.root as u32).unwrap();
    assert_eq!(tree.key(m), smallest);
    assert_eq!(tree.left(m), SENTINEL);
    tree.root = rest as u64;
    assert!(tree.is_valid_llrb(rest));
    assert!(!tree.contains(smallest));
    tree.free_node(m);
    tree.insert(smallest).unwrap();
    assert_shape(tree);
    let mut sorted = keys.clone();
    sorted.sort_unstable();
    sorted.dedup();
    let stored: Vec<u64> = tree.iter().map(|n| tree.key(n)).collect();
    assert_eq!(stored, sorted);
}

#[test]
fn test_pretty_print_draws_every_node() {
    type Tree = Llrb<16>;
    let mut buf = vec![0u8; std::mem::size_of::<Tree>()];
    let tree = Tree::new_from_slice(buf.as_mut_slice());
    tree.insert(2).unwrap();
    tree.insert(1).unwrap();
    tree.insert(3).unwrap();
    let rendered = tree.pretty_string();
    for label in ["1 (d=0)", "2 (d=0)", "3 (d=0)"] {
        assert!(rendered.contains(label));
    }
    assert!(rendered.contains("├──"));
    assert!(rendered.contains("└──"));
    tree.pretty_print();
}

#[test]
fn test_extract_max_leaves_valid_rest() {
    type Tree = Llrb<64>;
    let mut buf = vec![0u8; std::mem::size_of::<Tree>()];
    let tree = Tree::new_from_slice(buf.as_mut_slice());
    for key in 1..=20u64 {
        tree.insert(key).unwrap();
    }
    let (rest, m) = tree.extract_max_at(tree.root as u32).unwrap();
    assert_eq!(tree.key(m), 20);
    assert_eq!(tree.right(m), SENTINEL);
    tree.root = rest as u64;
    assert!(tree.is_valid_llrb(rest));
    assert!(tree.aggregates_consistent(rest));
    assert_eq!(tree.max(), Ok(19));
}
