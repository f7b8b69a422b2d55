use bytemuck::{Pod, Zeroable};
use std::cmp::Ordering;

use crate::arena::{FromSlice, ZeroCopy, SENTINEL};
use crate::llrb::{Llrb, Mark};

/// A Tango tree over the fixed key universe `{1..n}`.
///
/// The structure is a forest of small left-leaning red-black trees, one per
/// preferred path of a conceptual perfectly balanced reference tree, all
/// sharing one arena. Path trees are stitched together through `External`
/// roots; a search that runs into such a root restructures the stitching so
/// that its own path becomes preferred.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct TangoTree<const MAX_SIZE: usize> {
    tree: Llrb<MAX_SIZE>,
}

unsafe impl<const MAX_SIZE: usize> Zeroable for TangoTree<MAX_SIZE> {}
unsafe impl<const MAX_SIZE: usize> Pod for TangoTree<MAX_SIZE> {}
impl<const MAX_SIZE: usize> ZeroCopy for TangoTree<MAX_SIZE> {}

impl<const MAX_SIZE: usize> Default for TangoTree<MAX_SIZE> {
    fn default() -> Self {
        TangoTree {
            tree: Llrb::default(),
        }
    }
}

impl<const MAX_SIZE: usize> FromSlice for TangoTree<MAX_SIZE> {
    fn new_from_slice(slice: &mut [u8]) -> &mut Self {
        let tango = Self::load_mut_bytes(slice).unwrap();
        tango.initialize();
        tango
    }
}

impl<const MAX_SIZE: usize> TangoTree<MAX_SIZE> {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline(always)]
    pub fn initialize(&mut self) {
        self.tree.initialize();
    }

    /// Number of keys in the universe.
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    /// Read access to the underlying forest.
    pub fn tree(&self) -> &Llrb<MAX_SIZE> {
        &self.tree
    }

    /// Allocate the reference tree over `{1..n}`: a perfectly balanced BST
    /// built by midpoint, every node initially the detached root of its own
    /// single-node path tree, except the overall root.
    pub fn build(&mut self, n: u32) {
        assert!(n > 0, "universe must be non-empty");
        assert!(
            n as usize <= self.tree.capacity(),
            "universe of {} keys exceeds arena capacity {}",
            n,
            self.tree.capacity()
        );
        assert!(self.tree.len() == 0, "tree was already built");
        let root = self.build_range(1, n as u64, 0);
        self.tree.set_mark(root, Mark::Regular);
        self.tree.root = root as u64;
    }

    fn build_range(&mut self, lo: u64, hi: u64, depth: i32) -> u32 {
        if lo > hi {
            return SENTINEL;
        }
        let mid = (lo + hi + 1) / 2;
        let node = self.tree.allocate(mid, depth);
        let left = self.build_range(lo, mid - 1, depth + 1);
        let right = self.build_range(mid + 1, hi, depth + 1);
        self.tree.set_left(node, left);
        self.tree.set_right(node, right);
        self.tree.set_mark(node, Mark::External);
        self.tree.update(node);
        node
    }

    /// Look up `key`, restructuring the forest so that afterwards the key
    /// lies on the preferred path of the root. Returns false when the key
    /// is outside the universe, in which case nothing changes.
    pub fn search(&mut self, key: u64) -> bool {
        loop {
            let (q, p) = self.tree.search_at(self.tree.root as u32, key);
            if self.tree.is_dummy(q) {
                return false;
            }
            if !self.tree.is_external(q) {
                return true;
            }
            let root = self.splice(q, p);
            self.tree.root = root as u64;
        }
    }

    /// Inherit the preferred path of the detached subtree rooted at `q`
    /// (with parent `p`) into the root path tree, cutting away whatever
    /// part of the old path lies deeper than the fork.
    fn splice(&mut self, q: u32, p: u32) -> u32 {
        let h = self.tree.root as u32;
        debug_assert!(self.tree.is_external(q));
        debug_assert!(!self.tree.is_dummy(p));
        // Read through the boundary: the accessor would report a detached
        // root as empty.
        let q_min_depth = self.tree.get_node(q).min_depth;
        if self.tree.max_depth(h) < q_min_depth {
            self.splice_flat(h, q, p)
        } else {
            self.splice_deep(h, q, p)
        }
    }

    /// Everything below `q` is deeper than the whole current path, so no
    /// eviction is needed: open the path at `p` and concatenate `q`'s path.
    fn splice_flat(&mut self, h: u32, q: u32, p: u32) -> u32 {
        let on_left = self.tree.left(p) == q;
        debug_assert!(on_left || self.tree.right(p) == q);
        self.tree.set_mark(q, Mark::Regular);
        let p_key = self.tree.key(p);
        if on_left {
            let (m, rest) = self
                .tree
                .extract_min_at(q)
                .expect("boundary subtree is never empty");
            self.tree.set_left(p, self.tree.left(m));
            self.tree.detach(m);
            let (below, mid, above) = self
                .tree
                .split_at(h, p_key)
                .expect("parent key is on the path");
            let merged = self.tree.join_at(rest, mid, above);
            self.tree.join_at(below, m, merged)
        } else {
            let (rest, m) = self
                .tree
                .extract_max_at(q)
                .expect("boundary subtree is never empty");
            self.tree.set_right(p, self.tree.right(m));
            self.tree.detach(m);
            let (below, mid, above) = self
                .tree
                .split_at(h, p_key)
                .expect("parent key is on the path");
            let merged = self.tree.join_at(below, mid, rest);
            self.tree.join_at(merged, m, above)
        }
    }

    /// The current path dives at least as deep as `q`'s subtree. Carve the
    /// deep segment out between its two boundary keys, demote it to a
    /// detached subtree, and stitch `q`'s path in around it.
    fn splice_deep(&mut self, h: u32, q: u32, p: u32) -> u32 {
        let on_left = self.tree.left(p) == q;
        debug_assert!(on_left || self.tree.right(p) == q);
        let threshold = self.tree.get_node(q).min_depth;
        let (lo, top_left) = self.tree.predecessor_at(h, threshold);
        let (hi, _) = self.tree.successor_at(h, threshold);
        self.tree.set_mark(q, Mark::Regular);
        let q_key = self.tree.key(q);
        // The splice anchor is the boundary node of q's tree on the side
        // away from the evicted segment.
        let (anchor, rest) = if top_left < q_key {
            let (rest, m) = self
                .tree
                .extract_max_at(q)
                .expect("boundary subtree is never empty");
            let boundary = self.tree.right(m);
            if on_left {
                self.tree.set_left(p, boundary);
            } else {
                self.tree.set_right(p, boundary);
            }
            self.tree.detach(m);
            (m, rest)
        } else {
            let (m, rest) = self
                .tree
                .extract_min_at(q)
                .expect("boundary subtree is never empty");
            let boundary = self.tree.left(m);
            if on_left {
                self.tree.set_left(p, boundary);
            } else {
                self.tree.set_right(p, boundary);
            }
            self.tree.detach(m);
            (m, rest)
        };
        let (below, x_lo, remainder) = match lo {
            Some(key) => self
                .tree
                .split_at(h, key)
                .expect("boundary key is on the path"),
            None => (SENTINEL, SENTINEL, h),
        };
        let (evicted, x_hi, above) = match hi {
            Some(key) => self
                .tree
                .split_at(remainder, key)
                .expect("boundary key is on the path"),
            None => (remainder, SENTINEL, SENTINEL),
        };
        debug_assert!(evicted != SENTINEL);
        self.tree.set_mark(evicted, Mark::External);
        if self.tree.key(evicted) < q_key {
            debug_assert!(x_hi != SENTINEL);
            let joined = if x_lo == SENTINEL {
                evicted
            } else {
                self.tree.join_at(below, x_lo, evicted)
            };
            let with_path = self.tree.join_at(joined, x_hi, rest);
            self.tree.join_at(with_path, anchor, above)
        } else {
            debug_assert!(x_lo != SENTINEL);
            let joined = if x_hi == SENTINEL {
                evicted
            } else {
                self.tree.join_at(evicted, x_hi, above)
            };
            let with_path = self.tree.join_at(rest, x_lo, joined);
            self.tree.join_at(below, anchor, with_path)
        }
    }

    /// Locate a key anywhere in the forest without restructuring.
    pub fn find(&self, key: u64) -> Option<u32> {
        let mut node = self.tree.root as u32;
        while !self.tree.is_dummy(node) {
            match key.cmp(&self.tree.key(node)) {
                Ordering::Equal => return Some(node),
                Ordering::Less => node = self.tree.left(node),
                Ordering::Greater => node = self.tree.right(node),
            }
        }
        None
    }

    pub fn contains(&self, key: u64) -> bool {
        self.find(key).is_some()
    }

    pub fn mark_of(&self, key: u64) -> Option<Mark> {
        self.find(key).map(|node| self.tree.mark(node))
    }

    /// True when `key` is reachable from the root without crossing into a
    /// detached subtree.
    pub fn on_preferred_path(&self, key: u64) -> bool {
        self.tree.contains(key)
    }

    /// Render the whole forest in order, one node per line, indented three
    /// spaces per level of the stitched tree. Nodes on a preferred path are
    /// wrapped in ANSI red.
    pub fn show(&self) -> String {
        let mut out = String::new();
        self.render(self.tree.root as u32, 0, &mut out);
        out
    }

    fn render(&self, node: u32, level: usize, out: &mut String) {
        if self.tree.is_dummy(node) {
            return;
        }
        self.render(self.tree.left(node), level + 1, out);
        for _ in 0..level {
            out.push_str("   ");
        }
        let value = self.tree.get_node(node);
        if self.tree.mark(node) == Mark::Regular {
            out.push_str(&format!(
                "\u{1b}[31m({}, d={})\u{1b}[0m\n",
                value.key, value.depth
            ));
        } else {
            out.push_str(&format!("({}, d={})\n", value.key, value.depth));
        }
        self.render(self.tree.right(node), level + 1, out);
    }

    pub fn pretty_print(&self) {
        self.tree.pretty_print();
    }

    /// Full structural audit: global key ordering, the exact `{1..n}` key
    /// universe, and for the root path tree and every detached root a
    /// red-black shape check, an aggregate recomputation, and the
    /// one-node-per-depth path shape.
    pub fn is_valid(&self) -> bool {
        let root = self.tree.root as u32;
        if self.tree.is_dummy(root) {
            return self.tree.len() == 0;
        }
        if self.tree.is_external(root) || self.tree.is_red(root) {
            return false;
        }
        if !self.tree.is_bst(root) {
            return false;
        }
        let keys: Vec<u64> = self.tree.iter().map(|node| self.tree.key(node)).collect();
        if keys.len() != self.tree.len() {
            return false;
        }
        if keys.iter().enumerate().any(|(i, &key)| key != i as u64 + 1) {
            return false;
        }
        for node in self.tree.iter() {
            if node == root || self.tree.is_external(node) {
                if !self.tree.is_valid_llrb(node) {
                    return false;
                }
                if !self.tree.aggregates_consistent(node) {
                    return false;
                }
                if !self.path_shape_ok(node) {
                    return false;
                }
            }
        }
        true
    }

    /// The nodes of one path tree must sit on consecutive reference depths,
    /// one node per depth.
    fn path_shape_ok(&self, path_root: u32) -> bool {
        let mut depths = vec![];
        self.collect_path_depths(path_root, &mut depths);
        depths.sort_unstable();
        depths.windows(2).all(|pair| pair[1] == pair[0] + 1)
    }

    fn collect_path_depths(&self, node: u32, out: &mut Vec<i32>) {
        out.push(self.tree.get_node(node).depth);
        for child in [self.tree.left(node), self.tree.right(node)] {
            if !self.tree.is_empty(child) {
                self.collect_path_depths(child, out);
            }
        }
    }
}

#[test]
fn test_build_reference_tree() {
    type Tango = TangoTree<32>;
    let mut buf = vec![0u8; std::mem::size_of::<Tango>()];
    let tango = Tango::new_from_slice(buf.as_mut_slice());
    tango.build(15);
    assert_eq!(tango.len(), 15);
    assert!(tango.is_valid());
    for (key, depth) in [
        (8u64, 0),
        (4, 1),
        (12, 1),
        (2, 2),
        (6, 2),
        (10, 2),
        (14, 2),
        (1, 3),
        (3, 3),
        (5, 3),
        (7, 3),
        (9, 3),
        (11, 3),
        (13, 3),
        (15, 3),
    ] {
        let node = tango.find(key).unwrap();
        assert_eq!(tango.tree().get_node(node).depth, depth);
    }
    assert_eq!(tango.mark_of(8), Some(Mark::Regular));
    for key in (1..=15u64).filter(|&k| k != 8) {
        assert_eq!(tango.mark_of(key), Some(Mark::External));
        assert!(!tango.on_preferred_path(key));
    }
    assert!(tango.on_preferred_path(8));
}

#[test]
#[should_panic(expected = "universe must be non-empty")]
fn test_build_rejects_empty_universe() {
    type Tango = TangoTree<8>;
    let mut buf = vec![0u8; std::mem::size_of::<Tango>()];
    let tango = Tango::new_from_slice(buf.as_mut_slice());
    tango.build(0);
}

#[test]
fn test_search_root_is_noop() {
    type Tango = TangoTree<32>;
    let mut buf = vec![0u8; std::mem::size_of::<Tango>()];
    let tango = Tango::new_from_slice(buf.as_mut_slice());
    tango.build(15);
    let before = tango.show();
    assert!(tango.search(8));
    assert_eq!(tango.show(), before);
    assert!(tango.is_valid());
}

#[test]
fn test_search_absorbs_left_child() {
    type Tango = TangoTree<32>;
    let mut buf = vec![0u8; std::mem::size_of::<Tango>()];
    let tango = Tango::new_from_slice(buf.as_mut_slice());
    tango.build(15);
    assert!(tango.search(4));
    assert!(tango.is_valid());
    assert!(tango.on_preferred_path(8));
    assert!(tango.on_preferred_path(4));
    assert_eq!(tango.mark_of(4), Some(Mark::Regular));
    assert_eq!(tango.mark_of(2), Some(Mark::External));
    assert_eq!(tango.mark_of(6), Some(Mark::External));
    assert_eq!(tango.mark_of(12), Some(Mark::External));
}

#[test]
/// Walking the searches 4, 10, 1, 9 over the 15-key universe exercises
/// both splice cases: path growth with no eviction, and segment eviction
/// on both sides of the fork.
fn test_search_sequence_reshapes_preferred_paths() {
    type Tango = TangoTree<32>;
    let mut buf = vec![0u8; std::mem::size_of::<Tango>()];
    let tango = Tango::new_from_slice(buf.as_mut_slice());
    tango.build(15);

    assert!(tango.search(4));
    assert!(tango.is_valid());

    assert!(tango.search(10));
    assert!(tango.is_valid());
    for key in [8u64, 12, 10] {
        assert!(tango.on_preferred_path(key));
    }
    // The old deep segment rooted at 4 was evicted into its own subtree.
    assert_eq!(tango.mark_of(4), Some(Mark::External));
    assert!(!tango.on_preferred_path(4));

    assert!(tango.search(1));
    assert!(tango.is_valid());
    for key in [8u64, 4, 2, 1] {
        assert!(tango.on_preferred_path(key));
    }
    assert_eq!(tango.mark_of(12), Some(Mark::External));
    assert_eq!(tango.mark_of(10), Some(Mark::Regular));
    assert!(!tango.on_preferred_path(10));

    assert!(tango.search(9));
    assert!(tango.is_valid());
    for key in [8u64, 12, 10, 9] {
        assert!(tango.on_preferred_path(key));
    }
    assert_eq!(tango.mark_of(2), Some(Mark::External));
    assert!(!tango.on_preferred_path(1));

    tango.pretty_print();
    let rendered = tango.tree().pretty_string();
    for key in 1..=15u64 {
        assert!(rendered.contains(&format!("{} (d=", key)));
    }
}

#[test]
fn test_search_is_idempotent() {
    type Tango = TangoTree<32>;
    let mut buf = vec![0u8; std::mem::size_of::<Tango>()];
    let tango = Tango::new_from_slice(buf.as_mut_slice());
    tango.build(15);
    for key in [4u64, 10, 1, 9, 15] {
        assert!(tango.search(key));
        let settled = tango.show();
        assert!(tango.search(key));
        assert_eq!(tango.show(), settled);
    }
}

#[test]
fn test_search_outside_universe_changes_nothing() {
    type Tango = TangoTree<32>;
    let mut buf = vec![0u8; std::mem::size_of::<Tango>()];
    let tango = Tango::new_from_slice(buf.as_mut_slice());
    tango.build(15);
    tango.search(4);
    let before = tango.show();
    assert!(!tango.search(0));
    assert!(!tango.search(16));
    assert_eq!(tango.show(), before);
    assert!(tango.is_valid());
}

#[test]
fn test_show_colors_exactly_the_preferred_paths() {
    type Tango = TangoTree<8>;
    let mut buf = vec![0u8; std::mem::size_of::<Tango>()];
    let tango = Tango::new_from_slice(buf.as_mut_slice());
    tango.build(3);
    assert_eq!(
        tango.show(),
        "   (1, d=1)\n\u{1b}[31m(2, d=0)\u{1b}[0m\n   (3, d=1)\n"
    );
    assert!(tango.search(1));
    assert_eq!(
        tango.show(),
        "   \u{1b}[31m(1, d=1)\u{1b}[0m\n\u{1b}[31m(2, d=0)\u{1b}[0m\n   (3, d=1)\n"
    );
}

#[test]
/// After one search the root path tree holds keys {8, 4}; the deep-region
/// boundary queries must report the segment below depth 1 as spanning
/// everything left of key 8.
fn test_boundary_queries_locate_deep_segment() {
    type Tango = TangoTree<32>;
    let mut buf = vec![0u8; std::mem::size_of::<Tango>()];
    let tango = Tango::new_from_slice(buf.as_mut_slice());
    tango.build(15);
    tango.search(4);
    let tree = tango.tree();
    let root = tree.root as u32;
    assert_eq!(tree.predecessor_at(root, 1), (None, 4));
    assert_eq!(tree.successor_at(root, 1), (Some(8), 4));
}

#[test]
fn test_every_key_reachable_after_search() {
    type Tango = TangoTree<64>;
    let mut buf = vec![0u8; std::mem::size_of::<Tango>()];
    let tango = Tango::new_from_slice(buf.as_mut_slice());
    tango.build(63);
    for key in 1..=63u64 {
        assert!(tango.search(key));
        assert!(tango.on_preferred_path(key));
        assert!(tango.is_valid());
    }
}
