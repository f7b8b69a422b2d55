use itertools::Itertools;
use rand::seq::SliceRandom;
use rand::thread_rng;
use rand::Rng;
use std::collections::BTreeSet;
use tango_tree::arena::FromSlice;
use tango_tree::*;

const MAX_SIZE: usize = 512;

type Tree = Llrb<MAX_SIZE>;
type Tango = TangoTree<MAX_SIZE>;

fn assert_tree_shape(tree: &Tree) {
    let root = tree.root as u32;
    assert!(tree.is_valid_llrb(root));
    assert!(tree.is_bst(root));
    assert!(tree.aggregates_consistent(root));
}

fn stored_keys(tree: &Tree) -> Vec<u64> {
    tree.iter().map(|node| tree.key(node)).collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_simulate_llrb_against_btree_set() {
    let mut buf = vec![0u8; std::mem::size_of::<Tree>()];
    let tree = Tree::new_from_slice(buf.as_mut_slice());
    println!(
        "{} Memory Size: {}, Capacity: {}",
        std::any::type_name::<Tree>(),
        std::mem::size_of::<Tree>(),
        tree.capacity()
    );
    let mut rng = thread_rng();
    let mut set = BTreeSet::new();
    let mut keys: Vec<u64> = vec![];

    for _ in 0..tree.capacity() {
        let key = rng.gen::<u64>();
        assert!(tree.insert(key).is_some());
        set.insert(key);
        keys.push(key);
    }
    assert_eq!(tree.len(), set.len());
    assert!(tree.insert(rng.gen::<u64>()).is_none());
    assert_tree_shape(tree);
    assert_eq!(stored_keys(tree), set.iter().copied().collect::<Vec<u64>>());

    // Random churn: remove half, add some back, checking shape throughout.
    keys.shuffle(&mut rng);
    for _ in 0..tree.capacity() / 2 {
        let key = keys.pop().unwrap();
        assert!(tree.remove(key));
        assert!(!tree.contains(key));
        set.remove(&key);
        assert_tree_shape(tree);
    }
    for _ in 0..64 {
        let key = rng.gen::<u64>();
        assert!(tree.insert(key).is_some());
        set.insert(key);
        keys.push(key);
        assert_tree_shape(tree);
    }
    assert_eq!(tree.len(), set.len());
    assert_eq!(stored_keys(tree), set.iter().copied().collect::<Vec<u64>>());

    // Drain through the ends.
    while !set.is_empty() {
        let expected = if set.len() % 2 == 0 {
            let low = *set.iter().next().unwrap();
            assert_eq!(tree.remove_min(), Ok(low));
            low
        } else {
            let high = *set.iter().next_back().unwrap();
            assert_eq!(tree.remove_max(), Ok(high));
            high
        };
        set.remove(&expected);
        assert_tree_shape(tree);
    }
    assert_eq!(tree.len(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_split_join_reconstructs_random_sets() {
    let mut rng = thread_rng();
    for _ in 0..20 {
        let mut buf = vec![0u8; std::mem::size_of::<Tree>()];
        let tree = Tree::new_from_slice(buf.as_mut_slice());
        let pool: Vec<u64> = (0..200)
            .map(|_| rng.gen_range(1u64, 1_000_000))
            .sorted()
            .dedup()
            .collect();
        let mut shuffled = pool.clone();
        shuffled.shuffle(&mut rng);
        for &key in shuffled.iter() {
            tree.insert(key).unwrap();
        }

        let at = rng.gen_range(0, pool.len());
        let split_key = pool[at];
        let (left, x, right) = tree.split_at(tree.root as u32, split_key).unwrap();
        assert_eq!(tree.key(x), split_key);
        assert!(tree.is_valid_llrb(left) && tree.is_valid_llrb(right));
        assert!(tree.aggregates_consistent(left) && tree.aggregates_consistent(right));
        let left_keys: Vec<u64> = tree.iter_from(left).map(|node| tree.key(node)).collect();
        let right_keys: Vec<u64> = tree.iter_from(right).map(|node| tree.key(node)).collect();
        assert_eq!(left_keys, pool[..at].to_vec());
        assert_eq!(right_keys, pool[at + 1..].to_vec());

        let joined = tree.join_at(left, x, right);
        tree.root = joined as u64;
        assert_tree_shape(tree);
        assert_eq!(stored_keys(tree), pool);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_simulate_tango_searches() {
    let mut buf = vec![0u8; std::mem::size_of::<Tango>()];
    let tango = Tango::new_from_slice(buf.as_mut_slice());
    let n = (MAX_SIZE - 1) as u64;
    tango.build(n as u32);
    assert!(tango.is_valid());

    let mut rng = thread_rng();
    for _ in 0..1000 {
        let key = rng.gen_range(1, n + 1);
        assert!(tango.search(key));
        assert!(tango.on_preferred_path(key));
        assert!(tango.is_valid());
    }

    // The key universe never changes, no matter how the forest is spliced.
    for key in 1..=n {
        assert!(tango.contains(key));
    }
    assert!(!tango.search(0));
    assert!(!tango.search(n + 1));
    assert!(tango.is_valid());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tango_sweeps_stay_reachable() {
    let mut buf = vec![0u8; std::mem::size_of::<Tango>()];
    let tango = Tango::new_from_slice(buf.as_mut_slice());
    tango.build(255);
    for key in 1..=255u64 {
        assert!(tango.search(key));
        assert!(tango.on_preferred_path(key));
    }
    assert!(tango.is_valid());
    for key in (1..=255u64).rev() {
        assert!(tango.search(key));
        assert!(tango.on_preferred_path(key));
        assert!(tango.is_valid());
    }
}
