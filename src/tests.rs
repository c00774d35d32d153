use crate::{
    node::{key_buf, InternalNode, LeafNode, LeafValue, NodeKind},
    repr::BlockId,
    tree::InsertResult,
    *,
};
use rand::prelude::*;

fn get_rng() -> impl Rng + Clone {
    let seed: u64 = std::env::var("SEED")
        .map_or_else(|_| rand::rng().random(), |seed_str| seed_str.parse().unwrap());
    println!("SEED {}", seed);
    SmallRng::seed_from_u64(seed)
}

fn k(i: u64) -> [u8; 8] {
    i.to_be_bytes()
}

fn mem_tree(block_size: usize) -> BpTree<MemBlockStore> {
    let _ = env_logger::try_init();
    let store = MemBlockStore::new(StoreOptions::with_block_size(block_size)).unwrap();
    BpTree::create(store, TreeOptions::with_key_size(8)).unwrap()
}

fn tree_with(block_size: usize, key_size: usize) -> BpTree<MemBlockStore> {
    let _ = env_logger::try_init();
    let store = MemBlockStore::new(StoreOptions::with_block_size(block_size)).unwrap();
    BpTree::create(store, TreeOptions::with_key_size(key_size)).unwrap()
}

/// `i` big endian padded with zeroes up to `key_size`
fn wide_key(key_size: usize, i: u64) -> Vec<u8> {
    let mut key = vec![0; key_size];
    key[..8].copy_from_slice(&k(i));
    key
}

fn check_model<S: BlockStore>(tree: &mut BpTree<S>, ops: &[(Vec<u8>, Vec<u8>)]) {
    for (key, value) in ops {
        tree.add(key, value).unwrap();
    }
    let stats = tree.verify().unwrap();
    assert_eq!(stats.entries, ops.len() as u64);
    assert_entries(tree, ops.to_vec());
}

/// Separators of every internal node, parents before children
fn separators<S: BlockStore>(tree: &BpTree<S>) -> Vec<Vec<u8>> {
    fn recurse<S: BlockStore>(tree: &BpTree<S>, block: BlockId, out: &mut Vec<Vec<u8>>) {
        let children: Vec<(Vec<u8>, BlockId)> = tree
            .store
            .with_blocks(block, 1, |b| match NodeKind::decode(block, b)? {
                NodeKind::Internal => {
                    let node = InternalNode::open(block, b, tree.key_size())?;
                    Ok((0..node.num_keys())
                        .map(|i| (node.key(i).to_vec(), node.ptr(i)))
                        .collect())
                }
                NodeKind::Leaf => Ok(Vec::new()),
            })
            .unwrap();
        for (key, child) in children {
            out.push(key);
            recurse(tree, child, out);
        }
    }
    let mut out = Vec::new();
    recurse(tree, tree.root(), &mut out);
    out
}

fn leaf_keys<S: BlockStore>(tree: &BpTree<S>, block: BlockId) -> Vec<Vec<u8>> {
    tree.store
        .with_blocks(block, 1, |b| {
            let leaf = LeafNode::open(block, b, tree.key_size())?;
            Ok((0..leaf.num_keys())
                .map(|i| leaf.key(i).to_vec())
                .collect::<Vec<_>>())
        })
        .unwrap()
}

fn assert_entries<S: BlockStore>(tree: &BpTree<S>, mut expected: Vec<(Vec<u8>, Vec<u8>)>) {
    let mut actual = tree.entries().unwrap();
    assert!(
        actual.windows(2).all(|w| w[0].0 <= w[1].0),
        "leaf chain out of order"
    );
    actual.sort();
    expected.sort();
    assert_eq!(actual.len(), expected.len());
    assert!(actual == expected, "entries differ from the model");
}

#[test]
fn test_send_sync() {
    fn assert_send_sync<T: Send + Sync>() {}

    assert_send_sync::<MemBlockStore>();
    assert_send_sync::<FileBlockStore>();
    assert_send_sync::<BpTree<MemBlockStore>>();
}

#[test]
fn insert_into_empty_tree() {
    let tree = mem_tree(128);
    let root = tree.root();
    let res = tree
        .insert(root, &k(1), &LeafValue::Small(b"value"), 1)
        .unwrap();
    assert!(matches!(res, InsertResult::Ok(b) if b == root));

    let mut tree = mem_tree(128);
    let root = tree.root();
    tree.add(&k(1), b"value").unwrap();
    assert_eq!(tree.root(), root);
    assert_eq!(tree.entries().unwrap(), vec![(k(1).to_vec(), b"value".to_vec())]);
}

#[test]
fn key_size_mismatch() {
    let mut tree = mem_tree(128);
    assert!(matches!(
        tree.add(b"short", b""),
        Err(Error::KeySizeMismatch {
            expected: 8,
            got: 5
        })
    ));
    assert!(matches!(
        tree.add(&[0; 9], b""),
        Err(Error::KeySizeMismatch { got: 9, .. })
    ));
    assert!(tree.entries().unwrap().is_empty());
}

#[test]
fn root_leaf_split() {
    let mut tree = mem_tree(128);
    let root = tree.root();
    // 4 entries of 25 bytes fill a 128 bytes leaf
    for i in 1..=4 {
        tree.add(&k(i), &k(i)).unwrap();
    }
    assert_eq!(tree.root(), root);
    tree.add(&k(5), &k(5)).unwrap();

    let new_root = tree.root();
    assert_ne!(new_root, root);
    let children = tree
        .store
        .with_blocks(new_root, 1, |b| {
            let node = InternalNode::open(new_root, b, 8)?;
            Ok((0..node.num_keys())
                .map(|i| (key_buf(node.key(i)), node.ptr(i)))
                .collect::<Vec<_>>())
        })
        .unwrap();
    assert_eq!(children.len(), 2);
    assert_eq!(children[0].1, root);
    for (key, child) in &children {
        assert_eq!(tree.first_key(*child).unwrap(), *key);
    }
    let (left, right) = (leaf_keys(&tree, children[0].1), leaf_keys(&tree, children[1].1));
    assert_eq!(left.len() + right.len(), 5);
    assert!(left.last().unwrap() <= right.first().unwrap());

    let stats = tree.verify().unwrap();
    assert_eq!(stats.depth, 2);
    assert_eq!(stats.leaves, 2);
    assert_eq!(stats.entries, 5);
}

#[test]
fn split_with_uneven_entries() {
    let mut tree = mem_tree(128);
    // 17 + 41 + 45 bytes fill the root leaf, the last entry takes 49 bytes and
    // only fits when it leads the new leaf
    let mut expected = Vec::new();
    for (key, len) in [(1u64, 0usize), (2, 24), (4, 28), (3, 32)] {
        let value = vec![key as u8; len];
        tree.add(&k(key), &value).unwrap();
        expected.push((k(key).to_vec(), value));
    }
    assert_eq!(separators(&tree), vec![k(1).to_vec(), k(3).to_vec()]);
    let stats = tree.verify().unwrap();
    assert_eq!((stats.leaves, stats.entries, stats.big_values), (2, 4, 0));
    assert_entries(&tree, expected);
}

#[test]
fn largest_accepted_key_sizes() {
    for (block_size, key_size) in [(MIN_BLOCK_SIZE, 11), (4096, 1003)] {
        let max_inline = TreeOptions::max_inline_value(block_size);
        let lens = [max_inline, 0, max_inline - 1, 1, max_inline / 2];
        let ops = (0..300u64)
            .map(|i| {
                let value = vec![i as u8; lens[i as usize % lens.len()]];
                (wide_key(key_size, i * 7 % 6), value)
            })
            .collect::<Vec<_>>();
        let mut tree = tree_with(block_size, key_size);
        check_model(&mut tree, &ops);
    }
}

#[test]
fn pure_run_keeps_one_separator() {
    let mut tree = mem_tree(128);
    for i in 1..=5 {
        tree.add(&k(i), b"distinct").unwrap();
    }
    let mut values = Vec::new();
    for i in 0..1000u64 {
        tree.add(&k(5), &k(i)).unwrap();
        values.push(k(i).to_vec());
        if i == 10 {
            assert_eq!(separators(&tree), vec![k(1).to_vec(), k(3).to_vec(), k(5).to_vec()]);
        }
    }
    let seps = separators(&tree);
    assert_eq!(seps.iter().filter(|s| **s == k(5)).count(), 1);
    assert_eq!(seps.len(), 3);
    let stats = tree.verify().unwrap();
    assert_eq!(stats.depth, 2);
    assert!(stats.leaves >= 2 + 1000 / 4);
    assert!(stats.pure_leaves >= 1000 / 4);

    // values under the same key keep their insertion order
    let fives = tree
        .entries()
        .unwrap()
        .into_iter()
        .filter(|(key, _)| *key == k(5))
        .map(|(_, value)| value)
        .skip(1)
        .collect::<Vec<_>>();
    assert_eq!(fives, values);

    tree.add(&k(6), b"other").unwrap();
    let after = separators(&tree);
    assert_eq!(after.len(), seps.len() + 1);
    assert_eq!(after.iter().filter(|s| **s == k(5)).count(), 1);
    assert_eq!(after.iter().filter(|s| **s == k(6)).count(), 1);
    tree.verify().unwrap();
}

#[test]
fn pure_run_from_the_first_key() {
    let mut tree = mem_tree(128);
    for i in 0..100u64 {
        tree.add(&k(7), &k(i)).unwrap();
    }
    // the whole run hangs from the root leaf
    assert!(separators(&tree).is_empty());
    assert_eq!(tree.verify().unwrap().leaves, 25);

    tree.add(&k(3), b"before").unwrap();
    tree.add(&k(9), b"after").unwrap();
    assert_eq!(
        separators(&tree),
        vec![k(3).to_vec(), k(7).to_vec(), k(9).to_vec()]
    );
    let entries = tree.entries().unwrap();
    assert_eq!(entries.first().unwrap().0, k(3));
    assert_eq!(entries.last().unwrap().0, k(9));
    tree.verify().unwrap();
}

#[test]
fn big_value_round_trip() {
    let mut tree = mem_tree(128);
    let value = (0..300u32).map(|i| (i * 7) as u8).collect::<Vec<_>>();
    let before = tree.store().allocated_blocks();
    tree.add(&k(1), &value).unwrap();
    // ceil(300 / 128) extent blocks, the root leaf is reused
    assert_eq!(tree.store().allocated_blocks() - before, 3);

    let descriptor = tree
        .store
        .with_blocks(tree.root(), 1, |b| {
            let leaf = LeafNode::open(tree.root(), b, 8)?;
            let value = leaf.value(0)?;
            match value {
                LeafValue::Big(descriptor) => Ok(descriptor),
                LeafValue::Small(_) => panic!("expected a big value"),
            }
        })
        .unwrap();
    assert_eq!({ descriptor.size }, 300);
    assert_eq!(overflow::read_big_value(tree.store(), &descriptor).unwrap(), value);

    // a quarter of the block size is still inline
    tree.add(&k(2), &[1; 32]).unwrap();
    tree.add(&k(3), &[2; 33]).unwrap();
    let stats = tree.verify().unwrap();
    assert_eq!(stats.big_values, 2);
    assert_entries(
        &tree,
        vec![
            (k(1).to_vec(), value),
            (k(2).to_vec(), vec![1; 32]),
            (k(3).to_vec(), vec![2; 33]),
        ],
    );
}

#[test]
fn failed_add_keeps_metadata() {
    let mut options = StoreOptions::with_block_size(128);
    // metadata, root leaf and a single spare block
    options.max_blocks = 3;
    let store = MemBlockStore::new(options).unwrap();
    let mut tree = BpTree::create(store, TreeOptions::with_key_size(8)).unwrap();
    let root = tree.root();
    for i in 0..4 {
        tree.add(&k(i), &k(i)).unwrap();
    }
    // the leaf splits but there's no room left for a new root
    assert!(matches!(
        tree.add(&k(4), &k(4)),
        Err(Error::AllocationFailure { requested: 1, .. })
    ));
    let tree = BpTree::open(tree.into_store()).unwrap();
    assert_eq!(tree.root(), root);
}

#[test]
fn unknown_block_type() {
    let mut tree = mem_tree(128);
    tree.add(&k(1), b"value").unwrap();
    let root = tree.root();
    tree.store
        .with_blocks(root, 1, |b| {
            b[0] = 0;
            Ok(())
        })
        .unwrap();
    assert!(matches!(
        tree.add(&k(2), b"value"),
        Err(Error::UnknownBlockType { block, flags: 0 }) if block == root
    ));
}

#[test]
fn descent_depth_bound() {
    let mut tree = mem_tree(128);
    for i in 0..5 {
        tree.add(&k(i), &k(i)).unwrap();
    }
    assert_eq!(tree.verify().unwrap().depth, 2);
    let mut tree = BpTree::open_with(tree.into_store(), 1).unwrap();
    assert!(matches!(tree.add(&k(9), b""), Err(Error::Validation(_))));
}

#[test]
fn open_validates_metadata() {
    let store = MemBlockStore::new(StoreOptions::with_block_size(128)).unwrap();
    assert!(matches!(BpTree::open(store), Err(Error::Io(_))));

    let store = MemBlockStore::new(StoreOptions::with_block_size(128)).unwrap();
    assert!(matches!(
        BpTree::create(store, TreeOptions::with_key_size(64)),
        Err(Error::Validation(_))
    ));
}

#[test]
fn file_store_reopen() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tree");
    let options = StoreOptions::with_block_size(256);
    let mut expected = Vec::new();
    {
        let store = FileBlockStore::create_path(&path, options.clone()).unwrap();
        let mut tree = BpTree::create(store, TreeOptions::with_key_size(8)).unwrap();
        for i in 0..300u64 {
            let value = vec![i as u8; (i % 100) as usize];
            tree.add(&k(i % 37), &value).unwrap();
            expected.push((k(i % 37).to_vec(), value));
        }
        tree.sync().unwrap();
    }

    let store = FileBlockStore::open_path(&path, options).unwrap();
    let mut tree = BpTree::open(store).unwrap();
    assert_eq!(tree.key_size(), 8);
    let stats = tree.verify().unwrap();
    assert_eq!(stats.entries, 300);
    assert!(stats.big_values > 0);
    assert_entries(&tree, expected.clone());

    for i in 300..400u64 {
        tree.add(&k(i), &k(i)).unwrap();
        expected.push((k(i).to_vec(), k(i).to_vec()));
    }
    tree.verify().unwrap();
    assert_entries(&tree, expected);
}

#[test]
fn random_bulk_inserts() {
    let mut rng = get_rng();
    let mut tree = mem_tree(128);
    let mut expected = Vec::new();
    for _ in 0..4_000 {
        let key = k(rng.random_range(0..200));
        let mut value = vec![0; rng.random_range(0..=80)];
        rng.fill_bytes(&mut value);
        tree.add(&key, &value).unwrap();
        expected.push((key.to_vec(), value));
    }
    let stats = tree.verify().unwrap();
    assert!(stats.depth >= 3, "{stats:?}");
    assert_eq!(stats.entries, 4_000);
    assert_entries(&tree, expected);
}

#[test]
fn random_heavy_duplicates() {
    let mut rng = get_rng();
    let mut tree = mem_tree(256);
    let mut expected = Vec::new();
    for i in 0..3_000u64 {
        // a handful of hot keys with a long tail of rare ones
        let key = if rng.random_bool(0.8) {
            k(rng.random_range(0..4) * 1000)
        } else {
            k(rng.random_range(0..4_000))
        };
        let value = i.to_le_bytes().repeat(rng.random_range(0..=12));
        tree.add(&key, &value).unwrap();
        expected.push((key.to_vec(), value));
    }
    let stats = tree.verify().unwrap();
    assert!(stats.pure_leaves > 0, "{stats:?}");
    assert_entries(&tree, expected);
}

mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn inserts_match_model(ops in prop::collection::vec((0u64..6, 0usize..100), 0..250)) {
            let mut tree = mem_tree(128);
            let mut expected = Vec::new();
            for (i, (key, len)) in ops.into_iter().enumerate() {
                let value = vec![i as u8; len];
                tree.add(&k(key), &value).unwrap();
                expected.push((k(key).to_vec(), value));
            }
            let stats = tree.verify().unwrap();
            prop_assert_eq!(stats.entries, expected.len() as u64);
            assert_entries(&tree, expected);
        }

        #[test]
        fn mixed_sizes_in_small_blocks(
            ops in prop::collection::vec((0u64..4, 0usize..=MIN_BLOCK_SIZE / 4), 1..300),
            widest in any::<bool>(),
        ) {
            let key_size = if widest { 11 } else { 8 };
            let ops = ops
                .into_iter()
                .enumerate()
                .map(|(i, (key, len))| (wide_key(key_size, key), vec![i as u8; len]))
                .collect::<Vec<_>>();
            let mut tree = tree_with(MIN_BLOCK_SIZE, key_size);
            check_model(&mut tree, &ops);
        }

        #[test]
        fn mixed_sizes_with_widest_keys(
            ops in prop::collection::vec((0u64..4, 0usize..=1024), 1..100),
        ) {
            let ops = ops
                .into_iter()
                .enumerate()
                .map(|(i, (key, len))| (wide_key(1003, key), vec![i as u8; len]))
                .collect::<Vec<_>>();
            let mut tree = tree_with(4096, 1003);
            check_model(&mut tree, &ops);
        }

        #[test]
        fn wide_keys(ops in prop::collection::vec((any::<u16>(), 0usize..300), 1..200)) {
            let store = MemBlockStore::new(StoreOptions::with_block_size(512)).unwrap();
            let mut tree = BpTree::create(store, TreeOptions::with_key_size(40)).unwrap();
            let mut expected = Vec::new();
            for (key, len) in ops {
                let mut wide = [0u8; 40];
                wide[..2].copy_from_slice(&key.to_be_bytes());
                let value = vec![key as u8; len];
                tree.add(&wide, &value).unwrap();
                expected.push((wide.to_vec(), value));
            }
            tree.verify().unwrap();
            assert_entries(&tree, expected);
        }
    }
}
