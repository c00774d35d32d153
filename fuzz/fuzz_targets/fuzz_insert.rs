#![no_main]

use blocktree::{BpTree, Error, MemBlockStore, StoreOptions, TreeOptions};
use libfuzzer_sys::arbitrary;
use libfuzzer_sys::arbitrary::*;
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
enum Op {
    /// Few distinct keys, exercises pure runs
    Hot(u8, u8),
    Any(u16, u16),
    Big(u8, u16),
    BadKey(u8),
}

#[derive(Debug, Arbitrary)]
struct Input {
    block_size_shift: u8,
    ops: Vec<Op>,
}

fuzz_target!(|input: Input| {
    let _ = env_logger::try_init();
    let block_size = 128usize << (input.block_size_shift % 4);
    let store = MemBlockStore::new(StoreOptions::with_block_size(block_size)).unwrap();
    let mut tree = BpTree::create(store, TreeOptions::with_key_size(4)).unwrap();
    let mut model = Vec::new();
    for (i, op) in input.ops.into_iter().enumerate() {
        let (key, len) = match op {
            Op::Hot(key, len) => ((key % 4) as u32, len as usize),
            Op::Any(key, len) => (key as u32, len as usize % block_size),
            Op::Big(key, len) => (key as u32, block_size / 4 + len as usize),
            Op::BadKey(len) => {
                let key = vec![0; len as usize % 8];
                if key.len() != 4 {
                    assert!(matches!(
                        tree.add(&key, b""),
                        Err(Error::KeySizeMismatch { .. })
                    ));
                }
                continue;
            }
        };
        let key = key.to_be_bytes();
        let value = vec![i as u8; len];
        tree.add(&key, &value).unwrap();
        model.push((key.to_vec(), value));
    }

    let stats = tree.verify().unwrap();
    assert_eq!(stats.entries, model.len() as u64);
    let mut entries = tree.entries().unwrap();
    assert!(entries.windows(2).all(|w| w[0].0 <= w[1].0));
    entries.sort();
    model.sort();
    assert!(entries == model);
});
