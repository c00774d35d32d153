//! Insertion engine of a B+ tree stored in fixed size blocks.
//!
//! Keys share a fixed width and may repeat. Values longer than a quarter of the
//! block size are moved to overflow extents. Leaves are chained in key order and
//! runs of a single key grow as chains of pure leaves behind one parent separator.
//!
//! ```
//! use blocktree::{BpTree, MemBlockStore, StoreOptions, TreeOptions};
//!
//! let store = MemBlockStore::new(StoreOptions::with_block_size(512)).unwrap();
//! let mut tree = BpTree::create(store, TreeOptions::with_key_size(4)).unwrap();
//! tree.add(b"key1", b"value").unwrap();
//! tree.add(b"key1", &[7; 1000]).unwrap();
//! assert_eq!(tree.entries().unwrap().len(), 2);
//! tree.verify().unwrap();
//! ```

#[macro_use]
extern crate log;
#[macro_use]
extern crate derive_more;

mod allocator;
mod error;
pub mod fs;
mod node;
mod options;
pub mod overflow;
mod pure;
mod repr;
mod store;
mod tree;
mod utils;
mod verify;

#[cfg(test)]
mod tests;

pub use error::Error;
pub use options::{StoreOptions, TreeOptions, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};
pub use repr::{BigValue, BlockId};
pub use store::{BlockStore, FileBlockStore, MemBlockStore};
pub use tree::BpTree;
pub use verify::TreeStats;

type HashSet<K> = hashbrown::HashSet<K, foldhash::fast::RandomState>;
