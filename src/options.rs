use crate::{
    error::{error_validation, Error},
    repr::{internal_capacity, leaf_entry_size, BIG_VALUE_SIZE, LEAF_HEADER_SIZE},
};

pub const MIN_BLOCK_SIZE: usize = 128;
pub const MAX_BLOCK_SIZE: usize = 1 << 20;
// needs 2 + pending to split an internal node
const MIN_INTERNAL_KEYS: usize = 3;

/// Options for a block store
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[non_exhaustive]
pub struct StoreOptions {
    /// Size of every block, constant for the lifetime of the store.
    ///
    /// Must be within [MIN_BLOCK_SIZE] and [MAX_BLOCK_SIZE].
    ///
    /// Default: `4 KB`
    pub block_size: usize,
    /// Maximum number of blocks the store may hold, metadata block included.
    /// Allocations past this limit fail with [Error::AllocationFailure].
    ///
    /// Default: `u32::MAX`
    pub max_blocks: u64,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            block_size: 4096,
            max_blocks: u32::MAX as u64,
        }
    }
}

impl StoreOptions {
    pub fn with_block_size(block_size: usize) -> Self {
        Self {
            block_size,
            ..Default::default()
        }
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&self.block_size) {
            return Err(error_validation!(
                "Block size {} outside of the supported range {MIN_BLOCK_SIZE}..={MAX_BLOCK_SIZE}",
                self.block_size
            ));
        }
        if self.max_blocks < 2 {
            return Err(error_validation!(
                "Store needs at least 2 blocks, got {}",
                self.max_blocks
            ));
        }
        Ok(())
    }
}

/// Options for a tree
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[non_exhaustive]
pub struct TreeOptions {
    /// Byte width shared by all keys in the tree.
    ///
    /// Keys are compared lexicographically, so integers should be encoded big endian.
    pub key_size: usize,
    /// Upper bound on the descent depth. A well formed tree never gets close to it,
    /// reaching it means the block structure contains a pointer cycle.
    ///
    /// Default: `64`
    pub max_depth: usize,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            key_size: 8,
            max_depth: 64,
        }
    }
}

impl TreeOptions {
    pub fn with_key_size(key_size: usize) -> Self {
        Self {
            key_size,
            ..Default::default()
        }
    }

    /// Largest value stored inline in a leaf, anything longer goes to an overflow extent
    #[inline]
    pub fn max_inline_value(block_size: usize) -> usize {
        block_size / 4
    }

    pub(crate) fn validate(&self, block_size: usize) -> Result<(), Error> {
        if self.key_size == 0 || self.key_size > u32::MAX as usize {
            return Err(error_validation!("Invalid key size {}", self.key_size));
        }
        if self.max_depth == 0 {
            return Err(error_validation!("Max depth must be positive"));
        }
        if internal_capacity(block_size, self.key_size) < MIN_INTERNAL_KEYS {
            return Err(error_validation!(
                "Key size {} too large for block size {block_size}, internal nodes need {MIN_INTERNAL_KEYS} keys",
                self.key_size
            ));
        }
        // Cutting the entries of a split, incoming one included, after the longest prefix
        // that fits leaves less than two of the largest entries for the new leaf.
        let max_payload = Self::max_inline_value(block_size).max(BIG_VALUE_SIZE);
        let max_entry = leaf_entry_size(self.key_size, max_payload);
        if 2 * max_entry > block_size - LEAF_HEADER_SIZE {
            return Err(error_validation!(
                "Key size {} too large for block size {block_size}, leaf entries may take up to {max_entry} bytes",
                self.key_size
            ));
        }
        Ok(())
    }
}
