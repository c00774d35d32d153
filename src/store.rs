use std::{fmt, path::Path, sync::Arc};

use parking_lot::Mutex;

use crate::{
    allocator::Allocator,
    error::{error_validation, io_invalid_data, Error},
    fs::{open_native, FsFile, MemFile},
    options::StoreOptions,
    repr::{BlockId, META_BLOCK},
};

/// Fixed size block storage backing a tree.
///
/// Block [META_BLOCK] always exists and is reserved for the tree metadata,
/// it's never returned by [BlockStore::allocate_blocks].
///
/// Block access is scoped: the buffer handed to `f` in [BlockStore::with_blocks] can't
/// outlive the call. Implementations hold a lock for the duration of `f`, so calls
/// must not be nested.
pub trait BlockStore {
    /// Size of a block in bytes, constant for the store lifetime
    fn block_size(&self) -> usize;

    /// Reserves `count` contiguous zeroed blocks
    fn allocate_blocks(&self, count: u64) -> Result<BlockId, Error>;

    /// Releases a single block for reuse
    fn free(&self, block: BlockId) -> Result<(), Error>;

    /// Exclusive access to the raw bytes of `count` blocks starting at `block`.
    /// Mutations are visible to later accesses of the same blocks.
    ///
    /// When `f` fails, whether its partial mutations persist depends on the store:
    /// [MemBlockStore] mutates the blocks in place and keeps them, [FileBlockStore]
    /// works on a copy and discards them. Callers must not rely on either.
    fn with_blocks<R>(
        &self,
        block: BlockId,
        count: u64,
        f: impl FnOnce(&mut [u8]) -> Result<R, Error>,
    ) -> Result<R, Error>;

    /// Makes previous mutations durable, if the store supports it
    fn sync(&self) -> Result<(), Error> {
        Ok(())
    }
}

fn check_access(allocator: &Allocator, block: BlockId, count: u64) -> Result<(), Error> {
    let is_meta = block == META_BLOCK && count == 1;
    if count == 0 || !(is_meta || allocator.is_allocated(block, count)) {
        return Err(error_validation!(
            "Access to unallocated blocks {block}..{}",
            block + count
        ));
    }
    Ok(())
}

/// Block store kept entirely in memory
pub struct MemBlockStore {
    block_size: usize,
    state: Mutex<MemState>,
}

struct MemState {
    data: Vec<u8>,
    allocator: Allocator,
}

impl fmt::Debug for MemBlockStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemBlockStore")
            .field("block_size", &self.block_size)
            .field("next_block", &state.allocator.next_block)
            .field("free", &state.allocator.free_len())
            .finish()
    }
}

impl MemBlockStore {
    pub fn new(options: StoreOptions) -> Result<Self, Error> {
        options.validate()?;
        Ok(Self {
            block_size: options.block_size,
            state: Mutex::new(MemState {
                data: vec![0; options.block_size],
                allocator: Allocator::new(options.max_blocks),
            }),
        })
    }

    /// Number of blocks currently allocated, the metadata block excluded
    pub fn allocated_blocks(&self) -> u64 {
        let state = self.state.lock();
        state.allocator.next_block - 1 - state.allocator.free_len()
    }
}

impl BlockStore for MemBlockStore {
    #[inline]
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn allocate_blocks(&self, count: u64) -> Result<BlockId, Error> {
        let mut state = self.state.lock();
        let block = state.allocator.allocate(count)?;
        let start = block as usize * self.block_size;
        let end = start + count as usize * self.block_size;
        if state.data.len() < end {
            state.data.resize(end, 0);
        }
        // reused blocks carry stale bytes
        state.data[start..end].fill(0);
        Ok(block)
    }

    fn free(&self, block: BlockId) -> Result<(), Error> {
        let mut state = self.state.lock();
        state.allocator.free(block, 1)?;
        let new_len = state.allocator.next_block as usize * self.block_size;
        state.data.truncate(new_len);
        Ok(())
    }

    fn with_blocks<R>(
        &self,
        block: BlockId,
        count: u64,
        f: impl FnOnce(&mut [u8]) -> Result<R, Error>,
    ) -> Result<R, Error> {
        let mut state = self.state.lock();
        check_access(&state.allocator, block, count)?;
        let start = block as usize * self.block_size;
        let end = start + count as usize * self.block_size;
        f(&mut state.data[start..end])
    }
}

/// Block store persisted in a file, block `i` lives at offset `i * block_size`.
///
/// The free list isn't persisted, blocks freed before reopening the store are leaked.
pub struct FileBlockStore {
    block_size: usize,
    file: Arc<dyn FsFile>,
    allocator: Mutex<Allocator>,
}

impl fmt::Debug for FileBlockStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let allocator = self.allocator.lock();
        f.debug_struct("FileBlockStore")
            .field("block_size", &self.block_size)
            .field("next_block", &allocator.next_block)
            .field("free", &allocator.free_len())
            .finish()
    }
}

impl FileBlockStore {
    /// Creates a new store in `file`, discarding any previous contents
    pub fn create(file: Arc<dyn FsFile>, options: StoreOptions) -> Result<Self, Error> {
        options.validate()?;
        file.set_len(0)?;
        file.set_len(options.block_size as u64)?;
        debug!("Created file block store, block size {}", options.block_size);
        Ok(Self {
            block_size: options.block_size,
            file,
            allocator: Mutex::new(Allocator::new(options.max_blocks)),
        })
    }

    /// Opens a store previously created with the same block size
    pub fn open(file: Arc<dyn FsFile>, options: StoreOptions) -> Result<Self, Error> {
        options.validate()?;
        let len = file.len()?;
        let block_size = options.block_size as u64;
        if len == 0 || len % block_size != 0 {
            return Err(io_invalid_data!(
                "File length {len} isn't a multiple of the block size {block_size}"
            ));
        }
        let next_block = len / block_size;
        debug!("Opened file block store, {next_block} blocks");
        Ok(Self {
            block_size: options.block_size,
            file,
            allocator: Mutex::new(Allocator::with_horizon(next_block, options.max_blocks)),
        })
    }

    pub fn create_path(path: &Path, options: StoreOptions) -> Result<Self, Error> {
        Self::create(open_native(path, true)?, options)
    }

    pub fn open_path(path: &Path, options: StoreOptions) -> Result<Self, Error> {
        Self::open(open_native(path, false)?, options)
    }

    /// Store backed by a [MemFile], handy for tests
    pub fn in_memory(options: StoreOptions) -> Result<Self, Error> {
        Self::create(Arc::new(MemFile::new()), options)
    }

    pub fn file(&self) -> &Arc<dyn FsFile> {
        &self.file
    }

    /// Number of blocks currently allocated, the metadata block excluded
    pub fn allocated_blocks(&self) -> u64 {
        let allocator = self.allocator.lock();
        allocator.next_block - 1 - allocator.free_len()
    }

    #[inline]
    fn offset(&self, block: BlockId) -> u64 {
        block * self.block_size as u64
    }
}

impl BlockStore for FileBlockStore {
    #[inline]
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn allocate_blocks(&self, count: u64) -> Result<BlockId, Error> {
        let mut allocator = self.allocator.lock();
        let horizon = allocator.next_block;
        let block = allocator.allocate(count)?;
        if allocator.next_block > horizon {
            self.file.set_len(self.offset(allocator.next_block))?;
        }
        if block < horizon {
            let zeroes = vec![0u8; count as usize * self.block_size];
            self.file.write_all_at(&zeroes, self.offset(block))?;
        }
        Ok(block)
    }

    fn free(&self, block: BlockId) -> Result<(), Error> {
        let mut allocator = self.allocator.lock();
        let horizon = allocator.next_block;
        allocator.free(block, 1)?;
        if allocator.next_block < horizon {
            self.file.set_len(self.offset(allocator.next_block))?;
        }
        Ok(())
    }

    fn with_blocks<R>(
        &self,
        block: BlockId,
        count: u64,
        f: impl FnOnce(&mut [u8]) -> Result<R, Error>,
    ) -> Result<R, Error> {
        let allocator = self.allocator.lock();
        check_access(&allocator, block, count)?;
        let mut buffer = vec![0u8; count as usize * self.block_size];
        self.file.read_exact_at(&mut buffer, self.offset(block))?;
        let result = f(&mut buffer)?;
        self.file.write_all_at(&buffer, self.offset(block))?;
        drop(allocator);
        Ok(result)
    }

    fn sync(&self) -> Result<(), Error> {
        self.file.sync_all()?;
        Ok(())
    }
}
