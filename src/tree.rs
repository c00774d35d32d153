use std::{fmt, mem::size_of};

use zerocopy::{FromBytes, IntoBytes};

use crate::{
    error::{error_validation, io_invalid_data, Error},
    node::{key_buf, InternalNode, KeyBuf, LeafNode, LeafValue, NodeKind},
    options::TreeOptions,
    overflow, pure,
    repr::*,
    store::BlockStore,
    utils::EscapedBytes,
};

/// Outcome of inserting into a subtree
#[derive(Debug)]
pub(crate) enum InsertResult {
    /// The subtree root, no new sibling
    Ok(BlockId),
    /// The subtree split, the parent must add a separator for the second block
    Split(BlockId, BlockId),
}

/// A B+ tree of fixed size keys stored in a [BlockStore].
///
/// Keys may repeat, entries with equal keys are kept adjacent. Long runs of a single
/// key are stored as chains of pure leaves sharing one parent separator.
///
/// The tree assumes a single writer, mutations take `&mut self`.
pub struct BpTree<S: BlockStore> {
    pub(crate) store: S,
    pub(crate) options: TreeOptions,
    pub(crate) root: BlockId,
}

impl<S: BlockStore> fmt::Debug for BpTree<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BpTree")
            .field("block_size", &self.store.block_size())
            .field("key_size", &self.options.key_size)
            .field("root", &self.root)
            .finish()
    }
}

impl<S: BlockStore> BpTree<S> {
    /// Creates an empty tree in `store`, overwriting any previous metadata
    pub fn create(store: S, options: TreeOptions) -> Result<Self, Error> {
        options.validate(store.block_size())?;
        let root = store.allocate_blocks(1)?;
        store.with_blocks(root, 1, |b| {
            LeafNode::init(root, b, options.key_size)?;
            Ok(())
        })?;
        let tree = Self {
            store,
            options,
            root,
        };
        tree.write_meta()?;
        debug!(
            "Created tree, key size {} block size {} root {root}",
            tree.options.key_size,
            tree.store.block_size()
        );
        Ok(tree)
    }

    /// Opens a tree previously created in `store`
    pub fn open(store: S) -> Result<Self, Error> {
        Self::open_with(store, TreeOptions::default().max_depth)
    }

    /// Opens a tree previously created in `store`, bounding the descent depth to `max_depth`
    pub fn open_with(store: S, max_depth: usize) -> Result<Self, Error> {
        let block_size = store.block_size();
        let meta = store.with_blocks(META_BLOCK, 1, |b| {
            MetaHeader::read_from_prefix(b)
                .map(|(meta, _)| meta)
                .map_err(|_| io_invalid_data!("Metadata block too small"))
        })?;
        if meta.magic != META_MAGIC {
            return Err(io_invalid_data!("Invalid metadata magic {:#x}", { meta.magic }));
        }
        if meta.block_size as usize != block_size {
            return Err(io_invalid_data!(
                "Tree block size {} doesn't match the store block size {block_size}",
                { meta.block_size }
            ));
        }
        let options = TreeOptions {
            key_size: meta.key_size as usize,
            max_depth,
        };
        options.validate(block_size)?;
        let root = meta.root;
        // the root must decode as a node
        store.with_blocks(root, 1, |b| NodeKind::decode(root, b))?;
        debug!("Opened tree {meta:?}");
        Ok(Self {
            store,
            options,
            root,
        })
    }

    #[inline]
    pub fn key_size(&self) -> usize {
        self.options.key_size
    }

    #[inline]
    pub fn root(&self) -> BlockId {
        self.root
    }

    #[inline]
    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Flushes the block store
    pub fn sync(&self) -> Result<(), Error> {
        self.store.sync()
    }

    fn write_meta(&self) -> Result<(), Error> {
        let meta = MetaHeader {
            magic: META_MAGIC,
            block_size: self.store.block_size() as u32,
            key_size: self.options.key_size as u32,
            root: self.root,
        };
        self.store.with_blocks(META_BLOCK, 1, |b| {
            b[..size_of::<MetaHeader>()].copy_from_slice(meta.as_bytes());
            Ok(())
        })
    }

    /// Inserts `value` under `key`, keeping any existing entries with the same key.
    ///
    /// Values longer than a quarter of the block size are stored in an overflow extent.
    /// On error the tree may be left partially mutated, the previously written
    /// metadata stays untouched.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        if key.len() != self.options.key_size {
            return Err(Error::KeySizeMismatch {
                expected: self.options.key_size,
                got: key.len(),
            });
        }
        let value = if value.len() > TreeOptions::max_inline_value(self.store.block_size()) {
            LeafValue::Big(overflow::write_big_value(&self.store, value)?)
        } else {
            LeafValue::Small(value)
        };
        trace!("add {:?} {value:?}", EscapedBytes(key));

        let root = match self.insert(self.root, key, &value, 1)? {
            InsertResult::Ok(root) => root,
            InsertResult::Split(a, b) => self.grow_root(a, b)?,
        };
        self.root = root;
        self.write_meta()
    }

    fn grow_root(&self, a: BlockId, b: BlockId) -> Result<BlockId, Error> {
        let (a_key, b_key) = (self.first_key(a)?, self.first_key(b)?);
        let root = self.store.allocate_blocks(1)?;
        self.store.with_blocks(root, 1, |bytes| {
            let mut node = InternalNode::init(root, bytes, self.options.key_size)?;
            node.put_kp(0, &a_key, a)?;
            node.put_kp(1, &b_key, b)
        })?;
        debug!("New root {root} over {a} and {b}");
        Ok(root)
    }

    /// Smallest key reachable through `block`, stored at position 0 for both node kinds
    pub(crate) fn first_key(&self, block: BlockId) -> Result<KeyBuf, Error> {
        let key_size = self.options.key_size;
        self.store.with_blocks(block, 1, |b| match NodeKind::decode(block, b)? {
            NodeKind::Internal => {
                let node = InternalNode::open(block, b, key_size)?;
                if node.num_keys() == 0 {
                    return Err(Error::EmptyBlock(block));
                }
                Ok(key_buf(node.key(0)))
            }
            NodeKind::Leaf => {
                let leaf = LeafNode::open(block, b, key_size)?;
                if leaf.is_empty() {
                    return Err(Error::EmptyBlock(block));
                }
                Ok(key_buf(leaf.key(0)))
            }
        })
    }

    /// Recursive insert dispatcher
    pub(crate) fn insert(
        &self,
        block: BlockId,
        key: &[u8],
        value: &LeafValue<'_>,
        depth: usize,
    ) -> Result<InsertResult, Error> {
        if depth > self.options.max_depth {
            return Err(error_validation!(
                "Descent reached block {block} past the max depth {}",
                self.options.max_depth
            ));
        }
        match self.store.with_blocks(block, 1, |b| NodeKind::decode(block, b))? {
            NodeKind::Internal => self.internal_insert(block, key, value, depth),
            NodeKind::Leaf => self.leaf_insert(block, key, value),
        }
    }

    fn internal_insert(
        &self,
        block: BlockId,
        key: &[u8],
        value: &LeafValue<'_>,
        depth: usize,
    ) -> Result<InsertResult, Error> {
        let key_size = self.options.key_size;
        let (i, child) = self.store.with_blocks(block, 1, |b| {
            let node = InternalNode::open(block, b, key_size)?;
            let i = node.child_index(key)?;
            Ok((i, node.ptr(i)))
        })?;

        let (p, q) = match self.insert(child, key, value, depth + 1)? {
            InsertResult::Ok(p) => (p, None),
            InsertResult::Split(p, q) => (p, Some(q)),
        };
        // read after the child scopes are closed, the separators are used as is
        let p_key = self.first_key(p)?;
        let pending = match q {
            Some(q) => Some((self.first_key(q)?, q)),
            None => None,
        };

        let deferred = self.store.with_blocks(block, 1, |b| {
            let mut node = InternalNode::open(block, b, key_size)?;
            node.set_ptr(i, p);
            node.set_key(i, &p_key);
            match pending {
                Some((q_key, q)) if node.full() => Ok(Some((q_key, q))),
                Some((q_key, q)) => node.put_kp(i + 1, &q_key, q).map(|_| None),
                None => Ok(None),
            }
        })?;

        match deferred {
            Some((q_key, q)) => self.internal_split(block, i + 1, &q_key, q),
            None => Ok(InsertResult::Ok(block)),
        }
    }

    /// Splits the full internal node `block` in half and inserts the pending separator
    /// at position `at` of the original sequence.
    fn internal_split(
        &self,
        block: BlockId,
        at: usize,
        pending_key: &[u8],
        pending_ptr: BlockId,
    ) -> Result<InsertResult, Error> {
        let key_size = self.options.key_size;
        let new = self.store.allocate_blocks(1)?;
        let (mid, moved) = self.store.with_blocks(block, 1, |b| {
            let mut node = InternalNode::open(block, b, key_size)?;
            let mid = node.num_keys() / 2;
            Ok((mid, node.split_off_half()))
        })?;
        let Some((new_first, _)) = moved.first() else {
            return Err(error_validation!("Internal node {block} split with nothing to move"));
        };
        // equal separators keep the position of the child that split
        let to_old = at < mid || (at == mid && pending_key < &new_first[..]);
        trace!(
            "Split internal {block} at {mid} into {new}, pending {:?} -> {}",
            EscapedBytes(pending_key),
            if to_old { block } else { new }
        );

        self.store.with_blocks(new, 1, |b| {
            let mut node = InternalNode::init(new, b, key_size)?;
            node.extend(&moved)?;
            if !to_old {
                node.put_kp(at - mid, pending_key, pending_ptr)?;
            }
            Ok(())
        })?;
        if to_old {
            self.store.with_blocks(block, 1, |b| {
                InternalNode::open(block, b, key_size)?.put_kp(at, pending_key, pending_ptr)
            })?;
        }
        Ok(InsertResult::Split(block, new))
    }

    fn leaf_insert(
        &self,
        block: BlockId,
        key: &[u8],
        value: &LeafValue<'_>,
    ) -> Result<InsertResult, Error> {
        let key_size = self.options.key_size;
        let pending = self.store.with_blocks(block, 1, |b| {
            let mut leaf = LeafNode::open(block, b, key_size)?;
            let fits = leaf.fits(value.repr_len());
            let run_key = leaf.pure().then(|| key_buf(leaf.key(0)));
            if fits && run_key.as_deref().map_or(true, |k| k == key) {
                leaf.put_kv(value.flags(), key, value.repr_bytes())?;
                return Ok(None);
            }
            Ok(Some((fits, run_key)))
        })?;
        let Some((fits, run_key)) = pending else {
            return Ok(InsertResult::Ok(block));
        };

        match run_key {
            None => self.leaf_split(block, key, value),
            // A pure leaf followed by the rest of its run only takes its own key,
            // other keys would land between the leaves of the run.
            Some(_) if fits && pure::end_of_pure_run(self, block)? == block => {
                self.leaf_put(block, key, value)?;
                Ok(InsertResult::Ok(block))
            }
            Some(_) => pure::pure_leaf_split(self, block, key, value),
        }
    }

    /// Links the freshly allocated `new` leaf between `prev` and `next`
    pub(crate) fn splice_leaf(&self, new: BlockId, prev: BlockId, next: BlockId) -> Result<(), Error> {
        let key_size = self.options.key_size;
        trace!("Splice leaf {new} between {prev} and {next}");
        self.store.with_blocks(new, 1, |b| {
            let mut leaf = LeafNode::init(new, b, key_size)?;
            leaf.set_prev(prev);
            leaf.set_next(next);
            Ok(())
        })?;
        if prev != NO_BLOCK {
            self.store.with_blocks(prev, 1, |b| {
                LeafNode::open(prev, b, key_size)?.set_next(new);
                Ok(())
            })?;
        }
        if next != NO_BLOCK {
            self.store.with_blocks(next, 1, |b| {
                LeafNode::open(next, b, key_size)?.set_prev(new);
                Ok(())
            })?;
        }
        Ok(())
    }

    /// Inserts a single entry into `block`, which must have room for it
    pub(crate) fn leaf_put(&self, block: BlockId, key: &[u8], value: &LeafValue<'_>) -> Result<(), Error> {
        self.store.with_blocks(block, 1, |b| {
            LeafNode::open(block, b, self.options.key_size)?.put_kv(
                value.flags(),
                key,
                value.repr_bytes(),
            )
        })
    }

    fn leaf_split(
        &self,
        block: BlockId,
        key: &[u8],
        value: &LeafValue<'_>,
    ) -> Result<InsertResult, Error> {
        let key_size = self.options.key_size;
        // the split plan is settled before anything is allocated or rewritten
        let (next, at, to_old) = self.store.with_blocks(block, 1, |b| {
            let leaf = LeafNode::open(block, b, key_size)?;
            let (at, to_old) = leaf.split_point(key, value.repr_len())?;
            Ok((leaf.next(), at, to_old))
        })?;
        let new = self.store.allocate_blocks(1)?;
        self.splice_leaf(new, block, next)?;

        let moved = self.store.with_blocks(block, 1, |b| {
            let mut leaf = LeafNode::open(block, b, key_size)?;
            let moved = leaf.split_off(at)?;
            if to_old {
                leaf.put_kv(value.flags(), key, value.repr_bytes())?;
            }
            Ok(moved)
        })?;
        trace!(
            "Split leaf {block} into {new}, moved {} entries, incoming -> {}",
            moved.len(),
            if to_old { block } else { new }
        );

        self.store.with_blocks(new, 1, |b| {
            let mut leaf = LeafNode::open(new, b, key_size)?;
            leaf.extend(&moved)?;
            if !to_old {
                leaf.put_kv(value.flags(), key, value.repr_bytes())?;
            }
            Ok(())
        })?;
        Ok(InsertResult::Split(block, new))
    }
}
