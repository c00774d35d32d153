//! Leaves holding a single distinct key are split by growing a chain of pure
//! leaves (a pure run) instead of halving them. The whole run hangs from a single
//! parent separator, only the first leaf of a run is referenced by the parent.

use crate::{
    error::{error_validation, Error},
    node::{key_buf, LeafNode, LeafValue},
    repr::{BlockId, NO_BLOCK},
    store::BlockStore,
    tree::{BpTree, InsertResult},
    utils::EscapedBytes,
    HashSet,
};

/// Last leaf of the pure run starting at `start`.
///
/// Follows `next` while the following leaf is pure and shares the first key of `start`.
/// Fails with [Error::EmptyBlock] if `start` is empty.
pub(crate) fn end_of_pure_run<S: BlockStore>(tree: &BpTree<S>, start: BlockId) -> Result<BlockId, Error> {
    let key_size = tree.options.key_size;
    let (run_key, mut next) = tree.store.with_blocks(start, 1, |b| {
        let leaf = LeafNode::open(start, b, key_size)?;
        if leaf.is_empty() {
            return Err(Error::EmptyBlock(start));
        }
        Ok((key_buf(leaf.key(0)), leaf.next()))
    })?;

    let mut end = start;
    let mut visited = HashSet::default();
    visited.insert(start);
    while next != NO_BLOCK {
        if !visited.insert(next) {
            return Err(error_validation!("Leaf chain cycle at {next}"));
        }
        let candidate = next;
        let (continues, following) = tree.store.with_blocks(candidate, 1, |b| {
            let leaf = LeafNode::open(candidate, b, key_size)?;
            Ok((leaf.pure() && leaf.key(0) == &run_key[..], leaf.next()))
        })?;
        if !continues {
            break;
        }
        end = candidate;
        next = following;
    }
    Ok(end)
}

/// Inserts into the pure leaf `block`, extending its run instead of splitting it
pub(crate) fn pure_leaf_split<S: BlockStore>(
    tree: &BpTree<S>,
    block: BlockId,
    key: &[u8],
    value: &LeafValue<'_>,
) -> Result<InsertResult, Error> {
    let key_size = tree.options.key_size;
    let spare = tree.store.allocate_blocks(1)?;
    let (run_key, prev) = tree.store.with_blocks(block, 1, |b| {
        let leaf = LeafNode::open(block, b, key_size)?;
        if leaf.is_empty() {
            return Err(Error::EmptyBlock(block));
        }
        Ok((key_buf(leaf.key(0)), leaf.prev()))
    })?;

    if key < &run_key[..] {
        // the run gets a new leaf in front of it, a regular split for the parent
        tree.splice_leaf(spare, prev, block)?;
        tree.leaf_put(spare, key, value)?;
        trace!(
            "Pure leaf {block} preceded by {spare} for {:?}",
            EscapedBytes(key)
        );
        return Ok(InsertResult::Split(spare, block));
    }

    let end = end_of_pure_run(tree, block)?;
    if key == &run_key[..] {
        let inserted = tree.store.with_blocks(end, 1, |b| {
            let mut leaf = LeafNode::open(end, b, key_size)?;
            if !leaf.fits(value.repr_len()) {
                return Ok(false);
            }
            leaf.put_kv(value.flags(), key, value.repr_bytes())?;
            Ok(true)
        })?;
        if inserted {
            trace!("Pure run {block} absorbed the entry in {end}, releasing {spare}");
            tree.store.free(spare)?;
            return Ok(InsertResult::Ok(block));
        }
    }

    let (end_key, end_next) = tree.store.with_blocks(end, 1, |b| {
        let leaf = LeafNode::open(end, b, key_size)?;
        if leaf.is_empty() {
            return Err(Error::EmptyBlock(end));
        }
        Ok((key_buf(leaf.key(0)), leaf.next()))
    })?;
    // the run end carries the run key and smaller keys were handled above,
    // so the spare always goes after the end of the run
    debug_assert!(end_key == run_key && key >= &end_key[..]);
    tree.splice_leaf(spare, end, end_next)?;
    tree.leaf_put(spare, key, value)?;

    if key != &run_key[..] {
        trace!(
            "Pure run {block}..{end} followed by {spare} for {:?}",
            EscapedBytes(key)
        );
        Ok(InsertResult::Split(block, spare))
    } else {
        trace!("Pure run {block} extended with {spare} after {end}");
        Ok(InsertResult::Ok(block))
    }
}
