use crate::{
    error::{error_validation, Error},
    node::{key_buf, InternalNode, KeyBuf, LeafEntry, LeafNode, NodeKind},
    overflow::read_big_value,
    repr::{BlockId, NO_BLOCK},
    store::BlockStore,
    tree::BpTree,
    utils::EscapedBytes,
    HashSet,
};

/// Shape of a tree, as computed by [BpTree::verify]
#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Serialize)]
pub struct TreeStats {
    /// Number of levels, 1 for a tree made of a single leaf
    pub depth: usize,
    pub internal_nodes: u64,
    /// Leaves in the chain, including the pure run leaves without a parent separator
    pub leaves: u64,
    pub entries: u64,
    pub big_values: u64,
    pub pure_leaves: u64,
}

struct ChainLeaf {
    prev: BlockId,
    next: BlockId,
    entries: Vec<LeafEntry>,
}

#[derive(Default)]
struct TreeWalk {
    visited: HashSet<BlockId>,
    /// Leaves referenced by internal nodes, in tree order
    leaves: Vec<BlockId>,
    leaf_depth: Option<usize>,
    stats: TreeStats,
}

impl<S: BlockStore> BpTree<S> {
    fn read_leaf(&self, block: BlockId) -> Result<ChainLeaf, Error> {
        self.store.with_blocks(block, 1, |b| {
            let leaf = LeafNode::open(block, b, self.options.key_size)?;
            Ok(ChainLeaf {
                prev: leaf.prev(),
                next: leaf.next(),
                entries: leaf.entries()?,
            })
        })
    }

    fn leftmost_leaf(&self) -> Result<BlockId, Error> {
        let key_size = self.options.key_size;
        let mut block = self.root;
        for _ in 0..self.options.max_depth {
            let child = self.store.with_blocks(block, 1, |b| match NodeKind::decode(block, b)? {
                NodeKind::Internal => {
                    let node = InternalNode::open(block, b, key_size)?;
                    if node.num_keys() == 0 {
                        return Err(error_validation!("Internal node {block} is empty"));
                    }
                    Ok(Some(node.ptr(0)))
                }
                NodeKind::Leaf => Ok(None),
            })?;
            match child {
                Some(child) => block = child,
                None => return Ok(block),
            }
        }
        Err(error_validation!(
            "No leaf within {} levels of the root",
            self.options.max_depth
        ))
    }

    /// Dumps every entry in leaf chain order, reading overflow values back
    pub fn entries(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Error> {
        let mut result = Vec::new();
        let mut visited = HashSet::default();
        let mut block = self.leftmost_leaf()?;
        while block != NO_BLOCK {
            if !visited.insert(block) {
                return Err(error_validation!("Leaf chain cycle at {block}"));
            }
            let leaf = self.read_leaf(block)?;
            for entry in leaf.entries {
                let value = match entry.big_value() {
                    Some(descriptor) => read_big_value(&self.store, &descriptor)?,
                    None => entry.payload,
                };
                result.push((entry.key.to_vec(), value));
            }
            block = leaf.next;
        }
        Ok(result)
    }

    /// Checks the structural invariants of the whole tree.
    ///
    /// * every separator equals the smallest key of its subtree
    /// * separators and leaf keys are sorted, all referenced leaves share a depth
    /// * the leaf chain is doubly linked, acyclic and sorted across neighbours
    /// * leaves without a parent separator continue a pure run of the same key
    /// * overflow extents are readable
    pub fn verify(&self) -> Result<TreeStats, Error> {
        let mut walk = TreeWalk::default();
        self.verify_node(self.root, 1, &mut walk)?;
        let mut stats = std::mem::take(&mut walk.stats);
        stats.depth = walk.leaf_depth.unwrap_or_default();
        self.verify_chain(&walk.leaves, &mut stats)?;
        trace!("Verified tree {stats:?}");
        Ok(stats)
    }

    /// Returns the smallest key of the subtree, `None` for an empty root leaf
    fn verify_node(&self, block: BlockId, depth: usize, walk: &mut TreeWalk) -> Result<Option<KeyBuf>, Error> {
        if depth > self.options.max_depth {
            return Err(error_validation!("Block {block} is past the max depth"));
        }
        if !walk.visited.insert(block) {
            return Err(error_validation!("Block {block} is referenced more than once"));
        }
        let key_size = self.options.key_size;
        let kind = self.store.with_blocks(block, 1, |b| NodeKind::decode(block, b))?;
        if kind == NodeKind::Leaf {
            if *walk.leaf_depth.get_or_insert(depth) != depth {
                return Err(error_validation!("Leaf {block} at depth {depth}, expected {:?}", walk.leaf_depth));
            }
            walk.leaves.push(block);
            let first = self.store.with_blocks(block, 1, |b| {
                let leaf = LeafNode::open(block, b, key_size)?;
                Ok((!leaf.is_empty()).then(|| key_buf(leaf.key(0))))
            })?;
            return Ok(first);
        }

        walk.stats.internal_nodes += 1;
        let separators = self.store.with_blocks(block, 1, |b| {
            let node = InternalNode::open(block, b, key_size)?;
            Ok((0..node.num_keys())
                .map(|i| (key_buf(node.key(i)), node.ptr(i)))
                .collect::<Vec<_>>())
        })?;
        if separators.is_empty() {
            return Err(error_validation!("Internal node {block} is empty"));
        }
        if let Some(i) = separators.windows(2).position(|w| w[0].0[..] > w[1].0[..]) {
            return Err(error_validation!("Internal node {block} separators unsorted at {i}"));
        }
        for (separator, child) in &separators {
            match self.verify_node(*child, depth + 1, walk)? {
                Some(min) if min == *separator => (),
                Some(min) => {
                    return Err(error_validation!(
                        "Separator {:?} in {block} doesn't match the minimum {:?} of {child}",
                        EscapedBytes(separator),
                        EscapedBytes(&min)
                    ))
                }
                None => return Err(error_validation!("Empty leaf {child} under {block}")),
            }
        }
        Ok(Some(separators[0].0.clone()))
    }

    fn verify_chain(&self, referenced: &[BlockId], stats: &mut TreeStats) -> Result<(), Error> {
        let mut referenced = referenced.iter().copied().peekable();
        let mut visited = HashSet::default();
        // (first key, last key, pure) of the previous leaf
        let mut previous: Option<(KeyBuf, KeyBuf, bool)> = None;
        let mut prev = NO_BLOCK;
        let mut block = referenced.peek().copied().unwrap_or(NO_BLOCK);
        while block != NO_BLOCK {
            if !visited.insert(block) {
                return Err(error_validation!("Leaf chain cycle at {block}"));
            }
            let leaf = self.read_leaf(block)?;
            if leaf.prev != prev {
                return Err(error_validation!(
                    "Leaf {block} prev is {}, expected {prev}",
                    leaf.prev
                ));
            }
            let is_referenced = referenced.next_if_eq(&block).is_some();

            let (Some(first), Some(last)) = (leaf.entries.first(), leaf.entries.last()) else {
                if block == self.root {
                    stats.leaves += 1;
                    break;
                }
                return Err(error_validation!("Leaf {block} is empty"));
            };
            if let Some(i) = leaf.entries.windows(2).position(|w| w[0].key[..] > w[1].key[..]) {
                return Err(error_validation!("Leaf {block} keys unsorted at {i}"));
            }
            if let Some((_, prev_last, _)) = &previous {
                if prev_last[..] > first.key[..] {
                    return Err(error_validation!(
                        "Leaf {block} first key {:?} sorts before {:?} in {prev}",
                        EscapedBytes(&first.key),
                        EscapedBytes(prev_last)
                    ));
                }
            }
            let pure = first.key == last.key;
            if !is_referenced {
                let continues_run = matches!(
                    &previous,
                    Some((prev_first, _, true)) if pure && *prev_first == first.key
                );
                if !continues_run {
                    return Err(error_validation!(
                        "Leaf {block} isn't referenced by the tree nor part of a pure run"
                    ));
                }
            }

            stats.leaves += 1;
            stats.pure_leaves += pure as u64;
            stats.entries += leaf.entries.len() as u64;
            for entry in &leaf.entries {
                if let Some(descriptor) = entry.big_value() {
                    stats.big_values += 1;
                    let value = read_big_value(&self.store, &descriptor)?;
                    if value.len() != descriptor.size as usize {
                        return Err(error_validation!("Short overflow extent {descriptor:?}"));
                    }
                }
            }
            previous = Some((first.key.clone(), last.key.clone(), pure));
            prev = block;
            block = leaf.next;
        }
        if let Some(missing) = referenced.next() {
            return Err(error_validation!(
                "Leaf {missing} is referenced by the tree but not reachable through the chain"
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        options::{StoreOptions, TreeOptions},
        store::MemBlockStore,
    };

    fn k(i: u64) -> [u8; 8] {
        i.to_be_bytes()
    }

    fn new_tree() -> BpTree<MemBlockStore> {
        let store = MemBlockStore::new(StoreOptions::with_block_size(128)).unwrap();
        BpTree::create(store, TreeOptions::with_key_size(8)).unwrap()
    }

    #[test]
    fn empty_tree() {
        let tree = new_tree();
        let stats = tree.verify().unwrap();
        assert_eq!(
            stats,
            TreeStats {
                depth: 1,
                leaves: 1,
                ..Default::default()
            }
        );
        assert!(tree.entries().unwrap().is_empty());
    }

    #[test]
    fn detects_broken_back_link() {
        let mut tree = new_tree();
        for i in 0..6 {
            tree.add(&k(i), &k(i)).unwrap();
        }
        tree.verify().unwrap();
        let first = tree.leftmost_leaf().unwrap();
        let second = tree.read_leaf(first).unwrap().next;
        tree.store
            .with_blocks(second, 1, |b| {
                LeafNode::open(second, b, 8)?.set_prev(NO_BLOCK);
                Ok(())
            })
            .unwrap();
        assert!(matches!(tree.verify(), Err(Error::Validation(_))));
    }

    #[test]
    fn detects_stale_separator() {
        let mut tree = new_tree();
        for i in 0..6 {
            tree.add(&k(i * 2), &k(i)).unwrap();
        }
        let root = tree.root;
        tree.store
            .with_blocks(root, 1, |b| {
                let mut node = InternalNode::open(root, b, 8)?;
                node.set_key(1, &k(5));
                Ok(())
            })
            .unwrap();
        assert!(matches!(tree.verify(), Err(Error::Validation(_))));
    }

    #[test]
    fn detects_unknown_tag() {
        let mut tree = new_tree();
        for i in 0..6 {
            tree.add(&k(i), &k(i)).unwrap();
        }
        let leaf = tree.leftmost_leaf().unwrap();
        tree.store
            .with_blocks(leaf, 1, |b| {
                b[0] = 0xF0;
                Ok(())
            })
            .unwrap();
        assert!(matches!(
            tree.verify(),
            Err(Error::UnknownBlockType { flags: 0xF0, .. })
        ));
    }
}
