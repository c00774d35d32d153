use std::fmt;

use smallvec::SmallVec;
use zerocopy::{FromBytes, IntoBytes};

use crate::{
    error::{error_validation, Error},
    repr::*,
    utils::EscapedBytes,
};

/// Owned key, inline for the common key sizes
pub(crate) type KeyBuf = SmallVec<u8, 32>;

#[inline]
pub(crate) fn key_buf(key: &[u8]) -> KeyBuf {
    key.iter().copied().collect()
}

/// Decoded block type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeKind {
    Internal,
    Leaf,
}

impl NodeKind {
    pub fn decode(block: BlockId, bytes: &[u8]) -> Result<Self, Error> {
        let raw = bytes.first().copied().unwrap_or_default();
        match NodeFlags::from_bits(raw) {
            Some(NodeFlags::Internal) => Ok(NodeKind::Internal),
            Some(NodeFlags::Leaf) => Ok(NodeKind::Leaf),
            _ => Err(Error::UnknownBlockType { block, flags: raw }),
        }
    }
}

/// Decoded leaf value
pub enum LeafValue<'a> {
    Small(&'a [u8]),
    Big(BigValue),
}

impl fmt::Debug for LeafValue<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Small(arg0) => f.debug_tuple("Small").field(&EscapedBytes(arg0)).finish(),
            Self::Big(arg0) => f.debug_tuple("Big").field(arg0).finish(),
        }
    }
}

impl LeafValue<'_> {
    #[inline]
    pub fn flags(&self) -> ValueFlags {
        match self {
            LeafValue::Small(_) => ValueFlags::Small,
            LeafValue::Big(_) => ValueFlags::Big,
        }
    }

    /// Bytes stored in the leaf heap after the value tag
    #[inline]
    pub fn repr_bytes(&self) -> &[u8] {
        match self {
            LeafValue::Small(b) => b,
            LeafValue::Big(b) => b.as_bytes(),
        }
    }

    #[inline]
    pub fn repr_len(&self) -> usize {
        self.repr_bytes().len()
    }

    fn decode(block: BlockId, raw: &[u8]) -> Result<LeafValue<'_>, Error> {
        let Some((&tag, payload)) = raw.split_first() else {
            return Err(error_validation!("Missing value tag in leaf {block}"));
        };
        match ValueFlags::from_bits(tag) {
            Some(ValueFlags::Small) => Ok(LeafValue::Small(payload)),
            Some(ValueFlags::Big) => BigValue::read_from_bytes(payload)
                .map(LeafValue::Big)
                .map_err(|_| error_validation!("Malformed overflow descriptor in leaf {block}")),
            _ => Err(error_validation!("Unknown value tag {tag:#x} in leaf {block}")),
        }
    }
}

/// Leaf entry copied out of a block, used to move entries between leaves
#[derive(Clone)]
pub(crate) struct LeafEntry {
    pub key: KeyBuf,
    pub flags: ValueFlags,
    pub payload: Vec<u8>,
}

impl fmt::Debug for LeafEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeafEntry")
            .field("key", &EscapedBytes(&self.key))
            .field("flags", &self.flags)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

impl LeafEntry {
    /// Overflow descriptor, for entries holding big values
    pub fn big_value(&self) -> Option<BigValue> {
        if self.flags != ValueFlags::Big {
            return None;
        }
        BigValue::read_from_bytes(&self.payload).ok()
    }
}

/// Index of the first key `>= key` and whether it's an exact match
fn lower_bound<'k>(len: usize, key_at: impl Fn(usize) -> &'k [u8], key: &[u8]) -> (usize, bool) {
    let (mut left, mut right) = (0, len);
    while left < right {
        let mid = left + (right - left) / 2;
        if key_at(mid) < key {
            left = mid + 1;
        } else {
            right = mid;
        }
    }
    (left, left < len && key_at(left) == key)
}

/// Index of the first key `> key`
fn upper_bound<'k>(len: usize, key_at: impl Fn(usize) -> &'k [u8], key: &[u8]) -> usize {
    let (mut left, mut right) = (0, len);
    while left < right {
        let mid = left + (right - left) / 2;
        if key_at(mid) <= key {
            left = mid + 1;
        } else {
            right = mid;
        }
    }
    left
}

/// View over an internal node block.
///
/// Keys and child pointers are kept in two fixed capacity arrays,
/// `keys[i]` is the smallest key reachable through `ptrs[i]`.
pub(crate) struct InternalNode<'a> {
    block: BlockId,
    header: &'a mut NodeHeader,
    keys: &'a mut [u8],
    ptrs: &'a mut [BlockPtr],
    key_size: usize,
}

impl<'a> InternalNode<'a> {
    fn from_bytes(block: BlockId, bytes: &'a mut [u8], key_size: usize) -> Result<Self, Error> {
        let capacity = internal_capacity(bytes.len(), key_size);
        let (header, body) = NodeHeader::mut_from_prefix(bytes)
            .map_err(|_| error_validation!("Block {block} too small for an internal node"))?;
        let (keys, rest) = body.split_at_mut(capacity * key_size);
        let ptrs = <[BlockPtr]>::mut_from_bytes(&mut rest[..capacity * PTR_SIZE])
            .map_err(|_| error_validation!("Block {block} too small for an internal node"))?;
        Ok(Self {
            block,
            header,
            keys,
            ptrs,
            key_size,
        })
    }

    /// Opens an existing internal node
    pub fn open(block: BlockId, bytes: &'a mut [u8], key_size: usize) -> Result<Self, Error> {
        if NodeKind::decode(block, bytes)? != NodeKind::Internal {
            return Err(error_validation!("Block {block} isn't an internal node"));
        }
        let node = Self::from_bytes(block, bytes, key_size)?;
        if node.num_keys() > node.capacity() {
            return Err(error_validation!(
                "Internal node {block} key count {} exceeds capacity {}",
                node.num_keys(),
                node.capacity()
            ));
        }
        Ok(node)
    }

    /// Formats a freshly allocated block as an empty internal node
    pub fn init(block: BlockId, bytes: &'a mut [u8], key_size: usize) -> Result<Self, Error> {
        bytes.fill(0);
        let node = Self::from_bytes(block, bytes, key_size)?;
        node.header.flags = NodeFlags::Internal;
        Ok(node)
    }

    #[inline]
    pub fn num_keys(&self) -> usize {
        self.header.key_count as usize
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.ptrs.len()
    }

    #[inline]
    pub fn full(&self) -> bool {
        self.num_keys() >= self.capacity()
    }

    #[inline]
    pub fn key(&self, i: usize) -> &[u8] {
        &self.keys[i * self.key_size..][..self.key_size]
    }

    #[inline]
    pub fn ptr(&self, i: usize) -> BlockId {
        self.ptrs[..self.num_keys()][i].0
    }

    pub fn set_ptr(&mut self, i: usize, ptr: BlockId) {
        debug_assert!(i < self.num_keys());
        self.ptrs[i] = BlockPtr(ptr);
    }

    pub fn set_key(&mut self, i: usize, key: &[u8]) {
        debug_assert!(i < self.num_keys());
        self.keys[i * self.key_size..][..self.key_size].copy_from_slice(key);
    }

    /// Index of the first separator `>= key` and whether it's an exact match
    pub fn find(&self, key: &[u8]) -> (usize, bool) {
        lower_bound(self.num_keys(), |i| self.key(i), key)
    }

    /// Index of the child whose subtree should hold `key`
    pub fn child_index(&self, key: &[u8]) -> Result<usize, Error> {
        if self.num_keys() == 0 {
            return Err(error_validation!("Internal node {} is empty", self.block));
        }
        let (mut i, exact) = self.find(key);
        if !exact && i > 0 {
            // not an exact match, the key belongs to the preceding subtree
            i -= 1;
        }
        Ok(i)
    }

    /// Inserts a separator at `i`, shifting the following ones.
    ///
    /// Callers pick `i` from the position of the child that split, equal
    /// separators must stay in the same order as the leaf chain.
    pub fn put_kp(&mut self, i: usize, key: &[u8], ptr: BlockId) -> Result<(), Error> {
        if key.len() != self.key_size {
            return Err(Error::KeySizeMismatch {
                expected: self.key_size,
                got: key.len(),
            });
        }
        if self.full() {
            return Err(error_validation!("Internal node {} is full", self.block));
        }
        let n = self.num_keys();
        if i > n || (i > 0 && self.key(i - 1) > key) || (i < n && self.key(i) < key) {
            return Err(error_validation!(
                "Separator {:?} out of order at {i} in internal node {}",
                EscapedBytes(key),
                self.block
            ));
        }
        let ks = self.key_size;
        self.keys.copy_within(i * ks..n * ks, (i + 1) * ks);
        self.keys[i * ks..][..ks].copy_from_slice(key);
        self.ptrs.copy_within(i..n, i + 1);
        self.ptrs[i] = BlockPtr(ptr);
        self.header.key_count = (n + 1) as u16;
        Ok(())
    }

    /// Moves the upper half of the separators out of this node
    pub fn split_off_half(&mut self) -> Vec<(KeyBuf, BlockId)> {
        let n = self.num_keys();
        let mid = n / 2;
        let moved = (mid..n)
            .map(|i| (key_buf(self.key(i)), self.ptr(i)))
            .collect::<Vec<_>>();
        self.keys[mid * self.key_size..n * self.key_size].fill(0);
        self.ptrs[mid..n].fill(BlockPtr(NO_BLOCK));
        self.header.key_count = mid as u16;
        moved
    }

    /// Appends separators that sort after every existing one
    pub fn extend(&mut self, entries: &[(KeyBuf, BlockId)]) -> Result<(), Error> {
        let n = self.num_keys();
        if n + entries.len() > self.capacity() {
            return Err(error_validation!(
                "Internal node {} can't take {} more keys",
                self.block,
                entries.len()
            ));
        }
        for (j, (key, ptr)) in entries.iter().enumerate() {
            debug_assert!(n + j == 0 || self.key(n + j - 1) <= &key[..]);
            self.keys[(n + j) * self.key_size..][..self.key_size].copy_from_slice(key);
            self.ptrs[n + j] = BlockPtr(*ptr);
        }
        self.header.key_count = (n + entries.len()) as u16;
        Ok(())
    }
}

/// View over a leaf node block.
///
/// Layout after the header: a slot array growing upwards (key followed by a [SlotRepr])
/// and a value heap growing downwards from the end of the block. Each heap entry is a
/// [ValueFlags] tag followed by the inline value or a [BigValue] descriptor.
pub(crate) struct LeafNode<'a> {
    block: BlockId,
    header: &'a mut LeafHeader,
    body: &'a mut [u8],
    key_size: usize,
}

impl<'a> LeafNode<'a> {
    fn from_bytes(block: BlockId, bytes: &'a mut [u8], key_size: usize) -> Result<Self, Error> {
        let (header, body) = LeafHeader::mut_from_prefix(bytes)
            .map_err(|_| error_validation!("Block {block} too small for a leaf"))?;
        Ok(Self {
            block,
            header,
            body,
            key_size,
        })
    }

    /// Opens an existing leaf
    pub fn open(block: BlockId, bytes: &'a mut [u8], key_size: usize) -> Result<Self, Error> {
        if NodeKind::decode(block, bytes)? != NodeKind::Leaf {
            return Err(error_validation!("Block {block} isn't a leaf"));
        }
        let node = Self::from_bytes(block, bytes, key_size)?;
        let heap_start = node.header.heap_start as usize;
        if heap_start > node.body.len() || node.slots_end() > heap_start {
            return Err(error_validation!("Leaf {block} has a corrupt layout"));
        }
        Ok(node)
    }

    /// Formats a freshly allocated block as an empty, unlinked leaf
    pub fn init(block: BlockId, bytes: &'a mut [u8], key_size: usize) -> Result<Self, Error> {
        bytes.fill(0);
        let node = Self::from_bytes(block, bytes, key_size)?;
        node.header.node_header.flags = NodeFlags::Leaf;
        node.header.heap_start = node.body.len() as u32;
        Ok(node)
    }

    #[inline]
    pub fn num_keys(&self) -> usize {
        self.header.node_header.key_count as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.num_keys() == 0
    }

    #[inline]
    pub fn prev(&self) -> BlockId {
        self.header.prev
    }

    #[inline]
    pub fn next(&self) -> BlockId {
        self.header.next
    }

    #[inline]
    pub fn set_prev(&mut self, prev: BlockId) {
        self.header.prev = prev;
    }

    #[inline]
    pub fn set_next(&mut self, next: BlockId) {
        self.header.next = next;
    }

    #[inline]
    fn slot_size(&self) -> usize {
        self.key_size + SLOT_SIZE
    }

    #[inline]
    fn slots_end(&self) -> usize {
        self.num_keys() * self.slot_size()
    }

    /// Bytes left between the slot array and the heap
    #[inline]
    pub fn free_space(&self) -> usize {
        self.header.heap_start as usize - self.slots_end()
    }

    /// Whether an entry with a value payload of `payload_len` bytes fits
    #[inline]
    pub fn fits(&self, payload_len: usize) -> bool {
        self.free_space() >= leaf_entry_size(self.key_size, payload_len)
    }

    #[inline]
    pub fn key(&self, i: usize) -> &[u8] {
        debug_assert!(i < self.num_keys());
        &self.body[i * self.slot_size()..][..self.key_size]
    }

    #[inline]
    fn slot(&self, i: usize) -> SlotRepr {
        let start = i * self.slot_size() + self.key_size;
        SlotRepr::read_from_bytes(&self.body[start..][..SLOT_SIZE])
            .expect("slot is SLOT_SIZE bytes")
    }

    /// Heap bytes of entry `i`, value tag included
    fn raw_value(&self, i: usize) -> Result<&[u8], Error> {
        let slot = self.slot(i);
        let (offset, len) = (slot.offset as usize, slot.len as usize);
        if offset < self.header.heap_start as usize || offset + len > self.body.len() {
            return Err(error_validation!(
                "Leaf {} slot {i} points outside of the heap",
                self.block
            ));
        }
        Ok(&self.body[offset..][..len])
    }

    pub fn value(&self, i: usize) -> Result<LeafValue<'_>, Error> {
        LeafValue::decode(self.block, self.raw_value(i)?)
    }

    /// Whether every entry shares the first key. Empty leaves aren't pure.
    pub fn pure(&self) -> bool {
        if self.is_empty() {
            return false;
        }
        let first = self.key(0);
        (1..self.num_keys()).all(|i| self.key(i) == first)
    }

    /// Inserts an entry in sorted position, after any entries with an equal key
    pub fn put_kv(&mut self, flags: ValueFlags, key: &[u8], payload: &[u8]) -> Result<(), Error> {
        if key.len() != self.key_size {
            return Err(Error::KeySizeMismatch {
                expected: self.key_size,
                got: key.len(),
            });
        }
        if !self.fits(payload.len()) {
            return Err(Error::InsufficientBuffer {
                needed: leaf_entry_size(self.key_size, payload.len()),
                available: self.free_space(),
            });
        }
        let n = self.num_keys();
        let i = upper_bound(n, |i| self.key(i), key);

        let value_len = VALUE_TAG_SIZE + payload.len();
        let offset = self.header.heap_start as usize - value_len;
        self.body[offset] = flags.bits();
        self.body[offset + VALUE_TAG_SIZE..][..payload.len()].copy_from_slice(payload);
        self.header.heap_start = offset as u32;

        let ss = self.slot_size();
        self.body.copy_within(i * ss..n * ss, (i + 1) * ss);
        let slot = SlotRepr {
            offset: offset as u32,
            len: value_len as u32,
        };
        let slot_bytes = &mut self.body[i * ss..][..ss];
        slot_bytes[..self.key_size].copy_from_slice(key);
        slot_bytes[self.key_size..].copy_from_slice(slot.as_bytes());
        self.header.node_header.key_count = (n + 1) as u16;
        Ok(())
    }

    fn entry(&self, i: usize) -> Result<LeafEntry, Error> {
        let raw = self.raw_value(i)?;
        let value = LeafValue::decode(self.block, raw)?;
        Ok(LeafEntry {
            key: key_buf(self.key(i)),
            flags: value.flags(),
            payload: value.repr_bytes().to_vec(),
        })
    }

    /// Copies out every entry
    pub fn entries(&self) -> Result<Vec<LeafEntry>, Error> {
        (0..self.num_keys()).map(|i| self.entry(i)).collect()
    }

    /// Empties the leaf, keeping its chain links
    fn clear(&mut self) {
        let end = self.body.len();
        self.body.fill(0);
        self.header.node_header.key_count = 0;
        self.header.heap_start = end as u32;
    }

    /// Picks how this full leaf splits to take `key` with a `payload_len` value.
    ///
    /// Returns `(at, to_old)`: entries `[at..]` move to the new leaf and the incoming entry
    /// stays in this leaf when `to_old`, otherwise it goes to the new one. Cuts are taken over
    /// the entries with the incoming one in its sorted position, so it may also become the
    /// first entry of the new leaf. Only cuts where both sides fit are considered, the one
    /// minimizing the fuller side wins, preferring boundaries between distinct keys.
    pub fn split_point(&self, key: &[u8], payload_len: usize) -> Result<(usize, bool), Error> {
        let n = self.num_keys();
        let incoming = leaf_entry_size(self.key_size, payload_len);
        let p = upper_bound(n, |i| self.key(i), key);
        let mut merged = Vec::with_capacity(n + 1);
        for i in 0..n {
            if i == p {
                merged.push((incoming, key));
            }
            merged.push((self.slot_size() + self.slot(i).len as usize, self.key(i)));
        }
        if p == n {
            merged.push((incoming, key));
        }

        let capacity = self.body.len();
        let total = merged.iter().map(|(size, _)| size).sum::<usize>();
        let mut best: Option<(usize, bool, usize)> = None;
        let mut left = 0;
        for c in 1..merged.len() {
            left += merged[c - 1].0;
            let right = total - left;
            if left > capacity || right > capacity {
                continue;
            }
            let candidate = (left.max(right), merged[c - 1].1 == merged[c].1, c);
            if best.map_or(true, |b| (candidate.0, candidate.1) < (b.0, b.1)) {
                best = Some(candidate);
            }
        }
        let Some((_, _, c)) = best else {
            return Err(Error::InsufficientBuffer {
                needed: incoming,
                available: self.free_space(),
            });
        };
        Ok(if c <= p { (c, false) } else { (c - 1, true) })
    }

    /// Moves entries `[at..]` out of this leaf, compacting the remaining ones
    pub fn split_off(&mut self, at: usize) -> Result<Vec<LeafEntry>, Error> {
        let mut kept = self.entries()?;
        let moved = kept.split_off(at.min(kept.len()));
        self.clear();
        self.extend(&kept)?;
        Ok(moved)
    }

    /// Appends entries that sort after every existing one
    pub fn extend(&mut self, entries: &[LeafEntry]) -> Result<(), Error> {
        for e in entries {
            debug_assert!(self.is_empty() || self.key(self.num_keys() - 1) <= &e.key[..]);
            self.put_kv(e.flags, &e.key, &e.payload)?;
        }
        Ok(())
    }
}
