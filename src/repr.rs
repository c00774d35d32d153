use std::mem::size_of;
use zerocopy::*;

/// Block identifier inside a [crate::BlockStore]
pub type BlockId = u64;

/// Block 0 holds the tree metadata and is never handed out by the allocator,
/// so it also doubles as the "no block" marker in leaf links.
pub const META_BLOCK: BlockId = 0;
pub const NO_BLOCK: BlockId = 0;

pub const META_MAGIC: u64 = 0x5D1F_0B7E_E2A4_C316;

#[derive(Default, Copy, Debug, Clone, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, PartialEq, Eq)]
#[repr(C)]
pub struct NodeFlags(u8);

bitflags::bitflags! {
    impl NodeFlags: u8 {
        /// Routing node holding separator keys and child pointers
        const Internal = 0b01;
        /// Leaf node holding key value pairs, linked with its siblings
        const Leaf = 0b10;
    }
}

#[derive(Default, Copy, Debug, Clone, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, PartialEq, Eq)]
#[repr(C)]
pub struct ValueFlags(u8);

bitflags::bitflags! {
    impl ValueFlags: u8 {
        /// Value bytes are stored inline in the leaf
        const Small = 0b01;
        /// The leaf stores a [BigValue] descriptor pointing to an overflow extent
        const Big = 0b10;
    }
}

#[derive(Default, Copy, Debug, Clone, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
pub struct NodeHeader {
    pub flags: NodeFlags,
    pub _reserved: u8,
    pub key_count: u16,
}

#[derive(Default, Copy, Debug, Clone, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
pub struct LeafHeader {
    pub node_header: NodeHeader,
    /// Start of the value heap, relative to the end of the header.
    /// The heap grows downwards from the end of the block.
    pub heap_start: u32,
    pub prev: BlockId,
    pub next: BlockId,
}

/// Child pointer of an internal node
#[derive(Default, Copy, Clone, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
pub struct BlockPtr(pub BlockId);

/// Trails every key in the leaf slot array, locating the value inside the heap
#[derive(Default, Copy, Clone, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
pub struct SlotRepr {
    pub offset: u32,
    pub len: u32,
}

/// Descriptor stored inline in place of values too large for a leaf
#[derive(Default, Copy, Clone, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, PartialEq, Eq)]
#[repr(C, packed)]
pub struct BigValue {
    pub size: u32,
    pub offset: BlockId,
}

impl std::fmt::Debug for BigValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BigValue")
            .field("size", &{ self.size })
            .field("offset", &{ self.offset })
            .finish()
    }
}

#[derive(Default, Copy, Clone, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
pub struct MetaHeader {
    pub magic: u64,
    pub block_size: u32,
    pub key_size: u32,
    pub root: BlockId,
}

impl std::fmt::Debug for MetaHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaHeader")
            .field("block_size", &{ self.block_size })
            .field("key_size", &{ self.key_size })
            .field("root", &{ self.root })
            .finish()
    }
}

pub const INTERNAL_HEADER_SIZE: usize = size_of::<NodeHeader>();
pub const LEAF_HEADER_SIZE: usize = size_of::<LeafHeader>();
pub const PTR_SIZE: usize = size_of::<BlockPtr>();
pub const SLOT_SIZE: usize = size_of::<SlotRepr>();
pub const BIG_VALUE_SIZE: usize = size_of::<BigValue>();
/// Every heap entry is prefixed by its [ValueFlags]
pub const VALUE_TAG_SIZE: usize = size_of::<ValueFlags>();

/// Number of separators an internal node of `block_size` can hold
#[inline]
pub fn internal_capacity(block_size: usize, key_size: usize) -> usize {
    block_size.saturating_sub(INTERNAL_HEADER_SIZE) / (key_size + PTR_SIZE)
}

/// Bytes a leaf entry occupies, slot and heap included
#[inline]
pub fn leaf_entry_size(key_size: usize, payload_len: usize) -> usize {
    key_size + SLOT_SIZE + VALUE_TAG_SIZE + payload_len
}
