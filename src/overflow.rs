//! Values too large to live in a leaf are written to a dedicated extent of
//! contiguous blocks, the leaf stores a [BigValue] descriptor instead.

use crate::{
    error::{error_validation, Error},
    repr::BigValue,
    store::BlockStore,
    utils::blocks_needed,
};

/// Writes `value` to a freshly allocated extent
pub fn write_big_value<S: BlockStore + ?Sized>(store: &S, value: &[u8]) -> Result<BigValue, Error> {
    let size = u32::try_from(value.len())
        .map_err(|_| error_validation!("Value length {} exceeds {}", value.len(), u32::MAX))?;
    let count = blocks_needed(store.block_size(), value.len());
    let offset = store.allocate_blocks(count)?;
    store.with_blocks(offset, count, |buffer| {
        if buffer.len() < value.len() {
            return Err(Error::InsufficientBuffer {
                needed: value.len(),
                available: buffer.len(),
            });
        }
        buffer[..value.len()].copy_from_slice(value);
        Ok(())
    })?;
    trace!("Allocated overflow extent {offset}+{count} for {size} bytes");
    Ok(BigValue { size, offset })
}

/// Reads back the value referenced by `descriptor`
pub fn read_big_value<S: BlockStore + ?Sized>(store: &S, descriptor: &BigValue) -> Result<Vec<u8>, Error> {
    let (size, offset) = (descriptor.size as usize, descriptor.offset);
    let count = blocks_needed(store.block_size(), size);
    if count == 0 {
        return Ok(Vec::new());
    }
    store.with_blocks(offset, count, |buffer| {
        if buffer.len() < size {
            return Err(Error::InsufficientBuffer {
                needed: size,
                available: buffer.len(),
            });
        }
        Ok(buffer[..size].to_vec())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{options::StoreOptions, store::MemBlockStore};

    #[test]
    fn big_value_extent() {
        let store = MemBlockStore::new(StoreOptions::with_block_size(128)).unwrap();
        let value = (0..300u32).map(|i| i as u8).collect::<Vec<_>>();
        let descriptor = write_big_value(&store, &value).unwrap();
        assert_eq!({ descriptor.size }, 300);
        // ceil(300 / 128)
        assert_eq!(store.allocated_blocks(), 3);
        assert_eq!(read_big_value(&store, &descriptor).unwrap(), value);
    }

    #[test]
    fn exact_block_multiple() {
        let store = MemBlockStore::new(StoreOptions::with_block_size(128)).unwrap();
        let value = vec![0xAB; 256];
        let descriptor = write_big_value(&store, &value).unwrap();
        assert_eq!(store.allocated_blocks(), 2);
        assert_eq!(read_big_value(&store, &descriptor).unwrap(), value);
    }

    #[test]
    fn dangling_descriptor() {
        let store = MemBlockStore::new(StoreOptions::with_block_size(128)).unwrap();
        let descriptor = BigValue {
            size: 1000,
            offset: 7,
        };
        assert!(matches!(
            read_big_value(&store, &descriptor),
            Err(Error::Validation(_))
        ));
    }
}
