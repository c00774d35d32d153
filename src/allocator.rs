use std::collections::BTreeMap;

use crate::{
    error::{error_validation, Error},
    repr::{BlockId, META_BLOCK},
};

/// Contiguous block allocator shared by the block store implementations.
///
/// Free blocks are tracked as ranges (start -> span) and allocated first fit,
/// falling back to growing the allocation horizon.
#[derive(Debug, Clone)]
pub(crate) struct Allocator {
    /// Free ranges, never adjacent to each other nor to the horizon
    free: BTreeMap<BlockId, u64>,
    /// Allocation horizon, every block at or past it is unallocated
    pub next_block: BlockId,
    /// Store capacity in blocks
    pub max_blocks: u64,
}

impl Allocator {
    /// The metadata block is always allocated
    pub fn new(max_blocks: u64) -> Self {
        Self::with_horizon(META_BLOCK + 1, max_blocks)
    }

    pub fn with_horizon(next_block: BlockId, max_blocks: u64) -> Self {
        Self {
            free: Default::default(),
            next_block: next_block.max(META_BLOCK + 1),
            max_blocks,
        }
    }

    /// Number of free blocks below the horizon
    pub fn free_len(&self) -> u64 {
        self.free.values().sum()
    }

    pub fn is_allocated(&self, block: BlockId, span: u64) -> bool {
        if block == META_BLOCK || block + span > self.next_block {
            return false;
        }
        let end = block + span;
        // the closest free range starting before the end must not overlap
        match self.free.range(..end).next_back() {
            Some((&start, &free_span)) => start + free_span <= block,
            None => true,
        }
    }

    pub fn allocate(&mut self, span: u64) -> Result<BlockId, Error> {
        if span == 0 {
            return Err(error_validation!("Can't allocate 0 blocks"));
        }
        let first_fit = self
            .free
            .iter()
            .find(|(_, &free_span)| free_span >= span)
            .map(|(&start, &free_span)| (start, free_span));
        if let Some((start, free_span)) = first_fit {
            self.free.remove(&start);
            if free_span > span {
                self.free.insert(start + span, free_span - span);
            }
            return Ok(start);
        }

        let available = self.max_blocks.saturating_sub(self.next_block);
        if available < span {
            return Err(Error::AllocationFailure {
                requested: span,
                available,
            });
        }
        let start = self.next_block;
        self.next_block += span;
        Ok(start)
    }

    pub fn free(&mut self, block: BlockId, span: u64) -> Result<(), Error> {
        if span == 0 {
            return Ok(());
        }
        if !self.is_allocated(block, span) {
            return Err(error_validation!(
                "Freeing blocks {block}..{} which aren't allocated",
                block + span
            ));
        }
        let mut start = block;
        let mut span = span;
        // coalesce with the previous range
        if let Some((&prev, &prev_span)) = self.free.range(..start).next_back() {
            if prev + prev_span == start {
                self.free.remove(&prev);
                start = prev;
                span += prev_span;
            }
        }
        // coalesce with the next range
        if let Some(next_span) = self.free.remove(&(start + span)) {
            span += next_span;
        }
        if start + span == self.next_block {
            trace!("Returned {span} blocks to the horizon {}", self.next_block);
            self.next_block = start;
        } else {
            self.free.insert(start, span);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_grows_horizon() {
        let mut a = Allocator::new(100);
        assert_eq!(a.allocate(1).unwrap(), 1);
        assert_eq!(a.allocate(3).unwrap(), 2);
        assert_eq!(a.next_block, 5);
        assert!(a.is_allocated(2, 3));
        assert!(!a.is_allocated(0, 1));
        assert!(!a.is_allocated(4, 2));
    }

    #[test]
    fn free_reuses_and_coalesces() {
        let mut a = Allocator::new(100);
        let blocks = (0..6).map(|_| a.allocate(1).unwrap()).collect::<Vec<_>>();
        assert_eq!(blocks, vec![1, 2, 3, 4, 5, 6]);
        a.free(2, 1).unwrap();
        a.free(4, 1).unwrap();
        a.free(3, 1).unwrap();
        assert_eq!(a.free_len(), 3);
        // first fit takes the coalesced range
        assert_eq!(a.allocate(3).unwrap(), 2);
        assert_eq!(a.free_len(), 0);
        // freeing the tail returns to the horizon
        a.free(6, 1).unwrap();
        a.free(5, 1).unwrap();
        assert_eq!(a.next_block, 5);
        assert_eq!(a.free_len(), 0);
    }

    #[test]
    fn double_free_is_rejected() {
        let mut a = Allocator::new(100);
        let b = a.allocate(2).unwrap();
        a.allocate(1).unwrap();
        a.free(b, 1).unwrap();
        assert!(matches!(a.free(b, 1), Err(Error::Validation(_))));
        assert!(matches!(a.free(META_BLOCK, 1), Err(Error::Validation(_))));
        assert!(matches!(a.free(50, 1), Err(Error::Validation(_))));
    }

    #[test]
    fn allocation_failure() {
        let mut a = Allocator::new(4);
        assert_eq!(a.allocate(2).unwrap(), 1);
        assert!(matches!(
            a.allocate(2),
            Err(Error::AllocationFailure {
                requested: 2,
                available: 1
            })
        ));
        assert_eq!(a.allocate(1).unwrap(), 3);
    }
}
