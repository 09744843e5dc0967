use core::sync::atomic::{AtomicU32, Ordering};

use crossbeam_utils::CachePadded;

use crate::mem::MappedRegion;
use crate::reference::BlockId;

/// Carved positions start on this boundary so multi-word accessors land on
/// friendly offsets. Reads themselves are unaligned-safe.
const BUMP_ALIGN: usize = 8;

/// A single large contiguous off-heap region: the unit of coarse-grained
/// allocation and the unit of reclamation.
///
/// Sub-regions are carved with a bump pointer; there is no intra-block
/// compaction. Once the block is exhausted the allocator installs a new one.
pub struct Block {
    id: BlockId,
    region: MappedRegion,
    capacity: u32,
    used: CachePadded<AtomicU32>,
}

unsafe impl Send for Block {}
unsafe impl Sync for Block {}

impl core::fmt::Debug for Block {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Block")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .field("used", &self.used())
            .finish()
    }
}

impl Block {
    pub(crate) fn new(id: BlockId, region: MappedRegion) -> Self {
        let capacity = u32::try_from(region.size()).expect("block size fits in u32");
        Self {
            id,
            region,
            capacity,
            used: CachePadded::new(AtomicU32::new(0)),
        }
    }

    #[inline]
    pub const fn id(&self) -> BlockId {
        self.id
    }

    #[inline]
    pub const fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Bytes handed out so far, alignment padding included.
    #[inline]
    pub fn used(&self) -> u32 {
        self.used.load(Ordering::Acquire)
    }

    #[inline]
    pub fn remaining(&self) -> u32 {
        self.capacity.saturating_sub(self.used())
    }

    #[inline]
    pub(crate) const fn region(&self) -> &MappedRegion {
        &self.region
    }

    pub(crate) fn into_region(self) -> MappedRegion {
        self.region
    }

    /// Carves `len` bytes off the bump pointer, returning the aligned start
    /// position, or `None` once the block cannot fit the request.
    pub(crate) fn try_bump(&self, len: u32) -> Option<u32> {
        let mut used = self.used.load(Ordering::Acquire);
        loop {
            let start = memory_addr::align_up(used as usize, BUMP_ALIGN) as u32;
            let end = start.checked_add(len)?;
            if end > self.capacity {
                return None;
            }
            match self
                .used
                .compare_exchange_weak(used, end, Ordering::SeqCst, Ordering::Acquire)
            {
                Ok(_) => return Some(start),
                Err(changed) => used = changed,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Block;
    use crate::mem::{Access, Backing, HeapBacking};

    fn heap_block(id: u32, size: usize) -> Block {
        let region = HeapBacking
            .map(size, Access::READ | Access::WRITE)
            .expect("should map");
        Block::new(id, region)
    }

    #[test]
    fn bump_positions_aligned() {
        const SIZE: usize = 4096;

        let block = heap_block(0, SIZE);
        let a = block.try_bump(3).expect("should fit");
        let b = block.try_bump(5).expect("should fit");
        let c = block.try_bump(8).expect("should fit");

        assert_eq!(a, 0);
        assert_eq!(b, 8);
        assert_eq!(c, 16);
        assert!(block.used() >= 24);
    }

    #[test]
    fn bump_exhaustion() {
        const SIZE: usize = 64;

        let block = heap_block(1, SIZE);
        assert!(block.try_bump(48).is_some());
        assert!(block.try_bump(32).is_none());
        // smaller request still fits the tail
        assert_eq!(block.try_bump(8), Some(48));
        assert_eq!(block.remaining(), 8);
    }

    #[test]
    fn zero_len_bump() {
        const SIZE: usize = 64;

        let block = heap_block(2, SIZE);
        assert_eq!(block.try_bump(0), Some(0));
        assert_eq!(block.used(), 0);
    }
}
