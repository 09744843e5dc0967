use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering};

use crossbeam_utils::Backoff;
use spin::Mutex;

use crate::block::Block;
use crate::mem::{Access, Backing, MappedRegion};
use crate::reference::{BlockId, INVALID_BLOCK, RegionRef};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error<E> {
    /// The configured off-heap ceiling would be exceeded. Recoverable: the
    /// caller may evict and retry.
    OutOfMemory {
        requested: u32,
        mapped: usize,
        ceiling: usize,
    },
    /// A single request that no block can carve. Blocks are the unit of
    /// reclamation, so oversized regions are refused rather than mapped
    /// out-of-band.
    RegionTooLarge { requested: u32, block_size: u32 },
    /// The owning manager has been closed.
    Closed,
    /// The backing failed to map a new block.
    Backing(E),
}

impl<E: core::fmt::Debug> core::fmt::Display for Error<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::OutOfMemory {
                requested,
                mapped,
                ceiling,
            } => write!(
                f,
                "allocation of {} bytes exceeds ceiling: {} of {} bytes mapped",
                requested, mapped, ceiling
            ),
            Self::RegionTooLarge {
                requested,
                block_size,
            } => write!(
                f,
                "region of {} bytes cannot fit a block of {} bytes",
                requested, block_size
            ),
            Self::Closed => write!(f, "memory manager is closed"),
            Self::Backing(err) => write!(f, "backing error: {:?}", err),
        }
    }
}

impl<E: core::fmt::Debug> core::error::Error for Error<E> {}

#[derive(Debug, Clone, Copy)]
pub struct Config {
    block_size: u32,
    ceiling: usize,
}

impl Config {
    pub const DEFAULT_BLOCK_SIZE: u32 = 1 << 22;
    pub const DEFAULT_CEILING: usize = 1 << 30;

    pub const fn new() -> Self {
        Self {
            block_size: Self::DEFAULT_BLOCK_SIZE,
            ceiling: Self::DEFAULT_CEILING,
        }
    }

    pub const fn with_block_size(self, block_size: u32) -> Self {
        Self { block_size, ..self }
    }

    pub const fn with_ceiling(self, ceiling: usize) -> Self {
        Self { ceiling, ..self }
    }

    pub const fn block_size(&self) -> u32 {
        self.block_size
    }

    pub const fn ceiling(&self) -> usize {
        self.ceiling
    }

    const fn max_blocks(&self) -> usize {
        let n = self.ceiling / self.block_size as usize;
        if n == 0 { 1 } else { n }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

/// Witness that no live reference can still resolve into the block being
/// reclaimed.
///
/// The allocator keeps no reference counts or epochs of its own; the
/// surrounding map's epoch/generation mechanism is the only party that can
/// establish quiescence, and minting this proof is the single place where
/// that obligation is taken on.
pub struct ReclaimProof(());

impl ReclaimProof {
    /// ## Safety
    /// The caller must have proven, through its own reclamation mechanism,
    /// that no reader or writer holds an unguarded view into the block this
    /// proof will be spent on, and that no `allocate` call that could still
    /// carve from the block is in flight. Reclaiming a block that still has
    /// live readers or allocators corrupts them.
    #[inline]
    pub const unsafe fn assert_quiescent() -> Self {
        Self(())
    }
}

struct Pool {
    regions: Vec<MappedRegion>,
    ids: Vec<BlockId>,
}

/// Owns the set of [`Block`]s and hands out sub-ranges of them.
///
/// Allocation is a bump-pointer CAS on the active block; when that block is
/// exhausted a short exclusive section installs a new one, reusing a
/// reclaimed mapping when the pool has one. Resolving a block id is a single
/// atomic load on a fixed slot table and never allocates or locks.
pub struct BlockAllocator<B: Backing> {
    backing: B,
    block_size: u32,
    ceiling: usize,
    slots: Box<[AtomicPtr<Block>]>,
    /// Id of the block currently taking bump allocations.
    active: AtomicU32,
    next_id: AtomicU32,
    mapped: AtomicUsize,
    reclaimed: AtomicUsize,
    pool: Mutex<Pool>,
    grow: Mutex<()>,
}

unsafe impl<B: Backing + Send> Send for BlockAllocator<B> {}
unsafe impl<B: Backing + Sync> Sync for BlockAllocator<B> {}

impl<B: Backing> core::fmt::Debug for BlockAllocator<B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BlockAllocator")
            .field("block_size", &self.block_size)
            .field("ceiling", &self.ceiling)
            .field("mapped", &self.mapped_bytes())
            .field("live_blocks", &self.live_blocks())
            .finish()
    }
}

impl<B: Backing> BlockAllocator<B> {
    pub fn new(backing: B, conf: Config) -> Self {
        let slots = (0..conf.max_blocks())
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect();
        Self {
            backing,
            block_size: conf.block_size,
            ceiling: conf.ceiling,
            slots,
            active: AtomicU32::new(INVALID_BLOCK),
            next_id: AtomicU32::new(0),
            mapped: AtomicUsize::new(0),
            reclaimed: AtomicUsize::new(0),
            pool: Mutex::new(Pool {
                regions: Vec::new(),
                ids: Vec::new(),
            }),
            grow: Mutex::new(()),
        }
    }

    #[inline]
    pub const fn block_size(&self) -> u32 {
        self.block_size
    }

    #[inline]
    pub const fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Total bytes currently mapped, pooled regions included.
    #[inline]
    pub fn mapped_bytes(&self) -> usize {
        self.mapped.load(Ordering::Acquire)
    }

    /// Number of blocks reclaimed over the allocator's lifetime.
    #[inline]
    pub fn reclaimed_blocks(&self) -> usize {
        self.reclaimed.load(Ordering::Acquire)
    }

    pub fn live_blocks(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| !slot.load(Ordering::Acquire).is_null())
            .count()
    }

    /// Carves a fresh, non-overlapping region of `len` bytes.
    pub fn allocate(&self, len: u32) -> Result<RegionRef, Error<B::Error>> {
        if len > self.block_size {
            return Err(Error::RegionTooLarge {
                requested: len,
                block_size: self.block_size,
            });
        }

        let backoff = Backoff::new();
        loop {
            let active = self.active.load(Ordering::Acquire);
            if active != INVALID_BLOCK {
                let block = self.block(active);
                if let Some(position) = block.try_bump(len) {
                    #[cfg(feature = "tracing")]
                    tracing::trace!("allocate {} bytes at {}:{}", len, active, position);
                    return Ok(RegionRef::new(active, position, len));
                }
            }
            self.grow(active, len)?;
            backoff.spin();
        }
    }

    /// Resolves a block id to its live block.
    ///
    /// Presenting a reclaimed or never-assigned id is a caller contract
    /// violation; it fails loudly rather than returning stale memory. The
    /// returned borrow is only sound while the external liveness mechanism
    /// keeps the block from being reclaimed.
    #[inline]
    pub fn block(&self, id: BlockId) -> &Block {
        assert!(id != INVALID_BLOCK, "resolve of null block id");
        let ptr = self.slots[id as usize].load(Ordering::Acquire);
        let Some(ptr) = NonNull::new(ptr) else {
            panic!("block {} is not live", id);
        };
        unsafe { ptr.as_ref() }
    }

    /// Returns the backing memory of a live block.
    #[inline]
    pub fn block_memory(&self, id: BlockId) -> &MappedRegion {
        self.block(id).region()
    }

    /// Returns a block to the pool for reuse.
    ///
    /// The proof is the caller's assertion that no live reference can still
    /// resolve into this block; see [`ReclaimProof::assert_quiescent`]. The
    /// active block is never reclaimable: an allocator on the fast path may
    /// be about to bump into it, so presenting its id fails loudly. The
    /// mapping is recycled, and the id becomes assignable to a future block.
    pub fn reclaim(&self, id: BlockId, _proof: ReclaimProof) {
        assert!(id != INVALID_BLOCK, "reclaim of null block id");
        assert!(
            self.active.load(Ordering::Acquire) != id,
            "block {} is the active allocation target",
            id
        );
        let ptr = self.slots[id as usize].swap(ptr::null_mut(), Ordering::AcqRel);
        let Some(ptr) = NonNull::new(ptr) else {
            panic!("block {} reclaimed twice", id);
        };

        let block = unsafe { Box::from_raw(ptr.as_ptr()) };
        self.reclaimed.fetch_add(1, Ordering::Release);

        #[cfg(feature = "tracing")]
        tracing::debug!("reclaim block {} ({} bytes used)", id, block.used());

        let mut pool = self.pool.lock();
        pool.regions.push(block.into_region());
        pool.ids.push(id);
    }

    /// Installs a new active block. `seen` is the active id observed by the
    /// caller; if another thread grew in the meantime, nothing is done.
    /// `requested` only feeds the out-of-memory diagnostic.
    fn grow(&self, seen: BlockId, requested: u32) -> Result<(), Error<B::Error>> {
        let _guard = self.grow.lock();
        if self.active.load(Ordering::Acquire) != seen {
            return Ok(());
        }

        let (id, region) = {
            let mut pool = self.pool.lock();
            match (pool.ids.pop(), pool.regions.pop()) {
                (Some(id), Some(region)) => (id, region),
                _ => {
                    drop(pool);
                    let id = self.next_id.load(Ordering::Relaxed);
                    if id as usize >= self.slots.len() {
                        return Err(self.out_of_memory(requested));
                    }
                    let mapped = self.mapped.load(Ordering::Acquire);
                    if mapped + self.block_size as usize > self.ceiling {
                        return Err(self.out_of_memory(requested));
                    }
                    let region = self
                        .backing
                        .map(self.block_size as usize, Access::READ | Access::WRITE)
                        .map_err(Error::Backing)?;
                    self.mapped
                        .fetch_add(self.block_size as usize, Ordering::Release);
                    self.next_id.store(id + 1, Ordering::Relaxed);
                    (id, region)
                }
            }
        };

        let block = Box::into_raw(Box::new(Block::new(id, region)));
        self.slots[id as usize].store(block, Ordering::Release);
        self.active.store(id, Ordering::Release);

        #[cfg(feature = "tracing")]
        tracing::debug!("install block {} ({} bytes)", id, self.block_size);

        Ok(())
    }

    fn out_of_memory(&self, requested: u32) -> Error<B::Error> {
        Error::OutOfMemory {
            requested,
            mapped: self.mapped_bytes(),
            ceiling: self.ceiling,
        }
    }
}

impl<B: Backing> Drop for BlockAllocator<B> {
    fn drop(&mut self) {
        for slot in self.slots.iter() {
            let ptr = slot.swap(ptr::null_mut(), Ordering::AcqRel);
            if let Some(ptr) = NonNull::new(ptr) {
                let block = unsafe { Box::from_raw(ptr.as_ptr()) };
                let mut region = block.into_region();
                let _ = unsafe { self.backing.unmap(&mut region) };
            }
        }
        let pool = self.pool.get_mut();
        for region in pool.regions.iter_mut() {
            let _ = unsafe { self.backing.unmap(region) };
        }
        pool.regions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::{BlockAllocator, Config, Error, ReclaimProof};
    use crate::mem::HeapBacking;
    use crate::reference::INVALID_BLOCK;

    const BLOCK: u32 = 4096;

    fn small_alloc(blocks: usize) -> BlockAllocator<HeapBacking> {
        let conf = Config::new()
            .with_block_size(BLOCK)
            .with_ceiling(BLOCK as usize * blocks);
        BlockAllocator::new(HeapBacking, conf)
    }

    #[test]
    fn first_allocation_grows() {
        let a = small_alloc(2);
        assert_eq!(a.live_blocks(), 0);

        let r = a.allocate(128).expect("should allocate");
        assert_eq!(r.block(), 0);
        assert_eq!(r.position(), 0);
        assert_eq!(r.length(), 128);
        assert_eq!(a.live_blocks(), 1);
        assert_eq!(a.mapped_bytes(), BLOCK as usize);
    }

    #[test]
    fn exhaustion_installs_new_block() {
        let a = small_alloc(2);
        let first = a.allocate(BLOCK - 8).expect("should allocate");
        let second = a.allocate(BLOCK - 8).expect("should allocate");

        assert_ne!(first.block(), second.block());
        assert_eq!(a.live_blocks(), 2);
        assert_eq!(a.mapped_bytes(), BLOCK as usize * 2);
    }

    #[test]
    fn ceiling_enforced() {
        let a = small_alloc(2);
        let _ = a.allocate(BLOCK).expect("should allocate");
        let _ = a.allocate(BLOCK).expect("should allocate");

        match a.allocate(100) {
            Err(Error::OutOfMemory {
                requested,
                mapped,
                ceiling,
            }) => {
                assert_eq!(requested, 100);
                assert_eq!(mapped, ceiling);
            }
            other => panic!("expected OutOfMemory, got {:?}", other),
        }
    }

    #[test]
    fn oversized_request_refused() {
        let a = small_alloc(2);
        let err = a.allocate(BLOCK + 1).unwrap_err();
        assert_eq!(
            err,
            Error::RegionTooLarge {
                requested: BLOCK + 1,
                block_size: BLOCK,
            }
        );
    }

    #[test]
    fn reclaim_recycles_mapping() {
        let a = small_alloc(2);
        let first = a.allocate(BLOCK).expect("should allocate");
        let _second = a.allocate(BLOCK).expect("should allocate");
        assert_eq!(a.mapped_bytes(), BLOCK as usize * 2);

        let proof = unsafe { ReclaimProof::assert_quiescent() };
        a.reclaim(first.block(), proof);
        assert_eq!(a.reclaimed_blocks(), 1);
        assert_eq!(a.live_blocks(), 1);

        // the third block reuses the pooled mapping and the freed id
        let third = a.allocate(BLOCK).expect("should allocate");
        assert_eq!(third.block(), first.block());
        assert_eq!(a.mapped_bytes(), BLOCK as usize * 2);
    }

    #[test]
    #[should_panic(expected = "is not live")]
    fn stale_block_id_fails_loudly() {
        let a = small_alloc(2);
        let first = a.allocate(BLOCK).expect("should allocate");
        let _second = a.allocate(BLOCK).expect("should allocate");
        let proof = unsafe { ReclaimProof::assert_quiescent() };
        a.reclaim(first.block(), proof);
        let _ = a.block(first.block());
    }

    #[test]
    #[should_panic(expected = "active allocation target")]
    fn reclaim_of_active_block_refused() {
        let a = small_alloc(2);
        let r = a.allocate(64).expect("should allocate");
        let proof = unsafe { ReclaimProof::assert_quiescent() };
        a.reclaim(r.block(), proof);
    }

    #[test]
    #[should_panic(expected = "null block id")]
    fn null_block_id_asserted() {
        let a = small_alloc(1);
        let _ = a.block(INVALID_BLOCK);
    }
}
