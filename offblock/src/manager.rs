use core::sync::atomic::{AtomicBool, Ordering};

use crate::alloc::{BlockAllocator, Config, Error, ReclaimProof};
use crate::mem::Backing;
use crate::reference::{BlockId, RegionRef};
use crate::view::{ByteOrder, ReadView, WriteView};

#[derive(Debug, Clone, Copy)]
pub struct ManagerConfig {
    header_size: u32,
    order: ByteOrder,
    alloc: Config,
}

impl ManagerConfig {
    pub const fn new() -> Self {
        Self {
            header_size: 0,
            order: ByteOrder::native(),
            alloc: Config::new(),
        }
    }

    pub const fn with_header_size(self, header_size: u32) -> Self {
        Self {
            header_size,
            ..self
        }
    }

    pub const fn with_order(self, order: ByteOrder) -> Self {
        Self { order, ..self }
    }

    pub const fn with_block_size(self, block_size: u32) -> Self {
        Self {
            alloc: self.alloc.with_block_size(block_size),
            ..self
        }
    }

    pub const fn with_ceiling(self, ceiling: usize) -> Self {
        Self {
            alloc: self.alloc.with_ceiling(ceiling),
            ..self
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// The façade the map calls into: allocation, reference resolution, and the
/// open/closed lifecycle.
///
/// Every allocated region starts with a fixed-size header of
/// `header_size` bytes; views index user data from the first byte after it.
/// `close` is one-way and idempotent; any access afterwards fails with
/// [`Error::Closed`] — one atomic branch per call, never silent stale data.
///
/// The manager orders nothing between writers and readers. Publishing a
/// [`RegionRef`] to other threads is the index structure's job and must use
/// release/acquire (or stronger) semantics there.
pub struct MemoryManager<B: Backing> {
    allocator: BlockAllocator<B>,
    header_size: u32,
    order: ByteOrder,
    closed: AtomicBool,
}

impl<B: Backing> core::fmt::Debug for MemoryManager<B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("header_size", &self.header_size)
            .field("order", &self.order)
            .field("closed", &self.is_closed())
            .field("allocator", &self.allocator)
            .finish()
    }
}

#[cfg(all(unix, feature = "unix"))]
impl MemoryManager<crate::os::unix::MmapBacking> {
    /// Manager over anonymous `mmap` blocks.
    pub fn new(conf: ManagerConfig) -> Self {
        Self::with_backing(crate::os::unix::MmapBacking, conf)
    }
}

impl MemoryManager<crate::mem::HeapBacking> {
    /// Manager over global-allocator blocks; portable, used by tests.
    pub fn on_heap(conf: ManagerConfig) -> Self {
        Self::with_backing(crate::mem::HeapBacking, conf)
    }
}

impl<B: Backing> MemoryManager<B> {
    pub fn with_backing(backing: B, conf: ManagerConfig) -> Self {
        Self {
            allocator: BlockAllocator::new(backing, conf.alloc),
            header_size: conf.header_size,
            order: conf.order,
            closed: AtomicBool::new(false),
        }
    }

    #[inline]
    pub const fn header_size(&self) -> u32 {
        self.header_size
    }

    #[inline]
    pub const fn order(&self) -> ByteOrder {
        self.order
    }

    #[inline]
    pub const fn allocator(&self) -> &BlockAllocator<B> {
        &self.allocator
    }

    #[inline]
    fn ensure_open(&self) -> Result<(), Error<B::Error>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Allocates a region with `size` bytes of user data plus the header.
    ///
    /// The returned reference is private to the calling writer until it is
    /// published through the index structure.
    pub fn allocate(&self, size: u32) -> Result<RegionRef, Error<B::Error>> {
        self.ensure_open()?;
        let length = size
            .checked_add(self.header_size)
            .ok_or(Error::RegionTooLarge {
                requested: size,
                block_size: self.allocator.block_size(),
            })?;
        self.allocator.allocate(length)
    }

    /// Resolves a reference into a read view. Allocation-free.
    pub fn resolve(&self, r: RegionRef) -> Result<ReadView<'_>, Error<B::Error>> {
        self.ensure_open()?;
        let block = self.allocator.block(r.block());
        Ok(ReadView::bind(block, r, self.header_size, self.order))
    }

    /// Resolves a reference into a write view.
    ///
    /// Only the writer that allocated the region may use this, and only
    /// before publishing the reference; the crate provides no
    /// mutation-after-publish primitive.
    pub fn resolve_mut(&self, r: RegionRef) -> Result<WriteView<'_>, Error<B::Error>> {
        self.ensure_open()?;
        let block = self.allocator.block(r.block());
        Ok(WriteView::bind(block, r, self.header_size, self.order))
    }

    /// Delegates to [`BlockAllocator::reclaim`].
    pub fn reclaim(&self, id: BlockId, proof: ReclaimProof) {
        self.allocator.reclaim(id, proof);
    }

    /// Transitions to the closed state. One-way, idempotent. Block memory is
    /// unmapped when the manager is dropped, so views taken before the close
    /// stay readable until then.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            #[cfg(feature = "tracing")]
            tracing::debug!(
                "memory manager closed ({} bytes mapped)",
                self.allocator.mapped_bytes()
            );
        }
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::{ManagerConfig, MemoryManager};
    use crate::alloc::Error;

    const CONF: ManagerConfig = ManagerConfig::new()
        .with_header_size(8)
        .with_block_size(4096)
        .with_ceiling(4096 * 4);

    #[test]
    fn header_stamped_into_length() {
        let m = MemoryManager::on_heap(CONF);
        let r = m.allocate(16).expect("should allocate");
        assert_eq!(r.length(), 24);

        let view = m.resolve(r).expect("should resolve");
        assert_eq!(view.capacity(), 16);
    }

    #[test]
    fn close_fails_loudly() {
        let m = MemoryManager::on_heap(CONF);
        let r = m.allocate(16).expect("should allocate");

        m.close();
        m.close(); // idempotent
        assert!(m.is_closed());

        assert_eq!(m.allocate(16).unwrap_err(), Error::Closed);
        assert!(matches!(m.resolve(r), Err(Error::Closed)));
        assert!(matches!(m.resolve_mut(r), Err(Error::Closed)));
    }

    #[test]
    fn zero_header_manager() {
        let m = MemoryManager::on_heap(ManagerConfig::new().with_block_size(4096));
        let r = m.allocate(32).expect("should allocate");
        assert_eq!(r.length(), 32);
        let view = m.resolve(r).expect("should resolve");
        assert_eq!(view.capacity(), 32);
    }
}
