use core::alloc::Layout;
use core::ptr::NonNull;

bitflags::bitflags! {
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Access: u8 {
        const READ  = 0x1;
        const WRITE = 0x1 << 1;
    }
}

impl core::fmt::Display for Access {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Debug::fmt(&self, f)
    }
}

/// A contiguous region of mapped memory, outside the managed heap as far as
/// the rest of the crate is concerned.
///
/// The handle does not unmap on drop; the [`Backing`] that produced it is
/// responsible for returning it via [`Backing::unmap`].
pub struct MappedRegion {
    start: NonNull<u8>,
    size: usize,
}

unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl core::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("start", &self.start)
            .field("size", &self.size)
            .finish()
    }
}

impl MappedRegion {
    /// Wraps a raw mapping.
    ///
    /// ## Safety
    /// `start..start + size` must be a valid, readable and writable mapping
    /// that stays alive until the owning backing unmaps it.
    #[inline]
    pub const unsafe fn from_raw(start: NonNull<u8>, size: usize) -> Self {
        Self { start, size }
    }

    #[inline]
    pub const fn start_ptr(&self) -> *const u8 {
        self.start.as_ptr()
    }

    /// ## Safety
    /// Writes through the returned pointer must stay inside the region and
    /// must not race with readers of the same bytes.
    #[inline]
    pub const unsafe fn start_mut_ptr(&self) -> *mut u8 {
        self.start.as_ptr()
    }

    #[inline]
    pub const fn end_ptr(&self) -> *const u8 {
        unsafe { self.start.as_ptr().add(self.size) }
    }

    /// Returns the byte size of the region.
    #[inline]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Returns a pointer to the memory at the given offset.
    #[inline]
    pub fn get_ptr(&self, offset: usize) -> *const u8 {
        debug_assert!(offset <= self.size);
        unsafe { self.start.as_ptr().add(offset) }
    }

    /// Returns a mutable pointer to the memory at the given offset.
    #[inline]
    pub fn get_mut_ptr(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset <= self.size);
        unsafe { self.start.as_ptr().add(offset) }
    }
}

/// Source of block-sized mappings.
///
/// The allocator is generic over this seam so blocks can come from anonymous
/// `mmap` regions in production and from the global allocator in portable
/// tests.
pub trait Backing {
    type Error: core::fmt::Debug;

    /// Maps a fresh region of `size` bytes with the given access.
    fn map(&self, size: usize, access: Access) -> Result<MappedRegion, Self::Error>;

    /// Returns a region to the system.
    ///
    /// ## Safety
    /// `region` must originate from `self.map` and no pointer into it may be
    /// dereferenced afterwards.
    unsafe fn unmap(&self, region: &mut MappedRegion) -> Result<(), Self::Error>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeapError {
    ZeroSize,
    /// The requested size cannot form a valid page-aligned layout.
    BadLayout { size: usize },
    Exhausted { requested: usize },
}

impl core::fmt::Display for HeapError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::ZeroSize => write!(f, "zero-sized mapping requested"),
            Self::BadLayout { size } => {
                write!(
                    f,
                    "no valid {}-aligned layout for {} bytes",
                    HeapBacking::ALIGN,
                    size
                )
            }
            Self::Exhausted { requested } => {
                write!(f, "global allocator failed to provide {} bytes", requested)
            }
        }
    }
}

impl core::error::Error for HeapError {}

/// Blocks carved from the global allocator.
///
/// Useful on targets without the `unix` feature and in tests; production
/// deployments use the `mmap` backing in [`crate::os`].
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapBacking;

impl HeapBacking {
    const ALIGN: usize = 4096;

    fn layout(size: usize) -> Result<Layout, HeapError> {
        Layout::from_size_align(size, Self::ALIGN).map_err(|_| HeapError::BadLayout { size })
    }
}

impl Backing for HeapBacking {
    type Error = HeapError;

    fn map(&self, size: usize, _access: Access) -> Result<MappedRegion, Self::Error> {
        if size == 0 {
            return Err(HeapError::ZeroSize);
        }
        let layout = Self::layout(size)?;
        // zeroed to match the kernel's behaviour for anonymous mappings
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        let start = NonNull::new(ptr).ok_or(HeapError::Exhausted { requested: size })?;
        Ok(unsafe { MappedRegion::from_raw(start, size) })
    }

    unsafe fn unmap(&self, region: &mut MappedRegion) -> Result<(), Self::Error> {
        let layout = Self::layout(region.size())?;
        unsafe { std::alloc::dealloc(region.start_mut_ptr(), layout) };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Access, Backing, HeapBacking, HeapError};

    #[test]
    fn heap_map_rw() {
        const SIZE: usize = 4096;
        const VALUE: &[u8] = b"hello";

        let bk = HeapBacking;
        let mut region = bk
            .map(SIZE, Access::READ | Access::WRITE)
            .expect("should map");
        assert_eq!(region.size(), SIZE);

        unsafe {
            core::ptr::copy_nonoverlapping(VALUE.as_ptr(), region.start_mut_ptr(), VALUE.len());
            let read = core::slice::from_raw_parts(region.start_ptr(), VALUE.len());
            assert_eq!(read, VALUE);
        }

        unsafe { bk.unmap(&mut region) }.expect("should unmap");
    }

    #[test]
    fn heap_map_zeroed() {
        const SIZE: usize = 1024;

        let bk = HeapBacking;
        let mut region = bk
            .map(SIZE, Access::READ | Access::WRITE)
            .expect("should map");

        let bytes = unsafe { core::slice::from_raw_parts(region.start_ptr(), SIZE) };
        assert!(bytes.iter().all(|b| *b == 0));

        unsafe { bk.unmap(&mut region) }.expect("should unmap");
    }

    #[test]
    fn zero_size() {
        let bk = HeapBacking;
        let res = bk.map(0, Access::READ | Access::WRITE);
        assert_eq!(res.unwrap_err(), HeapError::ZeroSize);
    }

    #[test]
    fn oversized_layout_rejected() {
        let bk = HeapBacking;
        let res = bk.map(usize::MAX, Access::READ | Access::WRITE);
        assert_eq!(res.unwrap_err(), HeapError::BadLayout { size: usize::MAX });
    }
}
