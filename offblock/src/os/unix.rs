use core::ffi::c_void;
use core::num::NonZeroUsize;
use core::ptr::NonNull;

pub use nix::sys::mman::{MapFlags, ProtFlags};

use crate::mem::{Access, Backing, MappedRegion};

impl From<Access> for ProtFlags {
    fn from(value: Access) -> Self {
        let mut flags = ProtFlags::empty();
        if value.contains(Access::READ) {
            flags |= ProtFlags::PROT_READ;
        }
        if value.contains(Access::WRITE) {
            flags |= ProtFlags::PROT_WRITE;
        }
        flags
    }
}

/// Anonymous private mappings via `mmap(2)`.
///
/// Pages are reserved lazily by the kernel, so installing a fresh block does
/// not touch the whole range up front.
#[derive(Debug, Clone, Copy, Default)]
pub struct MmapBacking;

impl Backing for MmapBacking {
    type Error = nix::Error;

    fn map(&self, size: usize, access: Access) -> Result<MappedRegion, Self::Error> {
        use nix::sys::mman;

        let size = NonZeroUsize::new(size).ok_or(nix::Error::EINVAL)?;
        let pflags = access.into();
        let mflags = MapFlags::MAP_PRIVATE;

        unsafe {
            let ptr = mman::mmap_anonymous(None, size, pflags, mflags)?;
            Ok(MappedRegion::from_raw(ptr.cast(), size.get()))
        }
    }

    unsafe fn unmap(&self, region: &mut MappedRegion) -> Result<(), Self::Error> {
        let start: NonNull<c_void> = unsafe { NonNull::new_unchecked(region.start_mut_ptr()) }.cast();
        unsafe { nix::sys::mman::munmap(start, region.size()) }
    }
}
