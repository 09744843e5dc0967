//! Off-heap block memory for concurrent sorted maps.
//!
//! The crate turns raw mapped memory into addressable, typed regions that the
//! surrounding index structure can read without locks or per-access
//! allocation:
//!
//! - [`BlockAllocator`] owns a set of [`Block`]s and carves
//!   `(block, position, length)` regions out of them with a bump pointer.
//! - [`MemoryManager`] is the façade the map calls into. It stamps a fixed
//!   header onto every allocation and resolves a [`RegionRef`] into a
//!   zero-copy view.
//! - [`ReadView`]/[`WriteView`] are bound, stack-only views with typed
//!   accessors; [`DetachedBuffer`] is the rebindable slot a scan reuses
//!   across many regions.
//!
//! The crate is **not** a synchronization point for reference visibility.
//! A writer that allocates and fills a region must publish its [`RegionRef`]
//! through the index structure with a release-style store, and readers must
//! load it with a matching acquire, before resolving it here. Reclamation is
//! equally cooperative: [`BlockAllocator::reclaim`] consumes a
//! [`ReclaimProof`] that only the surrounding epoch/generation mechanism may
//! mint.
//!
//! [`Block`]: block::Block

pub mod alloc;
pub mod block;
pub mod manager;
pub mod mem;
pub mod os;
pub mod reference;
pub mod view;


pub use alloc::{BlockAllocator, Config, Error, ReclaimProof};
pub use manager::{ManagerConfig, MemoryManager};
pub use mem::{Access, Backing, HeapBacking, MappedRegion};
pub use reference::{BlockId, RegionRef};
pub use view::{ByteOrder, DetachedBuffer, DirectAccess, ReadView, WriteView};

#[cfg(all(unix, feature = "unix"))]
pub use os::unix::MmapBacking;
