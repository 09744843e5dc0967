pub type BlockId = u32;

/// Sentinel id for an unbound reference. Never dereferenceable.
pub const INVALID_BLOCK: BlockId = BlockId::MAX;

/// Compact reference to an allocated region: block id, offset within the
/// block, and total length.
///
/// `length` includes the fixed header stamped by the
/// [`MemoryManager`](crate::manager::MemoryManager); the user-visible
/// capacity of a bound view is `length - header_size`.
///
/// A reference is a logical address, not a pointer: it is meaningless
/// without the manager that issued it, and block ids are not stable across
/// process restarts.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionRef {
    block: BlockId,
    position: u32,
    length: u32,
}

impl core::fmt::Debug for RegionRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_null() {
            return f.write_str("RegionRef::NULL");
        }
        f.debug_struct("RegionRef")
            .field("block", &self.block)
            .field("position", &self.position)
            .field("length", &self.length)
            .finish()
    }
}

impl RegionRef {
    /// The unbound sentinel.
    pub const NULL: Self = Self {
        block: INVALID_BLOCK,
        position: 0,
        length: 0,
    };

    #[inline]
    pub const fn new(block: BlockId, position: u32, length: u32) -> Self {
        Self {
            block,
            position,
            length,
        }
    }

    #[inline]
    pub const fn is_null(&self) -> bool {
        self.block == INVALID_BLOCK
    }

    #[inline]
    pub const fn block(&self) -> BlockId {
        self.block
    }

    /// Offset of the region (header included) within its block.
    #[inline]
    pub const fn position(&self) -> u32 {
        self.position
    }

    /// Total length, header included.
    #[inline]
    pub const fn length(&self) -> u32 {
        self.length
    }

    /// Packs the triple into one word, for index structures that store
    /// references in a single atomic cell.
    #[inline]
    pub const fn pack(self) -> u128 {
        ((self.block as u128) << 64) | ((self.position as u128) << 32) | self.length as u128
    }

    #[inline]
    pub const fn unpack(word: u128) -> Self {
        Self {
            block: (word >> 64) as u32,
            position: (word >> 32) as u32,
            length: word as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{INVALID_BLOCK, RegionRef};

    #[test]
    fn pack_roundtrip() {
        const REFS: [(u32, u32, u32); 4] = [
            (0, 0, 0),
            (3, 4096, 128),
            (u32::MAX - 1, u32::MAX, u32::MAX),
            (7, 0, 1),
        ];

        for (block, position, length) in REFS {
            let r = RegionRef::new(block, position, length);
            assert_eq!(RegionRef::unpack(r.pack()), r);
        }
    }

    #[test]
    fn null_sentinel() {
        assert!(RegionRef::NULL.is_null());
        assert_eq!(RegionRef::NULL.block(), INVALID_BLOCK);
        assert!(!RegionRef::new(0, 0, 8).is_null());
        assert_eq!(RegionRef::unpack(RegionRef::NULL.pack()), RegionRef::NULL);
    }
}
