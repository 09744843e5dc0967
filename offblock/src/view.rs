use core::marker::PhantomData;
use core::ptr::{self, NonNull};

use crate::alloc::Error;
use crate::block::Block;
use crate::manager::MemoryManager;
use crate::mem::Backing;
use crate::reference::RegionRef;

/// Byte order of a region. A property of the manager that wrote it, not a
/// crate-wide constant; every view reports the order its reads honor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    LittleEndian,
    BigEndian,
}

impl ByteOrder {
    pub const fn native() -> Self {
        if cfg!(target_endian = "big") {
            Self::BigEndian
        } else {
            Self::LittleEndian
        }
    }
}

macro_rules! typed_reads {
    ($($ty:ty),* $(,)?) => {
        paste::paste! {
            $(
                #[doc = concat!("Reads a `", stringify!($ty), "` at `i` bytes past the header.")]
                #[inline]
                pub fn [<get_ $ty>](&self, i: u32) -> $ty {
                    const N: usize = core::mem::size_of::<$ty>();
                    let bytes: [u8; N] = self.read_at(i);
                    match self.order {
                        ByteOrder::LittleEndian => <$ty>::from_le_bytes(bytes),
                        ByteOrder::BigEndian => <$ty>::from_be_bytes(bytes),
                    }
                }
            )*
        }
    };
}

macro_rules! typed_writes {
    ($($ty:ty),* $(,)?) => {
        paste::paste! {
            $(
                #[doc = concat!("Writes a `", stringify!($ty), "` at `i` bytes past the header.")]
                #[inline]
                pub fn [<put_ $ty>](&mut self, i: u32, value: $ty) {
                    let bytes = match self.order {
                        ByteOrder::LittleEndian => value.to_le_bytes(),
                        ByteOrder::BigEndian => value.to_be_bytes(),
                    };
                    self.write_at(i, &bytes);
                }
            )*
        }
    };
}

/// Raw interop over the user-data sub-range of a bound view.
///
/// Callers on this path take on two obligations: never touch memory outside
/// the reported length, and never retain the handle or address past the
/// current binding or past block reclamation.
pub trait DirectAccess {
    /// Read-only handle over the exact user-data sub-range, offset 0.
    fn raw_view(&self) -> &[u8];

    /// Absolute address of the first user-data byte.
    fn native_address(&self) -> usize;
}

/// A bound, zero-copy, read-only view over one allocated region.
///
/// Indexing starts at 0 on the first byte after the header; every access
/// translates to `header_size + position + i` in the underlying block. The
/// view is a plain stack value: resolving one allocates nothing.
pub struct ReadView<'a> {
    /// First user-data byte (header already skipped).
    user: NonNull<u8>,
    len: u32,
    header_size: u32,
    order: ByteOrder,
    _region: PhantomData<&'a [u8]>,
}

impl<'a> ReadView<'a> {
    pub(crate) fn bind(block: &'a Block, r: RegionRef, header_size: u32, order: ByteOrder) -> Self {
        let (user, len) = user_span(block, r, header_size);
        Self {
            user,
            len,
            header_size,
            order,
            _region: PhantomData,
        }
    }

    /// Usable length in bytes, header excluded.
    #[inline]
    pub const fn capacity(&self) -> u32 {
        self.len
    }

    #[inline]
    pub const fn order(&self) -> ByteOrder {
        self.order
    }

    #[inline]
    fn read_at<const N: usize>(&self, i: u32) -> [u8; N] {
        check_span::<N>(i, self.len);
        let mut out = [0u8; N];
        unsafe {
            ptr::copy_nonoverlapping(self.user.as_ptr().add(i as usize), out.as_mut_ptr(), N)
        };
        out
    }

    typed_reads!(u8, u16, i16, i32, i64, f32, f64);

    /// Applies `f` to a freshly constructed, header-excluded slice of the
    /// region. The slice is bounded to exactly the user data, so `f`
    /// structurally cannot observe the header or anything past the region.
    #[inline]
    pub fn transform<T>(&self, f: impl FnOnce(&[u8]) -> T) -> T {
        f(unsafe { core::slice::from_raw_parts(self.user.as_ptr(), self.len as usize) })
    }

    /// The header bytes preceding user data. For the index layer's own
    /// bookkeeping; never visible through [`Self::transform`] or
    /// [`DirectAccess::raw_view`].
    #[inline]
    pub fn header_bytes(&self) -> &[u8] {
        unsafe {
            core::slice::from_raw_parts(
                self.user.as_ptr().sub(self.header_size as usize),
                self.header_size as usize,
            )
        }
    }
}

impl DirectAccess for ReadView<'_> {
    #[inline]
    fn raw_view(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.user.as_ptr(), self.len as usize) }
    }

    #[inline]
    fn native_address(&self) -> usize {
        self.user.as_ptr() as usize
    }
}

/// Writer-side twin of [`ReadView`], legal only between `allocate` and the
/// publication of the reference.
pub struct WriteView<'a> {
    user: NonNull<u8>,
    len: u32,
    header_size: u32,
    order: ByteOrder,
    _region: PhantomData<&'a [u8]>,
}

impl<'a> WriteView<'a> {
    pub(crate) fn bind(block: &'a Block, r: RegionRef, header_size: u32, order: ByteOrder) -> Self {
        let (user, len) = user_span(block, r, header_size);
        Self {
            user,
            len,
            header_size,
            order,
            _region: PhantomData,
        }
    }

    #[inline]
    pub const fn capacity(&self) -> u32 {
        self.len
    }

    #[inline]
    pub const fn order(&self) -> ByteOrder {
        self.order
    }

    #[inline]
    fn write_at(&mut self, i: u32, bytes: &[u8]) {
        assert!(
            i as usize + bytes.len() <= self.len as usize,
            "write of {} bytes at {} exceeds capacity {}",
            bytes.len(),
            i,
            self.len
        );
        unsafe {
            ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.user.as_ptr().add(i as usize),
                bytes.len(),
            )
        };
    }

    typed_writes!(u8, u16, i16, i32, i64, f32, f64);

    /// Copies `src` into the region at `i` bytes past the header.
    #[inline]
    pub fn put_bytes(&mut self, i: u32, src: &[u8]) {
        self.write_at(i, src);
    }

    /// Mutable access to the header bytes, for the index layer to stamp its
    /// own metadata before publishing.
    #[inline]
    pub fn header_bytes_mut(&mut self) -> &mut [u8] {
        unsafe {
            core::slice::from_raw_parts_mut(
                self.user.as_ptr().sub(self.header_size as usize),
                self.header_size as usize,
            )
        }
    }
}

impl DirectAccess for WriteView<'_> {
    #[inline]
    fn raw_view(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.user.as_ptr(), self.len as usize) }
    }

    #[inline]
    fn native_address(&self) -> usize {
        self.user.as_ptr() as usize
    }
}

/// Reusable, rebindable slot for scans that visit many regions with one
/// object.
///
/// The slot itself exposes no reads: [`Self::bind`] is the only way to get a
/// [`ReadView`], so reading while unbound is unrepresentable, and the `&mut`
/// borrow makes every view from the previous binding unusable once `bind` is
/// called again. Between a bind and the last use of its view, the caller's
/// epoch mechanism must keep the referenced block from being reclaimed.
pub struct DetachedBuffer<'m, B: Backing> {
    mgr: &'m MemoryManager<B>,
    bound: RegionRef,
}

impl<'m, B: Backing> DetachedBuffer<'m, B> {
    pub fn new(mgr: &'m MemoryManager<B>) -> Self {
        Self {
            mgr,
            bound: RegionRef::NULL,
        }
    }

    /// Rebinds the slot and returns a view of the new region. On failure
    /// the previous binding is left untouched.
    pub fn bind(&mut self, r: RegionRef) -> Result<ReadView<'_>, Error<B::Error>> {
        let view = self.mgr.resolve(r)?;
        self.bound = r;
        Ok(view)
    }

    /// The current binding; [`RegionRef::NULL`] while unbound.
    #[inline]
    pub const fn bound(&self) -> RegionRef {
        self.bound
    }

    #[inline]
    pub const fn is_bound(&self) -> bool {
        !self.bound.is_null()
    }
}

#[inline]
fn user_span(block: &Block, r: RegionRef, header_size: u32) -> (NonNull<u8>, u32) {
    assert!(
        r.length() >= header_size,
        "region length {} shorter than header {}",
        r.length(),
        header_size
    );
    let end = r.position() as usize + r.length() as usize;
    assert!(
        end <= block.capacity() as usize,
        "region {:?} exceeds block {} capacity {}",
        r,
        block.id(),
        block.capacity()
    );
    let start = r.position() as usize + header_size as usize;
    let user = block.region().get_mut_ptr(start);
    // get_mut_ptr stays inside the mapping, never null
    let user = unsafe { NonNull::new_unchecked(user) };
    (user, r.length() - header_size)
}

#[inline]
fn check_span<const N: usize>(i: u32, len: u32) {
    assert!(
        i as usize + N <= len as usize,
        "read of {} bytes at {} exceeds capacity {}",
        N,
        i,
        len
    );
}
