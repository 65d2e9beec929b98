//! the raw pool region that all bookkeeping and data live inside

use core::ptr::{self, NonNull};

use crate::types::{Error, Result, ALIGN};

/// A single contiguous byte region of fixed capacity, supplied by the
/// platform layer (a static buffer, or linker-provided RAM bounds).
///
/// `Pool` is only the region descriptor: base address and capacity.
/// The block allocators address memory by `u32` offsets from `base` and
/// store their record structs inside the region through
/// [`Pool::read_at`] / [`Pool::write_at`]; a raw pointer is produced
/// only at the public boundary.
#[derive(Copy, Clone, Debug)]
pub struct Pool {
    base: NonNull<u8>,
    capacity: u32,
}

// the region is exclusively owned by whichever allocator is built on top
unsafe impl Send for Pool {}

impl Pool {
    /// Describe a reserved region.
    ///
    /// Rejects a zero-sized or misaligned region with `BadConfig`.
    ///
    /// # Safety
    ///
    /// `base..base + capacity` must be valid for reads and writes for as
    /// long as any allocator built on this `Pool` is alive, and nothing
    /// else may touch those bytes.
    pub unsafe fn new(base: NonNull<u8>, capacity: u32) -> Result<Pool> {
        if capacity == 0 || base.as_ptr() as usize % ALIGN as usize != 0 {
            log::warn!(
                "rejected pool region: base {:p}, capacity {}",
                base.as_ptr(),
                capacity
            );
            return Err(Error::BadConfig);
        }
        Ok(Pool { base, capacity })
    }

    /// Describe a region backed by a static buffer.
    pub fn from_region(region: &'static mut [u8]) -> Result<Pool> {
        if region.len() > u32::MAX as usize {
            return Err(Error::BadConfig);
        }
        let capacity = region.len() as u32;
        let base = NonNull::new(region.as_mut_ptr()).ok_or(Error::BadConfig)?;
        unsafe { Pool::new(base, capacity) }
    }

    /// total size of the region in bytes
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// convert an internal offset into the raw address handed to callers
    pub fn data(&self, offset: u32) -> NonNull<u8> {
        debug_assert!(offset < self.capacity);
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset as usize)) }
    }

    /// convert a caller's address back into an offset, if it lies inside
    /// the region
    pub fn offset_of(&self, ptr: NonNull<u8>) -> Option<u32> {
        let base = self.base.as_ptr() as usize;
        let addr = ptr.as_ptr() as usize;
        if addr < base || addr >= base + self.capacity as usize {
            None
        } else {
            Some((addr - base) as u32)
        }
    }

    /// Read a record stored at `offset`.
    ///
    /// # Safety
    ///
    /// A `T` must previously have been written at `offset`, and
    /// `offset` must be aligned for `T` with `offset + size_of::<T>()`
    /// inside the region.
    pub(crate) unsafe fn read_at<T: Copy>(&self, offset: u32) -> T {
        debug_assert!(offset as usize + core::mem::size_of::<T>() <= self.capacity as usize);
        debug_assert_eq!(offset as usize % core::mem::align_of::<T>(), 0);
        ptr::read(self.base.as_ptr().add(offset as usize) as *const T)
    }

    /// Write a record at `offset`.
    ///
    /// # Safety
    ///
    /// `offset` must be aligned for `T` with `offset + size_of::<T>()`
    /// inside the region, and must not overlap live user data.
    pub(crate) unsafe fn write_at<T>(&self, offset: u32, value: T) {
        debug_assert!(offset as usize + core::mem::size_of::<T>() <= self.capacity as usize);
        debug_assert_eq!(offset as usize % core::mem::align_of::<T>(), 0);
        ptr::write(self.base.as_ptr().add(offset as usize) as *mut T, value);
    }
}

/// leak an aligned buffer and describe it; the backing memory lives for
/// the remainder of the test process
#[cfg(test)]
pub(crate) fn test_pool(capacity: u32) -> Pool {
    let words = (capacity as usize + 7) / 8;
    let buf: &'static mut [u64] = Box::leak(vec![0u64; words].into_boxed_slice());
    let base = NonNull::new(buf.as_mut_ptr() as *mut u8).unwrap();
    unsafe { Pool::new(base, capacity).unwrap() }
}
