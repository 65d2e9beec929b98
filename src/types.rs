//! shared error type and the compile-time pool geometry

use thiserror::Error;

/// allocation granularity in bytes; every block size is rounded up to this
pub const ALIGN: u32 = 4;

/// base unit of the superblock size classes: 4 bytes on 32-bit targets,
/// 8 bytes on 64-bit targets
pub const META_UNIT: u32 = core::mem::size_of::<usize>() as u32;

/// number of superblock size classes (x1, x2, x4 and, on 32-bit
/// targets, x8 the base unit)
pub const NUM_CLASSES: usize = if META_UNIT == 4 { 4 } else { 3 };

/// sub-block size of each class
pub const CLASS_SIZES: [u32; NUM_CLASSES] = {
    let mut sizes = [0u32; NUM_CLASSES];
    let mut i = 0;
    while i < NUM_CLASSES {
        sizes[i] = META_UNIT << i;
        i += 1;
    }
    sizes
};

/// sub-blocks in each class's seed superblock
pub const CLASS_SEED_BLOCKS: [u8; NUM_CLASSES] = {
    let mut counts = [16u8; NUM_CLASSES];
    counts[1] = 32;
    counts
};

/// largest request the superblock sub-allocator will service
pub const MAX_META_SIZE: u32 = CLASS_SIZES[NUM_CLASSES - 1];

/// a superblock bitmap has 32 bits, so at most 32 sub-blocks
pub const SUPERBLOCK_MAX_BLOCKS: u8 = 32;

/// when a best-fit candidate's leftover is below this, the block is
/// handed out unsplit instead of leaving a tiny free fragment behind
pub const BALANCE: u32 = META_UNIT * 4;

/// sentinel for "no next record" in the in-pool linked lists
pub const NIL: u32 = u32::MAX;

/// round `size` up to the allocation granularity
pub const fn round_up(size: u32) -> u32 {
    (size + ALIGN - 1) & !(ALIGN - 1)
}

/// memory error codes
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum Error {
    /// The pool has no free region large enough for the request.
    /// Free something and try again.
    #[error("pool is out of memory")]
    OutOfMemory,
    /// The descriptor region is exhausted even though data capacity
    /// may remain (descriptor-detached layout only).
    #[error("descriptor region is exhausted")]
    OutOfDescriptorSpace,
    /// the amount of memory requested is zero or too large
    #[error("invalid allocation size")]
    InvalidSize,
    /// the released pointer is not owned by this allocator, or was
    /// already released. Unrecoverable.
    #[error("pointer is not a live allocation")]
    InvalidPointer,
    /// an internal list invariant is broken. Unrecoverable: the pool
    /// contents can no longer be trusted.
    #[error("allocator bookkeeping is corrupted")]
    Corrupted,
    /// a setup parameter was rejected; the operation was a no-op
    #[error("bad configuration parameter")]
    BadConfig,
}

impl Error {
    /// whether the caller should treat this error as process-fatal
    /// instead of retrying
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::InvalidPointer | Error::Corrupted)
    }
}

pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry() {
        assert_eq!(META_UNIT, core::mem::size_of::<usize>() as u32);
        assert_eq!(CLASS_SIZES[0], META_UNIT);
        for w in CLASS_SIZES.windows(2) {
            assert_eq!(w[1], w[0] * 2);
        }
        assert_eq!(MAX_META_SIZE, META_UNIT << (NUM_CLASSES - 1));
        assert_eq!(CLASS_SEED_BLOCKS[1], 32);
    }

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(0), 0);
        assert_eq!(round_up(1), 4);
        assert_eq!(round_up(4), 4);
        assert_eq!(round_up(5), 8);
        assert_eq!(round_up(17), 20);
    }

    #[test]
    fn test_fatal() {
        assert!(Error::Corrupted.is_fatal());
        assert!(Error::InvalidPointer.is_fatal());
        assert!(!Error::OutOfMemory.is_fatal());
        assert!(!Error::BadConfig.is_fatal());
    }
}
