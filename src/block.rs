//! the interface both block-layout strategies implement

use core::fmt;

use crate::pool::Pool;
use crate::types::Result;

/// Occupancy counters for a block allocator, used by diagnostics and
/// tests. Byte counts cover block data only, not record overhead.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct BlockStats {
    /// tracked block records
    pub nodes: u32,
    /// records currently marked free
    pub free_nodes: u32,
    /// bytes covered by free records
    pub free_bytes: u32,
    /// bytes covered by allocated records
    pub used_bytes: u32,
    /// untouched bytes not yet carved into any record
    pub reserve_bytes: u32,
}

impl BlockStats {
    /// bytes a new allocation could still draw from, ignoring
    /// fragmentation and record overhead
    pub fn available(&self) -> u32 {
        self.free_bytes + self.reserve_bytes
    }
}

/// The variable-size allocator over the pool's data region: best-fit
/// search with splitting, coalescing on release.
///
/// Two layouts implement this. [`EmbeddedBlocks`](crate::EmbeddedBlocks)
/// places each record immediately before the memory it manages;
/// [`DetachedBlocks`](crate::DetachedBlocks) keeps records in a
/// descriptor region disjoint from user data. The layout is picked at
/// build time through the `detached` cargo feature.
pub trait BlockAllocator {
    /// bring the allocator up over the whole pool
    fn new(pool: Pool) -> Result<Self>
    where
        Self: Sized;

    fn pool(&self) -> &Pool;

    /// Allocate `size` bytes (rounded up to the granularity), returning
    /// the data offset. `OutOfMemory` and `OutOfDescriptorSpace` are
    /// recoverable.
    fn allocate(&mut self, size: u32) -> Result<u32>;

    /// Release a data offset previously returned by [`allocate`],
    /// coalescing with free neighbors. `InvalidPointer` if the offset is
    /// not a live allocation.
    ///
    /// [`allocate`]: BlockAllocator::allocate
    fn release(&mut self, offset: u32) -> Result<()>;

    /// Acquire `size` bytes of bookkeeping storage for a superblock
    /// chain node, kept apart from user data where the layout allows it.
    fn acquire_node(&mut self, size: u32) -> Result<u32>;

    /// return node storage taken with [`acquire_node`]
    ///
    /// [`acquire_node`]: BlockAllocator::acquire_node
    fn release_node(&mut self, offset: u32, size: u32) -> Result<()>;

    /// Verify list invariants without mutating anything. A `Corrupted`
    /// result is unrecoverable; the caller is expected to halt.
    fn check(&self) -> Result<()>;

    fn stats(&self) -> BlockStats;

    /// write a diagnostic snapshot of every record; pure read
    fn fmt_dump(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result;
}
