//! the public allocator surface: request routing and the lock wrapper

use core::fmt;
use core::ptr::NonNull;

use crate::block::BlockAllocator;
use crate::pool::Pool;
use crate::superblock::SizeClasses;
use crate::types::{Error, Result, MAX_META_SIZE};
use crate::DefaultBlocks;

/// The allocator context: a block allocator over one pool plus the
/// superblock size-class table. Small requests go to a superblock
/// slab, everything else to the block free list.
///
/// `Xmem` is single-owner; wrap it in [`LockedXmem`] when calls can
/// arrive from interrupt handlers or multiple tasks.
pub struct Xmem<A: BlockAllocator = DefaultBlocks> {
    blocks: A,
    classes: SizeClasses,
}

impl<A: BlockAllocator> Xmem<A> {
    /// Bring the allocator up over `pool`: the block allocator's
    /// initial state plus one seed superblock per size class.
    pub fn new(pool: Pool) -> Result<Xmem<A>> {
        log::debug!(
            "xmem {}: pool capacity {}",
            env!("CARGO_PKG_VERSION"),
            pool.capacity()
        );
        let mut blocks = A::new(pool)?;
        let classes = SizeClasses::new(&mut blocks)?;
        Ok(Xmem { blocks, classes })
    }

    pub fn pool(&self) -> &Pool {
        self.blocks.pool()
    }

    /// Allocate `size` bytes.
    ///
    /// `OutOfMemory` and `OutOfDescriptorSpace` are recoverable;
    /// `Corrupted` means a boundary check failed and the caller should
    /// halt rather than continue.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>> {
        if size == 0 || size > u32::MAX as usize {
            return Err(Error::InvalidSize);
        }
        let size = size as u32;
        self.blocks.check()?;

        let offset = if size <= MAX_META_SIZE {
            let class = SizeClasses::class_for(size).ok_or(Error::InvalidSize)?;
            match self.classes.get(&mut self.blocks, class) {
                Ok(offset) => offset,
                Err(err) => {
                    if !err.is_fatal() {
                        log::error!("meta allocation failed: {}\n{}", err, self.dump());
                    }
                    return Err(err);
                }
            }
        } else {
            self.blocks.allocate(size)?
        };
        Ok(self.blocks.pool().data(offset))
    }

    /// Release an allocation.
    ///
    /// The superblock ranges are probed before the block list: under
    /// the detached layout a block lookup could otherwise claim an
    /// address that belongs to a slab whose first sub-block is live.
    /// `InvalidPointer` (never allocated, or already released) is
    /// unrecoverable.
    pub fn release(&mut self, ptr: NonNull<u8>) -> Result<()> {
        self.blocks.check()?;
        let offset = self
            .blocks
            .pool()
            .offset_of(ptr)
            .ok_or(Error::InvalidPointer)?;
        if self.classes.put(&mut self.blocks, offset)? {
            return Ok(());
        }
        self.blocks.release(offset)
    }

    /// snapshot of every list for diagnostics; pure read
    pub fn dump(&self) -> Dump<'_, A> {
        Dump { mem: self }
    }

    /// the underlying block allocator, for inspection
    pub fn blocks(&self) -> &A {
        &self.blocks
    }

    #[cfg(test)]
    pub(crate) fn classes(&self) -> &SizeClasses {
        &self.classes
    }
}

/// human-readable state of every block record and superblock chain
pub struct Dump<'a, A: BlockAllocator> {
    mem: &'a Xmem<A>,
}

impl<A: BlockAllocator> fmt::Display for Dump<'_, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.mem.blocks.fmt_dump(f)?;
        self.mem.classes.fmt_dump(self.mem.blocks.pool(), f)
    }
}

/// [`Xmem`] behind a spinlock, giving every public call the
/// mutual-exclusion bracket it needs under interrupt-driven or
/// preemptive scheduling. This is the surface meant for `static` use:
/// construction is `const`, the pool is attached once with
/// [`LockedXmem::init`], and failures come back as null-style `None`
/// results.
pub struct LockedXmem<A: BlockAllocator = DefaultBlocks> {
    inner: spin::Mutex<Option<Xmem<A>>>,
}

impl<A: BlockAllocator> LockedXmem<A> {
    pub const fn new() -> LockedXmem<A> {
        LockedXmem {
            inner: spin::Mutex::new(None),
        }
    }

    /// Attach the pool and build all internal structures. Idempotent:
    /// a second call is a no-op `Ok`.
    pub fn init(&self, pool: Pool) -> Result<()> {
        let mut guard = self.inner.lock();
        if guard.is_some() {
            return Ok(());
        }
        *guard = Some(Xmem::new(pool)?);
        Ok(())
    }

    /// Allocate `size` bytes; `None` signals exhaustion or an invalid
    /// size. Callers must check.
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let mut guard = self.inner.lock();
        let mem = match guard.as_mut() {
            Some(mem) => mem,
            None => {
                log::error!("allocate({}) before init", size);
                return None;
            }
        };
        match mem.allocate(size) {
            Ok(ptr) => Some(ptr),
            Err(err) => {
                if err.is_fatal() {
                    log::error!("allocation found corrupt state: {}", err);
                }
                None
            }
        }
    }

    /// Release an allocation. Fatal errors are logged and returned;
    /// the embedder's assertion hook decides whether to halt.
    pub fn release(&self, ptr: NonNull<u8>) -> Result<()> {
        let mut guard = self.inner.lock();
        let mem = guard.as_mut().ok_or(Error::BadConfig)?;
        mem.release(ptr).map_err(|err| {
            log::error!("release {:p} failed: {}\n{}", ptr.as_ptr(), err, mem.dump());
            err
        })
    }

    /// write the diagnostic snapshot into `out`
    pub fn dump_into(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        let guard = self.inner.lock();
        match guard.as_ref() {
            Some(mem) => write!(out, "{}", mem.dump()),
            None => writeln!(out, "(uninitialized)"),
        }
    }
}

impl<A: BlockAllocator> Default for LockedXmem<A> {
    fn default() -> LockedXmem<A> {
        LockedXmem::new()
    }
}
