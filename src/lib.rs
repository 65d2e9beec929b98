//! Fixed-pool memory manager for microcontrollers and other embedded
//! targets. One statically provided byte region is carved into
//! variable-size blocks by a best-fit free list, with a bitmap
//! superblock layer soaking up the small metadata-size requests that
//! would otherwise shred the pool.
//!
//! Two pool layouts are built in and selected at compile time:
//!
//! - the default **embedded** layout stores each block's record
//!   directly in front of its data, so a buffer overrun is caught by
//!   the consistency walk on the next call;
//! - the **detached** layout (feature `detached`) keeps all records in
//!   an arena at the pool's start and carves data from the end,
//!   keeping live data untouched by bookkeeping.
//!
//! Requests no larger than [`types::MAX_META_SIZE`] are served from
//! superblocks: slabs split into equal sub-blocks tracked by a free
//! bitmap, one chain per size class, grown on demand from the block
//! layer.
//!
//! ```
//! use xmem::{Pool, Xmem};
//!
//! let region: &'static mut [u8] = unsafe {
//!     let buf = Box::leak(vec![0u64; 1024].into_boxed_slice());
//!     core::slice::from_raw_parts_mut(buf.as_mut_ptr() as *mut u8, 8192)
//! };
//! let pool = Pool::from_region(region).unwrap();
//! let mut mem: Xmem = Xmem::new(pool).unwrap();
//!
//! let a = mem.allocate(100).unwrap();
//! let b = mem.allocate(8).unwrap(); // served by a superblock
//! mem.release(a).unwrap();
//! mem.release(b).unwrap();
//! ```
//!
//! For `static` placement use [`LockedXmem`], which brackets every
//! call in a spinlock and has a `const` constructor.
#![cfg_attr(not(test), no_std)]

mod alloc;
mod arena;
mod block;
mod detached;
mod embedded;
mod pool;
mod superblock;
pub mod types;

#[cfg(test)]
mod tests;

pub use crate::alloc::{Dump, LockedXmem, Xmem};
pub use crate::block::{BlockAllocator, BlockStats};
pub use crate::detached::DetachedBlocks;
pub use crate::embedded::EmbeddedBlocks;
pub use crate::pool::Pool;
pub use crate::types::{Error, Result};

cfg_if::cfg_if! {
    if #[cfg(feature = "detached")] {
        /// the block layout selected at build time
        pub type DefaultBlocks = DetachedBlocks;
    } else {
        /// the block layout selected at build time
        pub type DefaultBlocks = EmbeddedBlocks;
    }
}
