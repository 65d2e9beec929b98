//! block layout with the record embedded in front of its data
//!
//! Every record sits immediately before the memory it manages, so the
//! whole pool is one chain of physically contiguous records:
//!
//! ```text
//! |     prev     |     blk      |     next     |
//! |--------------|--------------|--------------|
//! |record|  mem  |record|  mem  |record|  mem  |
//! ```
//!
//! The record's own offset is the implicit address of its data. The
//! contiguity invariant (`next == self + RECORD_SIZE + blksize`) is
//! verified on every public call; a violation means user code wrote
//! past its allocation and the pool can no longer be trusted.

use core::fmt;

use crate::block::{BlockAllocator, BlockStats};
use crate::pool::Pool;
use crate::types::{round_up, Error, Result, ALIGN, BALANCE, NIL};

#[derive(Copy, Clone, Debug)]
#[repr(C)]
struct Record {
    blksize: u32,
    free: u32,
    next: u32,
}

const RECORD_SIZE: u32 = core::mem::size_of::<Record>() as u32;

/// the descriptor-embedded, boundary-checked block layout
pub struct EmbeddedBlocks {
    pool: Pool,
    head: u32,
}

impl EmbeddedBlocks {
    fn record(&self, offset: u32) -> Record {
        unsafe { self.pool.read_at(offset) }
    }

    fn set_record(&self, offset: u32, record: Record) {
        unsafe { self.pool.write_at(offset, record) }
    }
}

impl BlockAllocator for EmbeddedBlocks {
    /// one free record spanning the whole pool
    fn new(pool: Pool) -> Result<EmbeddedBlocks> {
        if pool.capacity() < RECORD_SIZE + ALIGN {
            log::warn!("pool capacity {} cannot hold a block record", pool.capacity());
            return Err(Error::BadConfig);
        }
        let blocks = EmbeddedBlocks { pool, head: 0 };
        blocks.set_record(
            0,
            Record {
                blksize: pool.capacity() - RECORD_SIZE,
                free: 1,
                next: NIL,
            },
        );
        Ok(blocks)
    }

    fn pool(&self) -> &Pool {
        &self.pool
    }

    fn allocate(&mut self, size: u32) -> Result<u32> {
        if size == 0 {
            return Err(Error::InvalidSize);
        }
        let size = round_up(size);

        // single best-fit scan; an exact match wins outright, otherwise
        // the first minimal-remainder candidate does
        let mut best = NIL;
        let mut best_remain = u32::MAX;
        let mut cur = self.head;
        while cur != NIL {
            let mut rec = self.record(cur);
            if rec.free == 1 {
                if rec.blksize == size {
                    rec.free = 0;
                    self.set_record(cur, rec);
                    return Ok(cur + RECORD_SIZE);
                }
                if rec.blksize > size && rec.blksize - size < best_remain {
                    best_remain = rec.blksize - size;
                    best = cur;
                }
            }
            cur = rec.next;
        }

        if best == NIL {
            self.check()?;
            return Err(Error::OutOfMemory);
        }

        let mut rec = self.record(best);
        if best_remain > RECORD_SIZE + BALANCE {
            // worth splitting: the remainder becomes a new free record
            // right behind the allocation
            let rest = best + RECORD_SIZE + size;
            self.set_record(
                rest,
                Record {
                    blksize: best_remain - RECORD_SIZE,
                    free: 1,
                    next: rec.next,
                },
            );
            rec.next = rest;
            rec.blksize = size;
        }
        rec.free = 0;
        self.set_record(best, rec);
        Ok(best + RECORD_SIZE)
    }

    fn release(&mut self, offset: u32) -> Result<()> {
        let mut prev = NIL;
        let mut cur = self.head;
        while cur != NIL {
            let mut rec = self.record(cur);
            if cur + RECORD_SIZE != offset {
                prev = cur;
                cur = rec.next;
                continue;
            }
            if rec.free == 1 {
                return Err(Error::InvalidPointer);
            }
            rec.free = 1;

            if prev != NIL {
                let mut pr = self.record(prev);
                if pr.free == 1 {
                    pr.blksize += rec.blksize + RECORD_SIZE;
                    pr.next = rec.next;
                    self.set_record(prev, pr);
                    cur = prev;
                    rec = pr;
                }
            }
            if rec.next != NIL {
                let nx = self.record(rec.next);
                if nx.free == 1 {
                    rec.blksize += nx.blksize + RECORD_SIZE;
                    rec.next = nx.next;
                }
            }
            self.set_record(cur, rec);
            return Ok(());
        }
        Err(Error::InvalidPointer)
    }

    fn acquire_node(&mut self, size: u32) -> Result<u32> {
        self.allocate(size)
    }

    fn release_node(&mut self, offset: u32, _size: u32) -> Result<()> {
        self.release(offset)
    }

    /// walk the chain verifying flags, bounds and strict contiguity
    fn check(&self) -> Result<()> {
        let capacity = self.pool.capacity();
        let mut seen = 0u32;
        let mut cur = self.head;
        while cur != NIL {
            let rec = self.record(cur);
            let end = cur + RECORD_SIZE + rec.blksize;
            let broken = rec.free > 1
                || end > capacity
                || (rec.next == NIL && end != capacity)
                || (rec.next != NIL && rec.next != end);
            if broken {
                log::error!(
                    "block list corrupt: blk:{},blksize:{},blknext:{},free:{}",
                    cur,
                    rec.blksize,
                    rec.next as i32,
                    rec.free
                );
                return Err(Error::Corrupted);
            }
            seen += RECORD_SIZE + rec.blksize;
            if seen > capacity {
                return Err(Error::Corrupted);
            }
            cur = rec.next;
        }
        Ok(())
    }

    fn stats(&self) -> BlockStats {
        let mut stats = BlockStats::default();
        let mut cur = self.head;
        while cur != NIL {
            let rec = self.record(cur);
            stats.nodes += 1;
            if rec.free == 1 {
                stats.free_nodes += 1;
                stats.free_bytes += rec.blksize;
            } else {
                stats.used_bytes += rec.blksize;
            }
            cur = rec.next;
        }
        stats
    }

    fn fmt_dump(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "-----Block Info-----")?;
        let mut cur = self.head;
        while cur != NIL {
            let rec = self.record(cur);
            writeln!(
                f,
                "blk:{},blksize:{},blknext:{},free:{}",
                cur, rec.blksize, rec.next as i32, rec.free
            )?;
            cur = rec.next;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::test_pool;

    fn blocks(capacity: u32) -> EmbeddedBlocks {
        EmbeddedBlocks::new(test_pool(capacity)).unwrap()
    }

    #[test]
    fn test_initial_state() {
        let blocks = blocks(1024);
        let stats = blocks.stats();
        assert_eq!(stats.nodes, 1);
        assert_eq!(stats.free_bytes, 1024 - RECORD_SIZE);
        blocks.check().unwrap();
    }

    #[test]
    fn test_allocate_splits() {
        let mut blocks = blocks(1024);
        let a = blocks.allocate(100).unwrap();
        assert_eq!(a, RECORD_SIZE);
        let stats = blocks.stats();
        assert_eq!(stats.nodes, 2);
        assert_eq!(stats.used_bytes, 100);
        assert_eq!(stats.free_bytes, 1024 - 100 - 2 * RECORD_SIZE);
        blocks.check().unwrap();
    }

    #[test]
    fn test_exact_fit_short_circuits() {
        let mut blocks = blocks(1024);
        let a = blocks.allocate(100).unwrap();
        blocks.release(a).unwrap();
        // the freed 100-byte record is an exact fit and is reused whole
        let b = blocks.allocate(100).unwrap();
        assert_eq!(a, b);
        assert_eq!(blocks.stats().nodes, 2);
    }

    #[test]
    fn test_best_fit_prefers_smallest() {
        let mut blocks = blocks(2048);
        let a = blocks.allocate(400).unwrap();
        let _gap1 = blocks.allocate(8).unwrap();
        let b = blocks.allocate(60).unwrap();
        let _gap2 = blocks.allocate(8).unwrap();
        blocks.release(a).unwrap();
        blocks.release(b).unwrap();
        // 40 fits both holes; the 60-byte one has the smaller remainder
        let c = blocks.allocate(40).unwrap();
        assert_eq!(c, b);
        blocks.check().unwrap();
    }

    #[test]
    fn test_no_split_below_balance() {
        let mut blocks = blocks(1024);
        let a = blocks.allocate(100).unwrap();
        let _guard = blocks.allocate(8).unwrap();
        blocks.release(a).unwrap();
        let nodes = blocks.stats().nodes;
        // leftover of 4 is below the balance threshold; the caller gets
        // the whole 100-byte block
        let b = blocks.allocate(96).unwrap();
        assert_eq!(b, a);
        assert_eq!(blocks.stats().nodes, nodes);
        assert_eq!(blocks.stats().used_bytes % 4, 0);
    }

    #[test]
    fn test_coalesce_both_orders() {
        for reversed in [false, true] {
            let mut blocks = blocks(1024);
            let a = blocks.allocate(100).unwrap();
            let b = blocks.allocate(100).unwrap();
            let _guard = blocks.allocate(8).unwrap();
            if reversed {
                blocks.release(b).unwrap();
                blocks.release(a).unwrap();
            } else {
                blocks.release(a).unwrap();
                blocks.release(b).unwrap();
            }
            let stats = blocks.stats();
            // exactly one free node spans both, not two adjacent ones
            assert_eq!(stats.free_nodes, 2, "guard tail + merged hole");
            let merged = blocks.record(a - RECORD_SIZE);
            assert_eq!(merged.free, 1);
            assert_eq!(merged.blksize, 200 + RECORD_SIZE);
            blocks.check().unwrap();
        }
    }

    #[test]
    fn test_release_all_restores_single_span() {
        let mut blocks = blocks(1024);
        let a = blocks.allocate(100).unwrap();
        let b = blocks.allocate(60).unwrap();
        let c = blocks.allocate(200).unwrap();
        blocks.release(b).unwrap();
        blocks.release(a).unwrap();
        blocks.release(c).unwrap();
        let stats = blocks.stats();
        assert_eq!(stats.nodes, 1);
        assert_eq!(stats.free_bytes, 1024 - RECORD_SIZE);
        blocks.check().unwrap();
    }

    #[test]
    fn test_out_of_memory_is_recoverable() {
        let mut blocks = blocks(256);
        let a = blocks.allocate(200).unwrap();
        assert_eq!(blocks.allocate(200), Err(Error::OutOfMemory));
        blocks.release(a).unwrap();
        assert!(blocks.allocate(200).is_ok());
    }

    #[test]
    fn test_invalid_release() {
        let mut blocks = blocks(1024);
        let a = blocks.allocate(100).unwrap();
        assert_eq!(blocks.release(a + 4), Err(Error::InvalidPointer));
        blocks.release(a).unwrap();
        assert_eq!(blocks.release(a), Err(Error::InvalidPointer));
    }

    #[test]
    fn test_check_catches_overwrite() {
        let mut blocks = blocks(1024);
        let a = blocks.allocate(100).unwrap();
        let _b = blocks.allocate(100).unwrap();
        // simulate user code writing past its allocation, clobbering the
        // next record's size field
        unsafe {
            blocks
                .pool
                .write_at::<u32>(a + 100, 0xdead_beef);
        }
        assert_eq!(blocks.check(), Err(Error::Corrupted));
    }
}
