//! bitmap slab sub-allocator for small, fixed-size "meta" objects
//!
//! Each size class owns a chain of superblocks; a superblock is a slab
//! of up to 32 equal-size sub-blocks with a bitmap tracking which are
//! free. The class heads live inline in the table; grown superblocks
//! are chained behind them with their nodes stored through the block
//! allocator.

use core::fmt;

use crate::block::BlockAllocator;
use crate::pool::Pool;
use crate::types::{
    Error, Result, CLASS_SEED_BLOCKS, CLASS_SIZES, META_UNIT, NIL, NUM_CLASSES,
    SUPERBLOCK_MAX_BLOCKS,
};

#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub(crate) struct Superblock {
    next: u32,
    /// offset of the slab this superblock indexes
    addr: u32,
    /// bit i set <=> sub-block i is free
    free_map: u32,
    blksize: u16,
    nfree: u8,
    nblk: u8,
}

pub(crate) const SUPERBLOCK_NODE_SIZE: u32 = core::mem::size_of::<Superblock>() as u32;

impl Superblock {
    /// Describe a fresh, fully free slab. Misconfiguration is rejected
    /// with a diagnostic and no effect, since it can only happen during
    /// controlled startup sequencing.
    fn init(addr: u32, nblk: u8, blksize: u16) -> Result<Superblock> {
        if addr == NIL
            || nblk < 2
            || nblk > SUPERBLOCK_MAX_BLOCKS
            || (blksize as u32) < META_UNIT
        {
            log::warn!(
                "rejected superblock: address:{}, blocks:{}, block size:{}",
                addr,
                nblk,
                blksize
            );
            return Err(Error::BadConfig);
        }
        let free_map = if nblk == SUPERBLOCK_MAX_BLOCKS {
            u32::MAX
        } else {
            (1u32 << nblk) - 1
        };
        Ok(Superblock {
            next: NIL,
            addr,
            free_map,
            blksize,
            nfree: nblk,
            nblk,
        })
    }

    fn contains(&self, offset: u32) -> bool {
        offset >= self.addr && offset < self.addr + self.nblk as u32 * self.blksize as u32
    }
}

/// where a chain node lives: inline in the class table, or in the pool
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Slot {
    Head(usize),
    Chained(u32),
}

/// the fixed table of per-class superblock chains
pub(crate) struct SizeClasses {
    heads: [Superblock; NUM_CLASSES],
}

impl SizeClasses {
    /// Seed every class with one superblock, all slabs carved from a
    /// single contiguous block-allocator allocation to keep startup
    /// fragmentation down.
    pub fn new<A: BlockAllocator>(blocks: &mut A) -> Result<SizeClasses> {
        let mut total = 0u32;
        for class in 0..NUM_CLASSES {
            total += CLASS_SIZES[class] * CLASS_SEED_BLOCKS[class] as u32;
        }
        let mut slab = blocks.allocate(total)?;
        let mut heads = [Superblock::init(0, 2, META_UNIT as u16)?; NUM_CLASSES];
        for class in 0..NUM_CLASSES {
            heads[class] =
                Superblock::init(slab, CLASS_SEED_BLOCKS[class], CLASS_SIZES[class] as u16)?;
            slab += CLASS_SIZES[class] * CLASS_SEED_BLOCKS[class] as u32;
        }
        Ok(SizeClasses { heads })
    }

    /// smallest class whose sub-block size fits `size`, if any
    pub fn class_for(size: u32) -> Option<usize> {
        CLASS_SIZES.iter().position(|&blksize| size <= blksize)
    }

    fn load(&self, pool: &Pool, slot: Slot) -> Superblock {
        match slot {
            Slot::Head(class) => self.heads[class],
            Slot::Chained(offset) => unsafe { pool.read_at(offset) },
        }
    }

    fn store(&mut self, pool: &Pool, slot: Slot, node: Superblock) {
        match slot {
            Slot::Head(class) => self.heads[class] = node,
            Slot::Chained(offset) => unsafe { pool.write_at(offset, node) },
        }
    }

    /// Take one sub-block from `class`, growing the chain by one
    /// superblock when every existing one is full.
    pub fn get<A: BlockAllocator>(&mut self, blocks: &mut A, class: usize) -> Result<u32> {
        let mut slot = Slot::Head(class);
        let slot = loop {
            let node = self.load(blocks.pool(), slot);
            if node.nfree > 0 {
                break slot;
            }
            if node.next == NIL {
                // chain exhausted: append a fresh superblock at half
                // the head's sub-block count
                let head = self.heads[class];
                let grow = (head.nblk / 2).clamp(2, SUPERBLOCK_MAX_BLOCKS);
                let fresh = blocks.acquire_node(SUPERBLOCK_NODE_SIZE)?;
                let slab = match blocks.allocate(head.blksize as u32 * grow as u32) {
                    Ok(slab) => slab,
                    Err(err) => {
                        blocks.release_node(fresh, SUPERBLOCK_NODE_SIZE)?;
                        return Err(err);
                    }
                };
                let grown = Superblock::init(slab, grow, head.blksize)?;
                self.store(blocks.pool(), Slot::Chained(fresh), grown);
                let mut tail = self.load(blocks.pool(), slot);
                tail.next = fresh;
                self.store(blocks.pool(), slot, tail);
                break Slot::Chained(fresh);
            }
            slot = Slot::Chained(node.next);
        };

        let mut node = self.load(blocks.pool(), slot);
        if node.nfree as u32 != node.free_map.count_ones() || node.free_map == 0 {
            log::error!(
                "superblock bitmap out of sync: size:{},free:{},total:{}",
                node.blksize,
                node.nfree,
                node.nblk
            );
            return Err(Error::Corrupted);
        }
        let index = node.free_map.trailing_zeros();
        if index >= node.nblk as u32 {
            return Err(Error::Corrupted);
        }
        node.free_map &= !(1 << index);
        node.nfree -= 1;
        let addr = node.addr + index * node.blksize as u32;
        self.store(blocks.pool(), slot, node);
        Ok(addr)
    }

    /// Probe every class chain for `offset`; if a superblock claims it,
    /// return the sub-block and report `true`. A chained superblock
    /// that becomes fully free is handed back to the block allocator;
    /// a class head is retained even when empty, since it has no
    /// descriptor or standalone slab of its own.
    pub fn put<A: BlockAllocator>(&mut self, blocks: &mut A, offset: u32) -> Result<bool> {
        for class in 0..NUM_CLASSES {
            let mut prev: Option<Slot> = None;
            let mut slot = Slot::Head(class);
            loop {
                let mut node = self.load(blocks.pool(), slot);
                if node.contains(offset) {
                    if (offset - node.addr) % node.blksize as u32 != 0 {
                        return Err(Error::InvalidPointer);
                    }
                    let index = (offset - node.addr) / node.blksize as u32;
                    if node.free_map & (1 << index) != 0 {
                        // this sub-block is already free
                        return Err(Error::InvalidPointer);
                    }
                    node.free_map |= 1 << index;
                    node.nfree += 1;
                    if node.nfree as u32 != node.free_map.count_ones() {
                        return Err(Error::Corrupted);
                    }
                    self.store(blocks.pool(), slot, node);

                    if node.nfree == node.nblk {
                        if let (Some(prev_slot), Slot::Chained(node_off)) = (prev, slot) {
                            let mut before = self.load(blocks.pool(), prev_slot);
                            before.next = node.next;
                            self.store(blocks.pool(), prev_slot, before);
                            blocks.release(node.addr)?;
                            blocks.release_node(node_off, SUPERBLOCK_NODE_SIZE)?;
                        }
                    }
                    return Ok(true);
                }
                if node.next == NIL {
                    break;
                }
                prev = Some(slot);
                slot = Slot::Chained(node.next);
            }
        }
        Ok(false)
    }

    pub fn fmt_dump(&self, pool: &Pool, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "-----SuperBlock Info-----")?;
        for class in 0..NUM_CLASSES {
            let mut slot = Slot::Head(class);
            loop {
                let node = self.load(pool, slot);
                writeln!(f, "size:{},free:{},total:{}", node.blksize, node.nfree, node.nblk)?;
                if node.next == NIL {
                    break;
                }
                slot = Slot::Chained(node.next);
            }
        }
        Ok(())
    }

    /// number of superblocks chained under `class`, the head included
    #[cfg(test)]
    pub fn chain_len(&self, pool: &Pool, class: usize) -> u32 {
        let mut len = 1;
        let mut node = self.heads[class];
        while node.next != NIL {
            len += 1;
            node = unsafe { pool.read_at(node.next) };
        }
        len
    }

    #[cfg(test)]
    pub fn head(&self, class: usize) -> (u32, u8, u8, u16) {
        let node = self.heads[class];
        (node.addr, node.nfree, node.nblk, node.blksize)
    }
}
