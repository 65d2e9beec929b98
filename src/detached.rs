//! block layout with records kept apart from user data
//!
//! Records live in the descriptor arena at the low end of the pool and
//! reference their data by explicit offset; data is carved downward
//! from the high end on demand. A stray user write can clobber other
//! user data but never the bookkeeping.

use core::fmt;

use crate::arena::{Arena, NodeKind};
use crate::block::{BlockAllocator, BlockStats};
use crate::pool::Pool;
use crate::types::{round_up, Error, Result, BALANCE, NIL};

#[derive(Copy, Clone, Debug)]
#[repr(C)]
struct Node {
    next: u32,
    addr: u32,
    blksize: u32,
    free: u32,
}

const NODE_SIZE: u32 = core::mem::size_of::<Node>() as u32;

/// the descriptor-detached block layout
pub struct DetachedBlocks {
    pool: Pool,
    arena: Arena,
    /// first record, list sorted by ascending data offset
    head: u32,
    /// low edge of the carved data region; everything between the
    /// arena's end and here is untouched
    data_start: u32,
}

impl DetachedBlocks {
    fn node(&self, offset: u32) -> Node {
        unsafe { self.pool.read_at(offset) }
    }

    fn set_node(&self, offset: u32, node: Node) {
        unsafe { self.pool.write_at(offset, node) }
    }
}

impl BlockAllocator for DetachedBlocks {
    /// empty block list; records and data are both carved lazily
    fn new(pool: Pool) -> Result<DetachedBlocks> {
        Ok(DetachedBlocks {
            pool,
            arena: Arena::new(pool),
            head: NIL,
            data_start: pool.capacity(),
        })
    }

    fn pool(&self) -> &Pool {
        &self.pool
    }

    fn allocate(&mut self, size: u32) -> Result<u32> {
        if size == 0 {
            return Err(Error::InvalidSize);
        }
        let size = round_up(size);

        let mut best = NIL;
        let mut best_remain = u32::MAX;
        let mut cur = self.head;
        while cur != NIL {
            let mut node = self.node(cur);
            if node.free == 1 {
                if node.blksize == size {
                    node.free = 0;
                    self.set_node(cur, node);
                    return Ok(node.addr);
                }
                if node.blksize > size && node.blksize - size < best_remain {
                    best_remain = node.blksize - size;
                    best = cur;
                }
            }
            cur = node.next;
        }

        if best != NIL {
            let mut node = self.node(best);
            if best_remain >= BALANCE {
                // split; the remainder keeps its place right after the
                // candidate so the list stays sorted by data offset.
                // With no descriptor left for it, hand the block out
                // unsplit instead.
                if let Ok(rest) = self.arena.acquire(NodeKind::Block, NODE_SIZE, self.data_start)
                {
                    self.set_node(
                        rest,
                        Node {
                            next: node.next,
                            addr: node.addr + size,
                            blksize: best_remain,
                            free: 1,
                        },
                    );
                    node.next = rest;
                    node.blksize = size;
                }
            }
            node.free = 0;
            self.set_node(best, node);
            return Ok(node.addr);
        }

        // nothing on the free list fits; carve fresh capacity from the
        // untouched middle if the record and the data both still fit
        if self.data_start - self.arena.end() > size {
            let limit = self.data_start - size;
            let fresh = self.arena.acquire(NodeKind::Block, NODE_SIZE, limit)?;
            self.data_start -= size;
            // lowest data offset so far, so it becomes the list head
            self.set_node(
                fresh,
                Node {
                    next: self.head,
                    addr: self.data_start,
                    blksize: size,
                    free: 0,
                },
            );
            self.head = fresh;
            return Ok(self.data_start);
        }

        Err(Error::OutOfMemory)
    }

    fn release(&mut self, offset: u32) -> Result<()> {
        let mut prev2 = NIL;
        let mut prev = NIL;
        let mut cur = self.head;
        while cur != NIL {
            let mut node = self.node(cur);
            if node.addr != offset {
                prev2 = prev;
                prev = cur;
                cur = node.next;
                continue;
            }
            if node.free == 1 {
                return Err(Error::InvalidPointer);
            }
            node.free = 1;
            self.set_node(cur, node);

            // merge with the physically preceding record
            if prev != NIL {
                let mut pr = self.node(prev);
                if pr.free == 1 && pr.addr + pr.blksize == node.addr {
                    pr.blksize += node.blksize;
                    pr.next = node.next;
                    self.set_node(prev, pr);
                    self.arena.release(cur)?;
                    cur = prev;
                    node = pr;
                    prev = prev2;
                }
            }
            // then with the physically following one
            if node.next != NIL {
                let follow = node.next;
                let nx = self.node(follow);
                if nx.free == 1 && node.addr + node.blksize == nx.addr {
                    node.blksize += nx.blksize;
                    node.next = nx.next;
                    self.set_node(cur, node);
                    self.arena.release(follow)?;
                }
            }

            // a free block at the low edge of the carved region goes
            // back to the untouched middle, record and all
            if node.addr == self.data_start {
                self.data_start += node.blksize;
                if prev != NIL {
                    let mut pr = self.node(prev);
                    pr.next = node.next;
                    self.set_node(prev, pr);
                } else {
                    self.head = node.next;
                }
                self.arena.release(cur)?;
            }
            return Ok(());
        }
        Err(Error::InvalidPointer)
    }

    /// superblock chain nodes come from the arena, not from user data
    fn acquire_node(&mut self, size: u32) -> Result<u32> {
        self.arena.acquire(NodeKind::Superblock, size, self.data_start)
    }

    fn release_node(&mut self, offset: u32, _size: u32) -> Result<()> {
        self.arena.release(offset)
    }

    /// the carved data region must be exactly tiled by the records, in
    /// ascending offset order starting at `data_start`
    fn check(&self) -> Result<()> {
        let mut expected = self.data_start;
        let mut cur = self.head;
        let mut seen = 0u32;
        while cur != NIL {
            let node = self.node(cur);
            let broken = node.free > 1
                || node.addr != expected
                || node.addr + node.blksize > self.pool.capacity()
                || node.addr < self.data_start;
            if broken {
                log::error!(
                    "block list corrupt: blk:{},blksize:{},blknext:{},free:{}",
                    node.addr,
                    node.blksize,
                    node.next as i32,
                    node.free
                );
                return Err(Error::Corrupted);
            }
            expected = node.addr + node.blksize;
            seen += node.blksize;
            if seen > self.pool.capacity() {
                return Err(Error::Corrupted);
            }
            cur = node.next;
        }
        if expected != self.pool.capacity() {
            log::error!("carved region ends at {} instead of the pool end", expected);
            return Err(Error::Corrupted);
        }
        Ok(())
    }

    fn stats(&self) -> BlockStats {
        let mut stats = BlockStats {
            reserve_bytes: self.data_start - self.arena.end(),
            ..BlockStats::default()
        };
        let mut cur = self.head;
        while cur != NIL {
            let node = self.node(cur);
            stats.nodes += 1;
            if node.free == 1 {
                stats.free_nodes += 1;
                stats.free_bytes += node.blksize;
            } else {
                stats.used_bytes += node.blksize;
            }
            cur = node.next;
        }
        stats
    }

    fn fmt_dump(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "hdr end:{},blk start:{}", self.arena.end(), self.data_start)?;
        self.arena.fmt_dump(f)?;
        writeln!(f, "-----Block Info-----")?;
        let mut cur = self.head;
        while cur != NIL {
            let node = self.node(cur);
            writeln!(
                f,
                "blk:{},blksize:{},blknext:{},free:{}",
                node.addr, node.blksize, node.next as i32, node.free
            )?;
            cur = node.next;
        }
        Ok(())
    }
}
