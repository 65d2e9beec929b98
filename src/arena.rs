//! fixed-size descriptor arena for the detached block layout
//!
//! Descriptors grow upward from the start of the pool while block data
//! is carved downward from the end, so user writes can never reach the
//! bookkeeping:
//!
//! ```text
//! | descriptors | end ---> |   untouched   | <--- data_start | data |
//! ```

use core::fmt;

use crate::pool::Pool;
use crate::types::{round_up, Error, Result, ALIGN, NIL};

/// what a descriptor currently holds
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum NodeKind {
    Free,
    Block,
    Superblock,
}

impl NodeKind {
    fn from_raw(raw: u8) -> Option<NodeKind> {
        match raw {
            0 => Some(NodeKind::Free),
            1 => Some(NodeKind::Block),
            2 => Some(NodeKind::Superblock),
            _ => None,
        }
    }

    fn as_raw(self) -> u8 {
        match self {
            NodeKind::Free => 0,
            NodeKind::Block => 1,
            NodeKind::Superblock => 2,
        }
    }
}

/// prefix stored in front of every descriptor payload
#[derive(Copy, Clone, Debug)]
#[repr(C)]
struct Header {
    next: u32,
    size: u32,
    kind: u8,
    _reserved: [u8; 3],
}

pub(crate) const HEADER_SIZE: u32 = core::mem::size_of::<Header>() as u32;

/// Free-list sub-allocator handing out descriptor payloads from the low
/// end of the pool. First-fit with exact-match preference; freed tail
/// descriptors shrink the region's end cursor back.
pub(crate) struct Arena {
    pool: Pool,
    head: u32,
    end: u32,
}

impl Arena {
    pub fn new(pool: Pool) -> Arena {
        Arena { pool, head: NIL, end: 0 }
    }

    /// current end of the descriptor region
    pub fn end(&self) -> u32 {
        self.end
    }

    fn header(&self, offset: u32) -> Header {
        unsafe { self.pool.read_at(offset) }
    }

    fn set_header(&self, offset: u32, header: Header) {
        unsafe { self.pool.write_at(offset, header) }
    }

    /// Hand out a `size`-byte payload tagged `kind`, reusing a freed
    /// descriptor when one fits and bump-allocating from the region end
    /// otherwise. `limit` is the current start of the data region; the
    /// region never grows across it.
    pub fn acquire(&mut self, kind: NodeKind, size: u32, limit: u32) -> Result<u32> {
        let size = round_up(size);
        let mut prev = NIL;
        let mut cur = self.head;
        while cur != NIL {
            let mut hdr = self.header(cur);
            if NodeKind::from_raw(hdr.kind) == Some(NodeKind::Free) {
                if hdr.size == size {
                    hdr.kind = kind.as_raw();
                    self.set_header(cur, hdr);
                    return Ok(cur + HEADER_SIZE);
                } else if hdr.size >= size + HEADER_SIZE + ALIGN {
                    // split off the tail of this descriptor as a new
                    // free one
                    let rest = cur + HEADER_SIZE + size;
                    self.set_header(
                        rest,
                        Header {
                            next: hdr.next,
                            size: hdr.size - size - HEADER_SIZE,
                            kind: NodeKind::Free.as_raw(),
                            _reserved: [0; 3],
                        },
                    );
                    hdr.next = rest;
                    hdr.size = size;
                    hdr.kind = kind.as_raw();
                    self.set_header(cur, hdr);
                    return Ok(cur + HEADER_SIZE);
                } else if hdr.size > size {
                    // too small to split; hand it out oversized, the
                    // recorded size keeps release exact
                    hdr.kind = kind.as_raw();
                    self.set_header(cur, hdr);
                    return Ok(cur + HEADER_SIZE);
                }
            }
            prev = cur;
            cur = hdr.next;
        }

        if self.end + HEADER_SIZE + size <= limit {
            let fresh = self.end;
            self.set_header(
                fresh,
                Header {
                    next: NIL,
                    size,
                    kind: kind.as_raw(),
                    _reserved: [0; 3],
                },
            );
            if prev != NIL {
                let mut hdr = self.header(prev);
                hdr.next = fresh;
                self.set_header(prev, hdr);
            } else {
                self.head = fresh;
            }
            self.end += HEADER_SIZE + size;
            return Ok(fresh + HEADER_SIZE);
        }

        Err(Error::OutOfDescriptorSpace)
    }

    /// Return a payload. Coalesces with free neighbors and, when the
    /// result is the region tail, shrinks the end cursor back.
    pub fn release(&mut self, payload: u32) -> Result<()> {
        let mut prev2 = NIL;
        let mut prev = NIL;
        let mut cur = self.head;
        while cur != NIL {
            let mut hdr = self.header(cur);
            if cur + HEADER_SIZE != payload {
                prev2 = prev;
                prev = cur;
                cur = hdr.next;
                continue;
            }

            match NodeKind::from_raw(hdr.kind) {
                Some(NodeKind::Free) => return Err(Error::InvalidPointer),
                Some(_) => {}
                None => {
                    log::error!("descriptor {} has unknown kind {}", cur, hdr.kind);
                    return Err(Error::Corrupted);
                }
            }
            hdr.kind = NodeKind::Free.as_raw();
            self.set_header(cur, hdr);

            if prev != NIL {
                let mut ph = self.header(prev);
                if NodeKind::from_raw(ph.kind) == Some(NodeKind::Free) {
                    ph.next = hdr.next;
                    ph.size += hdr.size + HEADER_SIZE;
                    self.set_header(prev, ph);
                    cur = prev;
                    hdr = ph;
                    prev = prev2;
                }
            }
            if hdr.next != NIL {
                let nh = self.header(hdr.next);
                if NodeKind::from_raw(nh.kind) == Some(NodeKind::Free) {
                    hdr.size += nh.size + HEADER_SIZE;
                    hdr.next = nh.next;
                    self.set_header(cur, hdr);
                }
            }

            if cur + HEADER_SIZE + hdr.size == self.end {
                self.end = cur;
                if prev != NIL {
                    let mut ph = self.header(prev);
                    ph.next = NIL;
                    self.set_header(prev, ph);
                } else {
                    self.head = NIL;
                }
            }
            return Ok(());
        }

        log::error!("released descriptor payload {} is not in the arena", payload);
        Err(Error::Corrupted)
    }

    pub fn fmt_dump(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "-----Descriptor Info-----")?;
        let mut cur = self.head;
        while cur != NIL {
            let hdr = self.header(cur);
            writeln!(
                f,
                "hdr:{},hdrsize:{},hdrnext:{},kind:{}",
                cur, hdr.size, hdr.next as i32, hdr.kind
            )?;
            cur = hdr.next;
        }
        writeln!(f, "hdr end:{}", self.end)
    }
}
