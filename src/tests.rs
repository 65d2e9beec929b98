//! whole-allocator tests exercised against both block layouts

use core::ptr::NonNull;
use core::{ptr, slice};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::block::BlockAllocator;
use crate::pool::test_pool;
use crate::superblock::SizeClasses;
use crate::types::{Error, CLASS_SEED_BLOCKS, MAX_META_SIZE};
use crate::{DetachedBlocks, EmbeddedBlocks, Xmem};

fn fresh<A: BlockAllocator>(capacity: u32) -> Xmem<A> {
    Xmem::new(test_pool(capacity)).unwrap()
}

fn fill(ptr: NonNull<u8>, size: usize, byte: u8) {
    unsafe { ptr::write_bytes(ptr.as_ptr(), byte, size) }
}

fn assert_filled(ptr: NonNull<u8>, size: usize, byte: u8) {
    let data = unsafe { slice::from_raw_parts(ptr.as_ptr(), size) };
    assert!(data.iter().all(|&b| b == byte), "block contents clobbered");
}

/// the classic bring-up sequence: one request into each size class,
/// each block written in full, released in reverse order
fn scenario_small_sizes<A: BlockAllocator>() {
    let mut mem: Xmem<A> = fresh(8192);
    let baseline = mem.blocks().stats();

    let sizes = [1usize, 5, 9, 17];
    let mut held = Vec::new();
    for (i, &size) in sizes.iter().enumerate() {
        let class = SizeClasses::class_for(size as u32).unwrap();
        let nfree_before = mem.classes().head(class).1;
        let ptr = mem.allocate(size).unwrap();
        assert_eq!(mem.classes().head(class).1, nfree_before - 1);
        fill(ptr, size, i as u8 + 1);
        held.push((ptr, size, i as u8 + 1));
    }

    // none of the sub-blocks may alias
    for (i, &(p, size, _)) in held.iter().enumerate() {
        for &(q, qsize, _) in &held[i + 1..] {
            let (a, b) = (p.as_ptr() as usize, q.as_ptr() as usize);
            assert!(a + size <= b || b + qsize <= a);
        }
    }

    // all metadata-sized, so the block layer never moved
    assert_eq!(mem.blocks().stats(), baseline);

    // free the 5-byte block and take another 17-byte one; the freed
    // sub-block's class is untouched, the 17-byte class loses one more
    let (five, _, _) = held.remove(1);
    mem.release(five).unwrap();
    let seventeen = mem.allocate(17).unwrap();
    held.push((seventeen, 17, 9));
    fill(seventeen, 17, 9);

    for &(ptr, size, byte) in held.iter().rev() {
        assert_filled(ptr, size, byte);
        mem.release(ptr).unwrap();
    }
    assert_eq!(mem.blocks().stats(), baseline);
    mem.blocks().check().unwrap();
}

#[test]
fn test_small_sizes_embedded() {
    scenario_small_sizes::<EmbeddedBlocks>();
}

#[test]
fn test_small_sizes_detached() {
    scenario_small_sizes::<DetachedBlocks>();
}

fn scenario_large_blocks<A: BlockAllocator>() {
    let mut mem: Xmem<A> = fresh(8192);
    let baseline = mem.blocks().stats();

    let a = mem.allocate(MAX_META_SIZE as usize + 1).unwrap();
    let b = mem.allocate(500).unwrap();
    assert!(mem.blocks().stats().used_bytes > baseline.used_bytes);
    fill(a, MAX_META_SIZE as usize + 1, 0xa5);
    fill(b, 500, 0x5a);

    mem.release(a).unwrap();
    assert_filled(b, 500, 0x5a);
    mem.release(b).unwrap();
    assert_eq!(mem.blocks().stats(), baseline);
}

#[test]
fn test_large_blocks_embedded() {
    scenario_large_blocks::<EmbeddedBlocks>();
}

#[test]
fn test_large_blocks_detached() {
    scenario_large_blocks::<DetachedBlocks>();
}

fn scenario_class_exhaustion_grows<A: BlockAllocator>() {
    let mut mem: Xmem<A> = fresh(8192);
    let baseline = mem.blocks().stats();
    let seed = CLASS_SEED_BLOCKS[0] as usize;

    let mut held = Vec::new();
    for _ in 0..seed + 1 {
        held.push(mem.allocate(1).unwrap());
    }
    assert_eq!(mem.classes().chain_len(mem.pool(), 0), 2);

    for ptr in held.drain(..) {
        mem.release(ptr).unwrap();
    }
    // the grown superblock drained and went back to the block layer;
    // the seed head stays even when empty
    assert_eq!(mem.classes().chain_len(mem.pool(), 0), 1);
    assert_eq!(mem.blocks().stats(), baseline);
}

#[test]
fn test_class_exhaustion_grows_embedded() {
    scenario_class_exhaustion_grows::<EmbeddedBlocks>();
}

#[test]
fn test_class_exhaustion_grows_detached() {
    scenario_class_exhaustion_grows::<DetachedBlocks>();
}

fn scenario_invalid_requests<A: BlockAllocator>() {
    let mut mem: Xmem<A> = fresh(4096);

    assert!(matches!(mem.allocate(0), Err(Error::InvalidSize)));
    assert!(matches!(mem.allocate(1 << 20), Err(Error::OutOfMemory)));

    let ptr = mem.allocate(100).unwrap();
    mem.release(ptr).unwrap();
    let err = mem.release(ptr).unwrap_err();
    assert!(err.is_fatal());

    let mut outside = [0u8; 8];
    let foreign = NonNull::new(outside.as_mut_ptr()).unwrap();
    assert!(matches!(mem.release(foreign), Err(Error::InvalidPointer)));

    let small = mem.allocate(8).unwrap();
    mem.release(small).unwrap();
    assert!(matches!(mem.release(small), Err(Error::InvalidPointer)));
}

#[test]
fn test_invalid_requests_embedded() {
    scenario_invalid_requests::<EmbeddedBlocks>();
}

#[test]
fn test_invalid_requests_detached() {
    scenario_invalid_requests::<DetachedBlocks>();
}

fn scenario_dump<A: BlockAllocator>() {
    let mut mem: Xmem<A> = fresh(4096);
    let a = mem.allocate(100).unwrap();
    let b = mem.allocate(8).unwrap();

    let first = format!("{}", mem.dump());
    let second = format!("{}", mem.dump());
    assert_eq!(first, second, "dump must not disturb allocator state");
    assert!(first.contains("Block Info"));
    assert!(first.contains("SuperBlock Info"));

    mem.release(a).unwrap();
    mem.release(b).unwrap();
}

#[test]
fn test_dump_embedded() {
    scenario_dump::<EmbeddedBlocks>();
}

#[test]
fn test_dump_detached() {
    scenario_dump::<DetachedBlocks>();
}

/// Random allocate/release churn with content verification. Every held
/// block carries a fill byte; a clobbered byte means two allocations
/// overlapped or bookkeeping wrote into block data.
fn scenario_stress<A: BlockAllocator>(seed: u64) {
    let mut mem: Xmem<A> = fresh(16 * 1024);
    let baseline = mem.blocks().stats();
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut held: Vec<(NonNull<u8>, usize, u8)> = Vec::new();

    for round in 0..10_000u32 {
        let full = held.len() >= 64;
        if held.is_empty() || (!full && rng.gen_bool(0.55)) {
            let size = rng.gen_range(1..=256usize);
            match mem.allocate(size) {
                Ok(ptr) => {
                    let byte = (round % 251) as u8 + 1;
                    fill(ptr, size, byte);
                    held.push((ptr, size, byte));
                }
                Err(err) => assert!(!err.is_fatal(), "round {}: {}", round, err),
            }
        } else {
            let (ptr, size, byte) = held.swap_remove(rng.gen_range(0..held.len()));
            assert_filled(ptr, size, byte);
            mem.release(ptr).unwrap();
        }

        if round % 1000 == 0 {
            mem.blocks().check().unwrap();
            for &(ptr, size, byte) in &held {
                assert_filled(ptr, size, byte);
            }
        }
    }

    for (ptr, size, byte) in held.drain(..) {
        assert_filled(ptr, size, byte);
        mem.release(ptr).unwrap();
    }
    mem.blocks().check().unwrap();
    assert_eq!(mem.blocks().stats(), baseline);
}

#[test]
fn test_stress_embedded() {
    scenario_stress::<EmbeddedBlocks>(0x5eed);
}

#[test]
fn test_stress_detached() {
    scenario_stress::<DetachedBlocks>(0x5eed);
}

#[test]
fn test_locked_wrapper() {
    use crate::LockedXmem;

    let mem: LockedXmem = LockedXmem::new();
    assert!(mem.allocate(8).is_none());

    mem.init(test_pool(4096)).unwrap();
    mem.init(test_pool(4096)).unwrap(); // second init is a no-op

    assert!(mem.allocate(0).is_none());
    let ptr = mem.allocate(100).unwrap();
    fill(ptr, 100, 0x42);
    assert_filled(ptr, 100, 0x42);
    mem.release(ptr).unwrap();

    let mut out = String::new();
    mem.dump_into(&mut out).unwrap();
    assert!(out.contains("Block Info"));
}
