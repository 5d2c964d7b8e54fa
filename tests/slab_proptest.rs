//! Property tests for uniqueness (no double dispensing) and round-trip
//! draining to empty under an arbitrary interleaving of allocations and
//! frees.

use core::alloc::Layout;
use core::ptr::NonNull;
use std::collections::HashSet;

use proptest::prelude::*;

use nos_slab_allocator::SlabAllocator;
use nos_slab_allocator::buddy::BuddyPageAllocator;

const SIZES: [usize; 4] = [16, 32, 64, 96];

#[derive(Debug, Clone)]
enum Op {
    Alloc { size_idx: usize },
    FreeOldest,
}

fn ops() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        prop_oneof![
            (0..SIZES.len()).prop_map(|size_idx| Op::Alloc { size_idx }),
            Just(Op::FreeOldest),
        ],
        1..200,
    )
}

fn backing_allocator(max_order: usize) -> BuddyPageAllocator {
    let size = nos_slab_allocator::PAGE << max_order;
    let layout = Layout::from_size_align(size, size).unwrap();
    let raw = unsafe { std::alloc::alloc(layout) };
    let region = NonNull::new(raw).unwrap();
    unsafe { BuddyPageAllocator::new(region, max_order) }
}

proptest! {
    #[test]
    fn no_double_dispensing_and_clean_drain(ops in ops()) {
        let mut dir = SlabAllocator::new(backing_allocator(14)).unwrap();

        let mut live: Vec<(usize, usize)> = Vec::new(); // (address, size_idx)
        let mut seen = HashSet::new();

        for op in ops {
            match op {
                Op::Alloc { size_idx } => {
                    let size = SIZES[size_idx];
                    if let Some(p) = dir.alloc(size) {
                        let addr = p.as_ptr() as usize;
                        prop_assert!(seen.insert(addr), "address {:#x} dispensed while still live", addr);
                        live.push((addr, size_idx));
                    }
                }
                Op::FreeOldest => {
                    if !live.is_empty() {
                        let (addr, _) = live.remove(0);
                        seen.remove(&addr);
                        let p = unsafe { NonNull::new_unchecked(addr as *mut u8) };
                        unsafe { dir.free(Some(p)) };
                    }
                }
            }
        }

        for (addr, _) in live {
            let p = unsafe { NonNull::new_unchecked(addr as *mut u8) };
            unsafe { dir.free(Some(p)) };
        }

        dir.release();
    }
}
