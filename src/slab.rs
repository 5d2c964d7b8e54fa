//! The size-class engine: owns every slab backing one fixed object size.

use core::mem::{align_of, size_of};
use core::ptr::NonNull;

use crate::buddy::PageSource;
use crate::config::{self, DEFAULT_ORDER};
use crate::error::{Result, SlabError};

/// Which of a `CacheEntry`'s three lists a slab currently belongs to.
///
/// Tracked explicitly on the slab itself rather than inferred from which
/// head pointer references it, so an unlink always knows which list head to
/// patch regardless of what the caller believes the slab's membership to be
/// — this matters for a slab whose capacity is exactly one object, which
/// becomes full on the very same dispense that makes it partial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlabState {
    Free,
    Partial,
    Full,
}

/// Header placed at the base of every slab, immediately followed by the
/// free-index array and then the object area.
#[repr(C)]
struct SlabHeader {
    objects_ptr: NonNull<u8>,
    free_objects: NonNull<usize>,
    free_object_index: usize,
    objects_in_use: usize,
    next_slab: Option<NonNull<SlabHeader>>,
    prev_slab: Option<NonNull<SlabHeader>>,
    owner: NonNull<CacheEntry>,
    state: SlabState,
}

impl SlabHeader {
    /// Index array entry for slot `i`.
    unsafe fn free_entry(&self, i: usize) -> usize {
        unsafe { *self.free_objects.as_ptr().add(i) }
    }

    unsafe fn set_free_entry(&mut self, i: usize, value: usize) {
        unsafe { *self.free_objects.as_ptr().add(i) = value };
    }

    /// Address of slot `i` in the object area.
    unsafe fn slot_addr(&self, i: usize, object_size: usize) -> *mut u8 {
        unsafe { self.objects_ptr.as_ptr().add(i * object_size) }
    }
}

/// The size-class engine. Owns every slab backing allocations of
/// `object_size` bytes and dispenses/reclaims object slots.
///
/// `CacheEntry` does not itself hold a `PageSource` — every operation that
/// needs to create or destroy a slab takes one as an argument, so the
/// directory (`SlabAllocator`) can own a single page allocator shared by
/// every engine, including the bootstrap cache-of-caches.
///
/// Every slab this engine creates stores a raw back-pointer to the engine
/// itself in its header's `owner` field. Once `alloc` has created at least
/// one slab, `self` must not move — a caller that needs a movable engine
/// (the directory's `cache_of_caches`, for instance) must pin it behind a
/// stable address, e.g. `alloc::boxed::Box`.
pub struct CacheEntry {
    object_size: usize,
    cache_order: usize,
    objects_in_slab: usize,
    slabs_free: Option<NonNull<SlabHeader>>,
    slabs_partial: Option<NonNull<SlabHeader>>,
    slabs_full: Option<NonNull<SlabHeader>>,
    /// Intrusive link into the directory's `allCaches` chain. Unused by
    /// engines created outside a directory.
    pub(crate) next: Option<NonNull<CacheEntry>>,
}

// Holds only raw pointers into slab memory this engine exclusively owns; it
// carries no thread-safety of its own, but a caller that wraps it in its own
// lock is free to move it between threads one at a time.
unsafe impl Send for CacheEntry {}

const HEADER_SIZE: usize = size_of::<SlabHeader>();
const INDEX_ENTRY_SIZE: usize = size_of::<usize>();

// `free_objects` is placed directly at `HEADER_SIZE` with no further
// alignment fixup (`create_slab`); this only holds because every
// `SlabHeader` field is itself word-sized.
static_assertions::const_assert_eq!(HEADER_SIZE % INDEX_ENTRY_SIZE, 0);

impl CacheEntry {
    /// Computes `objectsInSlab` for `object_size` at `cache_order` without
    /// constructing an engine. Used by both `try_new` and callers that want
    /// to know slab capacity ahead of time (tests, e.g.).
    pub fn objects_in_slab_for(object_size: usize, cache_order: usize) -> usize {
        let slab_size = config::slab_size(cache_order);
        let available = slab_size.saturating_sub(HEADER_SIZE);
        available / (INDEX_ENTRY_SIZE + object_size)
    }

    /// Builds a new, empty engine for `object_size` at `cache_order`.
    ///
    /// Fails only if the resulting `objectsInSlab` would be zero —
    /// `object_size` (plus per-slot bookkeeping) doesn't fit even once in a
    /// slab of this order.
    pub fn try_new(object_size: usize, cache_order: usize) -> Result<Self> {
        let objects_in_slab = Self::objects_in_slab_for(object_size, cache_order);
        if objects_in_slab == 0 {
            return Err(SlabError::ObjectTooLarge {
                object_size,
                slab_size: config::slab_size(cache_order),
            });
        }

        Ok(Self {
            object_size,
            cache_order,
            objects_in_slab,
            slabs_free: None,
            slabs_partial: None,
            slabs_full: None,
            next: None,
        })
    }

    /// Builds a new, empty engine for `object_size` at the crate's default
    /// order.
    pub fn try_new_default(object_size: usize) -> Result<Self> {
        Self::try_new(object_size, DEFAULT_ORDER)
    }

    /// The fixed object size this engine serves.
    pub fn object_size(&self) -> usize {
        self.object_size
    }

    /// The buddy order backing every slab this engine owns.
    pub fn cache_order(&self) -> usize {
        self.cache_order
    }

    /// Number of object slots in each of this engine's slabs.
    pub fn objects_in_slab(&self) -> usize {
        self.objects_in_slab
    }

    fn slab_size(&self) -> usize {
        config::slab_size(self.cache_order)
    }

    /// Returns the address of a free slot, or `None` if the underlying page
    /// source refuses a new slab.
    pub fn alloc<P: PageSource>(&mut self, pages: &mut P) -> Option<NonNull<u8>> {
        let (mut slab, came_from_free) = if let Some(slab) = self.slabs_partial {
            (slab, false)
        } else if let Some(slab) = self.slabs_free {
            (slab, true)
        } else {
            let slab = self.create_slab(pages)?;
            self.push_front(slab, SlabState::Free);
            (slab, true)
        };

        let (ptr, now_full) = unsafe {
            let header = slab.as_mut();
            let ptr = header.slot_addr(header.free_object_index, self.object_size);
            header.free_object_index = header.free_entry(header.free_object_index);
            header.objects_in_use += 1;
            (ptr, header.objects_in_use == self.objects_in_slab)
        };

        if came_from_free {
            self.relink(slab, SlabState::Partial);
        }
        if now_full {
            self.relink(slab, SlabState::Full);
        }

        #[cfg(feature = "log")]
        log::trace!(
            "cache(object_size={}): dispensed slot at {:#x}",
            self.object_size,
            ptr as usize
        );

        Some(unsafe { NonNull::new_unchecked(ptr) })
    }

    /// Reclaims the slot at `ptr`, previously returned by `alloc`. A no-op
    /// if `ptr` is `None`.
    ///
    /// Also a no-op on a pointer that isn't aligned to a slot boundary
    /// within its slab — validated *before* any state is mutated, so a
    /// misaligned pointer leaves every counter and list exactly as it was.
    ///
    /// # Safety
    /// `ptr`, if present, must have been returned by a previous `alloc()` on
    /// this same engine and must not already have been freed.
    pub unsafe fn free(&mut self, ptr: Option<NonNull<u8>>) {
        let Some(ptr) = ptr else { return };

        let slab_mask = !(self.slab_size() - 1);
        let slab_base = (ptr.as_ptr() as usize) & slab_mask;
        let mut slab = unsafe { NonNull::new_unchecked(slab_base as *mut SlabHeader) };

        let header = unsafe { slab.as_ref() };
        let offset = ptr.as_ptr() as usize - header.objects_ptr.as_ptr() as usize;
        let i = offset / self.object_size;
        let aligned = unsafe { header.slot_addr(i, self.object_size) } == ptr.as_ptr();
        if !aligned {
            #[cfg(feature = "log")]
            log::warn!(
                "cache(object_size={}): rejected misaligned free at {:#x}",
                self.object_size,
                ptr.as_ptr() as usize
            );
            return;
        }

        let was_full = unsafe { slab.as_ref().objects_in_use == self.objects_in_slab };

        unsafe {
            let header = slab.as_mut();
            header.set_free_entry(i, header.free_object_index);
            header.free_object_index = i;
            header.objects_in_use -= 1;
        }

        let now_empty = unsafe { slab.as_ref().objects_in_use == 0 };

        if was_full {
            self.relink(slab, SlabState::Partial);
        }
        if now_empty {
            self.relink(slab, SlabState::Free);
        }
    }

    /// Releases every slab currently in `slabsFree` back to the page
    /// source. Leaves `slabsPartial` and `slabsFull` untouched.
    pub fn shrink<P: PageSource>(&mut self, pages: &mut P) {
        while let Some(slab) = self.slabs_free {
            self.unlink(slab);
            self.destroy_slab(slab, pages);
        }
    }

    /// Releases every slab this engine owns. After this call the engine is
    /// equivalent to a freshly-`try_new`'d one.
    pub fn release<P: PageSource>(&mut self, pages: &mut P) {
        for list in [
            &mut self.slabs_free,
            &mut self.slabs_partial,
            &mut self.slabs_full,
        ] {
            while let Some(slab) = *list {
                *list = unsafe { slab.as_ref().next_slab };
                unsafe {
                    pages.free_pages(slab.cast::<u8>(), self.cache_order);
                }
                #[cfg(feature = "log")]
                log::trace!(
                    "cache(object_size={}): released slab at {:#x}",
                    self.object_size,
                    slab.as_ptr() as usize
                );
            }
        }
    }

    fn create_slab<P: PageSource>(&mut self, pages: &mut P) -> Option<NonNull<SlabHeader>> {
        let block = pages.alloc_pages(self.cache_order)?;
        let header_ptr = block.cast::<SlabHeader>();

        let free_objects = unsafe {
            NonNull::new_unchecked(block.as_ptr().add(HEADER_SIZE) as *mut usize)
        };
        let objects_offset = {
            let raw = HEADER_SIZE + self.objects_in_slab * INDEX_ENTRY_SIZE;
            (raw + align_of::<usize>() - 1) & !(align_of::<usize>() - 1)
        };
        let objects_ptr =
            unsafe { NonNull::new_unchecked(block.as_ptr().add(objects_offset)) };

        let this = NonNull::from(&mut *self);

        unsafe {
            header_ptr.as_ptr().write(SlabHeader {
                objects_ptr,
                free_objects,
                free_object_index: 0,
                objects_in_use: 0,
                next_slab: None,
                prev_slab: None,
                owner: this,
                state: SlabState::Free,
            });

            // Entry `objects_in_slab - 1` chains to `objects_in_slab` itself —
            // one past the last valid index, the free chain's terminal
            // sentinel. Nothing ever reads it back: a slab only reaches
            // `free_object_index == objects_in_slab` the instant its last
            // slot is dispensed, and `alloc` relinks it out of
            // `slabs_partial`/`slabs_free` in that same call before any
            // further alloc could walk the chain again.
            for i in 0..self.objects_in_slab {
                *free_objects.as_ptr().add(i) = i + 1;
            }
        }

        #[cfg(feature = "log")]
        log::trace!(
            "cache(object_size={}): created slab at {:#x} ({} objects)",
            self.object_size,
            block.as_ptr() as usize,
            self.objects_in_slab
        );

        Some(header_ptr)
    }

    fn destroy_slab<P: PageSource>(&mut self, slab: NonNull<SlabHeader>, pages: &mut P) {
        unsafe {
            pages.free_pages(slab.cast::<u8>(), self.cache_order);
        }
    }

    fn list_head(&mut self, state: SlabState) -> &mut Option<NonNull<SlabHeader>> {
        match state {
            SlabState::Free => &mut self.slabs_free,
            SlabState::Partial => &mut self.slabs_partial,
            SlabState::Full => &mut self.slabs_full,
        }
    }

    fn push_front(&mut self, mut slab: NonNull<SlabHeader>, state: SlabState) {
        let head = *self.list_head(state);
        unsafe {
            slab.as_mut().next_slab = head;
            slab.as_mut().prev_slab = None;
            slab.as_mut().state = state;
        }
        if let Some(mut old_head) = head {
            unsafe { old_head.as_mut().prev_slab = Some(slab) };
        }
        *self.list_head(state) = Some(slab);
    }

    /// Unlinks `slab` from whichever list its own `state` says it's in,
    /// using its own `prev`/`next` pointers — correct regardless of which
    /// list a caller believes the slab belongs to.
    fn unlink(&mut self, slab: NonNull<SlabHeader>) {
        let (state, prev, next) =
            unsafe { (slab.as_ref().state, slab.as_ref().prev_slab, slab.as_ref().next_slab) };

        match prev {
            Some(mut p) => unsafe { p.as_mut().next_slab = next },
            None => *self.list_head(state) = next,
        }
        if let Some(mut n) = next {
            unsafe { n.as_mut().prev_slab = prev };
        }
    }

    fn relink(&mut self, slab: NonNull<SlabHeader>, to: SlabState) {
        self.unlink(slab);
        self.push_front(slab, to);
    }
}

/// Returns the engine that owns the slab containing `ptr`, given a slab
/// size shared by every engine the caller manages.
///
/// Every slab is aligned to `order`'s slab size, so masking `ptr` finds the
/// slab base in one step, and the header's `owner` back-pointer is read
/// directly — an O(1) alternative to scanning every engine's slab lists
/// looking for one that contains `ptr`.
///
/// # Safety
/// `ptr` must point somewhere inside a slab previously created at `order`
/// by a `CacheEntry` reachable through the same allocator — this is a
/// precondition on the directory, not something this function can check. An
/// unknown pointer is undefined behavior, not a value this function
/// validates.
pub(crate) unsafe fn owner_of(ptr: NonNull<u8>, order: usize) -> NonNull<CacheEntry> {
    let mask = !(config::slab_size(order) - 1);
    let slab_base = (ptr.as_ptr() as usize) & mask;
    unsafe { (*(slab_base as *const SlabHeader)).owner }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buddy::BuddyPageAllocator;
    use core::alloc::Layout;

    fn page_source(max_order: usize) -> BuddyPageAllocator {
        let size = config::slab_size(max_order);
        let layout = Layout::from_size_align(size, size).unwrap();
        let ptr = unsafe { alloc::alloc::alloc(layout) };
        let region = NonNull::new(ptr).unwrap();
        unsafe { BuddyPageAllocator::new(region, max_order) }
    }

    #[test]
    fn alloc_then_free_drains_to_zero() {
        let mut pages = page_source(6);
        let mut cache = CacheEntry::try_new(64, DEFAULT_ORDER).unwrap();

        let p = cache.alloc(&mut pages).expect("alloc");
        unsafe { cache.free(Some(p)) };

        assert!(cache.slabs_free.is_some());
        assert!(cache.slabs_partial.is_none());
        assert!(cache.slabs_full.is_none());
    }

    #[test]
    fn free_of_none_is_a_no_op() {
        let mut pages = page_source(6);
        let mut cache = CacheEntry::try_new(64, DEFAULT_ORDER).unwrap();

        let p = cache.alloc(&mut pages).expect("alloc");
        unsafe { cache.free(None) };

        assert!(cache.slabs_partial.is_some());
        unsafe { cache.free(Some(p)) };
    }

    #[test]
    fn fill_then_drain_transitions_lists() {
        let mut pages = page_source(6);
        let mut cache = CacheEntry::try_new(128, DEFAULT_ORDER).unwrap();
        let n = cache.objects_in_slab();
        assert!(n > 1, "test assumes a multi-object slab");

        let mut ptrs = alloc::vec::Vec::new();
        for _ in 0..n {
            ptrs.push(cache.alloc(&mut pages).unwrap());
        }
        assert!(cache.slabs_full.is_some());
        assert!(cache.slabs_partial.is_none());
        assert!(cache.slabs_free.is_none());

        // One more alloc must create a second slab.
        let extra = cache.alloc(&mut pages);
        assert!(extra.is_some());
        assert!(cache.slabs_partial.is_some());
        unsafe { cache.free(extra) };
        assert!(cache.slabs_free.is_some());

        for p in ptrs.into_iter().rev() {
            unsafe { cache.free(Some(p)) };
        }
        assert!(cache.slabs_full.is_none());
    }

    #[test]
    fn misaligned_free_is_ignored() {
        let mut pages = page_source(6);
        let mut cache = CacheEntry::try_new(48, DEFAULT_ORDER).unwrap();

        let p = cache.alloc(&mut pages).unwrap();
        let q = cache.alloc(&mut pages).unwrap();

        let bogus = unsafe { NonNull::new_unchecked(p.as_ptr().add(1)) };
        unsafe { cache.free(Some(bogus)) };

        unsafe {
            cache.free(Some(p));
            cache.free(Some(q));
        }

        assert!(cache.slabs_free.is_some());
        assert!(cache.slabs_partial.is_none());
    }

    #[test]
    fn capacity_one_preserves_list_partition() {
        // An object large enough that exactly one fits per slab exercises
        // the list-state handling at the boundary where a slab becomes
        // full on the same dispense that makes it partial.
        let order = DEFAULT_ORDER;
        let slab_size = config::slab_size(order);
        let object_size = slab_size - HEADER_SIZE - INDEX_ENTRY_SIZE - 8;
        let mut cache = CacheEntry::try_new(object_size, order).unwrap();
        assert_eq!(cache.objects_in_slab(), 1);

        let mut pages = page_source(order + 2);
        let p = cache.alloc(&mut pages).unwrap();
        assert!(cache.slabs_full.is_some());
        assert!(cache.slabs_partial.is_none());

        unsafe { cache.free(Some(p)) };
        assert!(cache.slabs_free.is_some());
        assert!(cache.slabs_full.is_none());
    }
}
