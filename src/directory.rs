//! The size-class directory: maps an object size to the engine serving it,
//! bootstrapping its own directory-entry storage from a self-hosted engine.

extern crate alloc;

use alloc::boxed::Box;
use core::mem::size_of;
use core::ptr::NonNull;

use crate::buddy::PageSource;
use crate::config::DEFAULT_ORDER;
use crate::error::Result;
use crate::slab::{self, CacheEntry};

/// Maps requested object sizes to the `CacheEntry` that serves them.
///
/// Every engine this directory creates — including the bootstrap
/// cache-of-caches — runs at `DEFAULT_ORDER`, which is what lets `free`
/// locate the owning engine in O(1) by masking the pointer rather than
/// walking every cache's slab lists.
pub struct SlabAllocator<P: PageSource> {
    pages: P,
    all_caches: Option<NonNull<CacheEntry>>,
    /// Boxed so its address is stable no matter where the `SlabAllocator`
    /// value itself ends up — every slab `cache_of_caches` creates stores
    /// a raw back-pointer to it.
    cache_of_caches: Box<CacheEntry>,
}

// Holds only raw pointers into memory this allocator exclusively owns; it
// carries no thread-safety of its own, but a caller that wraps it in its own
// lock is free to move it between threads one at a time.
unsafe impl<P: PageSource + Send> Send for SlabAllocator<P> {}

impl<P: PageSource> SlabAllocator<P> {
    /// Initializes a directory over `pages`. `cache_of_caches` is sized to
    /// hold exactly one `CacheEntry` record per object.
    pub fn new(pages: P) -> Result<Self> {
        let cache_of_caches = CacheEntry::try_new(size_of::<CacheEntry>(), DEFAULT_ORDER)?;
        Ok(Self {
            pages,
            all_caches: None,
            cache_of_caches: Box::new(cache_of_caches),
        })
    }

    /// Locates or creates the engine for `object_size` and delegates to its
    /// `alloc()`. Returns `None` if a new slab is needed and the page
    /// source refuses it.
    pub fn alloc(&mut self, object_size: usize) -> Option<NonNull<u8>> {
        let mut cache = self.find_cache(object_size).or_else(|| self.create_cache(object_size))?;
        unsafe { cache.as_mut().alloc(&mut self.pages) }
    }

    /// Finds the owning engine by masking `ptr` to its slab's base address
    /// and reading the slab header's `owner` back-pointer, then delegates
    /// to that engine's `free()`. A no-op if `ptr` is `None`.
    ///
    /// # Safety
    /// `ptr`, if present, must have been returned by a previous `alloc()` on
    /// this same directory and must not already have been freed.
    pub unsafe fn free(&mut self, ptr: Option<NonNull<u8>>) {
        let Some(ptr) = ptr else { return };

        let mut owner = unsafe { slab::owner_of(ptr, DEFAULT_ORDER) };
        unsafe { owner.as_mut().free(Some(ptr)) };
    }

    /// Releases every slab in every size class, then the cache-of-caches
    /// itself last. After this call the directory is back to its
    /// post-`new` state.
    pub fn release(&mut self) {
        while let Some(mut cache) = self.all_caches {
            self.all_caches = unsafe { cache.as_ref().next };
            unsafe { cache.as_mut().release(&mut self.pages) };
        }
        self.cache_of_caches.release(&mut self.pages);
    }

    /// Returns every free slab across every size class back to the page
    /// source (not the cache-of-caches, which only ever releases alongside
    /// every other engine in `release()`). A directory-wide generalization
    /// of `CacheEntry::shrink()`.
    pub fn shrink_all(&mut self) {
        let mut cache = self.all_caches;
        while let Some(mut c) = cache {
            unsafe {
                c.as_mut().shrink(&mut self.pages);
                cache = c.as_ref().next;
            }
        }
    }

    fn find_cache(&self, object_size: usize) -> Option<NonNull<CacheEntry>> {
        let mut cursor = self.all_caches;
        while let Some(cache) = cursor {
            let entry = unsafe { cache.as_ref() };
            if entry.object_size() == object_size {
                return Some(cache);
            }
            cursor = entry.next;
        }
        None
    }

    fn create_cache(&mut self, object_size: usize) -> Option<NonNull<CacheEntry>> {
        let slot = self.cache_of_caches.alloc(&mut self.pages)?;
        let mut entry_ptr = slot.cast::<CacheEntry>();

        let entry = CacheEntry::try_new(object_size, DEFAULT_ORDER).ok().or_else(|| {
            // Too large for a slab at this order: give the record back to
            // the cache-of-caches and report failure to the caller.
            unsafe { self.cache_of_caches.free(Some(slot)) };
            None
        })?;

        unsafe {
            entry_ptr.as_ptr().write(entry);
            entry_ptr.as_mut().next = self.all_caches;
        }
        self.all_caches = Some(entry_ptr);

        #[cfg(feature = "log")]
        log::debug!("directory: registered new size class for {object_size} bytes");

        Some(entry_ptr)
    }
}
