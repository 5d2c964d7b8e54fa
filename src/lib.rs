//! NOS Slab Allocator
//!
//! A fixed-object-size memory allocator layered on a page-granular buddy
//! allocator. A [`SlabAllocator`] maps a requested object size to a
//! [`CacheEntry`] — the size-class engine that owns an arbitrary number of
//! slabs serving that one size, tracking free slots with a free list
//! embedded directly in each slab.
//!
//! This crate is single-threaded by design: no lock is taken anywhere in
//! the core. A caller that shares a [`SlabAllocator`] across threads must
//! provide its own synchronization at the call site rather than relying on
//! one baked in here.

#![no_std]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

pub mod buddy;
pub mod config;
pub mod directory;
pub mod error;
pub mod slab;

pub use buddy::{BuddyPageAllocator, PageSource};
pub use config::{DEFAULT_ORDER, PAGE};
pub use directory::SlabAllocator;
pub use error::{Result, SlabError};
pub use slab::CacheEntry;
