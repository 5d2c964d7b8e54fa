//! Allocator error type.
//!
//! Runtime allocation failures are represented as `Option` throughout this
//! crate — `alloc`/`free` have no error channel beyond a null return.
//! `SlabError` only covers the one constructive failure this crate can
//! report: a size class whose object size leaves no room for a single
//! object once the slab header and free-index array are accounted for.

use core::fmt;

/// Errors produced while constructing a size-class engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlabError {
    /// `objectSize` is too large to fit even one object in a slab of the
    /// requested order.
    ObjectTooLarge {
        /// The object size that was requested.
        object_size: usize,
        /// The total size of a slab at the requested order.
        slab_size: usize,
    },
}

impl fmt::Display for SlabError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlabError::ObjectTooLarge {
                object_size,
                slab_size,
            } => write!(
                f,
                "object size {object_size} leaves no room for a single object in a {slab_size}-byte slab"
            ),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for SlabError {}

/// Convenience alias for this crate's fallible constructors.
pub type Result<T> = core::result::Result<T, SlabError>;
