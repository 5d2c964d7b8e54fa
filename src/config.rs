//! Allocator-wide constants.

use static_assertions::const_assert;

/// Size of the buddy allocator's page, in bytes.
pub const PAGE: usize = 4096;

const_assert!(PAGE.is_power_of_two());

/// Default buddy order used for every size class the directory creates.
///
/// A slab at this order is `PAGE * 2^DEFAULT_ORDER` bytes. The directory
/// never forwards a custom order when it creates a `CacheEntry` for a new
/// object size, so every directory-managed engine — including the
/// cache-of-caches bootstrap engine — shares this order. That is what makes
/// the directory's alignment-derived slab lookup O(1): `slab_size` is the
/// same constant for every owned slab.
pub const DEFAULT_ORDER: usize = 1;

/// Size in bytes of a slab created at the given buddy order.
#[inline]
pub const fn slab_size(order: usize) -> usize {
    PAGE << order
}
