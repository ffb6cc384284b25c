//! The persistent hash map and its supporting machinery.
//!
//! This module provides [`HamtMap`], an immutable hash map built on a
//! Hash Array Mapped Trie. All operations return new maps; the versions
//! share unchanged sub-trees, which is what keeps persistent updates cheap.
//!
//! # Structural Sharing
//!
//! ```rust
//! use hamtrie::map::HamtMap;
//!
//! let base: HamtMap<i32, i32> = (0..100).map(|index| (index, index)).collect();
//! let patched = base.insert(50, 999);
//!
//! assert_eq!(base.get(&50), Some(&50));     // Original unchanged
//! assert_eq!(patched.get(&50), Some(&999)); // New version
//! assert_eq!(base.len(), 100);
//! assert_eq!(patched.len(), 100);
//! ```

// =============================================================================
// Reference Counter Type Alias
// =============================================================================

/// Reference-counted smart pointer type.
///
/// When the `arc` feature is enabled, this is `std::sync::Arc`,
/// which is thread-safe but has slightly higher overhead.
///
/// When the `arc` feature is disabled (default), this is `std::rc::Rc`,
/// which is faster but not thread-safe.
#[cfg(feature = "arc")]
pub(crate) type ReferenceCounter<T> = std::sync::Arc<T>;

#[cfg(not(feature = "arc"))]
pub(crate) type ReferenceCounter<T> = std::rc::Rc<T>;

mod hamt;

pub use hamt::HamtMap;
pub use hamt::HamtMapIntoIterator;
pub use hamt::HamtMapIterator;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod reference_counter_tests {
    use super::ReferenceCounter;
    use rstest::rstest;

    #[rstest]
    fn test_reference_counter_shares() {
        let counter: ReferenceCounter<i32> = ReferenceCounter::new(42);
        let clone = counter.clone();
        assert_eq!(*counter, *clone);
        assert_eq!(ReferenceCounter::strong_count(&counter), 2);
        drop(clone);
        assert_eq!(ReferenceCounter::strong_count(&counter), 1);
    }
}
