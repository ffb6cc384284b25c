//! # hamtrie
//!
//! A persistent (immutable) hash map for Rust, implemented as a
//! Hash Array Mapped Trie (HAMT) with full structural sharing.
//!
//! ## Overview
//!
//! The central type is [`map::HamtMap`], an immutable associative container.
//! Every "mutating" operation returns a new map and leaves its input
//! untouched; the old and new versions share all unchanged sub-trees, so an
//! update copies at most one 32-slot array per trie level.
//!
//! - O(log32 N) `get`, `insert`, `remove` (effectively constant in practice)
//! - O(1) `len` and `is_empty`
//! - Whole-map operations: `union_with`, `filter`, folds, `map_values`,
//!   `traverse_with_key`
//! - Hash collisions degrade gracefully into per-hash collision lists
//!
//! The crate also carries a compact [`typeclass`] module (Semigroup, Monoid,
//! Functor, Foldable over a GAT-based type-constructor encoding) so the map
//! can participate in generic functional code.
//!
//! ## Feature Flags
//!
//! - `arc`: share nodes with `Arc` instead of `Rc` (thread-safe readers)
//! - `serde`: `Serialize`/`Deserialize` implementations for the map
//!
//! ## Example
//!
//! ```rust
//! use hamtrie::map::HamtMap;
//!
//! let map = HamtMap::new()
//!     .insert("one".to_string(), 1)
//!     .insert("two".to_string(), 2);
//!
//! let updated = map.insert("one".to_string(), 100);
//! assert_eq!(map.get("one"), Some(&1));       // Original unchanged
//! assert_eq!(updated.get("one"), Some(&100)); // New version
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod map;
pub mod typeclass;

/// Prelude module for convenient imports.
///
/// Re-exports the map type, its iterators, and the typeclass traits.
///
/// # Usage
///
/// ```rust
/// use hamtrie::prelude::*;
/// ```
pub mod prelude {
    pub use crate::map::*;
    pub use crate::typeclass::*;
}

#[cfg(test)]
mod tests {
    #[test]
    fn library_compiles() {
        // Basic smoke test to ensure the library compiles
    }
}
