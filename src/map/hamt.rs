//! Persistent (immutable) hash map based on HAMT.
//!
//! This module provides [`HamtMap`], an immutable hash map that uses
//! structural sharing for efficient operations.
//!
//! # Overview
//!
//! `HamtMap` is a Hash Array Mapped Trie (HAMT): a 32-way branching trie
//! navigated by successive 5-bit fragments of a 32-bit key hash. Interior
//! nodes keep their children in a densely packed array indexed through a
//! 32-bit occupancy bitmap, so a node never pays for empty slots.
//!
//! - O(log32 N) `get` (effectively O(1) for practical sizes)
//! - O(log32 N) `insert`
//! - O(log32 N) `remove`
//! - O(1) `len` and `is_empty`
//!
//! All operations return new maps without modifying the original, and
//! structural sharing keeps the copies cheap: an update clones at most one
//! child array per level of the trie.
//!
//! # Examples
//!
//! ```rust
//! use hamtrie::map::HamtMap;
//!
//! let map = HamtMap::new()
//!     .insert("one".to_string(), 1)
//!     .insert("two".to_string(), 2)
//!     .insert("three".to_string(), 3);
//!
//! assert_eq!(map.get("one"), Some(&1));
//! assert_eq!(map.get("two"), Some(&2));
//!
//! // Structural sharing: the original map is preserved
//! let updated = map.insert("one".to_string(), 100);
//! assert_eq!(map.get("one"), Some(&1));       // Original unchanged
//! assert_eq!(updated.get("one"), Some(&100)); // New version
//! ```
//!
//! # Internal Structure
//!
//! The trie has exactly three node shapes:
//!
//! - a leaf holding one entry together with the cached hash of its key,
//! - a collision node holding two or more entries whose distinct keys share
//!   one hash value,
//! - a bitmapped branch whose packed child array has exactly
//!   `popcount(bitmap)` elements.
//!
//! The empty map is the branch with bitmap `0` and no children; no other
//! empty representation exists.

use std::borrow::Borrow;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::iter::FromIterator;
use std::ops::Index;

use super::ReferenceCounter;
use crate::typeclass::{Foldable, Functor, Monoid, Semigroup, TypeConstructor};

// =============================================================================
// Constants
// =============================================================================

/// Branching factor (2^5 = 32)
const BRANCHING_FACTOR: usize = 32;

/// Bits consumed per trie level
const BITS_PER_LEVEL: u32 = 5;

/// Mask extracting one level's hash fragment
const LEVEL_MASK: u32 = (BRANCHING_FACTOR - 1) as u32;

/// Largest shift at which a branch can exist (seven levels of five bits,
/// the last level seeing only the two top bits of a 32-bit hash)
const MAX_SHIFT: u32 = 30;

// =============================================================================
// Hash computation
// =============================================================================

/// Computes the 32-bit hash of a key.
///
/// Keys hash through `DefaultHasher`; the 64-bit result is truncated because
/// the trie is laid out for exactly 32 bits (five per level, seven levels).
#[allow(clippy::cast_possible_truncation)]
fn compute_hash<K: Hash + ?Sized>(key: &K) -> u32 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish() as u32
}

/// Extracts the virtual slot (0..=31) addressed by `hash` at `shift`.
#[inline]
const fn hash_fragment(hash: u32, shift: u32) -> u32 {
    (hash >> shift) & LEVEL_MASK
}

/// Translates an occupancy bit into a physical index in the packed array.
#[inline]
const fn child_position(bitmap: u32, bit: u32) -> usize {
    (bitmap & (bit - 1)).count_ones() as usize
}

// =============================================================================
// Sparse-array primitives
// =============================================================================

// The only legal ways to alter a branch's child array. All three are
// copy-on-write over arrays of at most 32 elements.

/// A copy of `array` with slot `index` holding `item`.
fn array_replace<T: Clone>(index: usize, item: T, array: &[T]) -> ReferenceCounter<[T]> {
    let mut copy = array.to_vec();
    copy[index] = item;
    ReferenceCounter::from(copy)
}

/// A copy of `array` with `item` inserted at `index`, one slot longer.
fn array_insert<T: Clone>(index: usize, item: T, array: &[T]) -> ReferenceCounter<[T]> {
    let mut copy = Vec::with_capacity(array.len() + 1);
    copy.extend_from_slice(&array[..index]);
    copy.push(item);
    copy.extend_from_slice(&array[index..]);
    ReferenceCounter::from(copy)
}

/// A copy of `array` with slot `index` elided, one slot shorter.
fn array_remove<T: Clone>(index: usize, array: &[T]) -> ReferenceCounter<[T]> {
    let mut copy = array.to_vec();
    copy.remove(index);
    ReferenceCounter::from(copy)
}

// =============================================================================
// Node Definition
// =============================================================================

/// Internal node structure for the HAMT.
#[derive(Clone)]
enum Node<K, V> {
    /// Single key-value entry with the cached hash of the key
    Leaf { hash: u32, key: K, value: V },
    /// Two or more entries whose distinct keys share one hash
    Collision {
        hash: u32,
        entries: ReferenceCounter<[(K, V)]>,
    },
    /// Bitmap-indexed branch; `children.len() == bitmap.count_ones()`
    Branch {
        bitmap: u32,
        children: ReferenceCounter<[ReferenceCounter<Node<K, V>>]>,
    },
}

impl<K, V> Node<K, V> {
    /// The canonical empty node: a branch with bitmap `0` and no children.
    fn empty() -> Self {
        Self::Branch {
            bitmap: 0,
            children: ReferenceCounter::from(Vec::new()),
        }
    }

    /// `true` only for the canonical empty representation.
    const fn is_empty(&self) -> bool {
        matches!(self, Self::Branch { bitmap: 0, .. })
    }
}

// =============================================================================
// HamtMap Definition
// =============================================================================

/// A persistent (immutable) hash map based on HAMT.
///
/// `HamtMap` is an immutable data structure that uses structural sharing to
/// efficiently support functional programming patterns. Two maps produced by
/// successive updates share every unchanged sub-tree, and nodes are immutable
/// after construction, so any number of readers may traverse them without
/// coordination.
///
/// Iteration order is unspecified (it follows hash bits, not insertion
/// order), but deterministic for a given map value.
///
/// # Time Complexity
///
/// | Operation      | Complexity        |
/// |----------------|-------------------|
/// | `new`          | O(1)              |
/// | `get`          | O(log32 N)        |
/// | `insert`       | O(log32 N)        |
/// | `remove`       | O(log32 N)        |
/// | `contains_key` | O(log32 N)        |
/// | `union`        | O(n + m)          |
/// | `len`          | O(1)              |
///
/// # Examples
///
/// ```rust
/// use hamtrie::map::HamtMap;
///
/// let map = HamtMap::singleton("key".to_string(), 42);
/// assert_eq!(map.get("key"), Some(&42));
/// ```
#[derive(Clone)]
pub struct HamtMap<K, V> {
    /// Root node of the trie
    root: ReferenceCounter<Node<K, V>>,
    /// Number of entries
    length: usize,
}

impl<K, V> HamtMap<K, V> {
    /// Creates a new empty map.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use hamtrie::map::HamtMap;
    ///
    /// let map: HamtMap<String, i32> = HamtMap::new();
    /// assert!(map.is_empty());
    /// ```
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            root: ReferenceCounter::new(Node::empty()),
            length: 0,
        }
    }

    /// Returns the number of entries in the map.
    ///
    /// # Complexity
    ///
    /// O(1)
    ///
    /// # Examples
    ///
    /// ```rust
    /// use hamtrie::map::HamtMap;
    ///
    /// let map = HamtMap::new()
    ///     .insert("a".to_string(), 1)
    ///     .insert("b".to_string(), 2);
    /// assert_eq!(map.len(), 2);
    /// ```
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.length
    }

    /// Returns `true` if the map contains no entries.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use hamtrie::map::HamtMap;
    ///
    /// let empty: HamtMap<String, i32> = HamtMap::new();
    /// assert!(empty.is_empty());
    ///
    /// let non_empty = empty.insert("key".to_string(), 42);
    /// assert!(!non_empty.is_empty());
    /// ```
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.length == 0
    }
}

impl<K: Clone + Hash + Eq, V: Clone> HamtMap<K, V> {
    /// Creates a map containing a single key-value pair.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use hamtrie::map::HamtMap;
    ///
    /// let map = HamtMap::singleton("key".to_string(), 42);
    /// assert_eq!(map.len(), 1);
    /// assert_eq!(map.get("key"), Some(&42));
    /// ```
    #[must_use]
    pub fn singleton(key: K, value: V) -> Self {
        let hash = compute_hash(&key);
        Self {
            root: ReferenceCounter::new(Node::Leaf { hash, key, value }),
            length: 1,
        }
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Returns a reference to the value corresponding to the key.
    ///
    /// The key may be any borrowed form of the map's key type, but `Hash` and
    /// `Eq` on the borrowed form must match those for the key type.
    ///
    /// # Complexity
    ///
    /// O(log32 N)
    ///
    /// # Examples
    ///
    /// ```rust
    /// use hamtrie::map::HamtMap;
    ///
    /// let map = HamtMap::new().insert("hello".to_string(), 42);
    ///
    /// // Can use &str to look up String keys
    /// assert_eq!(map.get("hello"), Some(&42));
    /// assert_eq!(map.get("world"), None);
    /// ```
    #[must_use]
    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = compute_hash(key);
        Self::get_node(&self.root, hash, key, 0)
    }

    /// Recursive helper for get.
    fn get_node<'a, Q>(node: &'a Node<K, V>, hash: u32, key: &Q, shift: u32) -> Option<&'a V>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        match node {
            Node::Leaf {
                hash: leaf_hash,
                key: leaf_key,
                value,
            } => {
                if *leaf_hash == hash && leaf_key.borrow() == key {
                    Some(value)
                } else {
                    None
                }
            }
            Node::Collision {
                hash: collision_hash,
                entries,
            } => {
                // Hash mismatch rules the whole list out without a scan.
                if *collision_hash != hash {
                    return None;
                }
                entries
                    .iter()
                    .find(|(entry_key, _)| entry_key.borrow() == key)
                    .map(|(_, value)| value)
            }
            Node::Branch { bitmap, children } => {
                let bit = 1u32 << hash_fragment(hash, shift);
                if bitmap & bit == 0 {
                    None
                } else {
                    let position = child_position(*bitmap, bit);
                    Self::get_node(&children[position], hash, key, shift + BITS_PER_LEVEL)
                }
            }
        }
    }

    /// Returns `true` if the map contains a value for the specified key.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use hamtrie::map::HamtMap;
    ///
    /// let map = HamtMap::new().insert("key".to_string(), 42);
    ///
    /// assert!(map.contains_key("key"));
    /// assert!(!map.contains_key("other"));
    /// ```
    #[must_use]
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.get(key).is_some()
    }

    // =========================================================================
    // Insert
    // =========================================================================

    /// Inserts a key-value pair into the map.
    ///
    /// If the map already contains the key, the value is replaced.
    ///
    /// # Complexity
    ///
    /// O(log32 N)
    ///
    /// # Examples
    ///
    /// ```rust
    /// use hamtrie::map::HamtMap;
    ///
    /// let map1 = HamtMap::new().insert("key".to_string(), 1);
    /// let map2 = map1.insert("key".to_string(), 2);
    ///
    /// assert_eq!(map1.get("key"), Some(&1)); // Original unchanged
    /// assert_eq!(map2.get("key"), Some(&2)); // New version
    /// ```
    #[must_use]
    pub fn insert(&self, key: K, value: V) -> Self {
        self.insert_with(key, value, |new_value, _| new_value)
    }

    /// Inserts a key-value pair, combining with any existing value.
    ///
    /// When the key is absent the value is stored as given. When the key is
    /// present the stored value becomes `combine(new_value, &old_value)`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use hamtrie::map::HamtMap;
    ///
    /// let counts = HamtMap::new()
    ///     .insert_with("x".to_string(), 1, |new, old| new + old)
    ///     .insert_with("x".to_string(), 1, |new, old| new + old)
    ///     .insert_with("x".to_string(), 1, |new, old| new + old);
    ///
    /// assert_eq!(counts.get("x"), Some(&3));
    /// assert_eq!(counts.len(), 1);
    /// ```
    #[must_use]
    pub fn insert_with<F>(&self, key: K, value: V, combine: F) -> Self
    where
        F: FnOnce(V, &V) -> V,
    {
        let hash = compute_hash(&key);
        let (new_root, added) = Self::insert_node(&self.root, hash, key, value, 0, combine);
        Self {
            root: ReferenceCounter::new(new_root),
            length: if added { self.length + 1 } else { self.length },
        }
    }

    /// Recursive helper for insert.
    /// Returns (`new_node`, `added`) where `added` is true if the key was absent.
    fn insert_node<F>(
        node: &Node<K, V>,
        hash: u32,
        key: K,
        value: V,
        shift: u32,
        combine: F,
    ) -> (Node<K, V>, bool)
    where
        F: FnOnce(V, &V) -> V,
    {
        match node {
            Node::Leaf {
                hash: leaf_hash,
                key: leaf_key,
                value: leaf_value,
            } => {
                if *leaf_hash == hash && *leaf_key == key {
                    let stored = combine(value, leaf_value);
                    (
                        Node::Leaf {
                            hash,
                            key,
                            value: stored,
                        },
                        false,
                    )
                } else if *leaf_hash == hash {
                    // Distinct keys, one hash: bundle into a collision node.
                    let entries = ReferenceCounter::from(vec![
                        (key, value),
                        (leaf_key.clone(), leaf_value.clone()),
                    ]);
                    (Node::Collision { hash, entries }, true)
                } else {
                    let new_leaf = ReferenceCounter::new(Node::Leaf { hash, key, value });
                    let existing = ReferenceCounter::new(node.clone());
                    (
                        Self::join_nodes(shift, hash, new_leaf, *leaf_hash, existing),
                        true,
                    )
                }
            }
            Node::Collision {
                hash: collision_hash,
                entries,
            } => {
                if *collision_hash == hash {
                    let existing = entries.iter().find(|(entry_key, _)| *entry_key == key);
                    let (stored, added) = match existing {
                        Some((_, old_value)) => (combine(value, old_value), false),
                        None => (value, true),
                    };
                    let mut new_entries = Vec::with_capacity(entries.len() + 1);
                    new_entries.push((key.clone(), stored));
                    new_entries.extend(
                        entries
                            .iter()
                            .filter(|(entry_key, _)| *entry_key != key)
                            .cloned(),
                    );
                    (
                        Node::Collision {
                            hash,
                            entries: ReferenceCounter::from(new_entries),
                        },
                        added,
                    )
                } else {
                    let new_leaf = ReferenceCounter::new(Node::Leaf { hash, key, value });
                    let existing = ReferenceCounter::new(node.clone());
                    (
                        Self::join_nodes(shift, hash, new_leaf, *collision_hash, existing),
                        true,
                    )
                }
            }
            Node::Branch { bitmap, children } => {
                if *bitmap == 0 {
                    // Canonical empty: the first entry becomes a root leaf.
                    return (Node::Leaf { hash, key, value }, true);
                }
                let bit = 1u32 << hash_fragment(hash, shift);
                let position = child_position(*bitmap, bit);
                if bitmap & bit == 0 {
                    let new_leaf = ReferenceCounter::new(Node::Leaf { hash, key, value });
                    (
                        Node::Branch {
                            bitmap: bitmap | bit,
                            children: array_insert(position, new_leaf, children),
                        },
                        true,
                    )
                } else {
                    let (new_child, added) = Self::insert_node(
                        &children[position],
                        hash,
                        key,
                        value,
                        shift + BITS_PER_LEVEL,
                        combine,
                    );
                    (
                        Node::Branch {
                            bitmap: *bitmap,
                            children: array_replace(
                                position,
                                ReferenceCounter::new(new_child),
                                children,
                            ),
                        },
                        added,
                    )
                }
            }
        }
    }

    /// Builds the branch joining two nodes whose hashes differ.
    ///
    /// When the two hash fragments coincide at this level the branch gets a
    /// single child and the join recurses one level deeper; the recursion
    /// terminates because distinct 32-bit hashes differ in some fragment.
    fn join_nodes(
        shift: u32,
        first_hash: u32,
        first: ReferenceCounter<Node<K, V>>,
        second_hash: u32,
        second: ReferenceCounter<Node<K, V>>,
    ) -> Node<K, V> {
        let first_fragment = hash_fragment(first_hash, shift);
        let second_fragment = hash_fragment(second_hash, shift);
        if first_fragment == second_fragment {
            let child = ReferenceCounter::new(Self::join_nodes(
                shift + BITS_PER_LEVEL,
                first_hash,
                first,
                second_hash,
                second,
            ));
            Node::Branch {
                bitmap: 1u32 << first_fragment,
                children: ReferenceCounter::from(vec![child]),
            }
        } else {
            let bitmap = (1u32 << first_fragment) | (1u32 << second_fragment);
            let children = if first_fragment < second_fragment {
                vec![first, second]
            } else {
                vec![second, first]
            };
            Node::Branch {
                bitmap,
                children: ReferenceCounter::from(children),
            }
        }
    }

    /// Removes the key, then inserts the new value for it.
    ///
    /// Behaves like [`HamtMap::insert`] except that no combining function is
    /// ever consulted; the new value simply takes the key's slot.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use hamtrie::map::HamtMap;
    ///
    /// let map = HamtMap::new().insert("key".to_string(), 1);
    /// let replaced = map.replace("key".to_string(), 2);
    /// assert_eq!(replaced.get("key"), Some(&2));
    /// assert_eq!(replaced.len(), 1);
    /// ```
    #[must_use]
    pub fn replace(&self, key: K, value: V) -> Self {
        self.remove(&key).insert(key, value)
    }

    // =========================================================================
    // Remove
    // =========================================================================

    /// Removes a key from the map.
    ///
    /// Returns a new map without the key. If the key doesn't exist, returns
    /// a clone of the original map (sharing its root).
    ///
    /// # Complexity
    ///
    /// O(log32 N)
    ///
    /// # Examples
    ///
    /// ```rust
    /// use hamtrie::map::HamtMap;
    ///
    /// let map = HamtMap::new()
    ///     .insert("a".to_string(), 1)
    ///     .insert("b".to_string(), 2);
    /// let removed = map.remove("a");
    ///
    /// assert_eq!(map.len(), 2);     // Original unchanged
    /// assert_eq!(removed.len(), 1); // New version
    /// assert_eq!(removed.get("a"), None);
    /// ```
    #[must_use]
    pub fn remove<Q>(&self, key: &Q) -> Self
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = compute_hash(key);
        match Self::remove_node(&self.root, hash, key, 0) {
            Some(new_root) => Self {
                root: ReferenceCounter::new(new_root),
                length: self.length - 1,
            },
            None => self.clone(),
        }
    }

    /// Recursive helper for remove.
    ///
    /// Returns `None` when the key is absent (no change needed), otherwise
    /// the replacement node, which may be the canonical empty node.
    fn remove_node<Q>(node: &Node<K, V>, hash: u32, key: &Q, shift: u32) -> Option<Node<K, V>>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        match node {
            Node::Leaf {
                hash: leaf_hash,
                key: leaf_key,
                ..
            } => {
                if *leaf_hash == hash && leaf_key.borrow() == key {
                    Some(Node::empty())
                } else {
                    None
                }
            }
            Node::Collision {
                hash: collision_hash,
                entries,
            } => {
                if *collision_hash != hash {
                    return None;
                }
                let position = entries
                    .iter()
                    .position(|(entry_key, _)| entry_key.borrow() == key)?;
                let mut survivors = entries.to_vec();
                survivors.remove(position);
                if survivors.len() == 1 {
                    let (remaining_key, remaining_value) = survivors.remove(0);
                    Some(Node::Leaf {
                        hash: *collision_hash,
                        key: remaining_key,
                        value: remaining_value,
                    })
                } else {
                    Some(Node::Collision {
                        hash: *collision_hash,
                        entries: ReferenceCounter::from(survivors),
                    })
                }
            }
            Node::Branch { bitmap, children } => {
                if *bitmap == 0 {
                    return None;
                }
                let bit = 1u32 << hash_fragment(hash, shift);
                if bitmap & bit == 0 {
                    return None;
                }
                let position = child_position(*bitmap, bit);
                let new_child =
                    Self::remove_node(&children[position], hash, key, shift + BITS_PER_LEVEL)?;

                if new_child.is_empty() {
                    let remaining_bitmap = bitmap & !bit;
                    if remaining_bitmap == 0 {
                        return Some(Node::empty());
                    }
                    let remaining = array_remove(position, children);
                    // A lone non-branch survivor replaces the branch so that
                    // the trie keeps the shape a fresh build would produce.
                    if remaining.len() == 1 && !matches!(&*remaining[0], Node::Branch { .. }) {
                        return Some((*remaining[0]).clone());
                    }
                    return Some(Node::Branch {
                        bitmap: remaining_bitmap,
                        children: remaining,
                    });
                }

                if children.len() == 1 && !matches!(new_child, Node::Branch { .. }) {
                    return Some(new_child);
                }
                Some(Node::Branch {
                    bitmap: *bitmap,
                    children: array_replace(position, ReferenceCounter::new(new_child), children),
                })
            }
        }
    }

    // =========================================================================
    // Adjust
    // =========================================================================

    /// Applies a function to the value stored for `key`, if any.
    ///
    /// Returns the map unchanged when the key is absent.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use hamtrie::map::HamtMap;
    ///
    /// let map = HamtMap::new().insert("count".to_string(), 10);
    ///
    /// let bumped = map.adjust("count", |value| value + 1);
    /// assert_eq!(bumped.get("count"), Some(&11));
    ///
    /// let untouched = map.adjust("missing", |value| value + 1);
    /// assert_eq!(untouched, map);
    /// ```
    #[must_use]
    pub fn adjust<Q, F>(&self, key: &Q, function: F) -> Self
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        F: FnOnce(&V) -> V,
    {
        let hash = compute_hash(key);
        match Self::adjust_node(&self.root, hash, key, 0, function) {
            Some(new_root) => Self {
                root: ReferenceCounter::new(new_root),
                length: self.length,
            },
            None => self.clone(),
        }
    }

    /// Recursive helper for adjust. `None` means the key is absent.
    fn adjust_node<Q, F>(
        node: &Node<K, V>,
        hash: u32,
        key: &Q,
        shift: u32,
        function: F,
    ) -> Option<Node<K, V>>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
        F: FnOnce(&V) -> V,
    {
        match node {
            Node::Leaf {
                hash: leaf_hash,
                key: leaf_key,
                value,
            } => {
                if *leaf_hash == hash && leaf_key.borrow() == key {
                    Some(Node::Leaf {
                        hash,
                        key: leaf_key.clone(),
                        value: function(value),
                    })
                } else {
                    None
                }
            }
            Node::Collision {
                hash: collision_hash,
                entries,
            } => {
                if *collision_hash != hash {
                    return None;
                }
                let position = entries
                    .iter()
                    .position(|(entry_key, _)| entry_key.borrow() == key)?;
                let mut new_entries = entries.to_vec();
                new_entries[position].1 = function(&entries[position].1);
                Some(Node::Collision {
                    hash: *collision_hash,
                    entries: ReferenceCounter::from(new_entries),
                })
            }
            Node::Branch { bitmap, children } => {
                let bit = 1u32 << hash_fragment(hash, shift);
                if bitmap & bit == 0 {
                    return None;
                }
                let position = child_position(*bitmap, bit);
                let new_child = Self::adjust_node(
                    &children[position],
                    hash,
                    key,
                    shift + BITS_PER_LEVEL,
                    function,
                )?;
                Some(Node::Branch {
                    bitmap: *bitmap,
                    children: array_replace(position, ReferenceCounter::new(new_child), children),
                })
            }
        }
    }

    // =========================================================================
    // Union
    // =========================================================================

    /// Merges two maps, keeping this map's value on key conflicts.
    ///
    /// # Complexity
    ///
    /// O(n + m); shared sub-trees merge by descending both tries in parallel.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use hamtrie::map::HamtMap;
    ///
    /// let left = HamtMap::new()
    ///     .insert(1, 'a')
    ///     .insert(2, 'b');
    /// let right = HamtMap::new()
    ///     .insert(2, 'c')
    ///     .insert(3, 'd');
    ///
    /// let merged = left.union(&right);
    /// assert_eq!(merged.len(), 3);
    /// assert_eq!(merged.get(&2), Some(&'b')); // Left value wins
    /// ```
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        self.union_with(other, |left_value, _right_value| left_value.clone())
    }

    /// Merges two maps, combining conflicting values with `combine`.
    ///
    /// For a key present in both maps, the stored value becomes
    /// `combine(&self_value, &other_value)`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use hamtrie::map::HamtMap;
    ///
    /// let left = HamtMap::new().insert("x".to_string(), 1);
    /// let right = HamtMap::new().insert("x".to_string(), 10);
    ///
    /// let summed = left.union_with(&right, |a, b| a + b);
    /// assert_eq!(summed.get("x"), Some(&11));
    /// ```
    #[must_use]
    pub fn union_with<F>(&self, other: &Self, mut combine: F) -> Self
    where
        F: FnMut(&V, &V) -> V,
    {
        if self.is_empty() {
            return other.clone();
        }
        if other.is_empty() {
            return self.clone();
        }
        let (root, overlap) = Self::union_nodes(&self.root, &other.root, 0, &mut combine, false);
        Self {
            root,
            length: self.length + other.length - overlap,
        }
    }

    /// Recursive helper for union.
    ///
    /// `flipped` tracks argument swaps so `combine` always sees the value
    /// from the original left map first. Returns the merged node and the
    /// number of keys that occurred on both sides.
    fn union_nodes<F>(
        left: &ReferenceCounter<Node<K, V>>,
        right: &ReferenceCounter<Node<K, V>>,
        shift: u32,
        combine: &mut F,
        flipped: bool,
    ) -> (ReferenceCounter<Node<K, V>>, usize)
    where
        F: FnMut(&V, &V) -> V,
    {
        match (&**left, &**right) {
            (
                Node::Branch {
                    bitmap: left_bitmap,
                    children: left_children,
                },
                Node::Branch {
                    bitmap: right_bitmap,
                    children: right_children,
                },
            ) => {
                if *left_bitmap == 0 {
                    return (right.clone(), 0);
                }
                if *right_bitmap == 0 {
                    return (left.clone(), 0);
                }
                let merged_bitmap = left_bitmap | right_bitmap;
                let mut children = Vec::with_capacity(merged_bitmap.count_ones() as usize);
                let mut overlap = 0;
                let mut left_index = 0;
                let mut right_index = 0;
                for slot in 0..32u32 {
                    let bit = 1u32 << slot;
                    if merged_bitmap & bit == 0 {
                        continue;
                    }
                    let in_left = left_bitmap & bit != 0;
                    let in_right = right_bitmap & bit != 0;
                    let child = if in_left && in_right {
                        let (merged_child, duplicates) = Self::union_nodes(
                            &left_children[left_index],
                            &right_children[right_index],
                            shift + BITS_PER_LEVEL,
                            combine,
                            flipped,
                        );
                        left_index += 1;
                        right_index += 1;
                        overlap += duplicates;
                        merged_child
                    } else if in_left {
                        let child = left_children[left_index].clone();
                        left_index += 1;
                        child
                    } else {
                        let child = right_children[right_index].clone();
                        right_index += 1;
                        child
                    };
                    children.push(child);
                }
                (
                    ReferenceCounter::new(Node::Branch {
                        bitmap: merged_bitmap,
                        children: ReferenceCounter::from(children),
                    }),
                    overlap,
                )
            }
            (Node::Leaf { hash, key, value }, _) => {
                let (merged, added) = Self::insert_node(
                    right,
                    *hash,
                    key.clone(),
                    value.clone(),
                    shift,
                    |new_value, old_value| {
                        if flipped {
                            combine(old_value, &new_value)
                        } else {
                            combine(&new_value, old_value)
                        }
                    },
                );
                (ReferenceCounter::new(merged), usize::from(!added))
            }
            (Node::Collision { hash, entries }, _) => {
                let mut merged = right.clone();
                let mut overlap = 0;
                for (key, value) in entries.iter() {
                    let (next, added) = Self::insert_node(
                        &merged,
                        *hash,
                        key.clone(),
                        value.clone(),
                        shift,
                        |new_value, old_value| {
                            if flipped {
                                combine(old_value, &new_value)
                            } else {
                                combine(&new_value, old_value)
                            }
                        },
                    );
                    merged = ReferenceCounter::new(next);
                    if !added {
                        overlap += 1;
                    }
                }
                (merged, overlap)
            }
            // branch + leaf/collision: swap sides and flip the combiner so
            // the non-branch cases above handle it uniformly.
            (Node::Branch { .. }, _) => Self::union_nodes(right, left, shift, combine, !flipped),
        }
    }

    /// Unions every map in the iterator, starting from the empty map.
    ///
    /// Earlier maps win key conflicts, matching [`HamtMap::union`].
    ///
    /// # Examples
    ///
    /// ```rust
    /// use hamtrie::map::HamtMap;
    ///
    /// let merged = HamtMap::unions(vec![
    ///     HamtMap::singleton(1, "first"),
    ///     HamtMap::singleton(1, "second"),
    ///     HamtMap::singleton(2, "third"),
    /// ]);
    ///
    /// assert_eq!(merged.get(&1), Some(&"first"));
    /// assert_eq!(merged.len(), 2);
    /// ```
    #[must_use]
    pub fn unions<I>(maps: I) -> Self
    where
        I: IntoIterator<Item = Self>,
    {
        maps.into_iter()
            .fold(Self::new(), |accumulator, map| accumulator.union(&map))
    }

    // =========================================================================
    // Filter and set-like operations
    // =========================================================================

    /// Keeps the entries whose value satisfies the predicate.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use hamtrie::map::HamtMap;
    ///
    /// let map: HamtMap<i32, i32> = (1..=10).map(|index| (index, index)).collect();
    /// let even = map.filter(|value| value % 2 == 0);
    ///
    /// assert_eq!(even.len(), 5);
    /// assert_eq!(even.get(&4), Some(&4));
    /// assert_eq!(even.get(&5), None);
    /// ```
    #[must_use]
    pub fn filter<F>(&self, mut predicate: F) -> Self
    where
        F: FnMut(&V) -> bool,
    {
        self.filter_with_key(|_, value| predicate(value))
    }

    /// Keeps the entries whose key and value satisfy the predicate.
    ///
    /// Sub-trees in which every entry survives are shared with the input map
    /// rather than rebuilt.
    #[must_use]
    pub fn filter_with_key<F>(&self, mut predicate: F) -> Self
    where
        F: FnMut(&K, &V) -> bool,
    {
        let (kept, removed) = Self::filter_node(&self.root, &mut predicate);
        match kept {
            Some(root) => Self {
                root,
                length: self.length - removed,
            },
            None => Self::new(),
        }
    }

    /// Recursive helper for filter.
    ///
    /// Returns the surviving node (`None` when the whole sub-tree is
    /// dropped) and the number of entries removed beneath it.
    fn filter_node<F>(
        node: &ReferenceCounter<Node<K, V>>,
        predicate: &mut F,
    ) -> (Option<ReferenceCounter<Node<K, V>>>, usize)
    where
        F: FnMut(&K, &V) -> bool,
    {
        match &**node {
            Node::Leaf { key, value, .. } => {
                if predicate(key, value) {
                    (Some(node.clone()), 0)
                } else {
                    (None, 1)
                }
            }
            Node::Collision { hash, entries } => {
                let mut survivors: Vec<(K, V)> = entries
                    .iter()
                    .filter(|(key, value)| predicate(key, value))
                    .cloned()
                    .collect();
                let removed = entries.len() - survivors.len();
                if removed == 0 {
                    return (Some(node.clone()), 0);
                }
                match survivors.len() {
                    0 => (None, removed),
                    1 => {
                        let (key, value) = survivors.remove(0);
                        (
                            Some(ReferenceCounter::new(Node::Leaf {
                                hash: *hash,
                                key,
                                value,
                            })),
                            removed,
                        )
                    }
                    _ => (
                        Some(ReferenceCounter::new(Node::Collision {
                            hash: *hash,
                            entries: ReferenceCounter::from(survivors),
                        })),
                        removed,
                    ),
                }
            }
            Node::Branch { bitmap, children } => {
                if *bitmap == 0 {
                    return (None, 0);
                }
                let mut new_children = Vec::with_capacity(children.len());
                let mut new_bitmap = 0u32;
                let mut removed = 0;
                let mut changed = false;
                let mut child_index = 0;
                for slot in 0..32u32 {
                    let bit = 1u32 << slot;
                    if bitmap & bit == 0 {
                        continue;
                    }
                    let child = &children[child_index];
                    child_index += 1;
                    let (kept, removed_below) = Self::filter_node(child, predicate);
                    removed += removed_below;
                    match kept {
                        Some(new_child) => {
                            if !ReferenceCounter::ptr_eq(&new_child, child) {
                                changed = true;
                            }
                            new_bitmap |= bit;
                            new_children.push(new_child);
                        }
                        None => changed = true,
                    }
                }
                if !changed {
                    return (Some(node.clone()), 0);
                }
                match new_children.len() {
                    0 => (None, removed),
                    1 if !matches!(&*new_children[0], Node::Branch { .. }) => {
                        (new_children.pop(), removed)
                    }
                    _ => (
                        Some(ReferenceCounter::new(Node::Branch {
                            bitmap: new_bitmap,
                            children: ReferenceCounter::from(new_children),
                        })),
                        removed,
                    ),
                }
            }
        }
    }

    /// The entries of this map whose keys are absent from `other`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use hamtrie::map::HamtMap;
    ///
    /// let left = HamtMap::new().insert(1, 'a').insert(2, 'b');
    /// let right = HamtMap::new().insert(2, 'x');
    ///
    /// let only_left = left.difference(&right);
    /// assert_eq!(only_left.len(), 1);
    /// assert_eq!(only_left.get(&1), Some(&'a'));
    /// ```
    #[must_use]
    pub fn difference<W: Clone>(&self, other: &HamtMap<K, W>) -> Self {
        self.filter_with_key(|key, _| !other.contains_key(key))
    }

    /// The entries of this map whose keys are present in `other`.
    ///
    /// Values come from this map.
    #[must_use]
    pub fn intersection<W: Clone>(&self, other: &HamtMap<K, W>) -> Self {
        self.filter_with_key(|key, _| other.contains_key(key))
    }

    /// Intersects two maps, combining the paired values.
    ///
    /// Keeps every key present in both maps, storing
    /// `combine(&self_value, &other_value)`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use hamtrie::map::HamtMap;
    ///
    /// let left = HamtMap::new().insert("x".to_string(), 2).insert("y".to_string(), 3);
    /// let right = HamtMap::new().insert("x".to_string(), 10);
    ///
    /// let paired = left.intersection_with(&right, |a, b| a * b);
    /// assert_eq!(paired.get("x"), Some(&20));
    /// assert_eq!(paired.len(), 1);
    /// ```
    #[must_use]
    pub fn intersection_with<W, X, F>(&self, other: &HamtMap<K, W>, mut combine: F) -> HamtMap<K, X>
    where
        W: Clone,
        X: Clone,
        F: FnMut(&V, &W) -> X,
    {
        self.fold_with_key(HamtMap::new(), |accumulator, key, value| {
            match other.get(key) {
                Some(other_value) => accumulator.insert(key.clone(), combine(value, other_value)),
                None => accumulator,
            }
        })
    }

    // =========================================================================
    // Folds
    // =========================================================================

    /// Strict left fold over the values.
    ///
    /// Each step is fully evaluated before the next begins. Visitation order
    /// follows the trie (unspecified but deterministic per map value).
    ///
    /// # Examples
    ///
    /// ```rust
    /// use hamtrie::map::HamtMap;
    ///
    /// let map = HamtMap::new()
    ///     .insert("a".to_string(), 1)
    ///     .insert("b".to_string(), 2)
    ///     .insert("c".to_string(), 3);
    ///
    /// let total = map.fold(0, |accumulator, value| accumulator + value);
    /// assert_eq!(total, 6);
    /// ```
    pub fn fold<B, F>(&self, init: B, mut function: F) -> B
    where
        F: FnMut(B, &V) -> B,
    {
        self.fold_with_key(init, |accumulator, _, value| function(accumulator, value))
    }

    /// Strict left fold over keys and values.
    pub fn fold_with_key<B, F>(&self, init: B, mut function: F) -> B
    where
        F: FnMut(B, &K, &V) -> B,
    {
        Self::fold_node(&self.root, init, &mut function)
    }

    /// Recursive helper for the left folds.
    fn fold_node<'a, B, F>(node: &'a Node<K, V>, accumulator: B, function: &mut F) -> B
    where
        F: FnMut(B, &'a K, &'a V) -> B,
    {
        match node {
            Node::Leaf { key, value, .. } => function(accumulator, key, value),
            Node::Collision { entries, .. } => entries
                .iter()
                .fold(accumulator, |accumulator, (key, value)| {
                    function(accumulator, key, value)
                }),
            Node::Branch { children, .. } => children.iter().fold(accumulator, |accumulator, child| {
                Self::fold_node(child, accumulator, function)
            }),
        }
    }

    /// Right fold over the values.
    ///
    /// Present for completeness; prefer [`HamtMap::fold`], which does not
    /// build up call depth proportional to the number of entries.
    pub fn fold_right<B, F>(&self, init: B, mut function: F) -> B
    where
        F: FnMut(&V, B) -> B,
    {
        self.fold_right_with_key(init, |_, value, accumulator| function(value, accumulator))
    }

    /// Right fold over keys and values.
    pub fn fold_right_with_key<B, F>(&self, init: B, mut function: F) -> B
    where
        F: FnMut(&K, &V, B) -> B,
    {
        Self::fold_node_right(&self.root, init, &mut function)
    }

    /// Recursive helper for the right folds.
    fn fold_node_right<'a, B, F>(node: &'a Node<K, V>, accumulator: B, function: &mut F) -> B
    where
        F: FnMut(&'a K, &'a V, B) -> B,
    {
        match node {
            Node::Leaf { key, value, .. } => function(key, value, accumulator),
            Node::Collision { entries, .. } => entries
                .iter()
                .rev()
                .fold(accumulator, |accumulator, (key, value)| {
                    function(key, value, accumulator)
                }),
            Node::Branch { children, .. } => children
                .iter()
                .rev()
                .fold(accumulator, |accumulator, child| {
                    Self::fold_node_right(child, accumulator, function)
                }),
        }
    }

    // =========================================================================
    // Mapping and traversal
    // =========================================================================

    /// Applies a function to every value, preserving the trie shape exactly.
    ///
    /// Keys, cached hashes, bitmaps, and child ordering are untouched; only
    /// values change.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use hamtrie::map::HamtMap;
    ///
    /// let map = HamtMap::new().insert("a".to_string(), 2);
    /// let doubled = map.map_values(|value| value * 2);
    /// assert_eq!(doubled.get("a"), Some(&4));
    /// ```
    #[must_use]
    pub fn map_values<W, F>(&self, mut function: F) -> HamtMap<K, W>
    where
        F: FnMut(&V) -> W,
    {
        self.map_with_key(|_, value| function(value))
    }

    /// Applies a function to every key-value pair, preserving structure.
    #[must_use]
    pub fn map_with_key<W, F>(&self, mut function: F) -> HamtMap<K, W>
    where
        F: FnMut(&K, &V) -> W,
    {
        HamtMap {
            root: ReferenceCounter::new(Self::map_node(&self.root, &mut function)),
            length: self.length,
        }
    }

    /// Recursive helper for the structure-preserving maps.
    fn map_node<W, F>(node: &Node<K, V>, function: &mut F) -> Node<K, W>
    where
        F: FnMut(&K, &V) -> W,
    {
        match node {
            Node::Leaf { hash, key, value } => Node::Leaf {
                hash: *hash,
                key: key.clone(),
                value: function(key, value),
            },
            Node::Collision { hash, entries } => Node::Collision {
                hash: *hash,
                entries: ReferenceCounter::from(
                    entries
                        .iter()
                        .map(|(key, value)| (key.clone(), function(key, value)))
                        .collect::<Vec<_>>(),
                ),
            },
            Node::Branch { bitmap, children } => Node::Branch {
                bitmap: *bitmap,
                children: ReferenceCounter::from(
                    children
                        .iter()
                        .map(|child| ReferenceCounter::new(Self::map_node(child, function)))
                        .collect::<Vec<_>>(),
                ),
            },
        }
    }

    /// Effectful [`HamtMap::map_with_key`]: the first `Err` aborts the walk.
    ///
    /// Entries are visited in trie order (the same order the folds use) and
    /// the transformed map preserves the input's structure exactly.
    ///
    /// # Errors
    ///
    /// Propagates the first error the function returns.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use hamtrie::map::HamtMap;
    ///
    /// let map = HamtMap::new().insert("a".to_string(), "1".to_string());
    ///
    /// let parsed: Result<HamtMap<String, i32>, _> =
    ///     map.traverse_with_key(|_, value| value.parse::<i32>());
    /// assert_eq!(parsed.unwrap().get("a"), Some(&1));
    ///
    /// let broken = HamtMap::new().insert("a".to_string(), "oops".to_string());
    /// let failed: Result<HamtMap<String, i32>, _> =
    ///     broken.traverse_with_key(|_, value| value.parse::<i32>());
    /// assert!(failed.is_err());
    /// ```
    pub fn traverse_with_key<W, E, F>(&self, mut function: F) -> Result<HamtMap<K, W>, E>
    where
        F: FnMut(&K, &V) -> Result<W, E>,
    {
        Ok(HamtMap {
            root: ReferenceCounter::new(Self::traverse_node(&self.root, &mut function)?),
            length: self.length,
        })
    }

    /// Recursive helper for the effectful traversal.
    fn traverse_node<W, E, F>(node: &Node<K, V>, function: &mut F) -> Result<Node<K, W>, E>
    where
        F: FnMut(&K, &V) -> Result<W, E>,
    {
        match node {
            Node::Leaf { hash, key, value } => Ok(Node::Leaf {
                hash: *hash,
                key: key.clone(),
                value: function(key, value)?,
            }),
            Node::Collision { hash, entries } => {
                let mut transformed = Vec::with_capacity(entries.len());
                for (key, value) in entries.iter() {
                    transformed.push((key.clone(), function(key, value)?));
                }
                Ok(Node::Collision {
                    hash: *hash,
                    entries: ReferenceCounter::from(transformed),
                })
            }
            Node::Branch { bitmap, children } => {
                let mut transformed = Vec::with_capacity(children.len());
                for child in children.iter() {
                    transformed.push(ReferenceCounter::new(Self::traverse_node(child, function)?));
                }
                Ok(Node::Branch {
                    bitmap: *bitmap,
                    children: ReferenceCounter::from(transformed),
                })
            }
        }
    }

    // =========================================================================
    // Iteration
    // =========================================================================

    /// Returns an iterator over key-value pairs.
    ///
    /// Iteration order is unspecified but deterministic per map value.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use hamtrie::map::HamtMap;
    ///
    /// let map = HamtMap::new()
    ///     .insert("a".to_string(), 1)
    ///     .insert("b".to_string(), 2);
    ///
    /// let total: i32 = map.iter().map(|(_, value)| value).sum();
    /// assert_eq!(total, 3);
    /// ```
    #[must_use]
    pub fn iter(&self) -> HamtMapIterator<'_, K, V> {
        let entries = Self::fold_node(
            &self.root,
            Vec::with_capacity(self.length),
            &mut |mut entries: Vec<(&K, &V)>, key, value| {
                entries.push((key, value));
                entries
            },
        );
        HamtMapIterator {
            entries,
            current_index: 0,
        }
    }

    /// Returns an iterator over keys.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.iter().map(|(key, _)| key)
    }

    /// Returns an iterator over values.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use hamtrie::map::HamtMap;
    ///
    /// let map = HamtMap::new()
    ///     .insert("a".to_string(), 1)
    ///     .insert("b".to_string(), 2);
    ///
    /// let sum: i32 = map.values().sum();
    /// assert_eq!(sum, 3);
    /// ```
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.iter().map(|(_, value)| value)
    }

    // =========================================================================
    // Bulk construction
    // =========================================================================

    /// Builds a map from entries, combining duplicate keys with `combine`.
    ///
    /// Entries are inserted left to right; for a repeated key the stored
    /// value becomes `combine(later_value, &stored_value)`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use hamtrie::map::HamtMap;
    ///
    /// let counts = HamtMap::from_iter_with(
    ///     vec![("a".to_string(), 1), ("b".to_string(), 1), ("a".to_string(), 1)],
    ///     |new, old| new + old,
    /// );
    ///
    /// assert_eq!(counts.get("a"), Some(&2));
    /// assert_eq!(counts.get("b"), Some(&1));
    /// ```
    #[must_use]
    pub fn from_iter_with<I, F>(entries: I, mut combine: F) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        F: FnMut(V, &V) -> V,
    {
        entries.into_iter().fold(Self::new(), |map, (key, value)| {
            map.insert_with(key, value, &mut combine)
        })
    }

    // =========================================================================
    // Invariant checking
    // =========================================================================

    /// Verifies the internal structure of the trie.
    ///
    /// Checks, for every reachable node: bitmap popcount matches the child
    /// array length; no child is the empty node; branches with one child
    /// only wrap deeper branches; collision nodes hold at least two entries
    /// with pairwise-distinct keys and one shared hash; cached hashes match
    /// the keys; and the cached length matches a full recount.
    ///
    /// Intended for tests and debugging. Walks the whole map.
    #[must_use]
    pub fn invariants_hold(&self) -> bool {
        Self::node_invariants(&self.root, 0) && Self::count_entries(&self.root) == self.length
    }

    /// Recursive helper for the invariant check.
    fn node_invariants(node: &Node<K, V>, shift: u32) -> bool {
        match node {
            Node::Leaf { hash, key, .. } => *hash == compute_hash(key),
            Node::Collision { hash, entries } => {
                entries.len() >= 2
                    && entries
                        .iter()
                        .all(|(key, _)| compute_hash(key) == *hash)
                    && entries.iter().enumerate().all(|(index, (key, _))| {
                        entries[index + 1..]
                            .iter()
                            .all(|(other_key, _)| other_key != key)
                    })
            }
            Node::Branch { bitmap, children } => {
                if shift > MAX_SHIFT {
                    return false;
                }
                if bitmap.count_ones() as usize != children.len() {
                    return false;
                }
                if *bitmap == 0 {
                    // The canonical empty node exists only as the root.
                    return shift == 0 && children.is_empty();
                }
                if children.len() == 1 && !matches!(&*children[0], Node::Branch { .. }) {
                    return false;
                }
                let mut child_index = 0;
                for slot in 0..32u32 {
                    if bitmap & (1u32 << slot) == 0 {
                        continue;
                    }
                    let child = &children[child_index];
                    child_index += 1;
                    if child.is_empty()
                        || !Self::subtree_matches_slot(child, shift, slot)
                        || !Self::node_invariants(child, shift + BITS_PER_LEVEL)
                    {
                        return false;
                    }
                }
                true
            }
        }
    }

    /// Checks that every hash in the sub-tree routes to `slot` at `shift`.
    fn subtree_matches_slot(node: &Node<K, V>, shift: u32, slot: u32) -> bool {
        match node {
            Node::Leaf { hash, .. } | Node::Collision { hash, .. } => {
                hash_fragment(*hash, shift) == slot
            }
            Node::Branch { children, .. } => children
                .iter()
                .all(|child| Self::subtree_matches_slot(child, shift, slot)),
        }
    }

    /// Counts the entries in a sub-tree.
    fn count_entries(node: &Node<K, V>) -> usize {
        match node {
            Node::Leaf { .. } => 1,
            Node::Collision { entries, .. } => entries.len(),
            Node::Branch { children, .. } => {
                children.iter().map(|child| Self::count_entries(child)).sum()
            }
        }
    }
}

// =============================================================================
// Iterator Implementation
// =============================================================================

/// An iterator over key-value pairs of a [`HamtMap`].
pub struct HamtMapIterator<'a, K, V> {
    entries: Vec<(&'a K, &'a V)>,
    current_index: usize,
}

impl<'a, K, V> Iterator for HamtMapIterator<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        if self.current_index >= self.entries.len() {
            None
        } else {
            let entry = self.entries[self.current_index];
            self.current_index += 1;
            Some(entry)
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.entries.len().saturating_sub(self.current_index);
        (remaining, Some(remaining))
    }
}

impl<K, V> ExactSizeIterator for HamtMapIterator<'_, K, V> {
    fn len(&self) -> usize {
        self.entries.len().saturating_sub(self.current_index)
    }
}

/// An owning iterator over key-value pairs of a [`HamtMap`].
pub struct HamtMapIntoIterator<K, V> {
    entries: Vec<(K, V)>,
    current_index: usize,
}

impl<K: Clone, V: Clone> Iterator for HamtMapIntoIterator<K, V> {
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        if self.current_index >= self.entries.len() {
            None
        } else {
            let entry = self.entries[self.current_index].clone();
            self.current_index += 1;
            Some(entry)
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.entries.len().saturating_sub(self.current_index);
        (remaining, Some(remaining))
    }
}

impl<K: Clone, V: Clone> ExactSizeIterator for HamtMapIntoIterator<K, V> {
    fn len(&self) -> usize {
        self.entries.len().saturating_sub(self.current_index)
    }
}

// =============================================================================
// Standard Trait Implementations
// =============================================================================

impl<K, V> Default for HamtMap<K, V> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Clone + Hash + Eq, V: Clone> FromIterator<(K, V)> for HamtMap<K, V> {
    /// Builds a map by inserting left to right; later entries win.
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Self::new(), |map, (key, value)| map.insert(key, value))
    }
}

impl<K: Clone + Hash + Eq, V: Clone> IntoIterator for HamtMap<K, V> {
    type Item = (K, V);
    type IntoIter = HamtMapIntoIterator<K, V>;

    fn into_iter(self) -> Self::IntoIter {
        let entries: Vec<(K, V)> = self
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        HamtMapIntoIterator {
            entries,
            current_index: 0,
        }
    }
}

impl<'a, K, V> IntoIterator for &'a HamtMap<K, V>
where
    K: Clone + Hash + Eq,
    V: Clone,
{
    type Item = (&'a K, &'a V);
    type IntoIter = HamtMapIterator<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<K: Clone + Hash + Eq, V: Clone + PartialEq> PartialEq for HamtMap<K, V> {
    /// Structural equality.
    ///
    /// Every map with a given key set has one canonical shape, so comparing
    /// node by node decides entry-set equality. Collision lists compare as
    /// sets because their order depends on insertion history.
    fn eq(&self, other: &Self) -> bool {
        self.length == other.length
            && (ReferenceCounter::ptr_eq(&self.root, &other.root)
                || Self::nodes_equal(&self.root, &other.root))
    }
}

impl<K: Clone + Hash + Eq, V: Clone + PartialEq> HamtMap<K, V> {
    /// Recursive structural comparison.
    fn nodes_equal(left: &Node<K, V>, right: &Node<K, V>) -> bool {
        match (left, right) {
            (
                Node::Leaf {
                    hash: left_hash,
                    key: left_key,
                    value: left_value,
                },
                Node::Leaf {
                    hash: right_hash,
                    key: right_key,
                    value: right_value,
                },
            ) => left_hash == right_hash && left_key == right_key && left_value == right_value,
            (
                Node::Collision {
                    hash: left_hash,
                    entries: left_entries,
                },
                Node::Collision {
                    hash: right_hash,
                    entries: right_entries,
                },
            ) => {
                left_hash == right_hash
                    && left_entries.len() == right_entries.len()
                    && left_entries.iter().all(|(key, value)| {
                        right_entries
                            .iter()
                            .any(|(other_key, other_value)| other_key == key && other_value == value)
                    })
            }
            (
                Node::Branch {
                    bitmap: left_bitmap,
                    children: left_children,
                },
                Node::Branch {
                    bitmap: right_bitmap,
                    children: right_children,
                },
            ) => {
                left_bitmap == right_bitmap
                    && left_children
                        .iter()
                        .zip(right_children.iter())
                        .all(|(left_child, right_child)| {
                            ReferenceCounter::ptr_eq(left_child, right_child)
                                || Self::nodes_equal(left_child, right_child)
                        })
            }
            _ => false,
        }
    }
}

impl<K: Clone + Hash + Eq, V: Clone + Eq> Eq for HamtMap<K, V> {}

impl<K: Clone + Hash + Eq, V: Clone + Hash> Hash for HamtMap<K, V> {
    /// Deterministic combination of the constituent hashes.
    ///
    /// Each node mixes its pieces into an accumulator by
    /// `accumulator * 31 + piece`, seeded per variant (1 for leaves, 2 for
    /// collision nodes, 3 for branches). Collision-entry contributions are
    /// combined commutatively so that equal maps hash equally regardless of
    /// their insertion history.
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(Self::node_hash_value(&self.root));
    }
}

impl<K: Clone + Hash + Eq, V: Clone + Hash> HamtMap<K, V> {
    /// Hash of a single value through `DefaultHasher`.
    fn value_hash(value: &V) -> u64 {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        hasher.finish()
    }

    /// Recursive helper for [`Hash`].
    fn node_hash_value(node: &Node<K, V>) -> u64 {
        match node {
            Node::Leaf { hash, value, .. } => {
                let accumulator = 1u64
                    .wrapping_mul(31)
                    .wrapping_add(u64::from(*hash));
                accumulator
                    .wrapping_mul(31)
                    .wrapping_add(Self::value_hash(value))
            }
            Node::Collision { hash, entries } => {
                let accumulator = 2u64
                    .wrapping_mul(31)
                    .wrapping_add(u64::from(*hash));
                let values = entries
                    .iter()
                    .map(|(_, value)| Self::value_hash(value))
                    .fold(0u64, u64::wrapping_add);
                accumulator.wrapping_mul(31).wrapping_add(values)
            }
            Node::Branch { bitmap, children } => {
                let accumulator = 3u64
                    .wrapping_mul(31)
                    .wrapping_add(u64::from(*bitmap));
                children.iter().fold(accumulator, |accumulator, child| {
                    accumulator
                        .wrapping_mul(31)
                        .wrapping_add(Self::node_hash_value(child))
                })
            }
        }
    }
}

impl<K: Clone + Hash + Eq + fmt::Debug, V: Clone + fmt::Debug> fmt::Debug for HamtMap<K, V> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.debug_map().entries(self.iter()).finish()
    }
}

impl<K, V, Q> Index<&Q> for HamtMap<K, V>
where
    K: Clone + Hash + Eq + Borrow<Q>,
    V: Clone,
    Q: Hash + Eq + ?Sized,
{
    type Output = V;

    /// Returns the value for the key.
    ///
    /// # Panics
    ///
    /// Panics if the key is not present in the map. Use [`HamtMap::get`] for
    /// a non-panicking lookup.
    fn index(&self, key: &Q) -> &V {
        self.get(key).expect("HamtMap: key not found")
    }
}

// =============================================================================
// Type Class Implementations
// =============================================================================

/// `HamtMap` is a container of values with the key type fixed.
impl<K, V> TypeConstructor for HamtMap<K, V> {
    type Inner = V;
    type WithType<B> = HamtMap<K, B>;
}

/// Maps combine by left-biased union.
impl<K: Clone + Hash + Eq, V: Clone> Semigroup for HamtMap<K, V> {
    fn combine(self, other: Self) -> Self {
        self.union(&other)
    }
}

/// The empty map is the identity of union.
impl<K: Clone + Hash + Eq, V: Clone> Monoid for HamtMap<K, V> {
    fn empty() -> Self {
        Self::new()
    }
}

impl<K: Clone + Hash + Eq, V: Clone> Functor for HamtMap<K, V> {
    fn fmap<B, F>(self, mut function: F) -> HamtMap<K, B>
    where
        F: FnMut(V) -> B,
    {
        self.map_values(|value| function(value.clone()))
    }

    fn fmap_ref<B, F>(&self, function: F) -> HamtMap<K, B>
    where
        F: FnMut(&V) -> B,
    {
        self.map_values(function)
    }
}

impl<K: Clone + Hash + Eq, V: Clone> Foldable for HamtMap<K, V> {
    fn fold_left<B, F>(self, init: B, mut function: F) -> B
    where
        F: FnMut(B, V) -> B,
    {
        self.fold_with_key(init, |accumulator, _, value| {
            function(accumulator, value.clone())
        })
    }

    fn fold_right<B, F>(self, init: B, mut function: F) -> B
    where
        F: FnMut(V, B) -> B,
    {
        self.fold_right_with_key(init, |_, value, accumulator| {
            function(value.clone(), accumulator)
        })
    }

    #[inline]
    fn length(&self) -> usize {
        self.length
    }
}

// =============================================================================
// Serde Support
// =============================================================================

#[cfg(feature = "serde")]
impl<K, V> serde::Serialize for HamtMap<K, V>
where
    K: serde::Serialize + Clone + Hash + Eq,
    V: serde::Serialize + Clone,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(self.len()))?;
        for (key, value) in self {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

#[cfg(feature = "serde")]
struct HamtMapVisitor<K, V> {
    key_marker: std::marker::PhantomData<K>,
    value_marker: std::marker::PhantomData<V>,
}

#[cfg(feature = "serde")]
impl<K, V> HamtMapVisitor<K, V> {
    const fn new() -> Self {
        Self {
            key_marker: std::marker::PhantomData,
            value_marker: std::marker::PhantomData,
        }
    }
}

#[cfg(feature = "serde")]
impl<'de, K, V> serde::de::Visitor<'de> for HamtMapVisitor<K, V>
where
    K: serde::Deserialize<'de> + Clone + Hash + Eq,
    V: serde::Deserialize<'de> + Clone,
{
    type Value = HamtMap<K, V>;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a map")
    }

    fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
    where
        A: serde::de::MapAccess<'de>,
    {
        let mut map = HamtMap::new();
        while let Some((key, value)) = access.next_entry()? {
            map = map.insert(key, value);
        }
        Ok(map)
    }
}

#[cfg(feature = "serde")]
impl<'de, K, V> serde::Deserialize<'de> for HamtMap<K, V>
where
    K: serde::Deserialize<'de> + Clone + Hash + Eq,
    V: serde::Deserialize<'de> + Clone,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_map(HamtMapVisitor::new())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn test_new_creates_empty() {
        let map: HamtMap<String, i32> = HamtMap::new();
        assert!(map.is_empty());
        assert_eq!(map.len(), 0);
        assert!(map.invariants_hold());
    }

    #[rstest]
    fn test_singleton() {
        let map = HamtMap::singleton("key".to_string(), 42);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("key"), Some(&42));
        assert!(map.invariants_hold());
    }

    #[rstest]
    fn test_insert_and_get() {
        let map = HamtMap::new()
            .insert("one".to_string(), 1)
            .insert("two".to_string(), 2);

        assert_eq!(map.len(), 2);
        assert_eq!(map.get("one"), Some(&1));
        assert_eq!(map.get("two"), Some(&2));
        assert_eq!(map.get("three"), None);
    }

    #[rstest]
    fn test_insert_overwrite() {
        let map1 = HamtMap::new().insert("key".to_string(), 1);
        let map2 = map1.insert("key".to_string(), 2);

        assert_eq!(map1.get("key"), Some(&1));
        assert_eq!(map2.get("key"), Some(&2));
        assert_eq!(map1.len(), 1);
        assert_eq!(map2.len(), 1);
    }

    #[rstest]
    fn test_insert_with_combines() {
        let map = HamtMap::new()
            .insert_with("x".to_string(), 1, |new, old| new + old)
            .insert_with("x".to_string(), 2, |new, old| new + old);

        assert_eq!(map.get("x"), Some(&3));
        assert_eq!(map.len(), 1);
    }

    #[rstest]
    fn test_remove() {
        let map = HamtMap::new()
            .insert("a".to_string(), 1)
            .insert("b".to_string(), 2);
        let removed = map.remove("a");

        assert_eq!(removed.len(), 1);
        assert_eq!(removed.get("a"), None);
        assert_eq!(removed.get("b"), Some(&2));
        assert!(removed.invariants_hold());
    }

    #[rstest]
    fn test_union_left_biased() {
        let left = HamtMap::new().insert(1, 'a').insert(2, 'b');
        let right = HamtMap::new().insert(2, 'c').insert(3, 'd');

        let merged = left.union(&right);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged.get(&2), Some(&'b'));
        assert!(merged.invariants_hold());
    }

    #[rstest]
    fn test_filter() {
        let map: HamtMap<i32, i32> = (1..=10).map(|index| (index, index)).collect();
        let even = map.filter(|value| value % 2 == 0);

        assert_eq!(even.len(), 5);
        assert!(even.invariants_hold());
    }

    #[rstest]
    fn test_fold() {
        let map = HamtMap::new()
            .insert("a".to_string(), 1)
            .insert("b".to_string(), 2)
            .insert("c".to_string(), 3);

        let sum = map.fold(0, |accumulator, value| accumulator + value);
        assert_eq!(sum, 6);
    }

    #[rstest]
    fn test_eq_ignores_insertion_order() {
        let map1 = HamtMap::new()
            .insert("a".to_string(), 1)
            .insert("b".to_string(), 2);
        let map2 = HamtMap::new()
            .insert("b".to_string(), 2)
            .insert("a".to_string(), 1);

        assert_eq!(map1, map2);
    }

    #[rstest]
    fn test_from_iter_last_wins() {
        let map: HamtMap<String, i32> = vec![
            ("a".to_string(), 1),
            ("b".to_string(), 2),
            ("a".to_string(), 3),
        ]
        .into_iter()
        .collect();

        assert_eq!(map.len(), 2);
        assert_eq!(map.get("a"), Some(&3));
    }

    #[rstest]
    #[should_panic(expected = "key not found")]
    fn test_index_panics_on_absent_key() {
        let map: HamtMap<String, i32> = HamtMap::new();
        let _ = map[&"missing".to_string()];
    }
}
