//! Type classes for functional programming.
//!
//! This module provides the algebraic abstractions the persistent map
//! participates in:
//!
//! - [`TypeConstructor`]: Higher-Kinded Type emulation via GAT
//! - [`Semigroup`]: associative `combine`
//! - [`Monoid`]: semigroup with an identity element
//! - [`Functor`]: structure-preserving mapping
//! - [`Foldable`]: reduction to a summary value
//!
//! Implementations are provided for the standard containers the crate works
//! with (`Option`, `Vec`, `String`, ...) and for
//! [`HamtMap`](crate::map::HamtMap).

mod foldable;
mod functor;
mod higher;
mod monoid;
mod semigroup;

pub use foldable::Foldable;
pub use functor::Functor;
pub use higher::TypeConstructor;
pub use monoid::Monoid;
pub use semigroup::Semigroup;
