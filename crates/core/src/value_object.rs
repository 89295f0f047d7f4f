//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Value objects are **immutable** and **compared by value**. Constructors are
/// expected to validate and normalize, so a value that exists is a valid one
/// (e.g. a username that has already been lower-cased and length-checked).
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
