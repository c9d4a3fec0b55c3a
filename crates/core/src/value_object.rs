//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Value objects are **immutable** and **compared by value**: two value
/// objects with the same attribute values are equal. Entities, by contrast,
/// are the same only when their identifiers match.
///
/// The bounds keep value objects cheap to copy, comparable and debuggable.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
