//! # Canonical Module
//!
//! The boundary between the database's native type system and everything
//! downstream. `event` defines the closed, serializable event shape and
//! `canonicalizer` is the single place where BSON-specific scalars are turned
//! into strings.

/// The canonical event shape and operation kinds.
pub mod event;
/// Raw change record to canonical event conversion.
pub mod canonicalizer;

pub use canonicalizer::{canonical_value, canonicalize, RawRecord};
pub use event::{to_iso_millis, CanonicalEvent, OperationKind};
