//! Deterministic hash-based naming for bridged types and methods.
//!
//! Native type *identity* is Rust's [`std::any::TypeId`]; it is unique but
//! opaque and not stable across builds. [`TypeHash`] complements it with a
//! 64-bit hash computed from the name a type is registered under, which gives:
//!
//! - Name lookups on the host side (`lookup_by_name`) with a single map lookup
//! - Override table keys that need no string allocation per lookup
//! - Same name = same hash, across bridges and processes
//!
//! # Hash Computation
//!
//! Uses XXHash64 with domain-specific mixing constants so that a type and a
//! method sharing a name never collide.
//!
//! # Examples
//!
//! ```
//! use bindery_core::TypeHash;
//!
//! let point = TypeHash::from_name("geometry::Point");
//! assert_eq!(point, TypeHash::from_name("geometry::Point"));
//! assert_ne!(
//!     TypeHash::from_method(point, "norm"),
//!     TypeHash::from_method(TypeHash::from_name("geometry::Line"), "norm"),
//! );
//! ```

use std::fmt;
use xxhash_rust::xxh64::xxh64;

/// Domain-specific mixing constants for hash computation.
pub mod hash_constants {
    /// Domain marker for type hashes
    pub const TYPE: u64 = 0x2fac10b63a6cc57c;

    /// Domain marker for method hashes
    pub const METHOD: u64 = 0x7d3c8b4a92e15f6d;
}

/// A deterministic 64-bit hash naming a type or method.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct TypeHash(pub u64);

impl TypeHash {
    /// Create a type hash from a qualified type name.
    #[inline]
    pub fn from_name(name: &str) -> Self {
        TypeHash(hash_constants::TYPE ^ xxh64(name.as_bytes(), 0))
    }

    /// Create a method hash from the owner type and method name.
    ///
    /// Used to key host-side overrides of native virtual methods, where the
    /// override is looked up by name alone.
    #[inline]
    pub fn from_method(owner: TypeHash, name: &str) -> Self {
        TypeHash(hash_constants::METHOD ^ owner.0.rotate_left(17) ^ xxh64(name.as_bytes(), 0))
    }
}

impl fmt::Debug for TypeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeHash({:#018x})", self.0)
    }
}

impl fmt::Display for TypeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_hash_determinism() {
        assert_eq!(TypeHash::from_name("Widget"), TypeHash::from_name("Widget"));
        assert_ne!(TypeHash::from_name("Widget"), TypeHash::from_name("Gadget"));
    }

    #[test]
    fn method_hash_depends_on_owner() {
        let shape = TypeHash::from_name("Shape");
        let circle = TypeHash::from_name("Circle");

        let area = TypeHash::from_method(shape, "area");
        assert_eq!(area, TypeHash::from_method(shape, "area"));
        assert_ne!(area, TypeHash::from_method(circle, "area"));
        assert_ne!(area, TypeHash::from_method(shape, "perimeter"));
    }

    #[test]
    fn type_and_method_domains_differ() {
        let owner = TypeHash::from_name("Shape");
        assert_ne!(TypeHash::from_name("area"), TypeHash::from_method(owner, "area"));
    }

    #[test]
    fn hash_display() {
        let hash = TypeHash(0x1234);
        assert_eq!(format!("{hash}"), "0x0000000000001234");
        assert_eq!(format!("{hash:?}"), "TypeHash(0x0000000000001234)");
    }
}
