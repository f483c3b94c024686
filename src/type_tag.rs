//! Deterministic hash-based class identity.
//!
//! [`TypeTag`] is a 64-bit hash computed from a class's declared name. The
//! same name always produces the same tag, so tags can be computed before
//! registration and carry no registration-order dependency. Tags key the
//! per-runtime metatable registry and the class registry.

use std::fmt;

use xxhash_rust::xxh64::xxh64;

/// Domain marker mixed into every class-name hash, keeping class tags
/// distinct from any other hashed namespace that may share names.
const CLASS_DOMAIN: u64 = 0x6b1a_59cf_03d4_82e7;

/// A deterministic 64-bit tag identifying a registered native class.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct TypeTag(pub u64);

impl TypeTag {
    /// Compute the tag for a class name. Deterministic: the same name always
    /// yields the same tag.
    pub fn from_name(name: &str) -> Self {
        TypeTag(xxh64(name.as_bytes(), CLASS_DOMAIN))
    }
}

impl fmt::Debug for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeTag({:#018x})", self.0)
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}
