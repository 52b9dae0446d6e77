//! Entity identifiers with generational indices.

use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Entity identifier with a generation counter for stale handle detection.
///
/// # Layout
/// - bits `0..32`: index into the entity index
/// - bits `32..48`: generation, bumped every time the index is retired
///
/// The upper bits are left clear so an entity id can be used directly as a
/// component id (see [`crate::Id`]).
#[derive(Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EntityId(u64);

impl EntityId {
    /// The "no entity" value.
    pub const NULL: Self = Self(0);

    /// Mask covering the index bits.
    pub const INDEX_MASK: u64 = 0xFFFF_FFFF;

    /// Mask covering the generation bits (already shifted).
    pub const GENERATION_MASK: u64 = 0xFFFF << 32;

    /// Creates an entity id from an index and a generation.
    #[must_use]
    pub const fn new(index: u32, generation: u16) -> Self {
        Self(((generation as u64) << 32) | index as u64)
    }

    /// Reinterprets raw bits as an entity id.
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Returns the raw bits.
    #[must_use]
    pub const fn to_bits(self) -> u64 {
        self.0
    }

    /// Returns the index part.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn index(self) -> u32 {
        (self.0 & Self::INDEX_MASK) as u32
    }

    /// Returns the generation part.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn generation(self) -> u16 {
        ((self.0 & Self::GENERATION_MASK) >> 32) as u16
    }

    /// Returns the same index with the generation cleared.
    ///
    /// Pair ids only store indices, so elements read back from a pair come
    /// out stripped and have to be resolved through the entity index.
    #[must_use]
    pub const fn strip_generation(self) -> Self {
        Self(self.0 & Self::INDEX_MASK)
    }

    /// Returns the id with its generation bumped by one (wrapping).
    #[must_use]
    pub const fn next_generation(self) -> Self {
        Self::new(self.index(), self.generation().wrapping_add(1))
    }

    /// Returns true if this is the null entity.
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "EntityId(null)")
        } else {
            write!(f, "EntityId({}v{})", self.index(), self.generation())
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "#null")
        } else {
            write!(f, "#{}", self.index())
        }
    }
}
