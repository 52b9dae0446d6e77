//! Table types: sorted, de-duplicated id lists.

use std::fmt;
use std::sync::Arc;

use archetable_foundation::Id;

/// The type of a table: a sorted set of ids.
///
/// Cloning is O(1); the id slice is shared. Tables are looked up by
/// archetype, so equal archetypes always resolve to the same table.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Archetype {
    ids: Arc<[Id]>,
}

impl Archetype {
    /// The empty type (root table).
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Creates an archetype from ids in any order.
    #[must_use]
    pub fn new(mut ids: Vec<Id>) -> Self {
        ids.sort_unstable();
        ids.dedup();
        Self { ids: ids.into() }
    }

    /// The sorted ids.
    #[must_use]
    pub fn ids(&self) -> &[Id] {
        &self.ids
    }

    /// Number of ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Returns true for the empty type.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Position of `id` in the type.
    #[must_use]
    pub fn index_of(&self, id: Id) -> Option<usize> {
        self.ids.binary_search(&id).ok()
    }

    /// Returns true if the type contains `id`.
    #[must_use]
    pub fn contains(&self, id: Id) -> bool {
        self.index_of(id).is_some()
    }

    /// Type with `id` inserted, or `None` if already present.
    #[must_use]
    pub fn with_id(&self, id: Id) -> Option<Self> {
        match self.ids.binary_search(&id) {
            Ok(_) => None,
            Err(pos) => {
                let mut ids = Vec::with_capacity(self.ids.len() + 1);
                ids.extend_from_slice(&self.ids[..pos]);
                ids.push(id);
                ids.extend_from_slice(&self.ids[pos..]);
                Some(Self { ids: ids.into() })
            }
        }
    }

    /// Type with `id` removed, or `None` if absent.
    #[must_use]
    pub fn without_id(&self, id: Id) -> Option<Self> {
        let pos = self.ids.binary_search(&id).ok()?;
        let mut ids = Vec::with_capacity(self.ids.len() - 1);
        ids.extend_from_slice(&self.ids[..pos]);
        ids.extend_from_slice(&self.ids[pos + 1..]);
        Some(Self { ids: ids.into() })
    }

    /// Ids matching a (possibly wildcard) pattern, with their type index.
    pub fn matching(&self, pattern: Id) -> impl Iterator<Item = (usize, Id)> + '_ {
        self.ids
            .iter()
            .copied()
            .enumerate()
            .filter(move |(_, id)| pattern.matches(*id))
    }
}

impl fmt::Debug for Archetype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, id) in self.ids.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{id}")?;
        }
        write!(f, "]")
    }
}
