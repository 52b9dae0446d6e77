//! Dense/sparse storage for components that live outside table columns.
//!
//! Values are packed in a dense array alongside their owning entity; a
//! sparse array indexed by entity index points into it. Removal swaps the
//! last element into the hole, so dense order is not stable across removals.

use archetable_foundation::EntityId;

const EMPTY: u32 = u32::MAX;

/// A sparse set keyed by entity.
#[derive(Debug, Clone)]
pub struct SparseSet<T> {
    dense: Vec<EntityId>,
    values: Vec<T>,
    sparse: Vec<u32>,
}

impl<T> Default for SparseSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SparseSet<T> {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            dense: Vec::new(),
            values: Vec::new(),
            sparse: Vec::new(),
        }
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.dense.len()
    }

    /// Returns true if the set holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dense.is_empty()
    }

    fn dense_index(&self, entity: EntityId) -> Option<usize> {
        let slot = *self.sparse.get(entity.index() as usize)?;
        if slot == EMPTY {
            return None;
        }
        let slot = slot as usize;
        (self.dense[slot] == entity).then_some(slot)
    }

    /// Returns true if `entity` has an entry.
    #[must_use]
    pub fn contains(&self, entity: EntityId) -> bool {
        self.dense_index(entity).is_some()
    }

    /// Returns the value stored for `entity`.
    #[must_use]
    pub fn get(&self, entity: EntityId) -> Option<&T> {
        self.dense_index(entity).map(|i| &self.values[i])
    }

    /// Returns the value stored for `entity`, mutably.
    pub fn get_mut(&mut self, entity: EntityId) -> Option<&mut T> {
        self.dense_index(entity).map(|i| &mut self.values[i])
    }

    /// Inserts or replaces the value for `entity`. Returns the old value.
    #[allow(clippy::cast_possible_truncation)]
    pub fn insert(&mut self, entity: EntityId, value: T) -> Option<T> {
        if let Some(i) = self.dense_index(entity) {
            return Some(std::mem::replace(&mut self.values[i], value));
        }
        let index = entity.index() as usize;
        if index >= self.sparse.len() {
            self.sparse.resize(index + 1, EMPTY);
        }
        self.sparse[index] = self.dense.len() as u32;
        self.dense.push(entity);
        self.values.push(value);
        None
    }

    /// Removes the entry for `entity`, returning its value.
    #[allow(clippy::cast_possible_truncation)]
    pub fn remove(&mut self, entity: EntityId) -> Option<T> {
        let i = self.dense_index(entity)?;
        self.sparse[entity.index() as usize] = EMPTY;
        self.dense.swap_remove(i);
        let value = self.values.swap_remove(i);
        if let Some(moved) = self.dense.get(i) {
            self.sparse[moved.index() as usize] = i as u32;
        }
        Some(value)
    }

    /// Entity stored at dense position `i`.
    #[must_use]
    pub fn entity_at(&self, i: usize) -> Option<EntityId> {
        self.dense.get(i).copied()
    }

    /// Entities in dense order.
    #[must_use]
    pub fn entities(&self) -> &[EntityId] {
        &self.dense
    }

    /// Iterates `(entity, value)` in dense order.
    pub fn iter(&self) -> impl Iterator<Item = (EntityId, &T)> {
        self.dense.iter().copied().zip(self.values.iter())
    }
}
