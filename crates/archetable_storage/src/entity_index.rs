//! Entity lifecycle and location tracking.
//!
//! The `EntityIndex` maps an entity to its [`Record`] (table and row) and
//! tracks generations so that stale handles resolve to "not alive".
//!
//! Slots are dense up to the allocation frontier. Caller-chosen ids past the
//! frontier live in an ordered side map and are folded into the dense range
//! when [`EntityIndex::spawn`] reaches them, so reserving a high id costs one
//! entry rather than every index below it.

use std::collections::BTreeMap;

use archetable_foundation::{EntityId, Error, Result, builtin};

use crate::table::TableId;

/// Flag bits stored on an entity record.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct RecordFlags(u8);

impl RecordFlags {
    /// Entity is the second element of at least one pair.
    pub const IS_TARGET: Self = Self(1);
    /// Entity is the target of a traversable relationship.
    pub const IS_TRAVERSABLE: Self = Self(1 << 1);
    /// Entity has data in at least one non-fragmenting sparse set.
    pub const HAS_DONT_FRAGMENT: Self = Self(1 << 2);

    /// Returns true if all bits of `other` are set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Sets the bits of `other`.
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Clears the bits of `other`.
    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

/// Where an entity lives.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Record {
    /// Table holding the entity, `None` until it is placed.
    pub table: Option<TableId>,
    /// Row in the table.
    pub row: u32,
    /// Flag bits.
    pub flags: RecordFlags,
}

#[derive(Debug, Clone, Default)]
struct Slot {
    generation: u16,
    alive: bool,
    record: Record,
}

/// Manages entity allocation, liveness and records.
///
/// Indices below [`builtin::FIRST_USER_INDEX`] are reserved for builtin
/// entities and are never handed out by [`EntityIndex::spawn`].
#[derive(Debug, Clone)]
pub struct EntityIndex {
    slots: Vec<Slot>,
    far: BTreeMap<u32, Slot>,
    free_list: Vec<u32>,
    live_count: usize,
}

impl Default for EntityIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityIndex {
    /// Creates an index with the reserved range allocated but dead.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: vec![Slot::default(); builtin::FIRST_USER_INDEX as usize],
            far: BTreeMap::new(),
            free_list: Vec::new(),
            live_count: 0,
        }
    }

    fn slot(&self, index: u32) -> Option<&Slot> {
        self.slots
            .get(index as usize)
            .or_else(|| self.far.get(&index))
    }

    fn slot_mut(&mut self, index: u32) -> Option<&mut Slot> {
        if (index as usize) < self.slots.len() {
            self.slots.get_mut(index as usize)
        } else {
            self.far.get_mut(&index)
        }
    }

    fn slot_or_insert(&mut self, index: u32) -> &mut Slot {
        if (index as usize) < self.slots.len() {
            &mut self.slots[index as usize]
        } else {
            self.far.entry(index).or_default()
        }
    }

    /// Allocates a new entity, reusing retired indices first.
    ///
    /// # Panics
    ///
    /// Panics if the 32-bit index space is exhausted.
    pub fn spawn(&mut self) -> EntityId {
        while let Some(index) = self.free_list.pop() {
            let Some(slot) = self.slot_mut(index) else {
                continue;
            };
            if slot.alive {
                // Revived through make_alive while on the free list.
                continue;
            }
            slot.alive = true;
            slot.record = Record::default();
            let generation = slot.generation;
            self.live_count += 1;
            return EntityId::new(index, generation);
        }
        loop {
            let index = u32::try_from(self.slots.len()).expect("entity index space exhausted");
            let mut slot = self.far.remove(&index).unwrap_or_default();
            if slot.alive {
                self.slots.push(slot);
                continue;
            }
            slot.alive = true;
            slot.record = Record::default();
            let id = EntityId::new(index, slot.generation);
            self.slots.push(slot);
            self.live_count += 1;
            return id;
        }
    }

    /// Checks that `id` could be made alive without touching the index.
    ///
    /// # Errors
    ///
    /// Returns an error if `id` is null or a different generation of the
    /// same index is alive.
    pub fn check_claim(&self, id: EntityId) -> Result<()> {
        if id.is_null() {
            return Err(Error::entity_not_found(id));
        }
        match self.slot(id.index()) {
            Some(slot) if slot.alive && slot.generation != id.generation() => {
                Err(Error::stale_entity(id))
            }
            _ => Ok(()),
        }
    }

    /// Returns the record for `id`, creating the entity if it is not alive.
    ///
    /// # Errors
    ///
    /// Returns an error if a different generation of the same index is alive.
    pub fn ensure(&mut self, id: EntityId) -> Result<&mut Record> {
        self.make_alive(id)?;
        Ok(&mut self.slot_or_insert(id.index()).record)
    }

    /// Makes `id` alive with exactly its generation.
    ///
    /// # Errors
    ///
    /// Returns an error if `id` is null or a different generation of the
    /// same index is alive.
    pub fn make_alive(&mut self, id: EntityId) -> Result<()> {
        self.check_claim(id)?;
        let slot = self.slot_or_insert(id.index());
        if slot.alive {
            return Ok(());
        }
        slot.alive = true;
        slot.generation = id.generation();
        slot.record = Record::default();
        self.live_count += 1;
        Ok(())
    }

    /// Returns the record of a live entity.
    #[must_use]
    pub fn get(&self, id: EntityId) -> Option<&Record> {
        let slot = self.slot(id.index())?;
        (slot.alive && slot.generation == id.generation()).then_some(&slot.record)
    }

    /// Returns the record of a live entity, mutably.
    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut Record> {
        let slot = self.slot_mut(id.index())?;
        (slot.alive && slot.generation == id.generation()).then_some(&mut slot.record)
    }

    /// Returns true if `id` is alive with this exact generation.
    #[must_use]
    pub fn is_alive(&self, id: EntityId) -> bool {
        self.get(id).is_some()
    }

    /// Resolves an id whose generation may be unknown (e.g. a pair element)
    /// to the live entity at that index, or [`EntityId::NULL`].
    #[must_use]
    pub fn get_alive(&self, id: EntityId) -> EntityId {
        match self.slot(id.index()) {
            Some(slot) if slot.alive && !id.is_null() => EntityId::new(id.index(), slot.generation),
            _ => EntityId::NULL,
        }
    }

    /// Validates that an entity is live.
    ///
    /// # Errors
    ///
    /// Returns a stale-entity error if the index is alive with a different
    /// generation or was retired, and not-found if it was never allocated.
    pub fn validate(&self, id: EntityId) -> Result<()> {
        match self.slot(id.index()) {
            None => Err(Error::entity_not_found(id)),
            Some(slot) if slot.alive && slot.generation == id.generation() => Ok(()),
            Some(slot) if slot.alive || slot.generation != id.generation() => {
                Err(Error::stale_entity(id))
            }
            Some(_) => Err(Error::entity_not_found(id)),
        }
    }

    /// Retires an entity: the slot is freed and its generation bumped.
    ///
    /// Returns the last record, or `None` if `id` was not alive.
    pub fn remove(&mut self, id: EntityId) -> Option<Record> {
        let slot = self.slot_mut(id.index())?;
        if !slot.alive || slot.generation != id.generation() {
            return None;
        }
        slot.alive = false;
        slot.generation = slot.generation.wrapping_add(1);
        let record = std::mem::take(&mut slot.record);
        if id.index() >= builtin::FIRST_USER_INDEX {
            self.free_list.push(id.index());
        }
        self.live_count -= 1;
        Some(record)
    }

    /// Number of live entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.live_count
    }

    /// Returns true if there are no live entities.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live_count == 0
    }

    /// Iterates live entities in index order.
    pub fn iter(&self) -> impl Iterator<Item = EntityId> + '_ {
        #[allow(clippy::cast_possible_truncation)]
        let dense = self
            .slots
            .iter()
            .enumerate()
            .map(|(i, s)| (i as u32, s));
        let far = self.far.iter().map(|(&i, s)| (i, s));
        dense
            .chain(far)
            .filter(|(_, s)| s.alive)
            .map(|(i, s)| EntityId::new(i, s.generation))
    }
}
