//! Change-detection monitors.
//!
//! A match monitor snapshots the dirty state of one cached table match:
//! slot 0 mirrors the table's membership counter, slot `f + 1` mirrors the
//! write counter of the column behind field `f`. Fields that are not read
//! or have no table column hold [`UNTRACKED`] and are never compared.
//!
//! Fixed-source terms live outside the cache; their columns are watched by
//! a single [`FixedMonitor`] per query.

use archetable_foundation::{EntityId, Id};
use archetable_storage::{TableId, World};

use crate::vm::FieldState;

/// Monitor slot of a field that is not watched.
pub const UNTRACKED: i32 = -1;

// =============================================================================
// Match Monitors
// =============================================================================

/// Creates a monitor that reports every tracked slot as changed until it is
/// first synchronized.
#[must_use]
pub fn new_monitor(fields: &[FieldState], tracked: &[bool]) -> Vec<i32> {
    let mut monitor = Vec::with_capacity(fields.len() + 1);
    monitor.push(0);
    for (f, field) in fields.iter().enumerate() {
        let watch = tracked.get(f).copied().unwrap_or(false) && field.column.is_some();
        monitor.push(if watch { 0 } else { UNTRACKED });
    }
    monitor
}

fn column_slot(field: &FieldState) -> Option<usize> {
    field.column.map(|c| c as usize + 1)
}

/// Returns true if `dirty` differs from the snapshot in any tracked slot.
#[must_use]
pub fn is_stale(monitor: &[i32], fields: &[FieldState], dirty: &[i32]) -> bool {
    if monitor.first() != dirty.first() {
        return true;
    }
    fields.iter().enumerate().any(|(f, field)| {
        let Some(&snapshot) = monitor.get(f + 1) else {
            return false;
        };
        if snapshot == UNTRACKED {
            return false;
        }
        column_slot(field)
            .and_then(|slot| dirty.get(slot))
            .is_some_and(|&current| current != snapshot)
    })
}

/// Copies the current dirty state into the tracked slots.
pub fn sync(monitor: &mut [i32], fields: &[FieldState], dirty: &[i32]) {
    if let (Some(slot), Some(&current)) = (monitor.first_mut(), dirty.first()) {
        *slot = current;
    }
    for (f, field) in fields.iter().enumerate() {
        let Some(snapshot) = monitor.get_mut(f + 1) else {
            continue;
        };
        if *snapshot == UNTRACKED {
            continue;
        }
        if let Some(&current) = column_slot(field).and_then(|slot| dirty.get(slot)) {
            *snapshot = current;
        }
    }
}

// =============================================================================
// Fixed-Source Monitor
// =============================================================================

/// A read field whose source is a fixed entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FixedField {
    /// Field index.
    pub field: usize,
    /// Source entity.
    pub entity: EntityId,
    /// Id read from the entity.
    pub id: Id,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FixedSlot {
    table: Option<TableId>,
    column: Option<u32>,
    value: i32,
}

impl FixedSlot {
    fn observe(world: &World, field: &FixedField) -> Self {
        let table = world.table_of(field.entity);
        let column = table.and_then(|t| world.column_index(t, field.id));
        let value = match (table, column) {
            (Some(t), Some(c)) => world
                .dirty_state(t)
                .and_then(|d| d.get(c as usize + 1))
                .copied()
                .unwrap_or(UNTRACKED),
            _ => UNTRACKED,
        };
        Self {
            table,
            column,
            value,
        }
    }
}

/// Snapshot of the columns read through fixed sources.
#[derive(Clone, Debug)]
pub struct FixedMonitor {
    fields: Vec<FixedField>,
    slots: Vec<FixedSlot>,
}

impl FixedMonitor {
    /// Snapshots the current state of `fields`.
    #[must_use]
    pub fn new(world: &World, fields: &[FixedField]) -> Self {
        Self {
            fields: fields.to_vec(),
            slots: fields.iter().map(|f| FixedSlot::observe(world, f)).collect(),
        }
    }

    /// Returns true if a watched column was written, or a source entity moved
    /// to another table, since the last snapshot.
    #[must_use]
    pub fn is_stale(&self, world: &World) -> bool {
        self.fields
            .iter()
            .zip(&self.slots)
            .any(|(field, slot)| FixedSlot::observe(world, field) != *slot)
    }

    /// Takes a new snapshot.
    pub fn update(&mut self, world: &World) {
        for (field, slot) in self.fields.iter().zip(self.slots.iter_mut()) {
            *slot = FixedSlot::observe(world, field);
        }
    }
}
