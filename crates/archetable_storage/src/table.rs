//! Columnar tables.
//!
//! A table stores every entity whose type equals its [`Archetype`]. Rows are
//! dense: removing a row swaps the last row into its place. Each table keeps
//! a `dirty_state` array; slot 0 counts membership changes and slot `c + 1`
//! counts writes to column `c`.

use std::collections::HashMap;
use std::fmt;

use archetable_foundation::{EntityId, Id, Value};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::archetype::Archetype;
use crate::conflict::AccessCounters;
use crate::schema::ComponentHooks;

/// Table identifier. Never reused after a table is deleted.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TableId(pub u32);

impl TableId {
    /// The root table, with the empty type.
    pub const ROOT: Self = Self(0);
}

impl fmt::Debug for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TableId({})", self.0)
    }
}

/// Table lifecycle event, consumed by query caches.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TableEvent {
    /// A table was created.
    Created(TableId),
    /// A table was deleted.
    Deleted(TableId),
}

/// Layout of one column, derived from component metadata.
#[derive(Clone, Debug)]
pub struct ColumnSpec {
    /// The id stored in the column.
    pub id: Id,
    /// Value used for rows that did not receive one.
    pub default: Value,
    /// Lifecycle hooks.
    pub hooks: ComponentHooks,
}

/// Values of one id, one per row.
#[derive(Debug)]
pub struct Column {
    spec: ColumnSpec,
    values: Vec<Value>,
    access: AccessCounters,
}

impl Column {
    /// The id stored in the column.
    #[must_use]
    pub fn id(&self) -> Id {
        self.spec.id
    }

    /// Values, indexed by row.
    #[must_use]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Values, mutably. Writes through this slice are not marked dirty.
    pub fn values_mut(&mut self) -> &mut [Value] {
        &mut self.values
    }

    /// Lifecycle hooks.
    #[must_use]
    pub fn hooks(&self) -> &ComponentHooks {
        &self.spec.hooks
    }

    /// Conflict counters.
    #[must_use]
    pub fn access(&self) -> &AccessCounters {
        &self.access
    }

    fn construct(&self) -> Value {
        match self.spec.hooks.ctor {
            Some(ctor) => ctor(),
            None => self.spec.default.clone(),
        }
    }
}

/// Cached transitions to neighbouring tables.
#[derive(Debug, Default, Clone)]
pub struct TableEdges {
    /// Destination when an id is added.
    pub add: HashMap<Id, TableId>,
    /// Destination when an id is removed.
    pub remove: HashMap<Id, TableId>,
}

/// A table (archetype) and its rows.
#[derive(Debug)]
pub struct Table {
    id: TableId,
    archetype: Archetype,
    entities: Vec<EntityId>,
    columns: Vec<Column>,
    column_map: Vec<Option<u32>>,
    dirty_state: Vec<i32>,
    /// Cached graph edges.
    pub edges: TableEdges,
}

impl Table {
    /// Creates an empty table. `columns` must list, in type order, the ids
    /// of `archetype` that store values in the table.
    ///
    /// # Panics
    ///
    /// Panics if a column id is not part of the archetype.
    #[must_use]
    pub fn new(id: TableId, archetype: Archetype, columns: Vec<ColumnSpec>, stage_count: usize) -> Self {
        let mut column_map = vec![None; archetype.len()];
        for (c, spec) in columns.iter().enumerate() {
            let index = archetype
                .index_of(spec.id)
                .expect("column id not in table type");
            #[allow(clippy::cast_possible_truncation)]
            {
                column_map[index] = Some(c as u32);
            }
        }
        let dirty_state = vec![0; columns.len() + 1];
        Self {
            id,
            archetype,
            entities: Vec::new(),
            columns: columns
                .into_iter()
                .map(|spec| Column {
                    spec,
                    values: Vec::new(),
                    access: AccessCounters::new(stage_count),
                })
                .collect(),
            column_map,
            dirty_state,
            edges: TableEdges::default(),
        }
    }

    /// The table id.
    #[must_use]
    pub fn id(&self) -> TableId {
        self.id
    }

    /// The table type.
    #[must_use]
    pub fn archetype(&self) -> &Archetype {
        &self.archetype
    }

    /// Entities, indexed by row.
    #[must_use]
    pub fn entities(&self) -> &[EntityId] {
        &self.entities
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Returns true if the table has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Columns.
    #[must_use]
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Column by index.
    #[must_use]
    pub fn column(&self, c: u32) -> Option<&Column> {
        self.columns.get(c as usize)
    }

    /// Column by index, mutably.
    pub fn column_mut(&mut self, c: u32) -> Option<&mut Column> {
        self.columns.get_mut(c as usize)
    }

    /// Type index → column index.
    #[must_use]
    pub fn column_map(&self) -> &[Option<u32>] {
        &self.column_map
    }

    /// Column storing `id`, if the id is in the type and has a column.
    #[must_use]
    pub fn column_index(&self, id: Id) -> Option<u32> {
        self.archetype
            .index_of(id)
            .and_then(|i| self.column_map[i])
    }

    /// Column for a type index.
    #[must_use]
    pub fn column_for_type_index(&self, index: usize) -> Option<u32> {
        self.column_map.get(index).copied().flatten()
    }

    /// Membership and per-column write counters.
    #[must_use]
    pub fn dirty_state(&self) -> &[i32] {
        &self.dirty_state
    }

    /// Value at `(row, column)`.
    #[must_use]
    pub fn get(&self, row: u32, c: u32) -> Option<&Value> {
        self.columns.get(c as usize)?.values.get(row as usize)
    }

    /// Value at `(row, column)`, mutably. Does not mark the column dirty.
    pub fn get_mut(&mut self, row: u32, c: u32) -> Option<&mut Value> {
        self.columns.get_mut(c as usize)?.values.get_mut(row as usize)
    }

    /// Marks column `c` written.
    ///
    /// # Panics
    ///
    /// Panics if `c` is not a column of this table.
    pub fn touch(&mut self, c: u32) {
        self.dirty_state[c as usize + 1] = self.dirty_state[c as usize + 1].wrapping_add(1);
    }

    fn bump_membership(&mut self) {
        self.dirty_state[0] = self.dirty_state[0].wrapping_add(1);
    }

    /// Appends a row with default values. Returns the row.
    #[allow(clippy::cast_possible_truncation)]
    pub fn append(&mut self, entity: EntityId) -> u32 {
        let row = self.entities.len() as u32;
        self.entities.push(entity);
        for column in &mut self.columns {
            let value = column.construct();
            column.values.push(value);
        }
        self.bump_membership();
        row
    }

    /// Appends many rows with a single membership bump. Returns the first
    /// row.
    #[allow(clippy::cast_possible_truncation)]
    pub fn append_n(&mut self, entities: &[EntityId]) -> u32 {
        let first = self.entities.len() as u32;
        self.entities.extend_from_slice(entities);
        for column in &mut self.columns {
            column.values.reserve(entities.len());
            for _ in entities {
                let value = column.construct();
                column.values.push(value);
            }
        }
        self.bump_membership();
        first
    }

    /// Removes a row, running `on_remove` hooks. Returns the entity that was
    /// swapped into `row`, if any.
    ///
    /// # Panics
    ///
    /// Panics if `row` is out of bounds.
    pub fn delete_row(&mut self, row: u32) -> Option<EntityId> {
        let row = row as usize;
        let entity = self.entities[row];
        for column in &mut self.columns {
            let value = column.values.swap_remove(row);
            if let Some(on_remove) = column.spec.hooks.on_remove {
                on_remove(entity, &value);
            }
        }
        self.entities.swap_remove(row);
        self.bump_membership();
        self.entities.get(row).copied()
    }

    /// Physically reorders rows so that row `i` holds what was at
    /// `order[i]`. Entity records must be fixed up by the caller. Row
    /// positions change, so the membership counter moves.
    ///
    /// # Panics
    ///
    /// Panics if `order` is not a permutation of the rows.
    pub fn permute(&mut self, order: &[usize]) {
        assert_eq!(order.len(), self.entities.len(), "permutation size mismatch");
        self.entities = order.iter().map(|&i| self.entities[i]).collect();
        for column in &mut self.columns {
            let mut old = std::mem::take(&mut column.values);
            column.values = order.iter().map(|&i| std::mem::take(&mut old[i])).collect();
        }
        self.bump_membership();
    }
}

/// Moves the row of `entity` at `row` from `src` to `dst`.
///
/// Values of ids present in both tables are moved (through `on_move`),
/// ids only in `dst` are default-constructed, ids only in `src` are dropped
/// after `on_remove`. Returns the new row in `dst` and the entity swapped
/// into `row` in `src`.
///
/// # Panics
///
/// Panics if `row` is out of bounds in `src`.
#[allow(clippy::cast_possible_truncation)]
pub fn move_row(src: &mut Table, row: u32, dst: &mut Table) -> (u32, Option<EntityId>) {
    let r = row as usize;
    let entity = src.entities[r];
    let dst_row = dst.entities.len() as u32;
    dst.entities.push(entity);

    for column in &mut dst.columns {
        let value = match src.archetype.index_of(column.spec.id).and_then(|i| src.column_map[i]) {
            Some(c) => {
                let value = std::mem::take(&mut src.columns[c as usize].values[r]);
                match column.spec.hooks.on_move {
                    Some(on_move) => on_move(entity, value),
                    None => value,
                }
            }
            None => column.construct(),
        };
        column.values.push(value);
    }

    for column in &mut src.columns {
        let value = column.values.swap_remove(r);
        if !dst.archetype.contains(column.spec.id) {
            if let Some(on_remove) = column.spec.hooks.on_remove {
                on_remove(entity, &value);
            }
        }
    }
    src.entities.swap_remove(r);
    src.bump_membership();
    dst.bump_membership();
    (dst_row, src.entities.get(r).copied())
}

/// All tables, indexed by id and by type.
#[derive(Debug, Default)]
pub struct TableStore {
    tables: Vec<Option<Table>>,
    by_type: HashMap<Archetype, TableId>,
}

impl TableStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Table by id.
    #[must_use]
    pub fn get(&self, id: TableId) -> Option<&Table> {
        self.tables.get(id.0 as usize).and_then(Option::as_ref)
    }

    /// Table by id, mutably.
    pub fn get_mut(&mut self, id: TableId) -> Option<&mut Table> {
        self.tables.get_mut(id.0 as usize).and_then(Option::as_mut)
    }

    /// Two distinct tables, mutably.
    ///
    /// # Panics
    ///
    /// Panics if `a == b` or either table does not exist.
    pub fn pair_mut(&mut self, a: TableId, b: TableId) -> (&mut Table, &mut Table) {
        assert_ne!(a, b, "pair_mut requires distinct tables");
        let (ai, bi) = (a.0 as usize, b.0 as usize);
        let (lo, hi) = if ai < bi { (ai, bi) } else { (bi, ai) };
        let (left, right) = self.tables.split_at_mut(hi);
        let lo_table = left[lo].as_mut().expect("table deleted");
        let hi_table = right[0].as_mut().expect("table deleted");
        if ai < bi {
            (lo_table, hi_table)
        } else {
            (hi_table, lo_table)
        }
    }

    /// Table with exactly `archetype`, if it exists.
    #[must_use]
    pub fn find(&self, archetype: &Archetype) -> Option<TableId> {
        self.by_type.get(archetype).copied()
    }

    /// Id the next inserted table will get.
    ///
    /// # Panics
    ///
    /// Panics if the table id space is exhausted.
    #[must_use]
    pub fn next_id(&self) -> TableId {
        TableId(u32::try_from(self.tables.len()).expect("table id space exhausted"))
    }

    /// Inserts a table built with [`Self::next_id`].
    pub fn insert(&mut self, table: Table) -> TableId {
        let id = table.id;
        debug_assert_eq!(id, self.next_id());
        self.by_type.insert(table.archetype.clone(), id);
        self.tables.push(Some(table));
        id
    }

    /// Removes a table.
    pub fn remove(&mut self, id: TableId) -> Option<Table> {
        let table = self.tables.get_mut(id.0 as usize)?.take()?;
        self.by_type.remove(&table.archetype);
        for other in self.tables.iter_mut().flatten() {
            other.edges.add.retain(|_, t| *t != id);
            other.edges.remove.retain(|_, t| *t != id);
        }
        Some(table)
    }

    /// Live tables in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Table> + '_ {
        self.tables.iter().flatten()
    }

    /// Number of live tables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_type.len()
    }

    /// Returns true if there are no tables.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }
}
