//! Query iteration.
//!
//! [`QueryIter`] pulls results from the VM one batch at a time. A batch is a
//! slice of rows of one table (or a single entity when `$this` is bound to
//! one) together with the state of every field. When the iterator moves
//! past a batch it marks the columns written through `Out`/`InOut` fields
//! as dirty. With monitors enabled, the monitor of a cached match is synced
//! once the iterator leaves the last slice of that match, or when iteration
//! completes. A match split into several slices by an ordering therefore
//! reports the same change for each of its slices.

use std::collections::{HashMap, HashSet};

use archetable_foundation::{EntityId, Error, ErrorKind, Id, Result, Value};
use archetable_storage::{AccessMode, TableId, World};
use log::{trace, warn};

use crate::cache::MatchId;
use crate::op::THIS;
use crate::query::Query;
use crate::term::Source;
use crate::vm::{Env, RunState, VarValue};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Resource {
    Column(TableId, u32),
    Sparse(Id),
}

/// Iterator over the results of a [`Query`].
pub struct QueryIter<'a> {
    query: &'a mut Query,
    world: &'a mut World,
    state: RunState,
    passive: bool,
    skipped: bool,
    finished: bool,
    fixed_changed: Option<bool>,
    touched: HashSet<(TableId, u32)>,
    last_slice: HashMap<MatchId, usize>,
    pending: HashMap<MatchId, bool>,
    held: Vec<(Resource, AccessMode)>,
    conflicts: usize,
    this_entity: EntityId,
}

impl<'a> QueryIter<'a> {
    pub(crate) fn new(query: &'a mut Query, world: &'a mut World, passive: bool) -> Self {
        let mut state = RunState::new(&query.compiled.program);
        if let Some(cache) = &query.cache {
            state.cache_entries = cache.entries(world, query.compiled.match_empty_tables);
        }
        let last_slice = state
            .cache_entries
            .iter()
            .enumerate()
            .map(|(i, entry)| (entry.match_id, i))
            .collect();
        Self {
            query,
            world,
            state,
            passive,
            skipped: false,
            finished: false,
            fixed_changed: None,
            touched: HashSet::new(),
            last_slice,
            pending: HashMap::new(),
            held: Vec::new(),
            conflicts: 0,
            this_entity: EntityId::NULL,
        }
    }

    /// Advances to the next batch. Returns false when the query is
    /// exhausted.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> bool {
        if self.finished {
            return false;
        }
        if self.state.started() {
            self.end_batch();
        }
        let prev_entry = self.state.cache_entry;
        let env = Env {
            world: self.world,
            cache: self.query.cache.as_ref(),
            match_empty: self.query.compiled.match_empty_tables,
        };
        let found = self.query.compiled.program.next(&env, &mut self.state);
        self.skipped = false;
        if let Some(prev) = prev_entry {
            if !found || self.state.cache_entry != Some(prev) {
                self.leave_entry(prev);
            }
        }
        if found {
            self.begin_batch();
        } else {
            self.finish();
        }
        found
    }

    fn begin_batch(&mut self) {
        self.this_entity = match self.state.vars.get(THIS) {
            Some(VarValue::Entity(e)) => *e,
            _ => EntityId::NULL,
        };
        if !self.world.config().check_access {
            return;
        }
        let mut wanted: Vec<(Resource, AccessMode)> = Vec::new();
        for (info, field) in self.query.compiled.fields.iter().zip(&self.state.fields) {
            if !field.is_set {
                continue;
            }
            let mode = if info.writes() {
                AccessMode::Write
            } else if info.reads() {
                AccessMode::Read
            } else {
                continue;
            };
            let resource = match (field.sparse, field.table, field.column) {
                (true, _, _) => Resource::Sparse(field.id),
                (false, Some(table), Some(column)) => Resource::Column(table, column),
                _ => continue,
            };
            match wanted.iter_mut().find(|(r, _)| *r == resource) {
                Some((_, held)) if mode == AccessMode::Write => *held = AccessMode::Write,
                Some(_) => {}
                None => wanted.push((resource, mode)),
            }
        }
        for (resource, mode) in wanted {
            let acquired = match resource {
                Resource::Column(table, column) => self.world.begin_column_access(table, column, mode),
                Resource::Sparse(id) => self.world.begin_sparse_access(id, mode),
            };
            match acquired {
                Ok(()) => self.held.push((resource, mode)),
                Err(err) => {
                    warn!("query [{}]: {err}", self.query.desc());
                    self.conflicts += 1;
                }
            }
        }
    }

    fn release(&mut self) {
        for (resource, mode) in self.held.drain(..) {
            match resource {
                Resource::Column(table, column) => self.world.end_column_access(table, column, mode),
                Resource::Sparse(id) => self.world.end_sparse_access(id, mode),
            }
        }
    }

    fn end_batch(&mut self) {
        self.release();
        if self.passive {
            return;
        }
        if let Some(entry) = self.state.cache_entry.and_then(|i| self.state.cache_entries.get(i)) {
            let syncable = !self.skipped;
            self.pending
                .entry(entry.match_id)
                .and_modify(|s| *s &= syncable)
                .or_insert(syncable);
        }
        if !self.skipped {
            self.mark_fields_dirty();
        }
    }

    /// Called when the VM moves off cache entry `index`. Syncs the match
    /// if that was its last slice.
    fn leave_entry(&mut self, index: usize) {
        let Some(entry) = self.state.cache_entries.get(index) else {
            return;
        };
        let match_id = entry.match_id;
        if self.last_slice.get(&match_id) != Some(&index) {
            return;
        }
        if let Some(syncable) = self.pending.remove(&match_id) {
            self.sync_match(match_id, syncable);
        }
    }

    fn sync_match(&mut self, match_id: MatchId, syncable: bool) {
        if !syncable || !self.query.monitors_enabled {
            return;
        }
        if let Some(cache) = &mut self.query.cache {
            cache.sync_monitor(self.world, match_id);
        }
    }

    /// Marks the `$this` columns written by the current batch, once per
    /// column per iteration.
    fn mark_fields_dirty(&mut self) {
        for (info, field) in self.query.compiled.fields.iter().zip(&self.state.fields) {
            if !info.writes() || info.src != Source::This || !field.is_set || !field.src.is_null() {
                continue;
            }
            let (Some(table), Some(column)) = (field.table, field.column) else {
                continue;
            };
            if self.touched.insert((table, column)) {
                self.world.touch(table, column);
            }
        }
    }

    /// Marks the columns written through fixed sources.
    fn mark_fixed_fields_dirty(&mut self) {
        for info in &self.query.compiled.fields {
            let Source::Entity(entity) = info.src else {
                continue;
            };
            if !info.writes() {
                continue;
            }
            let Some(table) = self.world.table_of(entity) else {
                continue;
            };
            if let Some(column) = self.world.column_index(table, info.id) {
                if self.touched.insert((table, column)) {
                    self.world.touch(table, column);
                }
            }
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        self.release();
        if self.passive {
            return;
        }
        self.mark_fixed_fields_dirty();
        let pending: Vec<(MatchId, bool)> = self.pending.drain().collect();
        for (match_id, syncable) in pending {
            self.sync_match(match_id, syncable);
        }
        if self.query.monitors_enabled {
            self.query.sync_fixed(self.world);
            if let Some(cache) = &mut self.query.cache {
                cache.sync_empty(self.world);
                cache.sync_topology();
            }
        }
        trace!(
            "query [{}] done, {} columns marked",
            self.query.desc(),
            self.touched.len()
        );
    }

    // =========================================================================
    // Batch
    // =========================================================================

    /// Number of `$this` rows in the batch. Zero if the query does not
    /// match on `$this`.
    #[must_use]
    pub fn count(&self) -> usize {
        match self.state.vars.get(THIS) {
            Some(VarValue::Table { count, .. }) => *count as usize,
            Some(VarValue::Entity(_)) => 1,
            _ => 0,
        }
    }

    /// The `$this` entities of the batch.
    #[must_use]
    pub fn entities(&self) -> &[EntityId] {
        match self.state.vars.get(THIS) {
            Some(&VarValue::Table {
                table,
                offset,
                count,
            }) => self
                .world
                .table(table)
                .and_then(|t| t.entities().get(offset as usize..(offset + count) as usize))
                .unwrap_or(&[]),
            Some(VarValue::Entity(_)) => std::slice::from_ref(&self.this_entity),
            _ => &[],
        }
    }

    /// Table of the batch.
    #[must_use]
    pub fn table(&self) -> Option<TableId> {
        match self.state.vars.get(THIS) {
            Some(VarValue::Table { table, .. }) => Some(*table),
            Some(VarValue::Entity(e)) => self.world.table_of(*e),
            _ => None,
        }
    }

    fn range(&self) -> (u32, u32) {
        match self.state.vars.get(THIS) {
            Some(&VarValue::Table { offset, count, .. }) => (offset, count),
            Some(VarValue::Entity(e)) => self.world.record(*e).map_or((0, 0), |r| (r.row, 1)),
            _ => (0, 0),
        }
    }

    // =========================================================================
    // Fields
    // =========================================================================

    /// Id matched by field `f`. For wildcard terms this is the concrete id.
    ///
    /// # Panics
    ///
    /// Panics if `f` is not a field of the query.
    #[must_use]
    pub fn id(&self, f: usize) -> Id {
        self.state.fields[f].id
    }

    /// Entity field `f` was matched on; null for `$this`.
    ///
    /// # Panics
    ///
    /// Panics if `f` is not a field of the query.
    #[must_use]
    pub fn src(&self, f: usize) -> EntityId {
        self.state.fields[f].src
    }

    /// Returns true if field `f` matched in this batch.
    #[must_use]
    pub fn is_set(&self, f: usize) -> bool {
        self.state.fields.get(f).is_some_and(|field| field.is_set)
    }

    /// Bitmask of the fields that matched in this batch.
    #[must_use]
    pub fn set_fields(&self) -> u32 {
        self.state
            .fields
            .iter()
            .enumerate()
            .filter(|(_, field)| field.is_set)
            .fold(0, |mask, (f, _)| mask | 1 << f)
    }

    /// Value of field `f` for batch row `row`. Fields matched on another
    /// source return that source's value for every row.
    #[must_use]
    pub fn get(&self, f: usize, row: usize) -> Option<&Value> {
        let field = self.state.fields.get(f).filter(|field| field.is_set)?;
        if !field.src.is_null() {
            return self.world.get_value(field.src, field.id);
        }
        if field.sparse {
            let entity = *self.entities().get(row)?;
            return self.world.get_value(entity, field.id);
        }
        let (offset, count) = self.range();
        if row >= count as usize {
            return None;
        }
        let table = self.world.table(field.table?)?;
        table.column(field.column?)?.values().get(offset as usize + row)
    }

    /// Column slice of field `f` for the batch, if the field's data is in a
    /// `$this` table column.
    #[must_use]
    pub fn field_values(&self, f: usize) -> Option<&[Value]> {
        let field = self.state.fields.get(f).filter(|field| field.is_set)?;
        if !field.src.is_null() || field.sparse {
            return None;
        }
        let (offset, count) = self.range();
        let table = self.world.table(field.table?)?;
        table
            .column(field.column?)?
            .values()
            .get(offset as usize..(offset + count) as usize)
    }

    fn writable(&self, f: usize) -> Result<()> {
        let info = self
            .query
            .compiled
            .fields
            .get(f)
            .ok_or_else(|| Error::invalid_operation(format!("no field {f}")))?;
        if !info.writes() {
            return Err(Error::invalid_operation(format!(
                "field {f} ({}) is not writable",
                info.id
            )));
        }
        if !self.is_set(f) {
            return Err(Error::invalid_operation(format!("field {f} is not set")));
        }
        Ok(())
    }

    /// Mutable column slice of a writable `$this` field. The column is
    /// marked dirty when the iterator moves on.
    ///
    /// # Errors
    ///
    /// Returns an error if the field is not writable, not set, or its data
    /// is not in a `$this` table column.
    pub fn field_mut(&mut self, f: usize) -> Result<&mut [Value]> {
        self.writable(f)?;
        let field = self.state.fields[f];
        let (offset, count) = self.range();
        let (Some(table), Some(column), true, false) =
            (field.table, field.column, field.src.is_null(), field.sparse)
        else {
            return Err(Error::invalid_operation(format!(
                "field {f} has no column in the batch table"
            )));
        };
        self.world
            .table_mut(table)
            .and_then(|t| t.column_mut(column))
            .and_then(|c| c.values_mut().get_mut(offset as usize..(offset + count) as usize))
            .ok_or_else(|| Error::new(ErrorKind::Internal(format!("column {column} of {table:?} out of range"))))
    }

    /// Writes `value` to field `f` of batch row `row`.
    ///
    /// # Errors
    ///
    /// Returns an error if the field is not writable or the value does not
    /// match the component schema.
    pub fn set(&mut self, f: usize, row: usize, value: Value) -> Result<()> {
        self.writable(f)?;
        let field = self.state.fields[f];
        if let Some(schema) = self.world.data_schema(field.id) {
            schema.validate(&value)?;
        }
        let entity = if field.src.is_null() {
            *self
                .entities()
                .get(row)
                .ok_or_else(|| Error::invalid_operation(format!("row {row} out of range")))?
        } else {
            field.src
        };
        let slot = self
            .world
            .get_mut(entity, field.id)?
            .ok_or_else(|| Error::component_not_found(entity, field.id))?;
        *slot = value;
        Ok(())
    }

    /// Value of a named variable in the current result.
    #[must_use]
    pub fn var(&self, name: &str) -> Option<EntityId> {
        let v = self.query.compiled.program.var_index(name)?;
        match self.state.vars.get(v)? {
            VarValue::Entity(e) => Some(*e),
            VarValue::Table { count: 1, .. } => self.entities().first().copied(),
            _ => None,
        }
    }

    // =========================================================================
    // Constraints
    // =========================================================================

    fn before_start(&self, what: &str) -> Result<()> {
        if self.state.started() {
            return Err(Error::invalid_operation(format!(
                "{what} must be set before iteration starts"
            )));
        }
        Ok(())
    }

    /// Constrains a named variable to `entity`.
    ///
    /// # Errors
    ///
    /// Returns an error if iteration started, the variable is unknown, or
    /// the entity is not alive.
    pub fn set_var(&mut self, name: &str, entity: EntityId) -> Result<()> {
        self.before_start("variables")?;
        let v = self
            .query
            .compiled
            .program
            .var_index(name)
            .ok_or_else(|| Error::invalid_query(format!("unknown variable ${name}")))?;
        self.world.validate(entity)?;
        self.state.vars[v] = VarValue::Entity(entity);
        Ok(())
    }

    /// Constrains `$this` to `entity`.
    ///
    /// # Errors
    ///
    /// See [`Self::set_var`].
    pub fn set_this(&mut self, entity: EntityId) -> Result<()> {
        self.before_start("$this")?;
        self.world.validate(entity)?;
        self.state.vars[THIS] = VarValue::Entity(entity);
        Ok(())
    }

    /// Only yields cached results of `group`.
    ///
    /// # Errors
    ///
    /// Returns an error if iteration started or the query has no cache.
    pub fn set_group(&mut self, group: u64) -> Result<()> {
        self.before_start("the group")?;
        if self.query.cache.is_none() {
            return Err(Error::new(ErrorKind::IncompatibleCachePolicy(
                "groups need a cached query".into(),
            )));
        }
        self.state.group = Some(group);
        Ok(())
    }

    // =========================================================================
    // Change Detection
    // =========================================================================

    /// Returns true if the batch changed since it was last observed. Always
    /// true for queries without a cache.
    pub fn changed(&mut self) -> bool {
        let query = &mut *self.query;
        let Some(cache) = query.cache.as_mut() else {
            return true;
        };
        query.monitors_enabled = true;
        let fixed = *self.fixed_changed.get_or_insert_with(|| match &query.fixed_monitor {
            Some(monitor) => monitor.is_stale(self.world),
            None => !query.compiled.fixed.is_empty(),
        });
        if fixed {
            return true;
        }
        let Some(entry) = self.state.cache_entry.and_then(|i| self.state.cache_entries.get(i)) else {
            return true;
        };
        cache.check_monitor(self.world, entry.match_id)
    }

    /// Excludes the current batch from dirty marking and keeps the monitor
    /// of its match unsynced.
    pub fn skip(&mut self) {
        self.skipped = true;
    }

    /// Number of access conflicts detected so far.
    #[must_use]
    pub fn conflicts(&self) -> usize {
        self.conflicts
    }

    /// The world being iterated.
    #[must_use]
    pub fn world(&self) -> &World {
        self.world
    }
}

impl Drop for QueryIter<'_> {
    fn drop(&mut self) {
        if self.state.started() && !self.finished {
            self.end_batch();
            if !self.passive {
                self.mark_fixed_fields_dirty();
            }
        }
        self.release();
    }
}
