//! Query execution VM.
//!
//! [`Program::next`] runs the ops front to back with the usual
//! generate/backtrack protocol: an op entered with `redo == false` finds its
//! first candidate, an op entered with `redo == true` advances to the next
//! one. A failing op hands control back to its predecessor with
//! `redo == true`; reaching the end of the program yields a result. Each op
//! keeps its resumption state in an [`OpCtx`] slot of the [`RunState`].

use std::collections::{HashMap, HashSet};

use archetable_foundation::{EntityId, Id, builtin};
use archetable_storage::{IdRecord, PairList, Storage, TableId, World};
use log::warn;

use crate::cache::{CacheEntry, QueryCache};
use crate::op::{Op, OpKind, OpSrc, Program, THIS};

// =============================================================================
// Variables and Fields
// =============================================================================

/// Value of a query variable.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VarValue {
    /// Not bound yet.
    #[default]
    Unbound,
    /// A range of rows in a table.
    Table {
        /// The table.
        table: TableId,
        /// First row.
        offset: u32,
        /// Number of rows.
        count: u32,
    },
    /// A single entity.
    Entity(EntityId),
}

impl VarValue {
    /// Returns true unless the variable is unbound.
    #[must_use]
    pub fn is_bound(self) -> bool {
        !matches!(self, Self::Unbound)
    }
}

/// What a field matched in the current result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldState {
    /// Id matched; the term id when nothing matched.
    pub id: Id,
    /// Entity the data comes from, or null for `$this`.
    pub src: EntityId,
    /// Table holding the data.
    pub table: Option<TableId>,
    /// Column holding the data.
    pub column: Option<u32>,
    /// Whether the field matched.
    pub is_set: bool,
    /// Data lives in the id's sparse set.
    pub sparse: bool,
}

impl FieldState {
    /// A field that did not match.
    #[must_use]
    pub fn unset(id: Id) -> Self {
        Self {
            id,
            src: EntityId::NULL,
            table: None,
            column: None,
            is_set: false,
            sparse: false,
        }
    }
}

// =============================================================================
// Execution State
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Cand {
    table: TableId,
    id: Id,
    column: Option<u32>,
    src: EntityId,
}

/// Resumption state of one op.
#[derive(Clone, Debug, Default)]
pub struct OpCtx {
    select: bool,
    cands: Vec<Cand>,
    cursor: usize,
    row: u32,
    saved_src: VarValue,
    saved_second: VarValue,
    up_cache: HashMap<TableId, Option<Cand>>,
}

/// Mutable state of one program run.
#[derive(Clone, Debug)]
pub struct RunState {
    /// Variable values.
    pub vars: Vec<VarValue>,
    /// Field states of the current result.
    pub fields: Vec<FieldState>,
    ctx: Vec<OpCtx>,
    started: bool,
    done: bool,
    /// Cache entries to yield, built before the run.
    pub cache_entries: Vec<CacheEntry>,
    /// Cache entry of the current result.
    pub cache_entry: Option<usize>,
    /// Only yield cache entries of this group.
    pub group: Option<u64>,
}

impl RunState {
    /// Fresh state for `program`.
    #[must_use]
    pub fn new(program: &Program) -> Self {
        Self {
            vars: vec![VarValue::Unbound; program.vars.len().max(1)],
            fields: program.fields.iter().map(|id| FieldState::unset(*id)).collect(),
            ctx: vec![OpCtx::default(); program.ops.len()],
            started: false,
            done: false,
            cache_entries: Vec::new(),
            cache_entry: None,
            group: None,
        }
    }

    /// Returns true once the first result was requested.
    #[must_use]
    pub fn started(&self) -> bool {
        self.started
    }

    /// Returns true once the program is exhausted.
    #[must_use]
    pub fn done(&self) -> bool {
        self.done
    }

    fn var(&self, v: usize) -> VarValue {
        self.vars.get(v).copied().unwrap_or_default()
    }

    fn set_var(&mut self, v: usize, value: VarValue) {
        if let Some(slot) = self.vars.get_mut(v) {
            *slot = value;
        }
    }
}

/// Read-only inputs of a run.
#[derive(Clone, Copy)]
pub struct Env<'a> {
    /// The world being queried.
    pub world: &'a World,
    /// The query cache, for programs with a `Cache` op.
    pub cache: Option<&'a QueryCache>,
    /// Yield tables without rows.
    pub match_empty: bool,
}

// =============================================================================
// Interpreter
// =============================================================================

impl Program {
    /// Produces the next result. Returns false when exhausted.
    pub fn next(&self, env: &Env<'_>, state: &mut RunState) -> bool {
        if state.done {
            return false;
        }
        let n = self.ops.len();
        if n == 0 {
            state.done = state.started;
            state.started = true;
            return !state.done;
        }
        let (mut i, mut redo) = if state.started {
            (n - 1, true)
        } else {
            state.started = true;
            (0, false)
        };
        loop {
            if self.exec(i, redo, env, state) {
                if i + 1 == n {
                    return true;
                }
                i += 1;
                redo = false;
            } else {
                if i == 0 {
                    state.done = true;
                    return false;
                }
                i -= 1;
                redo = true;
            }
        }
    }

    /// Returns true if the program yields at least one result for the given
    /// bindings. The bindings are not modified.
    #[must_use]
    pub fn exists(&self, env: &Env<'_>, vars: &[VarValue]) -> bool {
        let mut state = RunState::new(self);
        for (slot, value) in state.vars.iter_mut().zip(vars) {
            *slot = *value;
        }
        self.next(env, &mut state)
    }

    fn exec(&self, i: usize, redo: bool, env: &Env<'_>, state: &mut RunState) -> bool {
        let op = &self.ops[i];
        match &op.kind {
            OpKind::Not(sub) => !redo && !sub.exists(env, &state.vars),
            OpKind::Cache => exec_cache(i, redo, env, state),
            _ if op.optional => exec_optional(op, i, redo, env, state),
            OpKind::Sparse { negate } => exec_sparse(op, i, redo, *negate, env, state),
            _ => exec_match(op, i, redo, env, state),
        }
    }
}

fn restore(op: &Op, i: usize, state: &mut RunState) {
    let (src, second) = (state.ctx[i].saved_src, state.ctx[i].saved_second);
    if let OpSrc::Var(v) = op.src {
        state.set_var(v, src);
    }
    if let Some(v) = op.second_var {
        state.set_var(v, second);
    }
}

fn save(op: &Op, i: usize, state: &mut RunState) {
    let src = match op.src {
        OpSrc::Var(v) => state.var(v),
        OpSrc::Entity(_) => VarValue::Unbound,
    };
    let second = op.second_var.map(|v| state.var(v)).unwrap_or_default();
    let ctx = &mut state.ctx[i];
    ctx.saved_src = src;
    ctx.saved_second = second;
    ctx.cands.clear();
    ctx.cursor = 0;
    ctx.row = 0;
}

fn exec_optional(op: &Op, i: usize, redo: bool, env: &Env<'_>, state: &mut RunState) -> bool {
    if redo {
        restore(op, i, state);
        return false;
    }
    let matched = match op.kind {
        OpKind::Sparse { .. } => optional_sparse(op, i, env, state),
        _ => exec_match(op, i, false, env, state),
    };
    if !matched {
        if let Some(f) = op.field {
            state.fields[f] = FieldState::unset(op.id);
        }
    }
    true
}

fn source_table(world: &World, op: &Op, value: VarValue) -> Option<TableId> {
    match (op.src, value) {
        (OpSrc::Entity(e), _) | (OpSrc::Var(_), VarValue::Entity(e)) => world.table_of(e),
        (OpSrc::Var(_), VarValue::Table { table, .. }) => Some(table),
        (OpSrc::Var(_), VarValue::Unbound) => None,
    }
}

/// The op id with a bound pair target variable substituted.
fn resolve_id(op: &Op, state: &RunState) -> Id {
    let Some(v) = op.second_var else {
        return op.id;
    };
    match (state.var(v), op.id.first()) {
        (VarValue::Entity(target), Some(first)) => Id::pair(first, target),
        _ => op.id,
    }
}

fn is_sparse(world: &World, id: Id) -> bool {
    world.id_traits(id).storage.is_sparse()
}

// =============================================================================
// And / Or / Up
// =============================================================================

fn exec_match(op: &Op, i: usize, redo: bool, env: &Env<'_>, state: &mut RunState) -> bool {
    if !redo {
        save(op, i, state);
        let id = resolve_id(op, state);
        let src_value = match op.src {
            OpSrc::Var(v) => state.var(v),
            OpSrc::Entity(_) => VarValue::Unbound,
        };
        let bound = matches!(op.src, OpSrc::Entity(_)) || src_value.is_bound();
        let cands = if bound {
            source_table(env.world, op, src_value)
                .map(|table| match_table(op, id, table, env, &mut state.ctx[i]))
                .unwrap_or_default()
        } else {
            select_tables(op, id, env, &mut state.ctx[i])
        };
        let ctx = &mut state.ctx[i];
        ctx.select = !bound;
        ctx.cands = cands;
    }
    advance(op, i, env, state)
}

fn advance(op: &Op, i: usize, env: &Env<'_>, state: &mut RunState) -> bool {
    loop {
        let ctx = &mut state.ctx[i];
        let Some(&cand) = ctx.cands.get(ctx.cursor) else {
            restore(op, i, state);
            return false;
        };
        let mut bound_src = None;
        if ctx.select {
            let OpSrc::Var(v) = op.src else {
                ctx.cursor += 1;
                continue;
            };
            let Some(table) = env.world.table(cand.table) else {
                ctx.cursor += 1;
                continue;
            };
            if v == THIS {
                ctx.cursor += 1;
                #[allow(clippy::cast_possible_truncation)]
                let count = table.len() as u32;
                if count == 0 && !env.match_empty {
                    continue;
                }
                state.set_var(
                    THIS,
                    VarValue::Table {
                        table: cand.table,
                        offset: 0,
                        count,
                    },
                );
            } else {
                let Some(&entity) = table.entities().get(ctx.row as usize) else {
                    ctx.cursor += 1;
                    ctx.row = 0;
                    continue;
                };
                ctx.row += 1;
                state.set_var(v, VarValue::Entity(entity));
                bound_src = Some(entity);
            }
        } else {
            ctx.cursor += 1;
            bound_src = match (op.src, ctx.saved_src) {
                (OpSrc::Entity(e), _) | (OpSrc::Var(_), VarValue::Entity(e)) => Some(e),
                _ => None,
            };
        }

        let saved_second = state.ctx[i].saved_second;
        if let Some(v) = op.second_var {
            if !saved_second.is_bound() {
                let Some(target) = cand.id.second() else {
                    continue;
                };
                let alive = env.world.get_alive(target);
                if alive.is_null() {
                    continue;
                }
                state.set_var(v, VarValue::Entity(alive));
            }
        }

        if let Some(f) = op.field {
            let src = if cand.src.is_null() {
                bound_src.unwrap_or(EntityId::NULL)
            } else {
                cand.src
            };
            state.fields[f] = FieldState {
                id: cand.id,
                src,
                table: Some(cand.table),
                column: cand.column,
                is_set: true,
                sparse: is_sparse(env.world, cand.id),
            };
        }
        return true;
    }
}

/// Candidates for a bound source table.
fn match_table(op: &Op, id: Id, table: TableId, env: &Env<'_>, ctx: &mut OpCtx) -> Vec<Cand> {
    let world = env.world;
    match &op.kind {
        OpKind::Or(ids) => ids
            .iter()
            .find_map(|id| self_match(world, *id, table))
            .into_iter()
            .collect(),
        OpKind::Up { self_first, .. } => up_match(world, op, id, table, *self_first, ctx)
            .into_iter()
            .collect(),
        _ if !id.is_wildcard() => self_match(world, id, table).into_iter().collect(),
        _ => {
            let Some(t) = world.table(table) else {
                return Vec::new();
            };
            let pattern = any_as_wildcard(id);
            let matches = t.archetype().matching(pattern).map(|(index, matched)| Cand {
                table,
                id: matched,
                column: t.column_for_type_index(index),
                src: EntityId::NULL,
            });
            if id.has_any() {
                matches.take(1).collect()
            } else {
                matches.collect()
            }
        }
    }
}

fn self_match(world: &World, id: Id, table: TableId) -> Option<Cand> {
    let tr = world.get_table_record(id, table)?;
    Some(Cand {
        table,
        id,
        column: tr.column,
        src: EntityId::NULL,
    })
}

fn any_as_wildcard(id: Id) -> Id {
    match (id.first(), id.second()) {
        (Some(first), Some(second)) => {
            let swap = |e: EntityId| if e == builtin::ANY { builtin::WILDCARD } else { e };
            Id::pair(swap(first), swap(second))
        }
        _ if id == Id::ANY => Id::WILDCARD,
        _ => id,
    }
}

/// Candidates when the source is unbound.
fn select_tables(op: &Op, id: Id, env: &Env<'_>, ctx: &mut OpCtx) -> Vec<Cand> {
    let world = env.world;
    let registry = world.id_registry();
    match &op.kind {
        OpKind::Or(ids) => {
            let mut seen = HashSet::new();
            let mut cands = Vec::new();
            for &branch in ids {
                let Some(rec) = registry.get(branch) else {
                    continue;
                };
                for tr in rec.tables().records() {
                    if seen.insert(tr.table) {
                        cands.push(Cand {
                            table: tr.table,
                            id: branch,
                            column: tr.column,
                            src: EntityId::NULL,
                        });
                    }
                }
            }
            cands
        }
        OpKind::Up {
            self_first,
            cascade,
        } => {
            let mut tables: Vec<TableId> = Vec::new();
            let mut seen = HashSet::new();
            if *self_first {
                if let Some(rec) = registry.get(id) {
                    tables.extend(rec.tables().records().iter().map(|tr| tr.table));
                }
            }
            if let Some(rec) = registry.get(Id::pair(op.trav_rel, builtin::WILDCARD)) {
                tables.extend(rec.tables().records().iter().map(|tr| tr.table));
            }
            let mut cands: Vec<Cand> = tables
                .into_iter()
                .filter(|t| seen.insert(*t))
                .filter_map(|t| up_match(world, op, id, t, *self_first, ctx))
                .collect();
            if *cascade {
                cands.sort_by_key(|c| world.depth(c.table, op.trav_rel));
            }
            cands
        }
        _ if id.has_any() => registry
            .get(any_as_wildcard(id))
            .map(|rec| {
                rec.tables()
                    .records()
                    .iter()
                    .filter_map(|tr| {
                        let t = world.table(tr.table)?;
                        let matched = *t.archetype().ids().get(tr.index as usize)?;
                        Some(Cand {
                            table: tr.table,
                            id: matched,
                            column: tr.column,
                            src: EntityId::NULL,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default(),
        _ if id.is_wildcard() => wildcard_records(world, id)
            .into_iter()
            .filter_map(|rid| registry.record(rid))
            .flat_map(|rec| table_cands(rec))
            .collect(),
        _ => registry.get(id).map(table_cands).unwrap_or_default(),
    }
}

fn table_cands(rec: &IdRecord) -> Vec<Cand> {
    rec.tables()
        .records()
        .iter()
        .map(|tr| Cand {
            table: tr.table,
            id: rec.id(),
            column: tr.column,
            src: EntityId::NULL,
        })
        .collect()
}

/// Concrete pair records matching a wildcard pair, in pair-list order.
fn wildcard_records(world: &World, id: Id) -> Vec<archetable_storage::IdRecordId> {
    let registry = world.id_registry();
    let (Some(first), Some(second)) = (id.first(), id.second()) else {
        return Vec::new();
    };
    match (first == builtin::WILDCARD, second == builtin::WILDCARD) {
        (false, true) => registry
            .lookup(id)
            .map(|head| registry.list(head, PairList::First).collect())
            .unwrap_or_default(),
        (true, false) => registry
            .lookup(id)
            .map(|head| registry.list(head, PairList::Second).collect())
            .unwrap_or_default(),
        (true, true) => {
            let mut records = Vec::new();
            let mut from = 0;
            while let Some(rid) = registry.next_pair(from) {
                records.push(rid);
                from = rid.0 + 1;
            }
            records
        }
        (false, false) => registry.lookup(id).into_iter().collect(),
    }
}

/// Finds `id` on `table` or by following `op.trav_rel` upwards. Results are
/// cached per table for the duration of the run.
fn up_match(
    world: &World,
    op: &Op,
    id: Id,
    table: TableId,
    self_first: bool,
    ctx: &mut OpCtx,
) -> Option<Cand> {
    if self_first {
        if let Some(cand) = self_match(world, id, table) {
            return Some(cand);
        }
    }
    if let Some(cached) = ctx.up_cache.get(&table) {
        return *cached;
    }
    let max_depth = world.config().max_traversal_depth;
    let mut current = table;
    let mut found = None;
    for depth in 0.. {
        if depth >= max_depth {
            warn!("up traversal for {id} exceeded depth {max_depth}");
            break;
        }
        let Some(target) = world.table_target(current, op.trav_rel, 0) else {
            break;
        };
        let Some(target_table) = world.table_of(target) else {
            break;
        };
        if let Some(tr) = world.get_table_record(id, target_table) {
            found = Some(Cand {
                table: target_table,
                id,
                column: tr.column,
                src: target,
            });
            break;
        }
        if world.id_traits(id).storage == Storage::DontFragment && world.has(target, id) {
            found = Some(Cand {
                table: target_table,
                id,
                column: None,
                src: target,
            });
            break;
        }
        current = target_table;
    }
    ctx.up_cache.insert(table, found);
    found
}

// =============================================================================
// Sparse
// =============================================================================

fn sparse_field(op: &Op, state: &mut RunState, src: EntityId, table: Option<TableId>) {
    if let Some(f) = op.field {
        state.fields[f] = FieldState {
            id: op.id,
            src,
            table,
            column: None,
            is_set: true,
            sparse: true,
        };
    }
}

fn exec_sparse(
    op: &Op,
    i: usize,
    redo: bool,
    negate: bool,
    env: &Env<'_>,
    state: &mut RunState,
) -> bool {
    let world = env.world;
    let set = world.id_record(op.id).and_then(IdRecord::sparse);
    if !redo {
        save(op, i, state);
        let ctx = &mut state.ctx[i];
        ctx.select = match op.src {
            OpSrc::Entity(_) => false,
            OpSrc::Var(_) => !ctx.saved_src.is_bound(),
        };
    }
    let ctx = &mut state.ctx[i];
    let saved = ctx.saved_src;

    if ctx.select {
        // Select walks the live dense array; it must not shrink under us.
        let Some(set) = set else {
            restore(op, i, state);
            return false;
        };
        assert!(
            ctx.cursor <= set.len(),
            "sparse set of {} changed during iteration",
            op.id
        );
        let Some(entity) = set.entity_at(ctx.cursor) else {
            restore(op, i, state);
            return false;
        };
        ctx.cursor += 1;
        let OpSrc::Var(v) = op.src else {
            return false;
        };
        if v == THIS {
            let Some(record) = world.record(entity) else {
                return exec_sparse(op, i, true, negate, env, state);
            };
            let Some(table) = record.table else {
                return exec_sparse(op, i, true, negate, env, state);
            };
            state.set_var(
                THIS,
                VarValue::Table {
                    table,
                    offset: record.row,
                    count: 1,
                },
            );
            sparse_field(op, state, EntityId::NULL, Some(table));
        } else {
            state.set_var(v, VarValue::Entity(entity));
            sparse_field(op, state, entity, world.table_of(entity));
        }
        return true;
    }

    let has = |e: EntityId| set.is_some_and(|s| s.contains(e));
    match (op.src, saved) {
        (OpSrc::Entity(e), _) | (OpSrc::Var(_), VarValue::Entity(e)) => {
            if ctx.cursor > 0 || has(e) == negate {
                restore(op, i, state);
                return false;
            }
            ctx.cursor = 1;
            if !negate {
                sparse_field(op, state, e, world.table_of(e));
            }
            true
        }
        (OpSrc::Var(v), VarValue::Table { table, offset, count }) => {
            let Some(t) = world.table(table) else {
                restore(op, i, state);
                return false;
            };
            let end = offset + count;
            let mut row = offset + ctx.row;
            while row < end {
                let Some(&entity) = t.entities().get(row as usize) else {
                    break;
                };
                row += 1;
                if has(entity) != negate {
                    state.ctx[i].row = row - offset;
                    state.set_var(
                        v,
                        VarValue::Table {
                            table,
                            offset: row - 1,
                            count: 1,
                        },
                    );
                    if !negate {
                        sparse_field(op, state, EntityId::NULL, Some(table));
                    }
                    return true;
                }
            }
            restore(op, i, state);
            false
        }
        (OpSrc::Var(_), VarValue::Unbound) => false,
    }
}

/// Optional sparse terms keep the whole row range; rows without the id read
/// as missing.
fn optional_sparse(op: &Op, i: usize, env: &Env<'_>, state: &mut RunState) -> bool {
    save(op, i, state);
    let world = env.world;
    let Some(set) = world.id_record(op.id).and_then(IdRecord::sparse) else {
        return false;
    };
    let value = match op.src {
        OpSrc::Var(v) => state.var(v),
        OpSrc::Entity(_) => VarValue::Unbound,
    };
    match (op.src, value) {
        (OpSrc::Entity(e), _) | (OpSrc::Var(_), VarValue::Entity(e)) => {
            if !set.contains(e) {
                return false;
            }
            sparse_field(op, state, e, world.table_of(e));
            true
        }
        (OpSrc::Var(_), VarValue::Table { table, offset, count }) => {
            let any = world.table(table).is_some_and(|t| {
                t.entities()
                    .iter()
                    .skip(offset as usize)
                    .take(count as usize)
                    .any(|e| set.contains(*e))
            });
            if any {
                sparse_field(op, state, EntityId::NULL, Some(table));
            }
            any
        }
        (OpSrc::Var(_), VarValue::Unbound) => false,
    }
}

// =============================================================================
// Cache
// =============================================================================

fn exec_cache(i: usize, redo: bool, env: &Env<'_>, state: &mut RunState) -> bool {
    let Some(cache) = env.cache else {
        return false;
    };
    if !redo {
        let this = state.var(THIS);
        let ctx = &mut state.ctx[i];
        ctx.cursor = 0;
        ctx.saved_src = this;
    }
    let saved = state.ctx[i].saved_src;
    while let Some(entry) = state.cache_entries.get(state.ctx[i].cursor).copied() {
        let index = state.ctx[i].cursor;
        state.ctx[i].cursor += 1;
        if state.group.is_some_and(|g| g != entry.group) {
            continue;
        }
        let (offset, count) = match saved {
            VarValue::Table {
                table,
                offset,
                count,
            } => {
                if table != entry.table {
                    continue;
                }
                let start = offset.max(entry.offset);
                let end = (offset + count).min(entry.offset + entry.count);
                if start >= end {
                    continue;
                }
                (start, end - start)
            }
            VarValue::Entity(entity) => {
                let Some(record) = env.world.record(entity) else {
                    continue;
                };
                if record.table != Some(entry.table)
                    || record.row < entry.offset
                    || record.row >= entry.offset + entry.count
                {
                    continue;
                }
                (record.row, 1)
            }
            VarValue::Unbound => {
                if entry.count == 0 && !env.match_empty {
                    continue;
                }
                (entry.offset, entry.count)
            }
        };
        state.set_var(
            THIS,
            VarValue::Table {
                table: entry.table,
                offset,
                count,
            },
        );
        if let Some(fields) = cache.match_fields(entry.match_id) {
            for (local, field) in fields.iter().enumerate() {
                if let Some(&f) = cache.field_map().get(local) {
                    state.fields[f] = *field;
                }
            }
        }
        state.cache_entry = Some(index);
        return true;
    }
    state.set_var(THIS, saved);
    state.cache_entry = None;
    false
}
