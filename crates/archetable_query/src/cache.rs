//! Query cache.
//!
//! The cache keeps one [`CacheMatch`] per matching (table, id combination)
//! of the cacheable terms. Matches are found by running the cache program
//! against a single table, so adding a table costs one program run. The
//! cache follows the world's table event log from a cursor: created tables
//! are matched, deleted tables drop their matches.
//!
//! Matches are bucketed by group (ascending group id). With an ordering,
//! table rows are sorted by the order column and merged into ordered slices
//! when entries are built.

use std::collections::{BTreeMap, HashMap};

use archetable_foundation::{EntityId, Id};
use archetable_storage::{CompareFn, TableEvent, TableId, World};
use log::{debug, trace};

use crate::monitor;
use crate::op::{Program, THIS};
use crate::term::GroupBy;
use crate::vm::{Env, FieldState, RunState, VarValue};

/// Index of a match in the cache arena. Slots are recycled.
pub type MatchId = usize;

/// One table match.
#[derive(Clone, Debug)]
pub struct CacheMatch {
    /// The matched table.
    pub table: TableId,
    /// Field states, in cache-local field order.
    pub fields: Vec<FieldState>,
    /// Group of the table.
    pub group: u64,
    /// Change-detection snapshot, created on first use.
    pub monitor: Option<Vec<i32>>,
    sorted: Option<(i32, i32)>,
}

/// A slice of rows yielded by the `Cache` op.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    /// Match the rows belong to.
    pub match_id: MatchId,
    /// Table of the match.
    pub table: TableId,
    /// First row.
    pub offset: u32,
    /// Number of rows.
    pub count: u32,
    /// Group of the match.
    pub group: u64,
}

/// How matches are grouped.
#[derive(Clone, Copy, Debug)]
pub enum Grouping {
    /// A single group 0.
    None,
    /// User grouping.
    By(GroupBy),
    /// Hierarchy depth along a relationship, for cascade terms.
    Depth(EntityId),
}

/// Ordering of cached results.
#[derive(Clone, Copy, Debug)]
pub struct CacheOrder {
    /// Component compared.
    pub id: Id,
    /// Comparison.
    pub compare: CompareFn,
}

/// Materialized table matches of a query's cacheable terms.
#[derive(Debug)]
pub struct QueryCache {
    program: Program,
    field_map: Vec<usize>,
    tracked: Vec<bool>,
    grouping: Grouping,
    ordering: Option<CacheOrder>,
    matches: Vec<Option<CacheMatch>>,
    free: Vec<MatchId>,
    by_table: HashMap<TableId, Vec<MatchId>>,
    groups: BTreeMap<u64, Vec<MatchId>>,
    cursor: usize,
    match_count: u64,
    prev_match_count: u64,
}

impl QueryCache {
    /// Creates a cache for `program` and matches every existing table.
    ///
    /// `field_map[i]` is the query field of cache field `i`; `tracked[i]`
    /// says whether monitors watch cache field `i`.
    #[must_use]
    pub fn new(
        world: &World,
        program: Program,
        field_map: Vec<usize>,
        tracked: Vec<bool>,
        grouping: Grouping,
        ordering: Option<CacheOrder>,
    ) -> Self {
        let mut cache = Self {
            program,
            field_map,
            tracked,
            grouping,
            ordering,
            matches: Vec::new(),
            free: Vec::new(),
            by_table: HashMap::new(),
            groups: BTreeMap::new(),
            cursor: world.table_events().len(),
            match_count: 0,
            prev_match_count: 0,
        };
        let tables: Vec<TableId> = world.tables().map(archetable_storage::Table::id).collect();
        for table in tables {
            cache.match_table(world, table);
        }
        debug!(
            "query cache created with {} matches over {} tables",
            cache.len(),
            cache.by_table.len()
        );
        cache
    }

    /// The program matching a single table.
    #[must_use]
    pub fn program(&self) -> &Program {
        &self.program
    }

    /// Cache field → query field.
    #[must_use]
    pub fn field_map(&self) -> &[usize] {
        &self.field_map
    }

    /// Number of live matches.
    #[must_use]
    pub fn len(&self) -> usize {
        self.matches.len() - self.free.len()
    }

    /// Returns true if no table matches.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of topology changes since creation.
    #[must_use]
    pub fn match_count(&self) -> u64 {
        self.match_count
    }

    /// Returns true if matches were added or removed since the last sync.
    #[must_use]
    pub fn topology_changed(&self) -> bool {
        self.match_count != self.prev_match_count
    }

    /// Match by id.
    #[must_use]
    pub fn get(&self, id: MatchId) -> Option<&CacheMatch> {
        self.matches.get(id).and_then(Option::as_ref)
    }

    /// Field states of a match.
    #[must_use]
    pub fn match_fields(&self, id: MatchId) -> Option<&[FieldState]> {
        self.get(id).map(|m| m.fields.as_slice())
    }

    /// Matched tables, in group order.
    pub fn tables(&self) -> impl Iterator<Item = TableId> + '_ {
        self.groups
            .values()
            .flatten()
            .filter_map(|&m| self.get(m))
            .map(|m| m.table)
    }

    /// Group ids in iteration order.
    pub fn groups(&self) -> impl Iterator<Item = u64> + '_ {
        self.groups.keys().copied()
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Applies table events recorded since the last update.
    pub fn update(&mut self, world: &World) {
        let (events, next) = world.table_events_since(self.cursor);
        let events = events.to_vec();
        self.cursor = next;
        for event in events {
            match event {
                TableEvent::Created(table) => self.match_table(world, table),
                TableEvent::Deleted(table) => self.unmatch_table(table),
            }
        }
        if let Grouping::Depth(rel) = self.grouping {
            self.regroup(|table| world.depth(table, rel) as u64);
        }
    }

    fn group_of(&self, world: &World, table: TableId) -> u64 {
        match self.grouping {
            Grouping::None => 0,
            Grouping::By(group_by) => group_by.group_of(world, table),
            Grouping::Depth(rel) => world.depth(table, rel) as u64,
        }
    }

    fn match_table(&mut self, world: &World, table: TableId) {
        if self.by_table.contains_key(&table) {
            return;
        }
        let Some(t) = world.table(table) else {
            return;
        };
        #[allow(clippy::cast_possible_truncation)]
        let count = t.len() as u32;
        let env = Env {
            world,
            cache: None,
            match_empty: true,
        };
        let mut state = RunState::new(&self.program);
        state.vars[THIS] = VarValue::Table {
            table,
            offset: 0,
            count,
        };
        let mut found = Vec::new();
        while self.program.next(&env, &mut state) {
            found.push(state.fields.clone());
        }
        if found.is_empty() {
            return;
        }
        let group = self.group_of(world, table);
        for fields in found {
            let m = CacheMatch {
                table,
                fields,
                group,
                monitor: None,
                sorted: None,
            };
            let id = match self.free.pop() {
                Some(id) => {
                    self.matches[id] = Some(m);
                    id
                }
                None => {
                    self.matches.push(Some(m));
                    self.matches.len() - 1
                }
            };
            self.by_table.entry(table).or_default().push(id);
            self.groups.entry(group).or_default().push(id);
        }
        self.match_count += 1;
        trace!("query cache matched {table:?}");
    }

    fn unmatch_table(&mut self, table: TableId) {
        let Some(ids) = self.by_table.remove(&table) else {
            return;
        };
        for id in ids {
            if let Some(m) = self.matches.get_mut(id).and_then(Option::take) {
                if let Some(list) = self.groups.get_mut(&m.group) {
                    list.retain(|&other| other != id);
                    if list.is_empty() {
                        self.groups.remove(&m.group);
                    }
                }
                self.free.push(id);
            }
        }
        self.match_count += 1;
        trace!("query cache dropped {table:?}");
    }

    fn regroup(&mut self, group_of: impl Fn(TableId) -> u64) {
        let mut moved = Vec::new();
        for (id, slot) in self.matches.iter_mut().enumerate() {
            let Some(m) = slot else {
                continue;
            };
            let group = group_of(m.table);
            if group != m.group {
                moved.push((id, m.group, group));
                m.group = group;
            }
        }
        for (id, from, to) in moved {
            if let Some(list) = self.groups.get_mut(&from) {
                list.retain(|&other| other != id);
                if list.is_empty() {
                    self.groups.remove(&from);
                }
            }
            self.groups.entry(to).or_default().push(id);
        }
    }

    // =========================================================================
    // Ordering
    // =========================================================================

    /// Sorts the rows of every matched table whose order column or
    /// membership changed since the last sort. A sort that moves rows
    /// bumps membership itself, so the state is read back afterwards.
    pub fn sort_tables(&mut self, world: &mut World) {
        let Some(ordering) = self.ordering else {
            return;
        };
        let sort_state = |world: &World, table: TableId, column: u32| {
            world.dirty_state(table).map(|d| {
                (
                    d.first().copied().unwrap_or(0),
                    d.get(column as usize + 1).copied().unwrap_or(0),
                )
            })
        };
        for m in self.matches.iter_mut().flatten() {
            let Some(column) = world.column_index(m.table, ordering.id) else {
                continue;
            };
            let state = sort_state(world, m.table, column);
            if state.is_some() && m.sorted == state {
                continue;
            }
            m.sorted = if world.sort_table(m.table, column, ordering.compare) {
                sort_state(world, m.table, column)
            } else {
                state
            };
        }
    }

    /// Row slices to iterate, group by group.
    #[must_use]
    pub fn entries(&self, world: &World, match_empty: bool) -> Vec<CacheEntry> {
        let mut entries = Vec::new();
        for (&group, ids) in &self.groups {
            match self.ordering {
                Some(ordering) => self.merge_group(world, group, ids, ordering, &mut entries),
                None => {
                    for &id in ids {
                        let Some(m) = self.get(id) else {
                            continue;
                        };
                        #[allow(clippy::cast_possible_truncation)]
                        let count = world.table(m.table).map_or(0, |t| t.len() as u32);
                        if count > 0 || match_empty {
                            entries.push(CacheEntry {
                                match_id: id,
                                table: m.table,
                                offset: 0,
                                count,
                                group,
                            });
                        }
                    }
                }
            }
        }
        entries
    }

    /// Merges the sorted tables of one group into ordered row slices.
    fn merge_group(
        &self,
        world: &World,
        group: u64,
        ids: &[MatchId],
        ordering: CacheOrder,
        out: &mut Vec<CacheEntry>,
    ) {
        struct Source<'a> {
            match_id: MatchId,
            table: TableId,
            entities: &'a [EntityId],
            values: &'a [archetable_foundation::Value],
            row: usize,
        }
        let mut sources: Vec<Source<'_>> = ids
            .iter()
            .filter_map(|&id| {
                let m = self.get(id)?;
                let t = world.table(m.table)?;
                let column = t.column_index(ordering.id)?;
                Some(Source {
                    match_id: id,
                    table: m.table,
                    entities: t.entities(),
                    values: t.column(column)?.values(),
                    row: 0,
                })
            })
            .collect();

        loop {
            let mut best: Option<usize> = None;
            for (i, s) in sources.iter().enumerate() {
                if s.row >= s.entities.len() {
                    continue;
                }
                best = match best {
                    None => Some(i),
                    Some(b) => {
                        let cur = &sources[b];
                        let ord = (ordering.compare)(
                            s.entities[s.row],
                            &s.values[s.row],
                            cur.entities[cur.row],
                            &cur.values[cur.row],
                        );
                        if ord == std::cmp::Ordering::Less {
                            Some(i)
                        } else {
                            Some(b)
                        }
                    }
                };
            }
            let Some(b) = best else {
                break;
            };
            let source = &mut sources[b];
            #[allow(clippy::cast_possible_truncation)]
            let row = source.row as u32;
            source.row += 1;
            match out.last_mut() {
                Some(last)
                    if last.match_id == source.match_id
                        && last.group == group
                        && last.offset + last.count == row =>
                {
                    last.count += 1;
                }
                _ => out.push(CacheEntry {
                    match_id: source.match_id,
                    table: source.table,
                    offset: row,
                    count: 1,
                    group,
                }),
            }
        }
    }

    // =========================================================================
    // Monitors
    // =========================================================================

    /// Returns true if the match changed since its monitor was synced. A
    /// match without a monitor gets one and reports a change, unless its
    /// table is empty.
    pub fn check_monitor(&mut self, world: &World, id: MatchId) -> bool {
        let tracked = &self.tracked;
        let Some(m) = self.matches.get_mut(id).and_then(Option::as_mut) else {
            return false;
        };
        let Some(dirty) = world.dirty_state(m.table) else {
            return true;
        };
        if m.monitor.is_none() {
            let mut snapshot = monitor::new_monitor(&m.fields, tracked);
            let empty = world.table(m.table).is_none_or(archetable_storage::Table::is_empty);
            if empty {
                monitor::sync(&mut snapshot, &m.fields, dirty);
            }
            m.monitor = Some(snapshot);
            return !empty;
        }
        m.monitor
            .as_ref()
            .is_some_and(|snapshot| monitor::is_stale(snapshot, &m.fields, dirty))
    }

    /// Like [`Self::check_monitor`] but without creating a monitor.
    #[must_use]
    pub fn peek_monitor(&self, world: &World, id: MatchId) -> bool {
        let Some(m) = self.get(id) else {
            return false;
        };
        match (&m.monitor, world.dirty_state(m.table)) {
            (Some(snapshot), Some(dirty)) => monitor::is_stale(snapshot, &m.fields, dirty),
            _ => true,
        }
    }

    /// Advances the monitor of one match to the current dirty state.
    pub fn sync_monitor(&mut self, world: &World, id: MatchId) {
        let tracked = &self.tracked;
        let Some(m) = self.matches.get_mut(id).and_then(Option::as_mut) else {
            return;
        };
        let Some(dirty) = world.dirty_state(m.table) else {
            return;
        };
        let snapshot = m
            .monitor
            .get_or_insert_with(|| monitor::new_monitor(&m.fields, tracked));
        monitor::sync(snapshot, &m.fields, dirty);
    }

    /// Checks every match, creating missing monitors. Returns true if any
    /// match changed or the set of matches changed.
    pub fn check_all(&mut self, world: &World) -> bool {
        let mut changed = self.topology_changed();
        let ids: Vec<MatchId> = self.groups.values().flatten().copied().collect();
        for id in ids {
            changed |= self.check_monitor(world, id);
        }
        changed
    }

    /// Syncs every match and the topology counter.
    pub fn sync_all(&mut self, world: &World) {
        let ids: Vec<MatchId> = self.groups.values().flatten().copied().collect();
        for id in ids {
            self.sync_monitor(world, id);
        }
        self.sync_topology();
    }

    /// Syncs the matches whose table has no rows. Iteration never yields
    /// them, so their emptiness is observed when an iteration completes.
    pub fn sync_empty(&mut self, world: &World) {
        let ids: Vec<MatchId> = self
            .groups
            .values()
            .flatten()
            .copied()
            .filter(|&id| {
                self.get(id)
                    .and_then(|m| world.table(m.table))
                    .is_some_and(archetable_storage::Table::is_empty)
            })
            .collect();
        for id in ids {
            self.sync_monitor(world, id);
        }
    }

    /// Marks the current set of matches as observed.
    pub fn sync_topology(&mut self) {
        self.prev_match_count = self.match_count;
    }
}
