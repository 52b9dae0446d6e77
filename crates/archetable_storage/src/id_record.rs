//! Per-id metadata: which tables contain an id, its storage policy, and the
//! pair lists used to enumerate wildcard matches.
//!
//! Records live in an arena addressed by [`IdRecordId`]. Pair records are
//! chained into two intrusive lists: every `(R, X)` hangs off the `(R, *)`
//! record through its `first` link, and off the `(*, X)` record through its
//! `second` link. A wildcard head stores the first element in `next` and the
//! last element in `prev`.

use std::collections::HashMap;

use archetable_foundation::{EntityId, Id, Value, builtin};

use crate::archetype::Archetype;
use crate::conflict::AccessCounters;
use crate::schema::Storage;
use crate::sparse::SparseSet;
use crate::table::TableId;

/// Index of an id record in the registry arena. Never reused.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdRecordId(pub u32);

/// Where an id sits in one table.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TableRecord {
    /// The table.
    pub table: TableId,
    /// Index of the first matching id in the table type.
    pub index: u32,
    /// Number of ids in the type matched by this record (1 unless wildcard).
    pub count: u32,
    /// Column of the first matching id, if it has one.
    pub column: Option<u32>,
}

/// Table → table record mapping for one id.
#[derive(Debug, Clone, Default)]
pub struct TableCache {
    records: Vec<TableRecord>,
    by_table: HashMap<TableId, usize>,
}

impl TableCache {
    /// Table record for `table`.
    #[must_use]
    pub fn get(&self, table: TableId) -> Option<&TableRecord> {
        self.by_table.get(&table).map(|&i| &self.records[i])
    }

    /// Table record at position `i`.
    #[must_use]
    pub fn at(&self, i: usize) -> Option<&TableRecord> {
        self.records.get(i)
    }

    /// All table records.
    #[must_use]
    pub fn records(&self) -> &[TableRecord] {
        &self.records
    }

    /// Number of tables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if no table holds the id.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn insert(&mut self, record: TableRecord) {
        debug_assert!(!self.by_table.contains_key(&record.table));
        self.by_table.insert(record.table, self.records.len());
        self.records.push(record);
    }

    fn remove(&mut self, table: TableId) -> Option<TableRecord> {
        let i = self.by_table.remove(&table)?;
        let removed = self.records.swap_remove(i);
        if let Some(moved) = self.records.get(i) {
            self.by_table.insert(moved.table, i);
        }
        Some(removed)
    }
}

/// Link in one of the pair lists.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ListLink {
    /// Previous element (for heads: last element).
    pub prev: Option<IdRecordId>,
    /// Next element (for heads: first element).
    pub next: Option<IdRecordId>,
}

/// Behavior of an id, derived from component and relationship metadata.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct IdTraits {
    /// Storage policy.
    pub storage: Storage,
    /// Whether values are stored.
    pub has_data: bool,
    /// Exclusive relationship (pairs only).
    pub exclusive: bool,
    /// Traversable relationship (pairs only).
    pub traversable: bool,
}

/// Metadata for one id.
#[derive(Debug)]
pub struct IdRecord {
    id: Id,
    traits: IdTraits,
    cache: TableCache,
    sparse: Option<SparseSet<Value>>,
    /// Link in the `(first, *)` list.
    pub first: ListLink,
    /// Link in the `(*, second)` list.
    pub second: ListLink,
    keep_alive: u32,
    access: AccessCounters,
}

impl IdRecord {
    fn new(id: Id, traits: IdTraits, stage_count: usize) -> Self {
        Self {
            id,
            traits,
            cache: TableCache::default(),
            sparse: traits.storage.is_sparse().then(SparseSet::new),
            first: ListLink::default(),
            second: ListLink::default(),
            keep_alive: 0,
            access: AccessCounters::new(stage_count),
        }
    }

    /// The id.
    #[must_use]
    pub fn id(&self) -> Id {
        self.id
    }

    /// Storage policy and relationship traits.
    #[must_use]
    pub fn traits(&self) -> IdTraits {
        self.traits
    }

    /// Storage policy.
    #[must_use]
    pub fn storage(&self) -> Storage {
        self.traits.storage
    }

    /// Returns true if adding this id never moves an entity between tables.
    #[must_use]
    pub fn is_non_fragmenting(&self) -> bool {
        !self.traits.storage.fragments()
    }

    /// Tables containing the id.
    #[must_use]
    pub fn tables(&self) -> &TableCache {
        &self.cache
    }

    /// Table record for `table`, or `None` if the table lacks the id.
    #[must_use]
    pub fn table_record(&self, table: TableId) -> Option<&TableRecord> {
        self.cache.get(table)
    }

    /// Sparse storage, for sparse and non-fragmenting ids.
    #[must_use]
    pub fn sparse(&self) -> Option<&SparseSet<Value>> {
        self.sparse.as_ref()
    }

    /// Sparse storage, mutably.
    pub fn sparse_mut(&mut self) -> Option<&mut SparseSet<Value>> {
        self.sparse.as_mut()
    }

    /// Number of outstanding pins.
    #[must_use]
    pub fn keep_alive(&self) -> u32 {
        self.keep_alive
    }

    /// Conflict counters for sparse data.
    #[must_use]
    pub fn access(&self) -> &AccessCounters {
        &self.access
    }

    /// Returns true if nothing references the record anymore.
    #[must_use]
    pub fn is_unused(&self) -> bool {
        self.keep_alive == 0
            && self.cache.is_empty()
            && self.sparse.as_ref().is_none_or(SparseSet::is_empty)
    }
}

/// Which pair list to walk.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PairList {
    /// `(R, *)`: all pairs sharing a first element.
    First,
    /// `(*, T)`: all pairs sharing a second element.
    Second,
}

/// Arena of id records.
#[derive(Debug)]
pub struct IdRegistry {
    records: Vec<Option<IdRecord>>,
    by_id: HashMap<Id, IdRecordId>,
    stage_count: usize,
}

impl IdRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(stage_count: usize) -> Self {
        Self {
            records: Vec::new(),
            by_id: HashMap::new(),
            stage_count,
        }
    }

    /// Record id for `id`.
    #[must_use]
    pub fn lookup(&self, id: Id) -> Option<IdRecordId> {
        self.by_id.get(&id).copied()
    }

    /// Record for `id`.
    #[must_use]
    pub fn get(&self, id: Id) -> Option<&IdRecord> {
        self.lookup(id).and_then(|rid| self.record(rid))
    }

    /// Record for `id`, mutably.
    pub fn get_mut(&mut self, id: Id) -> Option<&mut IdRecord> {
        let rid = self.lookup(id)?;
        self.record_mut(rid)
    }

    /// Record by arena index.
    #[must_use]
    pub fn record(&self, rid: IdRecordId) -> Option<&IdRecord> {
        self.records.get(rid.0 as usize).and_then(Option::as_ref)
    }

    /// Record by arena index, mutably.
    pub fn record_mut(&mut self, rid: IdRecordId) -> Option<&mut IdRecord> {
        self.records.get_mut(rid.0 as usize).and_then(Option::as_mut)
    }

    fn rec_mut(&mut self, rid: IdRecordId) -> &mut IdRecord {
        self.record_mut(rid).expect("id record freed while linked")
    }

    /// Number of live records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Returns true if the registry has no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Returns the record for `id`, creating it (and, for concrete pairs,
    /// linking it into its wildcard lists) if absent.
    ///
    /// # Panics
    ///
    /// Panics if the arena exceeds `u32::MAX` records.
    pub fn ensure(&mut self, id: Id, traits: IdTraits) -> IdRecordId {
        if let Some(rid) = self.lookup(id) {
            return rid;
        }
        let rid = IdRecordId(u32::try_from(self.records.len()).expect("id record space exhausted"));
        self.records
            .push(Some(IdRecord::new(id, traits, self.stage_count)));
        self.by_id.insert(id, rid);

        if let (Some(first), Some(second)) = (id.first(), id.second()) {
            if !id.is_wildcard() {
                let first_head = self.ensure(Id::pair(first, builtin::WILDCARD), IdTraits::default());
                let second_head =
                    self.ensure(Id::pair(builtin::WILDCARD, second), IdTraits::default());
                self.ensure(Id::ALL_PAIRS, IdTraits::default());
                self.append(first_head, rid, PairList::First);
                self.append(second_head, rid, PairList::Second);
            }
        }
        rid
    }

    fn link(&mut self, rid: IdRecordId, list: PairList) -> &mut ListLink {
        let rec = self.rec_mut(rid);
        match list {
            PairList::First => &mut rec.first,
            PairList::Second => &mut rec.second,
        }
    }

    fn append(&mut self, head: IdRecordId, rid: IdRecordId, list: PairList) {
        let last = self.link(head, list).prev;
        {
            let elem = self.link(rid, list);
            elem.prev = last;
            elem.next = None;
        }
        match last {
            Some(last) => self.link(last, list).next = Some(rid),
            None => self.link(head, list).next = Some(rid),
        }
        self.link(head, list).prev = Some(rid);
    }

    fn unlink(&mut self, head: IdRecordId, rid: IdRecordId, list: PairList) {
        let ListLink { prev, next } = *self.link(rid, list);
        match prev {
            Some(prev) => self.link(prev, list).next = next,
            None => self.link(head, list).next = next,
        }
        match next {
            Some(next) => self.link(next, list).prev = prev,
            None => self.link(head, list).prev = prev,
        }
        *self.link(rid, list) = ListLink::default();
    }

    /// Replaces the traits of an existing record, allocating sparse storage
    /// if the new policy needs it.
    pub fn update_traits(&mut self, rid: IdRecordId, traits: IdTraits) {
        if let Some(rec) = self.record_mut(rid) {
            debug_assert!(
                rec.cache.is_empty() || rec.traits.storage == traits.storage,
                "storage policy changed for an id already in tables"
            );
            rec.traits = traits;
            if traits.storage.is_sparse() && rec.sparse.is_none() {
                rec.sparse = Some(SparseSet::new());
            }
        }
    }

    /// Walks the pair list headed by the wildcard record `head`.
    pub fn list(&self, head: IdRecordId, list: PairList) -> ListIter<'_> {
        let next = self.record(head).and_then(|h| match list {
            PairList::First => h.first.next,
            PairList::Second => h.second.next,
        });
        ListIter {
            registry: self,
            next,
            list,
        }
    }

    /// Next element after `rid` in `list`.
    #[must_use]
    pub fn next_in_list(&self, rid: IdRecordId, list: PairList) -> Option<IdRecordId> {
        let rec = self.record(rid)?;
        match list {
            PairList::First => rec.first.next,
            PairList::Second => rec.second.next,
        }
    }

    /// First element of the list headed by `head`.
    #[must_use]
    pub fn first_in_list(&self, head: IdRecordId, list: PairList) -> Option<IdRecordId> {
        let rec = self.record(head)?;
        match list {
            PairList::First => rec.first.next,
            PairList::Second => rec.second.next,
        }
    }

    /// Concrete pair records in arena order.
    pub fn pairs(&self) -> impl Iterator<Item = IdRecordId> + '_ {
        self.records.iter().enumerate().filter_map(|(i, rec)| {
            let rec = rec.as_ref()?;
            #[allow(clippy::cast_possible_truncation)]
            (rec.id.is_pair() && !rec.id.is_wildcard()).then_some(IdRecordId(i as u32))
        })
    }

    /// Next concrete pair record after position `from` (inclusive).
    #[must_use]
    pub fn next_pair(&self, from: u32) -> Option<IdRecordId> {
        self.records
            .iter()
            .enumerate()
            .skip(from as usize)
            .find_map(|(i, rec)| {
                let rec = rec.as_ref()?;
                #[allow(clippy::cast_possible_truncation)]
                (rec.id.is_pair() && !rec.id.is_wildcard()).then_some(IdRecordId(i as u32))
            })
    }

    /// All live records.
    pub fn iter(&self) -> impl Iterator<Item = (IdRecordId, &IdRecord)> + '_ {
        self.records.iter().enumerate().filter_map(|(i, rec)| {
            #[allow(clippy::cast_possible_truncation)]
            rec.as_ref().map(|r| (IdRecordId(i as u32), r))
        })
    }

    /// Pins a record so it survives pruning.
    pub fn keep_alive(&mut self, rid: IdRecordId) {
        if let Some(rec) = self.record_mut(rid) {
            rec.keep_alive += 1;
        }
    }

    /// Releases a pin taken with [`Self::keep_alive`].
    pub fn release(&mut self, rid: IdRecordId) {
        if let Some(rec) = self.record_mut(rid) {
            debug_assert!(rec.keep_alive > 0, "unbalanced id record release");
            rec.keep_alive = rec.keep_alive.saturating_sub(1);
        }
    }

    /// Adds `table` to the cache of every id in its type, including the
    /// wildcard records of its pairs.
    pub fn register_table(
        &mut self,
        table: TableId,
        archetype: &Archetype,
        column_map: &[Option<u32>],
        traits_of: impl Fn(Id) -> IdTraits,
    ) {
        let mut wildcards: Vec<(Id, TableRecord)> = Vec::new();
        for (index, &id) in archetype.ids().iter().enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            let index = index as u32;
            let column = column_map[index as usize];
            let rid = self.ensure(id, traits_of(id));
            self.rec_mut(rid).cache.insert(TableRecord {
                table,
                index,
                count: 1,
                column,
            });

            let (Some(first), Some(second)) = (id.first(), id.second()) else {
                continue;
            };
            for pattern in [
                Id::pair(first, builtin::WILDCARD),
                Id::pair(builtin::WILDCARD, second),
                Id::ALL_PAIRS,
            ] {
                match wildcards.iter_mut().find(|(p, _)| *p == pattern) {
                    Some((_, tr)) => tr.count += 1,
                    None => wildcards.push((
                        pattern,
                        TableRecord {
                            table,
                            index,
                            count: 1,
                            column,
                        },
                    )),
                }
            }
        }
        for (pattern, tr) in wildcards {
            let rid = self.ensure(pattern, IdTraits::default());
            self.rec_mut(rid).cache.insert(tr);
        }
    }

    /// Removes `table` from every cache it was registered in.
    pub fn unregister_table(&mut self, table: TableId, archetype: &Archetype) {
        for &id in archetype.ids() {
            let mut patterns = vec![id];
            if let (Some(first), Some(second)) = (id.first(), id.second()) {
                patterns.extend([
                    Id::pair(first, builtin::WILDCARD),
                    Id::pair(builtin::WILDCARD, second),
                    Id::ALL_PAIRS,
                ]);
            }
            for pattern in patterns {
                if let Some(rec) = self.get_mut(pattern) {
                    rec.cache.remove(table);
                }
            }
        }
    }

    /// Frees unused, unpinned concrete records and then any wildcard heads
    /// left without elements. Returns the freed ids.
    pub fn prune(&mut self) -> Vec<Id> {
        let candidates: Vec<IdRecordId> = self
            .iter()
            .filter(|(_, rec)| rec.is_unused() && !rec.id.is_wildcard())
            .map(|(rid, _)| rid)
            .collect();
        let mut freed = Vec::new();
        for rid in candidates {
            if let Some(id) = self.free(rid) {
                freed.push(id);
            }
        }
        let heads: Vec<IdRecordId> = self
            .iter()
            .filter(|(_, rec)| {
                rec.is_unused()
                    && rec.id.is_wildcard()
                    && rec.id != Id::ALL_PAIRS
                    && rec.first.next.is_none()
                    && rec.second.next.is_none()
            })
            .map(|(rid, _)| rid)
            .collect();
        for rid in heads {
            if let Some(id) = self.free(rid) {
                freed.push(id);
            }
        }
        freed
    }

    /// Frees a concrete record that nothing uses anymore. Returns the id,
    /// or `None` if the record is missing, a wildcard head, or still in use.
    pub fn free_record(&mut self, rid: IdRecordId) -> Option<Id> {
        let rec = self.record(rid)?;
        if rec.id.is_wildcard() || !rec.is_unused() {
            return None;
        }
        self.free(rid)
    }

    fn free(&mut self, rid: IdRecordId) -> Option<Id> {
        let id = self.record(rid)?.id;
        if let (Some(first), Some(second)) = (id.first(), id.second()) {
            if !id.is_wildcard() {
                if let Some(head) = self.lookup(Id::pair(first, builtin::WILDCARD)) {
                    self.unlink(head, rid, PairList::First);
                }
                if let Some(head) = self.lookup(Id::pair(builtin::WILDCARD, second)) {
                    self.unlink(head, rid, PairList::Second);
                }
            }
        }
        self.by_id.remove(&id);
        self.records[rid.0 as usize] = None;
        Some(id)
    }

    /// Every concrete pair record whose second element is `target`.
    #[must_use]
    pub fn pairs_with_target(&self, target: EntityId) -> Vec<IdRecordId> {
        self.lookup(Id::pair(builtin::WILDCARD, target))
            .map(|head| self.list(head, PairList::Second).collect())
            .unwrap_or_default()
    }

    /// Every concrete pair record whose first element is `relationship`.
    #[must_use]
    pub fn pairs_with_relationship(&self, relationship: EntityId) -> Vec<IdRecordId> {
        Id::try_pair(relationship, builtin::WILDCARD)
            .and_then(|id| self.lookup(id))
            .map(|head| self.list(head, PairList::First).collect())
            .unwrap_or_default()
    }
}

/// Iterator over a pair list.
pub struct ListIter<'a> {
    registry: &'a IdRegistry,
    next: Option<IdRecordId>,
    list: PairList,
}

impl Iterator for ListIter<'_> {
    type Item = IdRecordId;

    fn next(&mut self) -> Option<IdRecordId> {
        let current = self.next?;
        self.next = self.registry.next_in_list(current, self.list);
        Some(current)
    }
}
