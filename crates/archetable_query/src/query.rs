//! Query handles.
//!
//! A [`Query`] owns its compiled program, its cache and the id-record pins
//! that keep the ids it refers to registered. Iteration borrows the world
//! mutably so that written fields can be marked dirty.

use std::collections::HashSet;
use std::fmt;

use archetable_foundation::{EntityId, Error, ErrorKind, Result};
use archetable_storage::{IdRecordId, World};
use log::debug;

use crate::cache::QueryCache;
use crate::compiler::{CompiledQuery, FieldInfo, QueryCompiler};
use crate::iter::QueryIter;
use crate::monitor::FixedMonitor;
use crate::term::QueryDesc;

/// Totals of a full pass over a query.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueryCount {
    /// Number of results.
    pub results: usize,
    /// Number of `$this` rows over all results.
    pub entities: usize,
    /// Number of distinct tables.
    pub tables: usize,
}

/// A compiled, possibly cached query.
#[derive(Debug)]
pub struct Query {
    desc: QueryDesc,
    pub(crate) compiled: CompiledQuery,
    pub(crate) cache: Option<QueryCache>,
    pub(crate) fixed_monitor: Option<FixedMonitor>,
    pub(crate) monitors_enabled: bool,
    pins: Vec<IdRecordId>,
}

impl Query {
    /// Compiles `desc` and, if it has cacheable terms, builds its cache.
    ///
    /// # Errors
    ///
    /// Returns the compiler's error; nothing is registered on failure.
    pub fn new(world: &mut World, desc: QueryDesc) -> Result<Self> {
        let mut compiled = QueryCompiler::compile(world, &desc)?;
        let pins = compiled.ids.iter().map(|&id| world.keep_alive(id)).collect();
        let cache = compiled.cache.take().map(|plan| {
            QueryCache::new(
                world,
                plan.program,
                plan.field_map,
                plan.tracked,
                plan.grouping,
                plan.ordering,
            )
        });
        debug!(
            "created query [{desc}]: {} fields, {}",
            compiled.fields.len(),
            if cache.is_some() { "cached" } else { "uncached" }
        );
        Ok(Self {
            monitors_enabled: desc.detect_changes,
            desc,
            compiled,
            cache,
            fixed_monitor: None,
            pins,
        })
    }

    /// The description the query was built from.
    #[must_use]
    pub fn desc(&self) -> &QueryDesc {
        &self.desc
    }

    /// Field metadata.
    #[must_use]
    pub fn fields(&self) -> &[FieldInfo] {
        &self.compiled.fields
    }

    /// Number of fields.
    #[must_use]
    pub fn field_count(&self) -> usize {
        self.compiled.fields.len()
    }

    /// Returns true if the query has a cache.
    #[must_use]
    pub fn is_cached(&self) -> bool {
        self.cache.is_some()
    }

    /// The query cache.
    #[must_use]
    pub fn cache(&self) -> Option<&QueryCache> {
        self.cache.as_ref()
    }

    /// Renders the compiled program, one op per line. The program of the
    /// cache follows under a `cache:` header.
    #[must_use]
    pub fn plan(&self) -> String {
        let mut plan = self.compiled.program.to_string();
        if let Some(cache) = &self.cache {
            plan.push_str("cache:\n");
            for line in cache.program().to_string().lines() {
                plan.push_str("    ");
                plan.push_str(line);
                plan.push('\n');
            }
        }
        plan
    }

    // =========================================================================
    // Iteration
    // =========================================================================

    /// Starts an iteration. Pending table events are applied to the cache
    /// and ordered tables are re-sorted first.
    pub fn iter<'a>(&'a mut self, world: &'a mut World) -> QueryIter<'a> {
        self.refresh(world);
        QueryIter::new(self, world, false)
    }

    /// Starts an iteration that does not mark writes or advance monitors.
    pub(crate) fn scan<'a>(&'a mut self, world: &'a mut World) -> QueryIter<'a> {
        self.refresh(world);
        QueryIter::new(self, world, true)
    }

    fn refresh(&mut self, world: &mut World) {
        if let Some(cache) = &mut self.cache {
            cache.update(world);
            cache.sort_tables(world);
        }
    }

    /// Counts results, rows and tables without marking anything.
    pub fn count(&mut self, world: &mut World) -> QueryCount {
        let mut it = self.scan(world);
        let mut count = QueryCount::default();
        let mut tables = HashSet::new();
        while it.next() {
            count.results += 1;
            count.entities += it.count();
            if let Some(table) = it.table() {
                tables.insert(table);
            }
        }
        count.tables = tables.len();
        count
    }

    /// Returns true if the query has at least one result.
    pub fn is_true(&mut self, world: &mut World) -> bool {
        self.scan(world).next()
    }

    /// Returns true if `entity` matches the query as `$this`.
    ///
    /// # Errors
    ///
    /// Returns an error if the entity is not alive.
    pub fn matches(&mut self, world: &mut World, entity: EntityId) -> Result<bool> {
        let mut it = self.scan(world);
        it.set_this(entity)?;
        Ok(it.next())
    }

    // =========================================================================
    // Change Detection
    // =========================================================================

    /// Returns true if a field read by the query was written, or the set of
    /// matched tables changed, since the last sync. The first call, and the
    /// first call after a match appears, reports a change.
    ///
    /// # Errors
    ///
    /// Returns an error if the query has no cache.
    pub fn changed(&mut self, world: &mut World) -> Result<bool> {
        self.refresh(world);
        let Some(cache) = self.cache.as_mut() else {
            return Err(Error::new(ErrorKind::IncompatibleCachePolicy(
                "change detection needs a cached query".into(),
            )));
        };
        self.monitors_enabled = true;
        let mut changed = match &self.fixed_monitor {
            Some(monitor) => monitor.is_stale(world),
            None if self.compiled.fixed.is_empty() => false,
            None => {
                self.fixed_monitor = Some(FixedMonitor::new(world, &self.compiled.fixed));
                true
            }
        };
        changed |= cache.check_all(world);
        Ok(changed)
    }

    /// Marks the current state as observed.
    pub fn sync(&mut self, world: &mut World) {
        self.refresh(world);
        self.monitors_enabled = true;
        if let Some(cache) = &mut self.cache {
            cache.sync_all(world);
        }
        self.sync_fixed(world);
    }

    pub(crate) fn sync_fixed(&mut self, world: &World) {
        if self.compiled.fixed.is_empty() {
            return;
        }
        match &mut self.fixed_monitor {
            Some(monitor) => monitor.update(world),
            None => self.fixed_monitor = Some(FixedMonitor::new(world, &self.compiled.fixed)),
        }
    }

    /// Releases the ids pinned by the query.
    pub fn destroy(self, world: &mut World) {
        for rid in self.pins {
            world.release(rid);
        }
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.desc)
    }
}
