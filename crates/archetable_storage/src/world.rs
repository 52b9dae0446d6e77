//! The world: entity index, id registry and tables behind one handle.
//!
//! Every structural change (add, remove, destroy, bulk creation) goes through
//! the `World`, which keeps entity records, table caches and pair lists in
//! sync. Structural changes are refused while the world is readonly; value
//! writes are not.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use archetable_foundation::{EntityId, Error, ErrorKind, Id, Result, Value, builtin};
use log::{debug, trace, warn};

use crate::archetype::Archetype;
use crate::config::WorldConfig;
use crate::conflict::AccessMode;
use crate::entity_index::{EntityIndex, Record, RecordFlags};
use crate::id_record::{IdRecord, IdRecordId, IdRegistry, IdTraits, TableRecord};
use crate::schema::{
    Cardinality, ComponentSchema, OnDelete, OnViolation, RelationshipSchema, Storage,
};
use crate::table::{ColumnSpec, Table, TableEvent, TableId, TableStore, move_row};

/// Comparison used to order rows by a component value.
pub type CompareFn = fn(EntityId, &Value, EntityId, &Value) -> Ordering;

#[derive(Debug, Default)]
struct Metadata {
    components: HashMap<EntityId, ComponentSchema>,
    relationships: HashMap<EntityId, RelationshipSchema>,
    names: HashMap<Arc<str>, EntityId>,
    entity_names: HashMap<EntityId, Arc<str>>,
}

impl Metadata {
    fn data_schema(&self, id: Id) -> Option<&ComponentSchema> {
        match (id.first(), id.second()) {
            (Some(first), Some(second)) => self
                .components
                .get(&first)
                .filter(|s| s.has_data())
                .or_else(|| self.components.get(&second).filter(|s| s.has_data())),
            _ => self
                .components
                .get(&id.type_entity().strip_generation())
                .filter(|s| s.has_data()),
        }
    }

    fn traits(&self, id: Id) -> IdTraits {
        if id.is_wildcard() {
            return IdTraits::default();
        }
        let mut traits = IdTraits::default();
        if let Some(schema) = self.data_schema(id) {
            traits.storage = schema.storage;
            traits.has_data = true;
        } else if let Some(schema) = self.components.get(&id.type_entity().strip_generation()) {
            traits.storage = schema.storage;
        }
        if let Some(rel) = id.first().and_then(|first| self.relationships.get(&first)) {
            traits.exclusive = rel.is_exclusive();
            traits.traversable = rel.traversable;
        }
        traits
    }
}

/// Entity storage with archetype tables.
#[derive(Debug)]
pub struct World {
    config: WorldConfig,
    entities: EntityIndex,
    ids: IdRegistry,
    tables: TableStore,
    meta: Metadata,
    events: Vec<TableEvent>,
    readonly: bool,
    stage: usize,
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl World {
    /// Creates a world with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(WorldConfig::default())
    }

    /// Creates a world with the given configuration.
    #[must_use]
    pub fn with_config(config: WorldConfig) -> Self {
        let stage_count = config.stage_count.max(1);
        let mut world = Self {
            config,
            entities: EntityIndex::new(),
            ids: IdRegistry::new(stage_count),
            tables: TableStore::new(),
            meta: Metadata::default(),
            events: Vec::new(),
            readonly: false,
            stage: 0,
        };
        world
            .tables
            .insert(Table::new(TableId::ROOT, Archetype::empty(), Vec::new(), stage_count));
        world.events.push(TableEvent::Created(TableId::ROOT));

        for (entity, name) in [
            (builtin::WILDCARD, "*"),
            (builtin::ANY, "_"),
            (builtin::CHILD_OF, "ChildOf"),
        ] {
            if world.entities.make_alive(entity).is_ok() {
                world.place_new(entity);
                world.bind_name(entity, Arc::from(name));
            }
        }
        world.meta.relationships.insert(
            builtin::CHILD_OF,
            RelationshipSchema::new("ChildOf")
                .with_cardinality(Cardinality::ManyToOne)
                .with_on_delete(OnDelete::Cascade)
                .traversable(),
        );
        world
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    // =========================================================================
    // Readonly / stages
    // =========================================================================

    /// Enters or leaves readonly mode.
    pub fn set_readonly(&mut self, readonly: bool) {
        self.readonly = readonly;
    }

    /// Returns true while structural changes are refused.
    #[must_use]
    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    /// Selects the stage used for conflict counters.
    ///
    /// # Panics
    ///
    /// Panics if `stage` is not below the configured stage count.
    pub fn set_stage(&mut self, stage: usize) {
        assert!(stage < self.config.stage_count.max(1), "stage out of range");
        self.stage = stage;
    }

    /// The current stage.
    #[must_use]
    pub fn stage(&self) -> usize {
        self.stage
    }

    fn check_mutable(&self) -> Result<()> {
        if self.readonly {
            Err(Error::new(ErrorKind::Readonly))
        } else {
            Ok(())
        }
    }

    // =========================================================================
    // Registration
    // =========================================================================

    fn bind_name(&mut self, entity: EntityId, name: Arc<str>) {
        self.meta.names.insert(name.clone(), entity);
        self.meta.entity_names.insert(entity.strip_generation(), name);
    }

    /// Registers a component. Returns the entity that identifies it.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is taken or the world is readonly.
    pub fn register_component(&mut self, schema: ComponentSchema) -> Result<EntityId> {
        if self.meta.names.contains_key(&schema.name) {
            return Err(Error::new(ErrorKind::DuplicateName(schema.name.to_string())));
        }
        let entity = self.spawn()?;
        self.bind_name(entity, schema.name.clone());
        debug!("registered component {} as {entity}", schema.name);
        self.meta.components.insert(entity.strip_generation(), schema);
        Ok(entity)
    }

    /// Registers a relationship. Returns the entity that identifies it.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is taken or the world is readonly.
    pub fn register_relationship(&mut self, schema: RelationshipSchema) -> Result<EntityId> {
        if self.meta.names.contains_key(&schema.name) {
            return Err(Error::new(ErrorKind::DuplicateName(schema.name.to_string())));
        }
        let entity = self.spawn()?;
        self.bind_name(entity, schema.name.clone());
        debug!("registered relationship {} as {entity}", schema.name);
        self.meta
            .relationships
            .insert(entity.strip_generation(), schema);
        Ok(entity)
    }

    /// Attaches relationship traits to an existing entity, e.g. a component
    /// whose pairs carry data.
    ///
    /// # Errors
    ///
    /// Returns an error if the entity is not alive.
    pub fn set_relationship(&mut self, entity: EntityId, schema: RelationshipSchema) -> Result<()> {
        self.entities.validate(entity)?;
        let key = entity.strip_generation();
        self.meta.relationships.insert(key, schema);
        for rid in self.ids.pairs_with_relationship(key) {
            if let Some(id) = self.ids.record(rid).map(IdRecord::id) {
                let traits = self.meta.traits(id);
                self.ids.update_traits(rid, traits);
            }
        }
        Ok(())
    }

    /// Switches a component to non-fragmenting storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the component (or a pair using it) is already
    /// stored in a table.
    pub fn mark_non_fragmenting(&mut self, component: EntityId) -> Result<()> {
        self.entities.validate(component)?;
        let key = component.strip_generation();
        let mut records = self.ids.pairs_with_relationship(key);
        records.extend(self.ids.lookup(Id::from(component)));
        if records
            .iter()
            .filter_map(|rid| self.ids.record(*rid))
            .any(|rec| !rec.tables().is_empty())
        {
            return Err(Error::invalid_operation(format!(
                "{component} is already stored in tables"
            )));
        }
        let name = self.name(component).unwrap_or_default().to_string();
        self.meta
            .components
            .entry(key)
            .or_insert_with(|| ComponentSchema::tag(name))
            .storage = Storage::DontFragment;
        for rid in records {
            if let Some(id) = self.ids.record(rid).map(IdRecord::id) {
                let traits = self.meta.traits(id);
                self.ids.update_traits(rid, traits);
            }
        }
        Ok(())
    }

    /// Component schema of `entity`.
    #[must_use]
    pub fn component_schema(&self, entity: EntityId) -> Option<&ComponentSchema> {
        self.meta.components.get(&entity.strip_generation())
    }

    /// Relationship schema of `entity`.
    #[must_use]
    pub fn relationship_schema(&self, entity: EntityId) -> Option<&RelationshipSchema> {
        self.meta.relationships.get(&entity.strip_generation())
    }

    /// Schema describing the data carried by `id`, if any.
    #[must_use]
    pub fn data_schema(&self, id: Id) -> Option<&ComponentSchema> {
        self.meta.data_schema(id)
    }

    /// Storage policy and relationship traits of `id`.
    #[must_use]
    pub fn id_traits(&self, id: Id) -> IdTraits {
        self.ids
            .get(id)
            .map_or_else(|| self.meta.traits(id), IdRecord::traits)
    }

    /// Entity registered under `name`.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<EntityId> {
        self.meta
            .names
            .get(name)
            .copied()
            .filter(|e| self.entities.is_alive(*e))
    }

    /// Name of `entity`.
    #[must_use]
    pub fn name(&self, entity: EntityId) -> Option<&str> {
        self.meta
            .entity_names
            .get(&entity.strip_generation())
            .map(AsRef::as_ref)
    }

    /// Binds a name to an entity.
    ///
    /// # Errors
    ///
    /// Returns an error if the entity is not alive or the name is taken.
    pub fn set_name(&mut self, entity: EntityId, name: &str) -> Result<()> {
        self.entities.validate(entity)?;
        if self.lookup(name).is_some_and(|e| e != entity) {
            return Err(Error::new(ErrorKind::DuplicateName(name.to_string())));
        }
        if let Some(old) = self.meta.entity_names.remove(&entity.strip_generation()) {
            self.meta.names.remove(&old);
        }
        self.bind_name(entity, Arc::from(name));
        Ok(())
    }

    // =========================================================================
    // Entity index
    // =========================================================================

    fn place_new(&mut self, entity: EntityId) {
        if let Some(root) = self.tables.get_mut(TableId::ROOT) {
            let row = root.append(entity);
            if let Some(record) = self.entities.get_mut(entity) {
                record.table = Some(TableId::ROOT);
                record.row = row;
            }
        }
    }

    /// Creates an empty entity.
    ///
    /// # Errors
    ///
    /// Returns an error if the world is readonly.
    pub fn spawn(&mut self) -> Result<EntityId> {
        self.check_mutable()?;
        let entity = self.entities.spawn();
        self.place_new(entity);
        Ok(entity)
    }

    /// Creates an empty entity with a name.
    ///
    /// # Errors
    ///
    /// Returns an error if the world is readonly or the name is taken.
    pub fn spawn_named(&mut self, name: &str) -> Result<EntityId> {
        if self.lookup(name).is_some() {
            return Err(Error::new(ErrorKind::DuplicateName(name.to_string())));
        }
        let entity = self.spawn()?;
        self.bind_name(entity, Arc::from(name));
        Ok(entity)
    }

    /// Makes a specific id alive, placing it in the root table.
    ///
    /// # Errors
    ///
    /// Returns an error if another generation of the index is alive or the
    /// world is readonly.
    pub fn make_alive(&mut self, entity: EntityId) -> Result<()> {
        self.check_mutable()?;
        if self.entities.is_alive(entity) {
            return Ok(());
        }
        self.entities.make_alive(entity)?;
        self.place_new(entity);
        Ok(())
    }

    /// Returns true if the entity is alive.
    #[must_use]
    pub fn exists(&self, entity: EntityId) -> bool {
        self.entities.is_alive(entity)
    }

    /// Resolves an id of unknown generation to the live entity, or null.
    #[must_use]
    pub fn get_alive(&self, entity: EntityId) -> EntityId {
        self.entities.get_alive(entity)
    }

    /// Record of a live entity.
    #[must_use]
    pub fn record(&self, entity: EntityId) -> Option<&Record> {
        self.entities.get(entity)
    }

    /// Validates that an entity is live.
    ///
    /// # Errors
    ///
    /// Returns not-found or stale-entity errors.
    pub fn validate(&self, entity: EntityId) -> Result<()> {
        self.entities.validate(entity)
    }

    /// Number of live entities, builtins included.
    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Iterates live entities.
    pub fn entities(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.entities.iter()
    }

    fn location(&self, entity: EntityId) -> Result<(TableId, u32)> {
        self.entities.validate(entity)?;
        let record = self
            .entities
            .get(entity)
            .ok_or_else(|| Error::entity_not_found(entity))?;
        let table = record
            .table
            .ok_or_else(|| Error::new(ErrorKind::Internal(format!("{entity} has no table"))))?;
        Ok((table, record.row))
    }

    /// Table holding `entity`.
    #[must_use]
    pub fn table_of(&self, entity: EntityId) -> Option<TableId> {
        self.entities.get(entity).and_then(|r| r.table)
    }

    /// Every id of `entity`, including non-fragmenting ones.
    #[must_use]
    pub fn entity_ids(&self, entity: EntityId) -> Vec<Id> {
        let Some(record) = self.entities.get(entity) else {
            return Vec::new();
        };
        let mut ids: Vec<Id> = record
            .table
            .and_then(|t| self.tables.get(t))
            .map(|t| t.archetype().ids().to_vec())
            .unwrap_or_default();
        if record.flags.contains(RecordFlags::HAS_DONT_FRAGMENT) {
            ids.extend(
                self.ids
                    .iter()
                    .filter(|(_, rec)| {
                        rec.is_non_fragmenting() && rec.sparse().is_some_and(|s| s.contains(entity))
                    })
                    .map(|(_, rec)| rec.id()),
            );
        }
        ids
    }

    // =========================================================================
    // Id registry
    // =========================================================================

    /// The id registry.
    #[must_use]
    pub fn id_registry(&self) -> &IdRegistry {
        &self.ids
    }

    /// Record of `id`.
    #[must_use]
    pub fn id_record(&self, id: Id) -> Option<&IdRecord> {
        self.ids.get(id)
    }

    /// Returns the record of `id`, creating it if absent.
    pub fn ensure_id_record(&mut self, id: Id) -> IdRecordId {
        let traits = self.meta.traits(id);
        self.ids.ensure(id, traits)
    }

    /// Where `id` sits in `table`.
    #[must_use]
    pub fn get_table_record(&self, id: Id, table: TableId) -> Option<&TableRecord> {
        self.ids.get(id)?.table_record(table)
    }

    /// Pins the record of `id` so pruning keeps it.
    pub fn keep_alive(&mut self, id: Id) -> IdRecordId {
        let rid = self.ensure_id_record(id);
        self.ids.keep_alive(rid);
        rid
    }

    /// Releases a pin.
    pub fn release(&mut self, rid: IdRecordId) {
        self.ids.release(rid);
    }

    fn flag_target(&mut self, target: EntityId, traversable: bool) {
        let alive = self.entities.get_alive(target);
        if let Some(record) = self.entities.get_mut(alive) {
            record.flags.insert(RecordFlags::IS_TARGET);
            if traversable {
                record.flags.insert(RecordFlags::IS_TRAVERSABLE);
            }
        }
    }

    fn default_for(&self, id: Id) -> Value {
        self.meta
            .data_schema(id)
            .map(ComponentSchema::default_value)
            .unwrap_or_default()
    }

    // =========================================================================
    // Tables
    // =========================================================================

    /// Table by id.
    #[must_use]
    pub fn table(&self, table: TableId) -> Option<&Table> {
        self.tables.get(table)
    }

    /// Table by id, mutably. Writes through it are not marked dirty.
    pub fn table_mut(&mut self, table: TableId) -> Option<&mut Table> {
        self.tables.get_mut(table)
    }

    /// Live tables.
    pub fn tables(&self) -> impl Iterator<Item = &Table> + '_ {
        self.tables.iter()
    }

    /// Number of live tables, root included.
    #[must_use]
    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    /// Returns the table with exactly `archetype`, creating it if needed.
    pub fn find_or_create_table(&mut self, archetype: Archetype) -> TableId {
        if let Some(table) = self.tables.find(&archetype) {
            return table;
        }
        debug_assert!(
            archetype
                .ids()
                .iter()
                .all(|id| !id.is_wildcard() && self.meta.traits(*id).storage.fragments()),
            "table types hold only concrete fragmenting ids"
        );
        let columns: Vec<ColumnSpec> = archetype
            .ids()
            .iter()
            .filter_map(|&id| {
                let traits = self.meta.traits(id);
                if !traits.has_data || traits.storage != Storage::Table {
                    return None;
                }
                let schema = self.meta.data_schema(id)?;
                Some(ColumnSpec {
                    id,
                    default: schema.default_value(),
                    hooks: schema.hooks,
                })
            })
            .collect();

        let tid = self.tables.next_id();
        let table = Table::new(tid, archetype.clone(), columns, self.config.stage_count);
        let meta = &self.meta;
        self.ids
            .register_table(tid, &archetype, table.column_map(), |id| meta.traits(id));
        self.tables.insert(table);
        self.events.push(TableEvent::Created(tid));
        debug!("created table {tid:?} with type {archetype:?}");
        tid
    }

    /// Destination of adding `id` to `table`. Edges are cached.
    pub fn table_add_id(&mut self, table: TableId, id: Id) -> TableId {
        let Some(src) = self.tables.get(table) else {
            return table;
        };
        if let Some(&dst) = src.edges.add.get(&id) {
            return dst;
        }
        let Some(archetype) = src.archetype().with_id(id) else {
            return table;
        };
        let dst = self.find_or_create_table(archetype);
        if let Some(src) = self.tables.get_mut(table) {
            src.edges.add.insert(id, dst);
        }
        if let Some(dst_table) = self.tables.get_mut(dst) {
            dst_table.edges.remove.insert(id, table);
        }
        dst
    }

    /// Destination of removing `id` from `table`. Edges are cached.
    pub fn table_remove_id(&mut self, table: TableId, id: Id) -> TableId {
        let Some(src) = self.tables.get(table) else {
            return table;
        };
        if let Some(&dst) = src.edges.remove.get(&id) {
            return dst;
        }
        let Some(archetype) = src.archetype().without_id(id) else {
            return table;
        };
        let dst = self.find_or_create_table(archetype);
        if let Some(src) = self.tables.get_mut(table) {
            src.edges.remove.insert(id, dst);
        }
        if let Some(dst_table) = self.tables.get_mut(dst) {
            dst_table.edges.add.insert(id, table);
        }
        dst
    }

    /// Membership and column write counters of `table`.
    #[must_use]
    pub fn dirty_state(&self, table: TableId) -> Option<&[i32]> {
        self.tables.get(table).map(Table::dirty_state)
    }

    /// Column storing `id` in `table`.
    #[must_use]
    pub fn column_index(&self, table: TableId, id: Id) -> Option<u32> {
        self.tables.get(table)?.column_index(id)
    }

    /// Marks a column written.
    pub fn touch(&mut self, table: TableId, column: u32) {
        if let Some(t) = self.tables.get_mut(table) {
            if (column as usize) < t.columns().len() {
                t.touch(column);
            }
        }
    }

    /// Target of the `index`-th `(rel, *)` pair in a table type.
    #[must_use]
    pub fn table_target(&self, table: TableId, rel: EntityId, index: usize) -> Option<EntityId> {
        let table = self.tables.get(table)?;
        let (_, pair) = table
            .archetype()
            .matching(Id::pair(rel, builtin::WILDCARD))
            .nth(index)?;
        let target = self.entities.get_alive(pair.second()?);
        (!target.is_null()).then_some(target)
    }

    /// Target of the `index`-th `(rel, *)` pair of an entity.
    #[must_use]
    pub fn target(&self, entity: EntityId, rel: EntityId, index: usize) -> Option<EntityId> {
        self.table_target(self.table_of(entity)?, rel, index)
    }

    /// Parent through `ChildOf`.
    #[must_use]
    pub fn parent(&self, entity: EntityId) -> Option<EntityId> {
        self.target(entity, builtin::CHILD_OF, 0)
    }

    /// Number of `rel` hops from `table` to a table without a `rel` target.
    #[must_use]
    pub fn depth(&self, table: TableId, rel: EntityId) -> usize {
        let mut depth = 0;
        let mut current = table;
        while let Some(target) = self.table_target(current, rel, 0) {
            depth += 1;
            if depth >= self.config.max_traversal_depth {
                warn!("traversal depth limit reached following {rel}");
                break;
            }
            match self.table_of(target) {
                Some(next) => current = next,
                None => break,
            }
        }
        depth
    }

    /// Sorts the rows of `table` by the values in `column`. Returns true
    /// if any row moved.
    pub fn sort_table(&mut self, table: TableId, column: u32, compare: CompareFn) -> bool {
        let Some(t) = self.tables.get_mut(table) else {
            return false;
        };
        let order = {
            let Some(col) = t.column(column) else {
                return false;
            };
            let values = col.values();
            let entities = t.entities();
            let mut order: Vec<usize> = (0..entities.len()).collect();
            order.sort_by(|&a, &b| compare(entities[a], &values[a], entities[b], &values[b]));
            order
        };
        if order.iter().enumerate().all(|(i, &o)| i == o) {
            return false;
        }
        t.permute(&order);
        for (row, entity) in t.entities().iter().enumerate() {
            if let Some(record) = self.entities.get_mut(*entity) {
                #[allow(clippy::cast_possible_truncation)]
                {
                    record.row = row as u32;
                }
            }
        }
        true
    }

    fn delete_table(&mut self, table: TableId) -> bool {
        if table == TableId::ROOT {
            return false;
        }
        if self.tables.get(table).is_none_or(|t| !t.is_empty()) {
            return false;
        }
        let Some(removed) = self.tables.remove(table) else {
            return false;
        };
        self.ids.unregister_table(table, removed.archetype());
        self.events.push(TableEvent::Deleted(table));
        debug!("deleted table {table:?} with type {:?}", removed.archetype());
        true
    }

    fn maybe_delete_empty(&mut self, table: TableId) {
        if self.config.delete_empty_tables {
            self.delete_table(table);
        }
    }

    /// Deletes every empty table except the root, then frees unused id
    /// records. Returns the number of tables deleted.
    pub fn prune_empty_tables(&mut self) -> usize {
        let empty: Vec<TableId> = self
            .tables
            .iter()
            .filter(|t| t.is_empty() && t.id() != TableId::ROOT)
            .map(Table::id)
            .collect();
        let deleted = empty.into_iter().filter(|t| self.delete_table(*t)).count();
        let freed = self.ids.prune();
        debug!("pruned {deleted} tables and {} id records", freed.len());
        deleted
    }

    /// Table lifecycle events since world creation.
    #[must_use]
    pub fn table_events(&self) -> &[TableEvent] {
        &self.events
    }

    /// Events after `cursor`, and the cursor to use next time.
    #[must_use]
    pub fn table_events_since(&self, cursor: usize) -> (&[TableEvent], usize) {
        let start = cursor.min(self.events.len());
        (&self.events[start..], self.events.len())
    }

    // =========================================================================
    // Structural changes
    // =========================================================================

    fn commit(&mut self, entity: EntityId, dst: TableId) -> Result<()> {
        let (src, row) = self.location(entity)?;
        if src == dst {
            return Ok(());
        }
        if self.tables.get(dst).is_none() {
            return Err(Error::new(ErrorKind::Internal(format!(
                "destination table {dst:?} missing"
            ))));
        }
        let (src_table, dst_table) = self.tables.pair_mut(src, dst);
        let (new_row, swapped) = move_row(src_table, row, dst_table);
        if let Some(swapped) = swapped {
            if let Some(record) = self.entities.get_mut(swapped) {
                record.row = row;
            }
        }
        if let Some(record) = self.entities.get_mut(entity) {
            record.table = Some(dst);
            record.row = new_row;
        }
        trace!("moved {entity} from {src:?} to {dst:?}");
        if self.tables.get(src).is_some_and(Table::is_empty) {
            self.maybe_delete_empty(src);
        }
        Ok(())
    }

    /// Adds `id` to `entity`. Adding an id the entity already has is a
    /// no-op. Adding `(R, B)` for an exclusive `R` replaces `(R, A)`.
    ///
    /// # Errors
    ///
    /// Returns an error for dead entities, wildcard ids, a readonly world,
    /// or an exclusive relationship configured to refuse replacement.
    pub fn add(&mut self, entity: EntityId, id: Id) -> Result<()> {
        self.check_mutable()?;
        self.entities.validate(entity)?;
        if id.is_wildcard() {
            return Err(Error::invalid_operation(format!("cannot add wildcard id {id}")));
        }
        let rid = self.ensure_id_record(id);
        let traits = self.ids.record(rid).map(IdRecord::traits).unwrap_or_default();
        if let Some(target) = id.second() {
            self.flag_target(target, traits.traversable);
        }

        if !traits.storage.fragments() {
            let default = self.default_for(id);
            if let Some(set) = self.ids.record_mut(rid).and_then(IdRecord::sparse_mut) {
                if !set.contains(entity) {
                    set.insert(entity, default);
                }
            }
            if let Some(record) = self.entities.get_mut(entity) {
                record.flags.insert(RecordFlags::HAS_DONT_FRAGMENT);
            }
            return Ok(());
        }

        let (table, _) = self.location(entity)?;
        let archetype = self
            .tables
            .get(table)
            .map(|t| t.archetype().clone())
            .unwrap_or_default();
        if archetype.contains(id) {
            return Ok(());
        }

        let mut replaced = Vec::new();
        if traits.exclusive {
            if let Some(first) = id.first() {
                replaced = archetype
                    .matching(Id::pair(first, builtin::WILDCARD))
                    .map(|(_, old)| old)
                    .collect();
                if !replaced.is_empty()
                    && self
                        .relationship_schema(first)
                        .is_some_and(|s| s.on_violation == OnViolation::Error)
                {
                    return Err(Error::invalid_operation(format!(
                        "{entity} already has a target for exclusive relationship {first}"
                    )));
                }
            }
        }

        let dst = if replaced.is_empty() {
            self.table_add_id(table, id)
        } else {
            for old in &replaced {
                self.remove_sparse_value(entity, *old);
            }
            let mut ids: Vec<Id> = archetype
                .ids()
                .iter()
                .copied()
                .filter(|i| !replaced.contains(i))
                .collect();
            ids.push(id);
            self.find_or_create_table(Archetype::new(ids))
        };
        self.commit(entity, dst)?;

        if traits.storage == Storage::Sparse {
            let default = self.default_for(id);
            if let Some(set) = self.ids.record_mut(rid).and_then(IdRecord::sparse_mut) {
                set.insert(entity, default);
            }
        }
        Ok(())
    }

    /// Adds the pair `(first, second)`.
    ///
    /// # Errors
    ///
    /// See [`Self::add`].
    pub fn add_pair(&mut self, entity: EntityId, first: EntityId, second: EntityId) -> Result<()> {
        self.add(entity, Id::pair(first, second))
    }

    fn remove_sparse_value(&mut self, entity: EntityId, id: Id) {
        let on_remove = self.meta.data_schema(id).and_then(|s| s.hooks.on_remove);
        if let Some(value) = self
            .ids
            .get_mut(id)
            .and_then(IdRecord::sparse_mut)
            .and_then(|set| set.remove(entity))
        {
            if let Some(on_remove) = on_remove {
                on_remove(entity, &value);
            }
        }
    }

    /// Removes `id` from `entity`. A wildcard removes every matching id.
    ///
    /// # Errors
    ///
    /// Returns an error for dead entities or a readonly world.
    pub fn remove(&mut self, entity: EntityId, id: Id) -> Result<()> {
        self.check_mutable()?;
        self.entities.validate(entity)?;
        if id.is_wildcard() {
            let matching: Vec<Id> = self
                .entity_ids(entity)
                .into_iter()
                .filter(|i| id.matches(*i))
                .collect();
            for m in matching {
                self.remove(entity, m)?;
            }
            return Ok(());
        }
        let Some(traits) = self.ids.get(id).map(IdRecord::traits) else {
            return Ok(());
        };
        if traits.storage.is_sparse() {
            self.remove_sparse_value(entity, id);
        }
        if traits.storage.fragments() {
            let (table, _) = self.location(entity)?;
            let dst = self.table_remove_id(table, id);
            self.commit(entity, dst)?;
        }
        Ok(())
    }

    /// Returns true if `entity` has `id`. Wildcards match any id.
    #[must_use]
    pub fn has(&self, entity: EntityId, id: Id) -> bool {
        let Some(record) = self.entities.get(entity) else {
            return false;
        };
        if let Some(table) = record.table.and_then(|t| self.tables.get(t)) {
            let found = if id.is_wildcard() {
                table.archetype().matching(id).next().is_some()
            } else {
                table.archetype().contains(id)
            };
            if found {
                return true;
            }
        }
        if !record.flags.contains(RecordFlags::HAS_DONT_FRAGMENT) {
            return false;
        }
        let holds = |rec: &IdRecord| {
            rec.is_non_fragmenting() && rec.sparse().is_some_and(|s| s.contains(entity))
        };
        if id.is_wildcard() {
            self.ids
                .iter()
                .any(|(_, rec)| id.matches(rec.id()) && holds(rec))
        } else {
            self.ids.get(id).is_some_and(holds)
        }
    }

    /// Sets the value of `id`, adding it first if needed. Marks the column
    /// written.
    ///
    /// # Errors
    ///
    /// Returns an error if `id` carries no data, the value does not match
    /// the schema, or the add fails.
    pub fn set(&mut self, entity: EntityId, id: Id, value: Value) -> Result<()> {
        self.entities.validate(entity)?;
        if id.is_wildcard() {
            return Err(Error::invalid_operation(format!("cannot set wildcard id {id}")));
        }
        let schema = self
            .meta
            .data_schema(id)
            .ok_or_else(|| Error::unknown_component(id))?;
        schema.validate(&value)?;
        if !self.has(entity, id) {
            self.add(entity, id)?;
        }
        self.write(entity, id, value)
    }

    /// Sets the value of pair `(first, second)`.
    ///
    /// # Errors
    ///
    /// See [`Self::set`].
    pub fn set_pair(
        &mut self,
        entity: EntityId,
        first: EntityId,
        second: EntityId,
        value: Value,
    ) -> Result<()> {
        self.set(entity, Id::pair(first, second), value)
    }

    fn write(&mut self, entity: EntityId, id: Id, value: Value) -> Result<()> {
        let traits = self.id_traits(id);
        if traits.storage.is_sparse() {
            let set = self
                .ids
                .get_mut(id)
                .and_then(IdRecord::sparse_mut)
                .ok_or_else(|| Error::component_not_found(entity, id))?;
            set.insert(entity, value);
            return Ok(());
        }
        let (table, row) = self.location(entity)?;
        let t = self
            .tables
            .get_mut(table)
            .ok_or_else(|| Error::entity_not_found(entity))?;
        let column = t
            .column_index(id)
            .ok_or_else(|| Error::component_not_found(entity, id))?;
        if let Some(slot) = t.get_mut(row, column) {
            *slot = value;
        }
        t.touch(column);
        Ok(())
    }

    /// Value of `id` on `entity`, `None` if it has no such value.
    ///
    /// # Errors
    ///
    /// Returns an error if the entity is not alive.
    pub fn get(&self, entity: EntityId, id: Id) -> Result<Option<&Value>> {
        self.entities.validate(entity)?;
        Ok(self.get_value(entity, id))
    }

    /// Value of `id` on `entity` without liveness errors.
    #[must_use]
    pub fn get_value(&self, entity: EntityId, id: Id) -> Option<&Value> {
        let rec = self.ids.get(id)?;
        if let Some(set) = rec.sparse() {
            return set.get(entity);
        }
        let record = self.entities.get(entity)?;
        let table = self.tables.get(record.table?)?;
        let column = rec.table_record(table.id())?.column?;
        table.get(record.row, column)
    }

    /// Mutable value of `id` on `entity`. The write is not marked; call
    /// [`Self::modified`] afterwards or use [`Self::modify`].
    ///
    /// # Errors
    ///
    /// Returns an error if the entity is not alive.
    pub fn get_mut(&mut self, entity: EntityId, id: Id) -> Result<Option<&mut Value>> {
        self.entities.validate(entity)?;
        let Some(rec) = self.ids.get_mut(id) else {
            return Ok(None);
        };
        if rec.sparse().is_some() {
            return Ok(rec.sparse_mut().and_then(|set| set.get_mut(entity)));
        }
        let Some(record) = self.entities.get(entity) else {
            return Ok(None);
        };
        let Some(table_id) = record.table else {
            return Ok(None);
        };
        let row = record.row;
        let Some(column) = rec.table_record(table_id).and_then(|tr| tr.column) else {
            return Ok(None);
        };
        Ok(self
            .tables
            .get_mut(table_id)
            .and_then(|t| t.get_mut(row, column)))
    }

    /// Marks the column holding `id` for `entity` as written.
    ///
    /// # Errors
    ///
    /// Returns an error if the entity is not alive.
    pub fn modified(&mut self, entity: EntityId, id: Id) -> Result<()> {
        let (table, _) = self.location(entity)?;
        if let Some(column) = self.column_index(table, id) {
            self.touch(table, column);
        }
        Ok(())
    }

    /// Edits the value of `id` in place and marks it written.
    ///
    /// # Errors
    ///
    /// Returns an error if the entity is dead or lacks the value.
    pub fn modify(&mut self, entity: EntityId, id: Id, edit: impl FnOnce(&mut Value)) -> Result<()> {
        let value = self
            .get_mut(entity, id)?
            .ok_or_else(|| Error::component_not_found(entity, id))?;
        edit(value);
        self.modified(entity, id)
    }

    fn users_of(&self, rec: &IdRecord) -> Vec<EntityId> {
        let mut users: Vec<EntityId> = rec
            .tables()
            .records()
            .iter()
            .filter_map(|tr| self.tables.get(tr.table))
            .flat_map(|t| t.entities().iter().copied())
            .collect();
        if let Some(set) = rec.sparse() {
            users.extend(set.entities().iter().copied());
        }
        users
    }

    /// Deletes an entity, applying the cleanup policy of every relationship
    /// that targets it and removing it from every entity that uses it as an
    /// id.
    ///
    /// # Errors
    ///
    /// Returns an error if the entity is not alive, the world is readonly,
    /// or a relationship with an `Error` cleanup policy still targets it.
    pub fn destroy(&mut self, entity: EntityId) -> Result<()> {
        self.check_mutable()?;
        self.entities.validate(entity)?;
        let mut deleting = HashSet::new();
        self.destroy_inner(entity, &mut deleting)
    }

    fn destroy_inner(&mut self, entity: EntityId, deleting: &mut HashSet<EntityId>) -> Result<()> {
        if !deleting.insert(entity) || !self.entities.is_alive(entity) {
            return Ok(());
        }
        let key = entity.strip_generation();

        let mut cascade = Vec::new();
        let mut strip: Vec<(EntityId, Id)> = Vec::new();
        let mut referencing = self.ids.pairs_with_target(key);
        for rid in &referencing {
            let Some(rec) = self.ids.record(*rid) else {
                continue;
            };
            let pair = rec.id();
            let users = self.users_of(rec);
            if users.is_empty() {
                continue;
            }
            let policy = pair
                .first()
                .and_then(|r| self.meta.relationships.get(&r))
                .map_or(OnDelete::Remove, |s| s.on_target_delete);
            match policy {
                OnDelete::Error => {
                    warn!("refusing to delete {entity}: still target of {pair}");
                    return Err(Error::new(ErrorKind::DeleteConstraint {
                        entity,
                        relationship: pair,
                    }));
                }
                OnDelete::Cascade => cascade.extend(users),
                OnDelete::Remove => strip.extend(users.into_iter().map(|u| (u, pair))),
            }
        }

        let mut as_id = self.ids.pairs_with_relationship(key);
        as_id.extend(self.ids.lookup(Id::from(entity)));
        for rid in &as_id {
            if let Some(rec) = self.ids.record(*rid) {
                let id = rec.id();
                strip.extend(self.users_of(rec).into_iter().map(|u| (u, id)));
            }
        }
        referencing.extend(as_id);

        for (user, id) in strip {
            if user != entity && self.entities.is_alive(user) {
                self.remove(user, id)?;
            }
        }
        for victim in cascade {
            if victim != entity {
                self.destroy_inner(victim, deleting)?;
            }
        }

        let sparse: Vec<Id> = self
            .ids
            .iter()
            .filter(|(_, rec)| rec.sparse().is_some_and(|s| s.contains(entity)))
            .map(|(_, rec)| rec.id())
            .collect();
        for id in sparse {
            self.remove_sparse_value(entity, id);
        }

        let (table, row) = self.location(entity)?;
        if let Some(t) = self.tables.get_mut(table) {
            if let Some(swapped) = t.delete_row(row) {
                if let Some(record) = self.entities.get_mut(swapped) {
                    record.row = row;
                }
            }
        }
        self.entities.remove(entity);
        if let Some(name) = self.meta.entity_names.remove(&key) {
            self.meta.names.remove(&name);
        }
        self.meta.components.remove(&key);
        self.meta.relationships.remove(&key);
        self.maybe_delete_empty(table);
        self.purge_records(&referencing);
        trace!("destroyed {entity}");
        Ok(())
    }

    /// Drops the empty tables and unpinned records of ids that referenced
    /// a destroyed entity, so a recycled index does not inherit them.
    fn purge_records(&mut self, records: &[IdRecordId]) {
        let mut tables = Vec::new();
        for rid in records {
            if let Some(rec) = self.ids.record(*rid) {
                tables.extend(rec.tables().records().iter().map(|tr| tr.table));
            }
        }
        for table in tables {
            self.delete_table(table);
        }
        for rid in records {
            if self.ids.record(*rid).is_some_and(IdRecord::is_unused) {
                self.ids.free_record(*rid);
            }
        }
    }

    /// Creates a copy of `src` in the same table. Values are copied through
    /// `on_copy` when `copy_values` is set, default-constructed otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if `src` is not alive or the world is readonly.
    pub fn clone_entity(&mut self, src: EntityId, copy_values: bool) -> Result<EntityId> {
        self.check_mutable()?;
        let (table, row) = self.location(src)?;
        let dst = self.entities.spawn();
        let t = self
            .tables
            .get_mut(table)
            .ok_or_else(|| Error::entity_not_found(src))?;
        let new_row = t.append(dst);
        if copy_values {
            #[allow(clippy::cast_possible_truncation)]
            for c in 0..t.columns().len() as u32 {
                let on_copy = t.column(c).and_then(|col| col.hooks().on_copy);
                let Some(value) = t.get(row, c) else {
                    continue;
                };
                let copy = on_copy.map_or_else(|| value.clone(), |f| f(value));
                if let Some(slot) = t.get_mut(new_row, c) {
                    *slot = copy;
                }
            }
        }
        let src_flags = self.entities.get(src).map(|r| r.flags).unwrap_or_default();
        if let Some(record) = self.entities.get_mut(dst) {
            record.table = Some(table);
            record.row = new_row;
            if src_flags.contains(RecordFlags::HAS_DONT_FRAGMENT) {
                record.flags.insert(RecordFlags::HAS_DONT_FRAGMENT);
            }
        }

        let sparse: Vec<(Id, Value)> = self
            .ids
            .iter()
            .filter_map(|(_, rec)| Some((rec.id(), rec.sparse()?.get(src)?.clone())))
            .collect();
        for (id, value) in sparse {
            let value = if copy_values {
                match self.meta.data_schema(id).and_then(|s| s.hooks.on_copy) {
                    Some(on_copy) => on_copy(&value),
                    None => value,
                }
            } else {
                self.default_for(id)
            };
            if let Some(set) = self.ids.get_mut(id).and_then(IdRecord::sparse_mut) {
                set.insert(dst, value);
            }
        }
        Ok(dst)
    }

    fn table_for_ids(&mut self, ids: &[Id]) -> Result<(TableId, Vec<Id>)> {
        let mut type_ids = Vec::new();
        let mut sparse_ids = Vec::new();
        for &id in ids {
            if id.is_wildcard() {
                return Err(Error::invalid_operation(format!("cannot add wildcard id {id}")));
            }
            let rid = self.ensure_id_record(id);
            let traits = self.ids.record(rid).map(IdRecord::traits).unwrap_or_default();
            if let Some(target) = id.second() {
                self.flag_target(target, traits.traversable);
            }
            if traits.exclusive {
                if let Some(first) = id.first() {
                    let pattern = Id::pair(first, builtin::WILDCARD);
                    if type_ids.iter().any(|other: &Id| *other != id && pattern.matches(*other)) {
                        return Err(Error::invalid_operation(format!(
                            "multiple targets for exclusive relationship {first}"
                        )));
                    }
                }
            }
            if traits.storage.fragments() {
                type_ids.push(id);
            }
            if traits.storage.is_sparse() {
                sparse_ids.push(id);
            }
        }
        Ok((self.find_or_create_table(Archetype::new(type_ids)), sparse_ids))
    }

    fn place_bulk(&mut self, table: TableId, entities: &[EntityId], sparse_ids: &[Id]) {
        if entities.is_empty() {
            return;
        }
        if let Some(t) = self.tables.get_mut(table) {
            let first = t.append_n(entities);
            for (i, entity) in entities.iter().enumerate() {
                if let Some(record) = self.entities.get_mut(*entity) {
                    record.table = Some(table);
                    #[allow(clippy::cast_possible_truncation)]
                    {
                        record.row = first + i as u32;
                    }
                }
            }
        }
        for &id in sparse_ids {
            let default = self.default_for(id);
            let non_fragmenting = !self.id_traits(id).storage.fragments();
            if let Some(set) = self.ids.get_mut(id).and_then(IdRecord::sparse_mut) {
                for entity in entities {
                    set.insert(*entity, default.clone());
                }
            }
            if non_fragmenting {
                for entity in entities {
                    if let Some(record) = self.entities.get_mut(*entity) {
                        record.flags.insert(RecordFlags::HAS_DONT_FRAGMENT);
                    }
                }
            }
        }
    }

    /// Creates `count` entities with `ids` in one step: rows are reserved
    /// together and the table membership counter moves once.
    ///
    /// # Errors
    ///
    /// Returns an error for wildcard ids, conflicting exclusive pairs, or a
    /// readonly world.
    pub fn bulk_new(&mut self, ids: &[Id], count: usize) -> Result<Vec<EntityId>> {
        self.check_mutable()?;
        let (table, sparse_ids) = self.table_for_ids(ids)?;
        let entities: Vec<EntityId> = (0..count).map(|_| self.entities.spawn()).collect();
        self.place_bulk(table, &entities, &sparse_ids);
        debug!("bulk created {count} entities in {table:?}");
        Ok(entities)
    }

    /// Like [`Self::bulk_new`] but with caller-chosen entity ids. Ids that
    /// are already alive receive the ids individually. Every entity id is
    /// checked before any is created, so a rejected call leaves the world
    /// unchanged.
    ///
    /// # Errors
    ///
    /// Returns an error if an id collides with another live generation or
    /// with another generation of the same index in `entities`, plus the
    /// errors of [`Self::bulk_new`].
    pub fn bulk_new_with_ids(&mut self, entities: &[EntityId], ids: &[Id]) -> Result<()> {
        self.check_mutable()?;
        let (table, sparse_ids) = self.table_for_ids(ids)?;
        let mut claimed: HashMap<u32, EntityId> = HashMap::with_capacity(entities.len());
        for &entity in entities {
            self.entities.check_claim(entity)?;
            match claimed.insert(entity.index(), entity) {
                Some(other) if other != entity => return Err(Error::stale_entity(entity)),
                _ => {}
            }
        }
        let mut fresh = Vec::with_capacity(entities.len());
        let mut existing = Vec::new();
        for &entity in entities {
            if self.entities.is_alive(entity) {
                existing.push(entity);
            } else {
                self.entities.make_alive(entity)?;
                fresh.push(entity);
            }
        }
        self.place_bulk(table, &fresh, &sparse_ids);
        for entity in existing {
            for &id in ids {
                self.add(entity, id)?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Conflict counters
    // =========================================================================

    /// Registers access to a table column.
    ///
    /// # Errors
    ///
    /// Returns an access conflict if the access overlaps an incompatible
    /// one. Always succeeds when access checks are disabled.
    pub fn begin_column_access(&self, table: TableId, column: u32, mode: AccessMode) -> Result<()> {
        if !self.config.check_access {
            return Ok(());
        }
        let Some(col) = self.tables.get(table).and_then(|t| t.column(column)) else {
            return Ok(());
        };
        if col.access().begin(self.stage, mode) {
            Ok(())
        } else {
            Err(Error::access_conflict(
                format!("{mode:?} of column {column} in {table:?}"),
                self.stage,
            ))
        }
    }

    /// Releases access registered with [`Self::begin_column_access`].
    pub fn end_column_access(&self, table: TableId, column: u32, mode: AccessMode) {
        if !self.config.check_access {
            return;
        }
        if let Some(col) = self.tables.get(table).and_then(|t| t.column(column)) {
            col.access().end(self.stage, mode);
        }
    }

    /// Registers access to the sparse data of `id`.
    ///
    /// # Errors
    ///
    /// Returns an access conflict if the access overlaps an incompatible
    /// one. Always succeeds when access checks are disabled.
    pub fn begin_sparse_access(&self, id: Id, mode: AccessMode) -> Result<()> {
        if !self.config.check_access {
            return Ok(());
        }
        let Some(rec) = self.ids.get(id) else {
            return Ok(());
        };
        if rec.access().begin(self.stage, mode) {
            Ok(())
        } else {
            Err(Error::access_conflict(
                format!("{mode:?} of sparse {id}"),
                self.stage,
            ))
        }
    }

    /// Releases access registered with [`Self::begin_sparse_access`].
    pub fn end_sparse_access(&self, id: Id, mode: AccessMode) {
        if !self.config.check_access {
            return;
        }
        if let Some(rec) = self.ids.get(id) {
            rec.access().end(self.stage, mode);
        }
    }
}
