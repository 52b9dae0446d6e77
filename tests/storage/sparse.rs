//! Integration tests for sparse and non-fragmenting storage

use archetable_foundation::{ErrorKind, Id, Type, Value};
use archetable_storage::{
    ComponentSchema, FieldSchema, RecordFlags, RelationshipSchema, Storage, World, WorldConfig,
};

use crate::assert_rows_dense;

fn component(world: &mut World, name: &str, storage: Storage) -> Id {
    Id::from(
        world
            .register_component(
                ComponentSchema::new(name)
                    .with_field(FieldSchema::optional("hp", Type::Int, Value::Int(100)))
                    .with_storage(storage),
            )
            .unwrap(),
    )
}

fn hp(value: i64) -> Value {
    Value::record([("hp", value)])
}

// =============================================================================
// Sparse
// =============================================================================

#[test]
fn sparse_ids_fragment_but_keep_data_aside() {
    let mut world = World::with_config(WorldConfig::unchecked());
    let health = component(&mut world, "Health", Storage::Sparse);
    let e = world.spawn().unwrap();
    world.set(e, health, hp(40)).unwrap();

    let table = world.table(world.table_of(e).unwrap()).unwrap();
    assert!(table.archetype().contains(health));
    assert!(table.columns().is_empty());
    assert_eq!(world.get_value(e, health), Some(&hp(40)));

    let record = world.id_record(health).unwrap();
    assert_eq!(record.storage(), Storage::Sparse);
    assert!(record.sparse().unwrap().contains(e));
    assert!(!record.is_non_fragmenting());
}

#[test]
fn sparse_values_leave_with_the_id() {
    let mut world = World::with_config(WorldConfig::unchecked());
    let health = component(&mut world, "Health", Storage::Sparse);
    let a = world.spawn().unwrap();
    let b = world.spawn().unwrap();
    world.add(a, health).unwrap();
    world.add(b, health).unwrap();
    assert_eq!(world.get_value(a, health), Some(&hp(100)));

    world.remove(a, health).unwrap();
    assert!(world.get_value(a, health).is_none());
    world.destroy(b).unwrap();
    assert!(world.id_record(health).unwrap().sparse().unwrap().is_empty());
    assert_rows_dense(&world);
}

// =============================================================================
// Non-fragmenting
// =============================================================================

#[test]
fn non_fragmenting_ids_never_move_the_entity() {
    let mut world = World::with_config(WorldConfig::unchecked());
    let health = component(&mut world, "Health", Storage::DontFragment);
    let e = world.spawn().unwrap();
    let table = world.table_of(e);
    let counter = world.dirty_state(table.unwrap()).unwrap()[0];

    world.set(e, health, hp(7)).unwrap();
    assert_eq!(world.table_of(e), table);
    assert_eq!(world.dirty_state(table.unwrap()).unwrap()[0], counter);
    assert!(world.has(e, health));
    assert!(world.entity_ids(e).contains(&health));
    assert!(world.record(e).unwrap().flags.contains(RecordFlags::HAS_DONT_FRAGMENT));
    assert!(world.tables().all(|t| !t.archetype().contains(health)));

    world.remove(e, health).unwrap();
    assert!(!world.has(e, health));
    assert_eq!(world.table_of(e), table);
}

#[test]
fn non_fragmenting_wildcard_has() {
    let mut world = World::with_config(WorldConfig::unchecked());
    let owes = world.register_relationship(RelationshipSchema::new("Owes")).unwrap();
    world.mark_non_fragmenting(owes).unwrap();
    let bank = world.spawn().unwrap();
    let e = world.spawn().unwrap();
    world.add_pair(e, owes, bank).unwrap();

    assert!(world.has(e, Id::pair(owes, bank)));
    assert!(world.has(e, Id::pair(owes, archetable_foundation::builtin::WILDCARD)));
    assert_eq!(world.table_of(e), world.table_of(bank));
    assert!(world.id_record(Id::pair(owes, bank)).unwrap().is_non_fragmenting());
}

#[test]
fn mark_non_fragmenting_refuses_ids_in_tables() {
    let mut world = World::with_config(WorldConfig::unchecked());
    let health = component(&mut world, "Health", Storage::Table);
    let e = world.spawn().unwrap();
    world.add(e, health).unwrap();
    let err = world.mark_non_fragmenting(health.as_entity().unwrap()).unwrap_err();
    assert!(matches!(err.kind, ErrorKind::InvalidOperation(_)));

    let fresh = component(&mut world, "Mana", Storage::Table);
    world.mark_non_fragmenting(fresh.as_entity().unwrap()).unwrap();
    assert_eq!(
        world.component_schema(fresh.as_entity().unwrap()).unwrap().storage,
        Storage::DontFragment
    );
}

#[test]
fn clone_copies_sparse_values() {
    let mut world = World::with_config(WorldConfig::unchecked());
    let health = component(&mut world, "Health", Storage::DontFragment);
    let e = world.spawn().unwrap();
    world.set(e, health, hp(3)).unwrap();

    let copy = world.clone_entity(e, true).unwrap();
    assert_eq!(world.get_value(copy, health), Some(&hp(3)));
    let blank = world.clone_entity(e, false).unwrap();
    assert_eq!(world.get_value(blank, health), Some(&hp(100)));
    assert!(world.has(blank, health));
}

#[test]
fn destroy_clears_non_fragmenting_data() {
    let mut world = World::with_config(WorldConfig::unchecked());
    let health = component(&mut world, "Health", Storage::DontFragment);
    let e = world.spawn().unwrap();
    world.add(e, health).unwrap();
    world.destroy(e).unwrap();
    assert!(world.id_record(health).unwrap().sparse().unwrap().is_empty());

    let recycled = world.spawn().unwrap();
    assert_eq!(recycled.index(), e.index());
    assert!(!world.has(recycled, health));
}
