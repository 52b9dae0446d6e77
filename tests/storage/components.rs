//! Integration tests for component values
//!
//! Tests schema validation, reads and writes, write marking, and hooks.

use std::sync::atomic::{AtomicUsize, Ordering};

use archetable_foundation::{ErrorKind, Id, Type, Value};
use archetable_storage::{ComponentHooks, ComponentSchema, FieldSchema, World, WorldConfig};

use crate::{position_world, x_of};

fn pos(x: i64, y: i64) -> Value {
    Value::record([("x", x), ("y", y)])
}

// =============================================================================
// Registration
// =============================================================================

#[test]
fn registered_component_is_named_entity() {
    let (world, position) = position_world();
    let entity = position.as_entity().unwrap();
    assert_eq!(world.lookup("Position"), Some(entity));
    assert_eq!(world.component_schema(entity).unwrap().fields.len(), 2);
    assert!(world.id_traits(position).has_data);
}

#[test]
fn duplicate_component_name_is_rejected() {
    let (mut world, _) = position_world();
    let err = world
        .register_component(ComponentSchema::new("Position"))
        .unwrap_err();
    assert!(matches!(err.kind, ErrorKind::DuplicateName(_)));
}

// =============================================================================
// Set / Get
// =============================================================================

#[test]
fn set_adds_and_stores() {
    let (mut world, position) = position_world();
    let e = world.spawn().unwrap();
    world.set(e, position, pos(3, 4)).unwrap();
    assert!(world.has(e, position));
    assert_eq!(world.get(e, position).unwrap(), Some(&pos(3, 4)));
    assert_eq!(x_of(&world, e, position), Some(3));
}

#[test]
fn add_uses_field_defaults() {
    let (mut world, position) = position_world();
    let e = world.spawn().unwrap();
    world.add(e, position).unwrap();
    assert_eq!(world.get_value(e, position), Some(&pos(0, 0)));
}

#[test]
fn set_validates_against_schema() {
    let (mut world, position) = position_world();
    let e = world.spawn().unwrap();

    let wrong_type = Value::record([("x", Value::from("left"))]);
    assert!(matches!(
        world.set(e, position, wrong_type).unwrap_err().kind,
        ErrorKind::TypeMismatch { .. }
    ));
    let unknown_field = Value::record([("z", 1_i64)]);
    assert!(matches!(
        world.set(e, position, unknown_field).unwrap_err().kind,
        ErrorKind::FieldNotFound { .. }
    ));
    assert!(!world.has(e, position));
}

#[test]
fn required_fields_must_be_present() {
    let mut world = World::with_config(WorldConfig::unchecked());
    let name = Id::from(
        world
            .register_component(
                ComponentSchema::new("Name").with_field(FieldSchema::required("value", Type::String)),
            )
            .unwrap(),
    );
    let e = world.spawn().unwrap();
    assert!(matches!(
        world.set(e, name, Value::record(Vec::<(&str, Value)>::new())).unwrap_err().kind,
        ErrorKind::MissingField { .. }
    ));
    world.set(e, name, Value::record([("value", "bob")])).unwrap();
}

#[test]
fn tags_carry_no_value() {
    let mut world = World::with_config(WorldConfig::unchecked());
    let frozen = crate::tag(&mut world, "Frozen");
    let e = world.spawn().unwrap();
    world.add(e, frozen).unwrap();
    assert!(world.has(e, frozen));
    assert!(world.get_value(e, frozen).is_none());
    assert!(matches!(
        world.set(e, frozen, Value::Int(1)).unwrap_err().kind,
        ErrorKind::UnknownComponent(_)
    ));
}

#[test]
fn get_of_stale_entity_errors() {
    let (mut world, position) = position_world();
    let e = world.spawn().unwrap();
    world.destroy(e).unwrap();
    assert!(world.get(e, position).is_err());
    assert!(world.get_value(e, position).is_none());
}

// =============================================================================
// Write Marking
// =============================================================================

fn column_counter(world: &World, entity: archetable_foundation::EntityId, id: Id) -> i32 {
    let table = world.table_of(entity).unwrap();
    let column = world.column_index(table, id).unwrap();
    world.dirty_state(table).unwrap()[column as usize + 1]
}

#[test]
fn set_and_modify_mark_the_column() {
    let (mut world, position) = position_world();
    let e = world.spawn().unwrap();
    world.set(e, position, pos(1, 1)).unwrap();
    let after_set = column_counter(&world, e, position);

    world
        .modify(e, position, |v| {
            v.set_field("x", 9_i64);
        })
        .unwrap();
    assert_eq!(column_counter(&world, e, position), after_set + 1);
    assert_eq!(x_of(&world, e, position), Some(9));
}

#[test]
fn get_mut_does_not_mark_until_modified() {
    let (mut world, position) = position_world();
    let e = world.spawn().unwrap();
    world.set(e, position, pos(1, 1)).unwrap();
    let before = column_counter(&world, e, position);

    if let Some(value) = world.get_mut(e, position).unwrap() {
        value.set_field("y", 5_i64);
    }
    assert_eq!(column_counter(&world, e, position), before);

    world.modified(e, position).unwrap();
    assert_eq!(column_counter(&world, e, position), before + 1);
}

#[test]
fn value_writes_are_allowed_while_readonly() {
    let (mut world, position) = position_world();
    let e = world.spawn().unwrap();
    world.set(e, position, pos(1, 1)).unwrap();
    world.set_readonly(true);
    world.set(e, position, pos(2, 2)).unwrap();
    assert_eq!(x_of(&world, e, position), Some(2));
}

// =============================================================================
// Hooks
// =============================================================================

static REMOVED: AtomicUsize = AtomicUsize::new(0);

fn count_remove(_: archetable_foundation::EntityId, _: &Value) {
    REMOVED.fetch_add(1, Ordering::SeqCst);
}

fn start_at_ten() -> Value {
    Value::Int(10)
}

fn doubled(value: &Value) -> Value {
    Value::Int(value.as_int().unwrap_or_default() * 2)
}

#[test]
fn hooks_run_on_lifecycle() {
    let mut world = World::with_config(WorldConfig::unchecked());
    let counter = Id::from(
        world
            .register_component(ComponentSchema::new("Counter").with_hooks(ComponentHooks {
                ctor: Some(start_at_ten),
                on_copy: Some(doubled),
                on_remove: Some(count_remove),
                ..ComponentHooks::default()
            }))
            .unwrap(),
    );
    let e = world.spawn().unwrap();
    world.add(e, counter).unwrap();
    assert_eq!(world.get_value(e, counter), Some(&Value::Int(10)));

    let copy = world.clone_entity(e, true).unwrap();
    assert_eq!(world.get_value(copy, counter), Some(&Value::Int(20)));
    let blank = world.clone_entity(e, false).unwrap();
    assert_eq!(world.get_value(blank, counter), Some(&Value::Int(10)));

    let before = REMOVED.load(Ordering::SeqCst);
    world.remove(e, counter).unwrap();
    world.destroy(copy).unwrap();
    assert_eq!(REMOVED.load(Ordering::SeqCst), before + 2);
}
