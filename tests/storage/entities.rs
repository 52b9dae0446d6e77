//! Integration tests for the entity index
//!
//! Tests spawning, destruction, generations, and stale handle detection.

use archetable_foundation::{EntityId, ErrorKind, builtin};
use archetable_storage::{World, WorldConfig};

use crate::assert_rows_dense;

// =============================================================================
// Spawning
// =============================================================================

#[test]
fn builtins_exist_at_creation() {
    let world = World::new();
    assert!(world.exists(builtin::WILDCARD));
    assert!(world.exists(builtin::ANY));
    assert!(world.exists(builtin::CHILD_OF));
    assert_eq!(world.lookup("ChildOf"), Some(builtin::CHILD_OF));
    assert!(world.relationship_schema(builtin::CHILD_OF).is_some_and(|s| s.traversable));
}

#[test]
fn spawned_entities_are_distinct_and_in_root() {
    let mut world = World::with_config(WorldConfig::unchecked());
    let before = world.entity_count();
    let a = world.spawn().unwrap();
    let b = world.spawn().unwrap();
    assert_ne!(a, b);
    assert!(a.index() >= builtin::FIRST_USER_INDEX);
    assert_eq!(world.entity_count(), before + 2);
    assert_eq!(world.table_of(a), world.table_of(b));
    assert_rows_dense(&world);
}

#[test]
fn named_entities() {
    let mut world = World::with_config(WorldConfig::unchecked());
    let hero = world.spawn_named("hero").unwrap();
    assert_eq!(world.lookup("hero"), Some(hero));
    assert_eq!(world.name(hero), Some("hero"));
    let err = world.spawn_named("hero").unwrap_err();
    assert!(matches!(err.kind, ErrorKind::DuplicateName(_)));
}

// =============================================================================
// Destruction and Generations
// =============================================================================

#[test]
fn destroyed_handles_go_stale() {
    let mut world = World::with_config(WorldConfig::unchecked());
    let a = world.spawn().unwrap();
    world.destroy(a).unwrap();
    assert!(!world.exists(a));
    assert!(world.record(a).is_none());

    let b = world.spawn().unwrap();
    assert_eq!(b.index(), a.index());
    assert_ne!(b.generation(), a.generation());
    assert!(!world.exists(a));
    assert_eq!(world.get_alive(a), b);
    assert!(matches!(
        world.validate(a).unwrap_err().kind,
        ErrorKind::StaleEntity(_)
    ));
    assert_rows_dense(&world);
}

#[test]
fn unknown_ids_resolve_to_null() {
    let world = World::new();
    let ghost = EntityId::new(5_000, 0);
    assert!(!world.exists(ghost));
    assert!(world.get_alive(ghost).is_null());
    assert!(world.record(ghost).is_none());
}

#[test]
fn make_alive_places_specific_id() {
    let mut world = World::with_config(WorldConfig::unchecked());
    let chosen = EntityId::new(900, 0);
    world.make_alive(chosen).unwrap();
    assert!(world.exists(chosen));
    assert!(world.table_of(chosen).is_some());
    assert_rows_dense(&world);
}

#[test]
fn rejected_bulk_creation_leaves_no_entities() {
    let mut world = World::with_config(WorldConfig::unchecked());
    let taken = world.spawn().unwrap();
    let fresh = EntityId::new(5000, 0);
    let clash = EntityId::new(taken.index(), taken.generation() + 1);

    let err = world.bulk_new_with_ids(&[fresh, clash], &[]).unwrap_err();
    assert!(matches!(err.kind, ErrorKind::StaleEntity(_)));
    assert!(!world.exists(fresh));
    assert!(world.table_of(fresh).is_none());
    assert!(world.exists(taken));

    let twice = EntityId::new(5001, 0);
    let err = world
        .bulk_new_with_ids(&[twice, EntityId::new(5001, 1)], &[])
        .unwrap_err();
    assert!(matches!(err.kind, ErrorKind::StaleEntity(_)));
    assert!(!world.exists(twice));

    world.bulk_new_with_ids(&[fresh], &[]).unwrap();
    assert!(world.table_of(fresh).is_some());
    assert_rows_dense(&world);
}

#[test]
fn high_entity_ids_can_be_claimed() {
    let mut world = World::with_config(WorldConfig::unchecked());
    let high = EntityId::new(u32::MAX - 1, 0);
    world.make_alive(high).unwrap();
    assert!(world.exists(high));
    assert!(world.table_of(high).is_some());

    let next = world.spawn().unwrap();
    assert!(next.index() < high.index());
    world.destroy(high).unwrap();
    assert!(!world.exists(high));
    assert_rows_dense(&world);
}

#[test]
fn readonly_world_refuses_mutation() {
    let mut world = World::with_config(WorldConfig::unchecked());
    let a = world.spawn().unwrap();
    world.set_readonly(true);
    assert!(matches!(world.spawn().unwrap_err().kind, ErrorKind::Readonly));
    assert!(matches!(world.destroy(a).unwrap_err().kind, ErrorKind::Readonly));
    world.set_readonly(false);
    assert!(world.destroy(a).is_ok());
}
