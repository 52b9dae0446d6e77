//! Integration tests for relationships
//!
//! Tests pairs, exclusive relationships, cleanup policies on delete, and
//! hierarchy helpers.

use archetable_foundation::{ErrorKind, Id, Value, builtin};
use archetable_storage::{
    Cardinality, ComponentSchema, OnDelete, OnViolation, RecordFlags, RelationshipSchema, World,
    WorldConfig,
};

use crate::assert_rows_dense;

fn world() -> World {
    World::with_config(WorldConfig::unchecked())
}

// =============================================================================
// Pairs
// =============================================================================

#[test]
fn pairs_are_ids_in_the_table_type() {
    let mut world = world();
    let likes = world.register_relationship(RelationshipSchema::new("Likes")).unwrap();
    let (alice, bob, carol) = (
        world.spawn().unwrap(),
        world.spawn().unwrap(),
        world.spawn().unwrap(),
    );
    world.add_pair(alice, likes, bob).unwrap();
    world.add_pair(alice, likes, carol).unwrap();

    assert!(world.has(alice, Id::pair(likes, bob)));
    assert!(world.has(alice, Id::pair(likes, builtin::WILDCARD)));
    assert!(world.has(alice, Id::pair(builtin::WILDCARD, carol)));
    assert!(!world.has(bob, Id::pair(likes, builtin::WILDCARD)));
    assert_eq!(world.target(alice, likes, 0), Some(bob));
    assert_eq!(world.target(alice, likes, 1), Some(carol));
    assert_eq!(world.target(alice, likes, 2), None);
    assert!(world.record(bob).unwrap().flags.contains(RecordFlags::IS_TARGET));
    assert!(!world.record(bob).unwrap().flags.contains(RecordFlags::IS_TRAVERSABLE));
}

#[test]
fn wildcard_remove_strips_every_match() {
    let mut world = world();
    let likes = world.register_relationship(RelationshipSchema::new("Likes")).unwrap();
    let e = world.spawn().unwrap();
    for _ in 0..3 {
        let target = world.spawn().unwrap();
        world.add_pair(e, likes, target).unwrap();
    }
    world.remove(e, Id::pair(likes, builtin::WILDCARD)).unwrap();
    assert!(!world.has(e, Id::pair(likes, builtin::WILDCARD)));
    assert_eq!(world.table_of(e), world.table_of(likes));
}

#[test]
fn wildcard_add_is_rejected() {
    let mut world = world();
    let likes = world.register_relationship(RelationshipSchema::new("Likes")).unwrap();
    let e = world.spawn().unwrap();
    assert!(world.add(e, Id::pair(likes, builtin::WILDCARD)).is_err());
}

#[test]
fn pairs_carry_relationship_data() {
    let mut world = world();
    let owes = world.register_component(ComponentSchema::new("Owes")).unwrap();
    world.set_relationship(owes, RelationshipSchema::new("Owes")).unwrap();
    let (alice, bob) = (world.spawn().unwrap(), world.spawn().unwrap());
    world.set_pair(alice, owes, bob, Value::Int(20)).unwrap();
    assert_eq!(world.get_value(alice, Id::pair(owes, bob)), Some(&Value::Int(20)));
}

// =============================================================================
// Exclusive Relationships
// =============================================================================

#[test]
fn exclusive_add_replaces_target() {
    let mut world = world();
    let in_room = world
        .register_relationship(
            RelationshipSchema::new("InRoom").with_cardinality(Cardinality::ManyToOne),
        )
        .unwrap();
    let (hall, kitchen, e) = (
        world.spawn().unwrap(),
        world.spawn().unwrap(),
        world.spawn().unwrap(),
    );
    world.add_pair(e, in_room, hall).unwrap();
    world.add_pair(e, in_room, kitchen).unwrap();
    assert!(!world.has(e, Id::pair(in_room, hall)));
    assert!(world.has(e, Id::pair(in_room, kitchen)));
    assert_eq!(world.target(e, in_room, 0), Some(kitchen));
    assert_eq!(world.target(e, in_room, 1), None);
    assert_rows_dense(&world);
}

#[test]
fn exclusive_violation_can_be_an_error() {
    let mut world = world();
    let spouse = world
        .register_relationship(
            RelationshipSchema::new("Spouse")
                .with_cardinality(Cardinality::ManyToOne)
                .with_on_violation(OnViolation::Error),
        )
        .unwrap();
    let (a, b, c) = (
        world.spawn().unwrap(),
        world.spawn().unwrap(),
        world.spawn().unwrap(),
    );
    world.add_pair(a, spouse, b).unwrap();
    let err = world.add_pair(a, spouse, c).unwrap_err();
    assert!(matches!(err.kind, ErrorKind::InvalidOperation(_)));
    assert!(world.has(a, Id::pair(spouse, b)));
}

#[test]
fn bulk_new_refuses_two_exclusive_targets() {
    let mut world = world();
    let (a, b) = (world.spawn().unwrap(), world.spawn().unwrap());
    let ids = [
        Id::pair(builtin::CHILD_OF, a),
        Id::pair(builtin::CHILD_OF, b),
    ];
    assert!(world.bulk_new(&ids, 2).is_err());
}

// =============================================================================
// Cleanup Policies
// =============================================================================

#[test]
fn deleting_target_removes_pairs_by_default() {
    let mut world = world();
    let likes = world.register_relationship(RelationshipSchema::new("Likes")).unwrap();
    let (fan, idol) = (world.spawn().unwrap(), world.spawn().unwrap());
    world.add_pair(fan, likes, idol).unwrap();
    world.destroy(idol).unwrap();
    assert!(world.exists(fan));
    assert!(!world.has(fan, Id::pair(likes, builtin::WILDCARD)));

    let recycled = world.spawn().unwrap();
    assert_eq!(recycled.index(), idol.index());
    assert!(!world.has(fan, Id::pair(likes, recycled)));
    assert_rows_dense(&world);
}

#[test]
fn child_of_cascades() {
    let mut world = world();
    let root = world.spawn().unwrap();
    let child = world.spawn().unwrap();
    let grandchild = world.spawn().unwrap();
    world.add_pair(child, builtin::CHILD_OF, root).unwrap();
    world.add_pair(grandchild, builtin::CHILD_OF, child).unwrap();
    assert_eq!(world.parent(grandchild), Some(child));
    assert!(world.record(root).unwrap().flags.contains(RecordFlags::IS_TRAVERSABLE));

    world.destroy(root).unwrap();
    assert!(!world.exists(child));
    assert!(!world.exists(grandchild));
    assert_rows_dense(&world);
}

#[test]
fn error_policy_blocks_deletion() {
    let mut world = world();
    let owned_by = world
        .register_relationship(RelationshipSchema::new("OwnedBy").with_on_delete(OnDelete::Error))
        .unwrap();
    let (item, owner) = (world.spawn().unwrap(), world.spawn().unwrap());
    world.add_pair(item, owned_by, owner).unwrap();

    let err = world.destroy(owner).unwrap_err();
    assert!(matches!(err.kind, ErrorKind::DeleteConstraint { .. }));
    assert!(world.exists(owner));

    world.remove(item, Id::pair(owned_by, owner)).unwrap();
    world.destroy(owner).unwrap();
}

#[test]
fn deleting_a_component_strips_it_from_users() {
    let mut world = world();
    let frozen = world.register_component(ComponentSchema::tag("Frozen")).unwrap();
    let e = world.spawn().unwrap();
    world.add(e, Id::from(frozen)).unwrap();
    world.destroy(frozen).unwrap();
    assert!(world.exists(e));
    assert!(world.entity_ids(e).is_empty());
    assert_eq!(world.lookup("Frozen"), None);
}

// =============================================================================
// Hierarchy
// =============================================================================

#[test]
fn depth_counts_hops_to_root() {
    let mut world = world();
    let mut chain = vec![world.spawn().unwrap()];
    for _ in 0..3 {
        let child = world.spawn().unwrap();
        world
            .add_pair(child, builtin::CHILD_OF, *chain.last().unwrap())
            .unwrap();
        chain.push(child);
    }
    for (expected, e) in chain.iter().enumerate() {
        let table = world.table_of(*e).unwrap();
        assert_eq!(world.depth(table, builtin::CHILD_OF), expected);
    }
}

#[test]
fn depth_is_bounded() {
    let mut world = World::with_config(WorldConfig::unchecked().with_max_traversal_depth(2));
    let mut last = world.spawn().unwrap();
    for _ in 0..5 {
        let child = world.spawn().unwrap();
        world.add_pair(child, builtin::CHILD_OF, last).unwrap();
        last = child;
    }
    let table = world.table_of(last).unwrap();
    assert_eq!(world.depth(table, builtin::CHILD_OF), 2);
}
