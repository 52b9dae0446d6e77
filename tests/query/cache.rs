//! Integration tests for the query cache
//!
//! Tests cache maintenance across table creation and deletion, grouping,
//! group filters, and ordering.

use std::cmp::Ordering;

use archetable_foundation::{EntityId, Id, Value, builtin};
use archetable_query::{CacheKind, Query, QueryDesc, Term};
use archetable_storage::{TableId, World};

use crate::{entities, fixture, sorted, x_of};

// =============================================================================
// Maintenance
// =============================================================================

#[test]
fn cache_follows_table_lifecycle() {
    let mut f = fixture();
    let mut query = Query::new(&mut f.world, QueryDesc::new().term(Term::new(f.position))).unwrap();
    assert!(query.is_cached());
    assert_eq!(query.cache().unwrap().len(), 0);

    let a = f.at(1);
    let b = f.at(2);
    f.world.add(b, Id::from(f.frozen)).unwrap();
    assert_eq!(sorted(&mut query, &mut f.world), vec![a, b]);
    assert_eq!(query.cache().unwrap().len(), 2);

    f.world.destroy(b).unwrap();
    assert_eq!(f.world.prune_empty_tables(), 1);
    assert_eq!(sorted(&mut query, &mut f.world), vec![a]);
    assert_eq!(query.cache().unwrap().len(), 1);
}

#[test]
fn uncacheable_terms_are_evaluated_per_iteration() {
    let mut f = fixture();
    let target = f.world.spawn().unwrap();
    let a = f.at(1);
    f.world.add_pair(a, f.likes, target).unwrap();
    let mut query = Query::new(
        &mut f.world,
        QueryDesc::new()
            .term(Term::new(f.position).read())
            .term(Term::pair_var(f.likes, "who")),
    )
    .unwrap();
    assert!(query.is_cached());
    assert!(query.plan().contains("cache:"));
    let mut it = query.iter(&mut f.world);
    assert!(it.next());
    assert_eq!(it.var("who"), Some(target));
}

#[test]
fn query_survives_deleted_tables_between_iterations() {
    let mut f = fixture();
    let mut query = Query::new(
        &mut f.world,
        QueryDesc::new().term(Term::new(f.position)).cache(CacheKind::All),
    )
    .unwrap();
    for round in 0..3 {
        let e = f.at(round);
        f.world.add(e, Id::from(f.frozen)).unwrap();
        assert_eq!(entities(&mut query, &mut f.world), vec![e]);
        f.world.destroy(e).unwrap();
        f.world.prune_empty_tables();
        assert!(entities(&mut query, &mut f.world).is_empty());
    }
}

// =============================================================================
// Grouping
// =============================================================================

/// Entities placed under `(Likes, target)` for each target.
fn grouped(f: &mut crate::Fixture, targets: &[EntityId]) -> Vec<EntityId> {
    let mut members = Vec::new();
    for &target in targets {
        let e = f.at(0);
        f.world.add_pair(e, f.likes, target).unwrap();
        members.push(e);
    }
    members
}

#[test]
fn group_by_target_iterates_groups_in_order() {
    let mut f = fixture();
    let (t1, t2) = (f.world.spawn().unwrap(), f.world.spawn().unwrap());
    // Created out of group order.
    let members = grouped(&mut f, &[t2, t1]);
    let mut query = Query::new(
        &mut f.world,
        QueryDesc::new()
            .term(Term::new(f.position).read())
            .group_by(f.likes),
    )
    .unwrap();
    assert_eq!(entities(&mut query, &mut f.world), vec![members[1], members[0]]);
    let groups: Vec<u64> = query.cache().unwrap().groups().collect();
    // Group 0 holds the emptied Position-only table.
    assert_eq!(groups, vec![0, u64::from(t1.index()), u64::from(t2.index())]);
}

#[test]
fn set_group_filters_results() {
    let mut f = fixture();
    let (t1, t2) = (f.world.spawn().unwrap(), f.world.spawn().unwrap());
    let members = grouped(&mut f, &[t1, t2, t2]);
    let mut query = Query::new(
        &mut f.world,
        QueryDesc::new()
            .term(Term::new(f.position).read())
            .group_by(f.likes),
    )
    .unwrap();
    let mut it = query.iter(&mut f.world);
    it.set_group(u64::from(t2.index())).unwrap();
    let mut found = Vec::new();
    while it.next() {
        found.extend_from_slice(it.entities());
    }
    assert_eq!(found, vec![members[1], members[2]]);
    drop(it);

    let mut it = query.iter(&mut f.world);
    it.set_group(999).unwrap();
    assert!(!it.next());
}

fn parity(world: &World, table: TableId, _: EntityId) -> u64 {
    let ids = world.table(table).map(|t| t.archetype().len()).unwrap_or_default();
    (ids % 2) as u64
}

#[test]
fn group_by_callback() {
    let mut f = fixture();
    let plain = f.at(1);
    let tagged = f.at(2);
    f.world.add(tagged, Id::from(f.frozen)).unwrap();
    let mut query = Query::new(
        &mut f.world,
        QueryDesc::new()
            .term(Term::new(f.position).read())
            .group_by_fn(builtin::CHILD_OF, parity),
    )
    .unwrap();
    assert_eq!(entities(&mut query, &mut f.world), vec![tagged, plain]);
}

#[test]
fn set_group_needs_a_cache() {
    let mut f = fixture();
    f.at(1);
    let mut query = Query::new(
        &mut f.world,
        QueryDesc::new().term(Term::new(f.position)).cache(CacheKind::None),
    )
    .unwrap();
    let mut it = query.iter(&mut f.world);
    assert!(it.set_group(0).is_err());
}

// =============================================================================
// Ordering
// =============================================================================

fn by_x(_: EntityId, a: &Value, _: EntityId, b: &Value) -> Ordering {
    x_of(a).cmp(&x_of(b))
}

#[test]
fn order_by_merges_tables() {
    let mut f = fixture();
    for x in [5, 1, 4] {
        f.at(x);
    }
    for x in [3, 2, 6] {
        let e = f.at(x);
        f.world.add(e, Id::from(f.frozen)).unwrap();
    }
    let mut query = Query::new(
        &mut f.world,
        QueryDesc::new()
            .term(Term::new(f.position).read())
            .order_by(f.position, by_x),
    )
    .unwrap();

    let collect = |query: &mut Query, world: &mut World| {
        let mut xs = Vec::new();
        let mut it = query.iter(world);
        while it.next() {
            for row in 0..it.count() {
                xs.push(it.get(0, row).map(x_of).unwrap_or_default());
            }
        }
        xs
    };
    assert_eq!(collect(&mut query, &mut f.world), vec![1, 2, 3, 4, 5, 6]);

    let last = f.at(0);
    assert_eq!(collect(&mut query, &mut f.world), vec![0, 1, 2, 3, 4, 5, 6]);
    f.world
        .set(last, Id::from(f.position), Value::record([("x", 9_i64)]))
        .unwrap();
    assert_eq!(collect(&mut query, &mut f.world), vec![1, 2, 3, 4, 5, 6, 9]);
}

#[test]
fn order_by_must_name_a_cached_term() {
    let mut f = fixture();
    let desc = QueryDesc::new()
        .term(Term::new(f.position))
        .order_by(f.velocity, by_x);
    assert!(Query::new(&mut f.world, desc).is_err());
}
