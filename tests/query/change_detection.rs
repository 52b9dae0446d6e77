//! Integration tests for change detection
//!
//! Tests query-level and batch-level change reports, dirty propagation from
//! writing queries, topology changes, and fixed-source monitors.

use std::cmp::Ordering;

use archetable_foundation::{EntityId, ErrorKind, Id, Value};
use archetable_query::{CacheKind, InOut, Query, QueryDesc, Term};
use archetable_storage::{ComponentSchema, Storage, World};

use crate::{Fixture, fixture, x_of};

fn drain(query: &mut Query, world: &mut World) {
    let mut it = query.iter(world);
    while it.next() {}
}

fn reader(f: &mut Fixture) -> Query {
    Query::new(
        &mut f.world,
        QueryDesc::new()
            .term(Term::new(f.position).read())
            .detect_changes(),
    )
    .unwrap()
}

fn column_counter(world: &World, entity: EntityId, id: Id) -> i32 {
    let table = world.table_of(entity).unwrap();
    let column = world.column_index(table, id).unwrap();
    world.dirty_state(table).unwrap()[column as usize + 1]
}

#[test]
fn set_after_sync_reports_change() {
    let mut f = fixture();
    let entities: Vec<EntityId> = (1..=3).map(|x| f.at(x)).collect();
    let mut query = reader(&mut f);

    assert!(query.changed(&mut f.world).unwrap());
    assert!(query.changed(&mut f.world).unwrap());
    drain(&mut query, &mut f.world);
    assert!(!query.changed(&mut f.world).unwrap());

    f.world
        .set(entities[1], Id::from(f.position), Value::record([("x", 20_i64)]))
        .unwrap();
    assert!(query.changed(&mut f.world).unwrap());
    drain(&mut query, &mut f.world);
    assert!(!query.changed(&mut f.world).unwrap());
}

#[test]
fn writing_query_dirties_readers() {
    let mut f = fixture();
    let plain = f.at(1);
    let tagged = f.at(2);
    f.world.add(tagged, Id::from(f.frozen)).unwrap();
    let mut read = reader(&mut f);
    drain(&mut read, &mut f.world);
    assert!(!read.changed(&mut f.world).unwrap());

    let before = [
        column_counter(&f.world, plain, Id::from(f.position)),
        column_counter(&f.world, tagged, Id::from(f.position)),
    ];
    let mut write = Query::new(
        &mut f.world,
        QueryDesc::new().term(Term::new(f.position).inout(InOut::InOut)),
    )
    .unwrap();
    let mut it = write.iter(&mut f.world);
    while it.next() {
        for value in it.field_mut(0).unwrap() {
            value.set_field("y", 1_i64);
        }
    }
    drop(it);

    let after = [
        column_counter(&f.world, plain, Id::from(f.position)),
        column_counter(&f.world, tagged, Id::from(f.position)),
    ];
    assert_eq!(after, [before[0] + 1, before[1] + 1]);
    assert!(read.changed(&mut f.world).unwrap());
}

#[test]
fn readonly_iteration_marks_nothing() {
    let mut f = fixture();
    let e = f.at(1);
    let before = column_counter(&f.world, e, Id::from(f.position));
    let mut read = reader(&mut f);
    drain(&mut read, &mut f.world);
    drain(&mut read, &mut f.world);
    assert_eq!(column_counter(&f.world, e, Id::from(f.position)), before);
}

#[test]
fn query_does_not_see_its_own_writes() {
    let mut f = fixture();
    f.at(1);
    let mut query = Query::new(
        &mut f.world,
        QueryDesc::new()
            .term(Term::new(f.position))
            .detect_changes(),
    )
    .unwrap();
    assert!(query.changed(&mut f.world).unwrap());
    drain(&mut query, &mut f.world);
    assert!(!query.changed(&mut f.world).unwrap());
}

#[test]
fn topology_changes_are_reported() {
    let mut f = fixture();
    f.at(1);
    let mut query = reader(&mut f);
    drain(&mut query, &mut f.world);
    assert!(!query.changed(&mut f.world).unwrap());

    // New row in a matched table.
    f.at(2);
    assert!(query.changed(&mut f.world).unwrap());
    drain(&mut query, &mut f.world);

    // New matched table.
    let e = f.at(3);
    f.world.add(e, Id::from(f.frozen)).unwrap();
    assert!(query.changed(&mut f.world).unwrap());
    drain(&mut query, &mut f.world);
    assert!(!query.changed(&mut f.world).unwrap());
}

#[test]
fn unread_fields_are_not_watched() {
    let mut f = fixture();
    let e = f.at(1);
    f.world.add(e, Id::from(f.velocity)).unwrap();
    let mut query = Query::new(
        &mut f.world,
        QueryDesc::new()
            .term(Term::new(f.position).read())
            .term(Term::new(f.velocity).write()),
    )
    .unwrap();
    query.sync(&mut f.world);
    assert!(!query.changed(&mut f.world).unwrap());

    f.world
        .modify(e, Id::from(f.velocity), |v| {
            v.set_field("x", 3_i64);
        })
        .unwrap();
    assert!(!query.changed(&mut f.world).unwrap());

    f.world.modified(e, Id::from(f.position)).unwrap();
    assert!(query.changed(&mut f.world).unwrap());
}

#[test]
fn batch_changes_are_per_table() {
    let mut f = fixture();
    let plain = f.at(1);
    let tagged = f.at(2);
    f.world.add(tagged, Id::from(f.frozen)).unwrap();
    let mut query = reader(&mut f);
    drain(&mut query, &mut f.world);

    f.world
        .set(tagged, Id::from(f.position), Value::record([("x", 5_i64)]))
        .unwrap();
    let mut changed = Vec::new();
    let mut it = query.iter(&mut f.world);
    while it.next() {
        changed.push((it.entities()[0], it.changed()));
    }
    changed.sort();
    assert_eq!(changed, vec![(plain, false), (tagged, true)]);
}

#[test]
fn skipped_batches_stay_changed() {
    let mut f = fixture();
    f.at(1);
    let mut query = reader(&mut f);
    let mut it = query.iter(&mut f.world);
    while it.next() {
        assert!(it.changed());
        it.skip();
    }
    drop(it);

    let mut it = query.iter(&mut f.world);
    while it.next() {
        assert!(it.changed());
    }
    drop(it);

    let mut it = query.iter(&mut f.world);
    while it.next() {
        assert!(!it.changed());
    }
}

#[test]
fn fixed_sources_are_monitored() {
    let mut f = fixture();
    let wind = f.world.spawn().unwrap();
    f.world
        .set(wind, Id::from(f.velocity), Value::record([("x", 1_i64)]))
        .unwrap();
    f.at(1);
    let mut query = Query::new(
        &mut f.world,
        QueryDesc::new()
            .term(Term::new(f.position).read())
            .term(Term::new(f.velocity).src(wind).read()),
    )
    .unwrap();
    assert!(query.changed(&mut f.world).unwrap());
    drain(&mut query, &mut f.world);
    assert!(!query.changed(&mut f.world).unwrap());

    f.world
        .set(wind, Id::from(f.velocity), Value::record([("x", 2_i64)]))
        .unwrap();
    assert!(query.changed(&mut f.world).unwrap());
    query.sync(&mut f.world);
    assert!(!query.changed(&mut f.world).unwrap());
}

#[test]
fn change_detection_needs_a_cache() {
    let mut f = fixture();
    f.at(1);
    let mut query = Query::new(
        &mut f.world,
        QueryDesc::new()
            .term(Term::new(f.position))
            .cache(CacheKind::None),
    )
    .unwrap();
    let err = query.changed(&mut f.world).unwrap_err();
    assert!(matches!(err.kind, ErrorKind::IncompatibleCachePolicy(_)));

    let mut it = query.iter(&mut f.world);
    assert!(it.next());
    assert!(it.changed());
}

// =============================================================================
// Multi-Batch Matches
// =============================================================================

fn by_x(_: EntityId, a: &Value, _: EntityId, b: &Value) -> Ordering {
    x_of(a).cmp(&x_of(b))
}

/// `(xs, changed)` per batch.
fn batch_changes(query: &mut Query, world: &mut World) -> Vec<(Vec<i64>, bool)> {
    let mut out = Vec::new();
    let mut it = query.iter(world);
    while it.next() {
        let xs = (0..it.count())
            .map(|row| it.get(0, row).map(x_of).unwrap_or_default())
            .collect();
        out.push((xs, it.changed()));
    }
    out
}

#[test]
fn ordered_slices_share_their_table_change() {
    let mut f = fixture();
    f.at(1);
    let three = f.at(3);
    for x in [2, 4] {
        let e = f.at(x);
        f.world.add(e, Id::from(f.frozen)).unwrap();
    }
    let mut query = Query::new(
        &mut f.world,
        QueryDesc::new()
            .term(Term::new(f.position).read())
            .order_by(f.position, by_x)
            .detect_changes(),
    )
    .unwrap();
    drain(&mut query, &mut f.world);

    f.world
        .set(three, Id::from(f.position), Value::record([("x", 3_i64)]))
        .unwrap();
    assert_eq!(
        batch_changes(&mut query, &mut f.world),
        vec![
            (vec![1], true),
            (vec![2], false),
            (vec![3], true),
            (vec![4], false),
        ]
    );
    assert!(
        batch_changes(&mut query, &mut f.world)
            .iter()
            .all(|(_, changed)| !changed)
    );
}

#[test]
fn row_batches_of_one_table_share_its_change() {
    let mut f = fixture();
    let bleeding = f
        .world
        .register_component(ComponentSchema::tag("Bleeding").with_storage(Storage::DontFragment))
        .unwrap();
    let a = f.at(1);
    f.at(2);
    let c = f.at(3);
    f.world.add(a, Id::from(bleeding)).unwrap();
    f.world.add(c, Id::from(bleeding)).unwrap();
    let mut query = Query::new(
        &mut f.world,
        QueryDesc::new()
            .term(Term::new(f.position).read())
            .term(Term::new(bleeding)),
    )
    .unwrap();
    assert!(query.is_cached());

    let first = batch_changes(&mut query, &mut f.world);
    assert_eq!(first.len(), 2);
    assert!(first.iter().all(|(_, changed)| *changed));
    assert!(
        batch_changes(&mut query, &mut f.world)
            .iter()
            .all(|(_, changed)| !changed)
    );

    f.world.modified(c, Id::from(f.position)).unwrap();
    let mut after = batch_changes(&mut query, &mut f.world);
    after.sort();
    assert_eq!(after, vec![(vec![1], true), (vec![3], true)]);
}

#[test]
fn set_this_syncs_the_visited_match() {
    let mut f = fixture();
    f.at(1);
    let two = f.at(2);
    let mut query = Query::new(
        &mut f.world,
        QueryDesc::new()
            .term(Term::new(f.position).read())
            .order_by(f.position, by_x)
            .detect_changes(),
    )
    .unwrap();
    let mut it = query.iter(&mut f.world);
    it.set_this(two).unwrap();
    assert!(it.next());
    assert!(it.changed());
    assert!(!it.next());
    drop(it);
    assert!(!query.changed(&mut f.world).unwrap());
}

#[test]
fn dropping_an_iterator_marks_its_writes() {
    let mut f = fixture();
    let e = f.at(1);
    let mut read = reader(&mut f);
    drain(&mut read, &mut f.world);

    let mut write = Query::new(
        &mut f.world,
        QueryDesc::new().term(Term::new(f.position).inout(InOut::InOut)),
    )
    .unwrap();
    let mut it = write.iter(&mut f.world);
    assert!(it.next());
    it.set(0, 0, Value::record([("x", 9_i64)])).unwrap();
    drop(it);

    assert_eq!(f.world.get_value(e, Id::from(f.position)).map(x_of), Some(9));
    assert!(read.changed(&mut f.world).unwrap());
}

#[test]
fn sorting_a_table_is_a_change() {
    let mut f = fixture();
    f.at(2);
    let one = f.at(1);
    let mut query = reader(&mut f);
    drain(&mut query, &mut f.world);

    let table = f.world.table_of(one).unwrap();
    let column = f.world.column_index(table, Id::from(f.position)).unwrap();
    assert!(f.world.sort_table(table, column, by_x));
    assert!(query.changed(&mut f.world).unwrap());
    drain(&mut query, &mut f.world);
    assert!(!query.changed(&mut f.world).unwrap());
}
