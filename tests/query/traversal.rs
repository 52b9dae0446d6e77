//! Integration tests for up, self-up and cascade traversal

use archetable_foundation::{EntityId, ErrorKind, Id, Value, builtin};
use archetable_query::{CacheKind, Query, QueryDesc, Term};

use crate::{Fixture, fixture, x_of};

/// `root(Position) <- child <- grandchild`, all tagged Frozen.
fn hierarchy(f: &mut Fixture) -> [EntityId; 3] {
    let root = f.at(10);
    let child = f.world.spawn().unwrap();
    let grandchild = f.world.spawn().unwrap();
    f.world.add_pair(child, builtin::CHILD_OF, root).unwrap();
    f.world.add_pair(grandchild, builtin::CHILD_OF, child).unwrap();
    for e in [root, child, grandchild] {
        f.world.add(e, Id::from(f.frozen)).unwrap();
    }
    [root, child, grandchild]
}

#[test]
fn up_reads_the_nearest_ancestor() {
    let mut f = fixture();
    let [root, child, grandchild] = hierarchy(&mut f);
    for kind in [CacheKind::None, CacheKind::Auto] {
        let mut query = Query::new(
            &mut f.world,
            QueryDesc::new()
                .term(Term::new(f.frozen))
                .term(Term::new(f.position).up(builtin::CHILD_OF).read())
                .cache(kind),
        )
        .unwrap();
        let mut seen = Vec::new();
        let mut it = query.iter(&mut f.world);
        while it.next() {
            for &e in it.entities() {
                seen.push((e, it.src(1), it.get(1, 0).map(x_of)));
            }
        }
        seen.sort();
        assert_eq!(
            seen,
            vec![(child, root, Some(10)), (grandchild, root, Some(10))],
            "{kind:?}"
        );
    }
}

#[test]
fn nearer_ancestor_shadows_farther_one() {
    let mut f = fixture();
    let [_, child, grandchild] = hierarchy(&mut f);
    f.world
        .set(child, Id::from(f.position), Value::record([("x", 5_i64)]))
        .unwrap();
    let mut query = Query::new(
        &mut f.world,
        QueryDesc::new()
            .term(Term::new(f.frozen))
            .term(Term::new(f.position).up(builtin::CHILD_OF).read()),
    )
    .unwrap();
    let mut it = query.iter(&mut f.world);
    it.set_this(grandchild).unwrap();
    assert!(it.next());
    assert_eq!(it.src(1), child);
    assert_eq!(it.get(1, 0).map(x_of), Some(5));
}

#[test]
fn self_up_prefers_the_entity() {
    let mut f = fixture();
    let [root, child, grandchild] = hierarchy(&mut f);
    let mut query = Query::new(
        &mut f.world,
        QueryDesc::new()
            .term(Term::new(f.frozen))
            .term(Term::new(f.position).self_up(builtin::CHILD_OF).read()),
    )
    .unwrap();
    let mut seen = Vec::new();
    let mut it = query.iter(&mut f.world);
    while it.next() {
        for &e in it.entities() {
            seen.push((e, it.src(1)));
        }
    }
    seen.sort();
    assert_eq!(
        seen,
        vec![(root, EntityId::NULL), (child, root), (grandchild, root)]
    );
}

#[test]
fn cascade_iterates_parents_first() {
    let mut f = fixture();
    let [root, child, grandchild] = hierarchy(&mut f);
    let other_root = f.at(20);
    f.world.add(other_root, Id::from(f.frozen)).unwrap();
    for kind in [CacheKind::None, CacheKind::Auto] {
        let mut query = Query::new(
            &mut f.world,
            QueryDesc::new()
                .term(Term::new(f.frozen))
                .term(Term::new(f.position).cascade(builtin::CHILD_OF).read())
                .cache(kind),
        )
        .unwrap();
        let order = crate::entities(&mut query, &mut f.world);
        let depth = |e: EntityId| [root, other_root, child, grandchild].iter().position(|x| *x == e);
        assert_eq!(order.len(), 4, "{kind:?}");
        let depths: Vec<usize> = order
            .iter()
            .map(|e| match depth(*e) {
                Some(0 | 1) => 0,
                Some(2) => 1,
                _ => 2,
            })
            .collect();
        assert!(depths.windows(2).all(|w| w[0] <= w[1]), "{kind:?}: {depths:?}");
    }
}

#[test]
fn up_matches_follow_reparenting() {
    let mut f = fixture();
    let [root, child, _] = hierarchy(&mut f);
    let orphan_parent = f.world.spawn().unwrap();
    let mut query = Query::new(
        &mut f.world,
        QueryDesc::new()
            .term(Term::new(f.frozen))
            .term(Term::new(f.position).up(builtin::CHILD_OF).read()),
    )
    .unwrap();
    assert!(query.matches(&mut f.world, child).unwrap());
    f.world.add_pair(child, builtin::CHILD_OF, orphan_parent).unwrap();
    assert_eq!(f.world.parent(child), Some(orphan_parent));
    assert!(!query.matches(&mut f.world, child).unwrap());
    assert!(query.matches(&mut f.world, root).is_ok_and(|m| !m));
}

#[test]
fn traversal_needs_a_traversable_relationship() {
    let mut f = fixture();
    let err = Query::new(
        &mut f.world,
        QueryDesc::new()
            .term(Term::new(f.frozen))
            .term(Term::new(f.position).up(f.likes)),
    )
    .unwrap_err();
    assert!(matches!(err.kind, ErrorKind::InvalidTerm { index: 1, .. }));
}
