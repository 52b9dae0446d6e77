//! Integration tests for wildcard and `Any` pair matching

use archetable_foundation::{EntityId, Id, builtin};
use archetable_query::{CacheKind, Query, QueryDesc, Term};

use crate::{both, fixture};

fn targets(query: &mut Query, world: &mut archetable_storage::World) -> Vec<(EntityId, Id)> {
    let mut out = Vec::new();
    let mut it = query.iter(world);
    while it.next() {
        for &e in it.entities() {
            out.push((e, it.id(0)));
        }
    }
    out
}

#[test]
fn wildcard_yields_one_result_per_pair() {
    let mut f = fixture();
    let (a, b) = (f.world.spawn().unwrap(), f.world.spawn().unwrap());
    let e = f.world.spawn().unwrap();
    f.world.add_pair(e, f.likes, a).unwrap();
    f.world.add_pair(e, f.likes, b).unwrap();

    for kind in [CacheKind::None, CacheKind::Auto] {
        let mut query = Query::new(
            &mut f.world,
            QueryDesc::new()
                .term(Term::pair(f.likes, builtin::WILDCARD))
                .cache(kind),
        )
        .unwrap();
        assert_eq!(
            targets(&mut query, &mut f.world),
            vec![(e, Id::pair(f.likes, a)), (e, Id::pair(f.likes, b))],
            "{kind:?}"
        );
    }
}

#[test]
fn wildcard_order_depends_on_the_cache() {
    let mut f = fixture();
    let (a, b) = (f.world.spawn().unwrap(), f.world.spawn().unwrap());
    let e = f.world.spawn().unwrap();
    // (Likes, b) is registered first but sorts after (Likes, a).
    f.world.add_pair(e, f.likes, b).unwrap();
    f.world.add_pair(e, f.likes, a).unwrap();

    let expected = [
        (CacheKind::None, [b, a]),
        (CacheKind::Auto, [a, b]),
    ];
    for (kind, order) in expected {
        let mut query = Query::new(
            &mut f.world,
            QueryDesc::new()
                .term(Term::pair(f.likes, builtin::WILDCARD))
                .cache(kind),
        )
        .unwrap();
        assert_eq!(
            targets(&mut query, &mut f.world),
            vec![(e, Id::pair(f.likes, order[0])), (e, Id::pair(f.likes, order[1]))],
            "{kind:?}"
        );
    }
}

#[test]
fn wildcard_first_element_matches_any_relationship() {
    let mut f = fixture();
    let hates = f
        .world
        .register_relationship(archetable_storage::RelationshipSchema::new("Hates"))
        .unwrap();
    let target = f.world.spawn().unwrap();
    let (x, y, z) = (
        f.world.spawn().unwrap(),
        f.world.spawn().unwrap(),
        f.world.spawn().unwrap(),
    );
    f.world.add_pair(x, f.likes, target).unwrap();
    f.world.add_pair(y, hates, target).unwrap();
    f.world.add_pair(z, hates, x).unwrap();

    let desc = QueryDesc::new().term(Term::pair(builtin::WILDCARD, target));
    assert_eq!(both(&mut f.world, &desc), vec![x, y]);
}

#[test]
fn wildcard_combined_with_other_terms() {
    let mut f = fixture();
    let target = f.world.spawn().unwrap();
    let with_pos = f.at(1);
    let without_pos = f.world.spawn().unwrap();
    f.world.add_pair(with_pos, f.likes, target).unwrap();
    f.world.add_pair(without_pos, f.likes, target).unwrap();

    let desc = QueryDesc::new()
        .term(Term::new(f.position).read())
        .term(Term::pair(f.likes, builtin::WILDCARD));
    assert_eq!(both(&mut f.world, &desc), vec![with_pos]);

    let negated = QueryDesc::new()
        .term(Term::new(f.position).read())
        .term(Term::pair(f.likes, builtin::WILDCARD).not());
    let only_pos = f.at(2);
    assert_eq!(both(&mut f.world, &negated), vec![only_pos]);
}

#[test]
fn all_pairs_wildcard() {
    let mut f = fixture();
    let target = f.world.spawn().unwrap();
    let e = f.world.spawn().unwrap();
    f.world.add_pair(e, f.likes, target).unwrap();
    f.world.add_pair(e, builtin::CHILD_OF, target).unwrap();
    let mut query = Query::new(&mut f.world, QueryDesc::new().term(Term::new(Id::ALL_PAIRS))).unwrap();
    let found = targets(&mut query, &mut f.world);
    assert_eq!(found.len(), 2);
    assert!(found.iter().all(|(entity, id)| *entity == e && id.is_pair()));
}

#[test]
fn any_reports_a_concrete_id() {
    let mut f = fixture();
    let (a, b) = (f.world.spawn().unwrap(), f.world.spawn().unwrap());
    let e = f.world.spawn().unwrap();
    f.world.add_pair(e, f.likes, a).unwrap();
    f.world.add_pair(e, f.likes, b).unwrap();

    for kind in [CacheKind::None, CacheKind::Auto] {
        let mut query = Query::new(
            &mut f.world,
            QueryDesc::new().term(Term::pair(f.likes, builtin::ANY)).cache(kind),
        )
        .unwrap();
        assert_eq!(targets(&mut query, &mut f.world), vec![(e, Id::pair(f.likes, a))]);
    }
}

#[test]
fn wildcard_results_track_new_pairs() {
    let mut f = fixture();
    let e = f.world.spawn().unwrap();
    let mut query = Query::new(
        &mut f.world,
        QueryDesc::new().term(Term::pair(f.likes, builtin::WILDCARD)),
    )
    .unwrap();
    assert!(targets(&mut query, &mut f.world).is_empty());

    let a = f.world.spawn().unwrap();
    f.world.add_pair(e, f.likes, a).unwrap();
    assert_eq!(targets(&mut query, &mut f.world), vec![(e, Id::pair(f.likes, a))]);

    f.world.remove(e, Id::pair(f.likes, a)).unwrap();
    assert!(targets(&mut query, &mut f.world).is_empty());
}
