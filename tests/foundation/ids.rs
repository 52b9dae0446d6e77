//! Integration tests for entity ids and pair ids

use archetable_foundation::{EntityId, Id, builtin};

fn e(index: u32) -> EntityId {
    EntityId::new(index, 0)
}

// =============================================================================
// Entity Ids
// =============================================================================

#[test]
fn generations_distinguish_handles() {
    let a = EntityId::new(20, 0);
    let b = a.next_generation();
    assert_ne!(a, b);
    assert_eq!(a.index(), b.index());
    assert_eq!(b.strip_generation(), a);
    assert!(EntityId::NULL.is_null());
}

// =============================================================================
// Pairs
// =============================================================================

#[test]
fn pair_elements_drop_generations() {
    let likes = EntityId::new(20, 3);
    let bob = EntityId::new(21, 7);
    let pair = Id::pair(likes, bob);
    assert!(pair.is_pair());
    assert_eq!(pair.first(), Some(e(20)));
    assert_eq!(pair.second(), Some(e(21)));
    assert_eq!(pair.as_entity(), None);
    assert_eq!(pair.type_entity(), e(20));
}

#[test]
fn plain_ids_are_entities() {
    let id = Id::from(e(30));
    assert!(!id.is_pair());
    assert_eq!(id.as_entity(), Some(e(30)));
    assert_eq!(id.first(), None);
}

#[test]
fn wildcard_matching() {
    let likes = e(20);
    let concrete = Id::pair(likes, e(21));
    assert!(Id::pair(likes, builtin::WILDCARD).matches(concrete));
    assert!(Id::pair(builtin::WILDCARD, e(21)).matches(concrete));
    assert!(Id::ALL_PAIRS.matches(concrete));
    assert!(Id::pair(likes, builtin::ANY).matches(concrete));
    assert!(!Id::pair(e(22), builtin::WILDCARD).matches(concrete));
    assert!(Id::WILDCARD.matches(Id::from(e(40))));
}

#[test]
fn wildcard_classification() {
    assert!(Id::pair(e(20), builtin::ANY).is_wildcard());
    assert!(Id::pair(e(20), builtin::ANY).has_any());
    assert!(!Id::pair(e(20), builtin::WILDCARD).has_any());
    assert!(!Id::pair(e(20), e(21)).is_wildcard());
}

#[test]
fn display() {
    assert_eq!(Id::from(e(20)).to_string(), "#20");
    assert_eq!(Id::pair(e(21), builtin::WILDCARD).to_string(), "(#21, *)");
    assert_eq!(Id::pair(e(21), builtin::ANY).to_string(), "(#21, _)");
}

#[test]
fn pairs_sort_after_plain_ids() {
    let mut ids = vec![Id::pair(e(20), e(21)), Id::from(e(50)), Id::from(e(30))];
    ids.sort();
    assert_eq!(ids[0], Id::from(e(30)));
    assert!(ids[2].is_pair());
}
