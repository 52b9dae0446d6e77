//! Integration tests for component values and field types

use archetable_foundation::{EntityId, Type, Value};

// =============================================================================
// Records
// =============================================================================

#[test]
fn record_fields() {
    let position = Value::record([("x", 1), ("y", 2)]);
    assert_eq!(position.field("x").and_then(Value::as_int), Some(1));
    assert_eq!(position.field("y").and_then(Value::as_int), Some(2));
    assert!(position.field("z").is_none());
    assert_eq!(Type::of(&position), Type::Record);
}

#[test]
fn with_field_leaves_original_untouched() {
    let a = Value::record([("x", 1)]);
    let b = a.with_field("x", 5);
    assert_eq!(a.field("x").and_then(Value::as_int), Some(1));
    assert_eq!(b.field("x").and_then(Value::as_int), Some(5));
}

#[test]
fn record_display_orders_fields_by_name() {
    let v = Value::record([("y", Value::from("up")), ("x", Value::Int(1))]);
    assert_eq!(v.to_string(), r#"{x: 1, y: "up"}"#);
}

// =============================================================================
// Conversions
// =============================================================================

#[test]
fn conversions() {
    assert_eq!(Value::from(3i32), Value::Int(3));
    assert_eq!(Value::from(true).as_bool(), Some(true));
    assert_eq!(Value::from("hi").as_str(), Some("hi"));
    let e = EntityId::new(20, 1);
    assert_eq!(Value::from(e).as_entity(), Some(e));
    assert_eq!(Value::Int(2).as_float(), Some(2.0));
    assert!(Value::Nil.as_float().is_none());
}

// =============================================================================
// Field Types
// =============================================================================

#[test]
fn field_type_checks() {
    assert!(Type::Float.check(&Value::Int(1)));
    assert!(!Type::Int.check(&Value::Float(1.0)));
    assert!(Type::optional(Type::Int).check(&Value::Nil));
    assert!(!Type::Int.check(&Value::Nil));
    assert!(Type::Any.check(&Value::from("text")));

    let targets = Value::List(
        [EntityId::new(20, 0), EntityId::new(21, 0)]
            .into_iter()
            .map(Value::from)
            .collect(),
    );
    assert!(Type::list(Type::Entity).check(&targets));
    assert!(!Type::list(Type::Int).check(&targets));
}
