//! Parameter extraction: `in` flattening, update operations, typed contexts
//! and custom types.

mod fixtures;

use fixtures::{posts, Env, LABEL_ID};
use sieve::prelude::*;

#[test]
fn test_literal_list_with_pins() {
    let env = Env::new();
    let query = posts().filter(field(0, "id").in_(list(vec![lit(1), pin("2"), pin(3)])));

    let plan = env.plan(&query).unwrap();
    assert_eq!(
        plan.query.wheres[0].expr,
        field(0, "id").in_(list(vec![lit(1), Expr::Param(0), Expr::Param(1)]))
    );
    assert_eq!(plan.values(), vec![Value::Int(2), Value::Int(3)]);
    assert!(plan.cache_key.is_cacheable());
}

#[test]
fn test_pinned_collection_becomes_range() {
    let env = Env::new();
    let query = posts()
        .filter(field(0, "title").eq(pin("a")))
        .filter(field(0, "id").in_(pin(vec!["4", "5"])));

    let plan = env.plan(&query).unwrap();
    assert_eq!(
        plan.query.wheres[1].expr,
        field(0, "id").in_(Expr::ParamRange { start: 1, len: 2 })
    );
    assert_eq!(
        plan.values(),
        vec![Value::from("a"), Value::Int(4), Value::Int(5)]
    );
    assert_eq!(plan.cache_key, CacheKey::Uncacheable);
}

#[test]
fn test_empty_pinned_collection() {
    let env = Env::new();
    let query = posts()
        .filter(field(0, "id").in_(pin(Value::List(vec![]))))
        .filter(field(0, "votes").gt(pin(1)));

    let plan = env.plan(&query).unwrap();
    assert_eq!(
        plan.query.wheres[0].expr,
        field(0, "id").in_(Expr::ParamRange { start: 0, len: 0 })
    );
    assert_eq!(plan.query.wheres[1].expr, field(0, "votes").gt(Expr::Param(0)));
    assert_eq!(plan.values(), vec![Value::Int(1)]);
}

#[test]
fn test_pinned_collection_element_cast_failure() {
    let env = Env::new();
    let err = env
        .plan(&posts().filter(field(0, "votes").in_(pin(vec!["1", "two"]))))
        .unwrap_err();
    assert!(err.is_cast());
    match err {
        PlanError::Cast { value, ty, .. } => {
            assert_eq!(value, "\"two\"");
            assert_eq!(ty, "integer");
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[test]
fn test_pin_in_array_field() {
    let env = Env::new();
    let plan = env
        .plan(&posts().filter(pin("rust").in_(field(0, "tags"))))
        .unwrap();
    assert_eq!(plan.params[0].ty, FieldType::String);

    let err = env
        .plan(&posts().filter(pin(1).in_(field(0, "tags"))))
        .unwrap_err();
    assert!(err.is_cast());
}

#[test]
fn test_pinned_array_compared_to_array_field() {
    let env = Env::new();
    let plan = env
        .plan(&posts().filter(field(0, "tags").eq(pin(vec!["a", "b"]))))
        .unwrap();
    assert_eq!(plan.values(), vec![Value::from(vec!["a", "b"])]);
    assert_eq!(plan.params[0].ty, FieldType::array(FieldType::String));
}

#[test]
fn test_typed_annotation() {
    let env = Env::new();
    let plan = env
        .plan(&posts().select(pin("5").typed(FieldType::Integer)))
        .unwrap();
    assert_eq!(plan.values(), vec![Value::Int(5)]);
    assert_eq!(plan.params[0].clause, Clause::Select);
}

#[test]
fn test_nil_pin_in_comparison_is_cast_error() {
    let env = Env::new();
    let err = env
        .plan(&posts().filter(field(0, "title").eq(pin(Value::Null))))
        .unwrap_err();
    assert!(err.is_cast());
    assert!(err.to_string().contains("`nil`"));
}

#[test]
fn test_update_operations() {
    let env = Env::new();
    let query = posts()
        .filter(field(0, "public").eq(pin("true")))
        .update(UpdateOp::Set, vec![("title", pin("new"))])
        .update(UpdateOp::Inc, vec![("votes", pin("2"))])
        .update(UpdateOp::Push, vec![("tags", pin("rust"))]);

    let plan = env.plan_for(&query, Operation::UpdateAll).unwrap();

    // Updates are visited before filters for bulk writes.
    assert_eq!(
        plan.values(),
        vec![
            Value::from("new"),
            Value::Int(2),
            Value::from("rust"),
            Value::Bool(true),
        ]
    );
    let types: Vec<&FieldType> = plan.params.iter().map(|p| &p.ty).collect();
    assert_eq!(
        types,
        vec![
            &FieldType::String,
            &FieldType::Integer,
            &FieldType::String,
            &FieldType::Boolean,
        ]
    );
    assert_eq!(plan.params[0].clause, Clause::Update);
    assert_eq!(plan.params[3].clause, Clause::Where);
}

#[test]
fn test_update_cast_failure() {
    let env = Env::new();
    let query = posts().update(UpdateOp::Inc, vec![("votes", pin("many"))]);
    let err = env.plan_for(&query, Operation::UpdateAll).unwrap_err();
    assert!(err.is_cast());
    assert_eq!(err.clause(), Clause::Update);
}

#[test]
fn test_binary_id_is_dumped() {
    let env = Env::new();
    let query = QueryExpr::from_schema("labels", "Label").filter(field(0, "id").eq(pin(LABEL_ID)));

    let plan = env.plan(&query).unwrap();
    match &plan.values()[0] {
        Value::Binary(bytes) => assert_eq!(bytes.len(), 16),
        other => panic!("expected dumped binary, got {:?}", other),
    }
    assert_eq!(plan.params[0].ty, FieldType::custom("binary_id"));

    let err = env
        .plan(&QueryExpr::from_schema("labels", "Label").filter(field(0, "id").eq(pin("nope"))))
        .unwrap_err();
    assert!(err.is_cast());
}

#[test]
fn test_pins_in_fragment_are_untyped() {
    let env = Env::new();
    let plan = env
        .plan(&posts().filter(fragment("lower(?) = ?", vec![field(0, "title"), pin(1)])))
        .unwrap();
    assert_eq!(plan.values(), vec![Value::Int(1)]);
    assert_eq!(plan.params[0].ty, FieldType::Any);
}

#[test]
fn test_pins_in_join_condition() {
    let env = Env::new();
    let query = posts()
        .inner_join(
            Source::schema("comments", "Comment"),
            field(1, "post_id").eq(field(0, "id")).and(field(1, "body").like(pin("%rust%"))),
        )
        .filter(field(0, "votes").gte(pin(10)));

    let plan = env.plan(&query).unwrap();
    assert_eq!(plan.values(), vec![Value::from("%rust%"), Value::Int(10)]);
    assert_eq!(plan.params[0].clause, Clause::Join);
}

#[test]
fn test_unknown_field_with_pin() {
    let env = Env::new();
    let err = env
        .plan(&posts().filter(field(0, "missing").eq(pin(1))))
        .unwrap_err();
    assert!(err.is_structure());
    assert_eq!(err.clause(), Clause::Where);
}
