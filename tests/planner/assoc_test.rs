//! Association join expansion: binding allocation, execution order and join
//! conditions.

mod fixtures;

use fixtures::{join_order, posts, referenced_bindings, Env};
use sieve::prelude::*;
use sieve::query::BoundSource;

#[test]
fn test_belongs_to_join() {
    let env = Env::new();
    let plan = env
        .plan(&posts().join_assoc(JoinQual::Inner, 0, "author"))
        .unwrap();

    assert_eq!(join_order(&plan.query), vec![1]);
    assert_eq!(
        plan.query.joins[0].on,
        Some(field(1, "id").eq(field(0, "author_id")))
    );
    assert_eq!(plan.query.sources[1].schema(), Some("Author"));
    assert_eq!(plan.query.sources[1].table(), Some("authors"));
}

#[test]
fn test_through_chain_keeps_declared_binding() {
    let env = Env::new();
    let plan = env
        .plan(&posts().join_assoc(JoinQual::Inner, 0, "comment_authors"))
        .unwrap();
    let query = &plan.query;

    // The intermediate comments hop runs first under a fresh binding.
    assert_eq!(join_order(query), vec![2, 1]);
    assert_eq!(referenced_bindings(&query.joins[0]), vec![0, 2]);
    assert_eq!(referenced_bindings(&query.joins[1]), vec![1, 2]);
    assert_eq!(query.sources[2].schema(), Some("Comment"));
    assert_eq!(query.sources[1].schema(), Some("Author"));

    insta::assert_snapshot!(
        query.joins[0].on.as_ref().unwrap().to_string(),
        @"&2.post_id == &0.id"
    );
    insta::assert_snapshot!(
        query.joins[1].on.as_ref().unwrap().to_string(),
        @"&1.id == &2.author_id"
    );
}

#[test]
fn test_through_chain_interleaved_with_plain_joins() {
    let env = Env::new();
    let query = posts()
        .join_assoc(JoinQual::Left, 0, "comments")
        .join_assoc(JoinQual::Left, 0, "comment_authors")
        .filter(field(2, "name").eq(pin("ann")));

    let plan = env.plan(&query).unwrap();

    assert_eq!(join_order(&plan.query), vec![1, 3, 2]);
    assert_eq!(plan.query.binding_count(), 4);
    // Expressions keep addressing the declared binding.
    assert_eq!(plan.query.sources[2].schema(), Some("Author"));
    assert_eq!(plan.params[0].ty, FieldType::String);
    for join in &plan.query.joins {
        assert_eq!(join.qual, JoinQual::Left);
    }
}

#[test]
fn test_user_condition_lands_on_final_hop() {
    let env = Env::new();
    let query = posts().join(
        JoinExpr::assoc(JoinQual::Inner, 0, "comment_authors")
            .with_on(field(1, "name").eq(pin("bob"))),
    );

    let plan = env.plan(&query).unwrap();
    assert_eq!(plan.query.joins[0].on, Some(field(2, "post_id").eq(field(0, "id"))));
    assert_eq!(
        plan.query.joins[1].on,
        Some(
            field(1, "id")
                .eq(field(2, "author_id"))
                .and(field(1, "name").eq(Expr::Param(0)))
        )
    );
    assert_eq!(plan.values(), vec![Value::from("bob")]);
}

#[test]
fn test_dynamic_condition_on_association_join() {
    let env = Env::new();
    let query = posts().join(
        JoinExpr::assoc(JoinQual::Inner, 0, "comments")
            .with_on(dynamic(field(1, "body").eq(pin("hi")))),
    );

    let plan = env.plan(&query).unwrap();
    assert_eq!(
        plan.query.joins[0].on,
        Some(
            field(1, "post_id")
                .eq(field(0, "id"))
                .and(field(1, "body").eq(Expr::Param(0)))
        )
    );
    assert_eq!(plan.values(), vec![Value::from("hi")]);
    assert_eq!(plan.params[0].clause, Clause::Join);
}

#[test]
fn test_keyword_condition_on_association_join() {
    let env = Env::new();
    let query = posts()
        .join(
            JoinExpr::assoc(JoinQual::Left, 0, "comment_authors")
                .with_on(pin_keyword(vec![("name", Value::from("bob"))])),
        )
        .filter(field(0, "votes").gt(pin(3)));

    let plan = env.plan(&query).unwrap();
    // The keyword addresses the declared binding, not the intermediate hop.
    insta::assert_snapshot!(
        plan.query.joins[1].on.as_ref().unwrap().to_string(),
        @"(&1.id == &2.author_id) and (&1.name == ?0)"
    );
    assert_eq!(plan.values(), vec![Value::from("bob"), Value::Int(3)]);
    assert_eq!(plan.params[0].ty, FieldType::String);
}

#[test]
fn test_interpolated_condition_still_rejected_when_nested() {
    let env = Env::new();
    let query = posts().join(
        JoinExpr::assoc(JoinQual::Inner, 0, "comments")
            .with_on(field(1, "body").eq(lit("x")).and(dynamic(field(1, "body").eq(pin("hi"))))),
    );

    let err = env.plan(&query).unwrap_err();
    assert!(err.is_structure());
    assert_eq!(err.clause(), Clause::Join);
}

#[test]
fn test_owner_keys_follow_custom_primary_key() {
    let env = Env {
        registry: fixtures::registry()
            .with(
                Schema::new("Doc", "docs")
                    .primary_key("uuid", FieldType::custom("binary_id"))
                    .has_many("notes", "Note"),
            )
            .with(
                Schema::new("Note", "notes")
                    .field("doc_id", FieldType::custom("binary_id"))
                    .field("text", FieldType::String),
            ),
        types: BuiltinTypes::new(),
    };
    let query = QueryExpr::from_schema("docs", "Doc").join_assoc(JoinQual::Inner, 0, "notes");

    let (plan, meta) = env.prepare(&query).unwrap();
    assert_eq!(plan.query.joins[0].on, Some(field(1, "doc_id").eq(field(0, "uuid"))));
    assert_eq!(meta.fields, vec![field(0, "uuid")]);
}

#[test]
fn test_many_to_many_through_bare_table() {
    let env = Env::new();
    let plan = env
        .plan(&posts().join_assoc(JoinQual::Inner, 0, "labels"))
        .unwrap();
    let query = &plan.query;

    assert_eq!(join_order(query), vec![2, 1]);
    assert_eq!(
        query.sources[2],
        BoundSource::Table {
            table: "posts_labels".into(),
            schema: None,
            prefix: None,
        }
    );
    assert!(query.joins[0].assoc.is_none());
    assert_eq!(query.joins[1].assoc.as_ref().map(|a| a.name.as_str()), Some("labels"));
    assert_eq!(query.joins[0].on, Some(field(2, "post_id").eq(field(0, "id"))));
    assert_eq!(query.joins[1].on, Some(field(1, "id").eq(field(2, "label_id"))));
}

#[test]
fn test_association_from_joined_binding() {
    let env = Env::new();
    let query = posts()
        .join_assoc(JoinQual::Inner, 0, "comments")
        .join_assoc(JoinQual::Inner, 1, "author");

    let plan = env.plan(&query).unwrap();
    assert_eq!(join_order(&plan.query), vec![1, 2]);
    assert_eq!(plan.query.joins[1].on, Some(field(2, "id").eq(field(1, "author_id"))));
}

#[test]
fn test_association_parent_must_precede_join() {
    let env = Env::new();
    let query = posts()
        .join_assoc(JoinQual::Inner, 2, "author")
        .join_assoc(JoinQual::Inner, 0, "comments");

    let err = env.plan(&query).unwrap_err();
    assert!(err.is_structure());
    assert_eq!(err.clause(), Clause::Join);
}

#[test]
fn test_nested_through_chain() {
    let env = Env::new();
    let query = QueryExpr::from_schema("comments", "Comment")
        .join_assoc(JoinQual::Inner, 0, "post_comments");

    let plan = env.plan(&query).unwrap();
    assert_eq!(join_order(&plan.query), vec![2, 1]);
    assert_eq!(plan.query.sources[2].schema(), Some("Post"));
    assert_eq!(plan.query.sources[1].schema(), Some("Comment"));
    assert_eq!(plan.query.joins[1].on, Some(field(1, "post_id").eq(field(2, "id"))));
}

#[test]
fn test_association_with_filters() {
    let env = Env {
        registry: fixtures::registry().with(
            Schema::new("Thread", "threads").association(
                AssociationDef::has_many("Thread", "visible_posts", Related::Schema("Post".into()))
                    .with_keys("id", "thread_id")
                    .with_filter("public", FilterCondition::Eq(Value::Bool(true)))
                    .with_filter("votes", FilterCondition::In(vec![Value::Int(1), Value::Int(2)])),
            ),
        ),
        types: BuiltinTypes::new(),
    };
    let query = QueryExpr::from_schema("threads", "Thread")
        .join_assoc(JoinQual::Inner, 0, "visible_posts");

    let plan = env.plan(&query).unwrap();
    insta::assert_snapshot!(
        plan.query.joins[0].on.as_ref().unwrap().to_string(),
        @"(&1.thread_id == &0.id) and (&1.public == true) and &1.votes in [1, 2]"
    );
    assert!(plan.cache_key.is_cacheable());
}

#[test]
fn test_unknown_schema_in_from() {
    let env = Env::new();
    let err = env
        .plan(&QueryExpr::from_schema("ghosts", "Ghost"))
        .unwrap_err();
    assert!(err.is_structure());
    assert_eq!(err.clause(), Clause::From);
    assert!(err.to_string().contains("schema `Ghost` is not registered"));
}

#[test]
fn test_preload_through_full_join_rejected() {
    let env = Env::new();
    let query = posts()
        .join_assoc(JoinQual::Full, 0, "comments")
        .preload(Preload::joined("comments", 1));

    let err = env.plan(&query).unwrap_err();
    assert_eq!(err.clause(), Clause::Preload);
}

#[test]
fn test_not_nil_filter_on_related_binding() {
    let env = Env {
        registry: fixtures::registry().with(
            Schema::new("Thread", "threads").association(
                AssociationDef::has_many("Thread", "titled_posts", Related::Schema("Post".into()))
                    .with_filter("title", FilterCondition::NotNil),
            ),
        ),
        types: BuiltinTypes::new(),
    };
    let query = QueryExpr::from_schema("threads", "Thread")
        .join_assoc(JoinQual::Inner, 0, "titled_posts");

    let plan = env.plan(&query).unwrap();
    insta::assert_snapshot!(
        plan.query.joins[0].on.as_ref().unwrap().to_string(),
        @"(&1.thread_id == &0.id) and not(is_nil(&1.title))"
    );
}

#[test]
fn test_join_through_filters_land_on_join_table() {
    let env = Env {
        registry: fixtures::registry().with(
            Schema::new("Shelf", "shelves").association(
                AssociationDef::many_to_many(
                    "Shelf",
                    "active_labels",
                    "Label",
                    Related::Table("shelves_labels".into()),
                )
                .with_join_filter("active", FilterCondition::Eq(Value::Bool(true)))
                .with_filter("name", FilterCondition::NotNil),
            ),
        ),
        types: BuiltinTypes::new(),
    };
    let query = QueryExpr::from_schema("shelves", "Shelf")
        .join_assoc(JoinQual::Inner, 0, "active_labels");

    let plan = env.plan(&query).unwrap();
    assert_eq!(join_order(&plan.query), vec![2, 1]);
    insta::assert_snapshot!(
        plan.query.joins[0].on.as_ref().unwrap().to_string(),
        @"(&2.shelf_id == &0.id) and (&2.active == true)"
    );
    insta::assert_snapshot!(
        plan.query.joins[1].on.as_ref().unwrap().to_string(),
        @"(&1.id == &2.label_id) and not(is_nil(&1.name))"
    );
}
