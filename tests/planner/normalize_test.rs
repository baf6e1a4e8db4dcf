//! Normalization: operation legality, field validation, literal dumping,
//! preload validation and select expansion.

mod fixtures;

use fixtures::{posts, Env, LABEL_ID};
use sieve::prelude::*;
use sieve::query::{GroupByExpr, Take};

fn fields_of(binding: usize, names: &[&str]) -> Vec<Expr> {
    names.iter().map(|name| field(binding, name)).collect()
}

const POST_FIELDS: &[&str] = &["id", "title", "votes", "tags", "public", "author_id"];
const COMMENT_FIELDS: &[&str] = &["id", "body", "post_id", "author_id"];

// =============================================================================
// Operation legality
// =============================================================================

#[test]
fn test_all_rejects_updates() {
    let env = Env::new();
    let query = posts().update(UpdateOp::Set, vec![("title", lit("x"))]);
    let err = env.prepare(&query).unwrap_err();
    assert!(err.is_structure());
    assert_eq!(err.clause(), Clause::Update);
}

#[test]
fn test_update_all_requires_fields() {
    let env = Env::new();
    let err = env
        .prepare_for(&posts(), Operation::UpdateAll)
        .unwrap_err();
    assert!(err.to_string().contains("requires at least one field"));

    let err = env
        .prepare_for(&posts().update(UpdateOp::Set, vec![]), Operation::UpdateAll)
        .unwrap_err();
    assert_eq!(err.clause(), Clause::Update);
}

#[test]
fn test_update_all_rejects_select() {
    let env = Env::new();
    let query = posts()
        .select(field(0, "id"))
        .update(UpdateOp::Set, vec![("title", pin("x"))]);
    let err = env.prepare_for(&query, Operation::UpdateAll).unwrap_err();

    assert_eq!(err.clause(), Clause::Select);
    assert!(err
        .to_string()
        .contains("`update_all` allows only `with_cte`, `where` and `join` expressions"));
}

#[test]
fn test_delete_all_rejects_order_by_and_updates() {
    let env = Env::new();
    let query = posts().order_by(vec![OrderByItem::asc(field(0, "id"))]);
    let err = env.prepare_for(&query, Operation::DeleteAll).unwrap_err();
    assert_eq!(err.clause(), Clause::OrderBy);

    let query = posts().update(UpdateOp::Set, vec![("title", pin("x"))]);
    let err = env.prepare_for(&query, Operation::DeleteAll).unwrap_err();
    assert_eq!(err.clause(), Clause::Update);
}

#[test]
fn test_delete_all_with_filters_and_joins() {
    let env = Env::new();
    let query = posts()
        .join_assoc(JoinQual::Inner, 0, "comments")
        .filter(field(1, "body").eq(pin("spam")));

    let (plan, _) = env.prepare_for(&query, Operation::DeleteAll).unwrap();
    assert_eq!(plan.values(), vec![Value::from("spam")]);
}

#[test]
fn test_update_all_normalizes() {
    let env = Env::new();
    let query = posts()
        .filter(field(0, "votes").lt(lit(0)))
        .update(UpdateOp::Set, vec![("public", lit(false))])
        .update(UpdateOp::Inc, vec![("votes", pin(1))]);

    let (plan, _) = env.prepare_for(&query, Operation::UpdateAll).unwrap();
    assert_eq!(plan.query.updates.len(), 2);
    assert_eq!(plan.values(), vec![Value::Int(1)]);
}

#[test]
fn test_update_virtual_field_rejected() {
    let env = Env::new();
    let query = posts().update(UpdateOp::Set, vec![("score", lit(1.5))]);
    let err = env.prepare_for(&query, Operation::UpdateAll).unwrap_err();
    assert_eq!(err.clause(), Clause::Update);
    assert!(err.to_string().contains("is virtual"));
}

// =============================================================================
// Fields and literals
// =============================================================================

#[test]
fn test_unknown_field_in_select() {
    let env = Env::new();
    let err = env
        .prepare(&posts().select(field(0, "nope")))
        .unwrap_err();
    assert!(err.is_structure());
    assert_eq!(err.clause(), Clause::Select);
}

#[test]
fn test_unknown_binding() {
    let env = Env::new();
    let err = env
        .prepare(&posts().filter(field(3, "id").eq(lit(1))))
        .unwrap_err();
    assert!(err.to_string().contains("unknown binding &3"));
}

#[test]
fn test_literal_dump_failure() {
    let env = Env::new();
    let err = env
        .prepare(&posts().filter(lit("many").eq(field(0, "votes"))))
        .unwrap_err();
    assert!(err.is_dump());
    match err {
        PlanError::Dump { ty, operation, .. } => {
            assert_eq!(ty, "integer");
            assert_eq!(operation, "all");
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[test]
fn test_literals_dumped_with_field_type() {
    let env = Env::new();
    let query = QueryExpr::from_schema("labels", "Label")
        .filter(field(0, "id").eq(lit(LABEL_ID)))
        .filter(field(0, "id").in_(list(vec![lit(LABEL_ID), lit_null()])));

    let (plan, _) = env.prepare(&query).unwrap();

    let Expr::Binary { right, .. } = &plan.query.wheres[0].expr else {
        panic!("expected comparison");
    };
    assert!(matches!(&**right, Expr::Literal(Value::Binary(bytes)) if bytes.len() == 16));

    let Expr::In { right, .. } = &plan.query.wheres[1].expr else {
        panic!("expected membership");
    };
    let Expr::List(items) = &**right else {
        panic!("expected literal list");
    };
    assert!(matches!(&items[0], Expr::Literal(Value::Binary(_))));
    assert_eq!(items[1], lit_null());
}

#[test]
fn test_unknown_named_window() {
    let env = Env::new();
    let err = env
        .prepare(&posts().select(call("row_number", vec![]).over("w")))
        .unwrap_err();
    assert!(err.to_string().contains("unknown window `w`"));

    let query = posts()
        .window("w", WindowDef::partition_by(vec![field(0, "author_id")]))
        .select(call("row_number", vec![]).over("w"));
    assert!(env.prepare(&query).is_ok());
}

#[test]
fn test_selected_as_alias_reference() {
    let env = Env::new();
    let query = posts()
        .select(Expr::Tuple(vec![
            field(0, "id"),
            count(field(0, "id")).selected_as("total"),
        ]))
        .order_by(vec![OrderByItem::desc(Expr::SelectedRef("total".into()))]);
    assert!(env.prepare(&query).is_ok());

    let query = posts()
        .select(field(0, "id"))
        .order_by(vec![OrderByItem::desc(Expr::SelectedRef("total".into()))]);
    let err = env.prepare(&query).unwrap_err();
    assert_eq!(err.clause(), Clause::OrderBy);
}

#[test]
fn test_empty_clauses_pruned() {
    let env = Env::new();
    let mut query = posts().order_by(vec![]).group_by(vec![]);
    query.group_bys.push(GroupByExpr::Pinned(vec![]));

    let (plan, _) = env.prepare(&query).unwrap();
    assert!(plan.query.order_bys.is_empty());
    assert!(plan.query.group_bys.is_empty());
}

// =============================================================================
// Select expansion
// =============================================================================

#[test]
fn test_default_select_loads_schema_fields() {
    let env = Env::new();
    let (plan, meta) = env.prepare(&posts()).unwrap();

    assert_eq!(meta.fields, fields_of(0, POST_FIELDS));
    assert_eq!(
        meta.shape,
        SelectShape::Struct {
            binding: 0,
            schema: "Post".into(),
        }
    );
    assert_eq!(plan.query.select.unwrap().fields, fields_of(0, POST_FIELDS));
}

#[test]
fn test_default_select_requires_schema() {
    let env = Env::new();
    let err = env.prepare(&QueryExpr::from_table("events")).unwrap_err();
    assert!(err.is_structure());
    assert_eq!(err.clause(), Clause::Select);
}

#[test]
fn test_struct_take() {
    let env = Env::new();
    let (_, meta) = env.prepare(&posts().select(take_struct(0, &["id", "title"]))).unwrap();
    assert_eq!(meta.fields, fields_of(0, &["id", "title"]));

    let err = env
        .prepare(&QueryExpr::from_table("events").select(take_struct(0, &["id"])))
        .unwrap_err();
    assert!(err.to_string().contains("expects binding &0 to have a schema"));
}

#[test]
fn test_map_take_on_schemaless_source() {
    let env = Env::new();
    let (_, meta) = env
        .prepare(&QueryExpr::from_table("events").select(take_map(0, &["kind", "at"])))
        .unwrap();
    assert_eq!(meta.fields, fields_of(0, &["kind", "at"]));
    assert_eq!(meta.shape, SelectShape::Map { binding: 0 });
}

#[test]
fn test_map_literal_select() {
    let env = Env::new();
    let query = posts().select(Expr::Map(vec![
        ("t".into(), field(0, "title")),
        ("n".into(), count(field(0, "id"))),
    ]));
    let (_, meta) = env.prepare(&query).unwrap();
    assert_eq!(meta.fields, vec![field(0, "title"), count(field(0, "id"))]);
    assert_eq!(meta.shape, SelectShape::Expr);
}

#[test]
fn test_subquery_source_exposes_selected_fields() {
    let env = Env::new();
    let inner = posts().select(Expr::Tuple(vec![
        field(0, "title"),
        field(0, "votes").selected_as("score"),
    ]));
    let query = QueryExpr::new().from(Source::subquery(inner));

    let (_, meta) = env.prepare(&query).unwrap();
    assert_eq!(meta.fields, fields_of(0, &["title", "score"]));
}

// =============================================================================
// Preloads
// =============================================================================

#[test]
fn test_joined_preload_adds_assoc_fields() {
    let env = Env::new();
    let query = posts()
        .join_assoc(JoinQual::Left, 0, "comments")
        .preload(Preload::joined("comments", 1));

    let (_, meta) = env.prepare(&query).unwrap();

    let mut expected = fields_of(0, POST_FIELDS);
    expected.extend(fields_of(1, COMMENT_FIELDS));
    assert_eq!(meta.fields, expected);
    assert_eq!(
        meta.assocs,
        vec![AssocSelect {
            path: vec!["comments".into()],
            binding: 1,
            schema: "Comment".into(),
            fields: COMMENT_FIELDS.iter().map(|f| f.to_string()).collect(),
        }]
    );
    assert_eq!(meta.preloads, vec![vec!["comments".to_string()]]);
}

#[test]
fn test_struct_take_for_joined_association() {
    let env = Env::new();
    let query = posts()
        .join_assoc(JoinQual::Inner, 0, "comments")
        .preload(Preload::joined("comments", 1))
        .select(Expr::Struct {
            binding: 0,
            take: vec![
                Take::Field("title".into()),
                Take::Assoc("comments".into(), vec![Take::Field("body".into())]),
            ],
        });

    let (_, meta) = env.prepare(&query).unwrap();
    assert_eq!(meta.fields, vec![field(0, "title"), field(1, "body")]);
    assert_eq!(meta.assocs.len(), 1);
    assert_eq!(meta.assocs[0].fields, vec!["body".to_string()]);
}

#[test]
fn test_separate_preloads_validated() {
    let env = Env::new();
    let query = posts().preload(
        Preload::new("comments").with_children(vec![Preload::new("author")]),
    );
    let (_, meta) = env.prepare(&query).unwrap();
    assert!(meta.assocs.is_empty());
    assert_eq!(
        meta.preloads,
        vec![
            vec!["comments".to_string()],
            vec!["comments".to_string(), "author".to_string()],
        ]
    );

    let err = env
        .prepare(&posts().preload(Preload::new("comments").with_children(vec![Preload::new("likes")])))
        .unwrap_err();
    assert_eq!(err.clause(), Clause::Preload);
    assert!(err.to_string().contains("does not have association `likes`"));
}

#[test]
fn test_preload_through_association() {
    let env = Env::new();
    let query = posts().preload(
        Preload::new("comment_authors").with_children(vec![Preload::new("nope")]),
    );
    let err = env.prepare(&query).unwrap_err();
    // The child resolves against Author, the end of the chain.
    assert!(err.to_string().contains("schema `Author` does not have association `nope`"));
}

#[test]
fn test_preload_requires_root_in_select() {
    let env = Env::new();
    let query = posts()
        .select(field(0, "title"))
        .preload(Preload::new("comments"));
    let err = env.prepare(&query).unwrap_err();
    assert_eq!(err.clause(), Clause::Preload);
}

#[test]
fn test_preload_binding_must_match_association() {
    let env = Env::new();
    let query = posts()
        .join_assoc(JoinQual::Inner, 0, "author")
        .preload(Preload::joined("comments", 1));
    let err = env.prepare(&query).unwrap_err();
    assert_eq!(err.clause(), Clause::Preload);
    assert!(err.to_string().contains("does not hold schema `Comment`"));
}

#[test]
fn test_preload_of_field_is_not_association() {
    let env = Env::new();
    let err = env
        .prepare(&posts().preload(Preload::new("title")))
        .unwrap_err();
    assert!(err.to_string().contains("not an association"));
}
