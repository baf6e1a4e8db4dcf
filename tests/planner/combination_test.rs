//! Nested queries: combinations, CTEs and subqueries share the parent's
//! parameter list and prefix.

mod fixtures;

use fixtures::{posts, Env};
use sieve::prelude::*;
use sieve::query::{BoundSource, CteQuery};

#[test]
fn test_combination_parameters_are_global() {
    let env = Env::new();
    let query = posts()
        .select(field(0, "title"))
        .filter(field(0, "title").eq(pin("a")))
        .union_all(
            posts()
                .select(field(0, "title"))
                .filter(field(0, "title").eq(pin("b"))),
        )
        .limit(pin(3));

    let plan = env.plan(&query).unwrap();

    assert_eq!(
        plan.values(),
        vec![Value::from("a"), Value::from("b"), Value::Int(3)]
    );
    let nested = &plan.query.combinations[0].query;
    assert_eq!(nested.wheres[0].expr, field(0, "title").eq(Expr::Param(1)));
    assert_eq!(plan.query.limit, Some(Expr::Param(2)));
    assert_eq!(plan.params[1].clause, Clause::Where);
}

#[test]
fn test_cte_parameters_come_first() {
    let env = Env::new();
    let query = posts()
        .filter(field(0, "votes").gt(pin(1)))
        .with_cte("popular", posts().filter(field(0, "title").eq(pin("x"))));

    let plan = env.plan(&query).unwrap();
    assert_eq!(plan.values(), vec![Value::from("x"), Value::Int(1)]);

    let CteQuery::Query(body) = &plan.query.with_ctes[0].query else {
        panic!("expected a query body");
    };
    assert_eq!(body.wheres[0].expr, field(0, "title").eq(Expr::Param(0)));
    assert_eq!(body.sources.len(), 1);
}

#[test]
fn test_recursive_cte_names_itself_as_table() {
    let env = Env::new();
    let tree = QueryExpr::from_table("categories")
        .filter(field(0, "parent_id").is_nil())
        .select(take_map(0, &["id", "parent_id"]))
        .union_all(
            QueryExpr::from_table("categories")
                .inner_join(
                    Source::table("tree"),
                    field(1, "id").eq(field(0, "parent_id")),
                )
                .select(take_map(0, &["id", "parent_id"])),
        );
    let query = QueryExpr::from_table("tree")
        .with_recursive_cte("tree", tree)
        .select(field(0, "id"));

    let (plan, meta) = env.prepare(&query).unwrap();
    assert!(plan.query.with_ctes[0].recursive);
    assert_eq!(meta.fields, vec![field(0, "id")]);
}

#[test]
fn test_subquery_parameters_in_from() {
    let env = Env::new();
    let inner = posts()
        .filter(field(0, "votes").gt(pin(5)))
        .select(take_map(0, &["id", "votes"]));
    let query = QueryExpr::new()
        .from(Source::subquery(inner))
        .filter(field(0, "votes").lt(pin(100)));

    let plan = env.plan(&query).unwrap();
    assert_eq!(plan.values(), vec![Value::Int(5), Value::Int(100)]);
    assert_eq!(plan.query.sources[0], BoundSource::Subquery);
    // Fields of a subquery binding are untyped.
    assert_eq!(plan.params[1].ty, FieldType::Any);
}

#[test]
fn test_nested_queries_inherit_query_prefix() {
    let env = Env::new();
    let query = QueryExpr::from_table("events")
        .prefix("tenant")
        .select(field(0, "id"))
        .union(QueryExpr::from_table("archived_events").select(field(0, "id")));

    let plan = env.plan(&query).unwrap();
    let nested = &plan.query.combinations[0].query;
    assert_eq!(
        nested.sources[0],
        BoundSource::Table {
            table: "archived_events".into(),
            schema: None,
            prefix: Some("tenant".into()),
        }
    );
}

#[test]
fn test_combination_order_by_must_use_alias() {
    let env = Env::new();
    let query = posts()
        .select(field(0, "title").selected_as("t"))
        .union(posts().select(field(0, "title").selected_as("t")))
        .order_by(vec![OrderByItem::asc(field(0, "title"))]);

    let err = env.prepare(&query).unwrap_err();
    assert!(err.is_structure());
    assert_eq!(err.clause(), Clause::OrderBy);

    let query = posts()
        .select(field(0, "title").selected_as("t"))
        .union(posts().select(field(0, "title").selected_as("t")))
        .order_by(vec![OrderByItem::asc(Expr::SelectedRef("t".into()))]);
    assert!(env.prepare(&query).is_ok());
}

#[test]
fn test_combination_branches_are_normalized() {
    let env = Env::new();
    let query = posts()
        .select(field(0, "id"))
        .union(posts().select(field(0, "missing")));

    let err = env.prepare(&query).unwrap_err();
    assert!(err.to_string().contains("field `missing` does not exist"));

    let query = posts().union(posts());
    let (plan, _) = env.prepare(&query).unwrap();
    let branch = plan.query.combinations[0].query.select.as_ref().unwrap();
    assert_eq!(branch.fields.len(), 6);
}

#[test]
fn test_nested_query_errors_surface() {
    let env = Env::new();
    let query = posts().with_cte("bad", posts().filter(field(0, "votes").eq(pin("lots"))));
    let err = env.plan(&query).unwrap_err();
    assert!(err.is_cast());
    assert_eq!(err.clause(), Clause::Where);
}

#[test]
fn test_recursive_cte_capability() {
    #[derive(Debug)]
    struct NoRecursion;

    impl SqlCapabilities for NoRecursion {
        fn name(&self) -> &'static str {
            "norec"
        }

        fn supports_recursive_cte(&self) -> bool {
            false
        }
    }

    let env = Env::new();
    let query = posts().with_recursive_cte("tree", posts());
    let err = env
        .planner()
        .plan(&query, Operation::All, &NoRecursion)
        .unwrap_err();
    assert_eq!(err.clause(), Clause::WithCte);
}
