//! Cache keys: shape determinism, parameter independence and
//! uncacheable propagation.

mod fixtures;

use fixtures::{posts, Env, LABEL_ID};
use sieve::prelude::*;

fn key_of(env: &Env, query: &QueryExpr) -> CacheKey {
    env.plan(query).unwrap().cache_key
}

#[test]
fn test_key_ignores_pinned_values() {
    let env = Env::new();
    let a = env
        .plan(&posts().filter(field(0, "title").eq(pin("a"))).limit(pin(1)))
        .unwrap();
    let b = env
        .plan(&posts().filter(field(0, "title").eq(pin("b"))).limit(pin(50)))
        .unwrap();

    assert_eq!(a.cache_key, b.cache_key);
    assert_ne!(a.values(), b.values());
    assert_eq!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
}

#[test]
fn test_key_depends_on_literals_and_shape() {
    let env = Env::new();
    let base = key_of(&env, &posts().filter(field(0, "votes").gt(lit(1))));
    let other_literal = key_of(&env, &posts().filter(field(0, "votes").gt(lit(2))));
    let other_op = key_of(&env, &posts().filter(field(0, "votes").lt(lit(1))));
    let or_filter = key_of(
        &env,
        &posts()
            .filter(field(0, "votes").gt(lit(1)))
            .or_filter(field(0, "public").eq(lit(true))),
    );
    let and_filter = key_of(
        &env,
        &posts()
            .filter(field(0, "votes").gt(lit(1)))
            .filter(field(0, "public").eq(lit(true))),
    );

    assert_ne!(base, other_literal);
    assert_ne!(base, other_op);
    assert_ne!(or_filter, and_filter);
}

#[test]
fn test_key_depends_on_operation_and_prefix() {
    let env = Env::new();
    let query = posts().filter(field(0, "votes").gt(pin(1)));

    let all = env.plan(&query).unwrap().cache_key;
    let delete = env.plan_for(&query, Operation::DeleteAll).unwrap().cache_key;
    let prefixed = key_of(&env, &query.clone().prefix("tenant"));

    assert_ne!(all, delete);
    assert_ne!(all, prefixed);
}

#[test]
fn test_key_depends_on_expanded_joins() {
    let env = Env::new();
    let comments = key_of(&env, &posts().join_assoc(JoinQual::Inner, 0, "comments"));
    let authors = key_of(&env, &posts().join_assoc(JoinQual::Inner, 0, "author"));
    let left = key_of(&env, &posts().join_assoc(JoinQual::Left, 0, "comments"));

    assert_ne!(comments, authors);
    assert_ne!(comments, left);
}

#[test]
fn test_pinned_collection_is_uncacheable() {
    let env = Env::new();
    let plan = env
        .plan(&posts().filter(field(0, "id").in_(pin(vec![1, 2]))))
        .unwrap();
    assert!(!plan.cache_key.is_cacheable());
    assert_eq!(plan.fingerprint().unwrap(), None);
}

#[test]
fn test_uncacheable_propagates_from_combination() {
    let env = Env::new();
    let query = posts()
        .select(field(0, "id"))
        .union(
            posts()
                .select(field(0, "id"))
                .filter(field(0, "id").in_(pin(vec![1, 2]))),
        );
    assert_eq!(key_of(&env, &query), CacheKey::Uncacheable);
}

#[test]
fn test_uncacheable_propagates_from_cte() {
    let env = Env::new();
    let query = posts().with_cte(
        "picked",
        posts().filter(field(0, "id").in_(pin(vec![1, 2, 3]))),
    );
    assert_eq!(key_of(&env, &query), CacheKey::Uncacheable);
}

#[test]
fn test_uncacheable_propagates_from_subquery_source() {
    let env = Env::new();
    let inner = posts().filter(field(0, "votes").in_(pin(vec![1])));
    let query = QueryExpr::new().from(Source::subquery(inner));
    assert_eq!(key_of(&env, &query), CacheKey::Uncacheable);
}

#[test]
fn test_fingerprint_is_hex_sha256() {
    let env = Env::new();
    let plan = env.plan(&posts()).unwrap();
    let fingerprint = plan.fingerprint().unwrap().unwrap();

    assert_eq!(fingerprint.len(), 64);
    assert!(fingerprint.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
}

#[test]
fn test_fingerprint_disabled_in_settings() {
    let env = Env::new();
    let settings = Settings::from_toml_str("[cache]\nfingerprint = false\n").unwrap();
    let planner = env.planner().with_settings(&settings).unwrap();

    let plan = planner.plan(&posts(), Operation::All, &Postgres).unwrap();
    assert!(plan.cache_key.is_cacheable());
    assert_eq!(plan.fingerprint().unwrap(), None);
}

#[test]
fn test_key_starts_with_operation() {
    let env = Env::new();
    let CacheKey::Key(nodes) = env.plan_for(&posts(), Operation::DeleteAll).unwrap().cache_key
    else {
        panic!("expected a cacheable key");
    };
    assert_eq!(nodes[0], KeyNode::Atom("delete_all".into()));
}

#[test]
fn test_key_uses_dumped_literals() {
    let env = Env::new();
    let labels = |id: String| {
        QueryExpr::from_schema("labels", "Label").filter(field(0, "id").eq(lit(id)))
    };

    let lower = key_of(&env, &labels(LABEL_ID.to_string()));
    let upper = key_of(&env, &labels(LABEL_ID.to_uppercase()));
    assert_eq!(lower, upper);

    // A literal that does not dump is keyed as written.
    let bad = key_of(&env, &labels("not-a-uuid".to_string()));
    assert_ne!(lower, bad);
}
