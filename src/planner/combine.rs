//! Nested queries: common table expressions, set-operation combinations and
//! subquery sources.
//!
//! A nested query is planned as `all` when the parent visits the clause that
//! holds it. It shares the parent's parameter list, so placeholders are global
//! and nested parameters land at the position of their clause. Its cache key
//! is embedded in the parent's (see [`crate::cache`]).
//!
//! A recursive CTE is only a flag. Its body may name the CTE as a bare table,
//! which binds like any other table without a schema.

use crate::error::{Clause, PlanError, PlanResult};
use crate::query::{CteQuery, Expr, FromExpr, OrderByExpr, QueryExpr, Source};

use super::{normalize, plan_query, BoundParameter, PlanContext};

/// Plan a nested query, appending its parameters to the parent's.
pub(super) fn plan_nested(
    ctx: &PlanContext<'_>,
    query: &QueryExpr,
    parent_prefix: Option<&str>,
    params: &mut Vec<BoundParameter>,
) -> PlanResult<QueryExpr> {
    let nested = ctx.nested(parent_prefix);
    let start = params.len();
    let planned = plan_query(&nested, query, params)?;
    tracing::trace!(
        first_param = start,
        params = params.len() - start,
        "planned nested query"
    );
    Ok(planned)
}

/// Normalize every nested query in place.
pub(super) fn normalize_nested(ctx: &PlanContext<'_>, query: &mut QueryExpr) -> PlanResult<()> {
    let prefix = query.prefix.clone();
    let nested = ctx.nested(prefix.as_deref());

    for cte in &mut query.with_ctes {
        if let CteQuery::Query(body) = &mut cte.query {
            let (normalized, _) = normalize::normalize(&nested, body)?;
            **body = normalized;
        }
    }

    for combination in &mut query.combinations {
        let (normalized, _) = normalize::normalize(&nested, &combination.query)?;
        combination.query = normalized;
    }

    if let Some(FromExpr {
        source: Source::Subquery(sub),
        ..
    }) = &mut query.from
    {
        let (normalized, _) = normalize::normalize(&nested, sub)?;
        **sub = normalized;
    }

    for join in &mut query.joins {
        if let Some(Source::Subquery(sub)) = &mut join.source {
            let (normalized, _) = normalize::normalize(&nested, sub)?;
            **sub = normalized;
        }
    }

    Ok(())
}

/// With combinations, bindings in the top-level `order_by` are ambiguous:
/// each branch has its own. Ordering must go through `selected_as` aliases.
pub(super) fn check_order_by(query: &QueryExpr) -> PlanResult<()> {
    if query.combinations.is_empty() {
        return Ok(());
    }

    for order in &query.order_bys {
        let OrderByExpr::Items(items) = order else {
            continue;
        };
        for item in items {
            let uses_binding = item.expr.any(&|e| {
                matches!(
                    e,
                    Expr::Field { .. } | Expr::Binding(_) | Expr::Struct { .. } | Expr::MapOf { .. }
                )
            });
            if uses_binding {
                return Err(PlanError::structure(
                    Clause::OrderBy,
                    item,
                    "cannot use bindings in `order_by` when using `union`, `except` or \
                     `intersect`; order by a `selected_as` alias instead",
                ));
            }
        }
    }
    Ok(())
}
