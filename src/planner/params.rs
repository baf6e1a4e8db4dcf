//! Parameter extraction and casting.
//!
//! Walks a query's clauses in a fixed order and replaces every interpolated
//! value with a positional placeholder. Each value is cast to the type its
//! context expects, then dumped to its storage representation.
//!
//! Clause order for `all`:
//! with_cte, distinct, select, from, join, where, group_by, having, windows,
//! combination, order_by, limit, offset.
//!
//! For `update_all` and `delete_all`:
//! with_cte, update, from, join, where.
//!
//! Clauses an operation does not allow are still visited, after the allowed
//! ones, so the normalizer can reject them with their placeholders in place.
//! Nested queries are planned at the position of the clause that holds them
//! and share the parent's parameter list.

use std::collections::HashMap;

use crate::error::{Clause, PlanError, PlanResult};
use crate::query::{
    map_parts, BooleanExpr, BoundSource, Combination, Cte, CteQuery, DistinctExpr, Expr,
    FragmentPart, FromExpr, GroupByExpr, JoinExpr, LockExpr, OrderByExpr, OrderByItem, QueryExpr,
    SelectExpr, Source, UpdateExpr, UpdateOp, Value, WindowDef,
};
use crate::types::FieldType;

use super::assoc::Bindings;
use super::{combine, BoundParameter, Operation, PlanContext};

const READ_ORDER: &[Clause] = &[
    Clause::WithCte,
    Clause::Distinct,
    Clause::Select,
    Clause::From,
    Clause::Join,
    Clause::Where,
    Clause::GroupBy,
    Clause::Having,
    Clause::Windows,
    Clause::Combination,
    Clause::OrderBy,
    Clause::Limit,
    Clause::Offset,
    Clause::Lock,
    Clause::Update,
];

const WRITE_ORDER: &[Clause] = &[
    Clause::WithCte,
    Clause::Update,
    Clause::From,
    Clause::Join,
    Clause::Where,
    Clause::Distinct,
    Clause::Select,
    Clause::GroupBy,
    Clause::Having,
    Clause::Windows,
    Clause::Combination,
    Clause::OrderBy,
    Clause::Limit,
    Clause::Offset,
    Clause::Lock,
];

/// Extract the parameters of one query level into `params` and return the
/// planned tree.
pub(super) fn extract(
    ctx: &PlanContext<'_>,
    query: &QueryExpr,
    bindings: Bindings,
    params: &mut Vec<BoundParameter>,
) -> PlanResult<QueryExpr> {
    let Bindings {
        joins,
        sources,
        conditions,
    } = bindings;

    let mut planned = Extractor {
        ctx,
        query,
        sources: &sources,
        conditions: &conditions,
        params,
        clause: Clause::From,
        current: String::new(),
    }
    .run(&joins)?;

    planned.sources = sources;
    Ok(planned)
}

struct Extractor<'c, 'a> {
    ctx: &'c PlanContext<'a>,
    query: &'c QueryExpr,
    sources: &'c [BoundSource],
    /// User conditions of association joins, by final-hop binding.
    conditions: &'c HashMap<usize, Expr>,
    params: &'c mut Vec<BoundParameter>,
    /// Clause being visited.
    clause: Clause,
    /// Rendered top-level expression being visited, for error messages.
    current: String,
}

impl<'c, 'a> Extractor<'c, 'a> {
    fn run(&mut self, joins: &[JoinExpr]) -> PlanResult<QueryExpr> {
        let query = self.query;
        let mut out = QueryExpr {
            prefix: query.prefix.clone(),
            preloads: query.preloads.clone(),
            ..QueryExpr::default()
        };

        let order = match self.ctx.operation {
            Operation::All => READ_ORDER,
            Operation::UpdateAll | Operation::DeleteAll => WRITE_ORDER,
        };

        for &clause in order {
            self.clause = clause;
            match clause {
                Clause::WithCte => {
                    out.with_ctes = query
                        .with_ctes
                        .iter()
                        .map(|cte| self.cte(cte))
                        .collect::<PlanResult<_>>()?;
                }
                Clause::Distinct => {
                    out.distinct = match &query.distinct {
                        Some(DistinctExpr::All) => Some(DistinctExpr::All),
                        Some(DistinctExpr::On(items)) => {
                            Some(DistinctExpr::On(self.order_items(items)?))
                        }
                        None => None,
                    };
                }
                Clause::Select => {
                    if let Some(select) = &query.select {
                        out.select = Some(SelectExpr::new(self.top(&select.expr, &FieldType::Any)?));
                    }
                }
                Clause::From => {
                    if let Some(from) = &query.from {
                        out.from = Some(FromExpr {
                            source: self.source(&from.source)?,
                            prefix: from.prefix.clone(),
                        });
                    }
                }
                Clause::Join => {
                    out.joins = joins
                        .iter()
                        .map(|join| self.join(join))
                        .collect::<PlanResult<_>>()?;
                }
                Clause::Where => out.wheres = self.booleans(&query.wheres)?,
                Clause::GroupBy => {
                    out.group_bys = query
                        .group_bys
                        .iter()
                        .map(|group| self.group_by(group))
                        .collect::<PlanResult<_>>()?;
                }
                Clause::Having => out.havings = self.booleans(&query.havings)?,
                Clause::Windows => {
                    out.windows = query
                        .windows
                        .iter()
                        .map(|(name, def)| Ok((name.clone(), self.window(def)?)))
                        .collect::<PlanResult<_>>()?;
                }
                Clause::Combination => {
                    out.combinations = query
                        .combinations
                        .iter()
                        .map(|c| {
                            Ok(Combination {
                                op: c.op,
                                query: self.nested(&c.query)?,
                            })
                        })
                        .collect::<PlanResult<_>>()?;
                }
                Clause::OrderBy => {
                    out.order_bys = query
                        .order_bys
                        .iter()
                        .map(|order| self.order_by(order))
                        .collect::<PlanResult<_>>()?;
                }
                Clause::Limit => {
                    out.limit = match &query.limit {
                        Some(e) => Some(self.top(e, &FieldType::Integer)?),
                        None => None,
                    };
                }
                Clause::Offset => {
                    out.offset = match &query.offset {
                        Some(e) => Some(self.top(e, &FieldType::Integer)?),
                        None => None,
                    };
                }
                Clause::Lock => {
                    out.lock = match &query.lock {
                        Some(LockExpr::Literal(text)) => Some(LockExpr::Literal(text.clone())),
                        Some(LockExpr::Fragment(parts)) => Some(LockExpr::Fragment(self.parts(parts)?)),
                        None => None,
                    };
                }
                Clause::Update => {
                    out.updates = query
                        .updates
                        .iter()
                        .map(|update| self.update(update))
                        .collect::<PlanResult<_>>()?;
                }
                Clause::Preload => {}
            }
        }

        Ok(out)
    }

    // =========================================================================
    // Clauses
    // =========================================================================

    fn nested(&mut self, query: &QueryExpr) -> PlanResult<QueryExpr> {
        combine::plan_nested(self.ctx, query, self.query.prefix.as_deref(), self.params)
    }

    fn cte(&mut self, cte: &Cte) -> PlanResult<Cte> {
        let query = match &cte.query {
            CteQuery::Query(q) => CteQuery::Query(Box::new(self.nested(q)?)),
            CteQuery::Fragment(parts) => CteQuery::Fragment(self.parts(parts)?),
        };
        Ok(Cte {
            name: cte.name.clone(),
            query,
            recursive: cte.recursive,
        })
    }

    fn source(&mut self, source: &Source) -> PlanResult<Source> {
        Ok(match source {
            Source::Subquery(q) => Source::Subquery(Box::new(self.nested(q)?)),
            Source::Fragment(parts) => Source::Fragment(self.parts(parts)?),
            Source::Table(_) | Source::SchemaTable { .. } => source.clone(),
        })
    }

    fn join(&mut self, join: &JoinExpr) -> PlanResult<JoinExpr> {
        let source = match &join.source {
            Some(source) => Some(self.source(source)?),
            None => None,
        };
        // Keyword conditions in `on` address the joined binding itself.
        let binding = join.ix.unwrap_or(0);
        let on = match &join.on {
            Some(on) => Some(self.condition(on, binding)?),
            None => None,
        };
        let user = match self.conditions.get(&binding) {
            Some(on) => Some(self.condition(on, binding)?),
            None => None,
        };
        let on = Expr::and_opt(on, user);
        Ok(JoinExpr {
            source,
            on,
            ..join.clone()
        })
    }

    fn booleans(&mut self, clause: &[BooleanExpr]) -> PlanResult<Vec<BooleanExpr>> {
        clause
            .iter()
            .map(|b| {
                Ok(BooleanExpr {
                    op: b.op,
                    expr: self.condition(&b.expr, 0)?,
                })
            })
            .collect()
    }

    fn group_by(&mut self, group: &GroupByExpr) -> PlanResult<GroupByExpr> {
        Ok(match group {
            GroupByExpr::Exprs(exprs) => GroupByExpr::Exprs(
                exprs
                    .iter()
                    .map(|e| self.top(e, &FieldType::Any))
                    .collect::<PlanResult<_>>()?,
            ),
            GroupByExpr::Pinned(fields) => GroupByExpr::Exprs(
                fields
                    .iter()
                    .map(|name| Expr::Field {
                        binding: 0,
                        name: name.clone(),
                    })
                    .collect(),
            ),
        })
    }

    fn order_by(&mut self, order: &OrderByExpr) -> PlanResult<OrderByExpr> {
        Ok(match order {
            OrderByExpr::Items(items) => OrderByExpr::Items(self.order_items(items)?),
            OrderByExpr::Pinned(fields) => OrderByExpr::Items(
                fields
                    .iter()
                    .map(|(dir, name)| OrderByItem {
                        dir: *dir,
                        expr: Expr::Field {
                            binding: 0,
                            name: name.clone(),
                        },
                    })
                    .collect(),
            ),
        })
    }

    fn order_items(&mut self, items: &[OrderByItem]) -> PlanResult<Vec<OrderByItem>> {
        items
            .iter()
            .map(|item| {
                Ok(OrderByItem {
                    dir: item.dir,
                    expr: self.top(&item.expr, &FieldType::Any)?,
                })
            })
            .collect()
    }

    fn window(&mut self, def: &WindowDef) -> PlanResult<WindowDef> {
        def.try_map(&mut |e| self.top(e, &FieldType::Any))
    }

    fn update(&mut self, update: &UpdateExpr) -> PlanResult<UpdateExpr> {
        let fields = update
            .fields
            .iter()
            .map(|(name, e)| {
                self.current = format!("{}: [{}: {}]", update.op.as_str(), name, e);
                let ty = self.field_type(0, name)?;
                let ty = match update.op {
                    UpdateOp::Set | UpdateOp::Inc => ty,
                    UpdateOp::Push | UpdateOp::Pull => ty.element().cloned().unwrap_or(FieldType::Any),
                };
                Ok((name.clone(), self.expr(e, &ty)?))
            })
            .collect::<PlanResult<_>>()?;
        Ok(UpdateExpr {
            op: update.op,
            fields,
        })
    }

    fn parts(&mut self, parts: &[FragmentPart]) -> PlanResult<Vec<FragmentPart>> {
        self.current = Expr::Fragment(parts.to_vec()).to_string();
        map_parts(parts, &mut |e| self.expr(e, &FieldType::Any))
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    /// A top-level clause expression.
    fn top(&mut self, e: &Expr, expected: &FieldType) -> PlanResult<Expr> {
        self.current = e.to_string();
        self.expr(e, expected)
    }

    /// A boolean clause expression: the only place where interpolated
    /// expressions and keyword lists are accepted.
    fn condition(&mut self, e: &Expr, keyword_binding: usize) -> PlanResult<Expr> {
        self.current = e.to_string();
        match e {
            Expr::Dynamic(inner) => self.expr(inner, &FieldType::Boolean),
            Expr::PinKeyword(pairs) => self.keyword(pairs, keyword_binding),
            _ => self.expr(e, &FieldType::Boolean),
        }
    }

    /// Expand `^[k: v, ...]` into `&b.k == ?` tests joined by `and`.
    fn keyword(&mut self, pairs: &[(String, Value)], binding: usize) -> PlanResult<Expr> {
        let mut result: Option<Expr> = None;
        for (name, value) in pairs {
            let ty = self.field_type(binding, name)?;
            if value.is_null() {
                return Err(self.cast_error(value, &ty));
            }
            let param = self.bind(value, &ty)?;
            let test = Expr::Field {
                binding,
                name: name.clone(),
            }
            .eq(param);
            result = Expr::and_opt(result, Some(test));
        }
        Ok(result.unwrap_or(Expr::Literal(Value::Bool(true))))
    }

    fn expr(&mut self, e: &Expr, expected: &FieldType) -> PlanResult<Expr> {
        match e {
            Expr::Pin(value) => self.bind(value, expected),

            Expr::Dynamic(_) | Expr::PinKeyword(_) => Err(PlanError::structure(
                self.clause,
                &self.current,
                "interpolated expressions and keyword lists are only allowed as a whole \
                 `where`, `having` or `on` expression",
            )),

            Expr::Binary { op, left, right } => {
                let (left_ty, right_ty) = if op.is_logical() {
                    (FieldType::Boolean, FieldType::Boolean)
                } else {
                    let fallback = if op.is_arithmetic() {
                        expected.clone()
                    } else {
                        FieldType::Any
                    };
                    (
                        self.operand_type(left, right, &fallback)?,
                        self.operand_type(right, left, &fallback)?,
                    )
                };

                // Comparisons with nil must be written with is_nil/1.
                if op.is_comparison() {
                    for (side, ty) in [(left, &left_ty), (right, &right_ty)] {
                        if matches!(**side, Expr::Pin(Value::Null)) {
                            return Err(self.cast_error(&Value::Null, ty));
                        }
                    }
                }

                Ok(Expr::Binary {
                    op: *op,
                    left: Box::new(self.expr(left, &left_ty)?),
                    right: Box::new(self.expr(right, &right_ty)?),
                })
            }

            Expr::In { left, right } => self.membership(left, right),

            Expr::Not(inner) => Ok(Expr::Not(Box::new(self.expr(inner, &FieldType::Boolean)?))),

            Expr::Typed { expr, ty } => Ok(Expr::Typed {
                expr: Box::new(self.expr(expr, ty)?),
                ty: ty.clone(),
            }),

            Expr::List(items) => {
                let element = expected.element().cloned().unwrap_or_else(|| expected.clone());
                Ok(Expr::List(
                    items
                        .iter()
                        .map(|item| self.expr(item, &element))
                        .collect::<PlanResult<_>>()?,
                ))
            }

            Expr::SelectedAs { expr, name } => Ok(Expr::SelectedAs {
                expr: Box::new(self.expr(expr, expected)?),
                name: name.clone(),
            }),

            _ => e.try_map_children(&mut |child| self.expr(child, &FieldType::Any)),
        }
    }

    /// `left in right`, in its three shapes: a pinned collection, a list
    /// literal with pinned elements, or any other expression.
    fn membership(&mut self, left: &Expr, right: &Expr) -> PlanResult<Expr> {
        let element = if needs_type(right) {
            self.infer(left)?
        } else {
            FieldType::Any
        };
        // `^value in &0.tags` takes the array's element type.
        let left_ty = if needs_type(left) {
            self.infer(right)?.element().cloned().unwrap_or(FieldType::Any)
        } else {
            FieldType::Any
        };

        let left = self.expr(left, &left_ty)?;
        let right = match right {
            Expr::Pin(Value::List(values)) => {
                let start = self.params.len();
                for value in values {
                    self.bind(value, &element)?;
                }
                Expr::ParamRange {
                    start,
                    len: values.len(),
                }
            }
            Expr::Pin(value) => return Err(self.cast_error(value, &FieldType::array(element))),
            Expr::List(items) => Expr::List(
                items
                    .iter()
                    .map(|item| self.expr(item, &element))
                    .collect::<PlanResult<_>>()?,
            ),
            other => self.expr(other, &FieldType::Any)?,
        };

        Ok(Expr::In {
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    /// Expected type of `side` given the other operand.
    fn operand_type(&self, side: &Expr, other: &Expr, fallback: &FieldType) -> PlanResult<FieldType> {
        if !needs_type(side) {
            return Ok(FieldType::Any);
        }
        let ty = self.infer(other)?;
        Ok(if ty.is_any() { fallback.clone() } else { ty })
    }

    /// Type an expression evaluates to, as far as the schema tells.
    fn infer(&self, e: &Expr) -> PlanResult<FieldType> {
        Ok(match e {
            Expr::Field { binding, name } => self.field_type(*binding, name)?,
            Expr::Typed { ty, .. } => ty.clone(),
            Expr::Literal(value) => FieldType::of_value(value),
            Expr::Call { name, .. } if name == "count" => FieldType::Integer,
            Expr::Binary { op, left, right } if op.is_arithmetic() => {
                let ty = self.infer(left)?;
                if ty.is_any() {
                    self.infer(right)?
                } else {
                    ty
                }
            }
            Expr::Binary { .. } | Expr::Not(_) | Expr::IsNil(_) | Expr::In { .. } => {
                FieldType::Boolean
            }
            Expr::SelectedAs { expr, .. } => self.infer(expr)?,
            _ => FieldType::Any,
        })
    }

    /// Declared type of a field. Sources without a schema are untyped.
    fn field_type(&self, binding: usize, name: &str) -> PlanResult<FieldType> {
        match self.sources.get(binding) {
            Some(BoundSource::Table {
                schema: Some(schema),
                ..
            }) => {
                let meta = self.ctx.schema(schema, self.clause, &self.current)?;
                meta.field_def(name).map(|f| f.ty.clone()).ok_or_else(|| {
                    PlanError::structure(
                        self.clause,
                        &self.current,
                        format!("field `{}` does not exist in schema `{}`", name, schema),
                    )
                })
            }
            Some(_) => Ok(FieldType::Any),
            None => Err(PlanError::structure(
                self.clause,
                &self.current,
                format!("unknown binding &{}", binding),
            )),
        }
    }

    /// Cast and dump `value`, append it and return its placeholder.
    fn bind(&mut self, value: &Value, ty: &FieldType) -> PlanResult<Expr> {
        let cast = self
            .ctx
            .types
            .cast(ty, value)
            .map_err(|_| self.cast_error(value, ty))?;
        let dumped = self.ctx.types.dump(ty, &cast).map_err(|_| PlanError::Dump {
            clause: self.clause,
            expr: self.current.clone(),
            value: value.to_string(),
            ty: ty.to_string(),
            operation: self.ctx.operation.to_string(),
        })?;

        let ix = self.params.len();
        self.params.push(BoundParameter {
            value: dumped,
            ty: ty.clone(),
            clause: self.clause,
        });
        Ok(Expr::Param(ix))
    }

    fn cast_error(&self, value: &Value, ty: &FieldType) -> PlanError {
        PlanError::Cast {
            clause: self.clause,
            expr: self.current.clone(),
            value: value.to_string(),
            ty: ty.to_string(),
        }
    }
}

/// Whether an operand holds interpolated values that need a type.
fn needs_type(e: &Expr) -> bool {
    e.any(&|x| matches!(x, Expr::Pin(_)))
}
