//! Normalization of a planned query.
//!
//! Checks that the query is legal for the requested operation, validates
//! every field reference against its binding, dumps literals compared to
//! typed fields, validates preloads and finally expands the selection.

use std::collections::HashSet;
use std::fmt;

use crate::error::{Clause, PlanError, PlanResult};
use crate::query::{
    map_parts, BinaryOp, BoundSource, DistinctExpr, Expr, FragmentPart, GroupByExpr, JoinExpr,
    LockExpr, OrderByExpr, OrderByItem, Preload, QueryExpr, Source, UpdateOp, Value, WindowRef,
};
use crate::schema::{AssocKind, Related, Schema};
use crate::types::FieldType;

use super::{combine, select, Operation, PlanContext, SelectMetadata, SelectShape};

/// Upper bound on nested `through` hops before a chain is treated as cyclic.
const MAX_THROUGH_DEPTH: usize = 32;

pub(super) fn normalize(
    ctx: &PlanContext<'_>,
    planned: &QueryExpr,
) -> PlanResult<(QueryExpr, SelectMetadata)> {
    if planned.sources.is_empty() {
        return Err(PlanError::structure(
            Clause::From,
            "nil",
            "query must be planned before it is normalized",
        ));
    }

    check_operation(ctx.operation, planned)?;
    combine::check_order_by(planned)?;

    let mut query = planned.clone();
    combine::normalize_nested(ctx, &mut query)?;

    let checked = {
        let mut checker = Checker::new(ctx, &query);
        checker.run()?
    };
    query = checked;

    check_preloads(ctx, &query)?;

    // Bulk writes project no rows.
    let metadata = match ctx.operation {
        Operation::All => select::expand(ctx, &mut query)?,
        Operation::UpdateAll | Operation::DeleteAll => SelectMetadata {
            fields: Vec::new(),
            shape: SelectShape::Expr,
            assocs: Vec::new(),
            preloads: Vec::new(),
        },
    };

    query
        .order_bys
        .retain(|o| !matches!(o, OrderByExpr::Items(items) if items.is_empty()));
    query
        .group_bys
        .retain(|g| !matches!(g, GroupByExpr::Exprs(exprs) if exprs.is_empty()));

    tracing::trace!(
        operation = %ctx.operation,
        fields = metadata.fields.len(),
        assocs = metadata.assocs.len(),
        "normalized query"
    );

    Ok((query, metadata))
}

fn check_operation(operation: Operation, query: &QueryExpr) -> PlanResult<()> {
    match operation {
        Operation::All => {
            if let Some(update) = query.updates.first() {
                return Err(PlanError::structure(
                    Clause::Update,
                    update.op.as_str(),
                    "`all` does not allow `update` expressions",
                ));
            }
        }
        Operation::DeleteAll => {
            if let Some(update) = query.updates.first() {
                return Err(PlanError::structure(
                    Clause::Update,
                    update.op.as_str(),
                    "`delete_all` does not allow `update` expressions",
                ));
            }
            only_filters(operation, query)?;
        }
        Operation::UpdateAll => {
            if query.updates.iter().all(|u| u.fields.is_empty()) {
                return Err(PlanError::structure(
                    Clause::Update,
                    "[]",
                    "`update_all` requires at least one field to be updated",
                ));
            }
            let mut seen = HashSet::new();
            for update in &query.updates {
                for (name, _) in &update.fields {
                    if !seen.insert(name.as_str()) {
                        return Err(PlanError::structure(
                            Clause::Update,
                            name,
                            format!("field `{}` is updated more than once", name),
                        ));
                    }
                }
            }
            only_filters(operation, query)?;
        }
    }
    Ok(())
}

/// Bulk operations take only `with_cte`, `where` and `join` on top of the
/// source (and `update` for `update_all`).
fn only_filters(operation: Operation, query: &QueryExpr) -> PlanResult<()> {
    let present = [
        (Clause::Distinct, query.distinct.is_some()),
        (Clause::Select, query.select.is_some()),
        (Clause::GroupBy, !query.group_bys.is_empty()),
        (Clause::Having, !query.havings.is_empty()),
        (Clause::Windows, !query.windows.is_empty()),
        (Clause::Combination, !query.combinations.is_empty()),
        (Clause::OrderBy, !query.order_bys.is_empty()),
        (Clause::Limit, query.limit.is_some()),
        (Clause::Offset, query.offset.is_some()),
        (Clause::Lock, query.lock.is_some()),
        (Clause::Preload, !query.preloads.is_empty()),
    ];

    match present.iter().find(|(_, is_set)| *is_set) {
        Some((clause, _)) => Err(PlanError::structure(
            *clause,
            clause.as_str(),
            format!(
                "`{}` allows only `with_cte`, `where` and `join` expressions",
                operation
            ),
        )),
        None => Ok(()),
    }
}

/// Validates references and dumps literals, clause by clause.
struct Checker<'c, 'a> {
    ctx: &'c PlanContext<'a>,
    query: &'c QueryExpr,
    windows: HashSet<&'c str>,
    aliases: HashSet<&'c str>,
    clause: Clause,
    current: String,
}

impl<'c, 'a> Checker<'c, 'a> {
    fn new(ctx: &'c PlanContext<'a>, query: &'c QueryExpr) -> Self {
        let mut aliases = HashSet::new();
        if let Some(select) = &query.select {
            select.expr.walk(&mut |e| {
                if let Expr::SelectedAs { name, .. } = e {
                    aliases.insert(name.as_str());
                }
            });
        }

        Self {
            ctx,
            query,
            windows: query.windows.iter().map(|(name, _)| name.as_str()).collect(),
            aliases,
            clause: Clause::From,
            current: String::new(),
        }
    }

    fn enter(&mut self, clause: Clause, current: impl fmt::Display) {
        self.clause = clause;
        self.current = current.to_string();
    }

    fn error(&self, message: impl Into<String>) -> PlanError {
        PlanError::structure(self.clause, &self.current, message)
    }

    fn run(&mut self) -> PlanResult<QueryExpr> {
        let query = self.query;
        let mut out = query.clone();

        if let Some(from) = &query.from {
            if let Source::Fragment(parts) = &from.source {
                self.enter(Clause::From, &from.source);
                let parts = self.parts(parts)?;
                if let Some(checked) = &mut out.from {
                    checked.source = Source::Fragment(parts);
                }
            }
        }

        out.joins = query
            .joins
            .iter()
            .map(|join| self.join(join))
            .collect::<PlanResult<_>>()?;

        if let Some(select) = &mut out.select {
            self.enter(Clause::Select, &select.expr);
            select.expr = self.check(&select.expr)?;
        }

        if let Some(DistinctExpr::On(items)) = &query.distinct {
            out.distinct = Some(DistinctExpr::On(self.items(Clause::Distinct, items)?));
        }

        for (clause, source, target) in [
            (Clause::Where, &query.wheres, &mut out.wheres),
            (Clause::Having, &query.havings, &mut out.havings),
        ] {
            for (entry, checked) in source.iter().zip(target.iter_mut()) {
                self.enter(clause, &entry.expr);
                checked.expr = self.check(&entry.expr)?;
            }
        }

        for (group, checked) in query.group_bys.iter().zip(out.group_bys.iter_mut()) {
            if let GroupByExpr::Exprs(exprs) = group {
                let mut mapped = Vec::with_capacity(exprs.len());
                for e in exprs {
                    self.enter(Clause::GroupBy, e);
                    mapped.push(self.check(e)?);
                }
                *checked = GroupByExpr::Exprs(mapped);
            }
        }

        for ((name, def), checked) in query.windows.iter().zip(out.windows.iter_mut()) {
            self.enter(Clause::Windows, name);
            checked.1 = def.try_map(&mut |e| self.check(e))?;
        }

        for (order, checked) in query.order_bys.iter().zip(out.order_bys.iter_mut()) {
            if let OrderByExpr::Items(items) = order {
                *checked = OrderByExpr::Items(self.items(Clause::OrderBy, items)?);
            }
        }

        for (clause, source, target) in [
            (Clause::Limit, &query.limit, &mut out.limit),
            (Clause::Offset, &query.offset, &mut out.offset),
        ] {
            if let Some(e) = source {
                self.enter(clause, e);
                *target = Some(self.check(e)?);
            }
        }

        if let Some(LockExpr::Fragment(parts)) = &query.lock {
            self.enter(Clause::Lock, "fragment");
            out.lock = Some(LockExpr::Fragment(self.parts(parts)?));
        }

        for (update, checked) in query.updates.iter().zip(out.updates.iter_mut()) {
            for ((name, value), target) in update.fields.iter().zip(checked.fields.iter_mut()) {
                self.enter(Clause::Update, format_args!("{}: {}", name, value));
                let ty = self.field(0, name)?;
                let expected = match update.op {
                    UpdateOp::Set | UpdateOp::Inc => ty,
                    UpdateOp::Push | UpdateOp::Pull => {
                        ty.and_then(|t| t.element().cloned())
                    }
                };
                target.1 = match (value, expected) {
                    (Expr::Literal(v), Some(ty)) => Expr::Literal(self.dump(v, &ty)?),
                    _ => self.check(value)?,
                };
            }
        }

        Ok(out)
    }

    fn join(&mut self, join: &JoinExpr) -> PlanResult<JoinExpr> {
        self.enter(Clause::Join, join);
        let mut checked = join.clone();
        if let Some(Source::Fragment(parts)) = &join.source {
            checked.source = Some(Source::Fragment(self.parts(parts)?));
        }
        if let Some(on) = &join.on {
            checked.on = Some(self.check(on)?);
        }
        Ok(checked)
    }

    fn items(&mut self, clause: Clause, items: &[OrderByItem]) -> PlanResult<Vec<OrderByItem>> {
        items
            .iter()
            .map(|item| {
                self.enter(clause, item);
                Ok(OrderByItem {
                    dir: item.dir,
                    expr: self.check(&item.expr)?,
                })
            })
            .collect()
    }

    fn parts(&mut self, parts: &[FragmentPart]) -> PlanResult<Vec<FragmentPart>> {
        map_parts(parts, &mut |e| self.check(e))
    }

    fn check(&mut self, e: &Expr) -> PlanResult<Expr> {
        match e {
            Expr::Field { binding, name } => {
                self.field(*binding, name)?;
                Ok(e.clone())
            }
            Expr::Binding(binding) | Expr::Struct { binding, .. } | Expr::MapOf { binding, .. } => {
                self.binding(*binding)?;
                Ok(e.clone())
            }
            Expr::SelectedRef(name) => {
                if !self.aliases.contains(name.as_str()) {
                    return Err(self.error(format!(
                        "`{}` is not a `selected_as` alias in `select`",
                        name
                    )));
                }
                Ok(e.clone())
            }
            Expr::Over {
                window: WindowRef::Named(name),
                ..
            } if !self.windows.contains(name.as_str()) => {
                Err(self.error(format!("unknown window `{}` given to `over`", name)))
            }
            Expr::Binary { op, left, right } if op.is_comparison() => {
                self.comparison(*op, left, right)
            }
            Expr::In { left, right } => match (&**left, &**right) {
                (Expr::Field { binding, name }, Expr::List(items)) => {
                    let ty = self.field(*binding, name)?;
                    let items = items
                        .iter()
                        .map(|item| match (item, &ty) {
                            (Expr::Literal(v), Some(ty)) => self.dump(v, ty).map(Expr::Literal),
                            _ => self.check(item),
                        })
                        .collect::<PlanResult<_>>()?;
                    Ok(Expr::In {
                        left: left.clone(),
                        right: Box::new(Expr::List(items)),
                    })
                }
                _ => e.try_map_children(&mut |child| self.check(child)),
            },
            _ => e.try_map_children(&mut |child| self.check(child)),
        }
    }

    /// `field op literal` in either order dumps the literal with the field's type.
    fn comparison(&mut self, op: BinaryOp, left: &Expr, right: &Expr) -> PlanResult<Expr> {
        let typed = |this: &mut Self, field: &Expr, other: &Expr| -> PlanResult<Option<Expr>> {
            let (Expr::Field { binding, name }, Expr::Literal(value)) = (field, other) else {
                return Ok(None);
            };
            match this.field(*binding, name)? {
                Some(ty) => Ok(Some(Expr::Literal(this.dump(value, &ty)?))),
                None => Ok(None),
            }
        };

        let left = match typed(self, right, left)? {
            Some(dumped) => dumped,
            None => self.check(left)?,
        };
        let right = match typed(self, &left, right)? {
            Some(dumped) => dumped,
            None => self.check(right)?,
        };

        Ok(Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    fn binding(&self, binding: usize) -> PlanResult<&'c BoundSource> {
        self.query
            .sources
            .get(binding)
            .ok_or_else(|| self.error(format!("unknown binding &{}", binding)))
    }

    /// Check a field reference. Returns its type when the binding has a schema.
    fn field(&self, binding: usize, name: &str) -> PlanResult<Option<FieldType>> {
        let BoundSource::Table {
            schema: Some(schema),
            ..
        } = self.binding(binding)?
        else {
            return Ok(None);
        };

        let meta = self.ctx.schema(schema, self.clause, &self.current)?;
        match meta.field_def(name) {
            Some(def) if def.is_virtual => Err(self.error(format!(
                "field `{}` in schema `{}` is virtual and cannot be used in queries",
                name, schema
            ))),
            Some(def) => Ok(Some(def.ty.clone())),
            None => Err(self.error(format!(
                "field `{}` does not exist in schema `{}`",
                name, schema
            ))),
        }
    }

    fn dump(&self, value: &Value, ty: &FieldType) -> PlanResult<Value> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        self.ctx.types.dump(ty, value).map_err(|_| PlanError::Dump {
            clause: self.clause,
            expr: self.current.clone(),
            value: value.to_string(),
            ty: ty.to_string(),
            operation: self.ctx.operation.to_string(),
        })
    }
}

fn check_preloads(ctx: &PlanContext<'_>, query: &QueryExpr) -> PlanResult<()> {
    let Some(first) = query.preloads.first() else {
        return Ok(());
    };

    if let Some(select) = &query.select {
        if !select::selects_root(&select.expr) {
            return Err(PlanError::structure(
                Clause::Preload,
                &first.assoc,
                "the binding used in `from` must be selected in `select` when using `preload`",
            ));
        }
    }

    let root = query
        .sources
        .first()
        .and_then(BoundSource::schema)
        .ok_or_else(|| {
            PlanError::structure(
                Clause::Preload,
                &first.assoc,
                "preloading requires a schema-backed source",
            )
        })?;
    let root = ctx.schema(root, Clause::Preload, &first.assoc)?;

    PreloadWalker { ctx, query }.walk(root, &query.preloads, &mut Vec::new())
}

struct PreloadWalker<'c, 'a> {
    ctx: &'c PlanContext<'a>,
    query: &'c QueryExpr,
}

impl<'c, 'a> PreloadWalker<'c, 'a> {
    fn walk(&self, schema: &'a Schema, preloads: &[Preload], path: &mut Vec<String>) -> PlanResult<()> {
        for preload in preloads {
            path.push(preload.assoc.clone());
            let rendered = path.join(".");
            let related = self.target(schema, &preload.assoc, &rendered, 0)?;

            if let Some(binding) = preload.binding {
                let bound = self.query.sources.get(binding).and_then(BoundSource::schema);
                let expected = related.map(|s| s.name.as_str());
                if bound.is_none() || bound != expected {
                    return Err(PlanError::structure(
                        Clause::Preload,
                        &rendered,
                        format!(
                            "association `{}` is preloaded from binding &{}, which does not hold schema `{}`",
                            preload.assoc,
                            binding,
                            expected.unwrap_or("nil")
                        ),
                    ));
                }
            }

            match related {
                Some(related) => self.walk(related, &preload.children, path)?,
                None if !preload.children.is_empty() => {
                    return Err(PlanError::structure(
                        Clause::Preload,
                        &rendered,
                        format!(
                            "cannot preload through `{}`: it targets a table without a schema",
                            preload.assoc
                        ),
                    ))
                }
                None => {}
            }
            path.pop();
        }
        Ok(())
    }

    /// Schema reached by association `name` on `schema`, following through
    /// chains. `None` when the target is a bare table.
    fn target(
        &self,
        schema: &'a Schema,
        name: &str,
        rendered: &str,
        depth: usize,
    ) -> PlanResult<Option<&'a Schema>> {
        if depth > MAX_THROUGH_DEPTH {
            return Err(PlanError::structure(
                Clause::Preload,
                rendered,
                format!("association `{}` forms a cyclic `through` chain", name),
            ));
        }

        let Some(assoc) = schema.association_def(name) else {
            let message = if schema.field_def(name).is_some() {
                format!("`{}` is a field of schema `{}`, not an association", name, schema.name)
            } else {
                format!("schema `{}` does not have association `{}`", schema.name, name)
            };
            return Err(PlanError::structure(Clause::Preload, rendered, message));
        };

        match &assoc.kind {
            AssocKind::Through(chain) => {
                let mut current = Some(schema);
                for hop in chain {
                    let Some(owner) = current else {
                        return Err(PlanError::structure(
                            Clause::Preload,
                            rendered,
                            format!("`through` hop `{}` starts from a table without a schema", hop),
                        ));
                    };
                    current = self.target(owner, hop, rendered, depth + 1)?;
                }
                Ok(current)
            }
            _ => match &assoc.related {
                Related::Schema(related) => {
                    self.ctx.schema(related, Clause::Preload, rendered).map(Some)
                }
                Related::Table(_) => Ok(None),
            },
        }
    }
}
