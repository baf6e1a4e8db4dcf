//! Select expansion.
//!
//! Turns the `select` clause into a flat list of projected expressions and
//! describes how the caller should materialize rows from them.

use std::collections::HashSet;

use crate::error::{Clause, PlanError, PlanResult};
use crate::query::{BoundSource, Expr, Preload, QueryExpr, SelectExpr, Source, Take};
use crate::schema::Schema;

use super::PlanContext;

/// Shape of the rows a query returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectShape {
    /// Schema structs built from a binding's fields.
    Struct { binding: usize, schema: String },
    /// Maps built from a binding's fields.
    Map { binding: usize },
    /// Any other expression.
    Expr,
}

/// Fields loaded for an association preloaded from a join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssocSelect {
    /// Association names from the root schema.
    pub path: Vec<String>,
    pub binding: usize,
    pub schema: String,
    pub fields: Vec<String>,
}

/// What the normalizer resolved about the selection.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectMetadata {
    /// Projected expressions, in order.
    pub fields: Vec<Expr>,
    pub shape: SelectShape,
    /// Joined preloads and the fields projected for them.
    pub assocs: Vec<AssocSelect>,
    /// Every preload path, depth first.
    pub preloads: Vec<Vec<String>>,
}

/// Expand `query.select` in place.
pub(super) fn expand(ctx: &PlanContext<'_>, query: &mut QueryExpr) -> PlanResult<SelectMetadata> {
    let (expr, explicit) = match &query.select {
        Some(select) => (select.expr.clone(), true),
        None => (Expr::Binding(0), false),
    };

    let mut expander = Expander {
        ctx,
        query: &*query,
        current: expr.to_string(),
        fields: Vec::new(),
        assocs: Vec::new(),
        covered: HashSet::new(),
    };

    if !explicit && expander.schema_at(0).is_none() && !expander.is_subquery(0) {
        return Err(PlanError::structure(
            Clause::Select,
            "nil",
            "a query without `select` must have a schema-backed or subquery source",
        ));
    }

    expander.flatten(&expr)?;

    if selects_root(&expr) {
        let mut path = Vec::new();
        expander.joined_preloads(&query.preloads, &mut path)?;
    }

    let shape = expander.shape(&expr);
    let Expander { fields, assocs, .. } = expander;

    let mut preloads = Vec::new();
    preload_paths(&query.preloads, &mut Vec::new(), &mut preloads);

    query.select = Some(SelectExpr {
        expr,
        fields: fields.clone(),
    });

    Ok(SelectMetadata {
        fields,
        shape,
        assocs,
        preloads,
    })
}

/// Whether the selection includes binding 0 as a whole.
pub(super) fn selects_root(expr: &Expr) -> bool {
    expr.any(&|e| {
        matches!(
            e,
            Expr::Binding(0) | Expr::Struct { binding: 0, .. } | Expr::MapOf { binding: 0, .. }
        )
    })
}

/// Names a planned and normalized subquery exposes to its parent.
fn subquery_fields(query: &QueryExpr) -> Vec<String> {
    let Some(select) = &query.select else {
        return Vec::new();
    };
    select
        .fields
        .iter()
        .filter_map(|e| match e {
            Expr::Field { name, .. } => Some(name.clone()),
            Expr::SelectedAs { name, .. } => Some(name.clone()),
            _ => None,
        })
        .collect()
}

fn preload_paths(preloads: &[Preload], path: &mut Vec<String>, out: &mut Vec<Vec<String>>) {
    for preload in preloads {
        path.push(preload.assoc.clone());
        out.push(path.clone());
        preload_paths(&preload.children, path, out);
        path.pop();
    }
}

struct Expander<'c, 'a> {
    ctx: &'c PlanContext<'a>,
    query: &'c QueryExpr,
    current: String,
    fields: Vec<Expr>,
    assocs: Vec<AssocSelect>,
    /// Bindings whose fields were already chosen by a `struct/2` take.
    covered: HashSet<usize>,
}

impl<'c, 'a> Expander<'c, 'a> {
    fn schema_at(&self, binding: usize) -> Option<&'a Schema> {
        match self.query.sources.get(binding) {
            Some(BoundSource::Table {
                schema: Some(name),
                ..
            }) => self.ctx.registry.lookup(name),
            _ => None,
        }
    }

    fn is_subquery(&self, binding: usize) -> bool {
        matches!(self.query.sources.get(binding), Some(BoundSource::Subquery))
    }

    /// The nested query bound at `binding`, if it is a subquery.
    fn subquery_at(&self, binding: usize) -> Option<&'c QueryExpr> {
        let source = if binding == 0 {
            self.query.from.as_ref().map(|f| &f.source)
        } else {
            self.query
                .joins
                .iter()
                .find(|j| j.ix == Some(binding))
                .and_then(|j| j.source.as_ref())
        };
        match source {
            Some(Source::Subquery(q)) => Some(q),
            _ => None,
        }
    }

    fn error(&self, message: impl Into<String>) -> PlanError {
        PlanError::structure(Clause::Select, &self.current, message)
    }

    fn push_fields(&mut self, binding: usize, names: &[String]) {
        self.fields.extend(names.iter().map(|name| Expr::Field {
            binding,
            name: name.clone(),
        }));
    }

    /// Every loadable field of a whole binding.
    fn binding_fields(&self, binding: usize) -> PlanResult<Vec<String>> {
        if let Some(schema) = self.schema_at(binding) {
            return Ok(schema.load_fields().map(|f| f.name.clone()).collect());
        }
        if let Some(sub) = self.subquery_at(binding) {
            return Ok(subquery_fields(sub));
        }
        Err(self.error(format!(
            "binding &{} has no schema; select its fields explicitly or with map/2",
            binding
        )))
    }

    fn flatten(&mut self, e: &Expr) -> PlanResult<()> {
        let preloads: &'c [Preload] = &self.query.preloads;
        match e {
            Expr::Binding(binding) => {
                let names = self.binding_fields(*binding)?;
                self.push_fields(*binding, &names);
            }
            Expr::Struct { binding, take } => {
                let schema = self.schema_at(*binding).ok_or_else(|| {
                    self.error(format!(
                        "struct/2 in select expects binding &{} to have a schema",
                        binding
                    ))
                })?;
                self.take(*binding, schema, take, preloads, &mut Vec::new())?;
            }
            Expr::MapOf { binding, take } => match self.schema_at(*binding) {
                Some(schema) => {
                    self.take(*binding, schema, take, preloads, &mut Vec::new())?;
                }
                None if take.is_empty() => {
                    let names = self.binding_fields(*binding)?;
                    self.push_fields(*binding, &names);
                }
                None => {
                    let mut names = Vec::new();
                    for t in take {
                        match t {
                            Take::Field(name) => names.push(name.clone()),
                            Take::Assoc(name, _) => {
                                return Err(self.error(format!(
                                    "map/2 cannot load association `{}` from binding &{} without a schema",
                                    name, binding
                                )))
                            }
                        }
                    }
                    self.push_fields(*binding, &names);
                }
            },
            Expr::Map(entries) => {
                for (_, value) in entries {
                    self.flatten(value)?;
                }
            }
            Expr::Tuple(items) | Expr::List(items) => {
                for item in items {
                    self.flatten(item)?;
                }
            }
            other => self.fields.push(other.clone()),
        }
        Ok(())
    }

    /// Fields named by a `struct/2` or `map/2` take on a schema-backed
    /// binding. Association takes pull in the fields of the matching joined
    /// preload.
    fn take(
        &mut self,
        binding: usize,
        schema: &'a Schema,
        take: &[Take],
        preloads: &'c [Preload],
        path: &mut Vec<String>,
    ) -> PlanResult<Vec<String>> {
        let mut names = Vec::new();
        for t in take {
            if let Take::Field(name) = t {
                match schema.field_def(name) {
                    Some(def) if !def.is_virtual => names.push(name.clone()),
                    Some(_) => {
                        return Err(self.error(format!(
                            "field `{}` is virtual in schema `{}`",
                            name, schema.name
                        )))
                    }
                    None => {
                        return Err(self.error(format!(
                            "field `{}` does not exist in schema `{}`",
                            name, schema.name
                        )))
                    }
                }
            }
        }
        if names.is_empty() {
            names = schema.load_fields().map(|f| f.name.clone()).collect();
        }
        self.push_fields(binding, &names);

        for t in take {
            let Take::Assoc(assoc, nested) = t else {
                continue;
            };
            let preload = preloads
                .iter()
                .find(|p| p.assoc == *assoc && p.binding.is_some());
            let (Some(preload), Some(assoc_binding)) = (preload, preload.and_then(|p| p.binding))
            else {
                return Err(self.error(format!(
                    "association `{}` in select must be preloaded from a join",
                    assoc
                )));
            };
            let assoc_schema = self.schema_at(assoc_binding).ok_or_else(|| {
                self.error(format!("binding &{} has no schema", assoc_binding))
            })?;

            path.push(assoc.clone());
            let fields = self.take(assoc_binding, assoc_schema, nested, &preload.children, path)?;
            self.covered.insert(assoc_binding);
            self.assocs.push(AssocSelect {
                path: path.clone(),
                binding: assoc_binding,
                schema: assoc_schema.name.clone(),
                fields,
            });
            path.pop();
        }

        Ok(names)
    }

    /// Project every joined preload not already covered by a take.
    fn joined_preloads(&mut self, preloads: &'c [Preload], path: &mut Vec<String>) -> PlanResult<()> {
        for preload in preloads {
            path.push(preload.assoc.clone());
            if let Some(binding) = preload.binding {
                if !self.covered.contains(&binding) {
                    let schema = self.schema_at(binding).ok_or_else(|| {
                        PlanError::structure(
                            Clause::Preload,
                            path.join("."),
                            format!("binding &{} has no schema", binding),
                        )
                    })?;
                    let fields: Vec<String> = schema.load_fields().map(|f| f.name.clone()).collect();
                    self.push_fields(binding, &fields);
                    self.covered.insert(binding);
                    self.assocs.push(AssocSelect {
                        path: path.clone(),
                        binding,
                        schema: schema.name.clone(),
                        fields,
                    });
                }
            }
            self.joined_preloads(&preload.children, path)?;
            path.pop();
        }
        Ok(())
    }

    fn shape(&self, expr: &Expr) -> SelectShape {
        match expr {
            Expr::Binding(binding) | Expr::Struct { binding, .. } => match self.schema_at(*binding) {
                Some(schema) => SelectShape::Struct {
                    binding: *binding,
                    schema: schema.name.clone(),
                },
                None => SelectShape::Map { binding: *binding },
            },
            Expr::MapOf { binding, .. } => SelectShape::Map { binding: *binding },
            _ => SelectShape::Expr,
        }
    }
}
