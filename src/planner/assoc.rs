//! Association resolver.
//!
//! Binding 0 is the `from` source and explicit joins take bindings `1..=n` in
//! declaration order. An association join may expand into several joins. The
//! final hop keeps the declared binding; every intermediate hop (through-chain
//! steps, many-to-many join-through tables) gets a fresh binding allocated after
//! all declared ones, in traversal order.
//!
//! Joins are emitted in traversal order, so a join only ever references
//! bindings introduced before it while binding indices stay stable for the
//! expressions that address them. A two-hop chain declared as join 1 executes
//! as `[2, 1]`.

use std::collections::HashMap;

use crate::error::{Clause, PlanError, PlanResult};
use crate::query::expr::fragment_parts;
use crate::query::{AssocRef, BoundSource, Expr, JoinExpr, Preload, QueryExpr, Source};
use crate::schema::{AssocFilter, AssocKind, AssociationDef, FilterCondition, Related, Schema};

use super::PlanContext;

/// Bound sources and expanded joins of one query level.
#[derive(Debug, Clone, PartialEq)]
pub struct Bindings {
    /// Joins in execution order, each with its binding index set.
    pub joins: Vec<JoinExpr>,
    /// Source of every binding, indexed by binding.
    pub sources: Vec<BoundSource>,
    /// The caller's own `on` of each association join, keyed by the binding
    /// of its final hop. It is ANDed onto that hop only after extraction, so a
    /// whole-`on` dynamic or keyword condition is still recognised as one.
    pub conditions: HashMap<usize, Expr>,
}

/// Bind the `from` source and every join, expanding association joins.
pub fn resolve(ctx: &PlanContext<'_>, query: &QueryExpr) -> PlanResult<Bindings> {
    let mut resolver = Resolver {
        ctx,
        query,
        sources: vec![None; 1 + query.joins.len()],
        joins: Vec::with_capacity(query.joins.len()),
        conditions: HashMap::new(),
        stack: Vec::new(),
    };

    resolver.bind_from()?;
    for (i, join) in query.joins.iter().enumerate() {
        resolver.bind_join(i + 1, join)?;
    }
    resolver.check_preloads(&query.preloads)?;
    resolver.finish()
}

struct Resolver<'c, 'a> {
    ctx: &'c PlanContext<'a>,
    query: &'c QueryExpr,
    sources: Vec<Option<BoundSource>>,
    joins: Vec<JoinExpr>,
    conditions: HashMap<usize, Expr>,
    /// (schema, association) pairs being expanded, for cycle detection.
    stack: Vec<(String, String)>,
}

impl<'c, 'a> Resolver<'c, 'a> {
    fn allocate(&mut self) -> usize {
        self.sources.push(None);
        self.sources.len() - 1
    }

    fn bind_from(&mut self) -> PlanResult<()> {
        let Some(from) = &self.query.from else {
            return Err(PlanError::structure(Clause::From, "nil", "a query must have a source"));
        };
        let bound = self.bind_source(&from.source, from.prefix.as_deref(), Clause::From)?;
        self.sources[0] = Some(bound);
        Ok(())
    }

    fn bind_source(
        &self,
        source: &Source,
        clause_prefix: Option<&str>,
        clause: Clause,
    ) -> PlanResult<BoundSource> {
        let query_prefix = self.query.prefix.as_deref();
        Ok(match source {
            Source::Table(table) => BoundSource::Table {
                table: table.clone(),
                schema: None,
                prefix: self.ctx.resolve_prefix(clause_prefix, None, query_prefix),
            },
            Source::SchemaTable { table, schema } => {
                let meta = self.ctx.schema(schema, clause, source)?;
                BoundSource::Table {
                    table: table.clone(),
                    schema: Some(schema.clone()),
                    prefix: self.ctx.resolve_prefix(clause_prefix, Some(meta), query_prefix),
                }
            }
            Source::Subquery(_) => BoundSource::Subquery,
            Source::Fragment(_) => BoundSource::Fragment,
        })
    }

    fn bind_join(&mut self, ix: usize, join: &JoinExpr) -> PlanResult<()> {
        let Some(AssocRef { parent, name }) = &join.assoc else {
            let source = join.source.as_ref().ok_or_else(|| {
                PlanError::structure(Clause::Join, join, "a join must have a source or an association")
            })?;
            let bound = self.bind_source(source, join.prefix.as_deref(), Clause::Join)?;
            self.sources[ix] = Some(bound);
            self.joins.push(JoinExpr {
                ix: Some(ix),
                ..join.clone()
            });
            return Ok(());
        };

        if *parent >= ix {
            return Err(PlanError::structure(
                Clause::Join,
                join,
                format!("binding &{} is not introduced before this join", parent),
            ));
        }

        let owner = self.schema_at(*parent, join)?;
        let def = owner.association_def(name).ok_or_else(|| {
            PlanError::structure(
                Clause::Join,
                join,
                format!("schema `{}` does not have association `{}`", owner.name, name),
            )
        })?;

        self.stack.clear();
        self.expand(join, *parent, owner, def, Some(ix))?;

        // The final hop keeps the declared binding and receives the user's
        // own condition during extraction.
        if let Some(on) = &join.on {
            self.conditions.insert(ix, on.clone());
        }
        Ok(())
    }

    /// Schema of an already bound binding.
    fn schema_at(&self, binding: usize, join: &JoinExpr) -> PlanResult<&'a Schema> {
        match self.sources.get(binding).and_then(|s| s.as_ref()) {
            Some(BoundSource::Table {
                schema: Some(schema),
                ..
            }) => self.ctx.schema(schema, Clause::Join, join),
            Some(_) => Err(PlanError::structure(
                Clause::Join,
                join,
                format!("binding &{} has no schema to resolve associations against", binding),
            )),
            None => Err(PlanError::structure(
                Clause::Join,
                join,
                format!("unknown binding &{}", binding),
            )),
        }
    }

    /// Expand one association hanging off `parent`, returning the binding of
    /// its target.
    fn expand(
        &mut self,
        join: &JoinExpr,
        parent: usize,
        owner: &'a Schema,
        def: &'a AssociationDef,
        target: Option<usize>,
    ) -> PlanResult<usize> {
        let key = (owner.name.clone(), def.name.clone());
        if self.stack.contains(&key) {
            return Err(PlanError::structure(
                Clause::Join,
                join,
                format!("association `{}` of schema `{}` is cyclic", def.name, owner.name),
            ));
        }
        self.stack.push(key);

        let ix = match &def.kind {
            AssocKind::Through(chain) => self.expand_through(join, parent, owner, def, chain, target)?,
            AssocKind::ManyToMany { .. } => self.expand_many_to_many(join, parent, def, target)?,
            AssocKind::BelongsTo | AssocKind::HasMany | AssocKind::HasOne => {
                let ix = target.unwrap_or_else(|| self.allocate());
                let on = field_of(ix, &def.related_key).eq(field_of(parent, &def.owner_key));
                self.push_hop(join, ix, parent, def, &def.related, on, &def.filters)?;
                ix
            }
        };

        self.stack.pop();
        Ok(ix)
    }

    fn expand_through(
        &mut self,
        join: &JoinExpr,
        parent: usize,
        owner: &'a Schema,
        def: &'a AssociationDef,
        chain: &'a [String],
        target: Option<usize>,
    ) -> PlanResult<usize> {
        if chain.is_empty() {
            return Err(PlanError::structure(
                Clause::Join,
                join,
                format!("through association `{}` has an empty chain", def.name),
            ));
        }

        let mut current = parent;
        let mut schema = owner;
        for (step, name) in chain.iter().enumerate() {
            let hop = schema.association_def(name).ok_or_else(|| {
                PlanError::structure(
                    Clause::Join,
                    join,
                    format!(
                        "schema `{}` does not have association `{}` (through `{}`)",
                        schema.name, name, def.name
                    ),
                )
            })?;
            let last = step + 1 == chain.len();
            current = self.expand(join, current, schema, hop, if last { target } else { None })?;
            if !last {
                schema = self.schema_at(current, join)?;
            }
        }
        Ok(current)
    }

    fn expand_many_to_many(
        &mut self,
        join: &JoinExpr,
        parent: usize,
        def: &'a AssociationDef,
        target: Option<usize>,
    ) -> PlanResult<usize> {
        let AssocKind::ManyToMany {
            join_through,
            join_owner_key,
            join_related_key,
            join_where,
        } = &def.kind
        else {
            return Err(PlanError::structure(
                Clause::Join,
                join,
                format!("association `{}` is not many-to-many", def.name),
            ));
        };

        let through = self.allocate();
        let on = field_of(through, join_owner_key).eq(field_of(parent, &def.owner_key));
        self.push_hop(join, through, parent, def, join_through, on, join_where)?;
        // The join-through hop is an implementation detail of the association.
        if let Some(hop) = self.joins.last_mut() {
            hop.assoc = None;
        }

        let ix = target.unwrap_or_else(|| self.allocate());
        let on = field_of(ix, &def.related_key).eq(field_of(through, join_related_key));
        self.push_hop(join, ix, through, def, &def.related, on, &def.filters)?;
        Ok(ix)
    }

    #[allow(clippy::too_many_arguments)]
    fn push_hop(
        &mut self,
        join: &JoinExpr,
        ix: usize,
        parent: usize,
        def: &AssociationDef,
        related: &Related,
        on: Expr,
        filters: &[AssocFilter],
    ) -> PlanResult<()> {
        let query_prefix = self.query.prefix.as_deref();
        let clause_prefix = join.prefix.as_deref();

        let (source, bound) = match related {
            Related::Schema(name) => {
                let schema = self.ctx.schema(name, Clause::Join, join)?;
                let prefix = self.ctx.resolve_prefix(clause_prefix, Some(schema), query_prefix);
                (
                    Source::schema(&schema.source, name),
                    BoundSource::Table {
                        table: schema.source.clone(),
                        schema: Some(name.clone()),
                        prefix: prefix.clone(),
                    },
                )
            }
            Related::Table(table) => (
                Source::table(table),
                BoundSource::Table {
                    table: table.clone(),
                    schema: None,
                    prefix: self.ctx.resolve_prefix(clause_prefix, None, query_prefix),
                },
            ),
        };

        let on = filters
            .iter()
            .fold(on, |acc, filter| acc.and(filter_expr(ix, filter)));

        tracing::trace!(binding = ix, parent, assoc = %def.name, "expanded association hop");

        let prefix = bound_prefix(&bound);
        self.sources[ix] = Some(bound);
        self.joins.push(JoinExpr {
            qual: join.qual,
            source: Some(source),
            on: Some(on),
            assoc: Some(AssocRef {
                parent,
                name: def.name.clone(),
            }),
            prefix,
            ix: Some(ix),
        });
        Ok(())
    }

    /// A joined preload may only hang off inner, left or lateral joins.
    fn check_preloads(&self, preloads: &[Preload]) -> PlanResult<()> {
        for preload in preloads {
            if let Some(binding) = preload.binding {
                let join = self.joins.iter().find(|j| j.ix == Some(binding));
                if let Some(join) = join {
                    if !join.qual.allows_preload() {
                        return Err(PlanError::structure(
                            Clause::Preload,
                            join,
                            format!(
                                "preload `{}` cannot be loaded through a {} join",
                                preload.assoc,
                                join.qual.as_str()
                            ),
                        ));
                    }
                }
            }
            self.check_preloads(&preload.children)?;
        }
        Ok(())
    }

    fn finish(self) -> PlanResult<Bindings> {
        let sources = self
            .sources
            .into_iter()
            .enumerate()
            .map(|(ix, source)| {
                source.ok_or_else(|| {
                    PlanError::structure(Clause::Join, format!("&{}", ix), "binding was never bound")
                })
            })
            .collect::<PlanResult<Vec<_>>>()?;

        tracing::debug!(
            bindings = sources.len(),
            order = ?self.joins.iter().filter_map(|j| j.ix).collect::<Vec<_>>(),
            "resolved bindings"
        );

        Ok(Bindings {
            joins: self.joins,
            sources,
            conditions: self.conditions,
        })
    }
}

fn field_of(binding: usize, name: &str) -> Expr {
    Expr::Field {
        binding,
        name: name.to_string(),
    }
}

fn bound_prefix(bound: &BoundSource) -> Option<String> {
    match bound {
        BoundSource::Table { prefix, .. } => prefix.clone(),
        BoundSource::Subquery | BoundSource::Fragment => None,
    }
}

/// Render an association filter against `binding`.
fn filter_expr(binding: usize, filter: &AssocFilter) -> Expr {
    let target = field_of(binding, &filter.field);
    match &filter.condition {
        FilterCondition::Eq(value) => target.eq(Expr::Literal(value.clone())),
        FilterCondition::IsNil => target.is_nil(),
        FilterCondition::NotNil => target.is_nil().not(),
        FilterCondition::In(values) => {
            target.in_(Expr::List(values.iter().cloned().map(Expr::Literal).collect()))
        }
        FilterCondition::Fragment(text) => {
            let holes = text.matches('?').count();
            Expr::Fragment(fragment_parts(text, vec![target; holes]))
        }
    }
}
