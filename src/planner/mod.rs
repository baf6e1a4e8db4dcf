//! Query planner - turns a symbolic query into an executable plan.
//!
//! Two phases:
//! 1. `plan`: bind sources, expand association joins, extract and cast
//!    interpolated values into positional parameters, derive a cache key.
//! 2. `normalize`: validate the planned tree for an operation, dump literals,
//!    expand the selection and prune empty clauses.
//!
//! Both phases are pure. The input tree is never modified and every call
//! returns a new tree, so a [`Planner`] can be shared freely across threads.

pub mod assoc;
mod combine;
mod normalize;
mod params;
mod select;

pub use select::{AssocSelect, SelectMetadata, SelectShape};

use std::fmt;

use serde::Serialize;

use crate::cache::{self, CacheKey, LiteralDumper};
use crate::config::{CacheSettings, Settings, SettingsError};
use crate::dialect::SqlCapabilities;
use crate::error::{Clause, PlanError, PlanResult};
use crate::query::{BoundSource, JoinQual, QueryExpr, Value};
use crate::schema::{Schema, SchemaRegistry};
use crate::types::{FieldType, TypeService};

/// Operation a query is planned for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    All,
    UpdateAll,
    DeleteAll,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::All => "all",
            Operation::UpdateAll => "update_all",
            Operation::DeleteAll => "delete_all",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cast and dumped parameter, addressed by its position.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundParameter {
    pub value: Value,
    pub ty: FieldType,
    /// Clause the parameter was interpolated in.
    pub clause: Clause,
}

/// Result of [`Planner::plan`].
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub query: QueryExpr,
    pub params: Vec<BoundParameter>,
    pub cache_key: CacheKey,
    fingerprint: bool,
}

impl Plan {
    /// Parameter values in placeholder order.
    pub fn values(&self) -> Vec<Value> {
        self.params.iter().map(|p| p.value.clone()).collect()
    }

    /// Hex fingerprint of the cache key. `None` when the key is uncacheable
    /// or fingerprints are disabled in settings.
    pub fn fingerprint(&self) -> Result<Option<String>, serde_json::Error> {
        if !self.fingerprint {
            return Ok(None);
        }
        self.cache_key.fingerprint()
    }
}

/// Everything a planning pass needs, threaded explicitly through every
/// resolver and extractor call.
#[derive(Clone, Copy)]
pub struct PlanContext<'a> {
    pub registry: &'a dyn SchemaRegistry,
    pub types: &'a dyn TypeService,
    pub capabilities: &'a dyn SqlCapabilities,
    pub operation: Operation,
    /// Prefix used when neither the clause, the schema nor the query sets one.
    pub default_prefix: Option<&'a str>,
}

impl<'a> PlanContext<'a> {
    /// Look up a schema, failing with a structure error in `clause`.
    pub fn schema(&self, name: &str, clause: Clause, expr: impl fmt::Display) -> PlanResult<&'a Schema> {
        self.registry
            .lookup(name)
            .ok_or_else(|| PlanError::structure(clause, expr, format!("schema `{}` is not registered", name)))
    }

    /// Resolve a source prefix: clause, then schema, then query, then default.
    pub fn resolve_prefix(
        &self,
        clause_prefix: Option<&str>,
        schema: Option<&Schema>,
        query_prefix: Option<&str>,
    ) -> Option<String> {
        clause_prefix
            .or_else(|| schema.and_then(|s| s.prefix.as_deref()))
            .or(query_prefix)
            .or(self.default_prefix)
            .map(str::to_string)
    }

    /// Context for a nested query. Nested queries are always planned as
    /// `all` and inherit the parent's query prefix as their default.
    pub(crate) fn nested<'b>(&'b self, parent_prefix: Option<&'b str>) -> PlanContext<'b> {
        PlanContext {
            registry: self.registry,
            types: self.types,
            capabilities: self.capabilities,
            operation: Operation::All,
            default_prefix: parent_prefix.or(self.default_prefix),
        }
    }
}

impl LiteralDumper for PlanContext<'_> {
    fn dump_literal(&self, source: &BoundSource, name: &str, value: &Value) -> Option<Value> {
        let BoundSource::Table {
            schema: Some(schema),
            ..
        } = source
        else {
            return None;
        };
        let def = self.registry.lookup(schema)?.field_def(name)?;
        if def.is_virtual {
            return None;
        }
        self.types.dump(&def.ty, value).ok()
    }
}

/// Plan one query level, appending its parameters to `params`.
pub(crate) fn plan_query(
    ctx: &PlanContext<'_>,
    query: &QueryExpr,
    params: &mut Vec<BoundParameter>,
) -> PlanResult<QueryExpr> {
    if query.from.is_none() {
        return Err(PlanError::structure(
            Clause::From,
            "nil",
            "a query must have a source",
        ));
    }

    check_capabilities(ctx, query)?;
    let bindings = assoc::resolve(ctx, query)?;
    params::extract(ctx, query, bindings, params)
}

fn check_capabilities(ctx: &PlanContext<'_>, query: &QueryExpr) -> PlanResult<()> {
    let caps = ctx.capabilities;
    for join in &query.joins {
        let supported = match join.qual {
            JoinQual::Right => caps.supports_right_join(),
            JoinQual::Full => caps.supports_full_outer_join(),
            qual if qual.is_lateral() => caps.supports_lateral(),
            _ => true,
        };
        if !supported {
            return Err(PlanError::structure(
                Clause::Join,
                join,
                format!("{} joins are not supported by {}", join.qual.as_str(), caps.name()),
            ));
        }
    }

    if let Some(cte) = query.with_ctes.iter().find(|c| c.recursive) {
        if !caps.supports_recursive_cte() {
            return Err(PlanError::structure(
                Clause::WithCte,
                &cte.name,
                format!("recursive CTEs are not supported by {}", caps.name()),
            ));
        }
    }

    if let Some((name, _)) = query.windows.first() {
        if !caps.supports_named_windows() {
            return Err(PlanError::structure(
                Clause::Windows,
                name,
                format!("named windows are not supported by {}", caps.name()),
            ));
        }
    }

    if query.lock.is_some() && !caps.supports_row_locks() {
        return Err(PlanError::structure(
            Clause::Lock,
            "lock",
            format!("row locks are not supported by {}", caps.name()),
        ));
    }

    Ok(())
}

/// Main entry point for planning.
pub struct Planner<'a> {
    registry: &'a dyn SchemaRegistry,
    types: &'a dyn TypeService,
    default_prefix: Option<String>,
    cache: CacheSettings,
}

impl<'a> Planner<'a> {
    pub fn new(registry: &'a dyn SchemaRegistry, types: &'a dyn TypeService) -> Self {
        Self {
            registry,
            types,
            default_prefix: None,
            cache: CacheSettings::default(),
        }
    }

    /// Apply planner and cache settings.
    pub fn with_settings(mut self, settings: &Settings) -> Result<Self, SettingsError> {
        self.default_prefix = settings.planner.resolved_default_prefix()?;
        self.cache = settings.cache.clone();
        Ok(self)
    }

    pub fn with_default_prefix(mut self, prefix: &str) -> Self {
        self.default_prefix = Some(prefix.to_string());
        self
    }

    fn context<'b>(
        &'b self,
        operation: Operation,
        capabilities: &'b dyn SqlCapabilities,
    ) -> PlanContext<'b> {
        PlanContext {
            registry: self.registry,
            types: self.types,
            capabilities,
            operation,
            default_prefix: self.default_prefix.as_deref(),
        }
    }

    /// Plan a query: expand joins, extract parameters, derive the cache key.
    pub fn plan(
        &self,
        query: &QueryExpr,
        operation: Operation,
        capabilities: &dyn SqlCapabilities,
    ) -> PlanResult<Plan> {
        tracing::debug!(operation = %operation, dialect = capabilities.name(), "planning query");

        let ctx = self.context(operation, capabilities);
        let mut params = Vec::new();
        let planned = plan_query(&ctx, query, &mut params)?;

        let cache_key = if self.cache.enabled {
            cache::build(&planned, operation, &ctx)
        } else {
            CacheKey::Uncacheable
        };

        tracing::debug!(
            params = params.len(),
            bindings = planned.sources.len(),
            cacheable = cache_key.is_cacheable(),
            "planned query"
        );

        Ok(Plan {
            query: planned,
            params,
            cache_key,
            fingerprint: self.cache.fingerprint,
        })
    }

    /// Validate a planned query for `operation` and expand its selection.
    pub fn normalize(
        &self,
        planned: &QueryExpr,
        operation: Operation,
        capabilities: &dyn SqlCapabilities,
    ) -> PlanResult<(QueryExpr, SelectMetadata)> {
        tracing::debug!(operation = %operation, "normalizing query");
        let ctx = self.context(operation, capabilities);
        normalize::normalize(&ctx, planned)
    }

    /// `plan` followed by `normalize`; the returned plan carries the
    /// normalized tree.
    pub fn prepare(
        &self,
        query: &QueryExpr,
        operation: Operation,
        capabilities: &dyn SqlCapabilities,
    ) -> PlanResult<(Plan, SelectMetadata)> {
        let mut plan = self.plan(query, operation, capabilities)?;
        let (normalized, metadata) = self.normalize(&plan.query, operation, capabilities)?;
        plan.query = normalized;
        Ok((plan, metadata))
    }
}
