//! Query expression tree.
//!
//! A [`QueryExpr`] is an immutable value built by an external builder. The
//! planner never mutates its input: `plan` and `normalize` return new trees
//! with joins expanded, parameters extracted and selections resolved.
//!
//! The builder methods here mirror what a fluent query DSL would produce and
//! are mostly used by tests and callers assembling queries by hand.

pub mod expr;
mod render;
pub mod value;

pub use expr::{
    call, count, dynamic, field, fragment, lit, lit_null, list, map_parts, pin, pin_keyword,
    take_map, take_struct, BinaryOp, Expr, FragmentPart, Take, WindowDef, WindowRef,
};
pub use value::Value;

// =============================================================================
// Sources
// =============================================================================

/// Source of a binding.
#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    /// Bare table, no schema metadata.
    Table(String),
    /// Table backed by a registered schema.
    SchemaTable { table: String, schema: String },
    /// Nested query.
    Subquery(Box<QueryExpr>),
    /// Raw fragment.
    Fragment(Vec<FragmentPart>),
}

impl Source {
    pub fn table(name: &str) -> Self {
        Source::Table(name.to_string())
    }

    pub fn schema(table: &str, schema: &str) -> Self {
        Source::SchemaTable {
            table: table.to_string(),
            schema: schema.to_string(),
        }
    }

    pub fn subquery(query: QueryExpr) -> Self {
        Source::Subquery(Box::new(query))
    }
}

/// The `from` clause.
#[derive(Debug, Clone, PartialEq)]
pub struct FromExpr {
    pub source: Source,
    /// Prefix override for this source.
    pub prefix: Option<String>,
}

/// A source as resolved by the planner, indexed by binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundSource {
    Table {
        table: String,
        schema: Option<String>,
        prefix: Option<String>,
    },
    /// The planned query lives on the owning `from`/join expression.
    Subquery,
    Fragment,
}

impl BoundSource {
    pub fn schema(&self) -> Option<&str> {
        match self {
            BoundSource::Table { schema, .. } => schema.as_deref(),
            _ => None,
        }
    }

    pub fn table(&self) -> Option<&str> {
        match self {
            BoundSource::Table { table, .. } => Some(table),
            _ => None,
        }
    }
}

// =============================================================================
// Joins
// =============================================================================

/// Join qualifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinQual {
    Inner,
    Left,
    Right,
    Full,
    Cross,
    InnerLateral,
    LeftLateral,
}

impl JoinQual {
    pub fn as_str(&self) -> &'static str {
        match self {
            JoinQual::Inner => "inner",
            JoinQual::Left => "left",
            JoinQual::Right => "right",
            JoinQual::Full => "full",
            JoinQual::Cross => "cross",
            JoinQual::InnerLateral => "inner_lateral",
            JoinQual::LeftLateral => "left_lateral",
        }
    }

    pub fn is_lateral(&self) -> bool {
        matches!(self, JoinQual::InnerLateral | JoinQual::LeftLateral)
    }

    /// Qualifiers a joined preload may be attached through.
    pub fn allows_preload(&self) -> bool {
        matches!(
            self,
            JoinQual::Inner | JoinQual::Left | JoinQual::InnerLateral | JoinQual::LeftLateral
        )
    }
}

/// Association reference on a join: `assoc(&parent, :name)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssocRef {
    pub parent: usize,
    pub name: String,
}

/// A join.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinExpr {
    pub qual: JoinQual,
    /// `None` for association joins until the planner resolves them.
    pub source: Option<Source>,
    pub on: Option<Expr>,
    pub assoc: Option<AssocRef>,
    pub prefix: Option<String>,
    /// Binding index, assigned by the planner.
    pub ix: Option<usize>,
}

impl JoinExpr {
    pub fn new(qual: JoinQual, source: Source, on: Option<Expr>) -> Self {
        Self {
            qual,
            source: Some(source),
            on,
            assoc: None,
            prefix: None,
            ix: None,
        }
    }

    pub fn assoc(qual: JoinQual, parent: usize, name: &str) -> Self {
        Self {
            qual,
            source: None,
            on: None,
            assoc: Some(AssocRef {
                parent,
                name: name.to_string(),
            }),
            prefix: None,
            ix: None,
        }
    }

    pub fn with_on(mut self, on: Expr) -> Self {
        self.on = Some(on);
        self
    }

    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = Some(prefix.to_string());
        self
    }
}

// =============================================================================
// Clauses
// =============================================================================

/// How a boolean clause combines with the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolOp {
    And,
    Or,
}

/// One `where` / `having` entry.
#[derive(Debug, Clone, PartialEq)]
pub struct BooleanExpr {
    pub op: BoolOp,
    pub expr: Expr,
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDir {
    #[default]
    Asc,
    Desc,
}

/// An ORDER BY item.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderByItem {
    pub dir: SortDir,
    pub expr: Expr,
}

impl OrderByItem {
    pub fn asc(expr: Expr) -> Self {
        Self {
            dir: SortDir::Asc,
            expr,
        }
    }

    pub fn desc(expr: Expr) -> Self {
        Self {
            dir: SortDir::Desc,
            expr,
        }
    }
}

/// One `order_by` entry.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderByExpr {
    Items(Vec<OrderByItem>),
    /// Interpolated field list, expanded against binding 0 during planning.
    Pinned(Vec<(SortDir, String)>),
}

/// One `group_by` entry.
#[derive(Debug, Clone, PartialEq)]
pub enum GroupByExpr {
    Exprs(Vec<Expr>),
    /// Interpolated field list, expanded against binding 0 during planning.
    Pinned(Vec<String>),
}

/// The `select` clause.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectExpr {
    pub expr: Expr,
    /// Flattened projection, filled in by normalization.
    pub fields: Vec<Expr>,
}

impl SelectExpr {
    pub fn new(expr: Expr) -> Self {
        Self {
            expr,
            fields: Vec::new(),
        }
    }
}

/// The `distinct` clause.
#[derive(Debug, Clone, PartialEq)]
pub enum DistinctExpr {
    All,
    On(Vec<OrderByItem>),
}

/// Update operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOp {
    Set,
    Inc,
    Push,
    Pull,
}

impl UpdateOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateOp::Set => "set",
            UpdateOp::Inc => "inc",
            UpdateOp::Push => "push",
            UpdateOp::Pull => "pull",
        }
    }
}

/// One `update` entry.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateExpr {
    pub op: UpdateOp,
    pub fields: Vec<(String, Expr)>,
}

/// Set operation of a combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOp {
    Union,
    UnionAll,
    Except,
    ExceptAll,
    Intersect,
    IntersectAll,
}

impl SetOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            SetOp::Union => "union",
            SetOp::UnionAll => "union_all",
            SetOp::Except => "except",
            SetOp::ExceptAll => "except_all",
            SetOp::Intersect => "intersect",
            SetOp::IntersectAll => "intersect_all",
        }
    }
}

/// A set operation with a nested query.
#[derive(Debug, Clone, PartialEq)]
pub struct Combination {
    pub op: SetOp,
    pub query: QueryExpr,
}

/// Body of a common table expression.
#[derive(Debug, Clone, PartialEq)]
pub enum CteQuery {
    Query(Box<QueryExpr>),
    Fragment(Vec<FragmentPart>),
}

/// A named common table expression. A recursive CTE may refer to its own
/// name as a table source.
#[derive(Debug, Clone, PartialEq)]
pub struct Cte {
    pub name: String,
    pub query: CteQuery,
    pub recursive: bool,
}

/// A preload entry. Without a binding the association is loaded by a
/// separate query; with one it is loaded from that join.
#[derive(Debug, Clone, PartialEq)]
pub struct Preload {
    pub assoc: String,
    pub binding: Option<usize>,
    pub children: Vec<Preload>,
}

impl Preload {
    pub fn new(assoc: &str) -> Self {
        Self {
            assoc: assoc.to_string(),
            binding: None,
            children: Vec::new(),
        }
    }

    pub fn joined(assoc: &str, binding: usize) -> Self {
        Self {
            assoc: assoc.to_string(),
            binding: Some(binding),
            children: Vec::new(),
        }
    }

    pub fn with_children(mut self, children: Vec<Preload>) -> Self {
        self.children = children;
        self
    }
}

/// Row lock.
#[derive(Debug, Clone, PartialEq)]
pub enum LockExpr {
    Literal(String),
    Fragment(Vec<FragmentPart>),
}

// =============================================================================
// Query
// =============================================================================

/// A query expression.
#[derive(Debug, Clone, Default, PartialEq)]
#[must_use = "QueryExpr has no effect until planned"]
pub struct QueryExpr {
    pub from: Option<FromExpr>,
    pub joins: Vec<JoinExpr>,
    pub wheres: Vec<BooleanExpr>,
    pub group_bys: Vec<GroupByExpr>,
    pub havings: Vec<BooleanExpr>,
    pub order_bys: Vec<OrderByExpr>,
    pub select: Option<SelectExpr>,
    pub distinct: Option<DistinctExpr>,
    pub limit: Option<Expr>,
    pub offset: Option<Expr>,
    pub updates: Vec<UpdateExpr>,
    pub windows: Vec<(String, WindowDef)>,
    pub combinations: Vec<Combination>,
    pub with_ctes: Vec<Cte>,
    pub preloads: Vec<Preload>,
    pub lock: Option<LockExpr>,
    /// Query-wide default prefix.
    pub prefix: Option<String>,
    /// Binding arena, populated by the planner.
    pub sources: Vec<BoundSource>,
}

impl QueryExpr {
    pub fn new() -> Self {
        Self::default()
    }

    /// `from` a bare table.
    pub fn from_table(table: &str) -> Self {
        Self::new().from(Source::table(table))
    }

    /// `from` a schema-backed table.
    pub fn from_schema(table: &str, schema: &str) -> Self {
        Self::new().from(Source::schema(table, schema))
    }

    pub fn from(mut self, source: Source) -> Self {
        self.from = Some(FromExpr {
            source,
            prefix: None,
        });
        self
    }

    pub fn from_prefix(mut self, prefix: &str) -> Self {
        if let Some(from) = &mut self.from {
            from.prefix = Some(prefix.to_string());
        }
        self
    }

    pub fn join(mut self, join: JoinExpr) -> Self {
        self.joins.push(join);
        self
    }

    pub fn inner_join(self, source: Source, on: Expr) -> Self {
        self.join(JoinExpr::new(JoinQual::Inner, source, Some(on)))
    }

    pub fn left_join(self, source: Source, on: Expr) -> Self {
        self.join(JoinExpr::new(JoinQual::Left, source, Some(on)))
    }

    /// `join: x in assoc(&parent, :name)`
    pub fn join_assoc(self, qual: JoinQual, parent: usize, name: &str) -> Self {
        self.join(JoinExpr::assoc(qual, parent, name))
    }

    /// Add a `where` entry (ANDed with existing entries).
    pub fn filter(mut self, expr: Expr) -> Self {
        self.wheres.push(BooleanExpr {
            op: BoolOp::And,
            expr,
        });
        self
    }

    /// Add an `or_where` entry.
    pub fn or_filter(mut self, expr: Expr) -> Self {
        self.wheres.push(BooleanExpr {
            op: BoolOp::Or,
            expr,
        });
        self
    }

    pub fn group_by(mut self, exprs: Vec<Expr>) -> Self {
        self.group_bys.push(GroupByExpr::Exprs(exprs));
        self
    }

    pub fn having(mut self, expr: Expr) -> Self {
        self.havings.push(BooleanExpr {
            op: BoolOp::And,
            expr,
        });
        self
    }

    pub fn order_by(mut self, items: Vec<OrderByItem>) -> Self {
        self.order_bys.push(OrderByExpr::Items(items));
        self
    }

    pub fn select(mut self, expr: Expr) -> Self {
        self.select = Some(SelectExpr::new(expr));
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = Some(DistinctExpr::All);
        self
    }

    pub fn limit(mut self, expr: impl Into<Expr>) -> Self {
        self.limit = Some(expr.into());
        self
    }

    pub fn offset(mut self, expr: impl Into<Expr>) -> Self {
        self.offset = Some(expr.into());
        self
    }

    pub fn update(mut self, op: UpdateOp, fields: Vec<(&str, Expr)>) -> Self {
        self.updates.push(UpdateExpr {
            op,
            fields: fields
                .into_iter()
                .map(|(name, e)| (name.to_string(), e))
                .collect(),
        });
        self
    }

    pub fn window(mut self, name: &str, def: WindowDef) -> Self {
        self.windows.push((name.to_string(), def));
        self
    }

    pub fn combine(mut self, op: SetOp, query: QueryExpr) -> Self {
        self.combinations.push(Combination { op, query });
        self
    }

    pub fn union(self, query: QueryExpr) -> Self {
        self.combine(SetOp::Union, query)
    }

    pub fn union_all(self, query: QueryExpr) -> Self {
        self.combine(SetOp::UnionAll, query)
    }

    pub fn with_cte(mut self, name: &str, query: QueryExpr) -> Self {
        self.with_ctes.push(Cte {
            name: name.to_string(),
            query: CteQuery::Query(Box::new(query)),
            recursive: false,
        });
        self
    }

    pub fn with_recursive_cte(mut self, name: &str, query: QueryExpr) -> Self {
        self.with_ctes.push(Cte {
            name: name.to_string(),
            query: CteQuery::Query(Box::new(query)),
            recursive: true,
        });
        self
    }

    pub fn preload(mut self, preload: Preload) -> Self {
        self.preloads.push(preload);
        self
    }

    pub fn lock(mut self, lock: &str) -> Self {
        self.lock = Some(LockExpr::Literal(lock.to_string()));
        self
    }

    pub fn prefix(mut self, prefix: &str) -> Self {
        self.prefix = Some(prefix.to_string());
        self
    }

    /// Binding count once planned (`from` plus every join, expanded).
    pub fn binding_count(&self) -> usize {
        self.sources.len()
    }
}
