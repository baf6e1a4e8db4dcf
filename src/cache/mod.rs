//! Plan cache keys.
//!
//! A cache key is a nested literal structure mirroring the shape of a planned
//! query: clause tags, expression shapes, literal values, schema identities and
//! resolved prefixes. Parameter values never enter the key; parameters show up
//! as a bare [`KeyNode::Param`] marker. Two queries with the same shape and the
//! same literals produce equal keys no matter what values they interpolate.
//!
//! Literals compared against a typed field enter the key in their dumped
//! form, so spellings with the same storage value share a key.
//!
//! A query whose shape depends on interpolated data (an interpolated collection
//! in an `in` test expands to a variable number of parameters) is
//! [`CacheKey::Uncacheable`]. This propagates from nested queries (CTEs,
//! combinations, subqueries) to their parents.
//!
//! The cache that stores plans under these keys lives outside this crate.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::planner::Operation;
use crate::query::{
    BoolOp, BooleanExpr, BoundSource, CteQuery, DistinctExpr, Expr, FragmentPart, GroupByExpr,
    LockExpr, OrderByExpr, OrderByItem, Preload, QueryExpr, SortDir, Source, Take, Value,
    WindowDef, WindowRef,
};

/// One node of a cache key.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyNode {
    Atom(String),
    Value(Value),
    /// Placeholder for a single parameter.
    Param,
    List(Vec<KeyNode>),
    Tagged(String, Vec<KeyNode>),
}

impl KeyNode {
    fn atom(s: impl Into<String>) -> Self {
        KeyNode::Atom(s.into())
    }

    fn tagged(tag: impl Into<String>, children: Vec<KeyNode>) -> Self {
        KeyNode::Tagged(tag.into(), children)
    }

    fn opt_atom(s: Option<&str>) -> Self {
        match s {
            Some(s) => KeyNode::atom(s),
            None => KeyNode::Value(Value::Null),
        }
    }
}

/// Structural fingerprint of a planned query.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheKey {
    Key(Vec<KeyNode>),
    Uncacheable,
}

impl CacheKey {
    pub fn is_cacheable(&self) -> bool {
        matches!(self, CacheKey::Key(_))
    }

    /// SHA-256 of the key's JSON serialization as 64 lowercase hex chars,
    /// `None` for an uncacheable key.
    ///
    /// # Errors
    /// Returns an error if the key cannot be serialized to JSON.
    pub fn fingerprint(&self) -> Result<Option<String>, serde_json::Error> {
        match self {
            CacheKey::Key(nodes) => {
                let json = serde_json::to_string(nodes)?;
                let mut hasher = Sha256::new();
                hasher.update(json.as_bytes());
                Ok(Some(format!("{:x}", hasher.finalize())))
            }
            CacheKey::Uncacheable => Ok(None),
        }
    }
}

/// Storage form of literals for the cache key.
pub trait LiteralDumper {
    /// `value` dumped for field `name` of `source`. `None` when the field is
    /// untyped or the value does not dump; the raw literal is keyed then and
    /// normalization reports the failure.
    fn dump_literal(&self, source: &BoundSource, name: &str, value: &Value) -> Option<Value>;
}

/// Build the cache key of a planned query.
pub(crate) fn build(
    query: &QueryExpr,
    operation: Operation,
    dumper: &dyn LiteralDumper,
) -> CacheKey {
    let mut builder = KeyBuilder {
        cacheable: true,
        dumper,
        sources: query.sources.as_slice(),
    };
    let nodes = builder.query(query, operation);
    if builder.cacheable {
        CacheKey::Key(nodes)
    } else {
        tracing::debug!(operation = %operation, "query shape varies with parameters, key is uncacheable");
        CacheKey::Uncacheable
    }
}

struct KeyBuilder<'q> {
    cacheable: bool,
    dumper: &'q dyn LiteralDumper,
    /// Sources of the query level being keyed.
    sources: &'q [BoundSource],
}

impl<'q> KeyBuilder<'q> {
    fn query(&mut self, query: &'q QueryExpr, operation: Operation) -> Vec<KeyNode> {
        let outer = std::mem::replace(&mut self.sources, query.sources.as_slice());
        let key = self.clauses(query, operation);
        self.sources = outer;
        key
    }

    fn clauses(&mut self, query: &'q QueryExpr, operation: Operation) -> Vec<KeyNode> {
        let mut key = vec![KeyNode::atom(operation.as_str())];

        if let Some(prefix) = &query.prefix {
            key.push(KeyNode::tagged("prefix", vec![KeyNode::atom(prefix.as_str())]));
        }

        if !query.with_ctes.is_empty() {
            let ctes = query
                .with_ctes
                .iter()
                .map(|cte| {
                    let tag = if cte.recursive { "recursive_cte" } else { "cte" };
                    let body = match &cte.query {
                        CteQuery::Query(q) => KeyNode::List(self.query(q, Operation::All)),
                        CteQuery::Fragment(parts) => self.fragment(parts),
                    };
                    KeyNode::tagged(tag, vec![KeyNode::atom(cte.name.as_str()), body])
                })
                .collect();
            key.push(KeyNode::tagged("with_cte", ctes));
        }

        if !query.updates.is_empty() {
            let updates = query
                .updates
                .iter()
                .map(|u| {
                    let fields = u
                        .fields
                        .iter()
                        .map(|(name, e)| KeyNode::tagged(name.as_str(), vec![self.expr(e)]))
                        .collect();
                    KeyNode::tagged(u.op.as_str(), fields)
                })
                .collect();
            key.push(KeyNode::tagged("update", updates));
        }

        if let Some(distinct) = &query.distinct {
            let node = match distinct {
                DistinctExpr::All => KeyNode::Value(Value::Bool(true)),
                DistinctExpr::On(items) => self.order_items(items),
            };
            key.push(KeyNode::tagged("distinct", vec![node]));
        }

        if let Some(select) = &query.select {
            key.push(KeyNode::tagged("select", vec![self.expr(&select.expr)]));
        }

        if let Some(from) = &query.from {
            let source = self.source(&from.source, query.sources.first());
            key.push(KeyNode::tagged("from", vec![source]));
        }

        if !query.joins.is_empty() {
            let joins = query
                .joins
                .iter()
                .map(|join| {
                    let bound = join.ix.and_then(|ix| query.sources.get(ix));
                    let source = match &join.source {
                        Some(source) => self.source(source, bound),
                        None => KeyNode::Value(Value::Null),
                    };
                    let on = match &join.on {
                        Some(on) => self.expr(on),
                        None => KeyNode::Value(Value::Bool(true)),
                    };
                    let ix = join.ix.map(|ix| Value::Int(ix as i64)).unwrap_or(Value::Null);
                    KeyNode::tagged(
                        join.qual.as_str(),
                        vec![KeyNode::Value(ix), source, on],
                    )
                })
                .collect();
            key.push(KeyNode::tagged("join", joins));
        }

        self.boolean_clause(&mut key, "where", &query.wheres);

        if !query.group_bys.is_empty() {
            let groups = query
                .group_bys
                .iter()
                .map(|g| match g {
                    GroupByExpr::Exprs(exprs) => self.exprs(exprs),
                    GroupByExpr::Pinned(fields) => {
                        KeyNode::List(fields.iter().map(|f| KeyNode::atom(f.as_str())).collect())
                    }
                })
                .collect();
            key.push(KeyNode::tagged("group_by", groups));
        }

        self.boolean_clause(&mut key, "having", &query.havings);

        if !query.windows.is_empty() {
            let windows = query
                .windows
                .iter()
                .map(|(name, def)| KeyNode::tagged(name.as_str(), vec![self.window(def)]))
                .collect();
            key.push(KeyNode::tagged("windows", windows));
        }

        if !query.combinations.is_empty() {
            let combinations = query
                .combinations
                .iter()
                .map(|c| {
                    KeyNode::tagged(
                        c.op.as_str(),
                        vec![KeyNode::List(self.query(&c.query, Operation::All))],
                    )
                })
                .collect();
            key.push(KeyNode::tagged("combination", combinations));
        }

        if !query.order_bys.is_empty() {
            let orders = query
                .order_bys
                .iter()
                .map(|o| match o {
                    OrderByExpr::Items(items) => self.order_items(items),
                    OrderByExpr::Pinned(fields) => KeyNode::List(
                        fields
                            .iter()
                            .map(|(dir, f)| {
                                KeyNode::tagged(dir_tag(*dir), vec![KeyNode::atom(f.as_str())])
                            })
                            .collect(),
                    ),
                })
                .collect();
            key.push(KeyNode::tagged("order_by", orders));
        }

        if let Some(limit) = &query.limit {
            key.push(KeyNode::tagged("limit", vec![self.expr(limit)]));
        }

        if let Some(offset) = &query.offset {
            key.push(KeyNode::tagged("offset", vec![self.expr(offset)]));
        }

        if let Some(lock) = &query.lock {
            let node = match lock {
                LockExpr::Literal(text) => KeyNode::atom(text.as_str()),
                LockExpr::Fragment(parts) => self.fragment(parts),
            };
            key.push(KeyNode::tagged("lock", vec![node]));
        }

        if !query.preloads.is_empty() {
            key.push(KeyNode::tagged("preload", preloads(&query.preloads)));
        }

        key
    }

    fn boolean_clause(&mut self, key: &mut Vec<KeyNode>, tag: &str, clause: &[BooleanExpr]) {
        if clause.is_empty() {
            return;
        }
        let entries = clause
            .iter()
            .map(|b| {
                let op = match b.op {
                    BoolOp::And => "and",
                    BoolOp::Or => "or",
                };
                KeyNode::tagged(op, vec![self.expr(&b.expr)])
            })
            .collect();
        key.push(KeyNode::tagged(tag, entries));
    }

    fn source(&mut self, source: &'q Source, bound: Option<&BoundSource>) -> KeyNode {
        match (source, bound) {
            (Source::Subquery(q), _) => {
                KeyNode::tagged("subquery", vec![KeyNode::List(self.query(q, Operation::All))])
            }
            (Source::Fragment(parts), _) => self.fragment(parts),
            (
                _,
                Some(BoundSource::Table {
                    table,
                    schema,
                    prefix,
                }),
            ) => KeyNode::tagged(
                "source",
                vec![
                    KeyNode::atom(table.as_str()),
                    KeyNode::opt_atom(schema.as_deref()),
                    KeyNode::opt_atom(prefix.as_deref()),
                ],
            ),
            (Source::Table(table), _) => KeyNode::tagged(
                "source",
                vec![KeyNode::atom(table.as_str()), KeyNode::Value(Value::Null)],
            ),
            (Source::SchemaTable { table, schema }, _) => KeyNode::tagged(
                "source",
                vec![KeyNode::atom(table.as_str()), KeyNode::atom(schema.as_str())],
            ),
        }
    }

    fn exprs(&mut self, exprs: &[Expr]) -> KeyNode {
        KeyNode::List(exprs.iter().map(|e| self.expr(e)).collect())
    }

    fn order_items(&mut self, items: &[OrderByItem]) -> KeyNode {
        KeyNode::List(
            items
                .iter()
                .map(|item| KeyNode::tagged(dir_tag(item.dir), vec![self.expr(&item.expr)]))
                .collect(),
        )
    }

    fn window(&mut self, def: &WindowDef) -> KeyNode {
        let frame = match &def.frame {
            Some(parts) => self.fragment(parts),
            None => KeyNode::Value(Value::Null),
        };
        KeyNode::List(vec![
            self.exprs(&def.partition_by),
            self.order_items(&def.order_by),
            frame,
        ])
    }

    fn fragment(&mut self, parts: &[FragmentPart]) -> KeyNode {
        let parts = parts
            .iter()
            .map(|part| match part {
                FragmentPart::Raw(text) => KeyNode::atom(text.as_str()),
                FragmentPart::Expr(e) => self.expr(e),
            })
            .collect();
        KeyNode::tagged("fragment", parts)
    }

    fn expr(&mut self, expr: &Expr) -> KeyNode {
        match expr {
            Expr::Field { binding, name } => KeyNode::tagged(
                "field",
                vec![
                    KeyNode::Value(Value::Int(*binding as i64)),
                    KeyNode::atom(name.as_str()),
                ],
            ),
            Expr::Binding(ix) => {
                KeyNode::tagged("binding", vec![KeyNode::Value(Value::Int(*ix as i64))])
            }
            Expr::Literal(v) => KeyNode::Value(v.clone()),
            Expr::Pin(_) | Expr::PinKeyword(_) | Expr::Param(_) => KeyNode::Param,
            Expr::ParamRange { .. } => {
                self.cacheable = false;
                KeyNode::tagged("param_range", Vec::new())
            }
            Expr::Dynamic(inner) => self.expr(inner),
            Expr::Binary { op, left, right } if op.is_comparison() => KeyNode::tagged(
                op.symbol(),
                vec![self.operand(left, right), self.operand(right, left)],
            ),
            Expr::Binary { op, left, right } => {
                KeyNode::tagged(op.symbol(), vec![self.expr(left), self.expr(right)])
            }
            Expr::Not(inner) => KeyNode::tagged("not", vec![self.expr(inner)]),
            Expr::IsNil(inner) => KeyNode::tagged("is_nil", vec![self.expr(inner)]),
            Expr::In { left, right } => {
                let right = match &**right {
                    Expr::List(items) => {
                        KeyNode::List(items.iter().map(|item| self.operand(item, left)).collect())
                    }
                    other => self.expr(other),
                };
                KeyNode::tagged("in", vec![self.expr(left), right])
            }
            Expr::List(items) => self.exprs(items),
            Expr::Tuple(items) => KeyNode::tagged("tuple", vec![self.exprs(items)]),
            Expr::Map(entries) => KeyNode::tagged(
                "map",
                entries
                    .iter()
                    .map(|(k, v)| KeyNode::tagged(k.as_str(), vec![self.expr(v)]))
                    .collect(),
            ),
            Expr::Call { name, args } => {
                let mut children = vec![KeyNode::atom(name.as_str())];
                children.extend(args.iter().map(|a| self.expr(a)));
                KeyNode::tagged("call", children)
            }
            Expr::Typed { expr, ty } => KeyNode::tagged(
                "type",
                vec![self.expr(expr), KeyNode::atom(ty.to_string())],
            ),
            Expr::Over { call, window } => {
                let window = match window {
                    WindowRef::Named(name) => KeyNode::atom(name.as_str()),
                    WindowRef::Inline(def) => self.window(def),
                };
                KeyNode::tagged("over", vec![self.expr(call), window])
            }
            Expr::Fragment(parts) => self.fragment(parts),
            Expr::Struct { binding, take } => KeyNode::tagged(
                "struct",
                vec![
                    KeyNode::Value(Value::Int(*binding as i64)),
                    take_key(take),
                ],
            ),
            Expr::MapOf { binding, take } => KeyNode::tagged(
                "map_of",
                vec![
                    KeyNode::Value(Value::Int(*binding as i64)),
                    take_key(take),
                ],
            ),
            Expr::SelectedAs { expr, name } => KeyNode::tagged(
                "selected_as",
                vec![self.expr(expr), KeyNode::atom(name.as_str())],
            ),
            Expr::SelectedRef(name) => {
                KeyNode::tagged("selected_as", vec![KeyNode::atom(name.as_str())])
            }
        }
    }

    /// A literal compared against a field keys as its dumped value.
    fn operand(&mut self, side: &Expr, other: &Expr) -> KeyNode {
        if let (Expr::Literal(value), Expr::Field { binding, name }) = (side, other) {
            let dumped = self
                .sources
                .get(*binding)
                .and_then(|source| self.dumper.dump_literal(source, name, value));
            if let Some(dumped) = dumped {
                return KeyNode::Value(dumped);
            }
        }
        self.expr(side)
    }
}

fn dir_tag(dir: SortDir) -> &'static str {
    match dir {
        SortDir::Asc => "asc",
        SortDir::Desc => "desc",
    }
}

fn take_key(take: &[Take]) -> KeyNode {
    KeyNode::List(
        take.iter()
            .map(|t| match t {
                Take::Field(name) => KeyNode::atom(name.as_str()),
                Take::Assoc(name, nested) => {
                    KeyNode::tagged(name.as_str(), vec![take_key(nested)])
                }
            })
            .collect(),
    )
}

fn preloads(preloads: &[Preload]) -> Vec<KeyNode> {
    preloads
        .iter()
        .map(|p| {
            let binding = p
                .binding
                .map(|b| Value::Int(b as i64))
                .unwrap_or(Value::Null);
            KeyNode::tagged(
                p.assoc.as_str(),
                vec![KeyNode::Value(binding), KeyNode::List(self::preloads(&p.children))],
            )
        })
        .collect()
}
