//! Expression AST.
//!
//! Expressions address fields through binding indices: binding 0 is the
//! query's `from` source, explicit joins follow in declaration order. The
//! same tree is used before planning (with [`Expr::Pin`] values and dynamic
//! interpolations) and after planning (with [`Expr::Param`] placeholders).

use super::value::Value;
use crate::types::FieldType;

/// A query expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Field of a binding: `&0.title`
    Field { binding: usize, name: String },

    /// A whole binding, as in `select: p`
    Binding(usize),

    /// Literal value written into the query
    Literal(Value),

    /// Interpolated value; replaced by a placeholder during planning
    Pin(Value),

    /// Interpolated expression built elsewhere. Only legal as a whole
    /// clause expression.
    Dynamic(Box<Expr>),

    /// Interpolated keyword/mapping literal, expanded into equality tests
    /// against binding 0. Only legal as a whole clause expression.
    PinKeyword(Vec<(String, Value)>),

    /// Positional parameter placeholder
    Param(usize),

    /// Contiguous parameter range `[start, start + len)` produced by an
    /// interpolated collection in an `in` test
    ParamRange { start: usize, len: usize },

    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },

    Not(Box<Expr>),

    IsNil(Box<Expr>),

    /// Membership test: `left in right`
    In { left: Box<Expr>, right: Box<Expr> },

    List(Vec<Expr>),

    Tuple(Vec<Expr>),

    /// Map literal in a select: `%{title: &0.title}`
    Map(Vec<(String, Expr)>),

    /// Function call: `count(&0.id)`
    Call { name: String, args: Vec<Expr> },

    /// Type annotation: `type(^"1", integer)`
    Typed { expr: Box<Expr>, ty: FieldType },

    /// Windowed function call: `row_number() over :w`
    Over { call: Box<Expr>, window: WindowRef },

    /// Opaque SQL text with embedded expressions
    Fragment(Vec<FragmentPart>),

    /// `struct(p, [:id, :title])`. An empty take selects every loadable field.
    Struct { binding: usize, take: Vec<Take> },

    /// `map(p, [:id, :title])`
    MapOf { binding: usize, take: Vec<Take> },

    /// Named select expression: `selected_as(&0.title, :t)`
    SelectedAs { expr: Box<Expr>, name: String },

    /// Reference to a `selected_as` alias from `order_by` / `group_by`
    SelectedRef(String),
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    // Comparison
    Eq,
    Ne,
    Lt,
    Gt,
    Lte,
    Gte,
    // Logical
    And,
    Or,
    // Arithmetic
    Add,
    Sub,
    Mul,
    Div,
    // String
    Like,
    ILike,
}

impl BinaryOp {
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Gt | BinaryOp::Lte | BinaryOp::Gte
        )
    }

    pub fn is_logical(&self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }

    pub fn is_arithmetic(&self) -> bool {
        matches!(
            self,
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div
        )
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Gt => ">",
            BinaryOp::Lte => "<=",
            BinaryOp::Gte => ">=",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Like => "like",
            BinaryOp::ILike => "ilike",
        }
    }
}

/// Piece of a fragment: raw text or an embedded expression.
#[derive(Debug, Clone, PartialEq)]
pub enum FragmentPart {
    Raw(String),
    Expr(Expr),
}

/// Field selection inside `struct/2` and `map/2`.
#[derive(Debug, Clone, PartialEq)]
pub enum Take {
    Field(String),
    /// Fields to load for a joined preload of this association
    Assoc(String, Vec<Take>),
}

/// Window referenced by a windowed call.
#[derive(Debug, Clone, PartialEq)]
pub enum WindowRef {
    /// Name declared in the query's `windows` clause
    Named(String),
    Inline(WindowDef),
}

/// Window definition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowDef {
    pub partition_by: Vec<Expr>,
    pub order_by: Vec<super::OrderByItem>,
    pub frame: Option<Vec<FragmentPart>>,
}

impl Expr {
    /// Visit this expression and every sub-expression, parents first.
    pub fn walk<'a>(&'a self, f: &mut dyn FnMut(&'a Expr)) {
        f(self);
        match self {
            Expr::Dynamic(inner)
            | Expr::Not(inner)
            | Expr::IsNil(inner) => inner.walk(f),
            Expr::Typed { expr, .. } | Expr::SelectedAs { expr, .. } => expr.walk(f),
            Expr::Binary { left, right, .. } | Expr::In { left, right } => {
                left.walk(f);
                right.walk(f);
            }
            Expr::List(items) | Expr::Tuple(items) | Expr::Call { args: items, .. } => {
                for item in items {
                    item.walk(f);
                }
            }
            Expr::Map(entries) => {
                for (_, e) in entries {
                    e.walk(f);
                }
            }
            Expr::Over { call, window } => {
                call.walk(f);
                if let WindowRef::Inline(def) = window {
                    def.walk(f);
                }
            }
            Expr::Fragment(parts) => walk_parts(parts, f),
            Expr::Field { .. }
            | Expr::Binding(_)
            | Expr::Literal(_)
            | Expr::Pin(_)
            | Expr::PinKeyword(_)
            | Expr::Param(_)
            | Expr::ParamRange { .. }
            | Expr::Struct { .. }
            | Expr::MapOf { .. }
            | Expr::SelectedRef(_) => {}
        }
    }

    /// True if any sub-expression satisfies `pred`.
    pub fn any(&self, pred: &dyn Fn(&Expr) -> bool) -> bool {
        let mut found = false;
        self.walk(&mut |e| {
            if !found && pred(e) {
                found = true;
            }
        });
        found
    }

    /// Rebuild this node with each direct child replaced by `f(child)`.
    /// Leaves are cloned.
    pub fn try_map_children<E>(
        &self,
        f: &mut dyn FnMut(&Expr) -> Result<Expr, E>,
    ) -> Result<Expr, E> {
        Ok(match self {
            Expr::Dynamic(inner) => Expr::Dynamic(map_box(inner, f)?),
            Expr::Not(inner) => Expr::Not(map_box(inner, f)?),
            Expr::IsNil(inner) => Expr::IsNil(map_box(inner, f)?),
            Expr::Typed { expr, ty } => Expr::Typed {
                expr: map_box(expr, f)?,
                ty: ty.clone(),
            },
            Expr::SelectedAs { expr, name } => Expr::SelectedAs {
                expr: map_box(expr, f)?,
                name: name.clone(),
            },
            Expr::Binary { op, left, right } => Expr::Binary {
                op: *op,
                left: map_box(left, f)?,
                right: map_box(right, f)?,
            },
            Expr::In { left, right } => Expr::In {
                left: map_box(left, f)?,
                right: map_box(right, f)?,
            },
            Expr::List(items) => Expr::List(items.iter().map(|e| f(e)).collect::<Result<_, _>>()?),
            Expr::Tuple(items) => {
                Expr::Tuple(items.iter().map(|e| f(e)).collect::<Result<_, _>>()?)
            }
            Expr::Call { name, args } => Expr::Call {
                name: name.clone(),
                args: args.iter().map(|e| f(e)).collect::<Result<_, _>>()?,
            },
            Expr::Map(entries) => Expr::Map(
                entries
                    .iter()
                    .map(|(k, e)| Ok((k.clone(), f(e)?)))
                    .collect::<Result<_, E>>()?,
            ),
            Expr::Over { call, window } => Expr::Over {
                call: map_box(call, f)?,
                window: match window {
                    WindowRef::Named(name) => WindowRef::Named(name.clone()),
                    WindowRef::Inline(def) => WindowRef::Inline(def.try_map(f)?),
                },
            },
            Expr::Fragment(parts) => Expr::Fragment(map_parts(parts, f)?),
            Expr::Field { .. }
            | Expr::Binding(_)
            | Expr::Literal(_)
            | Expr::Pin(_)
            | Expr::PinKeyword(_)
            | Expr::Param(_)
            | Expr::ParamRange { .. }
            | Expr::Struct { .. }
            | Expr::MapOf { .. }
            | Expr::SelectedRef(_) => self.clone(),
        })
    }

    /// AND two optional conditions together.
    pub fn and_opt(left: Option<Expr>, right: Option<Expr>) -> Option<Expr> {
        match (left, right) {
            (Some(l), Some(r)) => Some(l.and(r)),
            (l, None) => l,
            (None, r) => r,
        }
    }

    fn binary(self, op: BinaryOp, other: impl Into<Expr>) -> Expr {
        Expr::Binary {
            op,
            left: Box::new(self),
            right: Box::new(other.into()),
        }
    }

    pub fn eq(self, other: impl Into<Expr>) -> Expr {
        self.binary(BinaryOp::Eq, other)
    }

    pub fn ne(self, other: impl Into<Expr>) -> Expr {
        self.binary(BinaryOp::Ne, other)
    }

    pub fn lt(self, other: impl Into<Expr>) -> Expr {
        self.binary(BinaryOp::Lt, other)
    }

    pub fn gt(self, other: impl Into<Expr>) -> Expr {
        self.binary(BinaryOp::Gt, other)
    }

    pub fn lte(self, other: impl Into<Expr>) -> Expr {
        self.binary(BinaryOp::Lte, other)
    }

    pub fn gte(self, other: impl Into<Expr>) -> Expr {
        self.binary(BinaryOp::Gte, other)
    }

    pub fn and(self, other: impl Into<Expr>) -> Expr {
        self.binary(BinaryOp::And, other)
    }

    pub fn or(self, other: impl Into<Expr>) -> Expr {
        self.binary(BinaryOp::Or, other)
    }

    pub fn add(self, other: impl Into<Expr>) -> Expr {
        self.binary(BinaryOp::Add, other)
    }

    pub fn like(self, other: impl Into<Expr>) -> Expr {
        self.binary(BinaryOp::Like, other)
    }

    pub fn in_(self, other: impl Into<Expr>) -> Expr {
        Expr::In {
            left: Box::new(self),
            right: Box::new(other.into()),
        }
    }

    pub fn is_nil(self) -> Expr {
        Expr::IsNil(Box::new(self))
    }

    pub fn not(self) -> Expr {
        Expr::Not(Box::new(self))
    }

    pub fn typed(self, ty: FieldType) -> Expr {
        Expr::Typed {
            expr: Box::new(self),
            ty,
        }
    }

    pub fn over(self, window: &str) -> Expr {
        Expr::Over {
            call: Box::new(self),
            window: WindowRef::Named(window.to_string()),
        }
    }

    pub fn selected_as(self, name: &str) -> Expr {
        Expr::SelectedAs {
            expr: Box::new(self),
            name: name.to_string(),
        }
    }
}

impl WindowDef {
    pub fn partition_by(exprs: Vec<Expr>) -> Self {
        Self {
            partition_by: exprs,
            ..Default::default()
        }
    }

    pub(crate) fn walk<'a>(&'a self, f: &mut dyn FnMut(&'a Expr)) {
        for e in &self.partition_by {
            e.walk(f);
        }
        for item in &self.order_by {
            item.expr.walk(f);
        }
        if let Some(parts) = &self.frame {
            walk_parts(parts, f);
        }
    }

    /// Rebuild with every expression replaced by `f(expr)`.
    pub fn try_map<E>(&self, f: &mut dyn FnMut(&Expr) -> Result<Expr, E>) -> Result<Self, E> {
        Ok(WindowDef {
            partition_by: self
                .partition_by
                .iter()
                .map(|e| f(e))
                .collect::<Result<_, _>>()?,
            order_by: self
                .order_by
                .iter()
                .map(|item| {
                    Ok(super::OrderByItem {
                        dir: item.dir,
                        expr: f(&item.expr)?,
                    })
                })
                .collect::<Result<_, E>>()?,
            frame: match &self.frame {
                Some(parts) => Some(map_parts(parts, f)?),
                None => None,
            },
        })
    }
}

fn map_box<E>(e: &Expr, f: &mut dyn FnMut(&Expr) -> Result<Expr, E>) -> Result<Box<Expr>, E> {
    f(e).map(Box::new)
}

/// Rebuild fragment parts with every embedded expression replaced by `f(expr)`.
pub fn map_parts<E>(
    parts: &[FragmentPart],
    f: &mut dyn FnMut(&Expr) -> Result<Expr, E>,
) -> Result<Vec<FragmentPart>, E> {
    parts
        .iter()
        .map(|part| match part {
            FragmentPart::Raw(text) => Ok(FragmentPart::Raw(text.clone())),
            FragmentPart::Expr(e) => Ok(FragmentPart::Expr(f(e)?)),
        })
        .collect()
}

fn walk_parts<'a>(parts: &'a [FragmentPart], f: &mut dyn FnMut(&'a Expr)) {
    for part in parts {
        if let FragmentPart::Expr(e) = part {
            e.walk(f);
        }
    }
}

// =============================================================================
// Constructors
// =============================================================================

/// Field reference: `field(0, "title")` is `&0.title`.
pub fn field(binding: usize, name: &str) -> Expr {
    Expr::Field {
        binding,
        name: name.to_string(),
    }
}

pub fn lit(value: impl Into<Value>) -> Expr {
    Expr::Literal(value.into())
}

pub fn lit_null() -> Expr {
    Expr::Literal(Value::Null)
}

/// Interpolated value: `^value`.
pub fn pin(value: impl Into<Value>) -> Expr {
    Expr::Pin(value.into())
}

/// Interpolated expression: `^dynamic`.
pub fn dynamic(expr: Expr) -> Expr {
    Expr::Dynamic(Box::new(expr))
}

/// Interpolated keyword list: `^[title: "x", public: true]`.
pub fn pin_keyword(pairs: Vec<(&str, Value)>) -> Expr {
    Expr::PinKeyword(pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
}

pub fn list(items: Vec<Expr>) -> Expr {
    Expr::List(items)
}

pub fn call(name: &str, args: Vec<Expr>) -> Expr {
    Expr::Call {
        name: name.to_string(),
        args,
    }
}

pub fn count(expr: Expr) -> Expr {
    call("count", vec![expr])
}

/// Fragment from text whose `?` markers are replaced, in order, by `args`.
pub fn fragment(text: &str, args: Vec<Expr>) -> Expr {
    Expr::Fragment(fragment_parts(text, args))
}

pub(crate) fn fragment_parts(text: &str, args: Vec<Expr>) -> Vec<FragmentPart> {
    let mut parts = Vec::new();
    let mut args = args.into_iter();
    let mut pieces = text.split('?').peekable();
    while let Some(piece) = pieces.next() {
        if !piece.is_empty() {
            parts.push(FragmentPart::Raw(piece.to_string()));
        }
        if pieces.peek().is_some() {
            if let Some(arg) = args.next() {
                parts.push(FragmentPart::Expr(arg));
            }
        }
    }
    parts
}

/// `struct(&binding, [fields...])`
pub fn take_struct(binding: usize, fields: &[&str]) -> Expr {
    Expr::Struct {
        binding,
        take: fields.iter().map(|f| Take::Field(f.to_string())).collect(),
    }
}

/// `map(&binding, [fields...])`
pub fn take_map(binding: usize, fields: &[&str]) -> Expr {
    Expr::MapOf {
        binding,
        take: fields.iter().map(|f| Take::Field(f.to_string())).collect(),
    }
}

impl From<Value> for Expr {
    fn from(v: Value) -> Self {
        Expr::Literal(v)
    }
}

impl From<i64> for Expr {
    fn from(n: i64) -> Self {
        Expr::Literal(Value::Int(n))
    }
}

impl From<i32> for Expr {
    fn from(n: i32) -> Self {
        Expr::Literal(Value::Int(n as i64))
    }
}

impl From<&str> for Expr {
    fn from(s: &str) -> Self {
        Expr::Literal(Value::String(s.to_string()))
    }
}

impl From<bool> for Expr {
    fn from(b: bool) -> Self {
        Expr::Literal(Value::Bool(b))
    }
}
