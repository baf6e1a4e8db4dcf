//! Error types for planning and normalization.
//!
//! Every failure is terminal for the current `plan`/`normalize` call. Each
//! variant carries the clause it was raised in and a rendered form of the
//! offending expression so the failure can be located without re-running.

use std::fmt;

use thiserror::Error;

/// Clause of a query expression, used to tag parameters and errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Clause {
    WithCte,
    Distinct,
    Select,
    From,
    Join,
    Where,
    GroupBy,
    Having,
    Windows,
    Combination,
    OrderBy,
    Limit,
    Offset,
    Update,
    Preload,
    Lock,
}

impl Clause {
    pub fn as_str(&self) -> &'static str {
        match self {
            Clause::WithCte => "with_cte",
            Clause::Distinct => "distinct",
            Clause::Select => "select",
            Clause::From => "from",
            Clause::Join => "join",
            Clause::Where => "where",
            Clause::GroupBy => "group_by",
            Clause::Having => "having",
            Clause::Windows => "windows",
            Clause::Combination => "combination",
            Clause::OrderBy => "order_by",
            Clause::Limit => "limit",
            Clause::Offset => "offset",
            Clause::Update => "update",
            Clause::Preload => "preload",
            Clause::Lock => "lock",
        }
    }
}

impl fmt::Display for Clause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while planning or normalizing a query.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlanError {
    /// The query shape is illegal for the requested operation or context.
    #[error("{message} in `{clause}`: {expr}")]
    Structure {
        clause: Clause,
        expr: String,
        message: String,
    },

    /// An interpolated value could not be cast to the type its context requires.
    #[error("value `{value}` in `{clause}` cannot be cast to type {ty} in `{expr}`")]
    Cast {
        clause: Clause,
        expr: String,
        value: String,
        ty: String,
    },

    /// A value could not be converted to its storage representation.
    #[error("value `{value}` in `{clause}` cannot be dumped to type {ty} in `{expr}` ({operation})")]
    Dump {
        clause: Clause,
        expr: String,
        value: String,
        ty: String,
        operation: String,
    },
}

impl PlanError {
    pub fn structure(clause: Clause, expr: impl fmt::Display, message: impl Into<String>) -> Self {
        PlanError::Structure {
            clause,
            expr: expr.to_string(),
            message: message.into(),
        }
    }

    /// The clause the error was raised in.
    pub fn clause(&self) -> Clause {
        match self {
            PlanError::Structure { clause, .. }
            | PlanError::Cast { clause, .. }
            | PlanError::Dump { clause, .. } => *clause,
        }
    }

    pub fn is_structure(&self) -> bool {
        matches!(self, PlanError::Structure { .. })
    }

    pub fn is_cast(&self) -> bool {
        matches!(self, PlanError::Cast { .. })
    }

    pub fn is_dump(&self) -> bool {
        matches!(self, PlanError::Dump { .. })
    }
}

pub type PlanResult<T> = Result<T, PlanError>;
