//! # Sieve
//!
//! A query planner for schema-backed query expressions.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │          QueryExpr (bindings, pins, assoc joins)         │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [plan]
//! ┌─────────────────────────────────────────────────────────┐
//! │   bound sources + expanded joins + positional params     │
//! │                    + cache key                           │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [normalize]
//! ┌─────────────────────────────────────────────────────────┐
//! │   validated tree + dumped literals + expanded select     │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Schema metadata comes from a [`schema::SchemaRegistry`], value conversion
//! from a [`types::TypeService`] and dialect limits from a
//! [`dialect::SqlCapabilities`]. The planner owns none of them.

pub mod cache;
pub mod config;
pub mod dialect;
pub mod error;
pub mod planner;
pub mod query;
pub mod schema;
pub mod types;

pub use cache::CacheKey;
pub use error::{Clause, PlanError, PlanResult};
pub use planner::{Operation, Plan, Planner, SelectMetadata};
pub use query::{QueryExpr, Value};

/// Re-exports for convenient usage.
pub mod prelude {
    pub use crate::cache::{CacheKey, KeyNode};
    pub use crate::config::Settings;
    pub use crate::dialect::{Dialect, Postgres, SqlCapabilities};
    pub use crate::error::{Clause, PlanError, PlanResult};
    pub use crate::planner::{
        AssocSelect, BoundParameter, Operation, Plan, Planner, SelectMetadata, SelectShape,
    };
    pub use crate::query::{
        call, count, dynamic, field, fragment, lit, lit_null, list, pin, pin_keyword, take_map,
        take_struct, Expr, JoinExpr, JoinQual, OrderByItem, Preload, QueryExpr, Source, UpdateOp,
        Value, WindowDef,
    };
    pub use crate::schema::{AssociationDef, FilterCondition, Registry, Related, Schema};
    pub use crate::types::{BuiltinTypes, FieldType};
}
