//! Field types and the cast/dump service.
//!
//! Casting converts an externally supplied value into the logical value a
//! field expects. Dumping converts a logical value into its storage
//! representation. The planner consumes both through [`TypeService`]; the
//! crate ships [`BuiltinTypes`], which covers the primitive types and any
//! registered [`CustomType`].

mod custom;

pub use custom::{BinaryId, CustomType};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::query::Value;

/// Type of a schema field or of an annotated expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// No type information; values pass through unchanged.
    Any,
    Id,
    Integer,
    Float,
    Boolean,
    String,
    Binary,
    Map,
    Array(Box<FieldType>),
    /// A custom type registered with the type service by name.
    Custom(String),
}

impl FieldType {
    pub fn array(inner: FieldType) -> Self {
        FieldType::Array(Box::new(inner))
    }

    pub fn custom(name: &str) -> Self {
        FieldType::Custom(name.to_string())
    }

    /// Element type of an array type.
    pub fn element(&self) -> Option<&FieldType> {
        match self {
            FieldType::Array(inner) => Some(inner),
            _ => None,
        }
    }

    pub fn is_any(&self) -> bool {
        matches!(self, FieldType::Any)
    }

    /// Primitive type of a literal value, used when a literal is the only
    /// source of type information in a comparison.
    pub fn of_value(value: &Value) -> FieldType {
        match value {
            Value::Bool(_) => FieldType::Boolean,
            Value::Int(_) => FieldType::Integer,
            Value::Float(_) => FieldType::Float,
            Value::String(_) => FieldType::String,
            Value::Binary(_) => FieldType::Binary,
            Value::Map(_) => FieldType::Map,
            Value::Null | Value::List(_) => FieldType::Any,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Any => f.write_str("any"),
            FieldType::Id => f.write_str("id"),
            FieldType::Integer => f.write_str("integer"),
            FieldType::Float => f.write_str("float"),
            FieldType::Boolean => f.write_str("boolean"),
            FieldType::String => f.write_str("string"),
            FieldType::Binary => f.write_str("binary"),
            FieldType::Map => f.write_str("map"),
            FieldType::Array(inner) => write!(f, "array({})", inner),
            FieldType::Custom(name) => f.write_str(name),
        }
    }
}

/// Failure reported by a type service.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TypeError {
    #[error("invalid value for type {ty}")]
    Invalid { ty: FieldType },

    #[error("unknown custom type `{0}`")]
    UnknownType(String),
}

impl TypeError {
    fn invalid(ty: &FieldType) -> Self {
        TypeError::Invalid { ty: ty.clone() }
    }
}

/// Per-type cast and dump operations consumed by the planner.
pub trait TypeService: Send + Sync {
    /// Convert an externally supplied value into the logical value of `ty`.
    fn cast(&self, ty: &FieldType, value: &Value) -> Result<Value, TypeError>;

    /// Convert a logical value of `ty` into its storage representation.
    fn dump(&self, ty: &FieldType, value: &Value) -> Result<Value, TypeError>;
}

/// Primitive types plus a table of named custom types.
#[derive(Debug, Clone)]
pub struct BuiltinTypes {
    custom: HashMap<String, Arc<dyn CustomType>>,
}

impl Default for BuiltinTypes {
    fn default() -> Self {
        Self::new()
    }
}

impl BuiltinTypes {
    /// Builtins with `binary_id` registered.
    pub fn new() -> Self {
        Self {
            custom: HashMap::new(),
        }
        .with_custom(Arc::new(BinaryId))
    }

    pub fn with_custom(mut self, ty: Arc<dyn CustomType>) -> Self {
        self.custom.insert(ty.name().to_string(), ty);
        self
    }

    fn lookup(&self, name: &str) -> Result<&Arc<dyn CustomType>, TypeError> {
        self.custom
            .get(name)
            .ok_or_else(|| TypeError::UnknownType(name.to_string()))
    }
}

impl TypeService for BuiltinTypes {
    fn cast(&self, ty: &FieldType, value: &Value) -> Result<Value, TypeError> {
        if value.is_null() {
            return Ok(Value::Null);
        }

        match (ty, value) {
            (FieldType::Any, v) => Ok(v.clone()),
            (FieldType::Id | FieldType::Integer, Value::Int(i)) => Ok(Value::Int(*i)),
            (FieldType::Id | FieldType::Integer, Value::String(s)) => s
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| TypeError::invalid(ty)),
            (FieldType::Float, Value::Float(x)) => Ok(Value::Float(*x)),
            (FieldType::Float, Value::Int(i)) => Ok(Value::Float(*i as f64)),
            (FieldType::Float, Value::String(s)) => s
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| TypeError::invalid(ty)),
            (FieldType::Boolean, Value::Bool(b)) => Ok(Value::Bool(*b)),
            (FieldType::Boolean, Value::String(s)) => match s.as_str() {
                "true" | "1" => Ok(Value::Bool(true)),
                "false" | "0" => Ok(Value::Bool(false)),
                _ => Err(TypeError::invalid(ty)),
            },
            (FieldType::String, Value::String(s)) => Ok(Value::String(s.clone())),
            (FieldType::Binary, Value::Binary(b)) => Ok(Value::Binary(b.clone())),
            (FieldType::Binary, Value::String(s)) => Ok(Value::Binary(s.as_bytes().to_vec())),
            (FieldType::Map, Value::Map(m)) => Ok(Value::Map(m.clone())),
            (FieldType::Array(inner), Value::List(items)) => items
                .iter()
                .map(|item| self.cast(inner, item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List),
            (FieldType::Custom(name), v) => self.lookup(name)?.cast(v),
            _ => Err(TypeError::invalid(ty)),
        }
    }

    fn dump(&self, ty: &FieldType, value: &Value) -> Result<Value, TypeError> {
        if value.is_null() {
            return Ok(Value::Null);
        }

        match (ty, value) {
            (FieldType::Any, v) => Ok(v.clone()),
            (FieldType::Id | FieldType::Integer, Value::Int(i)) => Ok(Value::Int(*i)),
            (FieldType::Float, Value::Float(x)) => Ok(Value::Float(*x)),
            (FieldType::Float, Value::Int(i)) => Ok(Value::Float(*i as f64)),
            (FieldType::Boolean, Value::Bool(b)) => Ok(Value::Bool(*b)),
            (FieldType::String, Value::String(s)) => Ok(Value::String(s.clone())),
            (FieldType::Binary, Value::Binary(b)) => Ok(Value::Binary(b.clone())),
            (FieldType::Binary, Value::String(s)) => Ok(Value::Binary(s.as_bytes().to_vec())),
            (FieldType::Map, Value::Map(m)) => Ok(Value::Map(m.clone())),
            (FieldType::Array(inner), Value::List(items)) => items
                .iter()
                .map(|item| self.dump(inner, item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List),
            (FieldType::Custom(name), v) => {
                let custom = self.lookup(name)?;
                let stored = custom.dump(v)?;
                self.dump(&custom.storage_type(), &stored)
            }
            _ => Err(TypeError::invalid(ty)),
        }
    }
}
