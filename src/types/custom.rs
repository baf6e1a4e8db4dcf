//! Custom (non-primitive) field types.

use std::fmt::Debug;

use uuid::Uuid;

use super::{FieldType, TypeError};
use crate::query::Value;

/// A named type whose logical value differs from its storage value.
///
/// Cast produces the logical value; dump produces a value of
/// [`storage_type`](CustomType::storage_type), which the builtin dump then
/// validates.
pub trait CustomType: Debug + Send + Sync {
    fn name(&self) -> &str;

    fn storage_type(&self) -> FieldType;

    fn cast(&self, value: &Value) -> Result<Value, TypeError>;

    fn dump(&self, value: &Value) -> Result<Value, TypeError>;
}

/// UUID identifier: a hyphenated string when loaded, 16 raw bytes when stored.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryId;

impl BinaryId {
    fn invalid() -> TypeError {
        TypeError::Invalid {
            ty: FieldType::custom("binary_id"),
        }
    }
}

impl CustomType for BinaryId {
    fn name(&self) -> &str {
        "binary_id"
    }

    fn storage_type(&self) -> FieldType {
        FieldType::Binary
    }

    fn cast(&self, value: &Value) -> Result<Value, TypeError> {
        let uuid = match value {
            Value::String(s) => Uuid::parse_str(s).map_err(|_| Self::invalid())?,
            Value::Binary(bytes) => Uuid::from_slice(bytes).map_err(|_| Self::invalid())?,
            _ => return Err(Self::invalid()),
        };
        Ok(Value::String(uuid.hyphenated().to_string()))
    }

    fn dump(&self, value: &Value) -> Result<Value, TypeError> {
        match value {
            Value::String(s) => {
                let uuid = Uuid::parse_str(s).map_err(|_| Self::invalid())?;
                Ok(Value::Binary(uuid.as_bytes().to_vec()))
            }
            _ => Err(Self::invalid()),
        }
    }
}
