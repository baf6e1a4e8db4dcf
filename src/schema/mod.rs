//! Schema metadata consumed by the planner.
//!
//! Schemas are long-lived and read-only from the planner's point of view. The
//! planner reaches them through the [`SchemaRegistry`] trait; [`Registry`] is a
//! map-backed implementation that can also be loaded from TOML:
//!
//! ```toml
//! [[schemas]]
//! name = "Post"
//! source = "posts"
//! primary_key = "id"
//!
//! [[schemas.fields]]
//! name = "id"
//! type = "id"
//!
//! [[schemas.fields]]
//! name = "title"
//! type = "string"
//! ```

mod association;

pub use association::{AssocFilter, AssocKind, AssociationDef, FilterCondition, Related};

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::FieldType;

/// A schema field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: FieldType,
    /// Virtual fields exist on the schema but not in storage.
    #[serde(default, rename = "virtual")]
    pub is_virtual: bool,
    /// Excluded fields are not loaded by a default select.
    #[serde(default)]
    pub exclude_from_load: bool,
}

impl FieldDef {
    pub fn new(name: &str, ty: FieldType) -> Self {
        Self {
            name: name.to_string(),
            ty,
            is_virtual: false,
            exclude_from_load: false,
        }
    }
}

/// Schema metadata for one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub name: String,
    /// Table name.
    pub source: String,
    /// Fields in declaration order.
    #[serde(default)]
    pub fields: Vec<FieldDef>,
    #[serde(default)]
    pub primary_key: Option<String>,
    /// Declared default prefix.
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub associations: Vec<AssociationDef>,
}

impl Schema {
    /// Schema with an explicit table name and an `id` primary key.
    pub fn new(name: &str, source: &str) -> Self {
        Self {
            name: name.to_string(),
            source: source.to_string(),
            fields: vec![FieldDef::new("id", FieldType::Id)],
            primary_key: Some("id".to_string()),
            prefix: None,
            associations: Vec::new(),
        }
    }

    pub fn field(mut self, name: &str, ty: FieldType) -> Self {
        self.fields.push(FieldDef::new(name, ty));
        self
    }

    pub fn virtual_field(mut self, name: &str, ty: FieldType) -> Self {
        self.fields.push(FieldDef {
            is_virtual: true,
            ..FieldDef::new(name, ty)
        });
        self
    }

    /// Field that is skipped by default selects.
    pub fn unloaded_field(mut self, name: &str, ty: FieldType) -> Self {
        self.fields.push(FieldDef {
            exclude_from_load: true,
            ..FieldDef::new(name, ty)
        });
        self
    }

    pub fn primary_key(mut self, name: &str, ty: FieldType) -> Self {
        self.fields.retain(|f| f.name != "id" || name == "id");
        match self.fields.iter_mut().find(|f| f.name == name) {
            Some(existing) => existing.ty = ty,
            None => self.fields.insert(0, FieldDef::new(name, ty)),
        }
        self.primary_key = Some(name.to_string());
        self
    }

    /// Key the owner side of `has_many`/`has_one`/`many_to_many` joins on.
    fn owner_key(&self) -> &str {
        self.primary_key.as_deref().unwrap_or("id")
    }

    pub fn prefix(mut self, prefix: &str) -> Self {
        self.prefix = Some(prefix.to_string());
        self
    }

    /// `belongs_to`: also declares the `<name>_id` field if missing.
    pub fn belongs_to(mut self, name: &str, related: &str) -> Self {
        let assoc = AssociationDef::belongs_to(name, related);
        if self.field_def(&assoc.owner_key).is_none() {
            self.fields.push(FieldDef::new(&assoc.owner_key, FieldType::Id));
        }
        self.associations.push(assoc);
        self
    }

    pub fn has_many(mut self, name: &str, related: &str) -> Self {
        let mut assoc =
            AssociationDef::has_many(&self.name, name, Related::Schema(related.to_string()));
        assoc.owner_key = self.owner_key().to_string();
        self.associations.push(assoc);
        self
    }

    pub fn has_one(mut self, name: &str, related: &str) -> Self {
        let mut assoc = AssociationDef::has_one(&self.name, name, related);
        assoc.owner_key = self.owner_key().to_string();
        self.associations.push(assoc);
        self
    }

    pub fn many_to_many(mut self, name: &str, related: &str, join_through: Related) -> Self {
        let mut assoc = AssociationDef::many_to_many(&self.name, name, related, join_through);
        assoc.owner_key = self.owner_key().to_string();
        self.associations.push(assoc);
        self
    }

    pub fn has_through(mut self, name: &str, chain: &[&str]) -> Self {
        self.associations.push(AssociationDef::through(name, chain));
        self
    }

    /// Add a fully specified association.
    pub fn association(mut self, assoc: AssociationDef) -> Self {
        self.associations.push(assoc);
        self
    }

    pub fn field_def(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn association_def(&self, name: &str) -> Option<&AssociationDef> {
        self.associations.iter().find(|a| a.name == name)
    }

    /// Fields loaded by a default select, in declaration order.
    pub fn load_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields
            .iter()
            .filter(|f| !f.is_virtual && !f.exclude_from_load)
    }
}

/// Lookup capability for schema metadata.
pub trait SchemaRegistry: Send + Sync {
    fn lookup(&self, schema: &str) -> Option<&Schema>;
}

/// Errors loading a registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Failed to parse schema registry: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Duplicate schema: {0}")]
    Duplicate(String),
}

/// Map-backed schema registry.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    schemas: HashMap<String, Schema>,
}

#[derive(Deserialize)]
struct RegistryFile {
    #[serde(default)]
    schemas: Vec<Schema>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, schema: Schema) -> Self {
        self.insert(schema);
        self
    }

    pub fn insert(&mut self, schema: Schema) {
        self.schemas.insert(schema.name.clone(), schema);
    }

    /// Load schemas from a TOML document with a `[[schemas]]` array.
    pub fn from_toml_str(content: &str) -> Result<Self, RegistryError> {
        let file: RegistryFile = toml::from_str(content)?;
        let mut registry = Registry::new();
        for schema in file.schemas {
            if registry.schemas.contains_key(&schema.name) {
                return Err(RegistryError::Duplicate(schema.name));
            }
            registry.insert(schema);
        }
        Ok(registry)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

impl SchemaRegistry for Registry {
    fn lookup(&self, schema: &str) -> Option<&Schema> {
        self.schemas.get(schema)
    }
}
