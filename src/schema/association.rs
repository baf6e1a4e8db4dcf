//! Association definitions.
//!
//! Every association resolves to the same join shape:
//! `child.related_key == parent.owner_key`. For `belongs_to` the owner key is
//! the foreign key on the parent; for `has_many`/`has_one` the related key is
//! the foreign key on the child.

use inflector::Inflector;
use serde::{Deserialize, Serialize};

use crate::query::Value;

/// Target of an association or of a many-to-many join-through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Related {
    /// A registered schema, by name.
    Schema(String),
    /// A bare table without schema metadata.
    Table(String),
}

/// Association cardinality and traversal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssocKind {
    BelongsTo,
    HasMany,
    HasOne,
    ManyToMany {
        join_through: Related,
        /// Column on the join-through table pointing at the owner.
        join_owner_key: String,
        /// Column on the join-through table pointing at the related row.
        join_related_key: String,
        /// Filters applied to the join-through binding.
        #[serde(default)]
        join_where: Vec<AssocFilter>,
    },
    /// Chain of association names, each resolved on the previous hop's target.
    Through(Vec<String>),
}

/// Extra condition attached to an association.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssocFilter {
    pub field: String,
    pub condition: FilterCondition,
}

/// Shape of an association filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterCondition {
    /// `field == value`
    Eq(Value),
    /// `is_nil(field)`
    IsNil,
    /// `not(is_nil(field))`
    NotNil,
    /// `field in [values...]`
    In(Vec<Value>),
    /// Raw text whose `?` markers stand for the field.
    Fragment(String),
}

impl AssocFilter {
    pub fn new(field: &str, condition: FilterCondition) -> Self {
        Self {
            field: field.to_string(),
            condition,
        }
    }
}

/// A declared association.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssociationDef {
    pub name: String,
    pub kind: AssocKind,
    /// Target. Ignored for `through` associations.
    pub related: Related,
    /// Key on the owning schema.
    pub owner_key: String,
    /// Key on the related schema.
    pub related_key: String,
    /// Filters applied to the related binding.
    #[serde(default)]
    pub filters: Vec<AssocFilter>,
}

impl AssociationDef {
    /// `belongs_to :post, Post` keyed by `post_id` on the owner.
    pub fn belongs_to(name: &str, related: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: AssocKind::BelongsTo,
            related: Related::Schema(related.to_string()),
            owner_key: name.to_foreign_key(),
            related_key: "id".to_string(),
            filters: Vec::new(),
        }
    }

    /// `has_many :comments, Comment` keyed by `<owner>_id` on the related schema.
    pub fn has_many(owner: &str, name: &str, related: Related) -> Self {
        Self {
            name: name.to_string(),
            kind: AssocKind::HasMany,
            related,
            owner_key: "id".to_string(),
            related_key: owner.to_foreign_key(),
            filters: Vec::new(),
        }
    }

    pub fn has_one(owner: &str, name: &str, related: &str) -> Self {
        Self {
            kind: AssocKind::HasOne,
            ..Self::has_many(owner, name, Related::Schema(related.to_string()))
        }
    }

    /// `many_to_many :tags, Tag, join_through: "posts_tags"`
    pub fn many_to_many(owner: &str, name: &str, related: &str, join_through: Related) -> Self {
        Self {
            name: name.to_string(),
            kind: AssocKind::ManyToMany {
                join_through,
                join_owner_key: owner.to_foreign_key(),
                join_related_key: related.to_foreign_key(),
                join_where: Vec::new(),
            },
            related: Related::Schema(related.to_string()),
            owner_key: "id".to_string(),
            related_key: "id".to_string(),
            filters: Vec::new(),
        }
    }

    /// `has_many :comment_authors, through: [:comments, :author]`
    pub fn through(name: &str, chain: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            kind: AssocKind::Through(chain.iter().map(|s| s.to_string()).collect()),
            related: Related::Table(String::new()),
            owner_key: String::new(),
            related_key: String::new(),
            filters: Vec::new(),
        }
    }

    pub fn with_keys(mut self, owner_key: &str, related_key: &str) -> Self {
        self.owner_key = owner_key.to_string();
        self.related_key = related_key.to_string();
        self
    }

    pub fn with_filter(mut self, field: &str, condition: FilterCondition) -> Self {
        self.filters.push(AssocFilter::new(field, condition));
        self
    }

    pub fn with_join_filter(mut self, field: &str, condition: FilterCondition) -> Self {
        if let AssocKind::ManyToMany { join_where, .. } = &mut self.kind {
            join_where.push(AssocFilter::new(field, condition));
        }
        self
    }
}
