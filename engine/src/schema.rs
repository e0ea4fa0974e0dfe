//! Collection registry.
//!
//! Payloads are opaque to the engine, but each mirrored collection still
//! declares the secondary indices the UI filters by and the conflict policy
//! its records follow. Collection and field names end up in SQL identifiers
//! and JSON paths, so they are restricted to `[A-Za-z][A-Za-z0-9_]*`.

use crate::{error::Result, CollectionName, ConflictPolicy, Error, SchemaVersion};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A secondary index over one top-level payload field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDef {
    /// Index name used by `query_by_index`
    pub name: String,
    /// Top-level payload field it covers
    pub field: String,
}

/// Definition of a mirrored collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionDef {
    pub name: CollectionName,
    pub indexes: Vec<IndexDef>,
    #[serde(default)]
    pub policy: ConflictPolicy,
}

impl CollectionDef {
    /// Create a collection with no indices and the default policy.
    pub fn new(name: impl Into<CollectionName>) -> Self {
        Self {
            name: name.into(),
            indexes: Vec::new(),
            policy: ConflictPolicy::default(),
        }
    }

    /// Add an index named after the field it covers.
    pub fn with_index(mut self, field: impl Into<String>) -> Self {
        let field = field.into();
        self.indexes.push(IndexDef {
            name: field.clone(),
            field,
        });
        self
    }

    pub fn with_policy(mut self, policy: ConflictPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Look up an index by name.
    pub fn index(&self, name: &str) -> Result<&IndexDef> {
        self.indexes
            .iter()
            .find(|i| i.name == name)
            .ok_or_else(|| Error::IndexNotFound {
                collection: self.name.clone(),
                index: name.to_string(),
            })
    }

    /// Name of the backing table in local storage.
    pub fn table_name(&self) -> String {
        format!("records_{}", self.name)
    }

    /// Check that names are usable as storage identifiers.
    pub fn validate(&self) -> Result<()> {
        validate_identifier(&self.name)?;
        for index in &self.indexes {
            validate_identifier(&index.name)?;
            validate_identifier(&index.field)?;
        }
        Ok(())
    }

    /// Validate a full payload for a create. Indexed fields, when present,
    /// must be scalars so they can be matched by value.
    pub fn validate_payload(&self, payload: &serde_json::Value) -> Result<()> {
        let obj = payload
            .as_object()
            .ok_or_else(|| Error::InvalidPayload("payload must be an object".into()))?;
        self.validate_indexed_fields(obj)
    }

    /// Validate a patch for an update.
    pub fn validate_patch(&self, patch: &serde_json::Value) -> Result<()> {
        let obj = patch
            .as_object()
            .ok_or_else(|| Error::InvalidPayload("patch must be an object".into()))?;
        if obj.is_empty() {
            return Err(Error::InvalidPayload("patch is empty".into()));
        }
        self.validate_indexed_fields(obj)
    }

    fn validate_indexed_fields(
        &self,
        obj: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        for index in &self.indexes {
            if let Some(value) = obj.get(&index.field) {
                if value.is_object() || value.is_array() {
                    return Err(Error::InvalidPayload(format!(
                        "indexed field '{}' must be a scalar",
                        index.field
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Check an identifier against `[A-Za-z][A-Za-z0-9_]*`.
pub fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidIdentifier(name.to_string()))
    }
}

/// All mirrored collections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    /// Schema version for migrations
    pub version: SchemaVersion,
    /// Collection definitions by name
    pub collections: BTreeMap<CollectionName, CollectionDef>,
}

impl Schema {
    /// Create an empty schema.
    pub fn new(version: SchemaVersion) -> Self {
        Self {
            version,
            collections: BTreeMap::new(),
        }
    }

    /// Add a collection to the schema.
    pub fn add_collection(&mut self, collection: CollectionDef) -> &mut Self {
        self.collections.insert(collection.name.clone(), collection);
        self
    }

    /// Builder-style method to add a collection.
    pub fn with_collection(mut self, collection: CollectionDef) -> Self {
        self.add_collection(collection);
        self
    }

    /// Get a collection definition by name.
    pub fn get_collection(&self, name: &str) -> Result<&CollectionDef> {
        self.collections
            .get(name)
            .ok_or_else(|| Error::CollectionNotFound(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &CollectionName> {
        self.collections.keys()
    }

    /// Validate every collection definition.
    pub fn validate(&self) -> Result<()> {
        self.collections
            .values()
            .try_for_each(CollectionDef::validate)
    }

    /// The cohort dashboard's collections.
    pub fn dashboard() -> Self {
        Schema::new(1)
            .with_collection(
                CollectionDef::new("tasks")
                    .with_index("batch")
                    .with_index("status")
                    .with_index("assignedTo"),
            )
            .with_collection(
                CollectionDef::new("announcements")
                    .with_index("batch")
                    .with_index("authorId"),
            )
            .with_collection(
                CollectionDef::new("studentProgress")
                    .with_index("userId")
                    .with_index("taskId")
                    .with_policy(ConflictPolicy::FieldMerge),
            )
            .with_collection(
                CollectionDef::new("settings")
                    .with_index("userId")
                    .with_policy(ConflictPolicy::FieldMerge),
            )
            .with_collection(
                CollectionDef::new("users")
                    .with_index("batch")
                    .with_index("role"),
            )
            .with_collection(
                CollectionDef::new("requests")
                    .with_index("userId")
                    .with_index("status"),
            )
            .with_collection(
                CollectionDef::new("approvals")
                    .with_index("requestId")
                    .with_index("status")
                    .with_policy(ConflictPolicy::Manual),
            )
    }
}
