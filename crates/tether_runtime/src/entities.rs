//! The two entities the update scenarios run against, plus the patch types fed to the mapper.

use crate::entity::{Entity, Model};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tether_ir::{EntitySchema, FieldSchema, NullNavigationPolicy, RelationshipSchema, Schema, SchemaError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Child {
    pub id: i64,
}

impl Entity for Child {
    fn schema() -> EntitySchema {
        EntitySchema::new("Child")
    }

    fn key(&self) -> i64 {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parent {
    pub id: i64,
    pub child_id: i64,
    /// `None` when the child was not loaded.
    #[serde(default)]
    pub child: Option<Child>,
}

impl Parent {
    pub fn new(id: i64, child_id: i64) -> Self {
        Self {
            id,
            child_id,
            child: None,
        }
    }
}

impl Entity for Parent {
    fn schema() -> EntitySchema {
        EntitySchema::new("Parent")
            .field(FieldSchema::integer("child_id").required())
            .belongs_to(RelationshipSchema::belongs_to("child", "Child", "child_id"))
    }

    fn key(&self) -> i64 {
        self.id
    }
}

/// Incoming values for a parent, shaped like a request body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentPatch {
    pub child_id: i64,
    #[serde(default)]
    pub child: Option<ChildPatch>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildPatch {
    pub id: i64,
}

/// Parent and child with the given policy on the parent's `child` relationship.
pub fn sample_model(policy: NullNavigationPolicy) -> Result<Arc<Schema>, SchemaError> {
    Model::builder()
        .entity::<Child>()
        .entity_with::<Parent>(|mut schema| {
            for rel in &mut schema.relationships {
                rel.on_null_navigation = policy;
            }
            schema
        })
        .build()
}
