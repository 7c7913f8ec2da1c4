use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

pub mod utils;

pub use symbol_table::GlobalSymbol as Symbol;

use utils::{is_valid_identifier, to_snake_case};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Schema {
    pub entities: Vec<EntitySchema>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity: EntitySchema) -> Self {
        self.entities.push(entity);
        self
    }

    pub fn entity(&self, name: &str) -> Option<&EntitySchema> {
        self.entities.iter().find(|e| e.name.as_str() == name)
    }

    pub fn validate(&self) -> Result<(), SchemaError> {
        let mut names = HashSet::new();
        let mut tables = HashSet::new();

        for entity in &self.entities {
            for ident in [entity.name, entity.table_name] {
                if !is_valid_identifier(ident.as_str()) {
                    return Err(SchemaError::InvalidIdentifier(ident.to_string()));
                }
            }
            if !names.insert(entity.name) {
                return Err(SchemaError::DuplicateEntity(entity.name.to_string()));
            }
            if !tables.insert(entity.table_name) {
                return Err(SchemaError::DuplicateTable(entity.table_name.to_string()));
            }
            entity.validate(self)?;
        }

        self.dependency_order().map(|_| ())
    }

    /// Entities ordered so that every relationship target precedes the entities pointing at it.
    /// Self-references are ignored; any other cycle is an error.
    pub fn dependency_order(&self) -> Result<Vec<&EntitySchema>, SchemaError> {
        let mut ordered: Vec<&EntitySchema> = Vec::with_capacity(self.entities.len());
        let mut placed: HashSet<Symbol> = HashSet::new();

        while ordered.len() < self.entities.len() {
            let ready: Vec<&EntitySchema> = self
                .entities
                .iter()
                .filter(|e| !placed.contains(&e.name))
                .filter(|e| {
                    e.relationships
                        .iter()
                        .all(|r| r.target_entity == e.name || placed.contains(&r.target_entity))
                })
                .collect();

            if ready.is_empty() {
                let stuck = self
                    .entities
                    .iter()
                    .filter(|e| !placed.contains(&e.name))
                    .map(|e| e.name.to_string())
                    .collect();
                return Err(SchemaError::DependencyCycle(stuck));
            }

            for entity in ready {
                placed.insert(entity.name);
                ordered.push(entity);
            }
        }

        Ok(ordered)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitySchema {
    pub name: Symbol,
    pub table_name: Symbol,
    pub key: KeySchema,
    pub fields: Vec<FieldSchema>,
    pub relationships: Vec<RelationshipSchema>,
}

impl EntitySchema {
    /// Starts an entity keyed by an integer `id`.
    pub fn new(name: &str) -> Self {
        Self {
            name: Symbol::from(name),
            table_name: Symbol::from(to_snake_case(name).as_str()),
            key: KeySchema {
                field: Symbol::from("id"),
            },
            fields: vec![FieldSchema::integer("id").required()],
            relationships: vec![],
        }
    }

    pub fn table(mut self, table_name: &str) -> Self {
        self.table_name = Symbol::from(table_name);
        self
    }

    /// Renames the key column.
    pub fn key(mut self, field: &str) -> Self {
        let new_field = Symbol::from(field);
        if let Some(existing) = self.fields.iter_mut().find(|f| f.name == self.key.field) {
            existing.name = new_field;
        }
        self.key = KeySchema { field: new_field };
        self
    }

    pub fn field(mut self, field: FieldSchema) -> Self {
        self.fields.push(field);
        self
    }

    pub fn belongs_to(mut self, relationship: RelationshipSchema) -> Self {
        self.relationships.push(relationship);
        self
    }

    pub fn get_field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name.as_str() == name)
    }

    pub fn relationship(&self, name: &str) -> Option<&RelationshipSchema> {
        self.relationships.iter().find(|r| r.name.as_str() == name)
    }

    pub fn key_field(&self) -> &str {
        self.key.field.as_str()
    }

    fn validate(&self, schema: &Schema) -> Result<(), SchemaError> {
        let entity = self.name.to_string();

        let mut seen = HashSet::new();
        for field in &self.fields {
            if !is_valid_identifier(field.name.as_str()) {
                return Err(SchemaError::InvalidIdentifier(field.name.to_string()));
            }
            if !seen.insert(field.name) {
                return Err(SchemaError::DuplicateField {
                    entity,
                    field: field.name.to_string(),
                });
            }
        }

        match self.get_field(self.key.field.as_str()) {
            None => {
                return Err(SchemaError::MissingKeyField {
                    entity,
                    field: self.key.field.to_string(),
                });
            }
            Some(f) if f.field_type != FieldType::Integer => {
                return Err(SchemaError::NonIntegerKey {
                    entity,
                    field: f.name.to_string(),
                });
            }
            Some(_) => {}
        }

        for rel in &self.relationships {
            if !is_valid_identifier(rel.name.as_str()) {
                return Err(SchemaError::InvalidIdentifier(rel.name.to_string()));
            }
            if self.get_field(rel.name.as_str()).is_some() || !seen.insert(rel.name) {
                return Err(SchemaError::NavigationCollision {
                    entity,
                    name: rel.name.to_string(),
                });
            }
            if schema.entity(rel.target_entity.as_str()).is_none() {
                return Err(SchemaError::UnknownTarget {
                    entity,
                    relationship: rel.name.to_string(),
                    target: rel.target_entity.to_string(),
                });
            }
            let fk = self
                .get_field(rel.foreign_key.as_str())
                .ok_or_else(|| SchemaError::MissingForeignKey {
                    entity: entity.clone(),
                    relationship: rel.name.to_string(),
                    field: rel.foreign_key.to_string(),
                })?;
            if fk.field_type != FieldType::Integer {
                return Err(SchemaError::NonIntegerKey {
                    entity,
                    field: fk.name.to_string(),
                });
            }
            if fk.required && rel.on_delete == DeleteBehavior::SetNull {
                return Err(SchemaError::SetNullOnRequired {
                    entity,
                    relationship: rel.name.to_string(),
                });
            }
        }

        Ok(())
    }
}

/// Keys are integers assigned by the caller; the store never generates them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct KeySchema {
    pub field: Symbol,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct FieldSchema {
    pub name: Symbol,
    pub field_type: FieldType,
    pub required: bool,
}

impl FieldSchema {
    fn with_type(name: &str, field_type: FieldType) -> Self {
        Self {
            name: Symbol::from(name),
            field_type,
            required: false,
        }
    }

    pub fn integer(name: &str) -> Self {
        Self::with_type(name, FieldType::Integer)
    }

    pub fn text(name: &str) -> Self {
        Self::with_type(name, FieldType::Text)
    }

    pub fn float(name: &str) -> Self {
        Self::with_type(name, FieldType::Float)
    }

    pub fn boolean(name: &str) -> Self {
        Self::with_type(name, FieldType::Boolean)
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FieldType {
    Integer,
    Text,
    Float,
    Boolean,
}

/// A `belongs_to` association: `foreign_key` on the declaring entity holds the key of `target_entity`,
/// and `name` is the navigation member carrying the loaded target.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RelationshipSchema {
    pub name: Symbol,
    pub target_entity: Symbol,
    pub foreign_key: Symbol,
    pub on_delete: DeleteBehavior,
    pub on_null_navigation: NullNavigationPolicy,
}

impl RelationshipSchema {
    pub fn belongs_to(name: &str, target_entity: &str, foreign_key: &str) -> Self {
        Self {
            name: Symbol::from(name),
            target_entity: Symbol::from(target_entity),
            foreign_key: Symbol::from(foreign_key),
            on_delete: DeleteBehavior::default(),
            on_null_navigation: NullNavigationPolicy::default(),
        }
    }

    pub fn on_delete(mut self, behavior: DeleteBehavior) -> Self {
        self.on_delete = behavior;
        self
    }

    pub fn on_null_navigation(mut self, policy: NullNavigationPolicy) -> Self {
        self.on_null_navigation = policy;
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeleteBehavior {
    #[default]
    Restrict,
    Cascade,
    SetNull,
}

impl DeleteBehavior {
    pub fn as_sql(self) -> &'static str {
        match self {
            DeleteBehavior::Restrict => "RESTRICT",
            DeleteBehavior::Cascade => "CASCADE",
            DeleteBehavior::SetNull => "SET NULL",
        }
    }
}

/// What saving does when a loaded navigation was explicitly cleared.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum NullNavigationPolicy {
    /// The cleared navigation only detaches the loaded object; the scalar foreign key is persisted as set.
    #[default]
    KeepForeignKey,
    /// The update is refused before anything is staged.
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("invalid identifier '{0}'")]
    InvalidIdentifier(String),
    #[error("entity '{0}' is declared twice")]
    DuplicateEntity(String),
    #[error("table '{0}' is used by more than one entity")]
    DuplicateTable(String),
    #[error("entity '{entity}' declares field '{field}' twice")]
    DuplicateField { entity: String, field: String },
    #[error("entity '{entity}' has no key field '{field}'")]
    MissingKeyField { entity: String, field: String },
    #[error("field '{field}' of '{entity}' holds a key and must be an integer")]
    NonIntegerKey { entity: String, field: String },
    #[error("navigation '{name}' of '{entity}' collides with another member")]
    NavigationCollision { entity: String, name: String },
    #[error("relationship '{relationship}' of '{entity}' targets unknown entity '{target}'")]
    UnknownTarget {
        entity: String,
        relationship: String,
        target: String,
    },
    #[error("relationship '{relationship}' of '{entity}' uses missing foreign key '{field}'")]
    MissingForeignKey {
        entity: String,
        relationship: String,
        field: String,
    },
    #[error("relationship '{relationship}' of '{entity}' cannot set a required foreign key to null on delete")]
    SetNullOnRequired { entity: String, relationship: String },
    #[error("relationship cycle between {0:?}")]
    DependencyCycle(Vec<String>),
}
