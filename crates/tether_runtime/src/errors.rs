use crate::mapper::MappingError;
use serde_json::Value;
use tether_ir::SchemaError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("mapping error: {0}")]
    Mapping(#[from] MappingError),

    #[error("entity '{0}' is not part of the model")]
    UnknownEntity(String),

    #[error("entity '{entity}' has no navigation '{navigation}'")]
    UnknownNavigation { entity: String, navigation: String },

    #[error("entity '{entity}' has no field '{field}'")]
    UnknownField { entity: String, field: String },

    #[error("invalid identifier '{0}'")]
    InvalidIdentifier(String),

    #[error("invalid record for '{entity}': {message}")]
    InvalidRecord { entity: String, message: String },

    #[error("'{entity}' has no usable key value")]
    MissingKey { entity: String },

    #[error("'{entity}' {key} is already tracked by this session")]
    AlreadyTracked { entity: String, key: i64 },

    #[error("no '{entity}' row matched the query")]
    NotFound { entity: String },

    #[error(
        "'{entity}' {key}: navigation '{relationship}' points at {navigation} but foreign key is {foreign_key}"
    )]
    RelationshipConflict {
        entity: String,
        key: i64,
        relationship: String,
        foreign_key: Value,
        navigation: Value,
    },

    #[error("'{entity}' {key}: required relationship '{relationship}' was cleared")]
    RequiredRelationshipSevered {
        entity: String,
        key: i64,
        relationship: String,
    },
}

pub type Result<T, E = RuntimeError> = std::result::Result<T, E>;
