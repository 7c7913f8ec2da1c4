use crate::config::StoreConfig;
use crate::errors::{Result, RuntimeError};
use crate::persistence::SchemaManager;
use crate::session::Session;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tether_ir::utils::is_valid_identifier;
use tether_ir::{EntitySchema, Schema, Symbol};

pub mod sqlite;

use sqlite::SqliteDataStore;

/// One row as column name to value.
pub type Record = serde_json::Map<String, Value>;

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Insert {
        table: Symbol,
        key_field: Symbol,
        record: Record,
    },
    Update {
        table: Symbol,
        key_field: Symbol,
        key: i64,
        changes: Record,
    },
    Delete {
        table: Symbol,
        key_field: Symbol,
        key: i64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Inserted(i64),
    Affected(u64),
}

impl WriteOutcome {
    pub fn rows(&self) -> u64 {
        match self {
            WriteOutcome::Inserted(_) => 1,
            WriteOutcome::Affected(rows) => *rows,
        }
    }
}

#[async_trait]
pub trait DataStore: Send + Sync {
    async fn get(&self, table: &str, key_field: &str, key: i64) -> Result<Option<Record>>;
    async fn find_first(&self, table: &str, filters: &[(Symbol, Value)], order_by: &str) -> Result<Option<Record>>;
    async fn count(&self, table: &str) -> Result<i64>;
    /// Runs the whole batch in one transaction; nothing is kept when any statement fails.
    /// An update or delete that touches no row fails the batch with `NotFound`.
    async fn apply(&self, batch: &[WriteOp]) -> Result<Vec<WriteOutcome>>;
    async fn table_exists(&self, table: &str) -> Result<bool>;
    async fn execute(&self, sql: &str) -> Result<u64>;
}

pub(crate) fn validate_identifier(ident: &str) -> Result<()> {
    if is_valid_identifier(ident) {
        Ok(())
    } else {
        Err(RuntimeError::InvalidIdentifier(ident.to_string()))
    }
}

/// A single exclusive connection to one database plus the model it was opened with.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    datastore: Arc<dyn DataStore>,
    schema: Arc<Schema>,
}

impl Store {
    pub async fn connect(config: &StoreConfig, schema: Arc<Schema>) -> Result<Self> {
        schema.validate()?;

        let options = SqliteConnectOptions::from_str(&config.database_url)?
            .foreign_keys(config.foreign_keys)
            .create_if_missing(config.create_if_missing);

        // An in-memory database lives exactly as long as its connection, so the
        // pool holds one connection and never recycles it.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect_with(options)
            .await?;

        tracing::debug!(url = %config.database_url, entities = schema.entities.len(), "store connected");

        Ok(Self {
            datastore: Arc::new(SqliteDataStore::new(pool.clone())),
            pool,
            schema,
        })
    }

    pub async fn in_memory(schema: Arc<Schema>) -> Result<Self> {
        Self::connect(&StoreConfig::in_memory(), schema).await
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn datastore(&self) -> &Arc<dyn DataStore> {
        &self.datastore
    }

    pub fn schema_manager(&self) -> SchemaManager {
        SchemaManager::new(self.datastore.clone(), self.schema.clone())
    }

    /// Creates missing tables from the model. Returns whether anything was created.
    pub async fn ensure_created(&self) -> Result<bool> {
        self.schema_manager().ensure_created().await
    }

    pub fn session(&self) -> Session {
        Session::new(self.schema.clone(), self.datastore.clone())
    }

    pub async fn count(&self, entity: &str) -> Result<i64> {
        let schema = self.entity_schema(entity)?;
        self.datastore.count(schema.table_name.as_str()).await
    }

    pub fn entity_schema(&self, entity: &str) -> Result<&EntitySchema> {
        self.schema
            .entity(entity)
            .ok_or_else(|| RuntimeError::UnknownEntity(entity.to_string()))
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}
