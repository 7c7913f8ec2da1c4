use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tether_ir::{EntitySchema, Schema, SchemaError};

/// A type that maps onto one table of the model.
///
/// Navigation members serialize under the relationship name and hold either the target entity or
/// `null`. Members the schema does not declare are never persisted.
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn schema() -> EntitySchema;

    fn name() -> &'static str {
        Self::schema().name.as_str()
    }

    fn key(&self) -> i64;
}

pub struct Model;

impl Model {
    pub fn builder() -> ModelBuilder {
        ModelBuilder::default()
    }
}

#[derive(Default)]
pub struct ModelBuilder {
    schema: Schema,
}

impl ModelBuilder {
    pub fn entity<E: Entity>(self) -> Self {
        self.entity_with::<E>(|schema| schema)
    }

    /// Registers `E` with its declared schema adjusted by `configure`.
    pub fn entity_with<E: Entity>(mut self, configure: impl FnOnce(EntitySchema) -> EntitySchema) -> Self {
        self.schema.entities.push(configure(E::schema()));
        self
    }

    pub fn build(self) -> Result<Arc<Schema>, SchemaError> {
        self.schema.validate()?;
        Ok(Arc::new(self.schema))
    }
}
