use crate::errors::Result;
use crate::store::{DataStore, validate_identifier};
use std::sync::Arc;
use tether_ir::{EntitySchema, FieldType, Schema};

/// Creates and drops tables straight from the declared model. There is no migration history.
pub struct SchemaManager {
    datastore: Arc<dyn DataStore>,
    schema: Arc<Schema>,
}

impl SchemaManager {
    pub fn new(datastore: Arc<dyn DataStore>, schema: Arc<Schema>) -> Self {
        Self { datastore, schema }
    }

    /// Returns `true` when at least one table had to be created.
    pub async fn ensure_created(&self) -> Result<bool> {
        let mut created = false;

        for entity in self.schema.dependency_order()? {
            if self.datastore.table_exists(entity.table_name.as_str()).await? {
                tracing::debug!(table = %entity.table_name, "table already present");
                continue;
            }
            let sql = Self::create_table_sql(entity, &self.schema)?;
            self.datastore.execute(&sql).await?;
            tracing::info!(entity = %entity.name, table = %entity.table_name, "created table");
            created = true;
        }

        Ok(created)
    }

    /// Drops every model table, dependents first.
    pub async fn ensure_deleted(&self) -> Result<()> {
        let order = self.schema.dependency_order()?;
        for entity in order.into_iter().rev() {
            validate_identifier(entity.table_name.as_str())?;
            let sql = format!("DROP TABLE IF EXISTS \"{}\"", entity.table_name);
            self.datastore.execute(&sql).await?;
            tracing::info!(table = %entity.table_name, "dropped table");
        }
        Ok(())
    }

    pub fn create_table_sql(entity: &EntitySchema, schema: &Schema) -> Result<String> {
        validate_identifier(entity.table_name.as_str())?;
        let mut sql = format!("CREATE TABLE IF NOT EXISTS \"{}\" (", entity.table_name);
        let mut defs = Vec::with_capacity(entity.fields.len());

        for field in &entity.fields {
            validate_identifier(field.name.as_str())?;
            let col_type = match field.field_type {
                FieldType::Integer => "INTEGER",
                FieldType::Text => "TEXT",
                FieldType::Float => "REAL",
                FieldType::Boolean => "BOOLEAN",
            };

            let mut def = format!("\"{}\" {}", field.name, col_type);

            if field.name == entity.key.field {
                def.push_str(" NOT NULL PRIMARY KEY");
            } else if field.required {
                def.push_str(" NOT NULL");
            }

            if let Some(rel) = entity.relationships.iter().find(|r| r.foreign_key == field.name)
                && let Some(target) = schema.entity(rel.target_entity.as_str())
            {
                def.push_str(&format!(
                    " REFERENCES \"{}\" (\"{}\") ON DELETE {}",
                    target.table_name,
                    target.key.field,
                    rel.on_delete.as_sql()
                ));
            }

            defs.push(def);
        }

        sql.push_str(&defs.join(", "));
        sql.push(')');
        Ok(sql)
    }
}
