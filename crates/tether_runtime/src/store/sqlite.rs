use super::{DataStore, Record, WriteOp, WriteOutcome, validate_identifier};
use crate::errors::{Result, RuntimeError};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Column, Row, Sqlite, SqlitePool, TypeInfo};
use tether_ir::Symbol;

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

pub struct SqliteDataStore {
    pool: SqlitePool,
}

impl SqliteDataStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_record(row: &SqliteRow) -> Result<Record> {
        let mut map = Record::new();
        for col in row.columns() {
            let idx = col.ordinal();
            let val = match col.type_info().name() {
                "BOOLEAN" => {
                    let v: Option<bool> = row.try_get(idx)?;
                    v.map(Value::from).unwrap_or(Value::Null)
                }
                "INTEGER" | "INT" | "BIGINT" => {
                    let v: Option<i64> = row.try_get(idx)?;
                    v.map(Value::from).unwrap_or(Value::Null)
                }
                "REAL" | "FLOAT" | "DOUBLE" => {
                    let v: Option<f64> = row.try_get(idx)?;
                    v.map(Value::from).unwrap_or(Value::Null)
                }
                "TEXT" | "VARCHAR" => {
                    let v: Option<String> = row.try_get(idx)?;
                    v.map(Value::from).unwrap_or(Value::Null)
                }
                "NULL" => Value::Null,
                _ => {
                    // Undeclared affinity: take whatever decodes first.
                    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
                        v.map(Value::from).unwrap_or(Value::Null)
                    } else if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
                        v.map(Value::from).unwrap_or(Value::Null)
                    } else {
                        let v: Option<String> = row.try_get(idx)?;
                        v.map(Value::from).unwrap_or(Value::Null)
                    }
                }
            };
            map.insert(col.name().to_string(), val);
        }
        Ok(map)
    }

    fn bind_value<'q>(q: SqliteQuery<'q>, value: &Value) -> Result<SqliteQuery<'q>> {
        Ok(match value {
            Value::Null => q.bind(Option::<i64>::None),
            Value::Bool(b) => q.bind(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    q.bind(i)
                } else if let Some(f) = n.as_f64() {
                    q.bind(f)
                } else {
                    q.bind(n.to_string())
                }
            }
            Value::String(s) => q.bind(s.clone()),
            Value::Array(_) | Value::Object(_) => {
                return Err(RuntimeError::InvalidRecord {
                    entity: String::new(),
                    message: format!("cannot store nested value {value}"),
                });
            }
        })
    }

    fn insert_sql(table: &str, record: &Record) -> Result<String> {
        let mut query = String::with_capacity(32 + table.len() + record.len() * 16);
        query.push_str("INSERT INTO \"");
        query.push_str(table);
        query.push_str("\" (");

        let mut values_clause = String::with_capacity(12 + record.len() * 3);
        values_clause.push_str(") VALUES (");

        for (i, k) in record.keys().enumerate() {
            validate_identifier(k)?;
            if i > 0 {
                query.push_str(", ");
                values_clause.push_str(", ");
            }
            query.push('"');
            query.push_str(k);
            query.push('"');
            values_clause.push('?');
        }

        query.push_str(&values_clause);
        query.push(')');
        Ok(query)
    }

    fn update_sql(table: &str, key_field: &str, changes: &Record) -> Result<String> {
        let mut query = format!("UPDATE \"{}\" SET ", table);
        for (i, k) in changes.keys().enumerate() {
            validate_identifier(k)?;
            if i > 0 {
                query.push_str(", ");
            }
            query.push_str(&format!("\"{}\" = ?", k));
        }
        query.push_str(&format!(" WHERE \"{}\" = ?", key_field));
        Ok(query)
    }
}

#[async_trait]
impl DataStore for SqliteDataStore {
    async fn get(&self, table: &str, key_field: &str, key: i64) -> Result<Option<Record>> {
        validate_identifier(table)?;
        validate_identifier(key_field)?;
        let query = format!("SELECT * FROM \"{}\" WHERE \"{}\" = ?", table, key_field);
        let row = sqlx::query(&query).bind(key).fetch_optional(&self.pool).await?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn find_first(&self, table: &str, filters: &[(Symbol, Value)], order_by: &str) -> Result<Option<Record>> {
        validate_identifier(table)?;
        validate_identifier(order_by)?;
        let mut query = format!("SELECT * FROM \"{}\"", table);

        if !filters.is_empty() {
            query.push_str(" WHERE ");
            for (i, (k, v)) in filters.iter().enumerate() {
                validate_identifier(k.as_str())?;
                if i > 0 {
                    query.push_str(" AND ");
                }
                if v.is_null() {
                    query.push_str(&format!("\"{}\" IS NULL", k));
                } else {
                    query.push_str(&format!("\"{}\" = ?", k));
                }
            }
        }
        query.push_str(&format!(" ORDER BY \"{}\" LIMIT 1", order_by));

        let mut q = sqlx::query(&query);
        for (_, v) in filters.iter().filter(|(_, v)| !v.is_null()) {
            q = Self::bind_value(q, v)?;
        }

        let row = q.fetch_optional(&self.pool).await?;
        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn count(&self, table: &str) -> Result<i64> {
        validate_identifier(table)?;
        let query = format!("SELECT COUNT(*) FROM \"{}\"", table);
        let count: i64 = sqlx::query_scalar(&query).fetch_one(&self.pool).await?;
        Ok(count)
    }

    async fn apply(&self, batch: &[WriteOp]) -> Result<Vec<WriteOutcome>> {
        let mut outcomes = Vec::with_capacity(batch.len());
        let mut tx = self.pool.begin().await?;

        for op in batch {
            match op {
                WriteOp::Insert {
                    table,
                    key_field,
                    record,
                } => {
                    validate_identifier(table.as_str())?;
                    let query = Self::insert_sql(table.as_str(), record)?;
                    tracing::debug!(sql = %query, "insert");

                    let mut q = sqlx::query(&query);
                    for v in record.values() {
                        q = Self::bind_value(q, v)?;
                    }
                    q.execute(&mut *tx).await?;

                    let key = record.get(key_field.as_str()).and_then(Value::as_i64).ok_or_else(|| {
                        RuntimeError::MissingKey {
                            entity: table.to_string(),
                        }
                    })?;
                    outcomes.push(WriteOutcome::Inserted(key));
                }
                WriteOp::Update {
                    table,
                    key_field,
                    key,
                    changes,
                } => {
                    validate_identifier(table.as_str())?;
                    validate_identifier(key_field.as_str())?;
                    if changes.is_empty() {
                        outcomes.push(WriteOutcome::Affected(0));
                        continue;
                    }
                    let query = Self::update_sql(table.as_str(), key_field.as_str(), changes)?;
                    tracing::debug!(sql = %query, key, "update");

                    let mut q = sqlx::query(&query);
                    for v in changes.values() {
                        q = Self::bind_value(q, v)?;
                    }
                    let done = q.bind(*key).execute(&mut *tx).await?;
                    if done.rows_affected() == 0 {
                        return Err(RuntimeError::NotFound {
                            entity: table.to_string(),
                        });
                    }
                    outcomes.push(WriteOutcome::Affected(done.rows_affected()));
                }
                WriteOp::Delete { table, key_field, key } => {
                    validate_identifier(table.as_str())?;
                    validate_identifier(key_field.as_str())?;
                    let query = format!("DELETE FROM \"{}\" WHERE \"{}\" = ?", table, key_field);
                    tracing::debug!(sql = %query, key, "delete");

                    let done = sqlx::query(&query).bind(*key).execute(&mut *tx).await?;
                    if done.rows_affected() == 0 {
                        return Err(RuntimeError::NotFound {
                            entity: table.to_string(),
                        });
                    }
                    outcomes.push(WriteOutcome::Affected(done.rows_affected()));
                }
            }
        }

        tx.commit().await?;
        Ok(outcomes)
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(table)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    async fn execute(&self, sql: &str) -> Result<u64> {
        tracing::debug!(sql, "execute");
        let done = sqlx::query(sql).execute(&self.pool).await?;
        Ok(done.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn insert_sql_quotes_every_column() {
        let sql = SqliteDataStore::insert_sql("parent", &record(json!({ "id": 1, "child_id": 2 }))).unwrap();
        assert!(sql.starts_with("INSERT INTO \"parent\" ("));
        assert!(sql.contains("\"id\""));
        assert!(sql.contains("\"child_id\""));
        assert!(sql.ends_with("VALUES (?, ?)"));
    }

    #[test]
    fn update_sql_only_lists_changed_columns() {
        let sql = SqliteDataStore::update_sql("parent", "id", &record(json!({ "child_id": 2 }))).unwrap();
        assert_eq!(sql, "UPDATE \"parent\" SET \"child_id\" = ? WHERE \"id\" = ?");
    }

    #[test]
    fn hostile_column_names_are_refused() {
        let err = SqliteDataStore::insert_sql("parent", &record(json!({ "id\" = 1; --": 1 }))).unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidIdentifier(_)));
    }
}
