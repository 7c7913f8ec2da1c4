use crate::entity::Entity;
use crate::errors::{Result, RuntimeError};
use crate::query::Query;
use crate::store::{DataStore, Record, WriteOp, WriteOutcome};
use crate::tracker::{
    ChangeTracker, Entry, EntryState, NavigationState, Refusal, check_required, key_of, resolve_added,
    resolve_navigation, split_value,
};
use serde::Serialize;
use serde_json::Value;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use tether_ir::{DeleteBehavior, EntitySchema, RelationshipSchema, Schema, Symbol};
use tracing::Instrument;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Inserted,
    Updated,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityChange {
    pub entity: String,
    pub key: i64,
    pub kind: ChangeKind,
    /// Columns written; empty for deletes.
    pub columns: Vec<String>,
}

/// What one `save_changes` call wrote.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SaveReport {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Rows the store reported as written.
    pub rows_affected: u64,
    pub changes: Vec<EntityChange>,
}

impl SaveReport {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// A unit of work over one store.
///
/// The session keeps an identity map of every entity it loaded or was handed, detects changes
/// against what it last saw, and writes them in a single transaction on `save_changes`.
pub struct Session {
    id: Uuid,
    schema: Arc<Schema>,
    datastore: Arc<dyn DataStore>,
    tracker: ChangeTracker,
    span: tracing::Span,
}

fn lookup<'a>(schema: &'a Schema, entity: &str) -> Result<&'a EntitySchema> {
    schema
        .entity(entity)
        .ok_or_else(|| RuntimeError::UnknownEntity(entity.to_string()))
}

fn refusal_error(
    es: &EntitySchema,
    key: i64,
    rel: &RelationshipSchema,
    foreign_key: Value,
    navigation: Option<i64>,
    refusal: Refusal,
) -> RuntimeError {
    match refusal {
        Refusal::Conflict => RuntimeError::RelationshipConflict {
            entity: es.name.to_string(),
            key,
            relationship: rel.name.to_string(),
            foreign_key,
            navigation: navigation.map(Value::from).unwrap_or(Value::Null),
        },
        Refusal::Severed => RuntimeError::RequiredRelationshipSevered {
            entity: es.name.to_string(),
            key,
            relationship: rel.name.to_string(),
        },
    }
}

/// The shape a navigation member is handed out in: columns only, its own navigations empty.
fn nested_value(target: &EntitySchema, record: Record) -> Value {
    let mut object = record;
    for rel in &target.relationships {
        object.insert(rel.name.to_string(), Value::Null);
    }
    Value::Object(object)
}

impl Session {
    pub(crate) fn new(schema: Arc<Schema>, datastore: Arc<dyn DataStore>) -> Self {
        let id = Uuid::new_v4();
        let span = tracing::debug_span!("session", id = %id);
        tracing::debug!(session = %id, "session opened");
        Self {
            id,
            schema,
            datastore,
            tracker: ChangeTracker::new(),
            span,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn has_changes(&self) -> bool {
        self.tracker.has_changes()
    }

    pub fn entry_state<E: Entity>(&self, key: i64) -> Option<EntryState> {
        self.tracker.get(Symbol::from(E::name()), key).map(|e| e.state)
    }

    pub fn query<E: Entity>(&mut self) -> Query<'_, E> {
        Query::new(self)
    }

    pub async fn count<E: Entity>(&self) -> Result<i64> {
        let es = lookup(&self.schema, E::name())?;
        self.datastore.count(es.table_name.as_str()).await
    }

    /// Stages an insert of `entity` and of every untracked entity attached through its navigations.
    pub fn add<E: Entity>(&mut self, entity: &E) -> Result<()> {
        let value = serde_json::to_value(entity)?;
        let schema = self.schema.clone();
        let checkpoint = self.tracker.clone();

        let result = self.add_value(&schema, E::name(), value);
        if result.is_err() {
            self.tracker = checkpoint;
        }
        result.map(|_| ())
    }

    /// Hands a modified entity back to the session. Nothing is staged when this fails.
    pub fn update<E: Entity>(&mut self, entity: &E) -> Result<()> {
        let value = serde_json::to_value(entity)?;
        let schema = self.schema.clone();
        let es = lookup(&schema, E::name())?;
        let checkpoint = self.tracker.clone();

        let result = self.update_value(&schema, es, value, false);
        if result.is_err() {
            self.tracker = checkpoint;
        }
        result
    }

    /// Stages an explicit delete.
    pub fn remove<E: Entity>(&mut self, entity: &E) -> Result<()> {
        let es = lookup(&self.schema, E::name())?;
        let name = es.name;
        let key = entity.key();

        match self.tracker.get(name, key).map(|e| e.state) {
            Some(EntryState::Added) => {
                self.tracker.remove(name, key);
            }
            Some(_) => {
                if let Some(entry) = self.tracker.get_mut(name, key) {
                    entry.state = EntryState::Deleted;
                }
            }
            None => {
                let (columns, _) = split_value(es, serde_json::to_value(entity)?)?;
                self.tracker
                    .track(Entry::new(name, key, EntryState::Deleted, columns.clone(), columns));
            }
        }

        tracing::debug!(session = %self.id, entity = %name, key, "delete staged");
        Ok(())
    }

    fn add_value(&mut self, schema: &Schema, entity: &str, value: Value) -> Result<i64> {
        let es = lookup(schema, entity)?;
        let (mut columns, navigations) = split_value(es, value)?;
        let key = key_of(es, &columns)?;

        if self.tracker.contains(es.name, key) {
            return Err(RuntimeError::AlreadyTracked {
                entity: es.name.to_string(),
                key,
            });
        }

        let mut states = HashMap::with_capacity(es.relationships.len());
        for rel in &es.relationships {
            let nav = navigations.get(&rel.name).cloned().unwrap_or(Value::Null);
            let nav_key = self.attach(schema, rel, nav)?;
            let fk = columns.get(rel.foreign_key.as_str()).cloned().unwrap_or(Value::Null);

            let resolved =
                resolve_added(&fk, nav_key).map_err(|r| refusal_error(es, key, rel, fk.clone(), nav_key, r))?;
            columns.insert(rel.foreign_key.to_string(), resolved.foreign_key);
            states.insert(rel.name, resolved.navigation);
        }

        check_required(es, &columns)?;

        let entry = self
            .tracker
            .track(Entry::new(es.name, key, EntryState::Added, Record::new(), columns));
        for (name, state) in states {
            entry.set_navigation(name, state);
        }

        tracing::debug!(session = %self.id, entity = %es.name, key, "insert staged");
        Ok(key)
    }

    /// Brings the object held in a navigation member into the session and returns its key.
    fn attach(&mut self, schema: &Schema, rel: &RelationshipSchema, value: Value) -> Result<Option<i64>> {
        if value.is_null() {
            return Ok(None);
        }

        let target = lookup(schema, rel.target_entity.as_str())?;
        let (columns, _) = split_value(target, value.clone())?;
        let key = key_of(target, &columns)?;

        if self.tracker.contains(target.name, key) {
            self.update_value(schema, target, value, true)?;
        } else {
            self.add_value(schema, target.name.as_str(), value)?;
        }
        Ok(Some(key))
    }

    fn update_value(&mut self, schema: &Schema, es: &EntitySchema, value: Value, nested: bool) -> Result<()> {
        let (mut columns, navigations) = split_value(es, value)?;
        let key = key_of(es, &columns)?;

        let previous = match self.tracker.get(es.name, key) {
            Some(entry) if nested && entry.state == EntryState::Deleted => return Ok(()),
            Some(entry) => Some(entry.clone()),
            None => None,
        };

        let mut states = HashMap::with_capacity(es.relationships.len());
        for rel in &es.relationships {
            let nav = navigations.get(&rel.name).cloned().unwrap_or(Value::Null);

            // Nested objects are handed out with empty navigations.
            if nested && nav.is_null() {
                if let Some(prev) = &previous
                    && let Some(state) = prev.navigations.get(&rel.name)
                {
                    states.insert(rel.name, *state);
                }
                continue;
            }

            let nav_key = self.attach(schema, rel, nav)?;
            let fk = columns.get(rel.foreign_key.as_str()).cloned().unwrap_or(Value::Null);
            let fk_required = es.get_field(rel.foreign_key.as_str()).is_some_and(|f| f.required);

            let resolved = match &previous {
                Some(prev) => {
                    let prev_fk = prev.current.get(rel.foreign_key.as_str()).cloned().unwrap_or(Value::Null);
                    let prev_nav = prev.navigation(rel.name);
                    let handed_out = prev.handed_out(rel.name);
                    resolve_navigation(rel, fk_required, &prev_fk, &fk, prev_nav, &handed_out, nav_key)
                }
                None => resolve_added(&fk, nav_key),
            }
            .map_err(|r| refusal_error(es, key, rel, fk.clone(), nav_key, r))?;

            if resolved.foreign_key != fk {
                tracing::debug!(
                    session = %self.id,
                    entity = %es.name,
                    key,
                    relationship = %rel.name,
                    from = %fk,
                    to = %resolved.foreign_key,
                    "foreign key taken from navigation"
                );
            }
            columns.insert(rel.foreign_key.to_string(), resolved.foreign_key);
            states.insert(rel.name, resolved.navigation);
        }

        check_required(es, &columns)?;

        match self.tracker.get_mut(es.name, key) {
            Some(entry) => {
                entry.current = columns;
                for (name, state) in states {
                    entry.set_navigation(name, state);
                }
                if entry.state != EntryState::Added {
                    entry.state = if entry.changed_columns().is_empty() {
                        EntryState::Unchanged
                    } else {
                        EntryState::Modified
                    };
                }
                tracing::debug!(
                    session = %self.id,
                    entity = %es.name,
                    key,
                    changed = entry.changed_columns().len(),
                    "changes detected"
                );
            }
            None => {
                let entry = self
                    .tracker
                    .track(Entry::new(es.name, key, EntryState::Modified, Record::new(), columns));
                for (name, state) in states {
                    entry.set_navigation(name, state);
                }
                tracing::debug!(session = %self.id, entity = %es.name, key, "untracked entity attached as modified");
            }
        }

        Ok(())
    }

    pub(crate) async fn load_first(
        &mut self,
        entity: &str,
        includes: &[Symbol],
        filters: &[(Symbol, Value)],
    ) -> Result<Option<Value>> {
        let span = self.span.clone();
        self.load_first_inner(entity, includes, filters).instrument(span).await
    }

    async fn load_first_inner(
        &mut self,
        entity: &str,
        includes: &[Symbol],
        filters: &[(Symbol, Value)],
    ) -> Result<Option<Value>> {
        let schema = self.schema.clone();
        let es = lookup(&schema, entity)?;
        Self::check_query(es, includes, filters)?;

        let Some(row) = self
            .datastore
            .find_first(es.table_name.as_str(), filters, es.key_field())
            .await?
        else {
            return Ok(None);
        };

        let key = key_of(es, &row)?;
        if !self.tracker.contains(es.name, key) {
            self.tracker
                .track(Entry::new(es.name, key, EntryState::Unchanged, row.clone(), row));
        }

        self.materialize(&schema, es, key, includes).await.map(Some)
    }

    /// Looks in the session first and only queries the store for entities it does not hold.
    pub(crate) async fn load_by_key(&mut self, entity: &str, key: i64, includes: &[Symbol]) -> Result<Option<Value>> {
        let schema = self.schema.clone();
        let es = lookup(&schema, entity)?;

        match self.tracker.get(es.name, key).map(|e| e.state) {
            Some(EntryState::Deleted) => Ok(None),
            Some(_) => {
                Self::check_query(es, includes, &[])?;
                let span = self.span.clone();
                self.materialize(&schema, es, key, includes).instrument(span).await.map(Some)
            }
            None => {
                let filters = [(es.key.field, Value::from(key))];
                self.load_first(entity, includes, &filters).await
            }
        }
    }

    fn check_query(es: &EntitySchema, includes: &[Symbol], filters: &[(Symbol, Value)]) -> Result<()> {
        for nav in includes {
            if es.relationship(nav.as_str()).is_none() {
                return Err(RuntimeError::UnknownNavigation {
                    entity: es.name.to_string(),
                    navigation: nav.to_string(),
                });
            }
        }
        for (field, _) in filters {
            if es.get_field(field.as_str()).is_none() {
                return Err(RuntimeError::UnknownField {
                    entity: es.name.to_string(),
                    field: field.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Builds the value handed to the caller from the tracked state and records which
    /// navigation targets the caller is about to see. Targets handed out by earlier reads stay
    /// known as stale.
    async fn materialize(&mut self, schema: &Schema, es: &EntitySchema, key: i64, includes: &[Symbol]) -> Result<Value> {
        let Some(entry) = self.tracker.get(es.name, key) else {
            return Err(RuntimeError::NotFound {
                entity: es.name.to_string(),
            });
        };
        let mut object = entry.current.clone();
        let seen: Vec<NavigationState> = es.relationships.iter().map(|r| entry.navigation(r.name)).collect();

        let mut states = Vec::with_capacity(es.relationships.len());
        for (rel, previously) in es.relationships.iter().zip(seen) {
            let target = lookup(schema, rel.target_entity.as_str())?;
            let fk = object.get(rel.foreign_key.as_str()).and_then(Value::as_i64);

            let (loaded, state) = if includes.contains(&rel.name) {
                let loaded = match fk {
                    Some(fk) => self.load_tracked(target, fk).await?,
                    None => None,
                };
                let state = NavigationState::Loaded(loaded.as_ref().and(fk));
                (loaded, state)
            } else if previously != NavigationState::NotLoaded {
                let loaded = fk.and_then(|fk| self.tracked_record(target, fk));
                let state = NavigationState::Loaded(loaded.as_ref().and(fk));
                (loaded, state)
            } else {
                (None, NavigationState::NotLoaded)
            };

            let value = loaded.map(|r| nested_value(target, r)).unwrap_or(Value::Null);
            object.insert(rel.name.to_string(), value);
            states.push((rel.name, state));
        }

        if let Some(entry) = self.tracker.get_mut(es.name, key) {
            for (name, state) in states {
                entry.set_navigation(name, state);
            }
        }
        Ok(Value::Object(object))
    }

    fn tracked_record(&self, target: &EntitySchema, key: i64) -> Option<Record> {
        self.tracker
            .get(target.name, key)
            .filter(|e| e.state != EntryState::Deleted)
            .map(|e| e.current.clone())
    }

    async fn load_tracked(&mut self, target: &EntitySchema, key: i64) -> Result<Option<Record>> {
        if self.tracker.contains(target.name, key) {
            return Ok(self.tracked_record(target, key));
        }

        let Some(row) = self
            .datastore
            .get(target.table_name.as_str(), target.key_field(), key)
            .await?
        else {
            return Ok(None);
        };

        self.tracker
            .track(Entry::new(target.name, key, EntryState::Unchanged, row.clone(), row.clone()));
        Ok(Some(row))
    }

    /// Writes every pending change in one transaction. On failure nothing is written and the
    /// session keeps its pending state.
    pub async fn save_changes(&mut self) -> Result<SaveReport> {
        let span = self.span.clone();
        self.save_changes_inner().instrument(span).await
    }

    async fn save_changes_inner(&mut self) -> Result<SaveReport> {
        let schema = self.schema.clone();
        let rank: HashMap<Symbol, usize> = schema
            .dependency_order()?
            .iter()
            .enumerate()
            .map(|(i, e)| (e.name, i))
            .collect();
        let rank_of = |entity: Symbol| rank.get(&entity).copied().unwrap_or(usize::MAX);

        let mut inserts: Vec<&Entry> = self
            .tracker
            .entries()
            .filter(|e| e.state == EntryState::Added)
            .collect();
        inserts.sort_by_key(|e| (rank_of(e.entity), e.seq()));

        let mut updates: Vec<(&Entry, Record)> = self
            .tracker
            .entries()
            .filter(|e| e.state == EntryState::Modified)
            .filter_map(|e| {
                let es = schema.entity(e.entity.as_str())?;
                let mut changes = e.changed_columns();
                changes.remove(es.key_field());
                (!changes.is_empty()).then_some((e, changes))
            })
            .collect();
        updates.sort_by_key(|(e, _)| (rank_of(e.entity), e.seq()));

        let mut deletes: Vec<&Entry> = self
            .tracker
            .entries()
            .filter(|e| e.state == EntryState::Deleted)
            .collect();
        deletes.sort_by_key(|e| (Reverse(rank_of(e.entity)), e.seq()));

        let mut batch = Vec::with_capacity(inserts.len() + updates.len() + deletes.len());
        let mut report = SaveReport::default();

        for entry in &inserts {
            let es = lookup(&schema, entry.entity.as_str())?;
            batch.push(WriteOp::Insert {
                table: es.table_name,
                key_field: es.key.field,
                record: entry.current.clone(),
            });
            report.changes.push(EntityChange {
                entity: entry.entity.to_string(),
                key: entry.key,
                kind: ChangeKind::Inserted,
                columns: entry.current.keys().cloned().collect(),
            });
        }
        for (entry, changes) in &updates {
            let es = lookup(&schema, entry.entity.as_str())?;
            report.changes.push(EntityChange {
                entity: entry.entity.to_string(),
                key: entry.key,
                kind: ChangeKind::Updated,
                columns: changes.keys().cloned().collect(),
            });
            batch.push(WriteOp::Update {
                table: es.table_name,
                key_field: es.key.field,
                key: entry.key,
                changes: changes.clone(),
            });
        }
        for entry in &deletes {
            let es = lookup(&schema, entry.entity.as_str())?;
            batch.push(WriteOp::Delete {
                table: es.table_name,
                key_field: es.key.field,
                key: entry.key,
            });
            report.changes.push(EntityChange {
                entity: entry.entity.to_string(),
                key: entry.key,
                kind: ChangeKind::Deleted,
                columns: Vec::new(),
            });
        }

        report.inserted = inserts.len();
        report.updated = updates.len();
        report.deleted = deletes.len();
        let removed: Vec<(Symbol, i64)> = deletes.iter().map(|e| (e.entity, e.key)).collect();

        if !batch.is_empty() {
            tracing::debug!(session = %self.id, statements = batch.len(), "applying change batch");
            let outcomes = self.datastore.apply(&batch).await?;
            report.rows_affected = outcomes.iter().map(WriteOutcome::rows).sum();
            tracing::debug!(session = %self.id, rows = report.rows_affected, "change batch applied");
        }

        for (entity, key) in removed {
            self.forget_deleted(&schema, entity, key);
        }
        for entry in self.tracker.entries_mut() {
            entry.accept_changes();
        }

        tracing::info!(
            session = %self.id,
            inserted = report.inserted,
            updated = report.updated,
            deleted = report.deleted,
            rows = report.rows_affected,
            "saved changes"
        );
        Ok(report)
    }

    /// Mirrors what the database did to tracked dependents of a deleted row.
    fn forget_deleted(&mut self, schema: &Schema, entity: Symbol, key: i64) {
        let mut pending = vec![(entity, key)];

        while let Some((entity, key)) = pending.pop() {
            self.tracker.remove(entity, key);

            for dependent in &schema.entities {
                for rel in dependent.relationships.iter().filter(|r| r.target_entity == entity) {
                    let fk = rel.foreign_key.as_str();
                    for entry in self.tracker.entries_mut() {
                        if entry.entity != dependent.name || entry.current.get(fk).and_then(Value::as_i64) != Some(key) {
                            continue;
                        }
                        match rel.on_delete {
                            DeleteBehavior::Cascade => pending.push((entry.entity, entry.key)),
                            DeleteBehavior::SetNull => {
                                entry.current.insert(fk.to_string(), Value::Null);
                                entry.original.insert(fk.to_string(), Value::Null);
                                entry.navigations.insert(rel.name, NavigationState::Loaded(None));
                            }
                            DeleteBehavior::Restrict => {}
                        }
                    }
                }
            }
        }
    }

    /// Drops every pending change. Tracked entities go back to their last saved values.
    pub fn discard_changes(&mut self) {
        let pending = self.tracker.pending();
        self.tracker.reject_changes();
        tracing::debug!(session = %self.id, pending, "pending changes discarded");
    }

    pub fn close(self) {
        tracing::debug!(session = %self.id, tracked = self.tracker.len(), "session closed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.tracker.has_changes() {
            tracing::warn!(
                session = %self.id,
                pending = self.tracker.pending(),
                "session dropped with unsaved changes"
            );
        }
    }
}
