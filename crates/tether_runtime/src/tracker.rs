use crate::errors::{Result, RuntimeError};
use crate::store::Record;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tether_ir::{EntitySchema, NullNavigationPolicy, RelationshipSchema, Symbol};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Unchanged,
    Added,
    Modified,
    Deleted,
}

/// What the caller last saw in a navigation member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationState {
    NotLoaded,
    Loaded(Option<i64>),
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub entity: Symbol,
    pub key: i64,
    pub state: EntryState,
    /// Column values as last read from or written to the store.
    pub original: Record,
    /// Column values as last handed to the session.
    pub current: Record,
    pub navigations: HashMap<Symbol, NavigationState>,
    /// Every navigation target the caller has been given or has handed back, per relationship.
    handed_out: HashMap<Symbol, HashSet<i64>>,
    seq: u64,
}

impl Entry {
    pub fn new(entity: Symbol, key: i64, state: EntryState, original: Record, current: Record) -> Self {
        Self {
            entity,
            key,
            state,
            original,
            current,
            navigations: HashMap::new(),
            handed_out: HashMap::new(),
            seq: 0,
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn changed_columns(&self) -> Record {
        self.current
            .iter()
            .filter(|(k, v)| self.original.get(k.as_str()) != Some(*v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn navigation(&self, name: Symbol) -> NavigationState {
        self.navigations.get(&name).copied().unwrap_or(NavigationState::NotLoaded)
    }

    /// Records what the caller now holds in a navigation member. Earlier targets stay known.
    pub fn set_navigation(&mut self, name: Symbol, state: NavigationState) {
        if let NavigationState::Loaded(Some(key)) = state {
            self.handed_out.entry(name).or_default().insert(key);
        }
        self.navigations.insert(name, state);
    }

    pub fn handed_out(&self, name: Symbol) -> HashSet<i64> {
        self.handed_out.get(&name).cloned().unwrap_or_default()
    }

    pub fn accept_changes(&mut self) {
        self.original = self.current.clone();
        self.state = EntryState::Unchanged;
    }

    fn is_pending(&self) -> bool {
        match self.state {
            EntryState::Added | EntryState::Deleted => true,
            EntryState::Modified => !self.changed_columns().is_empty(),
            EntryState::Unchanged => false,
        }
    }
}

/// Identity map of every entity a session has loaded or been handed.
#[derive(Debug, Clone, Default)]
pub struct ChangeTracker {
    entries: HashMap<(Symbol, i64), Entry>,
    next_seq: u64,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, mut entry: Entry) -> &mut Entry {
        self.next_seq += 1;
        entry.seq = self.next_seq;
        self.entries.entry((entry.entity, entry.key)).insert_entry(entry).into_mut()
    }

    pub fn get(&self, entity: Symbol, key: i64) -> Option<&Entry> {
        self.entries.get(&(entity, key))
    }

    pub fn get_mut(&mut self, entity: Symbol, key: i64) -> Option<&mut Entry> {
        self.entries.get_mut(&(entity, key))
    }

    pub fn contains(&self, entity: Symbol, key: i64) -> bool {
        self.entries.contains_key(&(entity, key))
    }

    pub fn remove(&mut self, entity: Symbol, key: i64) -> Option<Entry> {
        self.entries.remove(&(entity, key))
    }

    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values()
    }

    pub fn entries_mut(&mut self) -> impl Iterator<Item = &mut Entry> {
        self.entries.values_mut()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pending(&self) -> usize {
        self.entries.values().filter(|e| e.is_pending()).count()
    }

    pub fn has_changes(&self) -> bool {
        self.entries.values().any(Entry::is_pending)
    }

    /// Forgets staged inserts and entities attached without a stored snapshot, and puts every
    /// other entry back to its last saved values.
    pub fn reject_changes(&mut self) {
        self.entries.retain(|_, e| e.state != EntryState::Added && !e.original.is_empty());
        for entry in self.entries.values_mut() {
            entry.current = entry.original.clone();
            entry.state = EntryState::Unchanged;
        }
    }
}

/// Splits a serialized entity into its column values and its navigation members.
/// Members the schema does not know about are ignored.
pub(crate) fn split_value(schema: &EntitySchema, value: Value) -> Result<(Record, HashMap<Symbol, Value>)> {
    let Value::Object(mut object) = value else {
        return Err(RuntimeError::InvalidRecord {
            entity: schema.name.to_string(),
            message: "expected a JSON object".to_string(),
        });
    };

    let mut columns = Record::new();
    for field in &schema.fields {
        let v = object.remove(field.name.as_str()).unwrap_or(Value::Null);
        columns.insert(field.name.to_string(), v);
    }

    let mut navigations = HashMap::with_capacity(schema.relationships.len());
    for rel in &schema.relationships {
        let v = object.remove(rel.name.as_str()).unwrap_or(Value::Null);
        navigations.insert(rel.name, v);
    }

    Ok((columns, navigations))
}

pub(crate) fn key_of(schema: &EntitySchema, columns: &Record) -> Result<i64> {
    columns
        .get(schema.key_field())
        .and_then(Value::as_i64)
        .ok_or_else(|| RuntimeError::MissingKey {
            entity: schema.name.to_string(),
        })
}

pub(crate) fn check_required(schema: &EntitySchema, columns: &Record) -> Result<()> {
    for field in schema.fields.iter().filter(|f| f.required) {
        if columns.get(field.name.as_str()).is_none_or(Value::is_null) {
            return Err(RuntimeError::InvalidRecord {
                entity: schema.name.to_string(),
                message: format!("required field '{}' is null", field.name),
            });
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Refusal {
    Conflict,
    Severed,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Resolved {
    pub foreign_key: Value,
    pub navigation: NavigationState,
}

impl Resolved {
    fn new(foreign_key: Value, navigation: NavigationState) -> Self {
        Self {
            foreign_key,
            navigation,
        }
    }
}

/// Decides the foreign key of a tracked entity from the scalar the caller handed back and the
/// navigation member next to it.
///
/// A navigation holding a target the session handed out earlier is stale and never overrides
/// the scalar. An old loaded object left in place while the key is repointed is therefore
/// ignored, even after the entity was read again and a newer target was handed out. Any other
/// navigation wins over an unchanged scalar and must agree with a changed one. A loaded
/// navigation cleared to `None` severs an optional relationship; for a required one, or when the
/// scalar was set at the same time, the relationship's `NullNavigationPolicy` decides. Nothing
/// here ever leads to a delete.
pub(crate) fn resolve_navigation(
    relationship: &RelationshipSchema,
    fk_required: bool,
    previous_fk: &Value,
    current_fk: &Value,
    previous_nav: NavigationState,
    handed_out: &HashSet<i64>,
    current_nav: Option<i64>,
) -> std::result::Result<Resolved, Refusal> {
    let fk_changed = previous_fk != current_fk;

    match (previous_nav, current_nav) {
        (previous, Some(k)) if previous == NavigationState::Loaded(Some(k)) || handed_out.contains(&k) => {
            Ok(Resolved::new(current_fk.clone(), NavigationState::Loaded(Some(k))))
        }
        (_, Some(k)) => {
            if fk_changed && current_fk.as_i64() != Some(k) {
                Err(Refusal::Conflict)
            } else {
                Ok(Resolved::new(Value::from(k), NavigationState::Loaded(Some(k))))
            }
        }
        (NavigationState::Loaded(Some(_)), None) => {
            let cleared = NavigationState::Loaded(None);
            if current_fk.is_null() || (!fk_changed && !fk_required) {
                return Ok(Resolved::new(Value::Null, cleared));
            }
            match relationship.on_null_navigation {
                NullNavigationPolicy::KeepForeignKey => Ok(Resolved::new(current_fk.clone(), cleared)),
                NullNavigationPolicy::Reject if fk_changed => Err(Refusal::Conflict),
                NullNavigationPolicy::Reject => Err(Refusal::Severed),
            }
        }
        (state, None) => Ok(Resolved::new(current_fk.clone(), state)),
    }
}

/// Foreign key of a newly added entity: an attached navigation fills an unset scalar (`null` or `0`).
pub(crate) fn resolve_added(current_fk: &Value, current_nav: Option<i64>) -> std::result::Result<Resolved, Refusal> {
    match current_nav {
        None => Ok(Resolved::new(current_fk.clone(), NavigationState::NotLoaded)),
        Some(k) => {
            let unset = current_fk.is_null() || current_fk.as_i64() == Some(0);
            if unset || current_fk.as_i64() == Some(k) {
                Ok(Resolved::new(Value::from(k), NavigationState::Loaded(Some(k))))
            } else {
                Err(Refusal::Conflict)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn child_rel(policy: NullNavigationPolicy) -> RelationshipSchema {
        RelationshipSchema::belongs_to("child", "Child", "child_id").on_null_navigation(policy)
    }

    fn keep() -> RelationshipSchema {
        child_rel(NullNavigationPolicy::KeepForeignKey)
    }

    fn reject() -> RelationshipSchema {
        child_rel(NullNavigationPolicy::Reject)
    }

    const LOADED_1: NavigationState = NavigationState::Loaded(Some(1));

    fn seen(keys: &[i64]) -> HashSet<i64> {
        keys.iter().copied().collect()
    }

    #[test]
    fn stale_navigation_does_not_override_repointed_key() {
        let resolved = resolve_navigation(&keep(), true, &json!(1), &json!(2), LOADED_1, &seen(&[1]), Some(1)).unwrap();
        assert_eq!(resolved.foreign_key, json!(2));
        assert_eq!(resolved.navigation, LOADED_1);
    }

    #[test]
    fn any_earlier_target_counts_as_stale() {
        // Re-read after the key moved to 2: the snapshot says 2, the caller still holds child 1.
        let current = NavigationState::Loaded(Some(2));
        let resolved = resolve_navigation(&keep(), true, &json!(2), &json!(2), current, &seen(&[1, 2]), Some(1)).unwrap();
        assert_eq!(resolved.foreign_key, json!(2));

        let resolved = resolve_navigation(&keep(), true, &json!(2), &json!(3), current, &seen(&[1, 2]), Some(1)).unwrap();
        assert_eq!(resolved.foreign_key, json!(3));
        assert_eq!(resolved.navigation, LOADED_1);
    }

    #[test]
    fn set_navigation_remembers_every_target() {
        let mut entry = Entry::new(Symbol::from("Parent"), 1, EntryState::Unchanged, Record::new(), Record::new());
        let child = Symbol::from("child");
        entry.set_navigation(child, LOADED_1);
        entry.set_navigation(child, NavigationState::Loaded(None));
        entry.set_navigation(child, NavigationState::Loaded(Some(2)));

        assert_eq!(entry.navigation(child), NavigationState::Loaded(Some(2)));
        assert_eq!(entry.handed_out(child), seen(&[1, 2]));
        assert!(entry.handed_out(Symbol::from("other")).is_empty());
    }

    #[test]
    fn same_key_with_same_navigation_is_untouched() {
        let resolved = resolve_navigation(&keep(), true, &json!(1), &json!(1), LOADED_1, &seen(&[1]), Some(1)).unwrap();
        assert_eq!(resolved.foreign_key, json!(1));
    }

    #[test]
    fn repointed_navigation_wins_over_unchanged_key() {
        let resolved = resolve_navigation(&keep(), true, &json!(1), &json!(1), LOADED_1, &seen(&[1]), Some(2)).unwrap();
        assert_eq!(resolved.foreign_key, json!(2));
        assert_eq!(resolved.navigation, NavigationState::Loaded(Some(2)));
    }

    #[test]
    fn navigation_and_key_must_agree_when_both_change() {
        assert!(resolve_navigation(&keep(), true, &json!(1), &json!(2), LOADED_1, &seen(&[1]), Some(2)).is_ok());
        assert_eq!(
            resolve_navigation(&keep(), true, &json!(1), &json!(3), LOADED_1, &seen(&[1]), Some(2)),
            Err(Refusal::Conflict)
        );
    }

    #[test]
    fn unloaded_navigation_left_empty_keeps_key() {
        let resolved =
            resolve_navigation(&reject(), true, &json!(1), &json!(2), NavigationState::NotLoaded, &seen(&[]), None).unwrap();
        assert_eq!(resolved.foreign_key, json!(2));
        assert_eq!(resolved.navigation, NavigationState::NotLoaded);
    }

    #[test]
    fn cleared_optional_navigation_nulls_the_key() {
        let resolved = resolve_navigation(&reject(), false, &json!(1), &json!(1), LOADED_1, &seen(&[1]), None).unwrap();
        assert_eq!(resolved.foreign_key, Value::Null);
        assert_eq!(resolved.navigation, NavigationState::Loaded(None));
    }

    #[test]
    fn cleared_required_navigation_follows_policy() {
        let kept = resolve_navigation(&keep(), true, &json!(1), &json!(1), LOADED_1, &seen(&[1]), None).unwrap();
        assert_eq!(kept.foreign_key, json!(1));
        assert_eq!(kept.navigation, NavigationState::Loaded(None));

        assert_eq!(
            resolve_navigation(&reject(), true, &json!(1), &json!(1), LOADED_1, &seen(&[1]), None),
            Err(Refusal::Severed)
        );
    }

    #[test]
    fn cleared_navigation_with_new_key_follows_policy() {
        let kept = resolve_navigation(&keep(), true, &json!(1), &json!(2), LOADED_1, &seen(&[1]), None).unwrap();
        assert_eq!(kept.foreign_key, json!(2));

        assert_eq!(
            resolve_navigation(&reject(), true, &json!(1), &json!(2), LOADED_1, &seen(&[1]), None),
            Err(Refusal::Conflict)
        );
        // Optional keys follow the same rule once set to something non-null.
        assert_eq!(
            resolve_navigation(&reject(), false, &json!(1), &json!(2), LOADED_1, &seen(&[1]), None),
            Err(Refusal::Conflict)
        );
    }

    #[test]
    fn added_navigation_fills_unset_key() {
        assert_eq!(resolve_added(&json!(0), Some(7)).unwrap().foreign_key, json!(7));
        assert_eq!(resolve_added(&Value::Null, Some(7)).unwrap().foreign_key, json!(7));
        assert_eq!(resolve_added(&json!(7), Some(7)).unwrap().foreign_key, json!(7));
        assert_eq!(resolve_added(&json!(3), Some(7)), Err(Refusal::Conflict));
        assert_eq!(resolve_added(&json!(3), None).unwrap().foreign_key, json!(3));
    }

    #[test]
    fn changed_columns_only_lists_differences() {
        let original: Record = json!({ "id": 1, "child_id": 1 }).as_object().cloned().unwrap();
        let mut current = original.clone();
        current.insert("child_id".to_string(), json!(2));

        let entry = Entry::new(Symbol::from("Parent"), 1, EntryState::Modified, original, current);
        let changed = entry.changed_columns();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed.get("child_id"), Some(&json!(2)));
    }

    #[test]
    fn tracker_counts_only_real_changes() {
        let record: Record = json!({ "id": 1 }).as_object().cloned().unwrap();
        let mut tracker = ChangeTracker::new();
        tracker.track(Entry::new(
            Symbol::from("Child"),
            1,
            EntryState::Modified,
            record.clone(),
            record.clone(),
        ));
        assert!(!tracker.has_changes());

        tracker.track(Entry::new(Symbol::from("Child"), 2, EntryState::Added, Record::new(), record));
        assert!(tracker.has_changes());
        assert_eq!(tracker.pending(), 1);
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn rejected_changes_restore_saved_values() {
        let saved: Record = json!({ "id": 1, "child_id": 1 }).as_object().cloned().unwrap();
        let mut edited = saved.clone();
        edited.insert("child_id".to_string(), json!(2));

        let mut tracker = ChangeTracker::new();
        let parent = Symbol::from("Parent");
        tracker.track(Entry::new(parent, 1, EntryState::Modified, saved.clone(), edited.clone()));
        tracker.track(Entry::new(parent, 2, EntryState::Added, Record::new(), edited.clone()));
        tracker.track(Entry::new(parent, 3, EntryState::Modified, Record::new(), edited));
        tracker.track(Entry::new(parent, 4, EntryState::Deleted, saved.clone(), saved.clone()));
        assert_eq!(tracker.pending(), 4);

        tracker.reject_changes();
        assert!(!tracker.has_changes());
        assert_eq!(tracker.len(), 2);
        let entry = tracker.get(parent, 1).unwrap();
        assert_eq!(entry.state, EntryState::Unchanged);
        assert_eq!(entry.current, saved);
        assert_eq!(tracker.get(parent, 4).map(|e| e.state), Some(EntryState::Unchanged));
    }
}
