use crate::entity::Entity;
use crate::errors::{Result, RuntimeError};
use crate::session::Session;
use serde_json::Value;
use std::marker::PhantomData;
use tether_ir::Symbol;

/// Fetches at most one entity, ordered by key. Every result is tracked by the session.
pub struct Query<'s, E> {
    session: &'s mut Session,
    includes: Vec<Symbol>,
    filters: Vec<(Symbol, Value)>,
    _entity: PhantomData<fn() -> E>,
}

impl<'s, E: Entity> Query<'s, E> {
    pub(crate) fn new(session: &'s mut Session) -> Self {
        Self {
            session,
            includes: Vec::new(),
            filters: Vec::new(),
            _entity: PhantomData,
        }
    }

    /// Loads the named navigation along with the entity.
    pub fn include(mut self, navigation: &str) -> Self {
        self.includes.push(Symbol::from(navigation));
        self
    }

    /// Equality on a column; `null` matches `IS NULL`.
    pub fn filter(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filters.push((Symbol::from(field), value.into()));
        self
    }

    pub async fn first_or_none(self) -> Result<Option<E>> {
        let value = self
            .session
            .load_first(E::name(), &self.includes, &self.filters)
            .await?;
        Ok(value.map(serde_json::from_value).transpose()?)
    }

    pub async fn first(self) -> Result<E> {
        self.first_or_none().await?.ok_or_else(|| RuntimeError::NotFound {
            entity: E::name().to_string(),
        })
    }

    /// Entity by key, served from the session when it already holds it. Filters are ignored.
    pub async fn find(self, key: i64) -> Result<Option<E>> {
        let value = self.session.load_by_key(E::name(), key, &self.includes).await?;
        Ok(value.map(serde_json::from_value).transpose()?)
    }
}
