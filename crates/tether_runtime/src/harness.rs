//! Runs the foreign-key update scenarios against a seeded store and checks what ended up in it.

use crate::config::StoreConfig;
use crate::entities::{Child, Parent, ParentPatch, sample_model};
use crate::errors::{Result, RuntimeError};
use crate::mapper::{Mapper, MapperConfiguration};
use crate::session::SaveReport;
use crate::store::Store;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tether_ir::NullNavigationPolicy;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateVariant {
    /// The mapper copies only `child_id`; the loaded child stays in place.
    Mapper,
    /// `parent.child_id = key`.
    Manual,
    /// The mapper copies `child_id` and a `null` `child`.
    MapperWithNavigation,
    /// `parent.child_id = key` followed by `parent.child = None`.
    ManualWithNavigation,
}

impl UpdateVariant {
    pub const ALL: [UpdateVariant; 4] = [
        UpdateVariant::Mapper,
        UpdateVariant::Manual,
        UpdateVariant::MapperWithNavigation,
        UpdateVariant::ManualWithNavigation,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            UpdateVariant::Mapper => "mapper",
            UpdateVariant::Manual => "manual",
            UpdateVariant::MapperWithNavigation => "mapper-with-navigation",
            UpdateVariant::ManualWithNavigation => "manual-with-navigation",
        }
    }

    pub fn clears_navigation(self) -> bool {
        matches!(
            self,
            UpdateVariant::MapperWithNavigation | UpdateVariant::ManualWithNavigation
        )
    }
}

impl fmt::Display for UpdateVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpdateVariant {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        UpdateVariant::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| format!("unknown variant '{s}'"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    pub variant: UpdateVariant,
    pub target_key: i64,
}

impl Scenario {
    pub fn new(variant: UpdateVariant, target_key: i64) -> Self {
        Self { variant, target_key }
    }

    pub fn all(target_key: i64) -> Vec<Scenario> {
        UpdateVariant::ALL
            .into_iter()
            .map(|variant| Scenario::new(variant, target_key))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UpdateResult {
    Saved(SaveReport),
    Rejected { reason: String },
}

impl UpdateResult {
    pub fn is_saved(&self) -> bool {
        matches!(self, UpdateResult::Saved(_))
    }
}

/// Row counts and the first parent as a fresh session reads them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Observation {
    pub parent_count: i64,
    pub child_count: i64,
    pub foreign_key: Option<i64>,
    pub reloaded_child_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outcome {
    pub scenario: Scenario,
    pub policy: NullNavigationPolicy,
    pub update: UpdateResult,
    #[serde(flatten)]
    pub observed: Observation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum VerificationFailure {
    #[error("expected 1 parent row, found {actual}")]
    ParentCount { actual: i64 },
    #[error("expected 2 child rows, found {actual}")]
    ChildCount { actual: i64 },
    #[error("expected foreign key {expected}, found {actual:?}")]
    ForeignKey { expected: i64, actual: Option<i64> },
    #[error("foreign key {foreign_key:?} but reloaded child is {child:?}")]
    ReloadedChild {
        foreign_key: Option<i64>,
        child: Option<i64>,
    },
}

impl Outcome {
    pub fn verify(&self, expected_key: i64) -> std::result::Result<(), Vec<VerificationFailure>> {
        let o = &self.observed;
        let mut failures = Vec::new();

        if o.parent_count != SEEDED_PARENTS {
            failures.push(VerificationFailure::ParentCount { actual: o.parent_count });
        }
        if o.child_count != SEEDED_CHILDREN {
            failures.push(VerificationFailure::ChildCount { actual: o.child_count });
        }
        if o.foreign_key != Some(expected_key) {
            failures.push(VerificationFailure::ForeignKey {
                expected: expected_key,
                actual: o.foreign_key,
            });
        }
        if o.foreign_key.is_none() || o.reloaded_child_id != o.foreign_key {
            failures.push(VerificationFailure::ReloadedChild {
                foreign_key: o.foreign_key,
                child: o.reloaded_child_id,
            });
        }

        if failures.is_empty() { Ok(()) } else { Err(failures) }
    }

    /// Checks against the scenario's own target key.
    pub fn verify_target(&self) -> std::result::Result<(), Vec<VerificationFailure>> {
        self.verify(self.scenario.target_key)
    }
}

const SEEDED_PARENTS: i64 = 1;
const SEEDED_CHILDREN: i64 = 2;

pub struct Harness {
    config: StoreConfig,
    policy: NullNavigationPolicy,
    foreign_key_only: Mapper,
    with_navigation: Mapper,
}

impl Harness {
    pub fn new(policy: NullNavigationPolicy) -> Self {
        Self::with_config(StoreConfig::in_memory(), policy)
    }

    pub fn with_config(config: StoreConfig, policy: NullNavigationPolicy) -> Self {
        let foreign_key_only = MapperConfiguration::new(|cfg| {
            cfg.create_map::<ParentPatch, Parent>().member("child_id");
        })
        .create_mapper();

        let with_navigation = MapperConfiguration::new(|cfg| {
            cfg.create_map::<ParentPatch, Parent>().member("child_id").member("child");
        })
        .create_mapper();

        Self {
            config,
            policy,
            foreign_key_only,
            with_navigation,
        }
    }

    pub fn policy(&self) -> NullNavigationPolicy {
        self.policy
    }

    /// Opens a store holding empty tables for the sample model.
    pub async fn open_store(&self) -> Result<Store> {
        let store = Store::connect(&self.config, sample_model(self.policy)?).await?;
        if !self.config.is_in_memory() {
            store.schema_manager().ensure_deleted().await?;
        }
        store.ensure_created().await?;
        Ok(store)
    }

    /// Children 1 and 2, and parent 1 attached to child 1 through its navigation.
    pub async fn seed(store: &Store) -> Result<SaveReport> {
        let mut session = store.session();
        session.add(&Child { id: 2 })?;
        session.add(&Parent {
            id: 1,
            child_id: 0,
            child: Some(Child { id: 1 }),
        })?;
        let report = session.save_changes().await?;
        session.close();
        Ok(report)
    }

    pub async fn apply(&self, store: &Store, scenario: Scenario) -> Result<UpdateResult> {
        let mut session = store.session();
        let mut parent = session.query::<Parent>().include("child").first().await?;

        let patch = ParentPatch {
            child_id: scenario.target_key,
            child: None,
        };
        match scenario.variant {
            UpdateVariant::Mapper => self.foreign_key_only.map(&patch, &mut parent)?,
            UpdateVariant::MapperWithNavigation => self.with_navigation.map(&patch, &mut parent)?,
            UpdateVariant::Manual => parent.child_id = scenario.target_key,
            UpdateVariant::ManualWithNavigation => {
                parent.child_id = scenario.target_key;
                parent.child = None;
            }
        }

        match session.update(&parent) {
            Ok(()) => {}
            Err(
                err @ (RuntimeError::RelationshipConflict { .. } | RuntimeError::RequiredRelationshipSevered { .. }),
            ) => {
                tracing::info!(variant = %scenario.variant, error = %err, "update rejected");
                session.close();
                return Ok(UpdateResult::Rejected {
                    reason: err.to_string(),
                });
            }
            Err(err) => return Err(err),
        }

        let result = match session.save_changes().await {
            Ok(report) => UpdateResult::Saved(report),
            Err(err @ RuntimeError::Database(_)) => {
                tracing::info!(variant = %scenario.variant, error = %err, "save rejected by the database");
                session.discard_changes();
                UpdateResult::Rejected {
                    reason: err.to_string(),
                }
            }
            Err(err) => return Err(err),
        };
        session.close();
        Ok(result)
    }

    pub async fn observe(store: &Store) -> Result<Observation> {
        let mut session = store.session();
        let parent_count = session.count::<Parent>().await?;
        let child_count = session.count::<Child>().await?;
        let parent = session.query::<Parent>().include("child").first_or_none().await?;
        session.close();

        Ok(Observation {
            parent_count,
            child_count,
            foreign_key: parent.as_ref().map(|p| p.child_id),
            reloaded_child_id: parent.and_then(|p| p.child).map(|c| c.id),
        })
    }

    /// Seeds a fresh store, applies the scenario and observes the result.
    pub async fn run(&self, scenario: Scenario) -> Result<Outcome> {
        let store = self.open_store().await?;
        Self::seed(&store).await?;
        let update = self.apply(&store, scenario).await?;
        let observed = Self::observe(&store).await?;
        store.close().await;

        tracing::debug!(variant = %scenario.variant, target = scenario.target_key, ?observed, "scenario finished");
        Ok(Outcome {
            scenario,
            policy: self.policy,
            update,
            observed,
        })
    }

    pub async fn run_all(&self, scenarios: &[Scenario]) -> Result<Vec<Outcome>> {
        let mut outcomes = Vec::with_capacity(scenarios.len());
        for scenario in scenarios {
            outcomes.push(self.run(*scenario).await?);
        }
        Ok(outcomes)
    }
}
