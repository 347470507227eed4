//! Scenario documents: initial entities, units, actions and run bounds.
//!
//! A scenario is YAML (or JSON when the file ends in `.json`):
//!
//! ```yaml
//! name: meadow
//! seed: 7
//! entities:
//!   - label: alice
//!     records:
//!       - type: energy
//!         data: { level: 80 }
//! actions:
//!   - id: rest
//! units:
//!   - unit: random_decider
//!   - unit: noop_executor
//! run:
//!   ticks: 20
//! ```
//!
//! Loading checks field constraints with `validator`, then structural
//! rules (unique unit names and action ids). Records are decoded and
//! self-validated when the store is seeded, all before tick 0.

use std::collections::BTreeSet;
use std::path::Path;

use cadence_core::protocol::{ActionSpec, ActionTable};
use cadence_core::{RunUntil, Strategy};
use cadence_store::{RecordRegistry, StateStore, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use validator::Validate;

use crate::catalog::Label;
use crate::error::ScenarioError;

/// A complete scenario document.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    /// Scenario name.
    #[validate(length(min = 1, max = 128))]
    pub name: String,

    /// Seed overriding the configured one.
    #[serde(default)]
    pub seed: Option<u64>,

    /// Initial entities.
    #[serde(default)]
    #[validate(nested)]
    pub entities: Vec<EntitySpec>,

    /// Units to register, in order.
    #[validate(nested)]
    pub units: Vec<UnitSpec>,

    /// Available actions.
    #[serde(default)]
    #[validate(nested)]
    pub actions: Vec<ActionEntry>,

    /// Signal modifiers, applied in order.
    #[serde(default)]
    #[validate(nested)]
    pub modifiers: Vec<ModifierSpec>,

    /// Run bounds.
    #[serde(default)]
    #[validate(nested)]
    pub run: RunSpec,
}

/// One initial entity.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct EntitySpec {
    /// Optional name, stored as a `label` record.
    #[serde(default)]
    #[validate(length(min = 1))]
    pub label: Option<String>,

    /// Records to attach.
    #[serde(default)]
    #[validate(nested)]
    pub records: Vec<RecordSpec>,
}

/// One record of an initial entity.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct RecordSpec {
    /// Registered kind name.
    #[serde(rename = "type")]
    #[validate(length(min = 1))]
    pub kind: String,

    /// Record data.
    #[serde(default)]
    pub data: Value,
}

/// One unit registration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct UnitSpec {
    /// Catalog name.
    #[validate(length(min = 1))]
    pub unit: String,

    /// Instance name; defaults to the catalog name.
    #[serde(default)]
    #[validate(length(min = 1))]
    pub name: Option<String>,

    /// Execution strategy.
    #[serde(default = "default_strategy")]
    pub strategy: Strategy,

    /// Unit-specific parameters.
    #[serde(default)]
    pub params: Value,
}

impl UnitSpec {
    /// Name the unit is registered under.
    pub fn instance_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.unit)
    }
}

const fn default_strategy() -> Strategy {
    Strategy::Serial
}

/// One available action.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct ActionEntry {
    /// Action identifier.
    #[validate(length(min = 1))]
    pub id: String,

    /// Free-form description.
    #[serde(default)]
    pub description: Option<String>,
}

/// One signal modifier.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct ModifierSpec {
    /// Catalog name.
    #[validate(length(min = 1))]
    pub modifier: String,

    /// Scale factor.
    #[serde(default)]
    #[validate(range(min = 0.0))]
    pub weight: Option<f64>,
}

/// Run bounds.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct RunSpec {
    /// Ticks to run.
    #[serde(default)]
    #[validate(range(min = 1))]
    pub ticks: Option<u64>,

    /// Stop once no entity holds this record kind.
    #[serde(default)]
    pub until_empty: Option<String>,
}

impl Scenario {
    /// Load and check a scenario file.
    pub fn load(path: &Path) -> Result<Self, ScenarioError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ScenarioError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let is_json = path.extension().and_then(|ext| ext.to_str()) == Some("json");
        let scenario = if is_json {
            Self::from_json(&contents)?
        } else {
            Self::from_yaml(&contents)?
        };
        info!(
            path = %path.display(),
            name = %scenario.name,
            entities = scenario.entities.len(),
            units = scenario.units.len(),
            "Scenario loaded"
        );
        Ok(scenario)
    }

    /// Parse and check a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self, ScenarioError> {
        let scenario: Self = serde_yml::from_str(yaml)?;
        scenario.check()?;
        Ok(scenario)
    }

    /// Parse and check a JSON document.
    pub fn from_json(json: &str) -> Result<Self, ScenarioError> {
        let scenario: Self = serde_json::from_str(json)?;
        scenario.check()?;
        Ok(scenario)
    }

    /// Field constraints plus structural rules.
    pub fn check(&self) -> Result<(), ScenarioError> {
        self.validate()?;

        let mut names = BTreeSet::new();
        for unit in &self.units {
            if !names.insert(unit.instance_name()) {
                return Err(ScenarioError::Simulation {
                    source: cadence_core::SchedulerError::DuplicateUnit {
                        name: unit.instance_name().to_owned(),
                    }
                    .into(),
                });
            }
        }

        let mut ids = BTreeSet::new();
        for action in &self.actions {
            if !ids.insert(action.id.as_str()) {
                return Err(ScenarioError::DuplicateAction {
                    action: action.id.clone(),
                });
            }
        }
        Ok(())
    }

    /// The action table described by `actions`.
    pub fn action_table(&self) -> ActionTable {
        self.actions.iter().fold(ActionTable::new(), |table, entry| {
            table.with(ActionSpec {
                id: entry.id.clone(),
                description: entry.description.clone().unwrap_or_default(),
            })
        })
    }

    /// Create the initial entities, decoding and validating every record.
    pub fn seed_store(&self, registry: &RecordRegistry) -> Result<StateStore, ScenarioError> {
        let mut store = StateStore::new();
        for (index, entity) in self.entities.iter().enumerate() {
            let id = store.create_entity()?;
            if let Some(name) = &entity.label {
                store.attach(id, Label { name: name.clone() })?;
            }
            for spec in &entity.records {
                let record = registry
                    .decode(&spec.kind, spec.data.clone())
                    .map_err(|e| match e {
                        StoreError::UnknownRecordKind { kind } => ScenarioError::UnknownRecordKind {
                            entity: Some(index),
                            kind,
                        },
                        other => ScenarioError::from(other),
                    })?;
                let check = record.check();
                if !check.ok {
                    return Err(ScenarioError::InvalidRecord {
                        entity: index,
                        kind: spec.kind.clone(),
                        messages: check.messages,
                    });
                }
                store.attach_dyn(id, record)?;
            }
            debug!(entity = %id, index, records = entity.records.len(), "Scenario entity created");
        }
        Ok(store)
    }

    /// The run-until condition, resolved against `registry`.
    pub fn run_until(&self, registry: &RecordRegistry) -> Result<Option<RunUntil>, ScenarioError> {
        self.run
            .until_empty
            .as_deref()
            .map(|kind| {
                registry
                    .kind(kind)
                    .map(RunUntil::NoEntitiesWith)
                    .ok_or_else(|| ScenarioError::UnknownRecordKind {
                        entity: None,
                        kind: kind.to_owned(),
                    })
            })
            .transpose()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use cadence_store::Record;

    use super::*;
    use crate::catalog::{self, Energy};

    const MEADOW: &str = r"
name: meadow
seed: 7
entities:
  - label: alice
    records:
      - type: energy
        data: { level: 80 }
  - records:
      - type: age
        data: { ticks: 3 }
actions:
  - id: rest
    description: Recover
  - id: forage
units:
  - unit: random_decider
  - unit: noop_executor
    strategy: concurrent
run:
  ticks: 20
  until_empty: energy
";

    #[test]
    fn parses_and_seeds_a_yaml_scenario() {
        let scenario = Scenario::from_yaml(MEADOW).unwrap();
        assert_eq!(scenario.seed, Some(7));
        let units: Vec<_> = scenario.units.iter().map(|u| (u.instance_name(), u.strategy)).collect();
        assert_eq!(
            units,
            vec![("random_decider", Strategy::Serial), ("noop_executor", Strategy::Concurrent)]
        );
        assert_eq!(scenario.action_table().len(), 2);

        let registry = catalog::registry();
        let store = scenario.seed_store(&registry).unwrap();
        assert_eq!(store.entity_count(), 2);
        let first = store.entities().next().unwrap();
        assert_eq!(store.get::<Label>(first).map(|l| l.name.as_str()), Some("alice"));
        assert!(store.get::<Energy>(first).is_some());
        assert!(matches!(
            scenario.run_until(&registry).unwrap(),
            Some(RunUntil::NoEntitiesWith(kind)) if kind == Energy::KIND
        ));
    }

    #[test]
    fn json_scenarios_are_accepted() {
        let json = r#"{"name": "tiny", "units": [{"unit": "aging", "params": {"lifespan": 2}}]}"#;
        let scenario = Scenario::from_json(json).unwrap();
        assert_eq!(scenario.units.len(), 1);
        assert!(scenario.entities.is_empty());
    }

    #[test]
    fn empty_name_fails_field_validation() {
        let err = Scenario::from_yaml("name: ''\nunits: []\n").unwrap_err();
        assert!(matches!(err, ScenarioError::Invalid { .. }));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = Scenario::from_yaml("name: x\nunits: []\nspeed: 3\n").unwrap_err();
        assert!(matches!(err, ScenarioError::Yaml { .. }));
    }

    #[test]
    fn duplicate_unit_names_and_actions_are_rejected() {
        let err = Scenario::from_yaml("name: x\nunits:\n  - unit: aging\n  - unit: aging\n").unwrap_err();
        assert!(matches!(err, ScenarioError::Simulation { .. }));
        let err = Scenario::from_yaml("name: x\nunits: []\nactions:\n  - id: a\n  - id: a\n").unwrap_err();
        assert!(matches!(err, ScenarioError::DuplicateAction { .. }));
    }

    #[test]
    fn invalid_and_unknown_records_fail_before_tick_zero() {
        let registry = catalog::registry();
        let bad_energy = Scenario::from_yaml(
            "name: x\nunits: []\nentities:\n  - records:\n      - type: energy\n        data: { level: 500 }\n",
        )
        .unwrap();
        assert!(matches!(
            bad_energy.seed_store(&registry),
            Err(ScenarioError::InvalidRecord { entity: 0, .. })
        ));

        let unknown = Scenario::from_yaml(
            "name: x\nunits: []\nentities:\n  - {}\n  - records:\n      - type: mana\n",
        )
        .unwrap();
        assert!(matches!(
            unknown.seed_store(&registry),
            Err(ScenarioError::UnknownRecordKind { entity: Some(1), .. })
        ));
    }
}
