//! Explicit table of the actions a run knows about.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One available action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionSpec {
    /// Identifier used in proposals and in the dispatch event name.
    pub id: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
}

impl ActionSpec {
    /// An action with no description.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
        }
    }
}

/// Registration table of available actions, keyed by id.
///
/// Populated at startup by whoever builds the run and passed by
/// reference to anything that enumerates actions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionTable {
    specs: BTreeMap<String, ActionSpec>,
}

impl ActionTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an action. Returns `false` if the id was already present, in
    /// which case the table is unchanged.
    pub fn register(&mut self, spec: ActionSpec) -> bool {
        if self.specs.contains_key(&spec.id) {
            return false;
        }
        self.specs.insert(spec.id.clone(), spec);
        true
    }

    /// Builder form of [`register`](Self::register).
    #[must_use]
    pub fn with(mut self, spec: ActionSpec) -> Self {
        self.register(spec);
        self
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.specs.contains_key(id)
    }

    /// The action registered under `id`.
    pub fn get(&self, id: &str) -> Option<&ActionSpec> {
        self.specs.get(id)
    }

    /// Registered ids in order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.specs.keys().map(String::as_str)
    }

    /// Registered specs in id order.
    pub fn iter(&self) -> impl Iterator<Item = &ActionSpec> {
        self.specs.values()
    }

    /// Number of registered actions.
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_registration_wins() {
        let mut table = ActionTable::new();
        assert!(table.register(ActionSpec {
            id: "rest".to_owned(),
            description: "Recover energy".to_owned(),
        }));
        assert!(!table.register(ActionSpec::new("rest")));
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("rest").map(|s| s.description.as_str()), Some("Recover energy"));
    }

    #[test]
    fn ids_are_sorted() {
        let table = ActionTable::new()
            .with(ActionSpec::new("move"))
            .with(ActionSpec::new("eat"));
        assert_eq!(table.ids().collect::<Vec<_>>(), vec!["eat", "move"]);
        assert!(table.contains("eat"));
        assert!(!table.contains("fly"));
    }
}
