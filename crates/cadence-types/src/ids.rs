//! Type-safe identifier wrappers.
//!
//! Entities, subscriptions and in-flight actions are identified by
//! monotonically issued `u64` counters so that a run replays with the
//! same identifiers from the same seed. Runs themselves are identified
//! by a UUID v7 that survives checkpoint/restore.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generates a newtype wrapper around a `u64` counter with standard derives.
macro_rules! define_counter_id {
    (
        $(#[$meta:meta])*
        $name:ident, $prefix:literal
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            /// Wrap a raw counter value.
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            /// Return the raw counter value.
            pub const fn get(self) -> u64 {
                self.0
            }

            /// Return the identifier that follows this one, or `None` if
            /// the counter space is exhausted.
            pub const fn next(self) -> Option<Self> {
                match self.0.checked_add(1) {
                    Some(raw) => Some(Self(raw)),
                    None => None,
                }
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}{}", $prefix, self.0)
            }
        }

        impl From<u64> for $name {
            fn from(raw: u64) -> Self {
                Self(raw)
            }
        }
    };
}

define_counter_id! {
    /// Identifier of a simulated object. Issued by the state store and
    /// never reused within a run, even after the entity is destroyed.
    EntityId, "e"
}

define_counter_id! {
    /// Handle returned by a bus subscription, used to unsubscribe.
    SubscriptionId, "sub"
}

define_counter_id! {
    /// Identifier of one action instance travelling through the
    /// resolution protocol.
    ActionKey, "act"
}

/// Unique identifier of a simulation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Create a new run identifier using UUID v7 (time-ordered).
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Return the inner [`Uuid`] value.
    pub const fn into_inner(self) -> Uuid {
        self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for RunId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn entity_id_displays_with_prefix() {
        assert_eq!(EntityId::new(7).to_string(), "e7");
        assert_eq!(ActionKey::new(3).to_string(), "act3");
    }

    #[test]
    fn next_stops_at_counter_limit() {
        assert_eq!(EntityId::new(1).next(), Some(EntityId::new(2)));
        assert_eq!(EntityId::new(u64::MAX).next(), None);
    }

    #[test]
    fn counter_ids_serialize_as_plain_numbers() {
        let json = serde_json::to_string(&EntityId::new(42)).unwrap();
        assert_eq!(json, "42");
        let back: EntityId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, EntityId::new(42));
    }

    #[test]
    fn run_ids_are_unique() {
        assert_ne!(RunId::new(), RunId::new());
    }
}
