//! Pass/fail results of record self-checks.
//!
//! Validation never raises: a record reports whether it is consistent and
//! why not, and the caller decides what to do with the answer.

use serde::{Deserialize, Serialize};

/// Outcome of a record's self-validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validation {
    /// Whether the record passed.
    pub ok: bool,
    /// Diagnostic messages (empty on a clean pass).
    pub messages: Vec<String>,
}

impl Validation {
    /// A clean pass.
    pub const fn pass() -> Self {
        Self {
            ok: true,
            messages: Vec::new(),
        }
    }

    /// A failure with one diagnostic.
    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            messages: vec![message.into()],
        }
    }

    /// Pass when `condition` holds, otherwise fail with `message`.
    pub fn check(condition: bool, message: impl Into<String>) -> Self {
        if condition {
            Self::pass()
        } else {
            Self::fail(message)
        }
    }

    /// Combine two results: the merge passes only if both pass.
    #[must_use]
    pub fn and(mut self, other: Self) -> Self {
        self.ok = self.ok && other.ok;
        self.messages.extend(other.messages);
        self
    }

    /// Adapt the result of a `validator` derive.
    pub fn from_validator(result: Result<(), validator::ValidationErrors>) -> Self {
        match result {
            Ok(()) => Self::pass(),
            Err(errors) => Self {
                ok: false,
                messages: errors.to_string().lines().map(str::to_owned).collect(),
            },
        }
    }
}

impl Default for Validation {
    fn default() -> Self {
        Self::pass()
    }
}

#[cfg(test)]
mod tests {
    use validator::Validate;

    use super::*;

    #[derive(Validate)]
    struct Bounded {
        #[validate(range(min = 0.0, max = 1.0))]
        level: f64,
    }

    #[test]
    fn and_requires_both() {
        let merged = Validation::pass().and(Validation::fail("too low"));
        assert!(!merged.ok);
        assert_eq!(merged.messages, vec!["too low".to_owned()]);
    }

    #[test]
    fn check_passes_on_true() {
        assert!(Validation::check(true, "unused").ok);
        assert!(!Validation::check(false, "broken").ok);
    }

    #[test]
    fn validator_errors_become_messages() {
        let bad = Bounded { level: 1.5 };
        let result = Validation::from_validator(bad.validate());
        assert!(!result.ok);
        assert!(!result.messages.is_empty());
        let good = Bounded { level: 0.5 };
        assert!(Validation::from_validator(good.validate()).ok);
    }
}
