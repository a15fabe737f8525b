//! Read-only form snapshots handed to the presentation layer

use super::field::FormData;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Full state of a form at one point in time
///
/// Every key of `values` has an entry in `errors` and in `touched`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FormState {
    pub values: FormData,
    pub errors: BTreeMap<String, Option<String>>,
    pub touched: BTreeMap<String, bool>,
    pub is_valid: bool,
    pub is_submitting: bool,
    pub is_dirty: bool,
    pub submit_count: u32,
}

impl FormState {
    /// Current error of a field, if it has a non-empty one
    pub fn error(&self, name: &str) -> Option<&str> {
        self.errors
            .get(name)
            .and_then(|e| e.as_deref())
            .filter(|e| !e.is_empty())
    }

    pub fn is_touched(&self, name: &str) -> bool {
        self.touched.get(name).copied().unwrap_or(false)
    }

    /// Validity view of the snapshot
    pub fn validation_result(&self) -> ValidationResult {
        ValidationResult {
            is_valid: self.is_valid,
            errors: self.errors.clone(),
            touched: self.touched.clone(),
        }
    }
}

/// Validity, errors and touched flags without the values
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: BTreeMap<String, Option<String>>,
    pub touched: BTreeMap<String, bool>,
}

/// Validation status of a single field
///
/// `Pristine -> Dirty -> Validating -> Valid | Invalid`. Touched is tracked
/// separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldStatus {
    Pristine,
    Dirty,
    Validating,
    Valid,
    Invalid,
}

impl FieldStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pristine => "pristine",
            Self::Dirty => "dirty",
            Self::Validating => "validating",
            Self::Valid => "valid",
            Self::Invalid => "invalid",
        }
    }
}

/// How a submit attempt ended, when the submit handler did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Validation passed and the handler accepted the values
    Submitted,
    /// Validation failed; the handler was not called
    Invalid(BTreeMap<String, String>),
}

impl SubmitOutcome {
    pub fn is_submitted(&self) -> bool {
        matches!(self, SubmitOutcome::Submitted)
    }
}
