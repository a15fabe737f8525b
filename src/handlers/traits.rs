//! Trait abstraction for the async collaborators of a form, enabling mocking in tests

use crate::state::{FieldValue, FormData, Verdict};
use anyhow::Result;
use async_trait::async_trait;

/// Receives the form values once every validation passed
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SubmitHandler: Send + Sync {
    /// Submit the current values. An error is handed back to the caller of
    /// `submit` after the form leaves its submitting state.
    async fn submit(&self, values: FormData) -> Result<()>;
}

/// Asynchronous custom predicate of a validation rule
///
/// Gets owned copies of the value and the form, since the engine keeps
/// accepting changes while the check is running.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AsyncCheck: Send + Sync {
    /// Decide on `value`. An error means "no decision" and leaves the
    /// field's previous error in place.
    async fn check(&self, value: FieldValue, form: FormData) -> Result<Verdict>;
}
