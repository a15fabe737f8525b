//! Closure adapters for the handler traits

use super::traits::{AsyncCheck, SubmitHandler};
use crate::state::{FieldValue, FormData, Verdict};
use anyhow::Result;
use async_trait::async_trait;
use std::future::Future;

/// [`AsyncCheck`] backed by an async closure
pub struct FnCheck<F>(F);

impl<F> FnCheck<F> {
    pub fn new(check: F) -> Self {
        Self(check)
    }
}

#[async_trait]
impl<F, Fut> AsyncCheck for FnCheck<F>
where
    F: Fn(FieldValue, FormData) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Verdict>> + Send + 'static,
{
    async fn check(&self, value: FieldValue, form: FormData) -> Result<Verdict> {
        (self.0)(value, form).await
    }
}

/// [`SubmitHandler`] backed by an async closure
pub struct FnSubmit<F>(F);

impl<F> FnSubmit<F> {
    pub fn new(submit: F) -> Self {
        Self(submit)
    }
}

#[async_trait]
impl<F, Fut> SubmitHandler for FnSubmit<F>
where
    F: Fn(FormData) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn submit(&self, values: FormData) -> Result<()> {
        (self.0)(values).await
    }
}
