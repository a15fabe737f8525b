//! Validation rules attached to form fields

use super::field::{format_number, FieldValue, FormData};
use crate::error::FormError;
use crate::handlers::{AsyncCheck, FnCheck};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// `required: true` or `required: "custom message"`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Required {
    Flag(bool),
    Message(String),
}

impl Required {
    pub fn is_required(&self) -> bool {
        match self {
            Required::Flag(flag) => *flag,
            Required::Message(_) => true,
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            Required::Flag(_) => None,
            Required::Message(msg) => Some(msg),
        }
    }
}

/// Lower or upper bound of a `min`/`max` rule
///
/// Text bounds that parse as numbers compare numerically; other text
/// bounds (ISO dates, times) compare lexicographically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Bound {
    Number(f64),
    Text(String),
}

impl Bound {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Bound::Number(n) => Some(*n),
            Bound::Text(s) => s.trim().parse().ok(),
        }
    }
}

impl fmt::Display for Bound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bound::Number(n) => f.write_str(&format_number(*n)),
            Bound::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for Bound {
    fn from(value: f64) -> Self {
        Bound::Number(value)
    }
}

impl From<i64> for Bound {
    fn from(value: i64) -> Self {
        Bound::Number(value as f64)
    }
}

impl From<&str> for Bound {
    fn from(value: &str) -> Self {
        Bound::Text(value.to_string())
    }
}

/// Compiled regular expression, stored as its source in JSON
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Pattern(Regex);

impl Pattern {
    pub fn new(source: &str) -> Result<Self, FormError> {
        Regex::new(source)
            .map(Pattern)
            .map_err(|source_err| FormError::InvalidPattern {
                pattern: source.to_string(),
                source: source_err,
            })
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.0.is_match(text)
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl TryFrom<String> for Pattern {
    type Error = FormError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Pattern::new(&value)
    }
}

impl From<Pattern> for String {
    fn from(value: Pattern) -> Self {
        value.0.as_str().to_string()
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pattern").field(&self.as_str()).finish()
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

/// Result of a custom predicate
///
/// Mirrors the "message, boolean or nothing" contract: a non-empty message
/// fails with that message, `Fail` falls back to the rule's message, and
/// `Pass` (or an empty message) passes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Verdict {
    #[default]
    Pass,
    Fail,
    Message(String),
}

impl Verdict {
    /// Turn the verdict into an error message, using `fallback` for `Fail`
    pub fn into_error(self, fallback: &str) -> Option<String> {
        match self {
            Verdict::Pass => None,
            Verdict::Fail => Some(fallback.to_string()),
            Verdict::Message(msg) if msg.is_empty() => None,
            Verdict::Message(msg) => Some(msg),
        }
    }
}

impl From<bool> for Verdict {
    fn from(valid: bool) -> Self {
        if valid {
            Verdict::Pass
        } else {
            Verdict::Fail
        }
    }
}

impl From<Option<String>> for Verdict {
    fn from(message: Option<String>) -> Self {
        message.map_or(Verdict::Pass, Verdict::Message)
    }
}

impl From<String> for Verdict {
    fn from(message: String) -> Self {
        Verdict::Message(message)
    }
}

impl From<&str> for Verdict {
    fn from(message: &str) -> Self {
        Verdict::Message(message.to_string())
    }
}

impl From<()> for Verdict {
    fn from(_: ()) -> Self {
        Verdict::Pass
    }
}

/// Synchronous custom predicate over the field value and the whole form
pub type SyncCheck = dyn Fn(&FieldValue, &FormData) -> Verdict + Send + Sync;

/// Custom predicate of a rule, run after every built-in rule passed
#[derive(Clone)]
pub enum CustomCheck {
    Sync(Arc<SyncCheck>),
    Async(Arc<dyn AsyncCheck>),
}

impl CustomCheck {
    /// Wrap a synchronous predicate
    pub fn sync<F, V>(check: F) -> Self
    where
        F: Fn(&FieldValue, &FormData) -> V + Send + Sync + 'static,
        V: Into<Verdict>,
    {
        CustomCheck::Sync(Arc::new(
            move |value: &FieldValue, form: &FormData| -> Verdict { check(value, form).into() },
        ))
    }

    /// Wrap an async closure; it receives owned copies of the value and form
    pub fn future<F, Fut>(check: F) -> Self
    where
        F: Fn(FieldValue, FormData) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Verdict>> + Send + 'static,
    {
        CustomCheck::Async(Arc::new(FnCheck::new(check)))
    }

    /// Use an existing async check implementation
    pub fn handler(check: Arc<dyn AsyncCheck>) -> Self {
        CustomCheck::Async(check)
    }

    pub fn is_async(&self) -> bool {
        matches!(self, CustomCheck::Async(_))
    }
}

impl fmt::Debug for CustomCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CustomCheck::Sync(_) => f.write_str("CustomCheck::Sync(..)"),
            CustomCheck::Async(_) => f.write_str("CustomCheck::Async(..)"),
        }
    }
}

/// Ordered set of constraints for one field
///
/// Evaluated as required, then `min`/`max`, then
/// `min_length`/`max_length`, then `pattern`, then the custom predicate.
/// The first failure wins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<Required>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<Bound>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<Bound>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<Pattern>,
    /// Closures cannot live in a schema file; attach with
    /// [`crate::FormConfig::with_check`]
    #[serde(skip)]
    pub validate: Option<CustomCheck>,
    /// Message for any failing rule without a message of its own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ValidationRule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self) -> Self {
        self.required = Some(Required::Flag(true));
        self
    }

    pub fn required_with(mut self, message: &str) -> Self {
        self.required = Some(Required::Message(message.to_string()));
        self
    }

    pub fn min(mut self, bound: impl Into<Bound>) -> Self {
        self.min = Some(bound.into());
        self
    }

    pub fn max(mut self, bound: impl Into<Bound>) -> Self {
        self.max = Some(bound.into());
        self
    }

    pub fn min_length(mut self, len: usize) -> Self {
        self.min_length = Some(len);
        self
    }

    pub fn max_length(mut self, len: usize) -> Self {
        self.max_length = Some(len);
        self
    }

    pub fn pattern(mut self, source: &str) -> Result<Self, FormError> {
        self.pattern = Some(Pattern::new(source)?);
        Ok(self)
    }

    pub fn custom(mut self, check: CustomCheck) -> Self {
        self.validate = Some(check);
        self
    }

    pub fn message(mut self, message: &str) -> Self {
        self.message = Some(message.to_string());
        self
    }
}
