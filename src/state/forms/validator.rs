//! Field validator: one field, one value, one error at most

use super::field::{FieldDefinition, FieldValue, FormData};
use super::rule::{Bound, CustomCheck, ValidationRule};
use futures::future::BoxFuture;
use std::cmp::Ordering;
use std::sync::Arc;

/// Result of validating a field
pub enum Outcome {
    /// Decided synchronously: `None` means valid
    Settled(Option<String>),
    /// The custom predicate is asynchronous. The future owns copies of the
    /// value and the form; an `Err` means the predicate itself failed.
    Pending(BoxFuture<'static, anyhow::Result<Option<String>>>),
}

impl Outcome {
    pub fn is_pending(&self) -> bool {
        matches!(self, Outcome::Pending(_))
    }

    /// The settled error, if this outcome is settled
    pub fn settled(self) -> Option<Option<String>> {
        match self {
            Outcome::Settled(error) => Some(error),
            Outcome::Pending(_) => None,
        }
    }
}

impl std::fmt::Debug for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Settled(error) => f.debug_tuple("Settled").field(error).finish(),
            Outcome::Pending(_) => f.write_str("Pending(..)"),
        }
    }
}

/// Validate `value` against the rules of `field`
///
/// Rules run in a fixed order and the first failure wins: required,
/// `min`/`max`, `min_length`/`max_length`, `pattern`, custom predicate. An
/// empty value on a field that is not required skips the built-in rules;
/// the custom predicate still sees it, together with the form.
pub fn validate(field: &FieldDefinition, value: &FieldValue, form: &FormData) -> Outcome {
    let label = field.display_label();
    let rule = field.validation.as_ref();
    let generic = rule.and_then(|r| r.message.as_deref());
    let empty = value.is_empty();

    if empty && field.is_required() {
        let message = rule
            .and_then(|r| r.required.as_ref())
            .and_then(|r| r.message())
            .or(generic)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{label} is required"));
        return Outcome::Settled(Some(message));
    }

    let Some(rule) = rule else {
        return Outcome::Settled(None);
    };

    if !empty {
        let failure = check_bounds(rule, value, label)
            .or_else(|| check_length(rule, value, label))
            .or_else(|| check_pattern(rule, value, label));
        if let Some(default_message) = failure {
            return Outcome::Settled(Some(generic.map_or(default_message, str::to_string)));
        }
    }

    let fallback = generic
        .map(str::to_string)
        .unwrap_or_else(|| format!("{label} is invalid"));
    match &rule.validate {
        None => Outcome::Settled(None),
        Some(CustomCheck::Sync(check)) => Outcome::Settled(check(value, form).into_error(&fallback)),
        Some(CustomCheck::Async(check)) => {
            let check = Arc::clone(check);
            let value = value.clone();
            let form = form.clone();
            Outcome::Pending(Box::pin(async move {
                let verdict = check.check(value, form).await?;
                Ok(verdict.into_error(&fallback))
            }))
        }
    }
}

fn check_bounds(rule: &ValidationRule, value: &FieldValue, label: &str) -> Option<String> {
    if let Some(min) = &rule.min {
        if compare(value, min) == Some(Ordering::Less) {
            return Some(format!("{label} must be at least {min}"));
        }
    }
    if let Some(max) = &rule.max {
        if compare(value, max) == Some(Ordering::Greater) {
            return Some(format!("{label} must be at most {max}"));
        }
    }
    None
}

/// Compare a value with a bound; `None` when they are not comparable
fn compare(value: &FieldValue, bound: &Bound) -> Option<Ordering> {
    match (value.as_number(), bound.as_number()) {
        (Some(v), Some(b)) => v.partial_cmp(&b),
        _ => match (value.as_text(), bound) {
            (Some(text), Bound::Text(b)) => Some(text.cmp(b.as_str())),
            _ => None,
        },
    }
}

fn check_length(rule: &ValidationRule, value: &FieldValue, label: &str) -> Option<String> {
    let len = value.length()?;
    let unit = if matches!(value, FieldValue::List(_)) {
        "items"
    } else {
        "characters"
    };
    if let Some(min) = rule.min_length {
        if len < min {
            return Some(format!("{label} must be at least {min} {unit}"));
        }
    }
    if let Some(max) = rule.max_length {
        if len > max {
            return Some(format!("{label} must be at most {max} {unit}"));
        }
    }
    None
}

fn check_pattern(rule: &ValidationRule, value: &FieldValue, label: &str) -> Option<String> {
    let pattern = rule.pattern.as_ref()?;
    let subject = match value {
        FieldValue::Text(_) | FieldValue::Number(_) => value.to_string(),
        _ => return None,
    };
    if pattern.is_match(&subject) {
        None
    } else {
        Some(format!("{label} is invalid"))
    }
}
