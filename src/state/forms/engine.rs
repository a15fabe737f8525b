//! Form state engine
//!
//! Owns the values, errors and touched flags of one form, decides when a
//! change or blur turns into a validation call, and applies validation
//! results behind a staleness guard. Every mutation publishes a fresh
//! [`FormState`] on a watch channel.

use super::field::{FieldDefinition, FieldValue, FormData};
use super::form_state::{FieldStatus, FormState, SubmitOutcome};
use super::timing::{Decision, Scheduler};
use super::validator::{self, Outcome};
use crate::config::{FormConfig, FormValidator, RevalidateMode, ValidationMode};
use crate::error::{FormError, Result};
use crate::handlers::SubmitHandler;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Identifies one validation request of one field
///
/// `generation` is the field's value generation when the request was
/// issued; `seq` orders requests of the same field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    pub field: String,
    pub generation: u64,
    pub seq: u64,
}

/// Answer of an asynchronous validation request
#[derive(Debug)]
pub struct CheckReply {
    pub ticket: Ticket,
    pub result: anyhow::Result<Option<String>>,
}

/// An in-flight asynchronous validation
pub type PendingCheck = BoxFuture<'static, CheckReply>;

pub struct FormEngine {
    fields: BTreeMap<String, FieldDefinition>,
    /// field -> fields that list it as a dependency
    dependents: HashMap<String, Vec<String>>,
    validation_mode: ValidationMode,
    revalidate_mode: RevalidateMode,
    form_validator: Option<Arc<FormValidator>>,
    submit_handler: Option<Arc<dyn SubmitHandler>>,

    initial: FormData,
    values: FormData,
    errors: BTreeMap<String, String>,
    touched: BTreeSet<String>,
    /// Fields validated at least once; they follow the revalidate mode
    validated: HashSet<String>,
    is_submitting: bool,
    submit_count: u32,

    generations: HashMap<String, u64>,
    issued: HashMap<String, u64>,
    applied: HashMap<String, u64>,
    /// Newest async request per field that has not answered yet
    awaiting: HashMap<String, u64>,
    scheduler: Scheduler,
    in_flight: FuturesUnordered<PendingCheck>,

    publisher: watch::Sender<FormState>,
}

impl FormEngine {
    /// Build an engine from its configuration
    pub fn new(config: FormConfig) -> Result<Self> {
        let FormConfig {
            schema,
            form_validator,
            submit_handler,
        } = config;
        schema.check()?;

        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for field in &schema.fields {
            for dependency in &field.dependencies {
                dependents
                    .entry(dependency.clone())
                    .or_default()
                    .push(field.name.clone());
            }
        }

        let validation_mode = schema.validation_mode;
        let revalidate_mode = schema.revalidate_mode;
        let fields: BTreeMap<String, FieldDefinition> = schema
            .fields
            .into_iter()
            .map(|field| (field.name.clone(), field))
            .collect();
        let initial = initial_values(&fields, &schema.initial_values);
        let (publisher, _) = watch::channel(FormState::default());

        let engine = Self {
            fields,
            dependents,
            validation_mode,
            revalidate_mode,
            form_validator,
            submit_handler,
            values: initial.clone(),
            initial,
            errors: BTreeMap::new(),
            touched: BTreeSet::new(),
            validated: HashSet::new(),
            is_submitting: false,
            submit_count: 0,
            generations: HashMap::new(),
            issued: HashMap::new(),
            applied: HashMap::new(),
            awaiting: HashMap::new(),
            scheduler: Scheduler::new(),
            in_flight: FuturesUnordered::new(),
            publisher,
        };
        engine.publish();
        debug!(fields = engine.fields.len(), "form engine ready");
        Ok(engine)
    }

    // ---- presentation callbacks -------------------------------------------------

    /// Store a new value for `name`, validating it if asked to and if the
    /// validation mode allows it. Never marks the field touched.
    pub fn on_change(&mut self, name: &str, value: impl Into<FieldValue>, should_validate: bool) {
        self.values.insert(name.to_string(), value.into());
        *self.generations.entry(name.to_string()).or_default() += 1;

        if should_validate {
            if self.change_validates(name) {
                self.request_validation(name);
            }
            let dependents = self.dependents.get(name).cloned().unwrap_or_default();
            for dependent in dependents {
                if self.validated.contains(&dependent) && self.change_validates(&dependent) {
                    self.request_validation(&dependent);
                }
            }
        }
        self.publish();
    }

    /// `on_change` with validation
    pub fn change(&mut self, name: &str, value: impl Into<FieldValue>) {
        self.on_change(name, value, true);
    }

    /// Mark `name` touched and validate it right away, bypassing its timing
    /// strategy. Does nothing when `is_touched` is false.
    pub fn on_blur(&mut self, name: &str, is_touched: bool) {
        if !is_touched {
            return;
        }
        self.touched.insert(name.to_string());
        if self.blur_validates(name) {
            self.scheduler.cancel(name);
            self.validate_now(name);
        }
        self.publish();
    }

    /// `on_blur` with the field touched
    pub fn blur(&mut self, name: &str) {
        self.on_blur(name, true);
    }

    // ---- submit ------------------------------------------------------------------

    /// Validate everything and hand the values to the submit handler
    ///
    /// Pending timers are dropped and every field is validated against its
    /// current value, awaiting async predicates. A handler failure is
    /// returned as [`FormError::Submit`]; values and errors stay as they are.
    pub async fn submit(&mut self) -> Result<SubmitOutcome> {
        let names: Vec<String> = self.values.keys().cloned().collect();
        self.touched.extend(names.iter().cloned());
        self.scheduler.clear();
        self.submit_count += 1;

        for name in &names {
            self.validate_blocking(name).await;
        }
        if let Some(validator) = self.form_validator.clone() {
            for (field, message) in validator(&self.values) {
                if !message.is_empty() {
                    self.errors.insert(field, message);
                }
            }
        }

        if !self.is_valid() {
            info!(errors = self.errors.len(), "submit blocked by validation errors");
            self.publish();
            return Ok(SubmitOutcome::Invalid(self.errors.clone()));
        }

        let Some(handler) = self.submit_handler.clone() else {
            info!("form is valid, no submit handler configured");
            self.publish();
            return Ok(SubmitOutcome::Submitted);
        };

        self.is_submitting = true;
        self.publish();
        let result = handler.submit(self.values.clone()).await;
        self.is_submitting = false;
        self.publish();

        match result {
            Ok(()) => {
                info!(submit_count = self.submit_count, "form submitted");
                Ok(SubmitOutcome::Submitted)
            }
            Err(err) => {
                warn!(error = %err, "submit handler failed");
                Err(FormError::Submit(err))
            }
        }
    }

    // ---- driving timers and async checks -----------------------------------------

    /// Validate every field whose timer has expired. Returns how many fired.
    pub fn run_due(&mut self) -> usize {
        let due = self.scheduler.take_due(Instant::now());
        for name in &due {
            debug!(field = %name, "timer fired");
            self.validate_now(name);
        }
        if !due.is_empty() {
            self.publish();
        }
        due.len()
    }

    /// Drive timers and async checks until nothing is pending
    pub async fn settle(&mut self) {
        loop {
            self.run_due();
            let deadline = self.scheduler.next_deadline();
            if self.in_flight.is_empty() && deadline.is_none() {
                break;
            }
            let wake_at = deadline.unwrap_or_else(Instant::now);
            let reply = tokio::select! {
                Some(reply) = self.in_flight.next(), if !self.in_flight.is_empty() => Some(reply),
                _ = tokio::time::sleep_until(wake_at), if deadline.is_some() => None,
                else => None,
            };
            if let Some(reply) = reply {
                self.resolve(reply);
            }
        }
    }

    /// Earliest pending timer, for hosts running their own event loop
    pub fn next_deadline(&self) -> Option<Instant> {
        self.scheduler.next_deadline()
    }

    /// Hand the in-flight async checks to the caller, who must feed every
    /// reply back through [`FormEngine::resolve`]
    pub fn take_in_flight(&mut self) -> Vec<PendingCheck> {
        std::mem::take(&mut self.in_flight).into_iter().collect()
    }

    pub fn pending_checks(&self) -> usize {
        self.in_flight.len()
    }

    /// Apply the answer of an async check. Returns whether it was applied;
    /// stale answers and failed checks are dropped.
    pub fn resolve(&mut self, reply: CheckReply) -> bool {
        let CheckReply { ticket, result } = reply;
        let applied = match result {
            Ok(error) => self.apply(&ticket, error),
            Err(err) => {
                warn!(
                    field = %ticket.field,
                    error = %err,
                    "async validation failed, keeping previous error"
                );
                self.release(&ticket);
                false
            }
        };
        self.publish();
        applied
    }

    // ---- programmatic control ----------------------------------------------------

    /// Validate one field, or all of them, right now
    ///
    /// Ignores timing strategies and awaits async predicates. Returns
    /// whether the validated fields are free of errors.
    pub async fn trigger(&mut self, name: Option<&str>) -> bool {
        let names: Vec<String> = match name {
            Some(name) => vec![name.to_string()],
            None => self.values.keys().cloned().collect(),
        };
        let mut valid = true;
        for name in &names {
            self.scheduler.cancel(name);
            valid &= self.validate_blocking(name).await;
        }
        self.publish();
        valid
    }

    /// Set an error by hand, e.g. one reported by a server. An empty
    /// message clears the error.
    pub fn set_error(&mut self, name: &str, message: &str) {
        if message.is_empty() {
            self.errors.remove(name);
        } else {
            self.errors.insert(name.to_string(), message.to_string());
        }
        self.publish();
    }

    /// Clear the error of one field, or all errors
    pub fn clear_errors(&mut self, name: Option<&str>) {
        match name {
            Some(name) => {
                self.errors.remove(name);
            }
            None => self.errors.clear(),
        }
        self.publish();
    }

    /// Go back to the initial values, or to new ones
    ///
    /// Errors, touched flags, timers and the submit count are cleared; any
    /// async answer still on its way is discarded when it arrives.
    pub fn reset(&mut self, values: Option<FormData>) {
        if let Some(values) = values {
            self.initial = initial_values(&self.fields, &values);
        }
        self.values = self.initial.clone();
        for name in self.values.keys() {
            *self.generations.entry(name.clone()).or_default() += 1;
        }
        self.errors.clear();
        self.touched.clear();
        self.validated.clear();
        self.awaiting.clear();
        self.scheduler.clear();
        self.in_flight = FuturesUnordered::new();
        self.is_submitting = false;
        self.submit_count = 0;
        debug!("form reset");
        self.publish();
    }

    // ---- reading state -----------------------------------------------------------

    pub fn snapshot(&self) -> FormState {
        let names: BTreeSet<&String> = self
            .values
            .keys()
            .chain(self.errors.keys())
            .chain(self.touched.iter())
            .collect();
        FormState {
            values: self.values.clone(),
            errors: names
                .iter()
                .map(|name| ((*name).clone(), self.errors.get(*name).cloned()))
                .collect(),
            touched: names
                .iter()
                .map(|name| ((*name).clone(), self.touched.contains(*name)))
                .collect(),
            is_valid: self.is_valid(),
            is_submitting: self.is_submitting,
            is_dirty: self.is_dirty(),
            submit_count: self.submit_count,
        }
    }

    /// Receiver of every snapshot published from now on
    pub fn subscribe(&self) -> watch::Receiver<FormState> {
        self.publisher.subscribe()
    }

    pub fn value(&self, name: &str) -> Option<&FieldValue> {
        self.values.get(name)
    }

    pub fn values(&self) -> &FormData {
        &self.values
    }

    pub fn error(&self, name: &str) -> Option<&str> {
        self.errors.get(name).map(String::as_str)
    }

    pub fn is_touched(&self, name: &str) -> bool {
        self.touched.contains(name)
    }

    pub fn is_valid(&self) -> bool {
        self.errors.values().all(String::is_empty)
    }

    pub fn is_dirty(&self) -> bool {
        self.values
            .iter()
            .any(|(name, value)| self.initial.get(name) != Some(value))
    }

    pub fn is_submitting(&self) -> bool {
        self.is_submitting
    }

    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.get(name)
    }

    pub fn field_status(&self, name: &str) -> FieldStatus {
        if self.scheduler.is_pending(name) || self.awaiting.contains_key(name) {
            FieldStatus::Validating
        } else if self.validated.contains(name) {
            if self.errors.contains_key(name) {
                FieldStatus::Invalid
            } else {
                FieldStatus::Valid
            }
        } else if self.values.get(name) != self.initial.get(name) {
            FieldStatus::Dirty
        } else {
            FieldStatus::Pristine
        }
    }

    // ---- internals ---------------------------------------------------------------

    fn in_revalidation(&self, name: &str) -> bool {
        self.submit_count > 0 || self.validated.contains(name)
    }

    fn change_validates(&self, name: &str) -> bool {
        if self.in_revalidation(name) {
            return self.revalidate_mode == RevalidateMode::OnChange;
        }
        match self.validation_mode {
            ValidationMode::OnChange => true,
            ValidationMode::OnBlur | ValidationMode::OnSubmit => false,
            ValidationMode::OnTouched => self.touched.contains(name),
        }
    }

    fn blur_validates(&self, name: &str) -> bool {
        self.in_revalidation(name) || self.validation_mode != ValidationMode::OnSubmit
    }

    /// Validate now or later, depending on the field's timing strategy
    fn request_validation(&mut self, name: &str) {
        let strategy = self.fields.get(name).map(|f| f.timing).unwrap_or_default();
        match self.scheduler.schedule(name, strategy, Instant::now()) {
            Decision::RunNow => self.validate_now(name),
            Decision::Deferred(at) => {
                debug!(field = name, ?strategy, ?at, "validation deferred");
            }
        }
    }

    fn evaluate(&self, name: &str) -> Outcome {
        let Some(field) = self.fields.get(name) else {
            return Outcome::Settled(None);
        };
        let empty = FieldValue::Null;
        let value = self.values.get(name).unwrap_or(&empty);
        validator::validate(field, value, &self.values)
    }

    fn issue(&mut self, name: &str) -> Ticket {
        let seq = self.issued.entry(name.to_string()).or_default();
        *seq += 1;
        Ticket {
            field: name.to_string(),
            generation: self.generations.get(name).copied().unwrap_or(0),
            seq: *seq,
        }
    }

    /// Validate without awaiting; async predicates go in flight
    fn validate_now(&mut self, name: &str) {
        let ticket = self.issue(name);
        self.validated.insert(name.to_string());
        match self.evaluate(name) {
            Outcome::Settled(error) => {
                self.apply(&ticket, error);
            }
            Outcome::Pending(future) => {
                debug!(field = name, seq = ticket.seq, "async validation started");
                self.awaiting.insert(name.to_string(), ticket.seq);
                self.in_flight.push(Box::pin(async move {
                    CheckReply {
                        result: future.await,
                        ticket,
                    }
                }));
            }
        }
    }

    /// Validate and await the result. Returns whether the field has no error.
    async fn validate_blocking(&mut self, name: &str) -> bool {
        let ticket = self.issue(name);
        self.validated.insert(name.to_string());
        let result = match self.evaluate(name) {
            Outcome::Settled(error) => Ok(error),
            Outcome::Pending(future) => future.await,
        };
        match result {
            Ok(error) => {
                self.apply(&ticket, error);
            }
            Err(err) => {
                warn!(field = name, error = %err, "async validation failed, keeping previous error");
                self.release(&ticket);
            }
        }
        !self.errors.contains_key(name)
    }

    /// Store a validation result unless a newer value or a newer result
    /// already superseded it
    fn apply(&mut self, ticket: &Ticket, error: Option<String>) -> bool {
        self.release(ticket);
        let generation = self.generations.get(&ticket.field).copied().unwrap_or(0);
        if ticket.generation != generation {
            debug!(field = %ticket.field, seq = ticket.seq, "discarding result for an outdated value");
            return false;
        }
        let last_applied = self.applied.get(&ticket.field).copied().unwrap_or(0);
        if ticket.seq <= last_applied {
            debug!(field = %ticket.field, seq = ticket.seq, "discarding superseded result");
            return false;
        }
        self.applied.insert(ticket.field.clone(), ticket.seq);

        match error {
            Some(message) if !message.is_empty() => {
                self.errors.insert(ticket.field.clone(), message);
            }
            _ => {
                self.errors.remove(&ticket.field);
            }
        }
        true
    }

    fn release(&mut self, ticket: &Ticket) {
        if self
            .awaiting
            .get(&ticket.field)
            .is_some_and(|seq| *seq <= ticket.seq)
        {
            self.awaiting.remove(&ticket.field);
        }
    }

    fn publish(&self) {
        self.publisher.send_replace(self.snapshot());
    }
}

/// Empty value of every field, overlaid with the configured initial values
fn initial_values(fields: &BTreeMap<String, FieldDefinition>, overrides: &FormData) -> FormData {
    let mut values: FormData = fields
        .values()
        .map(|field| (field.name.clone(), field.empty_value()))
        .collect();
    values.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    values
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FormSchema;
    use crate::handlers::{MockAsyncCheck, MockSubmitHandler};
    use crate::state::forms::rule::{CustomCheck, ValidationRule, Verdict};
    use crate::state::forms::timing::Strategy;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Mutex, OnceLock};
    use std::time::Duration;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn email_field() -> FieldDefinition {
        FieldDefinition::new("email").label("Email").required().rule(
            ValidationRule::new()
                .pattern(r"\S+@\S+\.\S+")
                .unwrap(),
        )
    }

    fn engine_with(fields: Vec<FieldDefinition>) -> FormEngine {
        FormEngine::new(FormConfig::new(FormSchema {
            fields,
            ..Default::default()
        }))
        .unwrap()
    }

    fn engine_with_config(config: FormConfig) -> FormEngine {
        FormEngine::new(config).unwrap()
    }

    /// Custom check that records every value it sees and fails on "bad"
    fn recorder() -> (CustomCheck, Arc<Mutex<Vec<String>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&calls);
        let check = CustomCheck::sync(move |value: &FieldValue, _: &FormData| {
            seen.lock().unwrap().push(value.to_string());
            if value.as_text() == Some("bad") {
                Some("bad value".to_string())
            } else {
                None
            }
        });
        (check, calls)
    }

    mod snapshot {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn test_initial_snapshot_is_clean() {
            let engine = engine_with(vec![email_field(), FieldDefinition::new("bio")]);
            let state = engine.snapshot();

            assert_eq!(state.values.len(), 2);
            assert_eq!(state.errors.get("email"), Some(&None));
            assert_eq!(state.touched.get("bio"), Some(&false));
            assert!(state.is_valid);
            assert!(!state.is_dirty);
            assert!(!state.is_submitting);
            assert_eq!(state.submit_count, 0);
        }

        #[test]
        fn test_initial_values_override_empty_values() {
            let engine = engine_with_config(FormConfig::new(FormSchema {
                fields: vec![FieldDefinition::new("name")],
                initial_values: FormData::from([
                    ("name".to_string(), FieldValue::from("Ada")),
                    ("extra".to_string(), FieldValue::from(1i64)),
                ]),
                ..Default::default()
            }));
            assert_eq!(engine.value("name"), Some(&FieldValue::from("Ada")));
            assert_eq!(engine.value("extra"), Some(&FieldValue::from(1i64)));
            assert!(!engine.is_dirty());
        }

        #[test]
        fn test_every_value_has_error_and_touched_entry() {
            let mut engine = engine_with(vec![email_field()]);
            engine.change("unknown", "x");
            let state = engine.snapshot();
            for name in state.values.keys() {
                assert!(state.errors.contains_key(name));
                assert!(state.touched.contains_key(name));
            }
        }

        #[test]
        fn test_is_dirty_tracks_initial_values() {
            let mut engine = engine_with(vec![FieldDefinition::new("name")]);
            engine.change("name", "Ada");
            assert!(engine.snapshot().is_dirty);
            engine.change("name", "");
            assert!(!engine.snapshot().is_dirty);
        }

        #[test]
        fn test_new_rejects_invalid_schema() {
            let result = FormEngine::new(FormConfig::new(FormSchema {
                fields: vec![FieldDefinition::new("a").depends_on(&["b"])],
                ..Default::default()
            }));
            assert!(matches!(result, Err(FormError::Config(_))));
        }

        #[test]
        fn test_subscribers_see_updates() {
            let mut engine = engine_with(vec![email_field()]);
            let mut rx = engine.subscribe();
            assert!(!rx.has_changed().unwrap());

            engine.change("email", "nope");
            assert!(rx.has_changed().unwrap());
            let state = rx.borrow_and_update().clone();
            assert_eq!(state.error("email"), Some("Email is invalid"));
        }
    }

    mod change_and_blur {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn test_email_scenario() {
            let mut engine = engine_with(vec![email_field()]);

            engine.on_change("email", "not-an-email", true);
            engine.on_blur("email", true);
            let state = engine.snapshot();
            assert_eq!(state.error("email"), Some("Email is invalid"));
            assert!(state.is_touched("email"));
            assert!(!state.is_valid);

            engine.on_change("email", "a@b.com", true);
            let state = engine.snapshot();
            assert_eq!(state.errors.get("email"), Some(&None));
            assert!(state.is_valid);
        }

        #[test]
        fn test_change_never_touches() {
            let mut engine = engine_with(vec![email_field()]);
            engine.change("email", "x");
            assert!(!engine.is_touched("email"));
        }

        #[test]
        fn test_blur_validates_current_value() {
            let mut engine = engine_with(vec![email_field()]);
            engine.on_change("email", "", false);
            assert_eq!(engine.error("email"), None);

            engine.blur("email");
            assert!(engine.is_touched("email"));
            assert_eq!(engine.error("email"), Some("Email is required"));
        }

        #[test]
        fn test_blur_without_touch_does_nothing() {
            let mut engine = engine_with(vec![email_field()]);
            engine.on_blur("email", false);
            assert!(!engine.is_touched("email"));
            assert_eq!(engine.error("email"), None);
        }

        #[test]
        fn test_should_validate_false_skips_validation() {
            let mut engine = engine_with(vec![email_field()]);
            engine.on_change("email", "nope", false);
            assert_eq!(engine.error("email"), None);
            assert_eq!(engine.field_status("email"), FieldStatus::Dirty);
        }

        #[test]
        fn test_untouched_unchanged_fields_have_no_error() {
            let mut engine = engine_with(vec![
                email_field(),
                FieldDefinition::new("name").required(),
            ]);
            engine.change("email", "bad");
            engine.blur("email");
            let state = engine.snapshot();
            assert_eq!(state.errors.get("name"), Some(&None));
            assert!(!state.is_touched("name"));
        }

        #[test]
        fn test_is_valid_matches_errors() {
            let mut engine = engine_with(vec![email_field()]);
            engine.change("email", "bad");
            let state = engine.snapshot();
            assert_eq!(
                state.is_valid,
                state.errors.values().all(|e| e.as_deref().unwrap_or("").is_empty())
            );
            engine.set_error("email", "");
            assert!(engine.snapshot().is_valid);
        }
    }

    mod dependencies {
        use super::*;
        use pretty_assertions::assert_eq;

        fn password_form() -> FormEngine {
            let confirm_check = CustomCheck::sync(|value: &FieldValue, form: &FormData| {
                if form.get("password") == Some(value) {
                    None
                } else {
                    Some("Passwords do not match".to_string())
                }
            });
            engine_with(vec![
                FieldDefinition::new("password").required(),
                FieldDefinition::new("confirm")
                    .depends_on(&["password"])
                    .rule(ValidationRule::new().custom(confirm_check)),
            ])
        }

        #[test]
        fn test_dependency_change_revalidates_dependent() {
            let mut engine = password_form();
            engine.change("password", "secret");
            engine.change("confirm", "secret");
            assert_eq!(engine.error("confirm"), None);

            engine.change("password", "changed");
            assert_eq!(engine.error("confirm"), Some("Passwords do not match"));

            engine.change("password", "secret");
            assert_eq!(engine.error("confirm"), None);
        }

        #[test]
        fn test_dependent_never_validated_stays_clean() {
            let mut engine = password_form();
            engine.change("password", "secret");
            assert_eq!(engine.error("confirm"), None);
            assert_eq!(engine.field_status("confirm"), FieldStatus::Pristine);
        }

        #[tokio::test(start_paused = true)]
        async fn test_dependency_change_reschedules_debounced_dependent() {
            let calls = Arc::new(Mutex::new(Vec::new()));
            let seen = Arc::clone(&calls);
            let confirm_check = CustomCheck::sync(move |value: &FieldValue, form: &FormData| {
                seen.lock().unwrap().push(value.to_string());
                if form.get("password") == Some(value) {
                    None
                } else {
                    Some("Passwords do not match".to_string())
                }
            });
            let mut engine = engine_with(vec![
                FieldDefinition::new("password").required(),
                FieldDefinition::new("confirm")
                    .depends_on(&["password"])
                    .timing(Strategy::debounce(ms(200)))
                    .rule(ValidationRule::new().custom(confirm_check)),
            ]);

            engine.change("password", "secret");
            engine.change("confirm", "secret");
            engine.settle().await;
            assert_eq!(calls.lock().unwrap().len(), 1);
            assert_eq!(engine.error("confirm"), None);

            for password in ["a", "ab", "abc"] {
                engine.change("password", password);
                tokio::time::advance(ms(50)).await;
                assert_eq!(engine.run_due(), 0);
            }
            assert_eq!(calls.lock().unwrap().len(), 1);
            assert_eq!(engine.field_status("confirm"), FieldStatus::Validating);

            engine.settle().await;
            assert_eq!(calls.lock().unwrap().len(), 2);
            assert_eq!(engine.error("confirm"), Some("Passwords do not match"));
        }

        fn async_password_form() -> FormEngine {
            let confirm_check = CustomCheck::future(|value: FieldValue, form: FormData| async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                let verdict = if form.get("password") == Some(&value) {
                    Verdict::Pass
                } else {
                    Verdict::from("Passwords do not match")
                };
                Ok::<_, anyhow::Error>(verdict)
            });
            engine_with(vec![
                FieldDefinition::new("password").required(),
                FieldDefinition::new("confirm")
                    .depends_on(&["password"])
                    .rule(ValidationRule::new().custom(confirm_check)),
            ])
        }

        /// Confirm matches, then a request against the old password is
        /// still in flight when the password changes
        async fn overlapping_confirm_checks(engine: &mut FormEngine) -> (CheckReply, CheckReply) {
            engine.change("password", "secret");
            engine.change("confirm", "secret");
            engine.settle().await;
            assert_eq!(engine.error("confirm"), None);

            engine.blur("confirm");
            engine.change("password", "other");

            let mut replies = futures::future::join_all(engine.take_in_flight()).await;
            assert_eq!(replies.len(), 2);
            replies.sort_by_key(|reply| reply.ticket.seq);
            let newer = replies.pop().unwrap();
            let older = replies.pop().unwrap();
            (older, newer)
        }

        #[tokio::test(start_paused = true)]
        async fn test_async_dependent_result_from_before_change_is_superseded() {
            let mut engine = async_password_form();
            let (older, newer) = overlapping_confirm_checks(&mut engine).await;

            assert!(engine.resolve(newer));
            assert_eq!(engine.error("confirm"), Some("Passwords do not match"));
            assert!(!engine.resolve(older));
            assert_eq!(engine.error("confirm"), Some("Passwords do not match"));
            assert_eq!(engine.field_status("confirm"), FieldStatus::Invalid);
        }

        #[tokio::test(start_paused = true)]
        async fn test_async_dependent_results_in_order_end_on_latest() {
            let mut engine = async_password_form();
            let (older, newer) = overlapping_confirm_checks(&mut engine).await;

            assert!(engine.resolve(older));
            assert_eq!(engine.field_status("confirm"), FieldStatus::Validating);
            assert!(engine.resolve(newer));
            assert_eq!(engine.error("confirm"), Some("Passwords do not match"));
        }
    }

    mod modes {
        use super::*;
        use pretty_assertions::assert_eq;

        fn engine_in(mode: ValidationMode, revalidate: RevalidateMode) -> FormEngine {
            engine_with_config(FormConfig::new(FormSchema {
                fields: vec![email_field()],
                validation_mode: mode,
                revalidate_mode: revalidate,
                ..Default::default()
            }))
        }

        #[test]
        fn test_on_blur_mode_waits_for_blur() {
            let mut engine = engine_in(ValidationMode::OnBlur, RevalidateMode::OnChange);
            engine.change("email", "bad");
            assert_eq!(engine.error("email"), None);
            engine.blur("email");
            assert_eq!(engine.error("email"), Some("Email is invalid"));
            // revalidates on change from now on
            engine.change("email", "a@b.com");
            assert_eq!(engine.error("email"), None);
        }

        #[test]
        fn test_on_submit_mode_waits_for_submit() {
            let mut engine = engine_in(ValidationMode::OnSubmit, RevalidateMode::OnChange);
            engine.change("email", "bad");
            engine.blur("email");
            assert_eq!(engine.error("email"), None);
            assert!(engine.is_touched("email"));

            let outcome = tokio_test::block_on(engine.submit()).unwrap();
            assert!(!outcome.is_submitted());
            assert_eq!(engine.error("email"), Some("Email is invalid"));

            engine.change("email", "a@b.com");
            assert_eq!(engine.error("email"), None);
        }

        #[test]
        fn test_on_touched_mode_validates_changes_after_blur() {
            let mut engine = engine_in(ValidationMode::OnTouched, RevalidateMode::OnChange);
            engine.change("email", "bad");
            assert_eq!(engine.error("email"), None);
            engine.blur("email");
            assert_eq!(engine.error("email"), Some("Email is invalid"));
            engine.change("email", "a@b.com");
            assert_eq!(engine.error("email"), None);
        }

        #[test]
        fn test_revalidate_on_blur_keeps_error_until_blur() {
            let mut engine = engine_in(ValidationMode::OnChange, RevalidateMode::OnBlur);
            engine.change("email", "bad");
            assert_eq!(engine.error("email"), Some("Email is invalid"));

            engine.change("email", "a@b.com");
            assert_eq!(engine.error("email"), Some("Email is invalid"));
            engine.blur("email");
            assert_eq!(engine.error("email"), None);
        }
    }

    mod timing {
        use super::*;
        use pretty_assertions::assert_eq;

        #[tokio::test(start_paused = true)]
        async fn test_debounce_coalesces_rapid_changes() {
            let (check, calls) = recorder();
            let mut engine = engine_with(vec![FieldDefinition::new("q")
                .timing(Strategy::debounce(ms(100)))
                .rule(ValidationRule::new().custom(check))]);

            for value in ["a", "b", "c", "d", "bad"] {
                engine.change("q", value);
                tokio::time::advance(ms(20)).await;
            }
            assert!(calls.lock().unwrap().is_empty());
            assert_eq!(engine.field_status("q"), FieldStatus::Validating);

            engine.settle().await;
            assert_eq!(*calls.lock().unwrap(), vec!["bad".to_string()]);
            assert_eq!(engine.error("q"), Some("bad value"));
            assert_eq!(engine.field_status("q"), FieldStatus::Invalid);
        }

        #[tokio::test(start_paused = true)]
        async fn test_debounce_fires_after_quiet_period() {
            let (check, calls) = recorder();
            let mut engine = engine_with(vec![FieldDefinition::new("q")
                .timing(Strategy::debounce(ms(100)))
                .rule(ValidationRule::new().custom(check))]);

            engine.change("q", "a");
            tokio::time::advance(ms(99)).await;
            assert_eq!(engine.run_due(), 0);
            tokio::time::advance(ms(1)).await;
            assert_eq!(engine.run_due(), 1);
            assert_eq!(*calls.lock().unwrap(), vec!["a".to_string()]);
        }

        #[tokio::test(start_paused = true)]
        async fn test_throttle_bounds_validation_calls() {
            let (check, calls) = recorder();
            let mut engine = engine_with(vec![FieldDefinition::new("q")
                .timing(Strategy::throttle(ms(100)))
                .rule(ValidationRule::new().custom(check))]);

            // one edit every 10ms for 500ms
            for i in 0..50 {
                engine.run_due();
                engine.change("q", format!("v{i}"));
                tokio::time::advance(ms(10)).await;
            }
            engine.settle().await;

            let calls = calls.lock().unwrap();
            assert!(calls.len() <= 500usize.div_ceil(100) + 1, "{} calls", calls.len());
            assert_eq!(calls.first().map(String::as_str), Some("v0"));
            assert_eq!(calls.last().map(String::as_str), Some("v49"));
        }

        #[tokio::test(start_paused = true)]
        async fn test_blur_validates_immediately_and_cancels_timer() {
            let (check, calls) = recorder();
            let mut engine = engine_with(vec![FieldDefinition::new("q")
                .timing(Strategy::debounce(ms(300)))
                .rule(ValidationRule::new().custom(check))]);

            engine.change("q", "bad");
            engine.blur("q");
            assert_eq!(engine.error("q"), Some("bad value"));
            assert_eq!(engine.next_deadline(), None);

            engine.settle().await;
            assert_eq!(calls.lock().unwrap().len(), 1);
        }

        #[tokio::test(start_paused = true)]
        async fn test_submit_overrides_pending_debounce() {
            let (check, calls) = recorder();
            let mut engine = engine_with(vec![FieldDefinition::new("q")
                .timing(Strategy::debounce(ms(500)))
                .rule(ValidationRule::new().custom(check))]);

            engine.change("q", "bad");
            let outcome = engine.submit().await.unwrap();

            assert!(!outcome.is_submitted());
            assert_eq!(engine.error("q"), Some("bad value"));
            assert_eq!(engine.next_deadline(), None);
            assert_eq!(*calls.lock().unwrap(), vec!["bad".to_string()]);
        }
    }

    mod async_checks {
        use super::*;
        use pretty_assertions::assert_eq;

        fn username_check() -> CustomCheck {
            CustomCheck::future(|value: FieldValue, _form: FormData| async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                let verdict = if value.as_text() == Some("b") {
                    Verdict::from("b is taken")
                } else {
                    Verdict::Pass
                };
                Ok::<_, anyhow::Error>(verdict)
            })
        }

        fn username_form() -> FormEngine {
            engine_with(vec![FieldDefinition::new("username")
                .rule(ValidationRule::new().custom(username_check()))])
        }

        async fn replies(engine: &mut FormEngine) -> Vec<CheckReply> {
            let mut replies = futures::future::join_all(engine.take_in_flight()).await;
            replies.sort_by_key(|reply| reply.ticket.seq);
            replies
        }

        #[tokio::test(start_paused = true)]
        async fn test_settle_applies_async_result() {
            let mut engine = username_form();
            engine.change("username", "b");
            assert_eq!(engine.pending_checks(), 1);
            assert_eq!(engine.field_status("username"), FieldStatus::Validating);

            engine.settle().await;
            assert_eq!(engine.error("username"), Some("b is taken"));
            assert_eq!(engine.field_status("username"), FieldStatus::Invalid);
        }

        #[tokio::test(start_paused = true)]
        async fn test_stale_result_arriving_last_is_discarded() {
            let mut engine = username_form();
            engine.change("username", "a");
            engine.change("username", "b");

            let mut replies = replies(&mut engine).await;
            let newer = replies.pop().unwrap();
            let older = replies.pop().unwrap();

            assert!(engine.resolve(newer));
            assert!(!engine.resolve(older));
            assert_eq!(engine.error("username"), Some("b is taken"));
        }

        #[tokio::test(start_paused = true)]
        async fn test_stale_result_arriving_first_is_discarded() {
            let mut engine = username_form();
            engine.change("username", "a");
            engine.change("username", "b");

            let mut replies = replies(&mut engine).await;
            let newer = replies.pop().unwrap();
            let older = replies.pop().unwrap();

            assert!(!engine.resolve(older));
            assert_eq!(engine.field_status("username"), FieldStatus::Validating);
            assert!(engine.resolve(newer));
            assert_eq!(engine.error("username"), Some("b is taken"));
            assert_eq!(engine.field_status("username"), FieldStatus::Invalid);
        }

        #[tokio::test(start_paused = true)]
        async fn test_older_request_for_same_value_does_not_win() {
            let mut engine = username_form();
            engine.change("username", "b");
            engine.blur("username");

            let mut replies = replies(&mut engine).await;
            let newer = replies.pop().unwrap();
            let older = replies.pop().unwrap();
            assert!(engine.resolve(newer));
            assert!(!engine.resolve(older));
        }

        #[tokio::test]
        async fn test_rejection_keeps_previous_error() {
            let mut check = MockAsyncCheck::new();
            check
                .expect_check()
                .withf(|value, _| value.as_text() == Some("taken"))
                .times(1)
                .returning(|_, _| Ok(Verdict::from("already taken")));
            check
                .expect_check()
                .withf(|value, _| value.as_text() == Some("flaky"))
                .times(1)
                .returning(|_, _| Err(anyhow::anyhow!("lookup service down")));
            let mut engine = engine_with(vec![FieldDefinition::new("username").rule(
                ValidationRule::new().custom(CustomCheck::handler(Arc::new(check))),
            )]);

            engine.change("username", "taken");
            engine.settle().await;
            assert_eq!(engine.error("username"), Some("already taken"));

            engine.change("username", "flaky");
            engine.settle().await;
            assert_eq!(engine.error("username"), Some("already taken"));
            assert_eq!(engine.field_status("username"), FieldStatus::Invalid);
        }

        #[tokio::test(start_paused = true)]
        async fn test_submit_awaits_async_checks() {
            let mut engine = username_form();
            engine.on_change("username", "b", false);
            let outcome = engine.submit().await.unwrap();
            assert_eq!(
                outcome,
                SubmitOutcome::Invalid(BTreeMap::from([(
                    "username".to_string(),
                    "b is taken".to_string()
                )]))
            );
        }

        #[tokio::test(start_paused = true)]
        async fn test_in_flight_result_discarded_after_reset() {
            let mut engine = username_form();
            engine.change("username", "b");
            let pending = engine.take_in_flight();
            engine.reset(None);

            for reply in futures::future::join_all(pending).await {
                assert!(!engine.resolve(reply));
            }
            assert_eq!(engine.error("username"), None);
        }
    }

    mod submit {
        use super::*;
        use pretty_assertions::assert_eq;

        #[tokio::test]
        async fn test_invalid_form_never_calls_handler() {
            let mut handler = MockSubmitHandler::new();
            handler.expect_submit().times(0);
            let mut engine = engine_with_config(
                FormConfig::new(FormSchema {
                    fields: vec![email_field(), FieldDefinition::new("bio")],
                    ..Default::default()
                })
                .with_submit_handler(Arc::new(handler)),
            );

            let outcome = engine.submit().await.unwrap();
            let state = engine.snapshot();

            assert_eq!(
                outcome,
                SubmitOutcome::Invalid(BTreeMap::from([(
                    "email".to_string(),
                    "Email is required".to_string()
                )]))
            );
            assert!(state.is_touched("email"));
            assert!(state.is_touched("bio"));
            assert!(!state.is_submitting);
            assert_eq!(state.submit_count, 1);
        }

        #[tokio::test]
        async fn test_valid_form_calls_handler_while_submitting() {
            let receiver: Arc<OnceLock<watch::Receiver<FormState>>> = Arc::new(OnceLock::new());
            let submitting_seen = Arc::new(AtomicBool::new(false));

            let mut handler = MockSubmitHandler::new();
            let slot = Arc::clone(&receiver);
            let seen = Arc::clone(&submitting_seen);
            handler
                .expect_submit()
                .withf(|values| values.get("email") == Some(&FieldValue::from("a@b.com")))
                .times(1)
                .returning(move |_| {
                    let submitting = slot.get().is_some_and(|rx| rx.borrow().is_submitting);
                    seen.store(submitting, Ordering::SeqCst);
                    Ok(())
                });

            let mut engine = engine_with_config(
                FormConfig::new(FormSchema {
                    fields: vec![email_field()],
                    ..Default::default()
                })
                .with_submit_handler(Arc::new(handler)),
            );
            receiver.set(engine.subscribe()).unwrap();

            engine.change("email", "a@b.com");
            let outcome = engine.submit().await.unwrap();

            assert_eq!(outcome, SubmitOutcome::Submitted);
            assert!(submitting_seen.load(Ordering::SeqCst));
            assert!(!engine.is_submitting());
            assert_eq!(engine.value("email"), Some(&FieldValue::from("a@b.com")));
        }

        #[tokio::test]
        async fn test_handler_failure_is_propagated() {
            let mut handler = MockSubmitHandler::new();
            handler
                .expect_submit()
                .times(1)
                .returning(|_| Err(anyhow::anyhow!("server said no")));
            let mut engine = engine_with_config(
                FormConfig::new(FormSchema {
                    fields: vec![email_field()],
                    ..Default::default()
                })
                .with_submit_handler(Arc::new(handler)),
            );
            engine.change("email", "a@b.com");

            let err = engine.submit().await.unwrap_err();
            assert!(matches!(err, FormError::Submit(_)));
            assert!(!engine.is_submitting());
            assert_eq!(engine.value("email"), Some(&FieldValue::from("a@b.com")));
            assert!(engine.is_valid());
        }

        #[tokio::test]
        async fn test_cross_field_validator_blocks_submit() {
            let mut handler = MockSubmitHandler::new();
            handler.expect_submit().times(0);
            let mut engine = engine_with_config(
                FormConfig::new(FormSchema {
                    fields: vec![FieldDefinition::new("start"), FieldDefinition::new("end")],
                    ..Default::default()
                })
                .with_form_validator(|values: &FormData| {
                    let mut errors = BTreeMap::new();
                    if values.get("start").and_then(FieldValue::as_number)
                        > values.get("end").and_then(FieldValue::as_number)
                    {
                        errors.insert("end".to_string(), "End must be after start".to_string());
                    }
                    errors
                })
                .with_submit_handler(Arc::new(handler)),
            );
            engine.change("start", 10.0);
            engine.change("end", 5.0);

            let outcome = engine.submit().await.unwrap();
            assert!(!outcome.is_submitted());
            assert_eq!(engine.error("end"), Some("End must be after start"));
        }

        #[tokio::test]
        async fn test_optional_field_custom_check_sees_empty_value() {
            let contact_check = CustomCheck::sync(|value: &FieldValue, form: &FormData| {
                let email_empty = form.get("email").map_or(true, FieldValue::is_empty);
                if value.is_empty() && email_empty {
                    Some("Provide a phone number or an email".to_string())
                } else {
                    None
                }
            });
            let mut engine = engine_with(vec![
                FieldDefinition::new("email"),
                FieldDefinition::new("phone").rule(ValidationRule::new().custom(contact_check)),
            ]);

            engine.change("phone", "");
            engine.blur("phone");
            assert_eq!(engine.error("phone"), Some("Provide a phone number or an email"));

            let outcome = engine.submit().await.unwrap();
            assert_eq!(
                outcome,
                SubmitOutcome::Invalid(BTreeMap::from([(
                    "phone".to_string(),
                    "Provide a phone number or an email".to_string()
                )]))
            );

            engine.change("email", "a@b.com");
            assert!(engine.submit().await.unwrap().is_submitted());
        }

        #[tokio::test]
        async fn test_form_without_handler_submits() {
            let mut engine = engine_with(vec![FieldDefinition::new("bio")]);
            let outcome = engine.submit().await.unwrap();
            assert!(outcome.is_submitted());
            assert!(engine.is_touched("bio"));
        }
    }

    mod control {
        use super::*;
        use pretty_assertions::assert_eq;

        #[tokio::test]
        async fn test_trigger_validates_untouched_fields() {
            let mut engine = engine_with(vec![email_field(), FieldDefinition::new("bio")]);
            assert!(!engine.trigger(None).await);
            assert_eq!(engine.error("email"), Some("Email is required"));
            assert!(!engine.is_touched("email"));
            assert!(engine.trigger(Some("bio")).await);
        }

        #[test]
        fn test_set_and_clear_errors() {
            let mut engine = engine_with(vec![email_field()]);
            engine.set_error("email", "Already registered");
            assert_eq!(engine.error("email"), Some("Already registered"));
            assert!(!engine.is_valid());

            engine.clear_errors(Some("email"));
            assert!(engine.is_valid());

            engine.set_error("email", "x");
            engine.set_error("server", "y");
            engine.clear_errors(None);
            assert!(engine.snapshot().is_valid);
        }

        #[tokio::test]
        async fn test_reset_restores_initial_state() {
            let mut engine = engine_with(vec![email_field()]);
            engine.change("email", "bad");
            engine.blur("email");
            engine.submit().await.unwrap();

            engine.reset(None);
            let state = engine.snapshot();
            assert_eq!(state.values["email"], FieldValue::from(""));
            assert!(state.is_valid);
            assert!(!state.is_dirty);
            assert!(!state.is_touched("email"));
            assert_eq!(state.submit_count, 0);
            assert_eq!(engine.field_status("email"), FieldStatus::Pristine);
        }

        #[test]
        fn test_reset_with_new_values() {
            let mut engine = engine_with(vec![email_field()]);
            engine.reset(Some(FormData::from([(
                "email".to_string(),
                FieldValue::from("a@b.com"),
            )])));
            assert_eq!(engine.value("email"), Some(&FieldValue::from("a@b.com")));
            assert!(!engine.is_dirty());
        }

        #[test]
        fn test_field_status_lifecycle() {
            let mut engine = engine_with(vec![email_field()]);
            assert_eq!(engine.field_status("email"), FieldStatus::Pristine);
            engine.on_change("email", "bad", false);
            assert_eq!(engine.field_status("email"), FieldStatus::Dirty);
            engine.blur("email");
            assert_eq!(engine.field_status("email"), FieldStatus::Invalid);
            engine.change("email", "a@b.com");
            assert_eq!(engine.field_status("email"), FieldStatus::Valid);
        }
    }
}
