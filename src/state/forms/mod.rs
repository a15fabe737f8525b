//! Form domain layer
//!
//! Field definitions and rules, the validator, the timing scheduler and the
//! engine that ties them together.

mod engine;
mod field;
mod form_state;
mod rule;
mod timing;
mod validator;

pub use engine::{CheckReply, FormEngine, PendingCheck, Ticket};
pub use field::{FieldDefinition, FieldOption, FieldValue, FileRef, FormData, InputKind};
pub use form_state::{FieldStatus, FormState, SubmitOutcome, ValidationResult};
pub use rule::{Bound, CustomCheck, Pattern, Required, SyncCheck, ValidationRule, Verdict};
pub use timing::{Decision, Scheduler, Strategy};
pub use validator::{validate, Outcome};
