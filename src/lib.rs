//! Formyx - form state and field validation engine
//!
//! Tracks values, errors and touched flags of a form, validates fields
//! against declarative rules with immediate, debounced or throttled timing,
//! guards against stale async results, and gates submission on validity.

pub mod config;
pub mod error;
pub mod handlers;
pub mod state;

pub use config::{FormConfig, FormSchema, FormValidator, RevalidateMode, ValidationMode};
pub use error::{FormError, Result};
pub use handlers::{AsyncCheck, FnCheck, FnSubmit, SubmitHandler};
pub use state::*;
