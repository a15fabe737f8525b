//! Error types for the form engine

use thiserror::Error;

/// Errors surfaced by the engine and its configuration layer.
///
/// Field validation failures are never errors: they live in the snapshot as
/// per-field messages. Only infrastructure problems and submit handler
/// failures end up here.
#[derive(Debug, Error)]
pub enum FormError {
    /// The submit handler rejected the submission
    #[error("submit handler failed: {0}")]
    Submit(#[source] anyhow::Error),

    /// A pattern rule could not be compiled
    #[error("invalid pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// The form schema is inconsistent
    #[error("invalid form configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = FormError> = std::result::Result<T, E>;
