//! Async collaborators of the form engine

mod closure;
mod traits;

pub use closure::{FnCheck, FnSubmit};
pub use traits::{AsyncCheck, SubmitHandler};

#[cfg(test)]
pub use traits::{MockAsyncCheck, MockSubmitHandler};
