//! Error types for tracing, transformation, and backend dispatch.

use thiserror::Error;

/// Main error type for the tracing and compilation pipeline.
#[derive(Debug, Error)]
pub enum Error {
    /// Dtype or shape incompatibility, nonlinear operation in a transpose
    /// rule, tracer-level conflict, or `grad` of a non-scalar output.
    #[error("type error: {0}")]
    Type(String),

    /// Structural mismatch between the input/output tree expected by a
    /// transformation and what was provided.
    #[error("tree mismatch: {0}")]
    TreeMismatch(String),

    /// Use of a freed or invalid backend slot.
    #[error("slot error: {0}")]
    Slot(String),

    /// Error surfaced from an asynchronous backend operation.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Shorthand for results in this crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Build a type error from anything printable.
    pub fn type_error(msg: impl Into<String>) -> Error {
        Error::Type(msg.into())
    }
}
