//! Error taxonomy for the MEP engine.
//!
//! Construction-time errors (malformed chains, bad configuration) and
//! per-step errors (a calculator raising, a singular spline fit) are both
//! surfaced through [`MepError`] so callers can match on *kind* rather than
//! parse a message.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MepError {
    #[error("shape mismatch across images: {0}")]
    ShapeMismatch(String),

    #[error("invalid configuration: {0}")]
    ConfigError(String),

    #[error("two or more images share the same calculator instance")]
    SharedCalculator,

    #[error("parallel step failed: {0}")]
    ParallelStepFailed(String),

    #[error("calculator error: {0}")]
    CalculatorError(String),

    #[error("numeric error: {0}")]
    NumericError(String),
}

pub type Result<T> = std::result::Result<T, MepError>;
