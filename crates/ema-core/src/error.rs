//! Error taxonomy for the EMA engine.
//!
//! Errors are isolated at the smallest enclosing unit of work: a bad window
//! config aborts that window only, a failed instance write skips that
//! instance only. Nothing here is retried explicitly — unprocessed
//! instances are simply picked up again on the next tick.

use thiserror::Error;

/// All errors the EMA engine can produce.
#[derive(Debug, Error)]
pub enum EmaError {
    /// Malformed or missing configuration. Aborts the affected window only.
    #[error("config error: {0}")]
    Config(String),

    /// Ambiguous or unresolvable event reference.
    #[error("resolution error: {0}")]
    Resolution(String),

    /// Trigger-rule evaluation failed. Aborts only that record/window pass.
    #[error("rule evaluation error: {0}")]
    Rule(String),

    /// Store read/write failure. Logged, unit skipped, loop continues.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// SMS transport failure. Converted to a SendError status, not re-raised.
    #[error("transport error: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, EmaError>;
