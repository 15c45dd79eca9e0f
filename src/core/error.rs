//! Engine-level error types.
use thiserror::Error;

use crate::core::status::Status;

/// Errors raised by the dispatch engine itself, as opposed to business
/// failures reported by handlers through [`Status`].
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum EngineError {
    /// No transition row matches the current (phase, status) pair. This is a
    /// configuration error in the transition table, never a silent exit.
    #[error("state machine table is not complete: phase {phase} status {status} triple {triple}")]
    IncompleteTable {
        phase: &'static str,
        status: Status,
        triple: String,
    },

    /// A required process-wide context singleton is missing.
    #[error("required global context key missing: {0}")]
    MissingContextKey(String),

    /// A required global context key holds a value of an unexpected type.
    #[error("global context key has unexpected type: {0}")]
    ContextTypeMismatch(String),

    /// The again counter exceeded its configured bound.
    #[error("again bound exceeded after {0} attempts")]
    AgainBoundExceeded(u32),
}

/// Errors from the upstream client (the daemon the engine forwards to).
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum UpstreamError {
    #[error("upstream connection failed: {0}")]
    Connection(String),

    #[error("upstream request timed out after {0} ms")]
    Timeout(u64),

    #[error("upstream returned status {0}")]
    BadStatus(u16),

    #[error("upstream channel closed")]
    ChannelClosed,
}
