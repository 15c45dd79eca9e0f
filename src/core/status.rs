//! Handler status vocabulary.
//!
//! A handler phase communicates with the dispatch engine exclusively through
//! the `Status` it returns. The state machine is the only component that
//! interprets a status as control flow; connection managers only map terminal
//! statuses to protocol responses.
use std::fmt;

/// Outcome code returned by a handler phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Status {
    /// No handler has run yet (initial state of a fresh task).
    #[default]
    None,
    /// Phase succeeded; advance to the next phase.
    Ok,
    /// Delegate to the upstream daemon asynchronously and resume later.
    Forward,
    /// Retry from the initial dispatch state, bounded by `again_bound`.
    Again,
    /// Handler-reported business failure; yields a JSON-RPC error envelope.
    Error,
    /// Abort with a protocol-level rejection and no business payload.
    Drop,
    /// Resource exhaustion (worker queue full), surfaced synchronously.
    Busy,
    /// Engine-detected invariant violation. Never retried.
    InternalError,
    /// Defer the task, preserving its state, for a later re-attempt.
    Postpone,
    /// Stop a periodic task; its registration is withdrawn.
    Stop,
}

impl Status {
    /// Whether this status ends a task's life once the machine reaches EXIT.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::Ok | Status::Error | Status::Drop | Status::Busy | Status::InternalError
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::None => "None",
            Status::Ok => "Ok",
            Status::Forward => "Forward",
            Status::Again => "Again",
            Status::Error => "Error",
            Status::Drop => "Drop",
            Status::Busy => "Busy",
            Status::InternalError => "InternalError",
            Status::Postpone => "Postpone",
            Status::Stop => "Stop",
        };
        f.write_str(s)
    }
}
