//! Session-level error type.
//!
//! Turn-scoped failures (timeouts, parse failures, transport retries,
//! validation rejections) are *not* represented here — they are absorbed by
//! the governance layer and surfaced as `directive_error` broadcast events or
//! agent status transitions. `JamError` is reserved for failures that abort
//! the whole session.

use std::error::Error;
use std::fmt;

/// Errors that can abort a jam session outright.
#[derive(Debug)]
pub enum JamError {
    /// A persona, shared-policy, or DSL-reference file could not be read.
    PersonaLoad(String),

    /// A filesystem or other I/O operation failed outside of persona loading.
    Io(String),

    /// The LLM CLI at `llm_cli_path` could not be spawned at all — a path
    /// that doesn't exist, isn't executable, or isn't a program. Only this
    /// kind of spawn failure aborts the session; a per-turn transport error
    /// or non-zero exit is handled within a turn, not here.
    Spawn(String),

    /// `start()` was called on an orchestrator that is already running.
    AlreadyRunning,

    /// A command was issued to an orchestrator that has not been started.
    NotRunning,
}

impl fmt::Display for JamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JamError::PersonaLoad(msg) => write!(f, "failed to load persona: {}", msg),
            JamError::Io(msg) => write!(f, "io error: {}", msg),
            JamError::Spawn(msg) => write!(f, "failed to spawn llm cli: {}", msg),
            JamError::AlreadyRunning => write!(f, "jam session is already running"),
            JamError::NotRunning => write!(f, "jam session is not running"),
        }
    }
}

impl Error for JamError {}

impl From<std::io::Error> for JamError {
    fn from(err: std::io::Error) -> Self {
        JamError::Io(err.to_string())
    }
}
