//! Error taxonomy for hypervisor control-plane operations.
//!
//! Every fallible operation in the control plane returns [`HvResult`].
//! Variants are coarse on purpose: callers branch on the category
//! (command failure, timeout, hardware count mismatch, lifecycle state)
//! and surface the message verbatim to the test step that failed.

use thiserror::Error;

/// Result type for control-plane operations.
pub type HvResult<T> = Result<T, HvError>;

#[derive(Error, Debug)]
pub enum HvError {
    /// A single remote command failed to run, timed out, or reported failure.
    #[error("command failed on {target}: `{command}`: {cause}")]
    Command {
        target: String,
        command: String,
        cause: String,
    },

    /// A polled condition never became true within the scaled budget.
    #[error("timed out after {timeout_secs}s waiting for {description}")]
    Timeout {
        description: String,
        timeout_secs: u64,
    },

    /// Enumerated hardware did not match the expected count.
    #[error("{resource} count mismatch: expected {expected}, found {actual}")]
    CountMismatch {
        resource: String,
        expected: usize,
        actual: usize,
    },

    /// The guest's lifecycle state does not permit the requested operation.
    #[error("cannot {operation} guest {guest} while it is {state}")]
    InvalidState {
        guest: String,
        state: String,
        operation: String,
    },

    /// Guest tooling (the in-guest agent behind the command relay) is not up yet.
    #[error("guest tooling not ready: {0}")]
    ToolingNotReady(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl HvError {
    /// Build a [`HvError::Command`] from anything displayable.
    pub fn command(
        target: impl ToString,
        command: impl Into<String>,
        cause: impl Into<String>,
    ) -> Self {
        HvError::Command {
            target: target.to_string(),
            command: command.into(),
            cause: cause.into(),
        }
    }

    pub fn invalid_state(
        guest: impl Into<String>,
        state: impl ToString,
        operation: impl Into<String>,
    ) -> Self {
        HvError::InvalidState {
            guest: guest.into(),
            state: state.to_string(),
            operation: operation.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, HvError::Timeout { .. })
    }

    pub fn is_state_error(&self) -> bool {
        matches!(self, HvError::InvalidState { .. })
    }

    pub fn is_count_mismatch(&self) -> bool {
        matches!(self, HvError::CountMismatch { .. })
    }

    pub fn is_tooling_not_ready(&self) -> bool {
        matches!(self, HvError::ToolingNotReady(_))
    }
}
