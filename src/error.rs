use crate::shell::ShellKind;
use crate::terminal::SessionId;
use thiserror::Error;

/// Why an activation or deactivation attempt did not complete.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActivationError {
    #[error("Environment {environment} has no commands for shell {shell}")]
    NotActivatable { environment: String, shell: ShellKind },

    #[error("Could not determine the shell kind of session {0}")]
    UnresolvedShellKind(SessionId),

    #[error("Session {0} closed before activation finished")]
    SessionClosedDuringActivation(SessionId),

    #[error("Activation of session {0} was superseded by a newer attempt")]
    Superseded(SessionId),

    #[error("Structured channel error: {0}")]
    Channel(String),
}

impl ActivationError {
    /// `NotActivatable` and `UnresolvedShellKind` mean "nothing to do here",
    /// not that the machine failed.
    pub fn is_not_applicable(&self) -> bool {
        matches!(
            self,
            ActivationError::NotActivatable { .. } | ActivationError::UnresolvedShellKind(_)
        )
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    StdIoError(#[from] std::io::Error),

    #[error("Session {0} is closed")]
    Closed(SessionId),

    #[error("Session not found for ID: {0}")]
    SessionNotFound(SessionId),

    #[error("Failed to spawn shell: {0}")]
    SpawnError(String),

    /// Raised by structured channel implementations.
    #[error("Structured channel error: {0}")]
    ChannelError(String),
}

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}
