//! Contracts with the session provider, plus the event bus, the reuse cache
//! and a process-backed provider.

pub mod cache;
pub mod events;
pub mod process;

#[cfg(test)]
pub(crate) mod fake;

use crate::environment::ActivationCommand;
use crate::error::SessionError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Opaque identity of one terminal session, stable for its lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one command issued on a structured channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(String);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle signals published by a session provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Opened {
        session_id: SessionId,
    },
    Closed {
        session_id: SessionId,
    },
    StructuredChannelAvailable {
        session_id: SessionId,
    },
    CommandStarted {
        session_id: SessionId,
        execution_id: ExecutionId,
    },
    CommandEnded {
        session_id: SessionId,
        execution_id: ExecutionId,
        exit_code: Option<i32>,
    },
    /// The shell reported its current environment variables.
    EnvironmentReported {
        session_id: SessionId,
        variables: HashMap<String, String>,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            SessionEvent::Opened { session_id }
            | SessionEvent::Closed { session_id }
            | SessionEvent::StructuredChannelAvailable { session_id }
            | SessionEvent::CommandStarted { session_id, .. }
            | SessionEvent::CommandEnded { session_id, .. }
            | SessionEvent::EnvironmentReported { session_id, .. } => session_id,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub name: Option<String>,
    pub icon_hint: Option<String>,
    pub working_directory: Option<PathBuf>,
    pub extra_env: HashMap<String, String>,
    pub shell_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandExecution {
    pub id: ExecutionId,
}

/// A session capability that runs a command and reports its start and end
/// through `CommandStarted`/`CommandEnded` events.
#[async_trait]
pub trait StructuredChannel: Send + Sync {
    async fn execute(&self, command: &ActivationCommand) -> Result<CommandExecution, SessionError>;
}

/// One interactive shell. Owned by the provider; this crate only observes it
/// and writes to it.
pub trait Session: Send + Sync + fmt::Debug {
    fn id(&self) -> &SessionId;
    fn name(&self) -> &str;
    fn shell_path(&self) -> Option<&str>;
    /// True once the provider has reported the session as opened.
    fn is_open(&self) -> bool;
    fn is_closed(&self) -> bool;
    fn structured_channel(&self) -> Option<Arc<dyn StructuredChannel>>;
    /// Fire-and-forget text injection; a newline is appended by the session.
    fn send_raw_text(&self, line: &str) -> Result<(), SessionError>;
}

#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn create_session(&self, options: SessionOptions) -> Result<Arc<dyn Session>, SessionError>;
    fn subscribe(&self) -> broadcast::Receiver<SessionEvent>;
}
