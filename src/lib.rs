//! Opens terminal sessions for Python environments and activates the
//! environment inside them, reusing sessions per file, folder or project.

pub mod activation;
pub mod config;
pub mod coordinator;
pub mod environment;
pub mod error;
pub mod shell;
pub mod terminal;
pub mod utils;

pub use coordinator::{ActivationReporter, CoordinatorSettings, LogReporter, TerminalActivationCoordinator};
