use crate::shell::ShellKind;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Identity of an environment: the manager that owns it plus the manager's
/// own opaque identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentId {
    pub manager_id: String,
    pub id: String,
}

impl EnvironmentId {
    pub fn new(manager_id: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            manager_id: manager_id.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for EnvironmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.manager_id, self.id)
    }
}

/// One shell invocation. Must complete before the next one is issued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationCommand {
    pub executable: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ActivationCommand {
    pub fn new<I, S>(executable: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            executable: executable.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

fn default_activatable() -> bool {
    true
}

/// Environment descriptor as produced by an environment manager. Read-only
/// to everything in this crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PythonEnvironment {
    pub id: EnvironmentId,
    pub display_name: String,
    #[serde(default = "default_activatable")]
    pub is_activatable: bool,
    #[serde(default)]
    pub activation: HashMap<ShellKind, Vec<ActivationCommand>>,
    #[serde(default)]
    pub deactivation: HashMap<ShellKind, Vec<ActivationCommand>>,
}

impl PythonEnvironment {
    pub fn new(id: EnvironmentId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            is_activatable: true,
            activation: HashMap::new(),
            deactivation: HashMap::new(),
        }
    }

    pub fn with_activation(mut self, shell: ShellKind, commands: Vec<ActivationCommand>) -> Self {
        self.activation.insert(shell, commands);
        self
    }

    pub fn with_deactivation(mut self, shell: ShellKind, commands: Vec<ActivationCommand>) -> Self {
        self.deactivation.insert(shell, commands);
        self
    }

    pub fn not_activatable(mut self) -> Self {
        self.is_activatable = false;
        self
    }

    /// Reads a JSON descriptor written by an environment manager.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .context(format!("Failed to read environment descriptor: {}", path.display()))?;
        serde_json::from_str(&raw)
            .context(format!("Invalid environment descriptor: {}", path.display()))
    }
}

/// A project root that owns one shared terminal per environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    pub name: String,
    pub root: PathBuf,
}

impl Project {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
        }
    }

    /// Names the project after its root directory.
    pub fn from_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| root.display().to_string());
        Self { name, root }
    }
}
