use crate::environment::{ActivationCommand, PythonEnvironment};
use crate::error::ActivationError;
use crate::shell::ShellKind;
use crate::terminal::SessionId;
use std::collections::HashMap;

/// Activation commands for `shell`, in order, or `None` when the
/// environment cannot be activated in that shell.
pub fn resolve(environment: &PythonEnvironment, shell: ShellKind) -> Option<&[ActivationCommand]> {
    if !environment.is_activatable {
        return None;
    }
    lookup(&environment.activation, shell)
}

pub fn resolve_deactivation(
    environment: &PythonEnvironment,
    shell: ShellKind,
) -> Option<&[ActivationCommand]> {
    lookup(&environment.deactivation, shell)
}

fn lookup(
    table: &HashMap<ShellKind, Vec<ActivationCommand>>,
    shell: ShellKind,
) -> Option<&[ActivationCommand]> {
    if shell == ShellKind::Unknown {
        return None;
    }
    table
        .get(&shell)
        .map(Vec::as_slice)
        .filter(|commands| !commands.is_empty())
}

/// Like [`resolve`], but says why nothing could be resolved.
pub fn activation_plan<'a>(
    environment: &'a PythonEnvironment,
    shell: ShellKind,
    session_id: &SessionId,
) -> Result<&'a [ActivationCommand], ActivationError> {
    plan(resolve(environment, shell), environment, shell, session_id)
}

pub fn deactivation_plan<'a>(
    environment: &'a PythonEnvironment,
    shell: ShellKind,
    session_id: &SessionId,
) -> Result<&'a [ActivationCommand], ActivationError> {
    plan(resolve_deactivation(environment, shell), environment, shell, session_id)
}

fn plan<'a>(
    resolved: Option<&'a [ActivationCommand]>,
    environment: &PythonEnvironment,
    shell: ShellKind,
    session_id: &SessionId,
) -> Result<&'a [ActivationCommand], ActivationError> {
    match resolved {
        Some(commands) => Ok(commands),
        None if shell == ShellKind::Unknown => {
            Err(ActivationError::UnresolvedShellKind(session_id.clone()))
        }
        None => Err(ActivationError::NotActivatable {
            environment: environment.id.to_string(),
            shell,
        }),
    }
}
