//! Shell kinds, detection from a shell path, and per-shell command-line
//! formatting for raw text injection.

use crate::environment::ActivationCommand;
use crate::terminal::Session;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShellKind {
    Bash,
    Zsh,
    Sh,
    Ksh,
    Fish,
    Csh,
    Tcsh,
    Nu,
    Xonsh,
    GitBash,
    Pwsh,
    Cmd,
    Unknown,
}

static PWSH_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(pwsh|powershell)(-preview)?$").expect("valid regex"));
static POSIX_SAFE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_\-./:=+,@%]+$").expect("valid regex"));
static PWSH_SAFE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_\-./:\\=+]+$").expect("valid regex"));
static CMD_SAFE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_\-./:\\=+,]+$").expect("valid regex"));

impl ShellKind {
    /// Infers the shell kind from an executable path such as `/bin/zsh` or
    /// `C:\Program Files\Git\bin\bash.exe`.
    pub fn from_shell_path(shell_path: &str) -> ShellKind {
        let trimmed = shell_path.trim().trim_matches('"');
        let file_name = trimmed
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(trimmed)
            .to_lowercase();
        let name = file_name.strip_suffix(".exe").unwrap_or(&file_name);

        match name {
            "bash" => {
                // Git for Windows ships its own bash
                let lowered = trimmed.to_lowercase();
                if lowered.contains("\\git\\") || (lowered.contains("/git/") && lowered.ends_with(".exe")) {
                    ShellKind::GitBash
                } else {
                    ShellKind::Bash
                }
            }
            "zsh" => ShellKind::Zsh,
            "sh" | "dash" => ShellKind::Sh,
            "ksh" | "mksh" => ShellKind::Ksh,
            "fish" => ShellKind::Fish,
            "csh" => ShellKind::Csh,
            "tcsh" => ShellKind::Tcsh,
            "nu" => ShellKind::Nu,
            "xonsh" => ShellKind::Xonsh,
            "cmd" => ShellKind::Cmd,
            n if PWSH_NAME.is_match(n) => ShellKind::Pwsh,
            _ => ShellKind::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ShellKind::Bash => "bash",
            ShellKind::Zsh => "zsh",
            ShellKind::Sh => "sh",
            ShellKind::Ksh => "ksh",
            ShellKind::Fish => "fish",
            ShellKind::Csh => "csh",
            ShellKind::Tcsh => "tcsh",
            ShellKind::Nu => "nu",
            ShellKind::Xonsh => "xonsh",
            ShellKind::GitBash => "gitbash",
            ShellKind::Pwsh => "pwsh",
            ShellKind::Cmd => "cmd",
            ShellKind::Unknown => "unknown",
        }
    }

    /// Arguments used when spawning this shell so it reads commands from stdin.
    pub fn stdin_args(&self) -> &'static [&'static str] {
        match self {
            ShellKind::Pwsh => &["-NoLogo", "-NoProfile", "-Command", "-"],
            ShellKind::Cmd => &["/Q"],
            _ => &[],
        }
    }
}

impl fmt::Display for ShellKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decides which command table of an environment applies to a session.
pub trait ShellDetector: Send + Sync {
    fn detect(&self, session: &dyn Session) -> ShellKind;
}

/// Detects the shell kind from the session's shell executable path.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellPathDetector;

impl ShellDetector for ShellPathDetector {
    fn detect(&self, session: &dyn Session) -> ShellKind {
        session
            .shell_path()
            .map(ShellKind::from_shell_path)
            .unwrap_or(ShellKind::Unknown)
    }
}

/// Quotes a single word for the given shell.
pub fn quote_arg(shell: ShellKind, arg: &str) -> String {
    match shell {
        ShellKind::Pwsh => {
            if PWSH_SAFE.is_match(arg) {
                arg.to_string()
            } else {
                format!("'{}'", arg.replace('\'', "''"))
            }
        }
        ShellKind::Cmd => {
            if CMD_SAFE.is_match(arg) {
                arg.to_string()
            } else {
                format!("\"{}\"", arg.replace('"', "\"\""))
            }
        }
        _ => {
            if POSIX_SAFE.is_match(arg) {
                arg.to_string()
            } else {
                // Close the quote, emit an escaped quote, reopen
                format!("'{}'", arg.replace('\'', r"'\''"))
            }
        }
    }
}

/// Renders one activation command as a single line of shell input.
pub fn format_command_line(shell: ShellKind, command: &ActivationCommand) -> String {
    let executable = quote_arg(shell, &command.executable);
    let mut parts = Vec::with_capacity(command.args.len() + 2);

    // PowerShell treats a quoted string as a value; `&` invokes it
    if shell == ShellKind::Pwsh && executable.starts_with('\'') {
        parts.push("&".to_string());
    }
    parts.push(executable);
    parts.extend(command.args.iter().map(|arg| quote_arg(shell, arg)));
    parts.join(" ")
}
