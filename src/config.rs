use crate::activation::machine::{ActivationTimings, DEFAULT_CHANNEL_TIMEOUT, DEFAULT_POLL_INTERVAL};
use crate::activation::registry::DEFAULT_MARKER_VARS;
use crate::coordinator::CoordinatorSettings;
use crate::terminal::events::DEFAULT_BUS_CAPACITY;
use crate::utils::path_utils::expand_tilde_path_buf;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub default_shell: Option<String>,
    pub working_directory: PathBuf,
    /// JSON description of the environment the binary activates.
    pub environment_file: Option<PathBuf>,
    pub channel_timeout: Duration,
    pub poll_interval: Duration,
    pub event_bus_capacity: usize,
    pub marker_vars: Vec<String>,
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name).filter(|s| !s.trim().is_empty()) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("Invalid {name}: {raw}")),
        None => Ok(default),
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if present
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let log_level = lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string());
        let default_shell = lookup("DEFAULT_SHELL").filter(|s| !s.is_empty());

        let working_directory = match lookup("WORKING_DIRECTORY").filter(|s| !s.is_empty()) {
            Some(dir) => expand_tilde_path_buf(&dir),
            None => std::env::current_dir().context("Failed to determine current directory")?,
        };
        if !working_directory.is_dir() {
            anyhow::bail!("WORKING_DIRECTORY is not a valid directory: {:?}", working_directory);
        }

        let environment_file = lookup("ACTIVATION_ENVIRONMENT_FILE")
            .filter(|s| !s.is_empty())
            .map(|s| expand_tilde_path_buf(&s));

        let channel_timeout = Duration::from_millis(parse_var(
            &lookup,
            "ACTIVATION_TIMEOUT_MS",
            DEFAULT_CHANNEL_TIMEOUT.as_millis() as u64,
        )?);
        let poll_interval = Duration::from_millis(parse_var(
            &lookup,
            "ACTIVATION_POLL_INTERVAL_MS",
            DEFAULT_POLL_INTERVAL.as_millis() as u64,
        )?);
        if poll_interval.is_zero() {
            anyhow::bail!("ACTIVATION_POLL_INTERVAL_MS must be greater than zero");
        }

        let event_bus_capacity = parse_var(&lookup, "EVENT_BUS_CAPACITY", DEFAULT_BUS_CAPACITY)?;
        if event_bus_capacity == 0 {
            anyhow::bail!("EVENT_BUS_CAPACITY must be greater than zero");
        }

        let marker_vars = match lookup("ACTIVATION_MARKER_VARS") {
            Some(list) => list
                .split(',')
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            None => DEFAULT_MARKER_VARS.iter().map(|s| s.to_string()).collect(),
        };

        Ok(Config {
            log_level,
            default_shell,
            working_directory,
            environment_file,
            channel_timeout,
            poll_interval,
            event_bus_capacity,
            marker_vars,
        })
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            timings: ActivationTimings {
                channel_timeout: self.channel_timeout,
                poll_interval: self.poll_interval,
            },
            bus_capacity: self.event_bus_capacity,
            marker_vars: self.marker_vars.clone(),
            default_shell: self.default_shell.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = Config::from_lookup(lookup_from(&[])).unwrap();

        assert_eq!(config.log_level, "info");
        assert_eq!(config.default_shell, None);
        assert_eq!(config.channel_timeout, Duration::from_millis(500));
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.event_bus_capacity, DEFAULT_BUS_CAPACITY);
        assert_eq!(config.marker_vars, vec!["VIRTUAL_ENV", "CONDA_PREFIX"]);
        assert!(config.environment_file.is_none());
    }

    #[test]
    fn values_are_read_from_the_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let working = dir.path().to_string_lossy().to_string();
        let config = Config::from_lookup(lookup_from(&[
            ("LOG_LEVEL", "debug"),
            ("DEFAULT_SHELL", "/bin/zsh"),
            ("WORKING_DIRECTORY", &working),
            ("ACTIVATION_ENVIRONMENT_FILE", "/tmp/env.json"),
            ("ACTIVATION_TIMEOUT_MS", "1500"),
            ("ACTIVATION_POLL_INTERVAL_MS", " 250 "),
            ("ACTIVATION_MARKER_VARS", "VIRTUAL_ENV, PIXI_PROJECT_ROOT,"),
        ]))
        .unwrap();

        assert_eq!(config.log_level, "debug");
        assert_eq!(config.default_shell.as_deref(), Some("/bin/zsh"));
        assert_eq!(config.working_directory, dir.path());
        assert_eq!(config.environment_file, Some(PathBuf::from("/tmp/env.json")));

        let settings = config.coordinator_settings();
        assert_eq!(settings.timings.channel_timeout, Duration::from_millis(1500));
        assert_eq!(settings.timings.poll_interval, Duration::from_millis(250));
        assert_eq!(settings.marker_vars, vec!["VIRTUAL_ENV", "PIXI_PROJECT_ROOT"]);
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        let err = Config::from_lookup(lookup_from(&[("ACTIVATION_TIMEOUT_MS", "soon")])).unwrap_err();
        assert!(err.to_string().contains("ACTIVATION_TIMEOUT_MS"));

        assert!(Config::from_lookup(lookup_from(&[("ACTIVATION_POLL_INTERVAL_MS", "0")])).is_err());
        assert!(Config::from_lookup(lookup_from(&[("EVENT_BUS_CAPACITY", "0")])).is_err());
    }

    #[test]
    fn missing_working_directory_is_rejected() {
        let result = Config::from_lookup(lookup_from(&[("WORKING_DIRECTORY", "/definitely/not/here")]));
        assert!(result.is_err());
    }
}
