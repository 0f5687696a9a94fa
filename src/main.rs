use anyhow::{Context, Result};
use pyenv_terminal::config::Config;
use pyenv_terminal::environment::{Project, PythonEnvironment};
use pyenv_terminal::terminal::process::ProcessSessionProvider;
use pyenv_terminal::terminal::{Session, SessionOptions, SessionProvider};
use pyenv_terminal::TerminalActivationCoordinator;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::Level;
use tracing_subscriber::{filter::EnvFilter, fmt::format::FmtSpan, FmtSubscriber};

const OUTPUT_POLL_INTERVAL: Duration = Duration::from_millis(100);

fn setup_logging(log_level_str: &str) {
    let level = match log_level_str.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("pyenv_terminal={}", level)));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_span_events(FmtSpan::CLOSE)
        .json()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");
}

/// Prints whatever the shell produced since the last call. Returns false once
/// the shell has exited.
async fn drain_output(provider: &ProcessSessionProvider, session: &dyn Session) -> Result<bool> {
    let result = provider.read_output(session.id()).await?;
    if !result.new_output.is_empty() {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{}", result.new_output)?;
        stdout.flush()?;
    }
    if !result.is_running {
        tracing::info!(session = %session.id(), exit_code = ?result.exit_code, "Shell exited");
    }
    Ok(result.is_running)
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;
    setup_logging(&config.log_level);

    tracing::info!(version = %env!("CARGO_PKG_VERSION"), "Starting pyenv-terminal");
    tracing::debug!("Loaded configuration: {:?}", config);

    let provider = Arc::new(ProcessSessionProvider::new(config.default_shell.clone()));
    let coordinator = TerminalActivationCoordinator::new(provider.clone(), config.coordinator_settings());

    let session = match &config.environment_file {
        Some(path) => {
            let environment = PythonEnvironment::load(path)?;
            let project = Project::from_root(config.working_directory.clone());
            tracing::info!(environment = %environment.id, project = %project.name, "Opening activated terminal");
            coordinator
                .get_or_create_project_session(&project, &environment, false)
                .await?
        }
        None => {
            tracing::warn!("ACTIVATION_ENVIRONMENT_FILE is not set; opening a plain terminal");
            provider
                .create_session(SessionOptions {
                    working_directory: Some(config.working_directory.clone()),
                    shell_path: config.default_shell.clone(),
                    ..SessionOptions::default()
                })
                .await?
        }
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut ticker = tokio::time::interval(OUTPUT_POLL_INTERVAL);
    let mut stdin_open = true;

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => {
                match line.context("Failed to read stdin")? {
                    Some(line) => {
                        if let Err(e) = session.send_raw_text(&line) {
                            tracing::warn!(error = %e, "Shell no longer accepts input");
                            break;
                        }
                    }
                    None => {
                        tracing::debug!("stdin closed; asking shell to exit");
                        stdin_open = false;
                        if session.send_raw_text("exit").is_err() {
                            provider.terminate(session.id()).await?;
                        }
                    }
                }
            }
            _ = ticker.tick() => {
                if !drain_output(&provider, session.as_ref()).await? {
                    break;
                }
            }
        }
    }

    coordinator.dispose();
    tracing::info!("pyenv-terminal shutdown.");
    Ok(())
}
