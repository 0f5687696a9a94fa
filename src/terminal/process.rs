//! Session provider backed by real shell processes with piped stdio.
//!
//! Plain pipes carry no shell integration, so these sessions never expose a
//! structured channel and activation always takes the raw-text path.

use super::{
    Session, SessionEvent, SessionId, SessionOptions, SessionProvider, StructuredChannel,
};
use crate::error::SessionError;
use crate::shell::ShellKind;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::process::Stdio as StdProcessStdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command as TokioCommand;
use tokio::sync::{broadcast, mpsc, Mutex as TokioMutex, Notify};
use tracing::{debug, error, info, instrument, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Serialize)]
pub struct ReadOutputResult {
    pub session_id: SessionId,
    pub new_output: String,
    pub is_running: bool,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Serialize)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub name: String,
    pub shell: String,
    pub pid: Option<u32>,
    pub is_running: bool,
    pub start_time_iso: String,
    pub runtime_ms: u128,
}

#[derive(Debug)]
pub struct ProcessSession {
    id: SessionId,
    name: String,
    shell_path: String,
    pid: Option<u32>,
    stdin_tx: mpsc::UnboundedSender<String>,
    output_buffer: Arc<StdMutex<Vec<String>>>,
    exit_code: Arc<StdMutex<Option<i32>>>,
    closed: Arc<AtomicBool>,
    kill_notify: Arc<Notify>,
    start_time: std::time::Instant,
    start_time_system: std::time::SystemTime,
}

impl ProcessSession {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn take_output(&self) -> String {
        let mut buffer = self.output_buffer.lock().unwrap_or_else(PoisonError::into_inner);
        let output = buffer.join("\n");
        buffer.clear();
        output
    }

    fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Session for ProcessSession {
    fn id(&self) -> &SessionId {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn shell_path(&self) -> Option<&str> {
        Some(&self.shell_path)
    }

    fn is_open(&self) -> bool {
        // Opened as soon as the process is spawned
        true
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn structured_channel(&self) -> Option<Arc<dyn StructuredChannel>> {
        None
    }

    fn send_raw_text(&self, line: &str) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed(self.id.clone()));
        }
        self.stdin_tx
            .send(line.to_string())
            .map_err(|_| SessionError::Closed(self.id.clone()))
    }
}

#[derive(Debug)]
pub struct ProcessSessionProvider {
    default_shell: Option<String>,
    events: broadcast::Sender<SessionEvent>,
    sessions: Arc<TokioMutex<HashMap<SessionId, Arc<ProcessSession>>>>,
}

impl ProcessSessionProvider {
    pub fn new(default_shell: Option<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            default_shell,
            events,
            sessions: Arc::new(TokioMutex::new(HashMap::new())),
        }
    }

    fn resolve_shell(&self, requested: Option<&str>) -> Result<String, SessionError> {
        let candidate = requested
            .map(str::to_string)
            .or_else(|| self.default_shell.clone())
            .or_else(|| std::env::var("SHELL").ok().filter(|s| !s.is_empty()))
            .unwrap_or_else(|| {
                if cfg!(windows) {
                    "cmd.exe".to_string()
                } else {
                    "/bin/sh".to_string()
                }
            });

        which::which(&candidate)
            .map(|path| path.to_string_lossy().into_owned())
            .map_err(|e| SessionError::SpawnError(format!("Shell '{}' not found: {}", candidate, e)))
    }

    #[instrument(skip(self))]
    pub async fn read_output(&self, session_id: &SessionId) -> Result<ReadOutputResult, SessionError> {
        let session = {
            let sessions = self.sessions.lock().await;
            sessions.get(session_id).cloned()
        };
        let Some(session) = session else {
            return Err(SessionError::SessionNotFound(session_id.clone()));
        };

        let new_output = session.take_output();
        let exit_code = session.exit_code();
        let is_running = !session.is_closed();

        if !is_running {
            self.sessions.lock().await.remove(session_id);
        }

        Ok(ReadOutputResult {
            session_id: session_id.clone(),
            new_output,
            is_running,
            exit_code,
        })
    }

    #[instrument(skip(self))]
    pub async fn terminate(&self, session_id: &SessionId) -> Result<(), SessionError> {
        let session = self.sessions.lock().await.get(session_id).cloned();
        match session {
            Some(session) if !session.is_closed() => {
                info!(session = %session_id, pid = ?session.pid, "Terminating shell session");
                session.kill_notify.notify_one();
                Ok(())
            }
            Some(_) => Ok(()),
            None => Err(SessionError::SessionNotFound(session_id.clone())),
        }
    }

    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.lock().await;
        let now = std::time::Instant::now();
        sessions
            .values()
            .map(|session| SessionInfo {
                session_id: session.id.clone(),
                name: session.name.clone(),
                shell: session.shell_path.clone(),
                pid: session.pid,
                is_running: !session.is_closed(),
                start_time_iso: chrono::DateTime::<Utc>::from(session.start_time_system).to_rfc3339(),
                runtime_ms: now.duration_since(session.start_time).as_millis(),
            })
            .collect()
    }
}

#[async_trait]
impl SessionProvider for ProcessSessionProvider {
    #[instrument(skip(self, options), fields(name = ?options.name))]
    async fn create_session(&self, options: SessionOptions) -> Result<Arc<dyn Session>, SessionError> {
        let shell_path = self.resolve_shell(options.shell_path.as_deref())?;
        let shell = ShellKind::from_shell_path(&shell_path);

        let mut command = TokioCommand::new(&shell_path);
        command.args(shell.stdin_args());
        if let Some(dir) = &options.working_directory {
            command.current_dir(dir);
        }
        command.envs(&options.extra_env);
        command.stdin(StdProcessStdio::piped());
        command.stdout(StdProcessStdio::piped());
        command.stderr(StdProcessStdio::piped());
        command.kill_on_drop(true);

        debug!(shell = %shell_path, kind = %shell, cwd = ?options.working_directory, "Spawning shell");
        let mut child = command.spawn().map_err(|e| {
            error!(error = %e, shell = %shell_path, "Failed to spawn shell");
            SessionError::SpawnError(format!("Failed to spawn '{}': {}", shell_path, e))
        })?;

        let missing = |stream: &str| SessionError::SpawnError(format!("Failed to capture {} of shell", stream));
        let mut stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let id = SessionId::new();
        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<String>();
        let session = Arc::new(ProcessSession {
            id: id.clone(),
            name: options.name.unwrap_or_else(|| shell.to_string()),
            shell_path: shell_path.clone(),
            pid: child.id(),
            stdin_tx,
            output_buffer: Arc::new(StdMutex::new(Vec::new())),
            exit_code: Arc::new(StdMutex::new(None)),
            closed: Arc::new(AtomicBool::new(false)),
            kill_notify: Arc::new(Notify::new()),
            start_time: std::time::Instant::now(),
            start_time_system: std::time::SystemTime::now(),
        });

        let writer_id = id.clone();
        tokio::spawn(async move {
            while let Some(line) = stdin_rx.recv().await {
                let written = async {
                    stdin.write_all(line.as_bytes()).await?;
                    stdin.write_all(b"\n").await?;
                    stdin.flush().await
                }
                .await;
                if let Err(e) = written {
                    warn!(session = %writer_id, error = %e, "Failed to write to shell stdin");
                    break;
                }
            }
        });

        let output_buffer_stdout = session.output_buffer.clone();
        let stdout_task = tokio::spawn(async move {
            let mut reader = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                output_buffer_stdout
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(line);
            }
        });

        let output_buffer_stderr = session.output_buffer.clone();
        let stderr_task = tokio::spawn(async move {
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                output_buffer_stderr
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(format!("[stderr] {}", line));
            }
        });

        let monitor_session = session.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = monitor_session.kill_notify.notified() => {
                    if let Err(e) = child.start_kill() {
                        warn!(session = %monitor_session.id, error = %e, "Failed to send kill signal");
                    }
                    child.wait().await
                }
            };
            let _ = tokio::join!(stdout_task, stderr_task);

            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(session = %monitor_session.id, error = %e, "Failed to wait for shell");
                    Some(-1)
                }
            };
            *monitor_session
                .exit_code
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = code;
            monitor_session.closed.store(true, Ordering::SeqCst);
            info!(session = %monitor_session.id, pid = ?monitor_session.pid, exit_code = ?code, "Shell session closed");
            let _ = events.send(SessionEvent::Closed {
                session_id: monitor_session.id.clone(),
            });
        });

        self.sessions.lock().await.insert(id.clone(), session.clone());
        let _ = self.events.send(SessionEvent::Opened { session_id: id });

        Ok(session)
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}
