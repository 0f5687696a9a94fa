//! In-memory session provider used by unit tests.

use super::{
    CommandExecution, ExecutionId, Session, SessionEvent, SessionId, SessionOptions,
    SessionProvider, StructuredChannel,
};
use crate::environment::ActivationCommand;
use crate::error::SessionError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub(crate) struct FakeBehavior {
    pub shell_path: Option<String>,
    pub open_on_create: bool,
    pub channel_at_open: bool,
    /// Delay between a structured command starting and its end signal.
    pub end_delay: Duration,
}

impl Default for FakeBehavior {
    fn default() -> Self {
        Self {
            shell_path: Some("/bin/bash".to_string()),
            open_on_create: true,
            channel_at_open: false,
            end_delay: Duration::from_millis(10),
        }
    }
}

#[derive(Debug)]
pub(crate) struct FakeProvider {
    events: broadcast::Sender<SessionEvent>,
    behavior: FakeBehavior,
    sessions: StdMutex<Vec<Arc<FakeSession>>>,
}

impl FakeProvider {
    pub fn new(behavior: FakeBehavior) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            events,
            behavior,
            sessions: StdMutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn sessions(&self) -> Vec<Arc<FakeSession>> {
        self.sessions.lock().unwrap().clone()
    }

    pub fn created(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn last(&self) -> Option<Arc<FakeSession>> {
        self.sessions.lock().unwrap().last().cloned()
    }

    pub fn new_session(&self, shell_override: Option<String>) -> Arc<FakeSession> {
        self.spawn_session(SessionOptions {
            shell_path: shell_override,
            ..SessionOptions::default()
        })
    }

    fn spawn_session(&self, options: SessionOptions) -> Arc<FakeSession> {
        let session = Arc::new(FakeSession {
            id: SessionId::new(),
            name: options.name.unwrap_or_else(|| "fake".to_string()),
            shell_path: options.shell_path.or_else(|| self.behavior.shell_path.clone()),
            working_directory: options.working_directory,
            extra_env: options.extra_env,
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            channel: StdMutex::new(None),
            raw_text: StdMutex::new(Vec::new()),
            log: Arc::new(StdMutex::new(Vec::new())),
            events: self.events.clone(),
            end_delay: self.behavior.end_delay,
        });
        self.sessions.lock().unwrap().push(session.clone());
        if self.behavior.open_on_create {
            session.open(self.behavior.channel_at_open);
        }
        session
    }
}

#[async_trait]
impl SessionProvider for FakeProvider {
    async fn create_session(&self, options: SessionOptions) -> Result<Arc<dyn Session>, SessionError> {
        let session: Arc<dyn Session> = self.spawn_session(options);
        Ok(session)
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}

#[derive(Debug)]
pub(crate) struct FakeSession {
    id: SessionId,
    name: String,
    shell_path: Option<String>,
    pub working_directory: Option<PathBuf>,
    pub extra_env: HashMap<String, String>,
    open: AtomicBool,
    closed: AtomicBool,
    channel: StdMutex<Option<Arc<FakeChannel>>>,
    raw_text: StdMutex<Vec<String>>,
    log: Arc<StdMutex<Vec<String>>>,
    events: broadcast::Sender<SessionEvent>,
    end_delay: Duration,
}

impl FakeSession {
    fn install_channel(&self) {
        let mut channel = self.channel.lock().unwrap();
        if channel.is_none() {
            *channel = Some(Arc::new(FakeChannel {
                session_id: self.id.clone(),
                events: self.events.clone(),
                log: self.log.clone(),
                end_delay: self.end_delay,
            }));
        }
    }

    pub fn open(&self, with_channel: bool) {
        if with_channel {
            self.install_channel();
        }
        self.open.store(true, Ordering::SeqCst);
        let _ = self.events.send(SessionEvent::Opened {
            session_id: self.id.clone(),
        });
    }

    pub fn enable_channel(&self) {
        self.install_channel();
        let _ = self.events.send(SessionEvent::StructuredChannelAvailable {
            session_id: self.id.clone(),
        });
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.events.send(SessionEvent::Closed {
            session_id: self.id.clone(),
        });
    }

    pub fn report_environment(&self, variables: &[(&str, &str)]) {
        let _ = self.events.send(SessionEvent::EnvironmentReported {
            session_id: self.id.clone(),
            variables: variables
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        });
    }

    pub fn raw_lines(&self) -> Vec<String> {
        self.raw_text.lock().unwrap().clone()
    }

    /// Ordered `start:<exe>` / `end:<exe>` entries from the structured channel.
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn executed(&self) -> Vec<String> {
        self.log()
            .into_iter()
            .filter_map(|entry| entry.strip_prefix("start:").map(str::to_string))
            .collect()
    }
}

impl Session for FakeSession {
    fn id(&self) -> &SessionId {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn shell_path(&self) -> Option<&str> {
        self.shell_path.as_deref()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn structured_channel(&self) -> Option<Arc<dyn StructuredChannel>> {
        self.channel
            .lock()
            .unwrap()
            .clone()
            .map(|channel| channel as Arc<dyn StructuredChannel>)
    }

    fn send_raw_text(&self, line: &str) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed(self.id.clone()));
        }
        self.raw_text.lock().unwrap().push(line.to_string());
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) struct FakeChannel {
    session_id: SessionId,
    events: broadcast::Sender<SessionEvent>,
    log: Arc<StdMutex<Vec<String>>>,
    end_delay: Duration,
}

#[async_trait]
impl StructuredChannel for FakeChannel {
    async fn execute(&self, command: &ActivationCommand) -> Result<CommandExecution, SessionError> {
        let execution_id = ExecutionId::new();
        self.log
            .lock()
            .unwrap()
            .push(format!("start:{}", command.executable));
        let _ = self.events.send(SessionEvent::CommandStarted {
            session_id: self.session_id.clone(),
            execution_id: execution_id.clone(),
        });

        let events = self.events.clone();
        let log = self.log.clone();
        let session_id = self.session_id.clone();
        let ended = execution_id.clone();
        let executable = command.executable.clone();
        let delay = self.end_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // A user command finishing in between must not be mistaken for ours
            let _ = events.send(SessionEvent::CommandEnded {
                session_id: session_id.clone(),
                execution_id: ExecutionId::new(),
                exit_code: Some(0),
            });
            log.lock().unwrap().push(format!("end:{executable}"));
            let _ = events.send(SessionEvent::CommandEnded {
                session_id,
                execution_id: ended,
                exit_code: Some(0),
            });
        });

        Ok(CommandExecution { id: execution_id })
    }
}

/// Polls `check` until it holds or roughly a second has passed.
pub(crate) async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
