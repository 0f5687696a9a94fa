use crate::environment::PythonEnvironment;
use crate::terminal::events::SessionEventBus;
use crate::terminal::{SessionEvent, SessionId};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock as StdRwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Variables whose presence in a shell's reported environment means an
/// environment is active in it.
pub const DEFAULT_MARKER_VARS: &[&str] = &["VIRTUAL_ENV", "CONDA_PREFIX"];

const CHANGE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivationChange {
    pub session_id: SessionId,
    pub environment: PythonEnvironment,
    pub activated: bool,
}

#[derive(Debug, Clone)]
struct RegistryEntry {
    environment: PythonEnvironment,
    activated: bool,
}

#[derive(Debug, Default)]
struct Entries {
    by_session: HashMap<SessionId, RegistryEntry>,
    // Sessions that reported closed; late recordings for them are dropped
    closed: HashSet<SessionId>,
}

#[derive(Debug)]
struct RegistryState {
    entries: StdRwLock<Entries>,
    changes: broadcast::Sender<ActivationChange>,
    marker_vars: Vec<String>,
}

impl RegistryState {
    fn set(&self, session_id: &SessionId, environment: Option<&PythonEnvironment>, activated: bool) {
        let change = {
            let mut guard = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            let entries = &mut *guard;
            if entries.closed.contains(session_id) {
                debug!(session = %session_id, "Ignoring activation state of closed session");
                return;
            }
            match (entries.by_session.get_mut(session_id), environment) {
                (Some(entry), Some(env)) => {
                    if entry.activated == activated && entry.environment == *env {
                        None
                    } else {
                        entry.environment = env.clone();
                        entry.activated = activated;
                        Some(entry.clone())
                    }
                }
                (Some(entry), None) => {
                    if entry.activated == activated {
                        None
                    } else {
                        entry.activated = activated;
                        Some(entry.clone())
                    }
                }
                (None, Some(env)) => {
                    let entry = RegistryEntry {
                        environment: env.clone(),
                        activated,
                    };
                    entries.by_session.insert(session_id.clone(), entry.clone());
                    Some(entry)
                }
                // Nothing known about this session
                (None, None) => None,
            }
        };

        if let Some(entry) = change {
            debug!(session = %session_id, environment = %entry.environment.id, activated, "Activation state changed");
            let _ = self.changes.send(ActivationChange {
                session_id: session_id.clone(),
                environment: entry.environment,
                activated: entry.activated,
            });
        }
    }

    fn handle_event(&self, event: &SessionEvent) {
        match event {
            SessionEvent::Closed { session_id } => {
                let removed = {
                    let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
                    entries.closed.insert(session_id.clone());
                    entries.by_session.remove(session_id)
                };
                if removed.is_some() {
                    debug!(session = %session_id, "Dropped activation state of closed session");
                }
            }
            SessionEvent::EnvironmentReported { session_id, variables } => {
                let active = self.marker_vars.iter().any(|name| {
                    variables
                        .get(name)
                        .is_some_and(|value| !value.trim().is_empty())
                });
                self.set(session_id, None, active);
            }
            _ => {}
        }
    }
}

/// Which sessions have which environment active. Drift caused by the user
/// running `deactivate` by hand is corrected when the shell next reports its
/// environment.
#[derive(Debug)]
pub struct ActivationRegistry {
    state: Arc<RegistryState>,
    listener: StdMutex<Option<JoinHandle<()>>>,
}

impl ActivationRegistry {
    /// Must be called inside a tokio runtime: a listener task follows `bus`
    /// until [`dispose`](Self::dispose).
    pub fn new(bus: &SessionEventBus, marker_vars: Vec<String>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let state = Arc::new(RegistryState {
            entries: StdRwLock::new(Entries::default()),
            changes,
            marker_vars,
        });

        let mut events = bus.subscribe();
        let listener_state = state.clone();
        let listener = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                listener_state.handle_event(&event);
            }
        });

        Self {
            state,
            listener: StdMutex::new(Some(listener)),
        }
    }

    pub fn record_activation(&self, session_id: &SessionId, environment: &PythonEnvironment) {
        self.state.set(session_id, Some(environment), true);
    }

    pub fn record_deactivation(&self, session_id: &SessionId) {
        self.state.set(session_id, None, false);
    }

    pub fn is_activated(&self, session_id: &SessionId) -> bool {
        self.state
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_session
            .get(session_id)
            .is_some_and(|entry| entry.activated)
    }

    pub fn environment_of(&self, session_id: &SessionId) -> Option<PythonEnvironment> {
        self.state
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_session
            .get(session_id)
            .map(|entry| entry.environment.clone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ActivationChange> {
        self.state.changes.subscribe()
    }

    /// Applies one session signal synchronously.
    pub fn handle_event(&self, event: &SessionEvent) {
        self.state.handle_event(event);
    }

    pub fn dispose(&self) {
        if let Some(listener) = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            listener.abort();
            info!("Activation registry disposed");
        }
    }
}

impl Drop for ActivationRegistry {
    fn drop(&mut self) {
        self.dispose();
    }
}
