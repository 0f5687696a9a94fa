use crate::activation::machine::{ActivationMachine, ActivationPath, ActivationTimings};
use crate::activation::registry::{ActivationChange, ActivationRegistry, DEFAULT_MARKER_VARS};
use crate::activation::resolver;
use crate::environment::{ActivationCommand, EnvironmentId, Project, PythonEnvironment};
use crate::error::{ActivationError, CoordinatorError};
use crate::shell::{ShellDetector, ShellKind, ShellPathDetector};
use crate::terminal::cache::{cache_key, CacheKind, SessionReuseCache};
use crate::terminal::events::{SessionEventBus, DEFAULT_BUS_CAPACITY};
use crate::terminal::{Session, SessionId, SessionOptions, SessionProvider};
use crate::utils::path_utils::{resolve_path, working_directory_for};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info, instrument, warn};

/// Receives activation failures of sessions created on the caller's behalf,
/// once per failure.
pub trait ActivationReporter: Send + Sync {
    fn activation_failed(&self, session: &dyn Session, environment: &PythonEnvironment, error: &ActivationError);
}

/// Reports failures as log warnings.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl ActivationReporter for LogReporter {
    fn activation_failed(&self, session: &dyn Session, environment: &PythonEnvironment, error: &ActivationError) {
        warn!(
            session = %session.id(),
            environment = %environment.display_name,
            %error,
            "Terminal was not activated; it remains usable without the environment"
        );
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub timings: ActivationTimings,
    pub bus_capacity: usize,
    pub marker_vars: Vec<String>,
    /// Shell for new sessions; `None` lets the provider choose.
    pub default_shell: Option<String>,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            timings: ActivationTimings::default(),
            bus_capacity: DEFAULT_BUS_CAPACITY,
            marker_vars: DEFAULT_MARKER_VARS.iter().map(|s| s.to_string()).collect(),
            default_shell: None,
        }
    }
}

/// Creates sessions for environments, activates them, and reuses them per
/// location.
pub struct TerminalActivationCoordinator {
    provider: Arc<dyn SessionProvider>,
    bus: SessionEventBus,
    registry: ActivationRegistry,
    cache: SessionReuseCache,
    detector: Arc<dyn ShellDetector>,
    reporter: Arc<dyn ActivationReporter>,
    settings: CoordinatorSettings,
    // At most one live attempt per session; the Notify supersedes it.
    attempts: StdMutex<HashMap<SessionId, Arc<Notify>>>,
}

impl TerminalActivationCoordinator {
    /// Must be called inside a tokio runtime.
    pub fn new(provider: Arc<dyn SessionProvider>, settings: CoordinatorSettings) -> Self {
        let bus = SessionEventBus::new(settings.bus_capacity);
        bus.bridge(provider.subscribe());
        let registry = ActivationRegistry::new(&bus, settings.marker_vars.clone());
        let cache = SessionReuseCache::new(&bus);

        Self {
            provider,
            bus,
            registry,
            cache,
            detector: Arc::new(ShellPathDetector),
            reporter: Arc::new(LogReporter),
            settings,
            attempts: StdMutex::new(HashMap::new()),
        }
    }

    pub fn with_detector(mut self, detector: Arc<dyn ShellDetector>) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ActivationReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn bus(&self) -> &SessionEventBus {
        &self.bus
    }

    /// Creates a session and, if the environment is activatable, activates
    /// it. Activation failure does not fail the call: it goes to the
    /// reporter and the unactivated session is returned.
    #[instrument(skip(self, environment, extra_env), fields(environment = %environment.id))]
    pub async fn create_session_for(
        &self,
        environment: &PythonEnvironment,
        working_directory: Option<&Path>,
        extra_env: HashMap<String, String>,
    ) -> Result<Arc<dyn Session>, CoordinatorError> {
        let options = SessionOptions {
            name: Some(environment.display_name.clone()),
            icon_hint: Some("python".to_string()),
            working_directory: working_directory.map(Path::to_path_buf),
            extra_env,
            shell_path: self.settings.default_shell.clone(),
        };
        let session = self.provider.create_session(options).await?;
        info!(session = %session.id(), "Created terminal session");

        if environment.is_activatable {
            match self.activate(&session, environment).await {
                Ok(_) => {}
                Err(error) if error.is_not_applicable() => {
                    info!(session = %session.id(), %error, "Session left unactivated");
                }
                Err(error @ ActivationError::Superseded(_)) => {
                    debug!(session = %session.id(), %error, "Activation handed over to a newer attempt");
                }
                Err(error) => self
                    .reporter
                    .activation_failed(session.as_ref(), environment, &error),
            }
        }
        Ok(session)
    }

    /// Reuses the session for this file or folder, creating one on a miss.
    pub async fn get_or_create_dedicated_session(
        &self,
        location: &Path,
        environment: &PythonEnvironment,
        create_new: bool,
    ) -> Result<Arc<dyn Session>, CoordinatorError> {
        let key = cache_key(&environment.id, location);
        let working_directory = working_directory_for(location);
        self.cache
            .get_or_create(CacheKind::Dedicated, &key, create_new, || {
                self.create_session_for(environment, Some(&working_directory), HashMap::new())
            })
            .await
    }

    /// Reuses the project's session for this environment, creating one on a
    /// miss.
    pub async fn get_or_create_project_session(
        &self,
        project: &Project,
        environment: &PythonEnvironment,
        create_new: bool,
    ) -> Result<Arc<dyn Session>, CoordinatorError> {
        let key = cache_key(&environment.id, &project.root);
        let working_directory = resolve_path(&project.root);
        self.cache
            .get_or_create(CacheKind::Project, &key, create_new, || {
                self.create_session_for(environment, Some(&working_directory), HashMap::new())
            })
            .await
    }

    /// Activates `environment` in an existing session and records it.
    #[instrument(skip(self, session, environment), fields(session = %session.id(), environment = %environment.id))]
    pub async fn activate(
        &self,
        session: &Arc<dyn Session>,
        environment: &PythonEnvironment,
    ) -> Result<ActivationPath, ActivationError> {
        let shell = self.detector.detect(session.as_ref());
        let commands = resolver::activation_plan(environment, shell, session.id())?.to_vec();

        let path = self
            .drive(session, environment.id.clone(), shell, commands)
            .await?;
        if session.is_closed() {
            debug!("Session closed right after activation; not recording it");
        } else {
            self.registry.record_activation(session.id(), environment);
        }
        Ok(path)
    }

    /// Runs the active environment's deactivation commands. A session with
    /// nothing active is left alone.
    #[instrument(skip(self, session), fields(session = %session.id()))]
    pub async fn deactivate(&self, session: &Arc<dyn Session>) -> Result<(), ActivationError> {
        let Some(environment) = self.registry.environment_of(session.id()) else {
            debug!("No environment recorded for session");
            return Ok(());
        };
        if !self.registry.is_activated(session.id()) {
            debug!("Session is not activated");
            return Ok(());
        }

        let shell = self.detector.detect(session.as_ref());
        let commands = resolver::deactivation_plan(&environment, shell, session.id())?.to_vec();
        self.drive(session, environment.id.clone(), shell, commands)
            .await?;
        self.registry.record_deactivation(session.id());
        Ok(())
    }

    async fn drive(
        &self,
        session: &Arc<dyn Session>,
        environment: EnvironmentId,
        shell: ShellKind,
        commands: Vec<ActivationCommand>,
    ) -> Result<ActivationPath, ActivationError> {
        let superseded = Arc::new(Notify::new());
        {
            let mut attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(previous) = attempts.insert(session.id().clone(), superseded.clone()) {
                debug!(session = %session.id(), "Superseding running activation attempt");
                previous.notify_one();
            }
        }

        let machine = ActivationMachine::new(session.clone(), environment, shell, commands, self.settings.timings);
        let outcome = machine.run(&self.bus, &superseded).await;

        let mut attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
        if attempts
            .get(session.id())
            .is_some_and(|current| Arc::ptr_eq(current, &superseded))
        {
            attempts.remove(session.id());
        }
        outcome
    }

    pub fn on_activation_state_changed(&self) -> broadcast::Receiver<ActivationChange> {
        self.registry.subscribe()
    }

    pub fn is_activated(&self, session_id: &SessionId) -> bool {
        self.registry.is_activated(session_id)
    }

    pub fn environment_of(&self, session_id: &SessionId) -> Option<PythonEnvironment> {
        self.registry.environment_of(session_id)
    }

    /// Cancels running attempts and stops every background listener.
    pub fn dispose(&self) {
        let attempts: Vec<_> = self
            .attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (_, superseded) in attempts {
            superseded.notify_one();
        }
        self.registry.dispose();
        self.cache.dispose();
        self.bus.dispose();
        info!("Terminal activation coordinator disposed");
    }
}
