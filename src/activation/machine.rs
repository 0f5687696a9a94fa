//! The per-attempt activation state machine.
//!
//! One [`ActivationMachine`] drives one session through
//! `Idle → AwaitingSignal → (Polling) → UsingStructuredChannel | UsingFallback → Complete`,
//! or into `Failed` when the session closes or a newer attempt supersedes it.
//! Transitions live in [`ActivationState::on_signal`]; the async driver only
//! turns bus events and timer ticks into [`Signal`]s. Everything the driver
//! acquires (bus subscription, poll timer) is owned by `run` and dropped on
//! every exit path.

use crate::environment::{ActivationCommand, EnvironmentId};
use crate::error::{ActivationError, SessionError};
use crate::shell::{format_command_line, ShellKind};
use crate::terminal::events::{Lagged, SessionEventBus, SessionSubscription};
use crate::terminal::{Session, SessionEvent, SessionId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{Instant, Sleep};
use tracing::{debug, info, instrument, trace, warn};

pub const DEFAULT_CHANNEL_TIMEOUT: Duration = Duration::from_millis(500);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long to wait for a structured channel before degrading to raw text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivationTimings {
    pub channel_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for ActivationTimings {
    fn default() -> Self {
        Self {
            channel_timeout: DEFAULT_CHANNEL_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl ActivationTimings {
    fn next_step(&self, waited: Duration) -> Duration {
        self.poll_interval
            .min(self.channel_timeout.saturating_sub(waited))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationPath {
    StructuredChannel,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivationState {
    Idle,
    AwaitingSignal,
    /// Opened without a structured channel; the poll timer is armed.
    Polling { waited: Duration },
    UsingStructuredChannel,
    UsingFallback,
    Complete(ActivationPath),
    Failed(ActivationError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Start,
    Opened { channel_available: bool },
    ChannelAvailable,
    PollTick { channel_available: bool, waited: Duration },
    Finished,
    ChannelError(String),
    Closed,
    Superseded,
}

impl ActivationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ActivationState::Complete(_) | ActivationState::Failed(_))
    }

    /// The next state for `signal`, or `None` when the signal does not apply
    /// in this state. Terminal states accept nothing, and once a delivery path
    /// is chosen a second channel signal is ignored.
    pub fn on_signal(
        &self,
        signal: &Signal,
        session_id: &SessionId,
        timings: &ActivationTimings,
    ) -> Option<ActivationState> {
        use ActivationState::*;

        if self.is_terminal() {
            return None;
        }
        match (self, signal) {
            (_, Signal::Closed) => Some(Failed(ActivationError::SessionClosedDuringActivation(
                session_id.clone(),
            ))),
            (_, Signal::Superseded) => Some(Failed(ActivationError::Superseded(session_id.clone()))),
            (Idle, Signal::Start) => Some(AwaitingSignal),
            (AwaitingSignal, Signal::Opened { channel_available: true }) => Some(UsingStructuredChannel),
            (AwaitingSignal, Signal::Opened { channel_available: false }) => Some(Polling {
                waited: Duration::ZERO,
            }),
            (AwaitingSignal | Polling { .. }, Signal::ChannelAvailable) => Some(UsingStructuredChannel),
            (Polling { .. }, Signal::PollTick { channel_available: true, .. }) => {
                Some(UsingStructuredChannel)
            }
            (Polling { .. }, Signal::PollTick { waited, .. }) if *waited >= timings.channel_timeout => {
                Some(UsingFallback)
            }
            (Polling { .. }, Signal::PollTick { waited, .. }) => Some(Polling { waited: *waited }),
            (UsingStructuredChannel, Signal::Finished) => Some(Complete(ActivationPath::StructuredChannel)),
            (UsingFallback, Signal::Finished) => Some(Complete(ActivationPath::Fallback)),
            (UsingStructuredChannel | UsingFallback, Signal::ChannelError(message)) => {
                Some(Failed(ActivationError::Channel(message.clone())))
            }
            _ => None,
        }
    }
}

/// Bookkeeping for one attempt, kept for logging and inspection.
#[derive(Debug, Clone, Serialize)]
pub struct ActivationContext {
    pub session_id: SessionId,
    pub environment: EnvironmentId,
    pub started_at: DateTime<Utc>,
    pub structured_channel_used: bool,
}

pub struct ActivationMachine {
    session: Arc<dyn Session>,
    shell: ShellKind,
    commands: Vec<ActivationCommand>,
    timings: ActivationTimings,
    state: ActivationState,
    context: ActivationContext,
}

impl ActivationMachine {
    pub fn new(
        session: Arc<dyn Session>,
        environment: EnvironmentId,
        shell: ShellKind,
        commands: Vec<ActivationCommand>,
        timings: ActivationTimings,
    ) -> Self {
        let context = ActivationContext {
            session_id: session.id().clone(),
            environment,
            started_at: Utc::now(),
            structured_channel_used: false,
        };
        Self {
            session,
            shell,
            commands,
            timings,
            state: ActivationState::Idle,
            context,
        }
    }

    pub fn state(&self) -> &ActivationState {
        &self.state
    }

    pub fn context(&self) -> &ActivationContext {
        &self.context
    }

    fn apply(&mut self, signal: Signal) {
        match self
            .state
            .on_signal(&signal, &self.context.session_id, &self.timings)
        {
            Some(next) => {
                debug!(from = ?self.state, to = ?next, ?signal, "Activation transition");
                self.state = next;
            }
            None => trace!(?signal, state = ?self.state, "Signal ignored"),
        }
    }

    fn channel_available(&self) -> bool {
        self.session.structured_channel().is_some()
    }

    /// Runs the attempt to completion. Consumes the machine; a retry needs a
    /// new one.
    #[instrument(skip_all, fields(session = %self.context.session_id, environment = %self.context.environment, shell = %self.shell))]
    pub async fn run(
        mut self,
        bus: &SessionEventBus,
        superseded: &Notify,
    ) -> Result<ActivationPath, ActivationError> {
        let mut events = bus.subscribe_session(self.context.session_id.clone());
        self.apply(Signal::Start);

        // Sampled after subscribing: anything that changes from here on is
        // also seen as an event, and duplicates are ignored by the transitions.
        if self.session.is_closed() {
            self.apply(Signal::Closed);
        } else if self.session.is_open() {
            let channel_available = self.channel_available();
            self.apply(Signal::Opened { channel_available });
        }

        let mut poll: Option<PollTimer> = None;
        loop {
            match &self.state {
                ActivationState::Complete(path) => {
                    let path = *path;
                    info!(
                        ?path,
                        commands = self.commands.len(),
                        structured_channel_used = self.context.structured_channel_used,
                        elapsed_ms = (Utc::now() - self.context.started_at).num_milliseconds(),
                        "Activation complete"
                    );
                    return Ok(path);
                }
                ActivationState::Failed(error) => {
                    let error = error.clone();
                    warn!(%error, "Activation failed");
                    return Err(error);
                }
                ActivationState::UsingStructuredChannel => {
                    poll = None;
                    let signal = self.execute_structured(&mut events, superseded).await;
                    self.apply(signal);
                    continue;
                }
                ActivationState::UsingFallback => {
                    poll = None;
                    debug!(timeout_ms = self.timings.channel_timeout.as_millis() as u64, "No structured channel; sending raw text");
                    let signal = self.send_fallback();
                    self.apply(signal);
                    continue;
                }
                ActivationState::Polling { .. } => {
                    if poll.is_none() {
                        poll = Some(PollTimer::arm(&self.timings));
                    }
                }
                ActivationState::Idle | ActivationState::AwaitingSignal => {}
            }

            let signal = tokio::select! {
                _ = superseded.notified() => Signal::Superseded,
                event = events.recv_checked() => match event {
                    Some(Ok(SessionEvent::Opened { .. })) => Signal::Opened {
                        channel_available: self.channel_available(),
                    },
                    Some(Ok(SessionEvent::StructuredChannelAvailable { .. })) => Signal::ChannelAvailable,
                    Some(Ok(SessionEvent::Closed { .. })) | None => Signal::Closed,
                    Some(Ok(_)) => continue,
                    Some(Err(Lagged(skipped))) => match self.resample(skipped) {
                        Some(signal) => signal,
                        None => continue,
                    },
                },
                waited = next_tick(&mut poll) => Signal::PollTick {
                    channel_available: self.channel_available(),
                    waited,
                },
            };
            self.apply(signal);

            if let (ActivationState::Polling { .. }, Some(timer)) = (&self.state, poll.as_mut()) {
                timer.rearm(&self.timings);
            }
        }
    }

    /// Issues each command on the structured channel and waits for the
    /// `CommandEnded` carrying its own execution id before the next one.
    async fn execute_structured(
        &mut self,
        events: &mut SessionSubscription,
        superseded: &Notify,
    ) -> Signal {
        let Some(channel) = self.session.structured_channel() else {
            return Signal::ChannelError("structured channel is no longer available".to_string());
        };
        self.context.structured_channel_used = true;

        for (index, command) in self.commands.iter().enumerate() {
            let execution = match channel.execute(command).await {
                Ok(execution) => execution,
                Err(SessionError::Closed(_)) => return Signal::Closed,
                Err(e) => return Signal::ChannelError(e.to_string()),
            };
            debug!(index, execution = %execution.id, executable = %command.executable, "Issued activation command");

            loop {
                tokio::select! {
                    _ = superseded.notified() => return Signal::Superseded,
                    event = events.recv_checked() => match event {
                        Some(Ok(SessionEvent::CommandEnded { execution_id, exit_code, .. }))
                            if execution_id == execution.id =>
                        {
                            debug!(index, ?exit_code, "Activation command ended");
                            break;
                        }
                        Some(Ok(SessionEvent::Closed { .. })) | None => return Signal::Closed,
                        Some(Ok(_)) => {}
                        Some(Err(Lagged(skipped))) => {
                            if self.session.is_closed() {
                                return Signal::Closed;
                            }
                            // Our end signal may be among the dropped events
                            warn!(skipped, index, "Lost track of activation command completion");
                            return Signal::ChannelError(format!(
                                "missed {skipped} session events while waiting for command {index} to end"
                            ));
                        }
                    },
                }
            }
        }
        Signal::Finished
    }

    /// Rebuilds the signal a lagged subscription may have dropped from the
    /// session's current state.
    fn resample(&self, skipped: u64) -> Option<Signal> {
        warn!(skipped, "Activation fell behind session events; resampling session state");
        if self.session.is_closed() {
            Some(Signal::Closed)
        } else if self.session.is_open() && self.channel_available() {
            Some(Signal::ChannelAvailable)
        } else if self.session.is_open() {
            Some(Signal::Opened { channel_available: false })
        } else {
            None
        }
    }

    /// Raw text has no completion confirmation; lines go out back to back.
    fn send_fallback(&mut self) -> Signal {
        for command in &self.commands {
            let line = format_command_line(self.shell, command);
            match self.session.send_raw_text(&line) {
                Ok(()) => debug!(%line, "Sent activation line"),
                Err(SessionError::Closed(_)) => return Signal::Closed,
                Err(e) => return Signal::ChannelError(e.to_string()),
            }
        }
        Signal::Finished
    }
}

struct PollTimer {
    armed_at: Instant,
    sleep: Pin<Box<Sleep>>,
}

impl PollTimer {
    fn arm(timings: &ActivationTimings) -> Self {
        let armed_at = Instant::now();
        Self {
            armed_at,
            sleep: Box::pin(tokio::time::sleep_until(
                armed_at + timings.next_step(Duration::ZERO),
            )),
        }
    }

    fn rearm(&mut self, timings: &ActivationTimings) {
        let waited = self.armed_at.elapsed();
        self.sleep
            .as_mut()
            .reset(Instant::now() + timings.next_step(waited));
    }
}

async fn next_tick(poll: &mut Option<PollTimer>) -> Duration {
    match poll {
        Some(timer) => {
            timer.sleep.as_mut().await;
            timer.armed_at.elapsed()
        }
        None => std::future::pending().await,
    }
}
