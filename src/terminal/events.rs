use super::{SessionEvent, SessionId};
use std::sync::{Mutex as StdMutex, PoisonError};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

pub const DEFAULT_BUS_CAPACITY: usize = 256;

/// Re-publishes provider signals so consumers never hold the provider's own
/// receivers. Every consumer gets an independent subscription.
#[derive(Debug)]
pub struct SessionEventBus {
    sender: broadcast::Sender<SessionEvent>,
    bridges: StdMutex<Vec<JoinHandle<()>>>,
}

impl SessionEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            bridges: StdMutex::new(Vec::new()),
        }
    }

    pub fn publish(&self, event: SessionEvent) {
        trace!(?event, "Publishing session event");
        // No subscribers is not an error
        let _ = self.sender.send(event);
    }

    /// Forwards every event from `upstream` onto this bus until the upstream
    /// closes or the bus is disposed.
    pub fn bridge(&self, mut upstream: broadcast::Receiver<SessionEvent>) {
        let sender = self.sender.clone();
        let handle = tokio::spawn(async move {
            loop {
                match upstream.recv().await {
                    Ok(event) => {
                        let _ = sender.send(event);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Session event bridge lagged behind provider");
                    }
                    Err(RecvError::Closed) => {
                        debug!("Session provider stream closed; bridge stopping");
                        break;
                    }
                }
            }
        });
        self.bridges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    pub fn subscribe(&self) -> SessionSubscription {
        SessionSubscription {
            receiver: self.sender.subscribe(),
            session: None,
        }
    }

    /// Subscription that only yields events for one session.
    pub fn subscribe_session(&self, session_id: SessionId) -> SessionSubscription {
        SessionSubscription {
            receiver: self.sender.subscribe(),
            session: Some(session_id),
        }
    }

    pub fn dispose(&self) {
        let mut bridges = self.bridges.lock().unwrap_or_else(PoisonError::into_inner);
        for handle in bridges.drain(..) {
            handle.abort();
        }
    }
}

impl Default for SessionEventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

impl Drop for SessionEventBus {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Dropping the subscription releases it.
#[derive(Debug)]
pub struct SessionSubscription {
    receiver: broadcast::Receiver<SessionEvent>,
    session: Option<SessionId>,
}

/// Events were dropped because the subscriber fell behind the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lagged(pub u64);

impl SessionSubscription {
    /// Next matching event, or `None` once the bus is gone. Lag is logged
    /// and skipped; use [`recv_checked`](Self::recv_checked) when a missed
    /// event matters.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        loop {
            match self.recv_checked().await? {
                Ok(event) => return Some(event),
                Err(Lagged(skipped)) => {
                    warn!(skipped, session = ?self.session, "Session event subscriber lagged");
                }
            }
        }
    }

    /// Like [`recv`](Self::recv), but surfaces lag to the caller. Any event,
    /// including one for the filtered session, may have been among those
    /// dropped.
    pub async fn recv_checked(&mut self) -> Option<Result<SessionEvent, Lagged>> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if self
                        .session
                        .as_ref()
                        .map_or(true, |wanted| event.session_id() == wanted)
                    {
                        return Some(Ok(event));
                    }
                }
                Err(RecvError::Lagged(skipped)) => return Some(Err(Lagged(skipped))),
                Err(RecvError::Closed) => return None,
            }
        }
    }
}
