use super::events::SessionEventBus;
use super::{Session, SessionEvent, SessionId};
use crate::environment::EnvironmentId;
use crate::utils::path_utils::normalize_location;
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKind {
    /// Sessions dedicated to one file or folder.
    Dedicated,
    /// One shared session per project root.
    Project,
}

/// `${environmentId}:${normalizedLocationPath}`
pub fn cache_key(environment: &EnvironmentId, location: &Path) -> String {
    format!("{}:{}", environment, normalize_location(location))
}

type SlotKey = (CacheKind, String);

#[derive(Debug, Default)]
struct CacheState {
    entries: StdMutex<HashMap<SlotKey, Arc<dyn Session>>>,
    // Creation guard per key; unrelated keys never wait on each other
    creating: StdMutex<HashMap<SlotKey, Arc<TokioMutex<()>>>>,
}

impl CacheState {
    fn creation_lock(&self, slot: &SlotKey) -> Arc<TokioMutex<()>> {
        self.creating
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(slot.clone())
            .or_default()
            .clone()
    }

    fn release_creation_lock(&self, slot: &SlotKey, lock: Arc<TokioMutex<()>>) {
        let mut creating = self.creating.lock().unwrap_or_else(PoisonError::into_inner);
        // The map's copy plus ours: nobody else is waiting on this key
        if Arc::strong_count(&lock) <= 2 {
            creating.remove(slot);
        }
    }

    fn live(&self, slot: &SlotKey) -> Option<Arc<dyn Session>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(slot) {
            Some(existing) if !existing.is_closed() => Some(existing.clone()),
            Some(_) => {
                // Closed but its close signal has not been processed yet
                entries.remove(slot);
                None
            }
            None => None,
        }
    }

    fn evict(&self, session_id: &SessionId) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|(kind, key), session| {
            let keep = session.id() != session_id;
            if !keep {
                debug!(session = %session_id, ?kind, %key, "Evicted closed session from reuse cache");
            }
            keep
        });
    }
}

/// Hands back an existing session for an (environment, location) key
/// instead of creating a new one. Entries leave the cache only when their
/// session closes.
#[derive(Debug)]
pub struct SessionReuseCache {
    state: Arc<CacheState>,
    listener: StdMutex<Option<JoinHandle<()>>>,
}

impl SessionReuseCache {
    /// Must be called inside a tokio runtime: a listener task evicts
    /// sessions as `bus` reports them closed.
    pub fn new(bus: &SessionEventBus) -> Self {
        let state = Arc::new(CacheState::default());
        let mut events = bus.subscribe();
        let listener_state = state.clone();
        let listener = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let SessionEvent::Closed { session_id } = event {
                    listener_state.evict(&session_id);
                }
            }
        });

        Self {
            state,
            listener: StdMutex::new(Some(listener)),
        }
    }

    /// Returns the live session cached under `key`, or stores and returns
    /// the one `factory` creates. `create_new` skips the lookup but still
    /// stores the result. Calls for the same kind and key are serialised, so
    /// a key never ends up with two live sessions; other keys proceed
    /// concurrently.
    pub async fn get_or_create<F, Fut, E>(
        &self,
        kind: CacheKind,
        key: &str,
        create_new: bool,
        factory: F,
    ) -> Result<Arc<dyn Session>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<dyn Session>, E>>,
    {
        let slot = (kind, key.to_string());
        let lock = self.state.creation_lock(&slot);
        let result = {
            let _creating = lock.lock().await;
            self.create_locked(&slot, create_new, factory).await
        };
        self.state.release_creation_lock(&slot, lock);
        result
    }

    async fn create_locked<F, Fut, E>(
        &self,
        slot: &SlotKey,
        create_new: bool,
        factory: F,
    ) -> Result<Arc<dyn Session>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<dyn Session>, E>>,
    {
        let (kind, key) = slot;
        if !create_new {
            if let Some(existing) = self.state.live(slot) {
                debug!(%key, ?kind, session = %existing.id(), "Reusing cached session");
                return Ok(existing);
            }
        }

        let session = factory().await?;
        debug!(%key, ?kind, session = %session.id(), "Caching new session");
        self.state
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(slot.clone(), session.clone());
        Ok(session)
    }

    pub fn get(&self, kind: CacheKind, key: &str) -> Option<Arc<dyn Session>> {
        self.state
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(kind, key.to_string()))
            .cloned()
    }

    pub fn len(&self, kind: CacheKind) -> usize {
        self.state
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .filter(|(entry_kind, _)| *entry_kind == kind)
            .count()
    }

    pub fn dispose(&self) {
        if let Some(listener) = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            listener.abort();
            info!("Session reuse cache disposed");
        }
    }
}

impl Drop for SessionReuseCache {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionError;
    use crate::terminal::fake::{FakeBehavior, FakeProvider};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn setup() -> (Arc<FakeProvider>, SessionEventBus) {
        let provider = FakeProvider::new(FakeBehavior::default());
        let bus = SessionEventBus::new(64);
        bus.bridge(provider.events());
        (provider, bus)
    }

    async fn create(
        provider: &FakeProvider,
        calls: &AtomicUsize,
    ) -> Result<Arc<dyn Session>, SessionError> {
        calls.fetch_add(1, Ordering::SeqCst);
        let session: Arc<dyn Session> = provider.new_session(None);
        Ok(session)
    }

    #[tokio::test]
    async fn same_key_invokes_factory_once() {
        let (provider, bus) = setup();
        let cache = SessionReuseCache::new(&bus);
        let calls = AtomicUsize::new(0);

        let first = cache
            .get_or_create(CacheKind::Dedicated, "venv:venv-A:/proj/file.py", false, || create(&provider, &calls))
            .await
            .unwrap();
        let second = cache
            .get_or_create(CacheKind::Dedicated, "venv:venv-A:/proj/file.py", false, || create(&provider, &calls))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first, &second));
    }

    async fn slow_create(
        provider: &FakeProvider,
        calls: &AtomicUsize,
    ) -> Result<Arc<dyn Session>, SessionError> {
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        create(provider, calls).await
    }

    #[tokio::test(start_paused = true)]
    async fn unrelated_keys_are_created_concurrently() {
        let (provider, bus) = setup();
        let cache = SessionReuseCache::new(&bus);
        let calls = AtomicUsize::new(0);
        let started = tokio::time::Instant::now();

        let (a, b) = tokio::join!(
            cache.get_or_create(CacheKind::Dedicated, "venv:venv-A:/proj/a.py", false, || slow_create(&provider, &calls)),
            cache.get_or_create(CacheKind::Dedicated, "venv:venv-A:/other/b.py", false, || slow_create(&provider, &calls)),
        );

        assert!(!Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(started.elapsed() < std::time::Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_calls_for_one_key_share_a_session() {
        let (provider, bus) = setup();
        let cache = SessionReuseCache::new(&bus);
        let calls = AtomicUsize::new(0);

        let (a, b) = tokio::join!(
            cache.get_or_create(CacheKind::Project, "k", false, || slow_create(&provider, &calls)),
            cache.get_or_create(CacheKind::Project, "k", false, || slow_create(&provider, &calls)),
        );

        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn kinds_have_independent_key_spaces() {
        let (provider, bus) = setup();
        let cache = SessionReuseCache::new(&bus);
        let calls = AtomicUsize::new(0);

        let dedicated = cache
            .get_or_create(CacheKind::Dedicated, "k", false, || create(&provider, &calls))
            .await
            .unwrap();
        let project = cache
            .get_or_create(CacheKind::Project, "k", false, || create(&provider, &calls))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!Arc::ptr_eq(&dedicated, &project));
    }

    #[tokio::test]
    async fn closing_a_session_evicts_its_entry() {
        let (provider, bus) = setup();
        let cache = SessionReuseCache::new(&bus);
        let calls = AtomicUsize::new(0);

        cache
            .get_or_create(CacheKind::Project, "k", false, || create(&provider, &calls))
            .await
            .unwrap();
        provider.last().unwrap().close();

        let mut evicted = false;
        for _ in 0..100 {
            if cache.get(CacheKind::Project, "k").is_none() {
                evicted = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(evicted);

        cache
            .get_or_create(CacheKind::Project, "k", false, || create(&provider, &calls))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn closed_entry_is_never_handed_out() {
        let (provider, bus) = setup();
        let cache = SessionReuseCache::new(&bus);
        cache.dispose();
        let calls = AtomicUsize::new(0);

        let first = cache
            .get_or_create(CacheKind::Dedicated, "k", false, || create(&provider, &calls))
            .await
            .unwrap();
        provider.last().unwrap().close();
        let second = cache
            .get_or_create(CacheKind::Dedicated, "k", false, || create(&provider, &calls))
            .await
            .unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!second.is_closed());
    }

    #[tokio::test]
    async fn create_new_bypasses_lookup_but_overwrites_entry() {
        let (provider, bus) = setup();
        let cache = SessionReuseCache::new(&bus);
        let calls = AtomicUsize::new(0);

        let first = cache
            .get_or_create(CacheKind::Dedicated, "k", false, || create(&provider, &calls))
            .await
            .unwrap();
        let fresh = cache
            .get_or_create(CacheKind::Dedicated, "k", true, || create(&provider, &calls))
            .await
            .unwrap();
        let reused = cache
            .get_or_create(CacheKind::Dedicated, "k", false, || create(&provider, &calls))
            .await
            .unwrap();

        assert!(!Arc::ptr_eq(&first, &fresh));
        assert!(Arc::ptr_eq(&fresh, &reused));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn factory_errors_propagate_and_store_nothing() {
        let (_provider, bus) = setup();
        let cache = SessionReuseCache::new(&bus);

        let result = cache
            .get_or_create(CacheKind::Dedicated, "k", false, || async {
                Err::<Arc<dyn Session>, _>(SessionError::SpawnError("no shell".to_string()))
            })
            .await;

        assert!(matches!(result, Err(SessionError::SpawnError(_))));
        assert_eq!(cache.len(CacheKind::Dedicated), 0);
    }

    #[test]
    fn key_combines_environment_and_location() {
        let key = cache_key(&EnvironmentId::new("venv", "venv-A"), Path::new("/proj/sub/../file.py"));
        if cfg!(unix) && !cfg!(target_os = "macos") {
            assert_eq!(key, "venv:venv-A:/proj/file.py");
        }
        assert!(key.starts_with("venv:venv-A:"));
    }
}
