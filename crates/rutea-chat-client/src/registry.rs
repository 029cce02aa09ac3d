//! In-flight request tracking.
//!
//! Every fetch, stream and subscription the session starts is registered
//! here so it can be cancelled as a group (tab hidden too long, teardown,
//! stale sweep). Each entry's cleanup runs exactly once, whichever of
//! completion, cancellation, timeout or handle drop happens first.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{config::RegistryConfig, lock};

pub type Cleanup = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Fetch,
    Stream,
    Subscription,
}

impl RequestKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Stream => "stream",
            Self::Subscription => "subscription",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Explicit,
    TimedOut,
    /// Another request registered under the same id.
    Replaced,
    /// Fetches are dropped when the app pauses.
    Paused,
    Stale,
    Shutdown,
}

#[derive(Default)]
pub struct RequestOptions {
    id: Option<String>,
    timeout: Option<Duration>,
    cleanup: Option<Cleanup>,
    parent: Option<CancellationToken>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registering an id that is already active cancels the earlier request.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn on_cleanup(mut self, cleanup: impl FnOnce() + Send + 'static) -> Self {
        self.cleanup = Some(Box::new(cleanup));
        self
    }

    /// Cancelling `parent` also cancels the registered request.
    #[must_use]
    pub fn child_of(mut self, parent: &CancellationToken) -> Self {
        self.parent = Some(parent.clone());
        self
    }
}

struct Entry {
    seq: u64,
    kind: RequestKind,
    token: CancellationToken,
    started_at: Instant,
    cleanup: Option<Cleanup>,
    watcher: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<String, Entry>,
    paused: HashSet<String>,
    next_seq: u64,
}

#[derive(Clone)]
pub struct RequestRegistry {
    state: Arc<Mutex<RegistryState>>,
    config: RegistryConfig,
}

impl fmt::Debug for RequestRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("RequestRegistry")
            .field("active", &state.entries.len())
            .field("paused", &state.paused.len())
            .finish_non_exhaustive()
    }
}

impl Default for RequestRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl RequestRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(RegistryState::default())),
            config,
        }
    }

    pub fn register(&self, kind: RequestKind, options: RequestOptions) -> RequestHandle {
        let RequestOptions {
            id,
            timeout,
            cleanup,
            parent,
        } = options;
        let id = id.unwrap_or_else(|| format!("{kind}_{}", Uuid::now_v7().simple()));
        let token = parent.map_or_else(CancellationToken::new, |parent| parent.child_token());

        let (seq, replaced) = {
            let mut state = lock(&self.state);
            state.next_seq += 1;
            let seq = state.next_seq;
            state.paused.remove(&id);
            let replaced = state.entries.insert(
                id.clone(),
                Entry {
                    seq,
                    kind,
                    token: token.clone(),
                    started_at: Instant::now(),
                    cleanup,
                    watcher: None,
                },
            );
            (seq, replaced)
        };
        if let Some(replaced) = replaced {
            debug!(request_id = %id, "replacing active request");
            release(replaced, Some(CancelReason::Replaced));
        }

        if let Some(timeout) = timeout {
            let watcher = tokio::spawn(watch_timeout(
                Arc::downgrade(&self.state),
                id.clone(),
                seq,
                token.clone(),
                timeout,
            ));
            let mut state = lock(&self.state);
            match state.entries.get_mut(&id) {
                Some(entry) if entry.seq == seq => entry.watcher = Some(watcher),
                _ => watcher.abort(),
            }
        }

        debug!(request_id = %id, %kind, "registered request");
        RequestHandle {
            id,
            seq,
            kind,
            token,
            state: Arc::downgrade(&self.state),
        }
    }

    pub fn cancel(&self, id: &str, reason: CancelReason) -> bool {
        match take_entry(&self.state, id, None) {
            Some(entry) => {
                debug!(request_id = %id, ?reason, "cancelled request");
                release(entry, Some(reason));
                true
            }
            None => false,
        }
    }

    /// Cancels every request, or every request of `kind`.
    pub fn cancel_all(&self, kind: Option<RequestKind>, reason: CancelReason) -> usize {
        let removed: Vec<(String, Entry)> = {
            let mut state = lock(&self.state);
            let ids: Vec<String> = state
                .entries
                .iter()
                .filter(|(_, entry)| kind.is_none_or(|kind| entry.kind == kind))
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| {
                    state.paused.remove(&id);
                    state.entries.remove(&id).map(|entry| (id, entry))
                })
                .collect()
        };

        let count = removed.len();
        for (id, entry) in removed {
            debug!(request_id = %id, ?reason, "cancelled request");
            release(entry, Some(reason));
        }
        count
    }

    /// Marks active streams as paused. They keep their connection.
    pub fn pause_streams(&self) -> usize {
        let mut state = lock(&self.state);
        let ids: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.kind == RequestKind::Stream)
            .map(|(id, _)| id.clone())
            .collect();
        let count = ids.len();
        state.paused.extend(ids);
        count
    }

    pub fn resume_streams(&self) -> usize {
        let mut state = lock(&self.state);
        let count = state.paused.len();
        state.paused.clear();
        count
    }

    pub fn is_active(&self, id: &str) -> bool {
        lock(&self.state).entries.contains_key(id)
    }

    pub fn is_paused(&self, id: &str) -> bool {
        lock(&self.state).paused.contains(id)
    }

    pub fn active_requests(&self, kind: Option<RequestKind>) -> Vec<String> {
        let state = lock(&self.state);
        let mut ids: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| kind.is_none_or(|kind| entry.kind == kind))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn request_age(&self, id: &str) -> Option<Duration> {
        lock(&self.state)
            .entries
            .get(id)
            .map(|entry| entry.started_at.elapsed())
    }

    pub fn len(&self) -> usize {
        lock(&self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancels fetches and streams older than `max_age`. Subscriptions are
    /// long-lived and are never swept.
    pub fn sweep_stale(&self, max_age: Duration) -> usize {
        let stale: Vec<String> = {
            let state = lock(&self.state);
            state
                .entries
                .iter()
                .filter(|(_, entry)| {
                    entry.kind != RequestKind::Subscription && entry.started_at.elapsed() > max_age
                })
                .map(|(id, _)| id.clone())
                .collect()
        };

        let mut swept = 0;
        for id in stale {
            if let Some(entry) = take_entry(&self.state, &id, None) {
                warn!(
                    request_id = %id,
                    age_ms = entry.started_at.elapsed().as_millis() as u64,
                    "reaping stale request"
                );
                release(entry, Some(CancelReason::Stale));
                swept += 1;
            }
        }
        swept
    }

    /// Sweeps stale requests on the configured interval until the guard drops.
    pub fn spawn_reaper(&self) -> ReaperGuard {
        let state = Arc::downgrade(&self.state);
        let config = self.config.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.sweep_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(state) = state.upgrade() else {
                    break;
                };
                let registry = RequestRegistry {
                    state,
                    config: config.clone(),
                };
                registry.sweep_stale(config.stale_after);
            }
        });
        ReaperGuard { task }
    }
}

/// Owner's view of one registered request. Dropping it completes the
/// request normally.
#[derive(Debug)]
pub struct RequestHandle {
    id: String,
    seq: u64,
    kind: RequestKind,
    token: CancellationToken,
    state: Weak<Mutex<RegistryState>>,
}

impl RequestHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancels the request. Repeated calls are no-ops.
    pub fn abort(&self, reason: CancelReason) -> bool {
        self.token.cancel();
        match self.take() {
            Some(entry) => {
                debug!(request_id = %self.id, ?reason, "aborted request");
                release(entry, Some(reason));
                true
            }
            None => false,
        }
    }

    /// Unregisters the request without cancelling it.
    pub fn finish(&self) -> bool {
        match self.take() {
            Some(entry) => {
                release(entry, None);
                true
            }
            None => false,
        }
    }

    fn take(&self) -> Option<Entry> {
        let state = self.state.upgrade()?;
        take_entry(&state, &self.id, Some(self.seq))
    }
}

impl Drop for RequestHandle {
    fn drop(&mut self) {
        self.finish();
    }
}

#[derive(Debug)]
pub struct ReaperGuard {
    task: JoinHandle<()>,
}

impl Drop for ReaperGuard {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn watch_timeout(
    state: Weak<Mutex<RegistryState>>,
    id: String,
    seq: u64,
    token: CancellationToken,
    timeout: Duration,
) {
    tokio::select! {
        () = token.cancelled() => {}
        () = tokio::time::sleep(timeout) => {
            let Some(state) = state.upgrade() else {
                return;
            };
            if let Some(mut entry) = take_entry(&state, &id, Some(seq)) {
                warn!(request_id = %id, timeout_ms = timeout.as_millis() as u64, "request timed out");
                // Detach our own handle rather than aborting it.
                entry.watcher = None;
                release(entry, Some(CancelReason::TimedOut));
            }
        }
    }
}

fn take_entry(state: &Mutex<RegistryState>, id: &str, seq: Option<u64>) -> Option<Entry> {
    let mut state = lock(state);
    if let Some(seq) = seq
        && state.entries.get(id).is_none_or(|entry| entry.seq != seq)
    {
        return None;
    }
    state.paused.remove(id);
    state.entries.remove(id)
}

fn release(mut entry: Entry, reason: Option<CancelReason>) {
    if reason.is_some() {
        entry.token.cancel();
    }
    if let Some(watcher) = entry.watcher.take() {
        watcher.abort();
    }
    if let Some(cleanup) = entry.cleanup.take() {
        cleanup();
    }
}
