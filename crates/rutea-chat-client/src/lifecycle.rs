//! Visibility and lifecycle coordination.
//!
//! Raw visibility signals are debounced, then drive a small state machine:
//!
//! ```text
//! active --hidden--> hidden --grace elapsed--> paused --visible--> resuming --settled--> active
//!                      |                                                        ^
//!                      +-----------------------visible--------------------------+ (direct)
//! ```
//!
//! Pausing cancels in-flight fetches and marks streams paused in the
//! [`RequestRegistry`]. Resuming re-runs the registered resubscribe callbacks
//! after a short settle delay. Returning to the foreground also refreshes the
//! signed-in user, at most once per configured interval.

use std::{
    collections::BTreeMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
    time::{Instant, sleep_until},
};
use tracing::{debug, warn};

use crate::{
    config::LifecycleConfig,
    lock,
    registry::{CancelReason, RequestKind, RequestRegistry},
    store::IdentityProvider,
};

const TRANSITION_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Active,
    Hidden,
    Paused,
    Resuming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleTransition {
    pub from: LifecycleState,
    pub to: LifecycleState,
}

/// Observers of lifecycle edges. Calls happen on the coordinator task and
/// must not block.
pub trait LifecycleHooks: Send + Sync {
    fn on_tab_hide(&self) {}
    fn on_tab_show(&self) {}
    fn on_pause(&self) {}
    fn on_resume(&self) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl LifecycleHooks for NoopHooks {}

pub type ResubscribeCallback = Arc<dyn Fn() + Send + Sync>;
pub type CleanupCallback = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(u64);

#[derive(Default)]
struct Callbacks {
    next_id: AtomicU64,
    resubscribe: Mutex<BTreeMap<u64, ResubscribeCallback>>,
    cleanup: Mutex<Vec<CleanupCallback>>,
}

impl Callbacks {
    fn run_resubscribe(&self) -> usize {
        let callbacks: Vec<ResubscribeCallback> =
            lock(&self.resubscribe).values().cloned().collect();
        for callback in &callbacks {
            callback();
        }
        callbacks.len()
    }

    fn run_cleanup(&self) {
        let callbacks = std::mem::take(&mut *lock(&self.cleanup));
        for callback in callbacks {
            callback();
        }
    }
}

enum Command {
    Visibility(Visibility),
    Pause,
    Resume,
    Resubscribe,
    Shutdown,
}

pub struct LifecycleCoordinator {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<LifecycleState>,
    transitions: broadcast::Sender<LifecycleTransition>,
    callbacks: Arc<Callbacks>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for LifecycleCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleCoordinator")
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl LifecycleCoordinator {
    /// Starts the coordinator task. The app is assumed visible and active.
    pub fn spawn(
        config: LifecycleConfig,
        registry: RequestRegistry,
        hooks: Arc<dyn LifecycleHooks>,
        identity: Option<Arc<dyn IdentityProvider>>,
    ) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(LifecycleState::Active);
        let (transitions, _) = broadcast::channel(TRANSITION_CAPACITY);
        let callbacks = Arc::new(Callbacks::default());

        let driver = Driver {
            config,
            registry,
            hooks,
            identity,
            callbacks: Arc::clone(&callbacks),
            state_tx,
            transitions: transitions.clone(),
            state: LifecycleState::Active,
            visibility: Visibility::Visible,
            pending_visibility: None,
            grace_deadline: None,
            resume_deadline: None,
            last_auth_resync: None,
            auth_in_flight: false,
        };
        let task = tokio::spawn(driver.run(receiver));

        Self {
            commands,
            state,
            transitions,
            callbacks,
            task: Mutex::new(Some(task)),
        }
    }

    /// Feeds a raw visibility signal. Signals are debounced.
    pub fn visibility_changed(&self, visibility: Visibility) {
        self.send(Command::Visibility(visibility));
    }

    pub fn pause(&self) {
        self.send(Command::Pause);
    }

    pub fn resume(&self) {
        self.send(Command::Resume);
    }

    /// Runs every resubscribe callback now.
    pub fn resubscribe(&self) {
        self.send(Command::Resubscribe);
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<LifecycleState> {
        self.state.clone()
    }

    pub fn subscribe_transitions(&self) -> broadcast::Receiver<LifecycleTransition> {
        self.transitions.subscribe()
    }

    pub fn register_resubscribe(&self, callback: impl Fn() + Send + Sync + 'static) -> CallbackId {
        let id = self.callbacks.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.callbacks.resubscribe).insert(id, Arc::new(callback));
        CallbackId(id)
    }

    pub fn unregister_resubscribe(&self, id: CallbackId) -> bool {
        lock(&self.callbacks.resubscribe).remove(&id.0).is_some()
    }

    /// Runs once when the coordinator shuts down.
    pub fn register_cleanup(&self, callback: impl FnOnce() + Send + 'static) {
        lock(&self.callbacks.cleanup).push(Box::new(callback));
    }

    /// Stops the coordinator and runs cleanup callbacks.
    pub async fn shutdown(&self) {
        self.send(Command::Shutdown);
        let task = lock(&self.task).take();
        if let Some(task) = task
            && let Err(error) = task.await
        {
            warn!(%error, "lifecycle task ended abnormally");
            self.callbacks.run_cleanup();
        }
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("lifecycle coordinator already stopped");
        }
    }
}

impl Drop for LifecycleCoordinator {
    fn drop(&mut self) {
        if lock(&self.task).is_some() {
            self.send(Command::Shutdown);
        }
    }
}

struct Driver {
    config: LifecycleConfig,
    registry: RequestRegistry,
    hooks: Arc<dyn LifecycleHooks>,
    identity: Option<Arc<dyn IdentityProvider>>,
    callbacks: Arc<Callbacks>,
    state_tx: watch::Sender<LifecycleState>,
    transitions: broadcast::Sender<LifecycleTransition>,
    state: LifecycleState,
    /// Last debounced visibility.
    visibility: Visibility,
    pending_visibility: Option<(Instant, Visibility)>,
    grace_deadline: Option<Instant>,
    resume_deadline: Option<Instant>,
    last_auth_resync: Option<Instant>,
    auth_in_flight: bool,
}

type AuthResult = Result<Instant, String>;

impl Driver {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let (auth_tx, mut auth_rx) = mpsc::unbounded_channel::<AuthResult>();

        loop {
            let debounce_deadline = self.pending_visibility.map(|(deadline, _)| deadline);
            tokio::select! {
                command = commands.recv() => match command {
                    None | Some(Command::Shutdown) => break,
                    Some(Command::Visibility(visibility)) => {
                        self.pending_visibility =
                            Some((Instant::now() + self.config.debounce, visibility));
                    }
                    Some(Command::Pause) => self.enter_paused(),
                    Some(Command::Resume) => self.begin_resume(),
                    Some(Command::Resubscribe) => {
                        let count = self.callbacks.run_resubscribe();
                        debug!(count, "ran resubscribe callbacks");
                    }
                },
                Some(result) = auth_rx.recv() => self.finish_auth_resync(result),
                () = sleep_until_opt(debounce_deadline) => {
                    if let Some((_, visibility)) = self.pending_visibility.take() {
                        self.apply_visibility(visibility, &auth_tx);
                    }
                }
                () = sleep_until_opt(self.grace_deadline) => {
                    self.grace_deadline = None;
                    debug!("pause grace period elapsed");
                    self.enter_paused();
                }
                () = sleep_until_opt(self.resume_deadline) => {
                    self.resume_deadline = None;
                    self.complete_resume(&auth_tx);
                }
            }
        }

        self.callbacks.run_cleanup();
        debug!("lifecycle coordinator stopped");
    }

    fn apply_visibility(&mut self, visibility: Visibility, auth_tx: &mpsc::UnboundedSender<AuthResult>) {
        self.visibility = visibility;
        match (visibility, self.state) {
            (Visibility::Hidden, LifecycleState::Active) => {
                self.transition(LifecycleState::Hidden);
                self.grace_deadline = Some(Instant::now() + self.config.pause_grace);
                self.hooks.on_tab_hide();
            }
            (Visibility::Visible, LifecycleState::Hidden) => {
                self.grace_deadline = None;
                self.transition(LifecycleState::Active);
                self.hooks.on_tab_show();
                self.maybe_resync_auth(auth_tx);
            }
            (Visibility::Visible, LifecycleState::Paused) => {
                self.hooks.on_tab_show();
                self.maybe_resync_auth(auth_tx);
                if self.config.auto_resubscribe {
                    self.begin_resume();
                }
            }
            // Resuming picks up a hidden tab once it settles.
            _ => {}
        }
    }

    fn enter_paused(&mut self) {
        if self.state == LifecycleState::Paused {
            return;
        }
        self.grace_deadline = None;
        self.resume_deadline = None;
        self.transition(LifecycleState::Paused);

        let cancelled = self
            .registry
            .cancel_all(Some(RequestKind::Fetch), CancelReason::Paused);
        let paused = self.registry.pause_streams();
        debug!(cancelled, paused, "paused in-flight requests");
        self.hooks.on_pause();
    }

    fn begin_resume(&mut self) {
        if self.state != LifecycleState::Paused {
            return;
        }
        self.transition(LifecycleState::Resuming);
        self.registry.resume_streams();
        self.resume_deadline = Some(Instant::now() + self.config.resubscribe_delay);
    }

    fn complete_resume(&mut self, auth_tx: &mpsc::UnboundedSender<AuthResult>) {
        if self.state != LifecycleState::Resuming {
            return;
        }
        if self.config.auto_resubscribe {
            let count = self.callbacks.run_resubscribe();
            debug!(count, "ran resubscribe callbacks");
        }
        self.hooks.on_resume();
        self.transition(LifecycleState::Active);

        if self.visibility == Visibility::Hidden {
            self.apply_visibility(Visibility::Hidden, auth_tx);
        }
    }

    fn maybe_resync_auth(&mut self, auth_tx: &mpsc::UnboundedSender<AuthResult>) {
        if !self.config.auth_resync || self.auth_in_flight {
            return;
        }
        let Some(identity) = self.identity.clone() else {
            return;
        };
        if let Some(last) = self.last_auth_resync
            && last.elapsed() < self.config.auth_resync_min_interval
        {
            debug!("skipping auth resync, refreshed recently");
            return;
        }

        self.auth_in_flight = true;
        let auth_tx = auth_tx.clone();
        tokio::spawn(async move {
            let result = identity
                .refresh_user()
                .await
                .map(|()| Instant::now())
                .map_err(|error| error.to_string());
            let _ = auth_tx.send(result);
        });
    }

    fn finish_auth_resync(&mut self, result: AuthResult) {
        self.auth_in_flight = false;
        match result {
            Ok(at) => {
                self.last_auth_resync = Some(at);
                debug!("auth resynced");
            }
            Err(error) => warn!(%error, "auth resync failed"),
        }
    }

    fn transition(&mut self, to: LifecycleState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        self.state_tx.send_replace(to);
        let _ = self.transitions.send(LifecycleTransition { from, to });
        debug!(?from, ?to, "lifecycle transition");
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
