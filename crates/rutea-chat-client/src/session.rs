//! One owner's chat session.
//!
//! A send appends the user's message optimistically, persists it, streams
//! the assistant reply into a placeholder, and settles the turn: summary
//! replies are forwarded to the [`SummarySink`] and hidden, prose replies are
//! kept and persisted. Every change is published as a [`SessionSnapshot`].

use std::{
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use rutea_chat_core::{
    ChatMessage, ChatRole, Extraction, MessageLog, NewMessage, TimeoutTicket, TurnId, UiState,
    UiStateContext, UiStateMachine, extract_summary,
};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    config::{SessionConfig, StreamConfig},
    error::{SessionError, StoreError, TransportError},
    lifecycle::LifecycleHooks,
    lock,
    registry::{CancelReason, RequestKind, RequestOptions, RequestRegistry},
    store::{MessageStore, SummarySink},
    transport::{CompletionEndpoint, StreamClient, StreamObserver, StreamStatus},
};

pub const CANCELLED_MESSAGE: &str = "Reply cancelled";

/// Collaborators a session talks to.
pub struct SessionDeps {
    pub endpoint: Arc<dyn CompletionEndpoint>,
    pub store: Arc<dyn MessageStore>,
    pub summaries: Arc<dyn SummarySink>,
    pub registry: RequestRegistry,
}

/// The reply stream currently attached to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSessionView {
    pub request_id: String,
    pub turn: TurnId,
    pub status: StreamStatus,
    pub retry_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub messages: Vec<ChatMessage>,
    pub ui: UiStateContext,
    pub stream: Option<StreamSessionView>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Reply { content: String },
    /// The reply carried a structured summary; it was forwarded and hidden.
    SummaryForwarded { persisted: bool },
    /// The stream produced no text.
    Empty,
    Cancelled { partial: Option<String> },
}

struct Shared {
    owner_id: String,
    config: SessionConfig,
    log: Mutex<MessageLog>,
    ui: Mutex<UiStateMachine>,
    stream_view: Mutex<Option<StreamSessionView>>,
    snapshots: watch::Sender<SessionSnapshot>,
    turn_in_flight: AtomicBool,
    realtime: Mutex<Option<JoinHandle<()>>>,
    stream: StreamClient,
    store: Arc<dyn MessageStore>,
    summaries: Arc<dyn SummarySink>,
    registry: RequestRegistry,
}

impl Shared {
    fn stream_request_id(&self) -> String {
        format!("stream:{}", self.owner_id)
    }

    fn snapshot(&self) -> SessionSnapshot {
        let messages = lock(&self.log).messages().to_vec();
        let ui = lock(&self.ui).context().clone();
        let mut stream = lock(&self.stream_view).clone();
        if let Some(view) = stream.as_mut()
            && view.status == StreamStatus::Open
            && self.registry.is_paused(&view.request_id)
        {
            view.status = StreamStatus::Paused;
        }
        SessionSnapshot {
            messages,
            ui,
            stream,
        }
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.snapshot());
    }

    /// Success is only reachable from `loading` or `streaming`.
    fn complete_ui(&self) {
        let mut ui = lock(&self.ui);
        if ui.state() == UiState::Paused {
            ui.resume();
        }
        ui.succeed();
        ui.reset();
    }

    fn fail_ui(&self, error: &str, can_retry: bool) {
        lock(&self.ui).fail(error, can_retry);
    }
}

struct TurnGuard<'a> {
    in_flight: &'a AtomicBool,
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.store(false, Ordering::Release);
    }
}

struct TurnObserver<'a> {
    shared: &'a Shared,
    turn: TurnId,
}

impl StreamObserver for TurnObserver<'_> {
    fn on_delta(&mut self, fragment: &str) {
        let applied = lock(&self.shared.log).apply_delta(self.turn, fragment);
        if !applied {
            return;
        }
        {
            // A paused UI stays paused until the lifecycle resumes it.
            let mut ui = lock(&self.shared.ui);
            if ui.state() == UiState::Loading {
                ui.start_streaming();
            }
        }
        self.shared.publish();
    }

    fn on_status(&mut self, status: StreamStatus) {
        if let Some(view) = lock(&self.shared.stream_view).as_mut() {
            view.status = status;
        }
        self.shared.publish();
    }

    fn on_retry(&mut self, retry: u32, _delay: Duration, cause: &TransportError) {
        debug!(turn = %self.turn, retry, %cause, "resetting partial reply before retry");
        lock(&self.shared.log).reset_turn(self.turn);
        if let Some(view) = lock(&self.shared.stream_view).as_mut() {
            view.retry_count = retry;
        }
        self.shared.publish();
    }
}

#[derive(Clone)]
pub struct ChatSession {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ChatSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatSession")
            .field("owner_id", &self.shared.owner_id)
            .finish_non_exhaustive()
    }
}

impl ChatSession {
    pub fn new(
        owner_id: impl Into<String>,
        config: SessionConfig,
        stream: StreamConfig,
        deps: SessionDeps,
    ) -> Self {
        let owner_id = owner_id.into();
        let log = MessageLog::new(owner_id.clone());
        let initial = SessionSnapshot {
            messages: Vec::new(),
            ui: UiStateContext::default(),
            stream: None,
        };
        let (snapshots, _) = watch::channel(initial);

        Self {
            shared: Arc::new(Shared {
                owner_id,
                config,
                log: Mutex::new(log),
                ui: Mutex::new(UiStateMachine::new()),
                stream_view: Mutex::new(None),
                snapshots,
                turn_in_flight: AtomicBool::new(false),
                realtime: Mutex::new(None),
                stream: StreamClient::new(deps.endpoint, stream),
                store: deps.store,
                summaries: deps.summaries,
                registry: deps.registry,
            }),
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.shared.owner_id
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.shared.snapshots.subscribe()
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        lock(&self.shared.log).messages().to_vec()
    }

    pub fn ui_state(&self) -> UiStateContext {
        lock(&self.shared.ui).context().clone()
    }

    /// Loads persisted history. An owner with no history gets the bootstrap
    /// prompt sent on their behalf.
    pub async fn load_history(&self) -> Result<Vec<ChatMessage>, SessionError> {
        let shared = &self.shared;
        let handle = shared.registry.register(
            RequestKind::Fetch,
            RequestOptions::new().with_id(format!("history:{}", shared.owner_id)),
        );

        let rows = tokio::select! {
            biased;
            () = handle.token().cancelled() => {
                return Err(SessionError::History(StoreError::Cancelled));
            }
            rows = shared.store.list_messages(&shared.owner_id) => rows.map_err(SessionError::History)?,
        };
        drop(handle);

        let empty = {
            let mut log = lock(&shared.log);
            log.hydrate(rows);
            log.is_empty()
        };
        shared.publish();

        if empty {
            info!(owner_id = %shared.owner_id, "no history, sending bootstrap prompt");
            let prompt = shared.config.bootstrap_prompt.clone();
            self.send_message(&prompt).await?;
        }
        Ok(self.messages())
    }

    /// Sends one user message and streams the reply.
    pub async fn send_message(&self, input: &str) -> Result<TurnOutcome, SessionError> {
        let content = input.trim();
        if content.is_empty() {
            return Err(SessionError::EmptyInput);
        }
        let _guard = self.begin_turn()?;
        let shared = &self.shared;

        let local_id = lock(&shared.log)
            .append_user_turn(content)
            .map_err(|_| SessionError::EmptyInput)?;
        shared.publish();

        let message = NewMessage {
            owner_id: shared.owner_id.clone(),
            role: ChatRole::User,
            content: content.to_string(),
        };
        match shared.store.insert_message(message).await {
            Ok(row) => {
                lock(&shared.log).confirm(local_id, &row);
            }
            Err(source) => {
                warn!(owner_id = %shared.owner_id, error = %source, "user message not persisted, rolling back");
                lock(&shared.log).rollback_user_turn(local_id);
                shared.publish();
                return Err(SessionError::UserTurnNotPersisted {
                    restored_input: content.to_string(),
                    source,
                });
            }
        }

        self.run_assistant_turn().await
    }

    /// Produces the last turn again after a retryable failure.
    pub async fn retry_last_turn(&self) -> Result<TurnOutcome, SessionError> {
        let _guard = self.begin_turn()?;
        let awaiting_reply = lock(&self.shared.log)
            .conversation_turns()
            .last()
            .is_some_and(|turn| turn.role == ChatRole::User);
        if !awaiting_reply || !lock(&self.shared.ui).retry() {
            return Err(SessionError::NothingToRetry);
        }
        lock(&self.shared.log).drop_failure_notice();
        self.shared.publish();
        self.run_assistant_turn().await
    }

    /// Cancels the reply stream, if one is open.
    pub fn cancel_stream(&self) -> bool {
        self.shared
            .registry
            .cancel(&self.shared.stream_request_id(), CancelReason::Explicit)
    }

    /// Follows the store's insert feed, merging rows written elsewhere.
    /// Calling it again replaces the previous subscription.
    pub async fn start_realtime_sync(&self) -> Result<(), SessionError> {
        let shared = &self.shared;
        let mut feed = shared
            .store
            .subscribe_inserts(&shared.owner_id)
            .await
            .map_err(SessionError::Realtime)?;
        let handle = shared.registry.register(
            RequestKind::Subscription,
            RequestOptions::new().with_id(format!("realtime:{}", shared.owner_id)),
        );
        let token = handle.token().clone();
        let weak = Arc::downgrade(shared);

        let task = tokio::spawn(async move {
            let _handle = handle;
            loop {
                let row = tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    row = feed.recv() => row,
                };
                let Some(row) = row else {
                    debug!("insert feed closed");
                    break;
                };
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                let outcome = lock(&shared.log).merge_remote_insert(row);
                debug!(?outcome, "merged remote insert");
                shared.publish();
            }
        });

        if let Some(previous) = lock(&shared.realtime).replace(task) {
            previous.abort();
        }
        Ok(())
    }

    pub fn stop_realtime_sync(&self) {
        if let Some(task) = lock(&self.shared.realtime).take() {
            task.abort();
        }
        self.shared.registry.cancel(
            &format!("realtime:{}", self.shared.owner_id),
            CancelReason::Explicit,
        );
    }

    /// Callback for [`LifecycleCoordinator::register_resubscribe`](crate::lifecycle::LifecycleCoordinator::register_resubscribe).
    pub fn resubscribe_callback(&self) -> impl Fn() + Send + Sync + 'static {
        let weak = Arc::downgrade(&self.shared);
        move || {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let session = ChatSession { shared };
            tokio::spawn(async move {
                if let Err(error) = session.start_realtime_sync().await {
                    warn!(%error, "realtime resubscribe failed");
                }
            });
        }
    }

    /// Hooks that mirror lifecycle pauses into the UI state.
    pub fn lifecycle_hooks(&self) -> Arc<dyn LifecycleHooks> {
        Arc::new(SessionHooks {
            shared: Arc::downgrade(&self.shared),
        })
    }

    /// Stops background work and returns the UI to idle.
    pub fn close(&self) {
        self.stop_realtime_sync();
        self.cancel_stream();
        lock(&self.shared.ui).force_reset();
        self.shared.publish();
    }

    fn begin_turn(&self) -> Result<TurnGuard<'_>, SessionError> {
        let in_flight = &self.shared.turn_in_flight;
        if in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SessionError::Busy);
        }
        Ok(TurnGuard { in_flight })
    }

    async fn run_assistant_turn(&self) -> Result<TurnOutcome, SessionError> {
        let shared = &self.shared;
        let turns = lock(&shared.log).conversation_turns();
        let ticket = {
            let mut ui = lock(&shared.ui);
            ui.start_loading();
            shared
                .config
                .loading_timeout
                .and_then(|timeout| ui.arm_timeout(timeout))
        };
        let turn = lock(&shared.log).begin_assistant_turn();

        let request_id = shared.stream_request_id();
        let handle = shared.registry.register(
            RequestKind::Stream,
            RequestOptions::new().with_id(request_id.clone()),
        );
        *lock(&shared.stream_view) = Some(StreamSessionView {
            request_id,
            turn,
            status: StreamStatus::Connecting,
            retry_count: 0,
        });
        shared.publish();
        if let Some(ticket) = ticket {
            spawn_loading_watchdog(shared, ticket);
        }

        let mut observer = TurnObserver { shared, turn };
        let result = shared
            .stream
            .open_stream(turns, handle.token(), &mut observer)
            .await;
        drop(handle);

        let outcome = match result {
            Ok(_) => Ok(self.settle_reply(turn).await),
            Err(TransportError::Cancelled) => Ok(self.settle_cancelled(turn).await),
            Err(error) => {
                warn!(owner_id = %shared.owner_id, %error, "reply failed");
                lock(&shared.log).fail_turn(turn, &shared.config.failure_notice);
                shared.fail_ui(&error.to_string(), true);
                Err(SessionError::Stream(error))
            }
        };

        *lock(&shared.stream_view) = None;
        shared.publish();
        outcome
    }

    async fn settle_reply(&self, turn: TurnId) -> TurnOutcome {
        let shared = &self.shared;
        let content = lock(&shared.log)
            .open_text(turn)
            .map(str::to_string)
            .unwrap_or_default();
        if content.trim().is_empty() {
            lock(&shared.log).discard_turn(turn);
            shared.complete_ui();
            return TurnOutcome::Empty;
        }

        let outcome = match extract_summary(&content) {
            Extraction::Summary(summary) => {
                lock(&shared.log).discard_turn(turn);
                shared.publish();
                let persisted = match shared
                    .summaries
                    .persist_summary(&shared.owner_id, &summary)
                    .await
                {
                    Ok(()) => {
                        info!(owner_id = %shared.owner_id, "summary forwarded");
                        true
                    }
                    Err(error) => {
                        warn!(owner_id = %shared.owner_id, %error, "summary forwarding failed");
                        false
                    }
                };
                TurnOutcome::SummaryForwarded { persisted }
            }
            Extraction::Prose => {
                self.persist_assistant_turn(turn).await;
                TurnOutcome::Reply { content }
            }
        };

        shared.complete_ui();
        outcome
    }

    async fn settle_cancelled(&self, turn: TurnId) -> TurnOutcome {
        let partial = lock(&self.shared.log).open_text(turn).map(str::to_string);
        let kept = self.persist_assistant_turn(turn).await;
        self.shared.fail_ui(CANCELLED_MESSAGE, true);
        TurnOutcome::Cancelled {
            partial: partial.filter(|_| kept),
        }
    }

    /// Freezes the placeholder and writes it to the store. Returns false when
    /// the turn was empty and has been removed.
    async fn persist_assistant_turn(&self, turn: TurnId) -> bool {
        let shared = &self.shared;
        let Some(finalized) = lock(&shared.log).finalize_turn(turn) else {
            shared.publish();
            return false;
        };
        shared.publish();

        let message = NewMessage {
            owner_id: shared.owner_id.clone(),
            role: ChatRole::Assistant,
            content: finalized.content,
        };
        match shared.store.insert_message(message).await {
            Ok(row) => {
                lock(&shared.log).confirm(finalized.local_id, &row);
                shared.publish();
            }
            Err(error) => {
                warn!(owner_id = %shared.owner_id, %error, "assistant reply not persisted");
            }
        }
        true
    }
}

fn spawn_loading_watchdog(shared: &Arc<Shared>, ticket: TimeoutTicket) {
    let weak: Weak<Shared> = Arc::downgrade(shared);
    tokio::spawn(async move {
        tokio::time::sleep(ticket.duration).await;
        let Some(shared) = weak.upgrade() else {
            return;
        };
        let expired = lock(&shared.ui).expire(ticket);
        if expired {
            warn!(owner_id = %shared.owner_id, "reply did not start before loading timeout");
            shared
                .registry
                .cancel(&shared.stream_request_id(), CancelReason::TimedOut);
            shared.publish();
        }
    });
}

struct SessionHooks {
    shared: Weak<Shared>,
}

impl LifecycleHooks for SessionHooks {
    fn on_pause(&self) {
        if let Some(shared) = self.shared.upgrade() {
            let paused = lock(&shared.ui).pause();
            if paused {
                shared.publish();
            }
        }
    }

    fn on_resume(&self) {
        if let Some(shared) = self.shared.upgrade() {
            let resumed = lock(&shared.ui).resume();
            if resumed {
                shared.publish();
            }
        }
    }
}
