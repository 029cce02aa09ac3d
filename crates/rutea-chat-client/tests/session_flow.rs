use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::stream;
use reqwest::StatusCode;
use rutea_chat_client::{
    ByteStream, ChatSession, CompletionEndpoint, InMemoryMessageStore, InMemorySummarySink,
    MessageStore, RequestRegistry, SessionConfig, SessionDeps, SessionError, SessionSnapshot,
    StoreError, StreamConfig, SummarySink, TransportError, TurnOutcome,
    config::{DEFAULT_BOOTSTRAP_PROMPT, DEFAULT_FAILURE_NOTICE},
};
use rutea_chat_core::{
    ChatRole, CompletionRequest, NewMessage, StoredMessage, SummaryPayload, UiState,
    ui_state::TIMED_OUT_MESSAGE,
};
use serde_json::json;
use tokio::sync::{mpsc, watch};

const OWNER: &str = "owner-1";

enum Script {
    Reply(Vec<String>),
    Fail(TransportError),
    Feed(mpsc::UnboundedReceiver<String>),
    Hang,
}

struct ScriptedEndpoint {
    script: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<CompletionRequest>>,
    calls: AtomicU32,
}

impl ScriptedEndpoint {
    fn new(script: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().expect("requests").clone()
    }
}

#[async_trait]
impl CompletionEndpoint for ScriptedEndpoint {
    async fn open(&self, request: &CompletionRequest) -> Result<ByteStream, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().expect("requests").push(request.clone());
        let next = self.script.lock().expect("script").pop_front();
        match next {
            Some(Script::Reply(frames)) => Ok(Box::pin(stream::iter(
                frames.into_iter().map(|frame| Ok(frame.into_bytes())),
            ))),
            Some(Script::Fail(error)) => Err(error),
            Some(Script::Feed(frames)) => Ok(Box::pin(stream::unfold(frames, |mut frames| async move {
                let frame = frames.recv().await?;
                Some((Ok(frame.into_bytes()), frames))
            }))),
            Some(Script::Hang) | None => {
                Ok(Box::pin(stream::pending::<Result<Vec<u8>, TransportError>>()))
            }
        }
    }
}

/// Message store whose inserts can be switched to fail.
struct FlakyStore {
    inner: InMemoryMessageStore,
    reject_inserts: AtomicBool,
}

#[async_trait]
impl MessageStore for FlakyStore {
    async fn list_messages(&self, owner_id: &str) -> Result<Vec<StoredMessage>, StoreError> {
        self.inner.list_messages(owner_id).await
    }

    async fn insert_message(&self, message: NewMessage) -> Result<StoredMessage, StoreError> {
        if self.reject_inserts.load(Ordering::SeqCst) {
            return Err(StoreError::Rejected {
                status: StatusCode::SERVICE_UNAVAILABLE,
                body: "<empty>".to_string(),
            });
        }
        self.inner.insert_message(message).await
    }

    async fn subscribe_inserts(
        &self,
        owner_id: &str,
    ) -> Result<mpsc::Receiver<StoredMessage>, StoreError> {
        self.inner.subscribe_inserts(owner_id).await
    }
}

struct RejectingSink;

#[async_trait]
impl SummarySink for RejectingSink {
    async fn persist_summary(
        &self,
        _owner_id: &str,
        _summary: &SummaryPayload,
    ) -> Result<(), StoreError> {
        Err(StoreError::Request("connection refused".to_string()))
    }
}

fn reply(fragments: &[&str]) -> Script {
    let mut frames: Vec<String> = fragments
        .iter()
        .map(|fragment| format!("data: {}\n\n", json!({ "content": fragment })))
        .collect();
    frames.push("data: [DONE]\n\n".to_string());
    Script::Reply(frames)
}

struct Harness {
    session: ChatSession,
    endpoint: Arc<ScriptedEndpoint>,
    store: Arc<FlakyStore>,
    sink: InMemorySummarySink,
}

fn harness_with(
    script: Vec<Script>,
    rows: Vec<StoredMessage>,
    config: SessionConfig,
    summaries: Option<Arc<dyn SummarySink>>,
) -> Harness {
    let endpoint = ScriptedEndpoint::new(script);
    let store = Arc::new(FlakyStore {
        inner: InMemoryMessageStore::with_rows(rows),
        reject_inserts: AtomicBool::new(false),
    });
    let sink = InMemorySummarySink::new();
    let summaries: Arc<dyn SummarySink> = match summaries {
        Some(summaries) => summaries,
        None => Arc::new(sink.clone()),
    };
    let session = ChatSession::new(
        OWNER,
        config,
        StreamConfig::default(),
        SessionDeps {
            endpoint: endpoint.clone(),
            store: store.clone(),
            summaries,
            registry: RequestRegistry::default(),
        },
    );
    Harness {
        session,
        endpoint,
        store,
        sink,
    }
}

fn harness(script: Vec<Script>) -> Harness {
    harness_with(script, Vec::new(), SessionConfig::default(), None)
}

fn contents(session: &ChatSession) -> Vec<(ChatRole, String)> {
    session
        .messages()
        .iter()
        .map(|message| (message.role(), message.content().to_string()))
        .collect()
}

async fn wait_for(
    updates: &mut watch::Receiver<SessionSnapshot>,
    ready: impl FnMut(&SessionSnapshot) -> bool,
) {
    tokio::time::timeout(Duration::from_secs(5), updates.wait_for(ready))
        .await
        .expect("snapshot in time")
        .expect("session alive");
}

fn stored(id: &str, owner_id: &str, role: ChatRole, content: &str, minute: u32) -> StoredMessage {
    StoredMessage {
        id: id.to_string(),
        owner_id: owner_id.to_string(),
        role,
        content: content.to_string(),
        created_at: Utc
            .with_ymd_and_hms(2026, 3, 1, 9, minute, 0)
            .single()
            .expect("timestamp"),
    }
}

#[tokio::test]
async fn empty_history_sends_bootstrap_prompt() {
    let h = harness(vec![reply(&["Bienvenido"])]);

    let messages = h.session.load_history().await.expect("history");

    assert_eq!(messages.len(), 2);
    assert_eq!(
        contents(&h.session),
        vec![
            (ChatRole::User, DEFAULT_BOOTSTRAP_PROMPT.to_string()),
            (ChatRole::Assistant, "Bienvenido".to_string()),
        ]
    );
    assert_eq!(h.store.inner.rows().len(), 2);
    assert_eq!(h.session.ui_state().state, UiState::Idle);
}

#[tokio::test]
async fn existing_history_is_hydrated_in_order() {
    let rows = vec![
        stored("m2", OWNER, ChatRole::Assistant, "Claro", 2),
        stored("m1", OWNER, ChatRole::User, "Hola", 1),
        stored("x1", "owner-2", ChatRole::User, "Otro", 0),
    ];
    let h = harness_with(Vec::new(), rows, SessionConfig::default(), None);

    h.session.load_history().await.expect("history");

    assert_eq!(
        contents(&h.session),
        vec![
            (ChatRole::User, "Hola".to_string()),
            (ChatRole::Assistant, "Claro".to_string()),
        ]
    );
    assert_eq!(h.endpoint.calls(), 0);
}

#[tokio::test]
async fn send_streams_reply_and_persists_both_turns() {
    let h = harness(vec![reply(&["Hola", ", empecemos"])]);

    let outcome = h.session.send_message("  ¿Por dónde empiezo?  ").await.expect("send");

    assert_eq!(
        outcome,
        TurnOutcome::Reply {
            content: "Hola, empecemos".to_string()
        }
    );
    assert_eq!(
        contents(&h.session),
        vec![
            (ChatRole::User, "¿Por dónde empiezo?".to_string()),
            (ChatRole::Assistant, "Hola, empecemos".to_string()),
        ]
    );
    let rows = h.store.inner.rows();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1].role, ChatRole::Assistant);
    assert!(
        h.session
            .messages()
            .iter()
            .all(|message| message.meta().remote_id.is_some())
    );

    let requests = h.endpoint.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].turns.len(), 1);
    assert_eq!(requests[0].turns[0].content, "¿Por dónde empiezo?");

    let snapshot = h.session.snapshot();
    assert_eq!(snapshot.ui.state, UiState::Idle);
    assert!(snapshot.stream.is_none());
}

#[tokio::test]
async fn blank_input_is_rejected_locally() {
    let h = harness(Vec::new());

    let error = h.session.send_message("   \n").await.expect_err("blank");

    assert!(matches!(error, SessionError::EmptyInput));
    assert!(h.session.messages().is_empty());
    assert_eq!(h.endpoint.calls(), 0);
}

#[tokio::test]
async fn second_send_while_streaming_is_busy_and_cancel_ends_turn() {
    let h = harness(vec![Script::Hang]);
    let mut updates = h.session.subscribe();

    let pending = tokio::spawn({
        let session = h.session.clone();
        async move { session.send_message("hola").await }
    });
    wait_for(&mut updates, |snapshot| snapshot.stream.is_some()).await;

    let error = h.session.send_message("otra").await.expect_err("busy");
    assert!(matches!(error, SessionError::Busy));

    assert!(h.session.cancel_stream());
    let outcome = pending.await.expect("join").expect("send");
    assert_eq!(outcome, TurnOutcome::Cancelled { partial: None });

    assert_eq!(
        contents(&h.session),
        vec![(ChatRole::User, "hola".to_string())]
    );
    let ui = h.session.ui_state();
    assert_eq!(ui.state, UiState::Error);
    assert!(ui.can_retry);
}

#[tokio::test]
async fn rejected_user_message_is_rolled_back() {
    let h = harness(vec![reply(&["nunca"])]);
    h.store.reject_inserts.store(true, Ordering::SeqCst);

    let error = h.session.send_message("hola").await.expect_err("rejected");

    match error {
        SessionError::UserTurnNotPersisted { restored_input, .. } => {
            assert_eq!(restored_input, "hola");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(h.session.messages().is_empty());
    assert_eq!(h.endpoint.calls(), 0);
    assert_eq!(h.session.ui_state().state, UiState::Idle);
}

#[tokio::test]
async fn stream_failure_shows_notice_and_retry_recovers() {
    let h = harness(vec![
        Script::Fail(TransportError::Rejected {
            status: StatusCode::BAD_GATEWAY,
            body: "upstream".to_string(),
        }),
        reply(&["Segundo intento"]),
    ]);

    let error = h.session.send_message("hola").await.expect_err("failed");
    assert!(matches!(
        error,
        SessionError::Stream(TransportError::Rejected { .. })
    ));
    let messages = h.session.messages();
    assert_eq!(messages.len(), 2);
    assert!(messages[1].is_failure_notice());
    assert_eq!(messages[1].content(), DEFAULT_FAILURE_NOTICE);
    let ui = h.session.ui_state();
    assert_eq!(ui.state, UiState::Error);
    assert!(ui.can_retry);

    let outcome = h.session.retry_last_turn().await.expect("retry");

    assert_eq!(
        outcome,
        TurnOutcome::Reply {
            content: "Segundo intento".to_string()
        }
    );
    assert_eq!(
        contents(&h.session),
        vec![
            (ChatRole::User, "hola".to_string()),
            (ChatRole::Assistant, "Segundo intento".to_string()),
        ]
    );
    assert_eq!(h.endpoint.calls(), 2);
    assert_eq!(h.session.ui_state().state, UiState::Idle);
}

#[tokio::test]
async fn retry_without_failure_is_rejected() {
    let h = harness(Vec::new());

    let error = h.session.retry_last_turn().await.expect_err("nothing");

    assert!(matches!(error, SessionError::NothingToRetry));
    assert_eq!(h.endpoint.calls(), 0);
}

#[tokio::test]
async fn summary_reply_is_forwarded_and_hidden() {
    let summary = json!({
        "resumen": {
            "proposito": "Acompañar equipos",
            "valores": ["honestidad", "aprendizaje"],
        }
    })
    .to_string();
    let (head, tail) = summary.split_at(20);
    let h = harness(vec![reply(&[head, tail])]);

    let outcome = h.session.send_message("terminé").await.expect("send");

    assert_eq!(outcome, TurnOutcome::SummaryForwarded { persisted: true });
    assert_eq!(
        contents(&h.session),
        vec![(ChatRole::User, "terminé".to_string())]
    );
    assert_eq!(
        h.sink.summary_for(OWNER),
        Some(json!({
            "proposito": "Acompañar equipos",
            "valores": ["honestidad", "aprendizaje"],
        }))
    );
    assert_eq!(h.store.inner.rows().len(), 1);
    assert_eq!(h.session.ui_state().state, UiState::Idle);
}

#[tokio::test]
async fn summary_forwarding_failure_is_swallowed() {
    let summary = json!({"resumen": {"proposito": "Liderar"}}).to_string();
    let h = harness_with(
        vec![reply(&[summary.as_str()])],
        Vec::new(),
        SessionConfig::default(),
        Some(Arc::new(RejectingSink)),
    );

    let outcome = h.session.send_message("listo").await.expect("send");

    assert_eq!(outcome, TurnOutcome::SummaryForwarded { persisted: false });
    assert_eq!(h.session.messages().len(), 1);
    assert_eq!(h.session.ui_state().state, UiState::Idle);
}

#[tokio::test]
async fn realtime_echoes_are_deduplicated() {
    let h = harness(vec![reply(&["Respuesta"])]);
    h.session.start_realtime_sync().await.expect("subscribe");
    let mut updates = h.session.subscribe();

    h.session.send_message("hola").await.expect("send");
    h.store.inner.insert_external(NewMessage {
        owner_id: OWNER.to_string(),
        role: ChatRole::Assistant,
        content: "Desde otra pestaña".to_string(),
    });
    wait_for(&mut updates, |snapshot| snapshot.messages.len() >= 3).await;

    assert_eq!(
        contents(&h.session),
        vec![
            (ChatRole::User, "hola".to_string()),
            (ChatRole::Assistant, "Respuesta".to_string()),
            (ChatRole::Assistant, "Desde otra pestaña".to_string()),
        ]
    );
    h.session.close();
}

#[tokio::test]
async fn lifecycle_hooks_pause_and_resume_the_ui() {
    let h = harness(vec![Script::Hang]);
    let hooks = h.session.lifecycle_hooks();
    let mut updates = h.session.subscribe();

    let pending = tokio::spawn({
        let session = h.session.clone();
        async move { session.send_message("hola").await }
    });
    wait_for(&mut updates, |snapshot| snapshot.stream.is_some()).await;

    hooks.on_pause();
    assert_eq!(h.session.ui_state().state, UiState::Paused);
    hooks.on_resume();
    assert_eq!(h.session.ui_state().state, UiState::Loading);

    h.session.cancel_stream();
    pending.await.expect("join").expect("send");
}

fn frame(fragment: &str) -> String {
    format!("data: {}\n\n", json!({ "content": fragment }))
}

fn last_content(snapshot: &SessionSnapshot) -> Option<&str> {
    snapshot.messages.last().map(|message| message.content())
}

#[tokio::test]
async fn deltas_while_paused_keep_the_ui_paused() {
    let (frames, feed) = mpsc::unbounded_channel();
    let h = harness(vec![Script::Feed(feed)]);
    let hooks = h.session.lifecycle_hooks();
    let mut updates = h.session.subscribe();

    let pending = tokio::spawn({
        let session = h.session.clone();
        async move { session.send_message("hola").await }
    });
    frames.send(frame("uno")).expect("feed");
    wait_for(&mut updates, |snapshot| {
        snapshot.ui.state == UiState::Streaming && last_content(snapshot) == Some("uno")
    })
    .await;

    hooks.on_pause();
    frames.send(frame(" dos")).expect("feed");
    wait_for(&mut updates, |snapshot| last_content(snapshot) == Some("uno dos")).await;
    assert_eq!(h.session.ui_state().state, UiState::Paused);

    hooks.on_resume();
    assert_eq!(h.session.ui_state().state, UiState::Loading);
    frames.send(frame(" tres")).expect("feed");
    wait_for(&mut updates, |snapshot| snapshot.ui.state == UiState::Streaming).await;
    frames.send("data: [DONE]\n\n".to_string()).expect("feed");

    let outcome = pending.await.expect("join").expect("send");
    assert_eq!(
        outcome,
        TurnOutcome::Reply {
            content: "uno dos tres".to_string()
        }
    );
    assert_eq!(h.session.ui_state().state, UiState::Idle);
}

#[tokio::test(start_paused = true)]
async fn loading_timeout_cancels_a_stalled_reply() {
    let config = SessionConfig {
        loading_timeout: Some(Duration::from_secs(5)),
        ..SessionConfig::default()
    };
    let h = harness_with(vec![Script::Hang], Vec::new(), config, None);

    let outcome = h.session.send_message("hola").await.expect("send");

    assert_eq!(outcome, TurnOutcome::Cancelled { partial: None });
    let ui = h.session.ui_state();
    assert_eq!(ui.state, UiState::Error);
    assert_eq!(ui.error.as_deref(), Some(TIMED_OUT_MESSAGE));
    assert!(ui.can_retry);
}
