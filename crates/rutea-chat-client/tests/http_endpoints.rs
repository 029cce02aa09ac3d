use std::sync::{Arc, Mutex};

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::post,
};
use rutea_chat_client::{
    EndpointConfig, HttpCompletionEndpoint, HttpSummaryClient, StoreError, StreamClient,
    StreamConfig, StreamObserver, SummarySink, TransportError,
};
use rutea_chat_core::{ChatRole, ConversationTurn, validate_summary};
use serde_json::{Value, json};
use tokio::{net::TcpListener, sync::oneshot};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Default)]
struct Recorded {
    bodies: Arc<Mutex<Vec<Value>>>,
    request_ids: Arc<Mutex<Vec<String>>>,
}

impl Recorded {
    fn record(&self, headers: &HeaderMap, body: Value) {
        let request_id = headers
            .get("x-request-id")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        self.request_ids.lock().expect("ids").push(request_id);
        self.bodies.lock().expect("bodies").push(body);
    }

    fn bodies(&self) -> Vec<Value> {
        self.bodies.lock().expect("bodies").clone()
    }

    fn request_ids(&self) -> Vec<String> {
        self.request_ids.lock().expect("ids").clone()
    }
}

struct Stub {
    base_url: String,
    recorded: Recorded,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Drop for Stub {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

async fn start_stub(router: Router<Recorded>) -> Stub {
    let recorded = Recorded::default();
    let app = router.with_state(recorded.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });
        let _ = server.await;
    });

    Stub {
        base_url: format!("http://{addr}"),
        recorded,
        shutdown: Some(shutdown_tx),
    }
}

fn event_stream(body: &'static str) -> Response {
    ([(header::CONTENT_TYPE, "text/event-stream")], body).into_response()
}

async fn chat_ok(
    State(recorded): State<Recorded>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    recorded.record(&headers, body);
    event_stream(
        "data: {\"content\":\"Hola\"}\n\n\
         : keep-alive\n\n\
         data: {\"choices\":[{\"delta\":{\"content\":\" mundo\"}}]}\n\n\
         data: [DONE]\n\n",
    )
}

async fn chat_malformed(
    State(recorded): State<Recorded>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    recorded.record(&headers, body);
    event_stream("data: {\"content\":\"uno\"}\n\ndata: no-json\n\ndata: {\"content\":\" dos\"}\n\n")
}

async fn chat_down(
    State(recorded): State<Recorded>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    recorded.record(&headers, body);
    (StatusCode::INTERNAL_SERVER_ERROR, "upstream down").into_response()
}

async fn resumen_ok(
    State(recorded): State<Recorded>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    recorded.record(&headers, body);
    Json(json!({"ok": true})).into_response()
}

async fn resumen_rejected(
    State(recorded): State<Recorded>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    recorded.record(&headers, body);
    StatusCode::UNPROCESSABLE_ENTITY.into_response()
}

#[derive(Default)]
struct Collect {
    text: String,
    errors: usize,
}

impl StreamObserver for Collect {
    fn on_delta(&mut self, fragment: &str) {
        self.text.push_str(fragment);
    }

    fn on_error(&mut self, _error: &TransportError) {
        self.errors += 1;
    }
}

fn question() -> Vec<ConversationTurn> {
    vec![ConversationTurn {
        role: ChatRole::User,
        content: "hola".to_string(),
    }]
}

fn stream_client(endpoint: HttpCompletionEndpoint) -> StreamClient {
    StreamClient::new(Arc::new(endpoint), StreamConfig::default())
}

#[tokio::test]
async fn streams_reply_over_http() {
    let stub = start_stub(Router::new().route("/api/chat", post(chat_ok))).await;
    let endpoints = EndpointConfig::new(&stub.base_url).expect("endpoints");
    let mut collect = Collect::default();

    let outcome = stream_client(HttpCompletionEndpoint::new(&endpoints))
        .open_stream(question(), &CancellationToken::new(), &mut collect)
        .await
        .expect("stream");

    assert_eq!(collect.text, "Hola mundo");
    assert_eq!(outcome.attempts, 1);
    assert!(outcome.saw_sentinel);
    assert_eq!(
        stub.recorded.bodies(),
        vec![json!({"turns": [{"role": "user", "content": "hola"}]})]
    );
    let request_ids = stub.recorded.request_ids();
    assert_eq!(request_ids.len(), 1);
    assert!(request_ids[0].starts_with("req_"));
}

#[tokio::test]
async fn malformed_frames_over_http_are_skipped() {
    let stub = start_stub(Router::new().route("/api/chat", post(chat_malformed))).await;
    let endpoint = HttpCompletionEndpoint::with_client(
        format!("{}/api/chat", stub.base_url),
        reqwest::Client::new(),
    );
    let mut collect = Collect::default();

    let outcome = stream_client(endpoint)
        .open_stream(question(), &CancellationToken::new(), &mut collect)
        .await
        .expect("stream");

    assert_eq!(collect.text, "uno dos");
    assert!(!outcome.saw_sentinel);
    assert_eq!(collect.errors, 0);
}

#[tokio::test]
async fn server_error_is_reported_without_retry() {
    let stub = start_stub(Router::new().route("/api/chat", post(chat_down))).await;
    let endpoint = HttpCompletionEndpoint::with_client(
        format!("{}/api/chat", stub.base_url),
        reqwest::Client::new(),
    );
    let mut collect = Collect::default();

    let error = stream_client(endpoint)
        .open_stream(question(), &CancellationToken::new(), &mut collect)
        .await
        .expect_err("rejected");

    match error {
        TransportError::Rejected { status, body } => {
            assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
            assert_eq!(body, "upstream down");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(stub.recorded.bodies().len(), 1);
    assert_eq!(collect.errors, 1);
}

#[tokio::test]
async fn summary_client_posts_owner_and_payload() {
    let stub = start_stub(Router::new().route("/api/resumen", post(resumen_ok))).await;
    let endpoints = EndpointConfig::new(&stub.base_url).expect("endpoints");
    let summary = validate_summary(&json!({
        "proposito": "Cambiar de carrera",
        "valores": ["autonomia"],
    }))
    .expect("summary");

    HttpSummaryClient::new(&endpoints)
        .persist_summary("owner-1", &summary)
        .await
        .expect("persist");

    assert_eq!(
        stub.recorded.bodies(),
        vec![json!({
            "userId": "owner-1",
            "resumen": {"proposito": "Cambiar de carrera", "valores": ["autonomia"]},
        })]
    );
}

#[tokio::test]
async fn summary_rejection_carries_status() {
    let stub = start_stub(Router::new().route("/api/resumen", post(resumen_rejected))).await;
    let client = HttpSummaryClient::with_client(
        format!("{}/api/resumen", stub.base_url),
        reqwest::Client::new(),
    );
    let summary = validate_summary(&json!({"proposito": "A"})).expect("summary");

    let error = client
        .persist_summary("owner-1", &summary)
        .await
        .expect_err("rejected");

    match error {
        StoreError::Rejected { status, body } => {
            assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
            assert_eq!(body, "<empty>");
        }
        other => panic!("unexpected error: {other}"),
    }
}
