use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    http::header,
    response::{IntoResponse, Response},
    routing::post,
};
use clap::Parser;
use rutea_chat_client::{
    ChatClientConfig, ChatSession, EndpointConfig, HttpCompletionEndpoint, HttpSummaryClient,
    InMemoryMessageStore, LifecycleCoordinator, LifecycleState, RequestRegistry, SessionDeps,
};
use serde_json::{Value, json};
use tokio::{net::TcpListener, sync::oneshot};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "chat-vignette")]
#[command(about = "Runs a chat session against a completion service and logs the transcript")]
struct Args {
    /// Owner whose conversation is driven.
    #[arg(long, default_value = "vignette-owner")]
    owner_id: String,
    /// Message to send after the opening turn. Repeatable.
    #[arg(long = "message")]
    messages: Vec<String>,
    /// Use a running service instead of the built-in mock.
    #[arg(long)]
    base_url: Option<String>,
    /// Pause and resume the session between messages.
    #[arg(long)]
    simulate_background: bool,
}

struct MockServiceHandle {
    base_url: String,
    shutdown: oneshot::Sender<()>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = ChatClientConfig::from_env().context("load chat client config")?;

    let mock = match args.base_url.as_deref() {
        Some(base_url) => {
            config.endpoints.base_url = EndpointConfig::new(base_url)
                .context("parse --base-url")?
                .base_url;
            None
        }
        None => {
            let mock = start_mock_service().await?;
            config.endpoints.base_url = EndpointConfig::new(&mock.base_url)
                .context("mock service base url")?
                .base_url;
            Some(mock)
        }
    };
    info!(base_url = %config.endpoints.base_url, owner_id = %args.owner_id, "starting chat vignette");

    let registry = RequestRegistry::new(config.registry.clone());
    let _reaper = registry.spawn_reaper();
    let store = InMemoryMessageStore::new();
    let session = ChatSession::new(
        args.owner_id.clone(),
        config.session.clone(),
        config.stream.clone(),
        SessionDeps {
            endpoint: Arc::new(HttpCompletionEndpoint::new(&config.endpoints)),
            store: Arc::new(store.clone()),
            summaries: Arc::new(HttpSummaryClient::new(&config.endpoints)),
            registry: registry.clone(),
        },
    );
    let lifecycle = LifecycleCoordinator::spawn(
        config.lifecycle.clone(),
        registry.clone(),
        session.lifecycle_hooks(),
        None,
    );
    lifecycle.register_resubscribe(session.resubscribe_callback());
    lifecycle.register_cleanup({
        let session = session.clone();
        move || session.close()
    });

    session
        .start_realtime_sync()
        .await
        .context("subscribe to message inserts")?;
    session.load_history().await.context("load history")?;

    for message in &args.messages {
        if args.simulate_background {
            cycle_background(&lifecycle).await;
        }
        match session.send_message(message).await {
            Ok(outcome) => info!(?outcome, "turn settled"),
            Err(error) => warn!(%error, "turn failed"),
        }
    }

    for message in session.messages() {
        info!(role = %message.role(), "{}", message.content());
    }
    info!(rows = store.rows().len(), "persisted messages");

    lifecycle.shutdown().await;
    if let Some(mock) = mock {
        let _ = mock.shutdown.send(());
    }
    Ok(())
}

async fn cycle_background(lifecycle: &LifecycleCoordinator) {
    let mut states = lifecycle.watch_state();
    lifecycle.pause();
    if states
        .wait_for(|state| *state == LifecycleState::Paused)
        .await
        .is_err()
    {
        return;
    }
    lifecycle.resume();
    let _ = states
        .wait_for(|state| *state == LifecycleState::Active)
        .await;
}

async fn start_mock_service() -> Result<MockServiceHandle> {
    let app = Router::new()
        .route("/api/chat", post(mock_chat))
        .route("/api/resumen", post(mock_resumen));

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .context("bind mock service")?;
    let addr = listener.local_addr().context("mock service address")?;
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });
        let _ = server.await;
    });

    Ok(MockServiceHandle {
        base_url: format!("http://{addr}"),
        shutdown: shutdown_tx,
    })
}

async fn mock_chat(Json(body): Json<Value>) -> Response {
    let last = body
        .get("turns")
        .and_then(Value::as_array)
        .and_then(|turns| turns.last())
        .and_then(|turn| turn.get("content"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let reply = if last.to_lowercase().contains("resumen") {
        json!({
            "resumen": {
                "proposito": "Encontrar un rol con impacto social",
                "talentos_clave": ["facilitación", "análisis"],
                "valores": ["autonomía", "aprendizaje"],
            }
        })
        .to_string()
    } else {
        format!("Gracias por contarme: \"{last}\". ¿Qué te gustaría explorar primero?")
    };

    let mut frames = String::new();
    for fragment in reply.split_inclusive(' ') {
        frames.push_str(&format!("data: {}\n\n", json!({ "content": fragment })));
    }
    frames.push_str("data: [DONE]\n\n");

    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache, no-transform"),
            (header::CONNECTION, "keep-alive"),
        ],
        frames,
    )
        .into_response()
}

async fn mock_resumen(Json(body): Json<Value>) -> Json<Value> {
    let owner_id = body.get("userId").and_then(Value::as_str).unwrap_or_default();
    let fields = body
        .get("resumen")
        .and_then(Value::as_object)
        .map_or(0, |fields| fields.len());
    info!(owner_id, fields, "mock summary stored");
    Json(json!({"ok": true}))
}
