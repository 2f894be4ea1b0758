pub mod stream;

use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::controller::DecodeController;
use crate::errors::DecodeError;
use crate::protocol::{ChatRequest, ErrorBody, HealthBody, INDEX_HTML};

use self::stream::{start_generation, CancelOnDrop, StreamItem};

/// Process-lifetime request counters.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub requests: AtomicU64,
    pub failures: AtomicU64,
    /// Decode steps completed, including end-of-sequence tokens.
    pub tokens_generated: AtomicU64,
}

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<DecodeController>,
    pub stats: Arc<ServerStats>,
    pub stream_buffer: usize,
}

impl AppState {
    pub fn new(controller: Arc<DecodeController>, stream_buffer: usize) -> Self {
        Self {
            controller,
            stats: Arc::new(ServerStats::default()),
            stream_buffer,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(index))
        .route("/chat", post(chat))
        .route("/health", get(health))
        .layer(cors)
        .with_state(state)
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn health(State(state): State<AppState>) -> Json<HealthBody> {
    let context_length = state.controller.context_length();
    Json(HealthBody {
        status: if context_length.is_some() { "ok" } else { "loading" }.to_string(),
        context_length,
        requests: state.stats.requests.load(Ordering::Relaxed),
        failures: state.stats.failures.load(Ordering::Relaxed),
        tokens_generated: state.stats.tokens_generated.load(Ordering::Relaxed),
    })
}

async fn chat(State(state): State<AppState>, body: Bytes) -> Response {
    state.stats.requests.fetch_add(1, Ordering::Relaxed);

    let prompt = match ChatRequest::prompt_from_body(&body) {
        Ok(prompt) => prompt,
        Err(e) => return fail_response(&state, e),
    };
    info!(prompt_chars = prompt.chars().count(), "chat request");

    match start_generation(
        state.controller.clone(),
        prompt,
        state.stream_buffer,
        state.stats.clone(),
    )
    .await
    {
        Ok((rx, cancel)) => sse_response(rx, cancel),
        Err(e) => fail_response(&state, e),
    }
}

fn fail_response(state: &AppState, err: DecodeError) -> Response {
    state.stats.failures.fetch_add(1, Ordering::Relaxed);
    let status = err.status_code();
    if status.is_server_error() {
        warn!(status = status.as_u16(), error = %err, "chat request failed");
    }

    let body = Json(ErrorBody::from_error(&err));
    if err.is_retryable() {
        (status, [(header::RETRY_AFTER, "5")], body).into_response()
    } else {
        (status, body).into_response()
    }
}

/// SSE forbids bare carriage returns inside a data field.
fn normalize_newlines(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

fn sse_response(rx: mpsc::Receiver<StreamItem>, cancel: CancelOnDrop) -> Response {
    let items = ReceiverStream::new(rx);

    let stream = async_stream::stream! {
        // dropped with the response body, which cancels the decode loop
        let _cancel = cancel;
        tokio::pin!(items);
        while let Some(item) = items.next().await {
            match item {
                StreamItem::Token(text) => {
                    yield Ok::<_, Infallible>(Event::default().data(normalize_newlines(&text)));
                }
                StreamItem::Done(reason) => {
                    yield Ok(Event::default().event("done").data(reason.as_str()));
                    break;
                }
                StreamItem::Failed(message) => {
                    yield Ok(Event::default().event("error").data(normalize_newlines(&message)));
                    break;
                }
            }
        }
    };

    Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(15))
                .text("keep-alive"),
        )
        .into_response()
}
