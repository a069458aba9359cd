//! HTTP front end.
//!
//! Exposes the QA engine as a small JSON API. Answers can be fetched whole
//! or streamed as NDJSON events.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Version, index status, breaker states |
//! | `POST` | `/conversations` | Create a conversation (`{"title": ...}` optional) |
//! | `GET`  | `/conversations` | List conversation summaries |
//! | `PATCH` | `/conversations/{id}` | Rename (`{"title": ...}`) |
//! | `DELETE` | `/conversations/{id}` | Delete a conversation and its messages |
//! | `GET`  | `/conversations/{id}/messages` | Full message history |
//! | `POST` | `/conversations/{id}/ask` | Answer a question, return the final answer |
//! | `POST` | `/conversations/{id}/ask/stream` | Answer a question as NDJSON events |
//!
//! # Stream Events
//!
//! One JSON object per line, discriminated by `type`:
//!
//! ```json
//! {"type":"token","text":"Emotivity is"}
//! {"type":"discard"}
//! {"type":"completed","answer":{"text":"...","citations":[...],"outcome":{"kind":"generated"}}}
//! {"type":"errored","error":{"code":"request_failed","message":"..."}}
//! ```
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "question must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so browser chat clients
//! can talk to the server directly.

use std::convert::Infallible;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use futures::StreamExt;
use qa_harness_core::index::IndexHandle;
use qa_harness_core::models::{ConversationSummary, Message};
use qa_harness_core::{FaultClass, QaError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::engine::{Answer, AnswerEvent, QaEngine};
use crate::resilience::{BreakerSnapshot, BreakerState};

#[derive(Clone)]
struct AppState {
    engine: QaEngine,
}

/// Bind to `[server].bind` and serve until the process is terminated.
pub async fn run_server(config: &Config, engine: QaEngine) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    println!("QA server listening on http://{}", bind_addr);
    axum::serve(listener, router(engine)).await?;
    Ok(())
}

/// Build the router without binding, so callers can serve it on their own
/// listener.
pub fn router(engine: QaEngine) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route(
            "/conversations",
            get(handle_list_conversations).post(handle_create_conversation),
        )
        .route(
            "/conversations/{id}",
            patch(handle_rename_conversation).delete(handle_delete_conversation),
        )
        .route("/conversations/{id}/messages", get(handle_messages))
        .route("/conversations/{id}/ask", post(handle_ask))
        .route("/conversations/{id}/ask/stream", post(handle_ask_stream))
        .layer(cors)
        .with_state(AppState { engine })
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

impl From<QaError> for AppError {
    fn from(err: QaError) -> Self {
        match (&err, err.class()) {
            (QaError::ConversationNotFound(_), _) => not_found(err.to_string()),
            (_, FaultClass::Input) => bad_request(err.to_string()),
            _ => internal(err.to_string()),
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    index: IndexHealth,
    breakers: Vec<BreakerSnapshot>,
}

#[derive(Serialize)]
struct IndexHealth {
    loaded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    chunks: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

impl From<&IndexHandle> for IndexHealth {
    fn from(handle: &IndexHandle) -> Self {
        match handle {
            IndexHandle::Loaded(index) => IndexHealth {
                loaded: true,
                model: Some(index.model().to_string()),
                chunks: Some(index.len()),
                fingerprint: Some(index.fingerprint().to_string()),
                reason: None,
            },
            IndexHandle::Unavailable(reason) => IndexHealth {
                loaded: false,
                model: None,
                chunks: None,
                fingerprint: None,
                reason: Some(reason.clone()),
            },
        }
    }
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let index = IndexHealth::from(state.engine.index());
    let breakers = state.engine.breakers();
    let healthy = index.loaded && breakers.iter().all(|b| b.state == BreakerState::Closed);
    Json(HealthResponse {
        status: if healthy { "ok" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        index,
        breakers,
    })
}

// ============ /conversations ============

#[derive(Deserialize, Default)]
struct CreateConversationRequest {
    #[serde(default)]
    title: Option<String>,
}

#[derive(Serialize)]
struct ConversationCreated {
    id: String,
    title: String,
    created_at: String,
}

async fn handle_create_conversation(
    State(state): State<AppState>,
    Json(req): Json<CreateConversationRequest>,
) -> Result<(StatusCode, Json<ConversationCreated>), AppError> {
    let title = req.title.filter(|t| !t.trim().is_empty());
    let conversation = state.engine.store().create_conversation(title).await?;
    Ok((
        StatusCode::CREATED,
        Json(ConversationCreated {
            id: conversation.id,
            title: conversation.title,
            created_at: conversation.created_at.to_rfc3339(),
        }),
    ))
}

#[derive(Serialize)]
struct ConversationList {
    conversations: Vec<ConversationSummary>,
}

async fn handle_list_conversations(
    State(state): State<AppState>,
) -> Result<Json<ConversationList>, AppError> {
    let conversations = state.engine.store().list_conversations().await?;
    Ok(Json(ConversationList { conversations }))
}

#[derive(Deserialize)]
struct RenameConversationRequest {
    title: String,
}

async fn handle_rename_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<RenameConversationRequest>,
) -> Result<Json<ConversationSummary>, AppError> {
    let summary = state.engine.rename_conversation(&id, &req.title).await?;
    Ok(Json(summary))
}

async fn handle_delete_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.engine.delete_conversation(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
struct MessageList {
    id: String,
    title: String,
    messages: Vec<Message>,
}

async fn handle_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<MessageList>, AppError> {
    let conversation = state.engine.store().get_conversation(&id).await?;
    Ok(Json(MessageList {
        id: conversation.id,
        title: conversation.title,
        messages: conversation.messages,
    }))
}

// ============ POST /conversations/{id}/ask ============

#[derive(Deserialize)]
struct AskRequest {
    question: String,
}

async fn handle_ask(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<AskRequest>,
) -> Result<Json<Answer>, AppError> {
    let answer = state.engine.ask(&id, &req.question).await?;
    Ok(Json(answer))
}

async fn handle_ask_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<AskRequest>,
) -> Result<Response, AppError> {
    let events = state.engine.answer(&id, &req.question).await?;
    let lines = events.map(|event| Ok::<_, Infallible>(event_line(event)));
    Ok((
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(lines),
    )
        .into_response())
}

fn event_line(event: AnswerEvent) -> String {
    let value = match event {
        AnswerEvent::Token(text) => json!({ "type": "token", "text": text }),
        AnswerEvent::Discard => json!({ "type": "discard" }),
        AnswerEvent::Completed(answer) => json!({ "type": "completed", "answer": answer }),
        AnswerEvent::Errored(err) => json!({
            "type": "errored",
            "error": { "code": err.code(), "message": err.to_string() },
        }),
    };
    format!("{}\n", value)
}
