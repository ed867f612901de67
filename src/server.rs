use crate::config::{Args, ModelTable};
use crate::credentials::{CredentialPool, Harvest};
use crate::gateway::ChatGateway;
use crate::stats::UsageStats;
use crate::types::ChatRequest;
use axum::{
    extract::State,
    http::header,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use futures_util::StreamExt;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

#[derive(Clone)]
pub struct AppState {
    pub gateway: ChatGateway,
    pub pool: Arc<CredentialPool>,
    pub stats: Arc<UsageStats>,
    pub models: Arc<ModelTable>,
    pub args: Arc<Args>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        .route("/health", get(health))
        .route("/harvest", post(submit_harvest))
        .route("/harvest/token", post(submit_token))
        .layer(axum::middleware::from_fn(
            crate::logging::request_span_middleware,
        ))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> Response {
    if request.messages.is_empty() {
        return empty_conversation_response(&request);
    }

    if request.stream {
        let frames = state.gateway.stream_chat(request);
        let body = axum::body::Body::from_stream(
            frames.map(|frame| Ok::<_, Infallible>(Bytes::from(frame))),
        );
        (
            [
                (header::CONTENT_TYPE, "text/event-stream"),
                (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
                (header::HeaderName::from_static("x-accel-buffering"), "no"),
            ],
            body,
        )
            .into_response()
    } else {
        Json(state.gateway.complete_chat(request).await).into_response()
    }
}

/// A request with no messages gets a well-formed empty completion instead of
/// an upstream round trip.
fn empty_conversation_response(request: &ChatRequest) -> Response {
    let id = format!("chatcmpl-proxy-empty-{}", uuid::Uuid::new_v4());
    if request.stream {
        let chunk = serde_json::json!({
            "id": id,
            "object": "chat.completion.chunk",
            "created": chrono::Utc::now().timestamp(),
            "model": request.model,
            "choices": [{
                "index": 0,
                "delta": {"role": "assistant", "content": ""},
                "finish_reason": "stop"
            }]
        });
        let body = format!("data: {}\n\n{}", chunk, crate::sse::DONE_EVENT);
        ([(header::CONTENT_TYPE, "text/event-stream")], body).into_response()
    } else {
        Json(serde_json::json!({
            "id": id,
            "object": "chat.completion",
            "created": chrono::Utc::now().timestamp(),
            "model": request.model,
            "usage": {"prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0},
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": ""},
                "finish_reason": "stop"
            }]
        }))
        .into_response()
    }
}

async fn list_models(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let created = chrono::Utc::now().timestamp();
    let data: Vec<serde_json::Value> = state
        .models
        .advertised_models()
        .iter()
        .map(|m| {
            serde_json::json!({
                "id": m,
                "object": "model",
                "created": created,
                "owned_by": "periscope",
            })
        })
        .collect();
    Json(serde_json::json!({ "object": "list", "data": data }))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let pool = state.pool.report().await;
    let usage = state.stats.summary().await;
    Json(serde_json::json!({
        "status": "ok",
        "pool": pool,
        "usage": usage,
    }))
}

/// Passive harvester feed: the browser collaborator posts each captured
/// session here.
async fn submit_harvest(
    State(state): State<Arc<AppState>>,
    Json(harvest): Json<Harvest>,
) -> Response {
    match state.pool.submit(harvest).await {
        Ok(version) => Json(serde_json::json!({ "status": "ok", "pool_version": version }))
            .into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Deserialize)]
struct TokenUpdate {
    token: String,
}

async fn submit_token(
    State(state): State<Arc<AppState>>,
    Json(update): Json<TokenUpdate>,
) -> Response {
    match state.pool.update_token(&update.token).await {
        Ok(version) => Json(serde_json::json!({ "status": "ok", "pool_version": version }))
            .into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn serve(state: Arc<AppState>) -> crate::types::Result<()> {
    let addr = format!("{}:{}", state.args.host, state.args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(crate::types::PeriscopeError::Io)?;
    tracing::info!("Periscope listening on {}", addr);
    axum::serve(listener, build_router(state))
        .await
        .map_err(crate::types::PeriscopeError::Io)?;
    Ok(())
}
