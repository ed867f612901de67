use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use base64::Engine;
use futures_util::StreamExt;
use periscope::config::ModelTable;
use periscope::credentials::{CredentialPool, Harvest};
use periscope::gateway::{ChatGateway, GatewayConfig, RefreshTrigger};
use periscope::stats::UsageStats;
use periscope::types::{ChatMessage, ChatRequest, MessageContent, Role};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct StubBackend {
    attempts: AtomicU32,
    /// Per-attempt NDJSON body; attempts requiring newer credentials 401
    /// until `x-cred` matches `accept_cred`.
    accept_cred: &'static str,
    body: &'static str,
}

async fn stub_generate(
    State(stub): State<Arc<StubBackend>>,
    headers: HeaderMap,
) -> axum::response::Response {
    stub.attempts.fetch_add(1, Ordering::SeqCst);
    let cred = headers
        .get("x-cred")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if cred != stub.accept_cred {
        return (StatusCode::UNAUTHORIZED, "session expired").into_response();
    }
    (StatusCode::OK, stub.body.to_string()).into_response()
}

async fn spawn_stub(stub: Arc<StubBackend>) -> String {
    let router = Router::new()
        .route("/generate", post(stub_generate))
        .with_state(stub);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("ephemeral bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    format!("http://{}/generate", addr)
}

fn harvest(cred_tag: &str, url: &str) -> Harvest {
    Harvest {
        headers: HashMap::from([("x-cred".to_string(), cred_tag.to_string())]),
        cookie: None,
        url: url.to_string(),
        body: serde_json::json!({
            "operationName": "GenerateContent",
            "variables": { "model": "harvested" }
        }),
    }
}

/// Simulates the browser collaborator: a refresh request produces a fresh
/// harvest shortly afterwards, through the pool's normal submit path.
struct DelayedHarvester {
    pool: Arc<CredentialPool>,
    url: String,
    cred_tag: &'static str,
}

#[async_trait::async_trait]
impl RefreshTrigger for DelayedHarvester {
    async fn trigger_refresh(&self) {
        let pool = self.pool.clone();
        let fresh = harvest(self.cred_tag, &self.url);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            pool.submit(fresh).await.expect("refresh submit");
        });
    }
}

fn chat_request(model: &str) -> ChatRequest {
    ChatRequest {
        model: model.into(),
        messages: vec![ChatMessage {
            role: Role::User,
            content: MessageContent::Text("hi there".into()),
        }],
        stream: true,
        temperature: None,
        top_p: None,
        top_k: None,
        max_tokens: None,
        stop: None,
        tools: None,
    }
}

fn gateway_for(pool: Arc<CredentialPool>, refresh: Arc<dyn RefreshTrigger>, dir: &tempfile::TempDir) -> ChatGateway {
    ChatGateway::new(
        pool,
        Arc::new(UsageStats::new(dir.path().join("stats.json"))),
        Arc::new(ModelTable::default()),
        refresh,
        GatewayConfig {
            heartbeat_enabled: false,
            ..GatewayConfig::default()
        },
    )
}

fn frame_json(frame: &str) -> Option<serde_json::Value> {
    let data = frame.strip_prefix("data: ")?.trim_end();
    if data == "[DONE]" {
        return None;
    }
    serde_json::from_str(data).ok()
}

const TEXT_BODY: &str = "{\"results\":[{\"path\":[0,0,0],\"data\":{\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hello from the refreshed session\"}]},\"finishReason\":\"STOP\"}]}}]}\n";

#[tokio::test]
async fn auth_failure_before_content_retries_and_completes() {
    let stub = Arc::new(StubBackend {
        attempts: AtomicU32::new(0),
        accept_cred: "v2",
        body: TEXT_BODY,
    });
    let url = spawn_stub(stub.clone()).await;

    let dir = tempfile::tempdir().expect("tempdir");
    let pool = Arc::new(CredentialPool::new(dir.path().join("creds.json"), 3));
    // Attempt 1 uses the stale credential and gets a 401.
    pool.submit(harvest("v1", &url)).await.expect("seed submit");

    let refresh = Arc::new(DelayedHarvester {
        pool: pool.clone(),
        url: url.clone(),
        cred_tag: "v2",
    });
    let gateway = gateway_for(pool.clone(), refresh, &dir);

    let frames: Vec<String> = tokio::time::timeout(
        Duration::from_secs(20),
        gateway.stream_chat(chat_request("test-model")).collect::<Vec<_>>(),
    )
    .await
    .expect("stream completes in time");

    assert_eq!(stub.attempts.load(Ordering::SeqCst), 2, "one retry after 401");
    assert_eq!(pool.version().await, 2, "refresh advanced the pool version");

    // Role frame first, before any content.
    let first = frame_json(&frames[0]).expect("first frame is a chunk");
    assert_eq!(first["choices"][0]["delta"]["role"], "assistant");

    // No error frame anywhere.
    for frame in &frames {
        if let Some(chunk) = frame_json(frame) {
            assert!(chunk.get("error").is_none(), "unexpected error frame: {}", frame);
        }
    }

    let all_content: String = frames
        .iter()
        .filter_map(|f| {
            frame_json(f).and_then(|c| {
                c["choices"][0]["delta"]["content"].as_str().map(String::from)
            })
        })
        .collect();
    assert_eq!(all_content, "Hello from the refreshed session");

    // Mapped finish code, then the usage frame, then the terminator.
    assert!(frames.iter().any(|f| frame_json(f)
        .map(|c| c["choices"][0]["finish_reason"] == "stop")
        .unwrap_or(false)));
    assert!(frames.iter().any(|f| frame_json(f)
        .map(|c| c["usage"]["total_tokens"].as_u64().unwrap_or(0) > 0)
        .unwrap_or(false)));
    assert_eq!(frames.last().map(String::as_str), Some("data: [DONE]\n\n"));
}

const IMAGE_BODY: &str = "{\"results\":[{\"path\":[0,0,0],\"data\":{\"candidates\":[{\"content\":{\"parts\":[{\"inlineData\":{\"mimeType\":\"image/png\",\"data\":\"aGVsbG8gd2\"}}]}}]}}]}\n";

#[tokio::test]
async fn truncated_image_payload_is_repadded() {
    let stub = Arc::new(StubBackend {
        attempts: AtomicU32::new(0),
        accept_cred: "v1",
        body: IMAGE_BODY,
    });
    let url = spawn_stub(stub.clone()).await;

    let dir = tempfile::tempdir().expect("tempdir");
    let pool = Arc::new(CredentialPool::new(dir.path().join("creds.json"), 3));
    pool.submit(harvest("v1", &url)).await.expect("seed submit");

    let refresh = Arc::new(DelayedHarvester {
        pool: pool.clone(),
        url: url.clone(),
        cred_tag: "v1",
    });
    let gateway = gateway_for(pool.clone(), refresh, &dir);

    let frames: Vec<String> = tokio::time::timeout(
        Duration::from_secs(20),
        gateway
            .stream_chat(chat_request("image-model"))
            .collect::<Vec<_>>(),
    )
    .await
    .expect("stream completes in time");

    let image_content = frames
        .iter()
        .filter_map(|f| {
            frame_json(f).and_then(|c| {
                c["choices"][0]["delta"]["content"].as_str().map(String::from)
            })
        })
        .find(|c| c.starts_with("![Generated Image](data:image/png;base64,"))
        .expect("image delta emitted");

    let payload = image_content
        .split("base64,")
        .nth(1)
        .and_then(|rest| rest.strip_suffix(')'))
        .expect("payload extractable");

    // The stub sent 10 base64 chars (== 2 mod 4); the proxy must repad.
    assert_eq!(payload.len() % 4, 0);
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(payload)
        .expect("payload decodes");
    assert_eq!(decoded, b"hello w");

    // Image models account fixed usage.
    assert!(frames.iter().any(|f| frame_json(f)
        .map(|c| c["usage"]["completion_tokens"].as_u64() == Some(1000))
        .unwrap_or(false)));
}

#[tokio::test]
async fn exhausted_refresh_yields_single_error_frame() {
    // Backend always 401s and the "harvester" never delivers: the client
    // must see exactly one descriptive error frame and a terminator.
    let stub = Arc::new(StubBackend {
        attempts: AtomicU32::new(0),
        accept_cred: "never",
        body: TEXT_BODY,
    });
    let url = spawn_stub(stub.clone()).await;

    let dir = tempfile::tempdir().expect("tempdir");
    let pool = Arc::new(CredentialPool::new(dir.path().join("creds.json"), 3));
    pool.submit(harvest("v1", &url)).await.expect("seed submit");

    struct NeverHarvests;
    #[async_trait::async_trait]
    impl RefreshTrigger for NeverHarvests {
        async fn trigger_refresh(&self) {}
    }

    let gateway = ChatGateway::new(
        pool.clone(),
        Arc::new(UsageStats::new(dir.path().join("stats.json"))),
        Arc::new(ModelTable::default()),
        Arc::new(NeverHarvests),
        GatewayConfig {
            heartbeat_enabled: false,
            max_retries: 1,
            retry_refresh_wait: Duration::from_secs(1),
            ..GatewayConfig::default()
        },
    );

    let frames: Vec<String> = tokio::time::timeout(
        Duration::from_secs(60),
        gateway.stream_chat(chat_request("test-model")).collect::<Vec<_>>(),
    )
    .await
    .expect("stream completes in time");

    let error_frames: Vec<&String> = frames
        .iter()
        .filter(|f| {
            frame_json(f)
                .map(|c| c.get("error").is_some())
                .unwrap_or(false)
        })
        .collect();
    assert_eq!(error_frames.len(), 1);
    assert!(error_frames[0].contains("upstream_error"));
    assert_eq!(frames.last().map(String::as_str), Some("data: [DONE]\n\n"));
}
