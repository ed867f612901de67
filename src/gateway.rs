use crate::aggregator::ChunkAggregator;
use crate::config::ModelTable;
use crate::constants::{
    AGGREGATOR_MAX_BUFFER_MS, AGGREGATOR_MIN_CHUNK_SIZE, COLD_REFRESH_WAIT_SECS,
    COLD_SETTLE_DELAY_MS, HEARTBEAT_INTERVAL_SECS, IMAGE_MODEL_COMPLETION_TOKENS,
    IMAGE_MODEL_PROMPT_TOKENS, CHARS_PER_COMPLETION_TOKEN, PREEMPTIVE_REFRESH_THRESHOLD_SECS,
    RETRY_REFRESH_WAIT_SECS, RETRY_SETTLE_DELAY_MS, TRANSPORT_RETRY_BASE_DELAY_MS,
    UPSTREAM_CONNECT_TIMEOUT_SECS, UPSTREAM_READ_TIMEOUT_SECS,
};
use crate::credentials::{CredentialPool, Harvest};
use crate::diff::autocorrect_diff;
use crate::payload::build_request_body;
use crate::processor::StreamProcessor;
use crate::sse::{SseFormatter, DONE_EVENT};
use crate::stats::UsageStats;
use crate::types::{ChatRequest, PeriscopeError, Result};
use futures_util::StreamExt;
use lazy_static::lazy_static;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

lazy_static! {
    static ref BLANK_LINES_RE: Regex = Regex::new(r"\n\s*\n").expect("pattern compiles");
}

/// Seam to the browser-automation collaborator: asks it to actively refresh
/// the session. The pool's waiter queue delivers the result.
#[async_trait::async_trait]
pub trait RefreshTrigger: Send + Sync {
    async fn trigger_refresh(&self);
}

/// Default trigger for deployments where only the passive harvester feed
/// exists; requests can still wait on pushes arriving via `/harvest`.
pub struct LogOnlyRefresh;

#[async_trait::async_trait]
impl RefreshTrigger for LogOnlyRefresh {
    async fn trigger_refresh(&self) {
        tracing::warn!("[GATEWAY] Credential refresh requested but no active harvester is wired");
    }
}

#[derive(Clone)]
pub struct GatewayConfig {
    pub max_retries: u32,
    pub auth_statuses: &'static [u16],
    pub heartbeat_enabled: bool,
    pub heartbeat_interval: Duration,
    /// How long a request blocks on the pool when no usable credential
    /// exists at all.
    pub cold_refresh_wait: Duration,
    /// How long an auth-failed attempt waits for fresh credentials before
    /// giving up on the retry.
    pub retry_refresh_wait: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_retries: crate::constants::DEFAULT_MAX_RETRIES,
            auth_statuses: crate::constants::AUTH_RETRY_STATUS_CODES,
            heartbeat_enabled: true,
            heartbeat_interval: Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
            cold_refresh_wait: Duration::from_secs(COLD_REFRESH_WAIT_SECS),
            retry_refresh_wait: Duration::from_secs(RETRY_REFRESH_WAIT_SECS),
        }
    }
}

/// Drives one logical chat request end to end: credential acquisition,
/// dispatch over an isolated transport, the bounded retry state machine, and
/// the streaming pipeline.
#[derive(Clone)]
pub struct ChatGateway {
    pool: Arc<CredentialPool>,
    stats: Arc<UsageStats>,
    models: Arc<ModelTable>,
    refresh: Arc<dyn RefreshTrigger>,
    config: GatewayConfig,
}

enum StreamOutcome {
    /// Stream fully forwarded; holds the emitted content char count.
    Completed(u64),
    /// Downstream client went away; stop everything.
    Disconnected,
    /// Auth failure raised inside the stream.
    AuthFailure(String),
    /// Transport died mid-read.
    TransportFailure(String),
}

impl ChatGateway {
    pub fn new(
        pool: Arc<CredentialPool>,
        stats: Arc<UsageStats>,
        models: Arc<ModelTable>,
        refresh: Arc<dyn RefreshTrigger>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            pool,
            stats,
            models,
            refresh,
            config,
        }
    }

    /// Starts the request state machine on a background task and hands back
    /// the frame stream. Dropping the stream cancels the request: the next
    /// forwarded frame fails to send and the task releases its transport.
    pub fn stream_chat(&self, request: ChatRequest) -> ReceiverStream<String> {
        let (tx, rx) = mpsc::channel(32);
        let gateway = self.clone();
        tokio::spawn(async move {
            gateway.run_stream(request, tx).await;
        });
        ReceiverStream::new(rx)
    }

    /// Drains the stream variant into one aggregate response object,
    /// special-casing embedded images and tool-call blocks.
    pub async fn complete_chat(&self, request: ChatRequest) -> serde_json::Value {
        let model = request.model.clone();
        let mut stream = self.stream_chat(request);

        let mut content = String::new();
        let mut reasoning = String::new();
        let mut finish_reason = "stop".to_string();

        while let Some(frame) = stream.next().await {
            let data = match frame.strip_prefix("data: ") {
                Some(d) => d.trim(),
                None => continue,
            };
            if data == "[DONE]" {
                continue;
            }
            let chunk: serde_json::Value = match serde_json::from_str(data) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!("[GATEWAY] Unparseable frame in aggregate path: {}", e);
                    continue;
                }
            };
            if let Some(choice) = chunk
                .get("choices")
                .and_then(|c| c.as_array())
                .and_then(|c| c.first())
            {
                if let Some(delta) = choice.get("delta") {
                    if let Some(c) = delta.get("content").and_then(|v| v.as_str()) {
                        content.push_str(c);
                    }
                    if let Some(r) = delta.get("reasoning_content").and_then(|v| v.as_str()) {
                        reasoning.push_str(r);
                    }
                }
                if let Some(reason) = choice.get("finish_reason").and_then(|v| v.as_str()) {
                    finish_reason = reason.to_string();
                }
            }
        }

        let content = autocorrect_diff(&content);

        if let Some(rest) = content.strip_prefix("![Generated Image](data:") {
            if let Some(data_url) = rest.strip_suffix(')') {
                tracing::info!("[GATEWAY] Aggregate response is an image");
                return serde_json::json!({ "resultUrl": format!("data:{}", data_url) });
            }
        }

        let usage = self.stats.current_usage().await;

        if content.contains("<tool_calls>") && content.contains("</tool_calls>") {
            tracing::info!("[GATEWAY] Aggregate response carries a tool-call block");
            return chat_completion_object(&model, &content, "stop", usage);
        }

        let mut final_content = content.clone();
        if !reasoning.is_empty() {
            let cleaned = BLANK_LINES_RE.replace_all(&reasoning, "\n");
            final_content = format!(
                "**Reasoning:**\n{}\n\n**Response:**\n{}",
                cleaned.trim(),
                content
            );
        }
        if final_content.is_empty() {
            final_content = " ".to_string();
        }

        chat_completion_object(&model, &final_content, &finish_reason, usage)
    }

    async fn run_stream(self, request: ChatRequest, tx: mpsc::Sender<String>) {
        let request_id: String = uuid::Uuid::new_v4().to_string()[..8].to_string();
        let formatter = SseFormatter::new(&request_id);

        // Freshness gate: block the request only when nothing usable exists.
        if self.pool.needs_refresh().await {
            let triggered = self.pool.begin_refresh().await;
            if triggered {
                tracing::info!("[{}] No fresh credential, triggering refresh", request_id);
                self.refresh.trigger_refresh().await;
            }
            let refreshed = self
                .pool
                .wait_for_update(&request_id, self.config.cold_refresh_wait)
                .await;
            if refreshed {
                tokio::time::sleep(Duration::from_millis(COLD_SETTLE_DELAY_MS)).await;
            } else {
                // Close the episode so the next request can trigger again.
                self.pool.mark_refresh_failed().await;
                if self.pool.acquire_best().await.is_none() {
                    let msg = "Could not refresh credentials. Ensure the backend studio is open \
                               in a browser and the harvester is active.";
                    let _ = tx.send(formatter.error_frame(msg, "no_credential")).await;
                    let _ = tx.send(DONE_EVENT.to_string()).await;
                    return;
                }
            }
        }

        // Preemptive refresh: fire-and-forget when remaining life is short.
        if self
            .pool
            .needs_preemptive_refresh(PREEMPTIVE_REFRESH_THRESHOLD_SECS)
            .await
            && self.pool.begin_refresh().await
        {
            tracing::info!("[{}] Credential aging out, starting background refresh", request_id);
            let refresh = self.refresh.clone();
            tokio::spawn(async move {
                refresh.trigger_refresh().await;
            });
        }

        let backend_model = self.models.resolve(&request.model).backend_model;
        let mut attempt: u32 = 0;

        loop {
            // One isolated transport per attempt, dropped on every exit path
            // with this function; a retry never inherits connection state
            // from the attempt that failed.
            let client = match build_isolated_client() {
                Ok(c) => c,
                Err(e) => {
                    let _ = tx
                        .send(formatter.error_frame(&e.to_string(), "request_error"))
                        .await;
                    let _ = tx.send(DONE_EVENT.to_string()).await;
                    return;
                }
            };

            let mut processor = StreamProcessor::with_heartbeat(
                &request.model,
                self.config.heartbeat_enabled,
                self.config.heartbeat_interval,
            );

            let issued = match self.pool.acquire_best().await {
                Some(c) => c,
                None => {
                    if attempt == 0 {
                        let _ = tx
                            .send(formatter.error_frame("No credential available", "no_credential"))
                            .await;
                        let _ = tx.send(DONE_EVENT.to_string()).await;
                    }
                    return;
                }
            };

            let body = match build_request_body(&issued.harvest, &request, &self.models) {
                Ok(b) => b,
                Err(e) => {
                    let _ = tx
                        .send(formatter.error_frame(&e.to_string(), "request_error"))
                        .await;
                    let _ = tx.send(DONE_EVENT.to_string()).await;
                    return;
                }
            };

            if attempt == 0 {
                tracing::info!(
                    "[{}] -> {} (slot {}, age {:.0}s)",
                    request_id,
                    backend_model,
                    issued.slot_id,
                    issued.age_seconds
                );
            } else {
                tracing::info!(
                    "[{}] retry {}/{} -> {}",
                    request_id,
                    attempt,
                    self.config.max_retries,
                    backend_model
                );
            }

            let response = match client
                .post(&issued.harvest.url)
                .headers(build_headers(&issued.harvest))
                .json(&body)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!("[{}] Dispatch failed: {}", request_id, e);
                    if attempt < self.config.max_retries {
                        attempt += 1;
                        backoff_sleep(attempt).await;
                        continue;
                    }
                    let _ = tx
                        .send(formatter.error_frame(&e.to_string(), "request_error"))
                        .await;
                    let _ = tx.send(DONE_EVENT.to_string()).await;
                    return;
                }
            };

            let status = response.status();
            tracing::info!("[{}] Upstream status: {}", request_id, status);

            if !status.is_success() {
                let error_body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unreadable error body".to_string());

                if self.config.auth_statuses.contains(&status.as_u16())
                    && attempt < self.config.max_retries
                {
                    tracing::warn!(
                        "[{}] Auth-class status {}, refreshing credentials",
                        request_id,
                        status
                    );
                    self.pool.mark_slot_expired(issued.slot_id).await;
                    if self
                        .refresh_and_wait(&request_id, issued.version, self.config.retry_refresh_wait)
                        .await
                    {
                        attempt += 1;
                        continue;
                    }
                }

                let upstream = PeriscopeError::Upstream(status, error_body);
                let _ = tx
                    .send(formatter.error_frame(&upstream.to_string(), "upstream_error"))
                    .await;
                let _ = tx.send(DONE_EVENT.to_string()).await;
                return;
            }

            match self.pump_stream(response, &mut processor, &tx).await {
                StreamOutcome::Disconnected => {
                    tracing::debug!("[{}] Client disconnected, stopping stream", request_id);
                    return;
                }
                StreamOutcome::Completed(content_chars) => {
                    for frame in processor.finish() {
                        if tx.send(frame).await.is_err() {
                            return;
                        }
                    }
                    let usage = self.account_usage(&request, &backend_model, content_chars).await;
                    let _ = tx.send(processor.usage_frame(usage)).await;
                    let _ = tx.send(DONE_EVENT.to_string()).await;
                    processor.log_summary();
                    return;
                }
                StreamOutcome::AuthFailure(message) => {
                    if processor.content_sent() {
                        // Partial content already reached the client; a
                        // retry would duplicate it.
                        tracing::warn!("[{}] Auth failure after content was sent", request_id);
                        let _ = tx
                            .send(formatter.error_frame(
                                &format!("Authentication failed mid-stream: {}", message),
                                "authentication_error",
                            ))
                            .await;
                        let _ = tx.send(DONE_EVENT.to_string()).await;
                        return;
                    }
                    if attempt < self.config.max_retries {
                        tracing::warn!(
                            "[{}] Mid-stream auth failure, refreshing (attempt {}/{})",
                            request_id,
                            attempt + 1,
                            self.config.max_retries + 1
                        );
                        self.pool.mark_slot_invalid(issued.slot_id).await;
                        if self
                            .refresh_and_wait(&request_id, issued.version, self.config.retry_refresh_wait)
                            .await
                        {
                            attempt += 1;
                            continue;
                        }
                    }
                    // Retries exhausted with nothing sent: end silently so
                    // the client sees a clean empty stream, not a confusing
                    // error after zero content.
                    tracing::warn!("[{}] Credential refresh exhausted, ending silently", request_id);
                    return;
                }
                StreamOutcome::TransportFailure(message) => {
                    if processor.content_sent() {
                        let _ = tx
                            .send(formatter.error_frame(
                                &format!("Stream interrupted: {}", message),
                                "request_error",
                            ))
                            .await;
                        let _ = tx.send(DONE_EVENT.to_string()).await;
                        return;
                    }
                    if attempt < self.config.max_retries {
                        attempt += 1;
                        backoff_sleep(attempt).await;
                        continue;
                    }
                    let _ = tx
                        .send(formatter.error_frame(&message, "request_error"))
                        .await;
                    let _ = tx.send(DONE_EVENT.to_string()).await;
                    return;
                }
            }
        }
    }

    /// Reads the response body through the aggregator and processor,
    /// forwarding frames as they are produced.
    async fn pump_stream(
        &self,
        response: reqwest::Response,
        processor: &mut StreamProcessor,
        tx: &mpsc::Sender<String>,
    ) -> StreamOutcome {
        let mut aggregator = ChunkAggregator::new(
            AGGREGATOR_MIN_CHUNK_SIZE,
            Duration::from_millis(AGGREGATOR_MAX_BUFFER_MS),
        );
        let mut byte_stream = response.bytes_stream();

        loop {
            // Bound the read so heartbeats fire even when the backend goes
            // quiet between chunks.
            let item = if self.config.heartbeat_enabled {
                match tokio::time::timeout(self.config.heartbeat_interval, byte_stream.next())
                    .await
                {
                    Ok(item) => item,
                    Err(_) => {
                        if let Some(heartbeat) = processor.maybe_heartbeat() {
                            if tx.send(heartbeat).await.is_err() {
                                return StreamOutcome::Disconnected;
                            }
                        }
                        continue;
                    }
                }
            } else {
                byte_stream.next().await
            };
            let bytes = match item {
                Some(Ok(b)) => b,
                Some(Err(e)) => return StreamOutcome::TransportFailure(e.to_string()),
                None => break,
            };
            if let Some(segment) = aggregator.push_bytes(&bytes) {
                match processor.feed(&segment) {
                    Ok(frames) => {
                        for frame in frames {
                            if tx.send(frame).await.is_err() {
                                return StreamOutcome::Disconnected;
                            }
                        }
                    }
                    Err(e) => return auth_or_bubble(e),
                }
            }
            if let Some(heartbeat) = processor.maybe_heartbeat() {
                if tx.send(heartbeat).await.is_err() {
                    return StreamOutcome::Disconnected;
                }
            }
        }

        if let Some(rest) = aggregator.flush() {
            match processor.feed(&rest) {
                Ok(frames) => {
                    for frame in frames {
                        if tx.send(frame).await.is_err() {
                            return StreamOutcome::Disconnected;
                        }
                    }
                }
                Err(e) => return auth_or_bubble(e),
            }
        }

        StreamOutcome::Completed(processor.stats().content_chars)
    }

    /// Shared refresh-then-wait step for the auth retry paths. Succeeds only
    /// when the pool version actually advanced past what the failing attempt
    /// used.
    async fn refresh_and_wait(&self, request_id: &str, seen_version: u64, wait: Duration) -> bool {
        if self.pool.version().await > seen_version {
            // A sibling request already refreshed; no need to wait.
            tokio::time::sleep(Duration::from_millis(RETRY_SETTLE_DELAY_MS)).await;
            return true;
        }

        let triggered = self.pool.begin_refresh().await;
        if triggered {
            self.refresh.trigger_refresh().await;
        }

        let refreshed = self
            .pool
            .wait_for_update(request_id, wait)
            .await;
        if !refreshed {
            // A submission that landed between the trigger and our enqueue
            // wakes nobody; the version is the ground truth.
            if self.pool.version().await > seen_version {
                tokio::time::sleep(Duration::from_millis(RETRY_SETTLE_DELAY_MS)).await;
                return true;
            }
            // Close the episode even if a sibling triggered it; whoever
            // timed out first gets to declare it failed.
            self.pool.mark_refresh_failed().await;
            tracing::warn!("[{}] Credential refresh timed out", request_id);
            return false;
        }

        let new_version = self.pool.version().await;
        if new_version <= seen_version {
            tracing::warn!(
                "[{}] Woken but pool version unchanged (v{})",
                request_id,
                new_version
            );
            return false;
        }

        tracing::info!(
            "[{}] Credentials updated v{} -> v{}",
            request_id,
            seen_version,
            new_version
        );
        tokio::time::sleep(Duration::from_millis(RETRY_SETTLE_DELAY_MS)).await;
        true
    }

    async fn account_usage(
        &self,
        request: &ChatRequest,
        backend_model: &str,
        content_chars: u64,
    ) -> crate::types::Usage {
        let is_image_model = backend_model.to_lowercase().contains("image");
        let (prompt_tokens, completion_tokens) = if is_image_model {
            (IMAGE_MODEL_PROMPT_TOKENS, IMAGE_MODEL_COMPLETION_TOKENS)
        } else {
            let prompt = UsageStats::estimate_messages_tokens(&request.messages);
            let completion = ((content_chars as f64 / CHARS_PER_COMPLETION_TOKEN) as u32).max(1);
            (prompt, completion)
        };
        self.stats.update(prompt_tokens, completion_tokens).await;
        crate::types::Usage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

fn auth_or_bubble(e: crate::types::ObservedError) -> StreamOutcome {
    match e.inner {
        PeriscopeError::Authentication(msg) => StreamOutcome::AuthFailure(msg),
        other => StreamOutcome::TransportFailure(other.to_string()),
    }
}

/// Fresh transport per attempt: long read timeout for slow generations,
/// small connection pool, no state shared with sibling requests or with a
/// failed prior attempt.
fn build_isolated_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(UPSTREAM_CONNECT_TIMEOUT_SECS))
        .read_timeout(Duration::from_secs(UPSTREAM_READ_TIMEOUT_SECS))
        .pool_max_idle_per_host(5)
        .pool_idle_timeout(Duration::from_secs(60))
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .redirect(reqwest::redirect::Policy::limited(5))
        .build()
        .map_err(|e| PeriscopeError::Network(e).into())
}

/// Replays the harvested headers minus the hop-by-hop set the transport owns.
fn build_headers(harvest: &Harvest) -> reqwest::header::HeaderMap {
    use reqwest::header::{HeaderName, HeaderValue};

    const DROPPED: &[&str] = &["content-length", "host", "connection", "accept-encoding"];

    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in &harvest.headers {
        let lower = name.to_lowercase();
        if DROPPED.contains(&lower.as_str()) {
            continue;
        }
        match (
            HeaderName::from_bytes(lower.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(n), Ok(v)) => {
                headers.insert(n, v);
            }
            _ => {
                tracing::warn!("[GATEWAY] Skipping unrepresentable harvested header {}", name);
            }
        }
    }
    if let Some(cookie) = &harvest.cookie {
        if !headers.contains_key(reqwest::header::COOKIE) {
            if let Ok(v) = reqwest::header::HeaderValue::from_str(cookie) {
                headers.insert(reqwest::header::COOKIE, v);
            }
        }
    }
    headers.insert(
        reqwest::header::CONTENT_TYPE,
        reqwest::header::HeaderValue::from_static("application/json"),
    );
    headers
}

async fn backoff_sleep(attempt: u32) {
    let base = TRANSPORT_RETRY_BASE_DELAY_MS * 2u64.pow(attempt.min(4));
    let jitter = fastrand::u64(0..base / 2 + 1);
    tokio::time::sleep(Duration::from_millis(base + jitter)).await;
}

fn chat_completion_object(
    model: &str,
    content: &str,
    finish_reason: &str,
    usage: crate::types::Usage,
) -> serde_json::Value {
    serde_json::json!({
        "id": format!("chatcmpl-proxy-nonstream-{}", uuid::Uuid::new_v4()),
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "usage": usage,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": content },
            "finish_reason": finish_reason,
        }]
    })
}
