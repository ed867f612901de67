use crate::constants::{
    CHARS_PER_TOKEN_CJK, CHARS_PER_TOKEN_LATIN, TOKENS_PER_IMAGE_PART, TOKENS_PER_MESSAGE_OVERHEAD,
};
use crate::types::{ChatMessage, ContentPart, MessageContent, Usage};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct Totals {
    total_requests: u64,
    total_tokens: u64,
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Default)]
struct StatsInner {
    totals: Totals,
    current_prompt: u32,
    current_completion: u32,
}

/// Usage estimation and cumulative accounting. The backend never reports
/// token counts, so everything here is a character-class heuristic.
pub struct UsageStats {
    path: PathBuf,
    inner: Mutex<StatsInner>,
}

impl UsageStats {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            inner: Mutex::new(StatsInner::default()),
        }
    }

    pub async fn load_or_default(path: impl Into<PathBuf>) -> Self {
        let stats = Self::new(path);
        match tokio::fs::read_to_string(&stats.path).await {
            Ok(raw) => match serde_json::from_str::<Totals>(&raw) {
                Ok(totals) => {
                    stats.inner.lock().await.totals = totals;
                }
                Err(e) => tracing::warn!("[STATS] Stats file unreadable: {}", e),
            },
            Err(_) => {}
        }
        stats
    }

    /// CJK text packs far more meaning per char than Latin text; weigh the
    /// two classes separately.
    pub fn estimate_text_tokens(text: &str) -> u32 {
        if text.is_empty() {
            return 0;
        }
        let cjk = text
            .chars()
            .filter(|c| ('\u{4e00}'..='\u{9fff}').contains(c))
            .count();
        let other = text.chars().count() - cjk;
        let estimate = cjk as f64 / CHARS_PER_TOKEN_CJK + other as f64 / CHARS_PER_TOKEN_LATIN;
        (estimate as u32).max(1)
    }

    pub fn estimate_messages_tokens(messages: &[ChatMessage]) -> u32 {
        let mut total = 0u32;
        for msg in messages {
            total += TOKENS_PER_MESSAGE_OVERHEAD;
            match &msg.content {
                MessageContent::Text(s) => total += Self::estimate_text_tokens(s),
                MessageContent::Parts(parts) => {
                    for part in parts {
                        match part {
                            ContentPart::Text { text } => {
                                total += Self::estimate_text_tokens(text)
                            }
                            ContentPart::ImageUrl { .. } => total += TOKENS_PER_IMAGE_PART,
                            ContentPart::Unknown => {}
                        }
                    }
                }
                MessageContent::Null => {}
            }
        }
        total
    }

    /// Records one finished request and persists the running totals.
    pub async fn update(&self, prompt_tokens: u32, completion_tokens: u32) {
        let totals = {
            let mut inner = self.inner.lock().await;
            inner.totals.total_requests += 1;
            inner.totals.prompt_tokens += prompt_tokens as u64;
            inner.totals.completion_tokens += completion_tokens as u64;
            inner.totals.total_tokens += (prompt_tokens + completion_tokens) as u64;
            inner.current_prompt = prompt_tokens;
            inner.current_completion = completion_tokens;
            inner.totals.clone()
        };

        match serde_json::to_string_pretty(&totals) {
            Ok(raw) => {
                if let Err(e) = tokio::fs::write(&self.path, raw).await {
                    tracing::warn!("[STATS] Stats write failed: {}", e);
                }
            }
            Err(e) => tracing::warn!("[STATS] Stats serialization failed: {}", e),
        }
    }

    /// Usage of the most recently accounted request.
    pub async fn current_usage(&self) -> Usage {
        let inner = self.inner.lock().await;
        Usage {
            prompt_tokens: inner.current_prompt,
            completion_tokens: inner.current_completion,
            total_tokens: inner.current_prompt + inner.current_completion,
        }
    }

    pub async fn summary(&self) -> serde_json::Value {
        let inner = self.inner.lock().await;
        serde_json::json!({
            "total_requests": inner.totals.total_requests,
            "total_tokens": inner.totals.total_tokens,
            "prompt_tokens": inner.totals.prompt_tokens,
            "completion_tokens": inner.totals.completion_tokens,
        })
    }
}
