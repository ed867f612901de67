use crate::types::{OutputChoice, OutputChunk, OutputDelta, Role, Usage};

/// The protocol terminator sentinel, sent exactly once per stream.
pub const DONE_EVENT: &str = "data: [DONE]\n\n";

/// Builds output-protocol frames for one response. All chunks for a stream
/// share one `chatcmpl-` id derived from the conversation id.
pub struct SseFormatter {
    chunk_id: String,
}

impl SseFormatter {
    pub fn new(conversation_id: &str) -> Self {
        let short: String = conversation_id.chars().take(8).collect();
        Self {
            chunk_id: format!("chatcmpl-{}", short),
        }
    }

    fn base_chunk(&self, model: &str) -> OutputChunk {
        OutputChunk {
            id: self.chunk_id.clone(),
            object: "chat.completion.chunk",
            created: chrono::Utc::now().timestamp(),
            model: model.to_string(),
            choices: Vec::new(),
            usage: None,
        }
    }

    fn frame(&self, chunk: &OutputChunk) -> String {
        // OutputChunk serialization cannot fail: every field is a plain type.
        let json = serde_json::to_string(chunk).unwrap_or_else(|_| "{}".to_string());
        format!("data: {}\n\n", json)
    }

    /// The initial frame announcing the assistant role; exactly one per
    /// response, before any content.
    pub fn role_frame(&self, model: &str) -> String {
        let mut chunk = self.base_chunk(model);
        chunk.choices.push(OutputChoice {
            index: 0,
            delta: OutputDelta {
                role: Some(Role::Assistant),
                ..OutputDelta::default()
            },
            finish_reason: None,
        });
        self.frame(&chunk)
    }

    pub fn content_frame(&self, model: &str, content: &str) -> String {
        let mut chunk = self.base_chunk(model);
        chunk.choices.push(OutputChoice {
            index: 0,
            delta: OutputDelta {
                content: Some(content.to_string()),
                ..OutputDelta::default()
            },
            finish_reason: None,
        });
        self.frame(&chunk)
    }

    pub fn reasoning_frame(&self, model: &str, reasoning: &str) -> String {
        let mut chunk = self.base_chunk(model);
        chunk.choices.push(OutputChoice {
            index: 0,
            delta: OutputDelta {
                reasoning_content: Some(reasoning.to_string()),
                ..OutputDelta::default()
            },
            finish_reason: None,
        });
        self.frame(&chunk)
    }

    pub fn finish_frame(&self, model: &str, finish_reason: &str) -> String {
        let mut chunk = self.base_chunk(model);
        chunk.choices.push(OutputChoice {
            index: 0,
            delta: OutputDelta::default(),
            finish_reason: Some(finish_reason.to_string()),
        });
        self.frame(&chunk)
    }

    /// Empty-delta keepalive for clients with idle timeouts.
    pub fn heartbeat_frame(&self, model: &str) -> String {
        let mut chunk = self.base_chunk(model);
        chunk.choices.push(OutputChoice {
            index: 0,
            delta: OutputDelta::default(),
            finish_reason: None,
        });
        self.frame(&chunk)
    }

    /// Final accounting frame carrying usage, no delta.
    pub fn usage_frame(&self, model: &str, usage: Usage) -> String {
        let mut chunk = self.base_chunk(model);
        chunk.choices.push(OutputChoice {
            index: 0,
            delta: OutputDelta::default(),
            finish_reason: None,
        });
        chunk.usage = Some(usage);
        self.frame(&chunk)
    }

    /// Error payload frame; `kind` follows the client-visible taxonomy
    /// (authentication_error, upstream_error, request_error).
    pub fn error_frame(&self, message: &str, kind: &str) -> String {
        let payload = serde_json::json!({
            "error": { "message": message, "type": kind }
        });
        format!("data: {}\n\n", payload)
    }
}

/// Backend finish codes → output protocol codes. Unknown codes degrade to a
/// plain stop.
pub fn map_finish_reason(backend_reason: &str) -> &'static str {
    match backend_reason {
        "STOP" => "stop",
        "MAX_TOKENS" => "length",
        "SAFETY" => "content_filter",
        "RECITATION" => "stop",
        "OTHER" => "stop",
        _ => "stop",
    }
}
