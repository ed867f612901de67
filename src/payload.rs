use crate::config::{ModelTable, ResolvedModel, ThinkingMode};
use crate::constants::{
    DEFAULT_MAX_OUTPUT_TOKENS, MIN_OUTPUT_TOKENS, THINKING_BUDGET_HIGH, THINKING_BUDGET_LOW,
};
use crate::credentials::Harvest;
use crate::images::{extract_inline_images, has_inline_image};
use crate::types::{
    ChatMessage, ChatRequest, ContentPart, MessageContent, PeriscopeError, Result, Role,
};
use serde_json::{json, Map, Value};

/// Safety categories forced open on every request; the harvested session may
/// carry stricter browser-side settings.
const SAFETY_CATEGORIES: &[&str] = &[
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
    "HARM_CATEGORY_CIVIC_INTEGRITY",
];

pub struct BuiltMessages {
    pub system_instruction: String,
    pub contents: Vec<Value>,
}

/// Converts client chat messages into the backend's content shape. Assistant
/// messages carrying generated images are stripped to placeholders, and the
/// collected images are re-injected ahead of the final user turn so the
/// backend sees its own prior outputs.
pub fn build_messages(messages: &[ChatMessage], tools: Option<&[crate::types::ToolDefinition]>) -> BuiltMessages {
    let mut system_instruction = String::new();
    let mut contents: Vec<Value> = Vec::new();

    let mut history_images: Vec<(usize, Value)> = Vec::new();
    let mut last_user_index = None;
    let mut assistant_turn = 0usize;
    for (i, msg) in messages.iter().enumerate() {
        match msg.role {
            Role::User => last_user_index = Some(i),
            Role::Assistant => {
                assistant_turn += 1;
                if let MessageContent::Text(text) = &msg.content {
                    if has_inline_image(text) {
                        let (_, parts) = extract_inline_images(text);
                        for part in parts {
                            history_images.push((assistant_turn, part));
                        }
                    }
                }
            }
            _ => {}
        }
    }
    if !history_images.is_empty() {
        tracing::info!(
            "[PAYLOAD] Collected {} generated image(s) from history",
            history_images.len()
        );
    }

    for (i, msg) in messages.iter().enumerate() {
        match msg.role {
            Role::System => {
                let text = msg.content.as_text();
                if !text.is_empty() {
                    system_instruction.push_str(&text);
                    system_instruction.push('\n');
                }
            }
            Role::User => {
                let mut parts: Vec<Value> = Vec::new();
                if Some(i) == last_user_index && !history_images.is_empty() {
                    inject_history_images(&mut parts, &history_images);
                }
                push_user_parts(&mut parts, &msg.content);
                contents.push(json!({ "role": "user", "parts": parts }));
            }
            Role::Assistant => {
                if let Some(entry) = build_assistant_entry(&msg.content) {
                    contents.push(entry);
                }
            }
            Role::Tool => {
                // Tool results ride along as user-visible text; the backend
                // has no native tool channel.
                let text = msg.content.as_text();
                if !text.is_empty() {
                    contents.push(json!({ "role": "user", "parts": [{"text": text}] }));
                }
            }
        }
    }

    if let Some(tools) = tools {
        if !tools.is_empty() {
            system_instruction.push_str(&render_tools_block(tools));
        }
    }

    BuiltMessages {
        system_instruction: system_instruction.trim().to_string(),
        contents,
    }
}

fn inject_history_images(parts: &mut Vec<Value>, images: &[(usize, Value)]) {
    parts.push(json!({
        "text": format!("[{} previously generated image(s) follow:]", images.len())
    }));
    let mut current_turn = 0;
    for (turn, part) in images {
        if *turn != current_turn {
            current_turn = *turn;
            parts.push(json!({ "text": format!("[Images from turn {}:]", turn) }));
        }
        parts.push(part.clone());
    }
    parts.push(json!({ "text": "[End of prior images; the new request follows:]" }));
    tracing::info!("[PAYLOAD] Re-injected {} historical image(s)", images.len());
}

fn push_user_parts(parts: &mut Vec<Value>, content: &MessageContent) {
    match content {
        MessageContent::Text(s) => {
            parts.push(json!({ "text": s }));
        }
        MessageContent::Parts(raw_parts) => {
            for part in raw_parts {
                match part {
                    ContentPart::Text { text } => parts.push(json!({ "text": text })),
                    ContentPart::ImageUrl { image_url } => {
                        if let Some(encoded) = image_url.url.strip_prefix("data:") {
                            if let Some((header, data)) = encoded.split_once(',') {
                                let mime = header.split(';').next().unwrap_or("image/png");
                                parts.push(json!({
                                    "inlineData": { "mimeType": mime, "data": data }
                                }));
                            }
                        }
                    }
                    ContentPart::Unknown => {}
                }
            }
        }
        MessageContent::Null => {}
    }
}

fn build_assistant_entry(content: &MessageContent) -> Option<Value> {
    let text = content.as_text();
    if text.is_empty() {
        return None;
    }
    if has_inline_image(&text) {
        let (cleaned, _) = extract_inline_images(&text);
        let cleaned = cleaned.trim();
        let body = if cleaned.is_empty() {
            "[image generated]".to_string()
        } else {
            cleaned.to_string()
        };
        Some(json!({ "role": "model", "parts": [{"text": body}] }))
    } else {
        Some(json!({ "role": "model", "parts": [{"text": text}] }))
    }
}

/// Advertises tools inside the system instruction as an XML block; the model
/// answers with a `<tool_calls>` block that the aggregate path surfaces
/// verbatim.
fn render_tools_block(tools: &[crate::types::ToolDefinition]) -> String {
    tracing::info!("[PAYLOAD] Injecting {} tool definition(s)", tools.len());
    let mut xml = String::from("\n\n<available_tools>\n");
    for tool in tools {
        xml.push_str("  <tool>\n");
        xml.push_str(&format!("    <name>{}</name>\n", tool.function.name));
        xml.push_str(&format!(
            "    <description>{}</description>\n",
            tool.function.description
        ));
        xml.push_str(&format!(
            "    <parameters>{}</parameters>\n",
            tool.function.parameters
        ));
        xml.push_str("  </tool>\n");
    }
    xml.push_str("</available_tools>\n");
    xml.push_str("\nIMPORTANT: To use a tool, you MUST output a <tool_calls> block. ");
    xml
}

/// Builds the outbound request from the harvested template, overwriting only
/// conversation content, system instruction, generation parameters, tool
/// text, and safety thresholds. Everything else the browser sent stays
/// untouched.
pub fn build_request_body(
    harvest: &Harvest,
    request: &ChatRequest,
    models: &ModelTable,
) -> Result<Value> {
    let template = harvest
        .body
        .as_object()
        .ok_or_else(|| PeriscopeError::InvalidHarvest("body template is not an object".into()))?;

    let mut variables = template
        .get("variables")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    let resolved = models.resolve(&request.model);
    let built = build_messages(&request.messages, request.tools.as_deref());

    variables.insert("contents".into(), Value::Array(built.contents));
    if !built.system_instruction.is_empty() {
        variables.insert(
            "systemInstruction".into(),
            json!({ "parts": [{"text": built.system_instruction}] }),
        );
    }
    variables.insert(
        "safetySettings".into(),
        Value::Array(
            SAFETY_CATEGORIES
                .iter()
                .map(|c| json!({ "category": c, "threshold": "BLOCK_NONE" }))
                .collect(),
        ),
    );
    variables.insert("model".into(), Value::String(resolved.backend_model.clone()));

    let mut gen_config = variables
        .get("generationConfig")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    apply_generation_config(&mut gen_config, &resolved, request);
    variables.insert("generationConfig".into(), Value::Object(gen_config));

    Ok(json!({
        "querySignature": template.get("querySignature").cloned().unwrap_or(Value::Null),
        "operationName": template.get("operationName").cloned().unwrap_or(Value::Null),
        "variables": variables,
    }))
}

fn apply_generation_config(
    gen_config: &mut Map<String, Value>,
    resolved: &ResolvedModel,
    request: &ChatRequest,
) {
    match resolved.thinking {
        Some(mode) => {
            let budget = match mode {
                ThinkingMode::Low => THINKING_BUDGET_LOW,
                ThinkingMode::High => THINKING_BUDGET_HIGH,
            };
            gen_config.insert(
                "thinkingConfig".into(),
                json!({
                    "includeThoughts": true,
                    "budget_token_count": budget,
                    "thinkingBudget": budget,
                }),
            );
            tracing::info!("[PAYLOAD] Thinking mode {:?}, budget {}", mode, budget);
        }
        None => {
            // A client max_tokens on the flagship model doubles as a thinking
            // budget request.
            if resolved.backend_model.contains("gemini-3-pro") {
                if let Some(max_tokens) = request.max_tokens {
                    gen_config.insert(
                        "thinkingConfig".into(),
                        json!({
                            "includeThoughts": true,
                            "budget_token_count": max_tokens,
                            "thinkingBudget": max_tokens,
                        }),
                    );
                } else {
                    gen_config.remove("thinkingConfig");
                    gen_config.remove("thinking_config");
                }
            } else {
                // Stale thinking config from a harvested session is invalid
                // on non-thinking models.
                gen_config.remove("thinkingConfig");
                gen_config.remove("thinking_config");
            }
        }
    }

    if resolved.is_image_model() {
        let image_config = gen_config
            .entry("imageConfig")
            .or_insert_with(|| json!({}));
        if let Some(obj) = image_config.as_object_mut() {
            obj.insert("personGeneration".into(), json!("ALLOW_ALL"));
            obj.entry("imageOutputOptions")
                .or_insert_with(|| json!({ "mimeType": "image/png" }));
            match resolved.resolution.as_deref() {
                Some(size) => {
                    obj.insert("imageSize".into(), json!(size.to_uppercase()));
                }
                None => {
                    obj.remove("imageSize");
                }
            }
        }
        gen_config
            .entry("responseModalities")
            .or_insert_with(|| json!(["TEXT", "IMAGE"]));
    } else {
        for key in ["imageConfig", "sampleImageSize", "width", "height", "responseModalities"] {
            gen_config.remove(key);
        }
    }

    // Restore a sane output ceiling; browser sessions often carry a small
    // UI-imposed one.
    let current_max = gen_config
        .get("maxOutputTokens")
        .and_then(Value::as_i64);
    match current_max {
        Some(v) if v < MIN_OUTPUT_TOKENS => {
            gen_config.insert("maxOutputTokens".into(), json!(DEFAULT_MAX_OUTPUT_TOKENS));
        }
        Some(_) => {}
        None => {
            gen_config.insert("maxOutputTokens".into(), json!(DEFAULT_MAX_OUTPUT_TOKENS));
        }
    }

    if let Some(t) = request.temperature {
        gen_config.insert("temperature".into(), json!(t));
    }
    if let Some(p) = request.top_p {
        gen_config.insert("topP".into(), json!(p));
    }
    if let Some(k) = request.top_k {
        gen_config.insert("topK".into(), json!(k));
    }
    if let Some(max) = request.max_tokens {
        gen_config.insert("maxOutputTokens".into(), json!(max));
    }
    if let Some(stop) = request.stop.clone() {
        gen_config.insert("stopSequences".into(), json!(stop.into_vec()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn harvest_with_template() -> Harvest {
        Harvest {
            headers: HashMap::new(),
            cookie: None,
            url: "https://backend.example/generate".into(),
            body: json!({
                "querySignature": "sig-abc",
                "operationName": "GenerateContent",
                "variables": {
                    "model": "harvested-model",
                    "clientContext": {"sessionId": "browser-session"},
                    "generationConfig": {"maxOutputTokens": 1024, "thinkingConfig": {"old": true}}
                }
            }),
        }
    }

    fn user_request(model: &str) -> ChatRequest {
        ChatRequest {
            model: model.into(),
            messages: vec![
                ChatMessage {
                    role: Role::System,
                    content: MessageContent::Text("Be brief.".into()),
                },
                ChatMessage {
                    role: Role::User,
                    content: MessageContent::Text("Hello".into()),
                },
            ],
            stream: true,
            temperature: Some(0.5),
            top_p: None,
            top_k: None,
            max_tokens: None,
            stop: None,
            tools: None,
        }
    }

    #[test]
    fn test_template_fields_preserved() {
        let body = build_request_body(
            &harvest_with_template(),
            &user_request("gemini-2.5-flash"),
            &ModelTable::default(),
        )
        .expect("body builds");

        assert_eq!(body["querySignature"], "sig-abc");
        assert_eq!(body["operationName"], "GenerateContent");
        // Untouched template variables survive.
        assert_eq!(body["variables"]["clientContext"]["sessionId"], "browser-session");
    }

    #[test]
    fn test_conversation_overwritten() {
        let body = build_request_body(
            &harvest_with_template(),
            &user_request("gemini-2.5-flash"),
            &ModelTable::default(),
        )
        .expect("body builds");

        let contents = body["variables"]["contents"].as_array().expect("contents");
        assert_eq!(contents.len(), 1);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[0]["parts"][0]["text"], "Hello");
        assert_eq!(
            body["variables"]["systemInstruction"]["parts"][0]["text"],
            "Be brief."
        );
    }

    #[test]
    fn test_safety_thresholds_forced_open() {
        let body = build_request_body(
            &harvest_with_template(),
            &user_request("gemini-2.5-flash"),
            &ModelTable::default(),
        )
        .expect("body builds");

        let settings = body["variables"]["safetySettings"]
            .as_array()
            .expect("safety settings");
        assert_eq!(settings.len(), SAFETY_CATEGORIES.len());
        assert!(settings.iter().all(|s| s["threshold"] == "BLOCK_NONE"));
    }

    #[test]
    fn test_low_output_ceiling_raised() {
        let body = build_request_body(
            &harvest_with_template(),
            &user_request("gemini-2.5-flash"),
            &ModelTable::default(),
        )
        .expect("body builds");
        assert_eq!(
            body["variables"]["generationConfig"]["maxOutputTokens"],
            DEFAULT_MAX_OUTPUT_TOKENS
        );
    }

    #[test]
    fn test_stale_thinking_config_removed() {
        let body = build_request_body(
            &harvest_with_template(),
            &user_request("gemini-2.5-flash"),
            &ModelTable::default(),
        )
        .expect("body builds");
        assert!(body["variables"]["generationConfig"]
            .get("thinkingConfig")
            .is_none());
    }

    #[test]
    fn test_thinking_suffix_sets_budget() {
        let body = build_request_body(
            &harvest_with_template(),
            &user_request("gemini-3-pro-high"),
            &ModelTable::default(),
        )
        .expect("body builds");
        let config = &body["variables"]["generationConfig"]["thinkingConfig"];
        assert_eq!(config["includeThoughts"], true);
        assert_eq!(config["thinkingBudget"], THINKING_BUDGET_HIGH);
        assert_eq!(body["variables"]["model"], "gemini-3-pro");
    }

    #[test]
    fn test_image_model_config() {
        let body = build_request_body(
            &harvest_with_template(),
            &user_request("gemini-image-gen-2k"),
            &ModelTable::default(),
        )
        .expect("body builds");
        let config = &body["variables"]["generationConfig"];
        assert_eq!(config["imageConfig"]["imageSize"], "2K");
        assert_eq!(config["imageConfig"]["personGeneration"], "ALLOW_ALL");
        assert_eq!(config["responseModalities"][0], "TEXT");
        assert_eq!(body["variables"]["model"], "gemini-image-gen");
    }

    #[test]
    fn test_generation_params_applied() {
        let mut request = user_request("gemini-2.5-flash");
        request.max_tokens = Some(2048);
        request.stop = Some(crate::types::StopSequences::One("END".into()));
        let body = build_request_body(
            &harvest_with_template(),
            &request,
            &ModelTable::default(),
        )
        .expect("body builds");
        let config = &body["variables"]["generationConfig"];
        assert_eq!(config["temperature"], 0.5);
        assert_eq!(config["maxOutputTokens"], 2048);
        assert_eq!(config["stopSequences"][0], "END");
    }

    #[test]
    fn test_tools_injected_into_system_instruction() {
        let mut request = user_request("gemini-2.5-flash");
        request.tools = Some(vec![crate::types::ToolDefinition {
            function: crate::types::ToolFunction {
                name: "read_file".into(),
                description: "Reads a file".into(),
                parameters: json!({"type": "object"}),
            },
            extra: serde_json::Map::new(),
        }]);
        let body = build_request_body(
            &harvest_with_template(),
            &request,
            &ModelTable::default(),
        )
        .expect("body builds");
        let instruction = body["variables"]["systemInstruction"]["parts"][0]["text"]
            .as_str()
            .expect("instruction");
        assert!(instruction.contains("<available_tools>"));
        assert!(instruction.contains("<name>read_file</name>"));
        assert!(instruction.contains("<tool_calls>"));
    }

    #[test]
    fn test_assistant_images_replaced_and_reinjected() {
        let messages = vec![
            ChatMessage {
                role: Role::User,
                content: MessageContent::Text("draw a cat".into()),
            },
            ChatMessage {
                role: Role::Assistant,
                content: MessageContent::Text(
                    "![Generated Image](data:image/png;base64,QUJDRA==)".into(),
                ),
            },
            ChatMessage {
                role: Role::User,
                content: MessageContent::Text("make it bigger".into()),
            },
        ];
        let built = build_messages(&messages, None);

        // The assistant turn is reduced to a placeholder...
        let model_turn = built
            .contents
            .iter()
            .find(|c| c["role"] == "model")
            .expect("model turn");
        let model_text = model_turn["parts"][0]["text"].as_str().expect("text");
        assert!(!model_text.contains("base64"));

        // ...and the raw image rides with the final user turn.
        let last_user = built.contents.last().expect("final user turn");
        let parts = last_user["parts"].as_array().expect("parts");
        assert!(parts
            .iter()
            .any(|p| p.get("inlineData").map(|d| d["data"] == "QUJDRA==").unwrap_or(false)));
    }

    #[test]
    fn test_inline_data_url_becomes_part() {
        let messages = vec![ChatMessage {
            role: Role::User,
            content: MessageContent::Parts(vec![
                ContentPart::Text {
                    text: "what is this".into(),
                },
                ContentPart::ImageUrl {
                    image_url: crate::types::ImageUrl {
                        url: "data:image/jpeg;base64,L2o=".into(),
                    },
                },
            ]),
        }];
        let built = build_messages(&messages, None);
        let parts = built.contents[0]["parts"].as_array().expect("parts");
        assert_eq!(parts[1]["inlineData"]["mimeType"], "image/jpeg");
        assert_eq!(parts[1]["inlineData"]["data"], "L2o=");
    }
}
