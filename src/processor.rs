use crate::constants::{HEARTBEAT_INTERVAL_SECS, TAIL_WINDOW_CHARS};
use crate::diff::DiffBlockHandler;
use crate::images::fix_base64_padding;
use crate::parser::IncrementalJsonParser;
use crate::sse::{map_finish_reason, SseFormatter};
use crate::tracker::PathIndexTracker;
use crate::types::{PeriscopeError, Result, UpstreamEnvelope, UpstreamResult};
use std::time::{Duration, Instant};

#[derive(Debug, Default, Clone)]
pub struct ProcessorStats {
    pub envelopes_processed: u64,
    pub frames_emitted: u64,
    pub duplicates_filtered: u64,
    pub prefix_trimmed_chars: u64,
    pub backend_errors: u64,
    pub content_chars: u64,
    pub reasoning_chars: u64,
}

/// Bounded window over the most recent plain-text output; trims deltas whose
/// prefix repeats the window's suffix. The backend re-sends trailing
/// fragments after internal retries.
struct TailWindow {
    chars: Vec<char>,
    capacity: usize,
}

impl TailWindow {
    fn new(capacity: usize) -> Self {
        Self {
            chars: Vec::new(),
            capacity,
        }
    }

    /// Returns `content` with the longest overlap between the window suffix
    /// and the content prefix removed, plus the overlap length.
    fn trim<'a>(&self, content: &'a str) -> (&'a str, usize) {
        if self.chars.is_empty() || content.is_empty() {
            return (content, 0);
        }
        let incoming: Vec<char> = content.chars().collect();
        let max_overlap = self.chars.len().min(incoming.len());
        let mut overlap = 0;
        for i in 1..=max_overlap {
            if self.chars[self.chars.len() - i..] == incoming[..i] {
                overlap = i;
            }
        }
        if overlap == 0 {
            return (content, 0);
        }
        let byte_offset: usize = incoming[..overlap].iter().map(|c| c.len_utf8()).sum();
        (&content[byte_offset..], overlap)
    }

    fn extend(&mut self, content: &str) {
        self.chars.extend(content.chars());
        if self.chars.len() > self.capacity {
            let excess = self.chars.len() - self.capacity;
            self.chars.drain(..excess);
        }
    }
}

/// Per-request pipeline: raw backend text in, ordered output-protocol frames
/// out. Owns its parser/tracker/diff state; instances are never reused
/// across requests.
pub struct StreamProcessor {
    model: String,
    formatter: SseFormatter,
    parser: IncrementalJsonParser,
    tracker: PathIndexTracker,
    diff: DiffBlockHandler,
    tail: TailWindow,
    heartbeat_enabled: bool,
    heartbeat_interval: Duration,
    last_emit: Instant,
    role_sent: bool,
    content_sent: bool,
    stats: ProcessorStats,
}

impl StreamProcessor {
    pub fn new(model: &str) -> Self {
        Self::with_heartbeat(model, true, Duration::from_secs(HEARTBEAT_INTERVAL_SECS))
    }

    pub fn with_heartbeat(model: &str, enabled: bool, interval: Duration) -> Self {
        let conversation_id = uuid::Uuid::new_v4().to_string();
        Self {
            model: model.to_string(),
            formatter: SseFormatter::new(&conversation_id),
            parser: IncrementalJsonParser::new(),
            tracker: PathIndexTracker::new(),
            diff: DiffBlockHandler::new(),
            tail: TailWindow::new(TAIL_WINDOW_CHARS),
            heartbeat_enabled: enabled,
            heartbeat_interval: interval,
            last_emit: Instant::now(),
            role_sent: false,
            content_sent: false,
            stats: ProcessorStats::default(),
        }
    }

    /// True once any real content or image delta has left the pipeline.
    /// Role and heartbeat frames do not count.
    pub fn content_sent(&self) -> bool {
        self.content_sent
    }

    pub fn stats(&self) -> &ProcessorStats {
        &self.stats
    }

    pub fn tracker_stats(&self) -> crate::tracker::TrackerStats {
        self.tracker.stats()
    }

    /// Feeds one aggregated text segment. Raises only on authentication
    /// failure; every other backend anomaly is absorbed.
    pub fn feed(&mut self, segment: &str) -> Result<Vec<String>> {
        let mut frames = Vec::new();
        for value in self.parser.feed(segment) {
            frames.extend(self.handle_envelope(value)?);
        }
        Ok(frames)
    }

    /// Injects a keepalive when nothing has been emitted for the configured
    /// interval. Called by the orchestrator between transport chunks.
    pub fn maybe_heartbeat(&mut self) -> Option<String> {
        if !self.heartbeat_enabled || self.last_emit.elapsed() < self.heartbeat_interval {
            return None;
        }
        self.last_emit = Instant::now();
        Some(self.formatter.heartbeat_frame(&self.model))
    }

    fn handle_envelope(&mut self, value: serde_json::Value) -> Result<Vec<String>> {
        self.stats.envelopes_processed += 1;

        let envelope: UpstreamEnvelope = match serde_json::from_value(value) {
            Ok(env) => env,
            Err(e) => {
                tracing::debug!("[STREAM] Unrecognized envelope shape: {}", e);
                return Ok(Vec::new());
            }
        };

        if let Some(err) = envelope.error {
            tracing::debug!("[STREAM] Backend envelope error: {}", err);
            self.stats.backend_errors += 1;
            return Ok(Vec::new());
        }

        let mut indexed: Vec<(i64, UpstreamResult)> = envelope
            .results
            .into_iter()
            .map(|r| (r.path_index(), r))
            .collect();
        // Ascending path order; index-less results sort last.
        indexed.sort_by_key(|(idx, _)| if *idx >= 0 { *idx } else { i64::MAX });

        let mut frames = Vec::new();
        for (path_index, result) in indexed {
            frames.extend(self.handle_result(path_index, result)?);
        }
        Ok(frames)
    }

    fn handle_result(&mut self, path_index: i64, result: UpstreamResult) -> Result<Vec<String>> {
        let mut frames = Vec::new();

        if !result.errors.is_empty() {
            for err in &result.errors {
                tracing::warn!("[STREAM] Backend result error: {}", err.message);
                self.stats.backend_errors += 1;
                if err.looks_like_auth_failure() {
                    return Err(PeriscopeError::Authentication(err.message.clone()).into());
                }
            }
            // Only this result entry is skipped; the stream continues.
            return Ok(frames);
        }

        let data = match result.data {
            Some(data) => data,
            None => return Ok(frames),
        };

        for candidate in data.candidates {
            if let Some(content) = candidate.content {
                for part in content.parts {
                    if let Some(text) = part.text.as_deref() {
                        if !text.is_empty() {
                            frames.extend(self.handle_text(path_index, text, part.thought));
                        }
                    }

                    if let Some(inline) = part.inline_data {
                        if let (Some(mime), Some(data)) = (inline.mime_type, inline.data) {
                            let payload = fix_base64_padding(&data);
                            let markdown =
                                format!("![Generated Image](data:{};base64,{})", mime, payload);
                            frames.extend(self.yield_raw(&markdown));
                        }
                    } else if let Some(uri) = part.uri {
                        let markdown = format!("![Generated Image]({})", uri);
                        frames.extend(self.yield_raw(&markdown));
                    }
                }
            }

            if let Some(reason) = candidate.finish_reason.as_deref() {
                self.ensure_role(&mut frames);
                let mapped = map_finish_reason(reason);
                frames.push(self.formatter.finish_frame(&self.model, mapped));
                self.mark_emit();
            }
        }

        Ok(frames)
    }

    fn handle_text(&mut self, path_index: i64, text: &str, is_thought: bool) -> Vec<String> {
        let mut frames = Vec::new();

        let delta = if path_index >= 0 {
            match self.tracker.process(path_index, text, is_thought) {
                Some(delta) => delta,
                None => {
                    self.stats.duplicates_filtered += 1;
                    return frames;
                }
            }
        } else {
            text.to_string()
        };

        if is_thought {
            frames.extend(self.yield_text(&delta, true));
        } else {
            // Answer text passes through the diff handler so fenced blocks
            // leave as single frames.
            for (segment, _is_diff) in self.diff.process(&delta) {
                frames.extend(self.yield_text(&segment, false));
            }
        }
        frames
    }

    /// Emits a text delta with role bookkeeping and tail-window trimming.
    fn yield_text(&mut self, content: &str, is_reasoning: bool) -> Vec<String> {
        let mut frames = Vec::new();
        if content.is_empty() {
            return frames;
        }
        self.ensure_role(&mut frames);

        let (trimmed, overlap) = self.tail.trim(content);
        if overlap > 0 {
            self.stats.prefix_trimmed_chars += overlap as u64;
        }
        if trimmed.is_empty() {
            self.stats.duplicates_filtered += 1;
            return frames;
        }

        let frame = if is_reasoning {
            self.stats.reasoning_chars += trimmed.chars().count() as u64;
            self.formatter.reasoning_frame(&self.model, trimmed)
        } else {
            self.stats.content_chars += trimmed.chars().count() as u64;
            self.formatter.content_frame(&self.model, trimmed)
        };

        self.tail.extend(trimmed);
        self.content_sent = true;
        self.stats.frames_emitted += 1;
        self.mark_emit();
        frames.push(frame);
        frames
    }

    /// Emits binary/image content untouched: no trimming, and the tail
    /// window is left alone so encoded payloads cannot poison text dedup.
    fn yield_raw(&mut self, content: &str) -> Vec<String> {
        let mut frames = Vec::new();
        if content.is_empty() {
            return frames;
        }
        self.ensure_role(&mut frames);
        frames.push(self.formatter.content_frame(&self.model, content));
        self.content_sent = true;
        self.stats.frames_emitted += 1;
        self.stats.content_chars += content.chars().count() as u64;
        self.mark_emit();
        frames
    }

    fn ensure_role(&mut self, frames: &mut Vec<String>) {
        if !self.role_sent {
            self.role_sent = true;
            frames.push(self.formatter.role_frame(&self.model));
            self.mark_emit();
        }
    }

    fn mark_emit(&mut self) {
        self.last_emit = Instant::now();
    }

    /// End-of-stream flush cascade: final parse attempt, forced diff close,
    /// tracker drains, and the empty-response fallback. Never emits the
    /// protocol terminator; that belongs to the orchestrator. Auth errors at
    /// this point are logged, not raised: the stream is already over.
    pub fn finish(&mut self) -> Vec<String> {
        let mut frames = Vec::new();

        for value in self.parser.flush() {
            match self.handle_envelope(value) {
                Ok(more) => frames.extend(more),
                Err(e) => {
                    tracing::warn!("[STREAM] Error in trailing envelope: {}", e);
                }
            }
        }

        if let Some((segment, _is_diff)) = self.diff.flush() {
            tracing::debug!("[STREAM] Diff handler flushed {} chars", segment.len());
            frames.extend(self.yield_text(&segment, false));
        }

        for (path_index, pending, is_thought) in self.tracker.pending() {
            tracing::debug!(
                "[STREAM] Tracker flushed {} chars for path {}",
                pending.len(),
                path_index
            );
            frames.extend(self.yield_text(&pending, is_thought));
        }

        if !self.content_sent {
            tracing::debug!("[STREAM] No content produced, sending empty response");
            self.ensure_role(&mut frames);
            frames.push(self.formatter.content_frame(&self.model, ""));
            frames.push(self.formatter.finish_frame(&self.model, "stop"));
        }

        frames
    }

    pub fn error_frame(&self, message: &str, kind: &str) -> String {
        self.formatter.error_frame(message, kind)
    }

    pub fn usage_frame(&self, usage: crate::types::Usage) -> String {
        self.formatter.usage_frame(&self.model, usage)
    }

    pub fn log_summary(&self) {
        let tracker = self.tracker.stats();
        tracing::info!(
            "[STREAM END] Frames: {} | Content: {} chars | Reasoning: {} chars | Dupes: {} | Trimmed: {} | Backtracks: {}",
            self.stats.frames_emitted,
            self.stats.content_chars,
            self.stats.reasoning_chars,
            self.stats.duplicates_filtered,
            self.stats.prefix_trimmed_chars,
            tracker.backtrack_events,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta_of(frame: &str) -> serde_json::Value {
        let data = frame
            .strip_prefix("data: ")
            .and_then(|r| r.strip_suffix("\n\n"))
            .expect("SSE frame");
        let chunk: serde_json::Value = serde_json::from_str(data).expect("JSON payload");
        chunk["choices"][0]["delta"].clone()
    }

    fn envelope_line(path_index: i64, text: &str, thought: bool) -> String {
        let part = if thought {
            serde_json::json!({"text": text, "thought": true})
        } else {
            serde_json::json!({"text": text})
        };
        serde_json::json!({
            "results": [{
                "path": [0, 0, path_index],
                "data": {"candidates": [{"content": {"parts": [part]}}]}
            }]
        })
        .to_string()
            + "\n"
    }

    #[test]
    fn test_role_frame_emitted_once_before_content() {
        let mut proc = StreamProcessor::new("m");
        let frames = proc.feed(&envelope_line(0, "hello", false)).expect("feed");
        assert_eq!(frames.len(), 2);
        assert_eq!(delta_of(&frames[0])["role"], "assistant");
        assert_eq!(delta_of(&frames[1])["content"], "hello");

        let frames = proc
            .feed(&envelope_line(0, "hello again", false))
            .expect("feed");
        assert_eq!(frames.len(), 1);
        assert_eq!(delta_of(&frames[0])["content"], " again");
    }

    #[test]
    fn test_cumulative_snapshots_deduplicated() {
        let mut proc = StreamProcessor::new("m");
        proc.feed(&envelope_line(0, "abc", false)).expect("feed");
        let frames = proc.feed(&envelope_line(0, "abc", false)).expect("feed");
        assert!(frames.is_empty());
        assert!(proc.stats().duplicates_filtered > 0);
    }

    #[test]
    fn test_thought_routed_to_reasoning_field() {
        let mut proc = StreamProcessor::new("m");
        let frames = proc.feed(&envelope_line(2, "pondering", true)).expect("feed");
        let delta = delta_of(frames.last().expect("frame"));
        assert_eq!(delta["reasoning_content"], "pondering");
        assert!(delta.get("content").is_none());
    }

    #[test]
    fn test_trailing_overlap_trimmed() {
        let mut proc = StreamProcessor::new("m");
        // Two different channels so the tracker does not dedupe; the tail
        // window must catch the overlap across channels.
        proc.feed(&envelope_line(0, "hello wor", false)).expect("feed");
        let frames = proc.feed(&envelope_line(1, "world", false)).expect("feed");
        assert_eq!(delta_of(&frames[0])["content"], "ld");
    }

    #[test]
    fn test_no_overlap_passes_unchanged() {
        let mut proc = StreamProcessor::new("m");
        proc.feed(&envelope_line(0, "abc", false)).expect("feed");
        let frames = proc.feed(&envelope_line(1, "xyz", false)).expect("feed");
        assert_eq!(delta_of(&frames[0])["content"], "xyz");
    }

    #[test]
    fn test_auth_error_raised() {
        let mut proc = StreamProcessor::new("m");
        let line = serde_json::json!({
            "results": [{
                "path": [0, 0, 0],
                "errors": [{"message": "Recaptcha verification required"}]
            }]
        })
        .to_string()
            + "\n";
        let result = proc.feed(&line);
        match result {
            Err(e) => assert!(matches!(e.inner, PeriscopeError::Authentication(_))),
            Ok(_) => panic!("expected authentication error"),
        }
    }

    #[test]
    fn test_non_auth_error_skips_entry_only() {
        let mut proc = StreamProcessor::new("m");
        let line = serde_json::json!({
            "results": [
                {"path": [0, 0, 0], "errors": [{"message": "quota exhausted"}]},
                {"path": [0, 0, 1], "data": {"candidates": [{"content": {"parts": [{"text": "still here"}]}}]}}
            ]
        })
        .to_string()
            + "\n";
        let frames = proc.feed(&line).expect("stream continues");
        let texts: Vec<_> = frames.iter().map(|f| delta_of(f)).collect();
        assert!(texts.iter().any(|d| d["content"] == "still here"));
    }

    #[test]
    fn test_image_part_padded_and_untrimmed() {
        let mut proc = StreamProcessor::new("m");
        // Prime the tail window with text that would overlap the markdown.
        proc.feed(&envelope_line(0, "![Gen", false)).expect("feed");

        let line = serde_json::json!({
            "results": [{
                "path": [0, 0, 1],
                "data": {"candidates": [{"content": {"parts": [
                    {"inlineData": {"mimeType": "image/png", "data": "aGVsbG8gd2"}}
                ]}}]}
            }]
        })
        .to_string()
            + "\n";
        let frames = proc.feed(&line).expect("feed");
        let content = delta_of(frames.last().expect("frame"))["content"]
            .as_str()
            .expect("content string")
            .to_string();
        // Untrimmed (full marker survives) and padded to a multiple of 4.
        assert!(content.starts_with("![Generated Image](data:image/png;base64,"));
        let payload = content
            .split("base64,")
            .nth(1)
            .and_then(|s| s.strip_suffix(')'))
            .expect("payload");
        assert_eq!(payload.len() % 4, 0);
    }

    #[test]
    fn test_finish_reason_mapped_and_emitted() {
        let mut proc = StreamProcessor::new("m");
        let line = serde_json::json!({
            "results": [{
                "path": [0, 0, 0],
                "data": {"candidates": [{
                    "content": {"parts": [{"text": "done"}]},
                    "finishReason": "MAX_TOKENS"
                }]}
            }]
        })
        .to_string()
            + "\n";
        let frames = proc.feed(&line).expect("feed");
        let last = frames.last().expect("finish frame");
        let chunk: serde_json::Value = serde_json::from_str(
            last.strip_prefix("data: ").unwrap().trim_end(),
        )
        .expect("json");
        assert_eq!(chunk["choices"][0]["finish_reason"], "length");
    }

    #[test]
    fn test_diff_block_atomic_across_envelopes() {
        let mut proc = StreamProcessor::new("m");
        let mut all = Vec::new();
        // The fenced block arrives as cumulative snapshots over three
        // envelopes; it must come out as one frame.
        all.extend(proc.feed(&envelope_line(0, "intro\n", false)).expect("feed"));
        all.extend(
            proc.feed(&envelope_line(0, "intro\n<<<<<<< SEARCH\nold\n", false))
                .expect("feed"),
        );
        all.extend(
            proc.feed(&envelope_line(
                0,
                "intro\n<<<<<<< SEARCH\nold\n=======\nnew\n>>>>>>> REPLACE\ndone",
                false,
            ))
            .expect("feed"),
        );
        all.extend(proc.finish());

        let contents: Vec<String> = all
            .iter()
            .filter_map(|f| delta_of(f)["content"].as_str().map(String::from))
            .collect();
        let diff_frame = contents
            .iter()
            .find(|c| c.contains("<<<<<<< SEARCH"))
            .expect("diff frame present");
        assert!(diff_frame.contains(">>>>>>> REPLACE"));
    }

    #[test]
    fn test_empty_stream_fallback() {
        let mut proc = StreamProcessor::new("m");
        let frames = proc.finish();
        assert_eq!(frames.len(), 3);
        assert_eq!(delta_of(&frames[0])["role"], "assistant");
        assert_eq!(delta_of(&frames[1])["content"], "");
        let chunk: serde_json::Value = serde_json::from_str(
            frames[2].strip_prefix("data: ").unwrap().trim_end(),
        )
        .expect("json");
        assert_eq!(chunk["choices"][0]["finish_reason"], "stop");
    }

    #[test]
    fn test_heartbeat_when_idle() {
        let mut proc =
            StreamProcessor::with_heartbeat("m", true, Duration::from_millis(0));
        let hb = proc.maybe_heartbeat().expect("idle heartbeat");
        assert_eq!(delta_of(&hb), serde_json::json!({}));
        assert!(!proc.content_sent());
    }

    #[test]
    fn test_indexless_result_sorted_last() {
        let mut proc = StreamProcessor::new("m");
        let line = serde_json::json!({
            "results": [
                {"data": {"candidates": [{"content": {"parts": [{"text": "tail"}]}}]}},
                {"path": [0, 0, 0], "data": {"candidates": [{"content": {"parts": [{"text": "head "}]}}]}}
            ]
        })
        .to_string()
            + "\n";
        let frames = proc.feed(&line).expect("feed");
        let contents: Vec<String> = frames
            .iter()
            .filter_map(|f| delta_of(f)["content"].as_str().map(String::from))
            .collect();
        assert_eq!(contents, vec!["head ".to_string(), "tail".to_string()]);
    }
}
