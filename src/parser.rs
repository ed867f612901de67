use serde_json::Value;

/// Reassembles complete JSON objects from arbitrary stream fragments.
///
/// Primary strategy: the backend emits line-delimited JSON, so complete lines
/// are parsed individually. Fallback: when no newline boundary exists yet (or
/// the payload arrives as one long array), a brace-balance scan gates an
/// incremental decode of the buffer front. The unparsed remainder survives
/// across calls; objects may span many fragments.
pub struct IncrementalJsonParser {
    buffer: String,
    pub successful_parses: u64,
    pub parse_errors: u64,
}

impl IncrementalJsonParser {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            successful_parses: 0,
            parse_errors: 0,
        }
    }

    pub fn feed(&mut self, data: &str) -> Vec<Value> {
        self.buffer.push_str(data);
        let mut results = Vec::new();

        // Take every complete line off the front; the tail stays buffered.
        let lines: Vec<String> = match self.buffer.rfind('\n') {
            Some(last) => {
                let head: String = self.buffer.drain(..=last).collect();
                head.lines().map(|l| l.to_string()).collect()
            }
            None => Vec::new(),
        };

        for (i, line) in lines.iter().enumerate() {
            let trimmed = line.trim().trim_matches(',');
            if trimmed.is_empty() || trimmed == "[" || trimmed == "]" {
                continue;
            }
            match serde_json::from_str::<Value>(trimmed) {
                Ok(obj) => {
                    results.push(obj);
                    self.successful_parses += 1;
                }
                Err(_) => {
                    // Incomplete line (object spans the newline): push the
                    // rest back in front of the buffered tail and wait.
                    self.parse_errors += 1;
                    let mut restored = lines[i..].join("\n");
                    restored.push('\n');
                    restored.push_str(&self.buffer);
                    self.buffer = restored;
                    break;
                }
            }
        }

        if results.is_empty() && !self.buffer.is_empty() {
            self.drain_balanced(&mut results);
        }

        results
    }

    /// Fallback for array-framed or newline-free payloads: peel leading
    /// array/element punctuation, then decode while the front of the buffer
    /// balances.
    fn drain_balanced(&mut self, results: &mut Vec<Value>) {
        loop {
            let trimmed_start = self.buffer.trim_start();
            if trimmed_start.len() != self.buffer.len() {
                self.buffer = trimmed_start.to_string();
            }
            if self.buffer.is_empty() {
                return;
            }

            let first = self.buffer.as_bytes()[0];
            if first == b'[' || first == b',' || first == b']' {
                self.buffer.remove(0);
                continue;
            }

            let probe = match self.buffer.find('\n') {
                Some(idx) => &self.buffer[..idx],
                None => self.buffer.as_str(),
            };
            if !is_balanced_json(probe) {
                return;
            }

            let mut stream = serde_json::Deserializer::from_str(&self.buffer).into_iter::<Value>();
            match stream.next() {
                Some(Ok(obj)) => {
                    let consumed = stream.byte_offset();
                    results.push(obj);
                    self.successful_parses += 1;
                    self.buffer.drain(..consumed);
                }
                _ => {
                    self.parse_errors += 1;
                    return;
                }
            }
        }
    }

    pub fn remaining(&self) -> &str {
        &self.buffer
    }

    /// One last decode attempt at end-of-stream.
    pub fn flush(&mut self) -> Vec<Value> {
        let mut results = Vec::new();
        let trimmed = self.buffer.trim_start().to_string();
        self.buffer = trimmed;
        if self.buffer.is_empty() {
            return results;
        }

        let mut stream = serde_json::Deserializer::from_str(&self.buffer).into_iter::<Value>();
        match stream.next() {
            Some(Ok(obj)) => {
                let consumed = stream.byte_offset();
                results.push(obj);
                self.successful_parses += 1;
                self.buffer.drain(..consumed);
            }
            _ => {
                self.parse_errors += 1;
            }
        }
        results
    }
}

impl Default for IncrementalJsonParser {
    fn default() -> Self {
        Self::new()
    }
}

/// String-aware brace/bracket balance check: a cheap completeness gate before
/// paying for a real parse.
fn is_balanced_json(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return false;
    }
    let first = trimmed.as_bytes()[0];
    if first != b'{' && first != b'[' {
        return false;
    }

    let mut braces = 0i64;
    let mut brackets = 0i64;
    let mut in_string = false;
    let mut escaped = false;

    for ch in trimmed.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => braces += 1,
            '}' if !in_string => braces -= 1,
            '[' if !in_string => brackets += 1,
            ']' if !in_string => brackets -= 1,
            _ => {}
        }
        if braces < 0 || brackets < 0 {
            return false;
        }
    }

    !in_string && braces == 0 && brackets == 0
}
