use std::time::{Duration, Instant};

/// Stabilizes the raw transport stream before parsing: buffers until a
/// minimum size or a maximum wait is reached, then releases everything up to
/// the last newline. The backend frames its JSON per line, so a newline is
/// the only split point that cannot sever an object or an encoded image
/// payload.
pub struct ChunkAggregator {
    min_chunk_size: usize,
    max_buffer_time: Duration,
    /// Raw bytes carried until they form complete UTF-8
    byte_carry: Vec<u8>,
    buffer: String,
    last_emit: Instant,
    pub total_in: u64,
    pub total_out: u64,
    pub segments_emitted: u64,
}

impl ChunkAggregator {
    pub fn new(min_chunk_size: usize, max_buffer_time: Duration) -> Self {
        Self {
            min_chunk_size,
            max_buffer_time,
            byte_carry: Vec::new(),
            buffer: String::new(),
            last_emit: Instant::now(),
            total_in: 0,
            total_out: 0,
            segments_emitted: 0,
        }
    }

    /// Accepts a raw transport chunk. Multi-byte UTF-8 sequences split across
    /// chunks are carried until complete.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Option<String> {
        self.byte_carry.extend_from_slice(bytes);
        let valid_up_to = match std::str::from_utf8(&self.byte_carry) {
            Ok(_) => self.byte_carry.len(),
            Err(e) => e.valid_up_to(),
        };
        if valid_up_to == 0 {
            return None;
        }
        let complete: Vec<u8> = self.byte_carry.drain(..valid_up_to).collect();
        let text = String::from_utf8(complete).ok()?;
        self.push(&text)
    }

    pub fn push(&mut self, chunk: &str) -> Option<String> {
        self.total_in += chunk.len() as u64;
        self.buffer.push_str(chunk);

        let due = self.buffer.len() >= self.min_chunk_size
            || self.last_emit.elapsed() >= self.max_buffer_time;
        if !due || self.buffer.is_empty() {
            return None;
        }

        let split = self.safe_split_point();
        if split == 0 {
            // No newline yet; holding the whole buffer is the only safe move.
            return None;
        }

        let out: String = self.buffer.drain(..split).collect();
        self.last_emit = Instant::now();
        self.total_out += out.len() as u64;
        self.segments_emitted += 1;
        Some(out)
    }

    /// Releases whatever remains, newline or not. Call once at end-of-stream.
    pub fn flush(&mut self) -> Option<String> {
        // A trailing incomplete UTF-8 sequence at true end-of-stream is
        // corrupt input; decode it lossily rather than drop it.
        if !self.byte_carry.is_empty() {
            let tail = String::from_utf8_lossy(&self.byte_carry).into_owned();
            self.byte_carry.clear();
            self.buffer.push_str(&tail);
        }
        if self.buffer.is_empty() {
            return None;
        }
        let out = std::mem::take(&mut self.buffer);
        self.total_out += out.len() as u64;
        self.segments_emitted += 1;
        Some(out)
    }

    /// One past the last newline, or 0 when the buffer holds none.
    fn safe_split_point(&self) -> usize {
        match self.buffer.rfind('\n') {
            Some(idx) => idx + 1,
            None => 0,
        }
    }
}
