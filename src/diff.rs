use crate::constants::{DIFF_REPLACE_END, DIFF_SEARCH_START, DIFF_SEPARATOR};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffState {
    Normal,
    InDiff,
}

/// Withholds fenced search/replace blocks until they are complete, so a diff
/// is never split across output frames. Outside a block, only bytes that
/// cannot be the start of an open marker are released; inside, everything is
/// captured until the close marker lands.
pub struct DiffBlockHandler {
    state: DiffState,
    diff_buffer: String,
    pending: String,
    /// A close fence consumes its line terminator; when the newline has not
    /// arrived yet, it is swallowed from the next fragment.
    eat_newline: bool,
    pub blocks_emitted: u64,
}

impl DiffBlockHandler {
    pub fn new() -> Self {
        Self {
            state: DiffState::Normal,
            diff_buffer: String::new(),
            pending: String::new(),
            eat_newline: false,
            blocks_emitted: 0,
        }
    }

    pub fn is_in_diff(&self) -> bool {
        self.state == DiffState::InDiff
    }

    /// Feeds text, returning zero or more `(segment, is_diff_block)` pairs in
    /// order. Ambiguous marker prefixes at the buffer tail are held back.
    pub fn process(&mut self, text: &str) -> Vec<(String, bool)> {
        let mut out = Vec::new();
        self.pending.push_str(text);

        if self.eat_newline && !self.pending.is_empty() {
            if self.pending.starts_with('\n') {
                self.pending.remove(0);
            }
            self.eat_newline = false;
        }

        loop {
            if self.pending.is_empty() {
                break;
            }
            match self.state {
                DiffState::Normal => {
                    if let Some(pos) = self.pending.find(DIFF_SEARCH_START) {
                        if pos > 0 {
                            out.push((self.pending[..pos].to_string(), false));
                        }
                        self.pending.drain(..pos);
                        self.state = DiffState::InDiff;
                        continue;
                    }

                    let keep = self.tail_holdback(DIFF_SEARCH_START);
                    if self.pending.len() > keep {
                        let safe = self.pending.len() - keep;
                        let safe = floor_char_boundary(&self.pending, safe);
                        if safe > 0 {
                            let segment: String = self.pending.drain(..safe).collect();
                            out.push((segment, false));
                        }
                    }
                    break;
                }
                DiffState::InDiff => {
                    if let Some(pos) = self.pending.find(DIFF_REPLACE_END) {
                        let end = pos + DIFF_REPLACE_END.len();
                        let captured: String = self.pending.drain(..end).collect();
                        self.diff_buffer.push_str(&captured);
                        out.push((std::mem::take(&mut self.diff_buffer), true));
                        self.blocks_emitted += 1;
                        self.state = DiffState::Normal;
                        if self.pending.starts_with('\n') {
                            self.pending.remove(0);
                        } else if self.pending.is_empty() {
                            self.eat_newline = true;
                        }
                        continue;
                    }

                    let keep = self.tail_holdback(DIFF_REPLACE_END);
                    if self.pending.len() > keep {
                        let safe = self.pending.len() - keep;
                        let safe = floor_char_boundary(&self.pending, safe);
                        let captured: String = self.pending.drain(..safe).collect();
                        self.diff_buffer.push_str(&captured);
                    }
                    break;
                }
            }
        }

        out
    }

    /// How many trailing bytes could still be the start of `marker`: the
    /// longest marker prefix that suffixes the pending buffer. Zero when the
    /// tail is unambiguous.
    fn tail_holdback(&self, marker: &str) -> usize {
        for i in (1..marker.len()).rev() {
            if self.pending.ends_with(&marker[..i]) {
                return i;
            }
        }
        0
    }

    /// End-of-stream: releases held text. An open diff block is force-closed
    /// rather than dropped, synthesizing the separator and close fence when
    /// the stream died before producing them.
    pub fn flush(&mut self) -> Option<(String, bool)> {
        match self.state {
            DiffState::Normal => {
                if self.pending.is_empty() {
                    None
                } else {
                    Some((std::mem::take(&mut self.pending), false))
                }
            }
            DiffState::InDiff => {
                let mut block = std::mem::take(&mut self.diff_buffer);
                block.push_str(&std::mem::take(&mut self.pending));
                self.state = DiffState::Normal;

                if !block
                    .lines()
                    .any(|l| l.trim() == DIFF_SEPARATOR)
                {
                    if !block.ends_with('\n') {
                        block.push('\n');
                    }
                    block.push_str(DIFF_SEPARATOR);
                }
                if !block.ends_with('\n') {
                    block.push('\n');
                }
                block.push_str(DIFF_REPLACE_END);
                self.blocks_emitted += 1;
                Some((block, true))
            }
        }
    }
}

impl Default for DiffBlockHandler {
    fn default() -> Self {
        Self::new()
    }
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// Repairs diff fencing over a whole response: unterminated blocks get their
/// missing separator and close fence; a new open fence inside an unfinished
/// block closes the previous one first. Used by the non-streaming aggregate
/// path.
pub fn autocorrect_diff(content: &str) -> String {
    if !content.contains(DIFF_SEARCH_START) {
        return content.to_string();
    }

    let mut corrected: Vec<String> = Vec::new();
    let mut in_block = false;
    let mut separator_seen = false;

    for line in content.lines() {
        let stripped = line.trim();
        if stripped == DIFF_SEARCH_START {
            if in_block {
                if !separator_seen {
                    corrected.push(DIFF_SEPARATOR.to_string());
                }
                corrected.push(DIFF_REPLACE_END.to_string());
            }
            in_block = true;
            separator_seen = false;
            corrected.push(line.to_string());
        } else if stripped == DIFF_SEPARATOR {
            if in_block && separator_seen {
                // Duplicate separator inside one block is dropped.
                continue;
            }
            if in_block {
                separator_seen = true;
            }
            corrected.push(line.to_string());
        } else if stripped == DIFF_REPLACE_END {
            if in_block {
                if !separator_seen {
                    corrected.push(DIFF_SEPARATOR.to_string());
                }
                in_block = false;
                separator_seen = false;
            }
            corrected.push(line.to_string());
        } else {
            corrected.push(line.to_string());
        }
    }

    if in_block {
        if !separator_seen {
            corrected.push(DIFF_SEPARATOR.to_string());
        }
        corrected.push(DIFF_REPLACE_END.to_string());
    }

    corrected.join("\n")
}
