use std::collections::BTreeMap;

/// One logical backend channel: the primary answer stream and the thought
/// stream for the same path index are tracked independently.
#[derive(Debug, Default)]
struct ChannelEntry {
    content: String,
    committed: usize,
    emitted: usize,
}

#[derive(Debug, Default, Clone)]
pub struct TrackerStats {
    pub content_updates: u64,
    pub duplicate_events: u64,
    pub backtrack_events: u64,
    pub out_of_order_events: u64,
    pub tracked_channels: usize,
}

/// Deduplicates the backend's cumulative per-channel snapshots into suffix
/// deltas. The backend re-sends the full accumulated text of a channel on
/// every update; committed length only ever moves forward.
#[derive(Debug, Default)]
pub struct PathIndexTracker {
    // Key: (is_thought, path_index). BTreeMap ordering doubles as the flush
    // order: answer channels first, ascending path index, thoughts last.
    channels: BTreeMap<(bool, i64), ChannelEntry>,
    last_processed_index: i64,
    content_updates: u64,
    duplicate_events: u64,
    backtrack_events: u64,
    out_of_order_events: u64,
}

impl PathIndexTracker {
    pub fn new() -> Self {
        Self {
            last_processed_index: -1,
            ..Self::default()
        }
    }

    /// Feeds one channel snapshot. Returns the unseen suffix when the text
    /// grew; None for duplicates and backtracks.
    pub fn process(&mut self, path_index: i64, text: &str, is_thought: bool) -> Option<String> {
        if path_index < 0 {
            return None;
        }

        if !is_thought && path_index < self.last_processed_index {
            self.out_of_order_events += 1;
        }

        let entry = self.channels.entry((is_thought, path_index)).or_default();

        let incoming = text.len();
        let committed = entry.committed;

        if incoming > committed {
            if !text.is_char_boundary(committed) {
                // The new snapshot does not extend the committed prefix; the
                // backend rewrote history. Treat like a backtrack.
                self.backtrack_events += 1;
                tracing::warn!(
                    "[TRACKER] path={} realigned snapshot ignored (committed={}, new_len={})",
                    path_index,
                    committed,
                    incoming
                );
                return None;
            }
            let delta = text[committed..].to_string();
            entry.content = text.to_string();
            entry.committed = incoming;
            entry.emitted = incoming;
            if !is_thought {
                self.last_processed_index = self.last_processed_index.max(path_index);
            }
            self.content_updates += 1;
            Some(delta)
        } else if incoming < committed {
            // Stale snapshot: keep committed progress, retain the text for
            // diagnostics only, never re-emit.
            self.backtrack_events += 1;
            entry.content = text.to_string();
            let channel = if is_thought { "thought" } else { "answer" };
            tracing::warn!(
                "[TRACKER] [{}] path={} backtrack: committed={}, new_len={}, holding position",
                channel,
                path_index,
                committed,
                incoming
            );
            None
        } else {
            self.duplicate_events += 1;
            None
        }
    }

    /// Drains content that accumulated past the emitted watermark. Answer
    /// channels flush before thought channels, each ordered by path index.
    pub fn pending(&mut self) -> Vec<(i64, String, bool)> {
        let mut out = Vec::new();
        for (&(is_thought, path_index), entry) in self.channels.iter_mut() {
            if entry.content.len() > entry.emitted && entry.content.is_char_boundary(entry.emitted)
            {
                out.push((
                    path_index,
                    entry.content[entry.emitted..].to_string(),
                    is_thought,
                ));
                entry.emitted = entry.content.len();
            }
        }
        out
    }

    pub fn stats(&self) -> TrackerStats {
        TrackerStats {
            content_updates: self.content_updates,
            duplicate_events: self.duplicate_events,
            backtrack_events: self.backtrack_events,
            out_of_order_events: self.out_of_order_events,
            tracked_channels: self.channels.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_growth_emits_suffix_delta() {
        let mut tracker = PathIndexTracker::new();
        assert_eq!(tracker.process(0, "Hello", false).as_deref(), Some("Hello"));
        assert_eq!(
            tracker.process(0, "Hello, world", false).as_deref(),
            Some(", world")
        );
    }

    #[test]
    fn test_duplicate_dropped() {
        let mut tracker = PathIndexTracker::new();
        tracker.process(0, "same", false);
        assert!(tracker.process(0, "same", false).is_none());
        assert_eq!(tracker.stats().duplicate_events, 1);
    }

    #[test]
    fn test_backtrack_never_rewinds() {
        let mut tracker = PathIndexTracker::new();
        tracker.process(0, "long committed text", false);
        assert!(tracker.process(0, "short", false).is_none());
        assert_eq!(tracker.stats().backtrack_events, 1);
        // Committed length unchanged: growth past it emits only the suffix.
        assert_eq!(
            tracker.process(0, "long committed text+", false).as_deref(),
            Some("+")
        );
    }

    #[test]
    fn test_thought_and_answer_channels_independent() {
        let mut tracker = PathIndexTracker::new();
        assert_eq!(tracker.process(1, "answer", false).as_deref(), Some("answer"));
        assert_eq!(tracker.process(1, "thinking", true).as_deref(), Some("thinking"));
        assert_eq!(
            tracker.process(1, "answer more", false).as_deref(),
            Some(" more")
        );
        assert_eq!(tracker.stats().tracked_channels, 2);
    }

    #[test]
    fn test_negative_index_ignored() {
        let mut tracker = PathIndexTracker::new();
        assert!(tracker.process(-1, "text", false).is_none());
        assert_eq!(tracker.stats().tracked_channels, 0);
    }

    #[test]
    fn test_out_of_order_counted_but_processed() {
        let mut tracker = PathIndexTracker::new();
        tracker.process(5, "later channel", false);
        assert_eq!(tracker.process(2, "earlier", false).as_deref(), Some("earlier"));
        assert_eq!(tracker.stats().out_of_order_events, 1);
    }

    #[test]
    fn test_pending_flush_order_and_watermark() {
        let mut tracker = PathIndexTracker::new();
        tracker.process(2, "beta", false);
        tracker.process(0, "alpha", false);
        tracker.process(1, "mid-thought", true);

        // Force pending content: backtrack then silent regrowth below the
        // committed watermark leaves nothing pending for that channel, so
        // instead simulate it by a fresh channel whose emit was consumed.
        assert!(tracker.pending().is_empty());

        // Manually age the emitted watermark via a backtracked channel that
        // later accumulates: shorter text retained, emitted stays high, so
        // still nothing pending. The flush safety net triggers only when
        // content outruns emissions.
        tracker.channels.get_mut(&(false, 0)).unwrap().emitted = 2;
        tracker.channels.get_mut(&(true, 1)).unwrap().emitted = 0;

        let pending = tracker.pending();
        assert_eq!(pending.len(), 2);
        // Answer channel first, thought last.
        assert_eq!(pending[0], (0, "pha".to_string(), false));
        assert_eq!(pending[1], (1, "mid-thought".to_string(), true));

        // Watermark advanced: second flush is empty.
        assert!(tracker.pending().is_empty());
    }
}
