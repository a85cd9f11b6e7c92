//! Message Accumulator
//!
//! The producer re-sends the whole answer on every update, so the accumulator
//! keeps the latest snapshot rather than concatenating. Freshness is tracked
//! by the completion detector, not here.

#[derive(Debug, Clone, Default)]
pub struct MessageAccumulator {
    text: String,
    updates: u64,
}

impl MessageAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the tracked text with `text`.
    pub fn apply_fragment(&mut self, text: &str) {
        self.text.clear();
        self.text.push_str(text);
        self.updates += 1;
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn into_text(self) -> String {
        self.text
    }

    pub fn updates(&self) -> u64 {
        self.updates
    }
}
