use std::fmt;

use surge_core::types::Message;

/// What caused a batch to be flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Size,
    Timer,
    Shutdown,
}

impl FlushTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushTrigger::Size => "size",
            FlushTrigger::Timer => "timer",
            FlushTrigger::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for FlushTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-worker message buffer with a size threshold.
///
/// Owned by exactly one worker, which also owns the flush timer, so it is never shared.
/// Invariant: `len() < threshold` between calls; `push` hands the batch out the moment it
/// reaches the threshold.
#[derive(Debug)]
pub struct BatchAccumulator {
    batch: Vec<Message>,
    threshold: usize,
}

impl BatchAccumulator {
    pub fn new(threshold: usize) -> Self {
        let threshold = threshold.max(1);
        Self {
            batch: Vec::with_capacity(threshold),
            threshold,
        }
    }

    /// Appends `message`; returns the full batch once it holds `threshold` messages.
    pub fn push(&mut self, message: Message) -> Option<Vec<Message>> {
        self.batch.push(message);
        if self.batch.len() >= self.threshold {
            Some(self.drain())
        } else {
            None
        }
    }

    /// Takes whatever is buffered. `None` when empty, which makes an empty flush a no-op.
    pub fn take(&mut self) -> Option<Vec<Message>> {
        if self.batch.is_empty() {
            None
        } else {
            Some(self.drain())
        }
    }

    fn drain(&mut self) -> Vec<Message> {
        std::mem::replace(&mut self.batch, Vec::with_capacity(self.threshold))
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }
}
