use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use surge_core::types::CompletionPolicy;
use surge_observe::metrics::Counter;

/// Cumulative ingestion progress.
///
/// `attempted` counts every message whose write finished, failed or not. `persisted` only
/// counts messages the store acknowledged. Both only ever grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub attempted: u64,
    pub persisted: u64,
}

impl Progress {
    pub fn failed(&self) -> u64 {
        self.attempted.saturating_sub(self.persisted)
    }
}

/// Shared progress counter with a one-shot completion signal.
///
/// The signal fires from the single `record` call whose own `fetch_add` moves the gating
/// counter from below `expected` to at or above it, so it fires at most once no matter how
/// many workers record concurrently.
#[derive(Debug)]
pub struct CompletionTracker {
    expected: Option<u64>,
    policy: CompletionPolicy,
    attempted: AtomicU64,
    persisted: AtomicU64,
    started: Instant,
    signals: Counter,
    done: watch::Sender<Option<Duration>>,
}

impl CompletionTracker {
    pub fn new(expected: Option<u64>, policy: CompletionPolicy) -> Self {
        let (done, _) = watch::channel(None);
        Self {
            expected,
            policy,
            attempted: AtomicU64::new(0),
            persisted: AtomicU64::new(0),
            started: Instant::now(),
            signals: Counter::default(),
            done,
        }
    }

    /// Accounts for `n` messages whose write finished; `persisted` says whether the store
    /// acknowledged them. Returns true for the one call that reached the expected total.
    pub fn record(&self, n: u64, persisted: bool) -> bool {
        if n == 0 {
            return false;
        }
        let prev_attempted = self.attempted.fetch_add(n, Ordering::AcqRel);
        let prev_persisted = if persisted {
            Some(self.persisted.fetch_add(n, Ordering::AcqRel))
        } else {
            None
        };

        let Some(expected) = self.expected else {
            return false;
        };
        let crossed = |prev: u64| prev < expected && prev.saturating_add(n) >= expected;
        let fired = match self.policy {
            CompletionPolicy::Attempted => crossed(prev_attempted),
            CompletionPolicy::Persisted => prev_persisted.is_some_and(crossed),
        };
        if fired {
            self.fire();
        }
        fired
    }

    fn fire(&self) {
        let elapsed = self.started.elapsed();
        self.signals.inc();
        let progress = self.progress();
        tracing::info!(
            event = "completion",
            policy = %self.policy,
            expected = self.expected.unwrap_or_default(),
            attempted = progress.attempted,
            persisted = progress.persisted,
            elapsed_ms = elapsed.as_millis() as u64,
            "ingestion complete"
        );
        self.done.send_replace(Some(elapsed));
    }

    /// `persisted` is read before `attempted`, and `record` bumps them in the opposite order,
    /// so a snapshot never shows more persisted than attempted.
    pub fn progress(&self) -> Progress {
        let persisted = self.persisted.load(Ordering::Acquire);
        let attempted = self.attempted.load(Ordering::Acquire);
        Progress {
            attempted,
            persisted,
        }
    }

    pub fn expected(&self) -> Option<u64> {
        self.expected
    }

    pub fn is_complete(&self) -> bool {
        self.done.borrow().is_some()
    }

    /// How many times the completion signal fired. Never more than one.
    pub fn signal_count(&self) -> u64 {
        self.signals.get()
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Resolves with the elapsed time at completion.
    ///
    /// Never resolves when no expected total is configured or it is never reached.
    pub async fn wait(&self) -> Duration {
        let mut rx = self.done.subscribe();
        loop {
            if let Some(elapsed) = *rx.borrow_and_update() {
                return elapsed;
            }
            // The sender lives in `self`, so `changed` only errors if `self` is gone.
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
