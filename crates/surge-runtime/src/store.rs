use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use surge_observe::metrics::{Counter, Gauge};

use crate::statement::Statement;

#[derive(Debug, Error)]
pub enum StoreWriteError {
    #[error("store rejected write: {0}")]
    Rejected(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[cfg(feature = "postgres")]
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),
}

/// The backing store seen by the pipeline: execute one statement, report rows affected.
///
/// Implementations are shared by every worker and must tolerate concurrent calls.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn execute(&self, statement: &Statement) -> Result<u64, StoreWriteError>;
}

type FailWhen = Box<dyn Fn(&Statement) -> bool + Send + Sync>;

/// In-process store that keeps every acknowledged statement.
///
/// Latency and failures can be injected to exercise backpressure and the error policy.
#[derive(Default)]
pub struct MemoryStore {
    statements: Mutex<Vec<Statement>>,
    latency: Duration,
    fail_when: Option<FailWhen>,
    attempts: Counter,
    rows_written: Counter,
    inflight: Gauge,
    inflight_high_water: Gauge,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Statements for which `fail_when` returns true are rejected and not recorded.
    pub fn with_failures(
        mut self,
        fail_when: impl Fn(&Statement) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.fail_when = Some(Box::new(fail_when));
        self
    }

    pub fn statements(&self) -> Vec<Statement> {
        self.statements
            .lock()
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    /// Parameter counts of the recorded statements, in execution order.
    pub fn param_counts(&self) -> Vec<usize> {
        self.statements
            .lock()
            .map(|v| v.iter().map(Statement::param_count).collect())
            .unwrap_or_default()
    }

    pub fn attempts(&self) -> u64 {
        self.attempts.get()
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written.get()
    }

    /// Most statements observed executing at the same time.
    pub fn inflight_high_water(&self) -> u64 {
        self.inflight_high_water.get()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn execute(&self, statement: &Statement) -> Result<u64, StoreWriteError> {
        self.attempts.inc();
        {
            let inflight = self.inflight.enter();
            self.inflight_high_water.max(inflight.level());
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
        }

        if self.fail_when.as_ref().is_some_and(|f| f(statement)) {
            return Err(StoreWriteError::Rejected(format!(
                "injected failure ({} rows)",
                statement.param_count()
            )));
        }

        let rows = statement.param_count() as u64;
        self.statements
            .lock()
            .map_err(|_| StoreWriteError::Unavailable("memory store mutex poisoned".into()))?
            .push(statement.clone());
        self.rows_written.inc_by(rows);
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use surge_core::types::Message;

    use super::*;

    #[tokio::test]
    async fn records_acknowledged_statements() {
        let store = MemoryStore::new();
        let rows = store
            .execute(&Statement::insert_many(
                "messages",
                vec![Message::from("a"), Message::from("b")],
            ))
            .await
            .unwrap();
        assert_eq!(rows, 2);
        assert_eq!(store.param_counts(), vec![2]);
        assert_eq!(store.rows_written(), 2);
    }

    #[tokio::test]
    async fn injected_failures_are_not_recorded() {
        let store = MemoryStore::new().with_failures(|s| s.param_count() > 1);
        let err = store
            .execute(&Statement::insert_many(
                "messages",
                vec![Message::from("a"), Message::from("b")],
            ))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("injected failure"), "got: {err}");
        store
            .execute(&Statement::insert_one("messages", Message::from("c")))
            .await
            .unwrap();
        assert_eq!(store.attempts(), 2);
        assert_eq!(store.param_counts(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_write_leaves_no_inflight_residue() {
        let store = MemoryStore::new().with_latency(Duration::from_secs(1));
        let cancelled = tokio::time::timeout(
            Duration::from_millis(10),
            store.execute(&Statement::insert_one("messages", Message::from("a"))),
        )
        .await;
        assert!(cancelled.is_err());

        store
            .execute(&Statement::insert_one("messages", Message::from("b")))
            .await
            .unwrap();
        assert_eq!(store.inflight_high_water(), 1);
        assert_eq!(store.param_counts(), vec![1]);
    }
}
