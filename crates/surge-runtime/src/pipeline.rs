use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use surge_core::types::{ConfigError, Message, RetryPolicy, SinkConfig, SinkMode};
use surge_observe::metrics::{Counter, Gauge, LatencyAgg};

use crate::batch::{BatchAccumulator, FlushTrigger};
use crate::progress::{CompletionTracker, Progress};
use crate::statement::Statement;
use crate::store::{Store, StoreWriteError};

/// Receiving end of the intake channel, shared by the worker pool.
type Intake = Arc<Mutex<mpsc::Receiver<Message>>>;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("pipeline is closed")]
    Closed,
    #[error(transparent)]
    Store(#[from] StoreWriteError),
    #[error("worker task failed: {0}")]
    Worker(#[from] JoinError),
}

#[derive(Debug, Default)]
pub struct IngestMetrics {
    pub accepted_total: Counter,
    /// Store calls, retries included.
    pub statements_total: Counter,
    pub failed_statements_total: Counter,
    pub retries_total: Counter,
    pub messages_persisted_total: Counter,
    pub messages_failed_total: Counter,
    pub size_flushes_total: Counter,
    pub timer_flushes_total: Counter,
    pub shutdown_flushes_total: Counter,
    pub queue_depth_high_water: Gauge,
    pub write_latency: LatencyAgg,
}

impl IngestMetrics {
    fn on_flush(&self, trigger: FlushTrigger) {
        match trigger {
            FlushTrigger::Size => self.size_flushes_total.inc(),
            FlushTrigger::Timer => self.timer_flushes_total.inc(),
            FlushTrigger::Shutdown => self.shutdown_flushes_total.inc(),
        }
    }
}

/// Summary returned when a pipeline stops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub mode: SinkMode,
    pub progress: Progress,
    pub statements: u64,
    pub failed_statements: u64,
    /// Messages still queued when an abort stopped the workers.
    pub abandoned: u64,
    pub completed: bool,
    pub elapsed: Duration,
}

/// Single write path shared by every strategy: execute, retry if configured, account.
struct Writer {
    store: Arc<dyn Store>,
    table: String,
    retry: RetryPolicy,
    tracker: Arc<CompletionTracker>,
    metrics: Arc<IngestMetrics>,
}

impl Writer {
    /// Failed writes are logged and still counted as attempted; the caller decides whether
    /// the error matters to it.
    async fn write(&self, worker: usize, statement: Statement) -> Result<u64, StoreWriteError> {
        let messages = statement.param_count() as u64;
        let mut retries = 0u32;
        let result = loop {
            let res = {
                let _timer = self.metrics.write_latency.start();
                self.store.execute(&statement).await
            };
            self.metrics.statements_total.inc();
            match res {
                Ok(rows) => break Ok(rows),
                Err(err) if retries < self.retry.max_retries => {
                    let backoff = self.retry.backoff_for(retries);
                    retries += 1;
                    self.metrics.retries_total.inc();
                    tracing::warn!(
                        worker,
                        messages,
                        retry = retries,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "store write failed; retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => break Err(err),
            }
        };

        match &result {
            Ok(_) => self.metrics.messages_persisted_total.inc_by(messages),
            Err(err) => {
                self.metrics.failed_statements_total.inc();
                self.metrics.messages_failed_total.inc_by(messages);
                tracing::error!(worker, messages, error = %err, "store write failed");
            }
        }
        self.tracker.record(messages, result.is_ok());
        result
    }
}

/// The write path chosen once at startup.
#[derive(Clone)]
enum SinkStrategy {
    /// Writes on the delivering task itself.
    Direct(Arc<Writer>),
    DeferredSingle(mpsc::Sender<Message>),
    BatchedMulti(mpsc::Sender<Message>),
}

/// Cloneable entry point for message sources; one clone per connection.
#[derive(Clone)]
pub struct IngestHandle {
    strategy: SinkStrategy,
    metrics: Arc<IngestMetrics>,
    closed: CancellationToken,
}

impl IngestHandle {
    /// Accepts one message.
    ///
    /// Queued modes suspend while the intake channel is full; nothing is ever dropped.
    /// `Direct` performs the write before returning and surfaces its error, which has
    /// already been logged and counted.
    pub async fn deliver(&self, message: impl Into<Message>) -> Result<(), IngestError> {
        if self.closed.is_cancelled() {
            return Err(IngestError::Closed);
        }
        let message = message.into();
        match &self.strategy {
            SinkStrategy::Direct(writer) => {
                self.metrics.accepted_total.inc();
                writer
                    .write(0, Statement::insert_one(&writer.table, message))
                    .await?;
            }
            SinkStrategy::DeferredSingle(tx) | SinkStrategy::BatchedMulti(tx) => {
                tx.send(message).await.map_err(|_| IngestError::Closed)?;
                self.metrics.accepted_total.inc();
                self.metrics
                    .queue_depth_high_water
                    .max((tx.max_capacity() - tx.capacity()) as u64);
            }
        }
        Ok(())
    }

    /// Messages waiting in the intake channel. Always 0 for `Direct`.
    pub fn queue_depth(&self) -> usize {
        match &self.strategy {
            SinkStrategy::Direct(_) => 0,
            SinkStrategy::DeferredSingle(tx) | SinkStrategy::BatchedMulti(tx) => {
                tx.max_capacity() - tx.capacity()
            }
        }
    }
}

struct Worker {
    id: usize,
    intake: Intake,
    writer: Arc<Writer>,
    cancel: CancellationToken,
}

impl Worker {
    async fn recv(&self) -> Option<Message> {
        self.intake.lock().await.recv().await
    }

    async fn run_single(self) {
        tracing::debug!(worker = self.id, "deferred worker started");
        loop {
            let message = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                message = self.recv() => message,
            };
            let Some(message) = message else {
                break;
            };
            let statement = Statement::insert_one(&self.writer.table, message);
            let _ = self.writer.write(self.id, statement).await;
        }
        tracing::debug!(worker = self.id, "deferred worker stopped");
    }

    /// Size and timer triggers race inside one select loop, so the batch needs no lock.
    /// Ties go to the timer; the size path then starts from an empty batch.
    async fn run_batched(self, batch_size: usize, flush_interval: Duration) {
        tracing::debug!(worker = self.id, batch_size, "batched worker started");
        let mut acc = BatchAccumulator::new(batch_size);
        let mut ticker = tokio::time::interval_at(Instant::now() + flush_interval, flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Some(batch) = acc.take() {
                        self.flush(batch, FlushTrigger::Timer).await;
                    }
                }
                message = self.recv() => {
                    let Some(message) = message else {
                        break;
                    };
                    if let Some(batch) = acc.push(message) {
                        self.flush(batch, FlushTrigger::Size).await;
                    }
                }
            }
        }

        if let Some(batch) = acc.take() {
            self.flush(batch, FlushTrigger::Shutdown).await;
        }
        tracing::debug!(worker = self.id, "batched worker stopped");
    }

    async fn flush(&self, batch: Vec<Message>, trigger: FlushTrigger) {
        self.writer.metrics.on_flush(trigger);
        tracing::debug!(
            worker = self.id,
            messages = batch.len(),
            trigger = %trigger,
            "flushing batch"
        );
        let statement = Statement::insert_many(&self.writer.table, batch);
        let _ = self.writer.write(self.id, statement).await;
    }
}

/// A running ingestion pipeline: strategy, worker pool and completion tracking.
pub struct Pipeline {
    config: SinkConfig,
    handle: IngestHandle,
    intake: Option<Intake>,
    tracker: Arc<CompletionTracker>,
    metrics: Arc<IngestMetrics>,
    cancel: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Validates `config` and spawns the worker pool. Must be called inside a tokio runtime.
    pub fn start(config: SinkConfig, store: Arc<dyn Store>) -> Result<Self, ConfigError> {
        config.validate()?;

        let tracker = Arc::new(CompletionTracker::new(
            config.expected_total,
            config.completion,
        ));
        let metrics = Arc::new(IngestMetrics::default());
        let cancel = CancellationToken::new();
        let writer = Arc::new(Writer {
            store,
            table: config.table.clone(),
            retry: config.retry,
            tracker: tracker.clone(),
            metrics: metrics.clone(),
        });

        let mut workers = Vec::new();
        let (strategy, intake) = match config.mode {
            SinkMode::Direct => (SinkStrategy::Direct(writer), None),
            SinkMode::DeferredSingle | SinkMode::BatchedMulti => {
                let (tx, rx) = mpsc::channel::<Message>(config.channel_capacity);
                let intake: Intake = Arc::new(Mutex::new(rx));
                for id in 0..config.workers {
                    let worker = Worker {
                        id,
                        intake: intake.clone(),
                        writer: writer.clone(),
                        cancel: cancel.clone(),
                    };
                    let task = if config.mode == SinkMode::BatchedMulti {
                        tokio::spawn(worker.run_batched(config.batch_size, config.flush_interval))
                    } else {
                        tokio::spawn(worker.run_single())
                    };
                    workers.push(task);
                }
                let strategy = if config.mode == SinkMode::BatchedMulti {
                    SinkStrategy::BatchedMulti(tx)
                } else {
                    SinkStrategy::DeferredSingle(tx)
                };
                (strategy, Some(intake))
            }
        };

        tracing::info!(
            mode = %config.mode,
            workers = if config.mode.is_queued() { config.workers } else { 0 },
            batch_size = config.batch_size,
            flush_interval_ms = config.flush_interval.as_millis() as u64,
            channel_capacity = config.channel_capacity,
            expected_total = ?config.expected_total,
            completion = %config.completion,
            max_retries = config.retry.max_retries,
            table = %config.table,
            "pipeline started"
        );

        let handle = IngestHandle {
            strategy,
            metrics: metrics.clone(),
            closed: cancel.clone(),
        };
        Ok(Self {
            config,
            handle,
            intake,
            tracker,
            metrics,
            cancel,
            workers,
        })
    }

    pub fn handle(&self) -> IngestHandle {
        self.handle.clone()
    }

    pub fn config(&self) -> &SinkConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<IngestMetrics> {
        self.metrics.clone()
    }

    pub fn tracker(&self) -> Arc<CompletionTracker> {
        self.tracker.clone()
    }

    pub fn progress(&self) -> Progress {
        self.tracker.progress()
    }

    pub fn queue_depth(&self) -> usize {
        self.handle.queue_depth()
    }

    /// Resolves with the elapsed time once the expected total has been reached.
    pub async fn wait_for_completion(&self) -> Duration {
        self.tracker.wait().await
    }

    /// Closes intake, lets the workers drain it and flush their batches, then reports.
    ///
    /// The intake channel only closes once every `IngestHandle` clone has been dropped, so
    /// sources must stop and drop their handles before this resolves.
    pub async fn shutdown(self) -> Result<IngestReport, IngestError> {
        let Pipeline {
            config,
            handle,
            intake: _,
            tracker,
            metrics,
            cancel,
            workers,
        } = self;
        drop(handle);
        if !config.mode.is_queued() {
            cancel.cancel();
        }
        join_workers(workers).await?;
        cancel.cancel();
        Ok(stop_report(&config, &tracker, &metrics, 0))
    }

    /// Cancels every worker. Each flushes the batch it holds; anything still queued is
    /// abandoned and counted in the report.
    pub async fn abort(self) -> Result<IngestReport, IngestError> {
        let Pipeline {
            config,
            handle,
            intake,
            tracker,
            metrics,
            cancel,
            workers,
        } = self;
        cancel.cancel();
        drop(handle);
        join_workers(workers).await?;

        let mut abandoned = 0u64;
        if let Some(intake) = intake {
            let mut rx = intake.lock().await;
            rx.close();
            while rx.try_recv().is_ok() {
                abandoned += 1;
            }
        }
        if abandoned > 0 {
            tracing::warn!(mode = %config.mode, abandoned, "abandoned queued messages");
        }
        Ok(stop_report(&config, &tracker, &metrics, abandoned))
    }
}

async fn join_workers(workers: Vec<JoinHandle<()>>) -> Result<(), IngestError> {
    for task in workers {
        task.await?;
    }
    Ok(())
}

fn stop_report(
    config: &SinkConfig,
    tracker: &CompletionTracker,
    metrics: &IngestMetrics,
    abandoned: u64,
) -> IngestReport {
    let report = IngestReport {
        mode: config.mode,
        progress: tracker.progress(),
        statements: metrics.statements_total.get(),
        failed_statements: metrics.failed_statements_total.get(),
        abandoned,
        completed: tracker.is_complete(),
        elapsed: tracker.elapsed(),
    };
    tracing::info!(
        mode = %report.mode,
        attempted = report.progress.attempted,
        persisted = report.progress.persisted,
        failed = report.progress.failed(),
        statements = report.statements,
        abandoned = report.abandoned,
        completed = report.completed,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "pipeline stopped"
    );
    report
}
