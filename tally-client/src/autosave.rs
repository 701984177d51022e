//! Debounced, retrying flush of buffered edits.
//!
//! The scheduler runs as its own task and owns the [`ChangeBuffer`]. Every
//! edit re-arms a single debounce deadline, so a cell that is edited
//! continuously is not sent until editing pauses. When the deadline passes
//! the whole buffer is taken and sent as one batch; edits that arrive while
//! that request is in flight go into the emptied buffer and are never lost.
//!
//! A failed batch is put back and retried on an exponential backoff until
//! `max_attempts` is reached. After that, or after a rejection that cannot
//! succeed on retry, the buffer is kept and the next edit (or a manual
//! flush) starts a new cycle.

use crate::api_client::SyncBackend;
use crate::buffer::ChangeBuffer;
use crate::error::{ClientError, ClientResult};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tally_api::types::{FlushRecord, FlushRequest, FlushResponse};
use tally_core::{CellValue, FieldKey, PendingChange, RetryConfig, SyncConfig};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

type FlushOutcome = (Vec<PendingChange>, ClientResult<FlushResponse>);
type FlushFuture = Pin<Box<dyn Future<Output = FlushOutcome> + Send>>;

/// Reported after every flush attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AutosaveEvent {
    Flushed {
        saved: usize,
        skipped: usize,
        rejected: usize,
    },
    /// The batch was put back. `retry_in` is `None` when no retry is scheduled.
    FlushFailed {
        attempt: u32,
        message: String,
        retry_in: Option<Duration>,
    },
    RetriesExhausted {
        attempts: u32,
        pending: usize,
    },
}

#[derive(Debug)]
enum Command {
    Record {
        key: FieldKey,
        old_value: CellValue,
        new_value: CellValue,
    },
    FlushNow,
    Shutdown,
}

/// Sending side of a running scheduler.
#[derive(Debug)]
pub struct AutosaveHandle {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<ChangeBuffer>,
}

impl AutosaveHandle {
    /// Buffer an edit and re-arm the debounce deadline.
    pub fn record(&self, key: FieldKey, old_value: CellValue, new_value: CellValue) -> ClientResult<()> {
        self.send(Command::Record {
            key,
            old_value,
            new_value,
        })
    }

    /// Flush as soon as no other flush is in flight; resets the retry cycle.
    pub fn flush_now(&self) -> ClientResult<()> {
        self.send(Command::FlushNow)
    }

    fn send(&self, command: Command) -> ClientResult<()> {
        self.commands
            .send(command)
            .map_err(|_| ClientError::AutosaveStopped)
    }

    /// Stop the task after one last flush attempt. Returns whatever could
    /// not be saved.
    pub async fn shutdown(self) -> ChangeBuffer {
        let _ = self.commands.send(Command::Shutdown);
        match self.task.await {
            Ok(buffer) => buffer,
            Err(err) => {
                error!(error = %err, "Autosave task failed");
                ChangeBuffer::new()
            }
        }
    }
}

pub struct AutosaveScheduler {
    backend: Arc<dyn SyncBackend>,
    debounce: Duration,
    retry: RetryConfig,
}

impl AutosaveScheduler {
    pub fn new(backend: Arc<dyn SyncBackend>, debounce: Duration, retry: RetryConfig) -> Self {
        Self {
            backend,
            debounce,
            retry,
        }
    }

    pub fn from_config(backend: Arc<dyn SyncBackend>, config: &SyncConfig) -> Self {
        Self::new(backend, config.debounce, config.retry.clone())
    }

    pub fn spawn(self) -> (AutosaveHandle, mpsc::UnboundedReceiver<AutosaveEvent>) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(self.run(command_rx, events));
        (AutosaveHandle { commands, task }, event_rx)
    }

    async fn run(
        self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        events: mpsc::UnboundedSender<AutosaveEvent>,
    ) -> ChangeBuffer {
        let mut state = CycleState::default();
        let mut buffer = ChangeBuffer::new();
        let mut in_flight: Option<FlushFuture> = None;

        loop {
            let due = state.next_flush_at();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Record { key, old_value, new_value }) => {
                        buffer.record(key, old_value, new_value);
                        state.restart(Instant::now() + self.debounce);
                    }
                    Some(Command::FlushNow) => state.restart(Instant::now()),
                    Some(Command::Shutdown) | None => break,
                },
                _ = tokio::time::sleep_until(due.unwrap_or_else(Instant::now)),
                    if due.is_some() && in_flight.is_none() =>
                {
                    state.clear_schedule();
                    in_flight = self.start_flush(&mut buffer);
                }
                outcome = wait_in_flight(&mut in_flight) => {
                    in_flight = None;
                    self.finish_flush(outcome, &mut buffer, &mut state, &events);
                }
            }
        }

        if let Some(flight) = in_flight.take() {
            let outcome = flight.await;
            self.finish_flush(outcome, &mut buffer, &mut state, &events);
        }
        if let Some(last) = self.start_flush(&mut buffer) {
            let outcome = last.await;
            state.clear_schedule();
            self.finish_flush(outcome, &mut buffer, &mut state, &events);
        }
        if !buffer.is_empty() {
            warn!(pending = buffer.len(), "Autosave stopped with unsaved edits");
        }
        buffer
    }

    fn start_flush(&self, buffer: &mut ChangeBuffer) -> Option<FlushFuture> {
        if buffer.is_empty() {
            return None;
        }
        let batch = buffer.take();
        let backend = Arc::clone(&self.backend);
        debug!(count = batch.len(), "Flushing buffered edits");
        Some(Box::pin(async move {
            let request = FlushRequest {
                changes: batch.iter().map(FlushRecord::from).collect(),
            };
            let result = backend.flush(&request).await;
            (batch, result)
        }))
    }

    fn finish_flush(
        &self,
        (batch, result): FlushOutcome,
        buffer: &mut ChangeBuffer,
        state: &mut CycleState,
        events: &mpsc::UnboundedSender<AutosaveEvent>,
    ) {
        match result {
            Ok(response) => {
                state.attempt = 0;
                if response.rejected() > 0 {
                    warn!(
                        rejected = response.rejected(),
                        total = response.total,
                        "Server rejected some buffered edits"
                    );
                }
                info!(saved = response.saved, skipped = response.skipped, "Autosave flushed");
                let _ = events.send(AutosaveEvent::Flushed {
                    saved: response.saved,
                    skipped: response.skipped,
                    rejected: response.rejected(),
                });
            }
            Err(err) => {
                let count = batch.len();
                buffer.restore(batch);
                state.attempt += 1;
                let attempt = state.attempt;

                if !err.is_retryable() {
                    error!(error = %err, count, "Autosave rejected; keeping edits until the next change");
                    state.attempt = 0;
                    let _ = events.send(AutosaveEvent::FlushFailed {
                        attempt,
                        message: err.to_string(),
                        retry_in: None,
                    });
                    return;
                }

                match self.retry.backoff_after(attempt) {
                    Some(delay) => {
                        warn!(error = %err, attempt, retry_in_ms = delay.as_millis() as u64, "Autosave failed");
                        state.retry_at = Some(Instant::now() + delay);
                        let _ = events.send(AutosaveEvent::FlushFailed {
                            attempt,
                            message: err.to_string(),
                            retry_in: Some(delay),
                        });
                    }
                    None => {
                        error!(error = %err, attempts = attempt, pending = buffer.len(), "Autosave retries exhausted");
                        state.attempt = 0;
                        let _ = events.send(AutosaveEvent::FlushFailed {
                            attempt,
                            message: err.to_string(),
                            retry_in: None,
                        });
                        let _ = events.send(AutosaveEvent::RetriesExhausted {
                            attempts: attempt,
                            pending: buffer.len(),
                        });
                    }
                }
            }
        }
    }
}

/// Debounce deadline and retry position of the current flush cycle.
#[derive(Debug, Default)]
struct CycleState {
    debounce_at: Option<Instant>,
    retry_at: Option<Instant>,
    attempt: u32,
}

impl CycleState {
    /// An edit or manual flush starts a new cycle.
    fn restart(&mut self, at: Instant) {
        self.debounce_at = Some(at);
        self.retry_at = None;
        self.attempt = 0;
    }

    fn clear_schedule(&mut self) {
        self.debounce_at = None;
        self.retry_at = None;
    }

    fn next_flush_at(&self) -> Option<Instant> {
        match (self.debounce_at, self.retry_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

async fn wait_in_flight(slot: &mut Option<FlushFuture>) -> FlushOutcome {
    match slot {
        Some(flight) => flight.await,
        None => std::future::pending().await,
    }
}
