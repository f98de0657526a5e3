//! Batch assembly between normalization and delivery.
//!
//! The assembler keeps a single in-progress batch and seals it into the
//! delivery queue when it holds `buffer_size` records or when `interval_time`
//! has passed since its first record, whichever comes first. The producer side
//! calls [`BatchAssembler::seal`] at the end of a cycle so partial batches are
//! never left behind.
//!
//! ```text
//!   normalized events ──> [ in-progress batch ] ──seal──> DeliveryQueue ──> workers
//!                                                  │
//!                                                  └─> ack receiver (per batch)
//! ```
//!
//! Sealing moves the buffer out (`std::mem::take`); the assembler never touches
//! a batch again once it is queued.

use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info};
use uuid::Uuid;

/// Terminal state of a sealed batch, reported back through its ack channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Accepted by the listener.
    Delivered,
    /// Retries exhausted; written to the backup store.
    Staged,
    /// Retries exhausted and staging failed.
    Lost,
}

/// An ordered group of serialized log records delivered as one unit.
#[derive(Debug)]
pub struct Batch {
    pub id: Uuid,
    pub records: Vec<String>,
    ack: Option<oneshot::Sender<BatchOutcome>>,
}

impl Batch {
    #[must_use]
    pub fn new(records: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            records,
            ack: None,
        }
    }

    /// Creates a batch whose final outcome is sent to the returned receiver.
    #[must_use]
    pub fn with_ack(records: Vec<String>) -> (Self, oneshot::Receiver<BatchOutcome>) {
        let (tx, rx) = oneshot::channel();
        let mut batch = Self::new(records);
        batch.ack = Some(tx);
        (batch, rx)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Newline-joined body used by batched delivery and by staging.
    #[must_use]
    pub fn to_ndjson(&self) -> String {
        self.records.join("\n")
    }

    /// Reports the batch outcome. A dropped receiver is not an error.
    pub fn complete(&mut self, outcome: BatchOutcome) {
        if let Some(ack) = self.ack.take() {
            let _ = ack.send(outcome);
        }
    }
}

/// The delivery queue could not accept a sealed batch. The batch is returned so
/// the caller can stage it.
#[derive(Debug, thiserror::Error)]
#[error("Delivery queue is closed, batch {} was not handed off", .0.id)]
pub struct QueueClosed(pub Batch);

/// Producer side of the FIFO queue feeding the delivery workers.
#[derive(Clone, Debug)]
pub struct DeliveryQueue {
    tx: mpsc::UnboundedSender<Batch>,
}

impl DeliveryQueue {
    /// Creates the queue. The receiver is handed to the worker pool.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Batch>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn push(&self, batch: Batch) -> Result<(), QueueClosed> {
        self.tx.send(batch).map_err(|e| QueueClosed(e.0))
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Accumulates records into bounded batches.
#[derive(Debug)]
pub struct BatchAssembler {
    buffer_size: usize,
    interval_time: Duration,
    records: Vec<String>,
    first_insert: Option<Instant>,
    queue: DeliveryQueue,
    pending: Vec<oneshot::Receiver<BatchOutcome>>,
}

impl BatchAssembler {
    #[must_use]
    pub fn new(buffer_size: usize, interval_time: Duration, queue: DeliveryQueue) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
            interval_time,
            records: Vec::with_capacity(buffer_size.max(1)),
            first_insert: None,
            queue,
            pending: Vec::new(),
        }
    }

    /// Serializes and adds one normalized event, sealing the batch if it is now
    /// full or expired. Returns the id of the sealed batch, if any.
    pub fn add(&mut self, event: &Value) -> Result<Option<Uuid>, QueueClosed> {
        match serde_json::to_string(event) {
            Ok(record) => self.add_record(record),
            Err(e) => {
                error!("Failed to serialize normalized event, dropping it: {e}");
                Ok(None)
            }
        }
    }

    pub fn add_record(&mut self, record: String) -> Result<Option<Uuid>, QueueClosed> {
        if self.records.is_empty() {
            self.first_insert = Some(Instant::now());
        }
        self.records.push(record);

        if self.records.len() >= self.buffer_size {
            return self.seal();
        }
        self.seal_if_expired()
    }

    /// Seals the in-progress batch if its age reached `interval_time`.
    fn seal_if_expired(&mut self) -> Result<Option<Uuid>, QueueClosed> {
        if self.is_expired() {
            return self.seal();
        }
        Ok(None)
    }

    /// Seals the in-progress batch unconditionally. Empty batches are not sealed.
    pub fn seal(&mut self) -> Result<Option<Uuid>, QueueClosed> {
        if self.records.is_empty() {
            return Ok(None);
        }

        let records = std::mem::replace(&mut self.records, Vec::with_capacity(self.buffer_size));
        let age = self
            .first_insert
            .take()
            .map(|start| start.elapsed())
            .unwrap_or_default();

        let (batch, ack) = Batch::with_ack(records);
        let batch_id = batch.id;
        let size = batch.len();

        self.queue.push(batch)?;
        self.pending.push(ack);

        info!(
            batch_id = %batch_id,
            records = size,
            age_ms = age.as_millis() as u64,
            "Batch sealed"
        );
        Ok(Some(batch_id))
    }

    /// Ack receivers of every batch sealed since the last call.
    pub fn take_pending(&mut self) -> Vec<oneshot::Receiver<BatchOutcome>> {
        std::mem::take(&mut self.pending)
    }

    #[must_use]
    pub(crate) fn in_progress_len(&self) -> usize {
        self.records.len()
    }

    fn is_expired(&self) -> bool {
        self.first_insert
            .is_some_and(|start| start.elapsed() >= self.interval_time)
    }
}
