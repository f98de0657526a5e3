// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery of sealed batches to the Logz.io listener.
//!
//! ```text
//!   DeliveryQueue ──> worker 0 ─┐
//!                 ──> worker 1 ─┼─> POST listener ──2xx──> Delivered
//!                 ──> worker N ─┘        │
//!                                        └─ retries exhausted ──> BackupStore ──> Staged / Lost
//! ```
//!
//! Workers share one receiver. Each dequeue waits at most [`DEQUEUE_TIMEOUT`]
//! so an idle worker notices cancellation. Every response other than 2xx is
//! retried, including 4xx.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use reqwest::header::CONTENT_TYPE;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::aggregator::{Batch, BatchOutcome};
use crate::backup::BackupStore;
use crate::config::DeliveryMode;
use crate::constants::DEQUEUE_TIMEOUT;
use crate::error::DeliveryError;

/// Longest response body kept in a [`DeliveryError::Status`].
const MAX_ERROR_BODY_LEN: usize = 512;

/// Delay policy between delivery attempts. `attempts` counts the first try.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    /// `base_delay_ms * 2^(n-1)` after the n-th failed attempt.
    ExponentialBackoff {
        attempts: u32,
        base_delay_ms: u64,
        jitter: bool,
    },
    FixedDelay {
        attempts: u32,
        delay_ms: u64,
        jitter: bool,
    },
}

impl RetryStrategy {
    #[must_use]
    pub fn attempts(&self) -> u32 {
        match self {
            RetryStrategy::ExponentialBackoff { attempts, .. }
            | RetryStrategy::FixedDelay { attempts, .. } => (*attempts).max(1),
        }
    }

    /// Delay to wait after the `attempt`-th failure (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let (delay_ms, jitter) = match *self {
            RetryStrategy::ExponentialBackoff {
                base_delay_ms,
                jitter,
                ..
            } => {
                let factor = 1_u64
                    .checked_shl(attempt.saturating_sub(1))
                    .unwrap_or(u64::MAX);
                (base_delay_ms.saturating_mul(factor), jitter)
            }
            RetryStrategy::FixedDelay {
                delay_ms, jitter, ..
            } => (delay_ms, jitter),
        };

        if jitter && delay_ms > 1 {
            let cut = rand::rng().random_range(0..=delay_ms / 2);
            return Duration::from_millis(delay_ms - cut);
        }
        Duration::from_millis(delay_ms)
    }
}

/// Sends batches to one listener URL with retry.
#[derive(Debug, Clone)]
pub struct Flusher {
    client: reqwest::Client,
    url: reqwest::Url,
    mode: DeliveryMode,
    retry: RetryStrategy,
}

impl Flusher {
    #[must_use]
    pub fn new(
        client: reqwest::Client,
        url: reqwest::Url,
        mode: DeliveryMode,
        retry: RetryStrategy,
    ) -> Self {
        Flusher {
            client,
            url,
            mode,
            retry,
        }
    }

    /// Delivers the whole batch. In per-record mode the batch counts as
    /// delivered only if every record is.
    pub async fn deliver(&self, batch: &Batch) -> Result<(), DeliveryError> {
        match self.mode {
            DeliveryMode::Batched => self.send_with_retry(batch.to_ndjson(), batch.id).await,
            DeliveryMode::PerRecord => {
                for record in &batch.records {
                    self.send_with_retry(record.clone(), batch.id).await?;
                }
                Ok(())
            }
        }
    }

    async fn send_with_retry(&self, body: String, batch_id: Uuid) -> Result<(), DeliveryError> {
        let attempts = self.retry.attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let err = match self.send(body.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            if attempt >= attempts {
                error!(
                    batch_id = %batch_id,
                    attempts = attempt,
                    "Delivery failed, retries exhausted: {err}"
                );
                return Err(err);
            }

            let delay = self.retry.delay_for(attempt);
            warn!(
                batch_id = %batch_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Delivery failed, retrying: {err}"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn send(&self, body: String) -> Result<(), DeliveryError> {
        let resp = self
            .client
            .post(self.url.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }

        let mut body = resp.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY_LEN {
            let mut end = MAX_ERROR_BODY_LEN;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            body.truncate(end);
        }
        Err(DeliveryError::Status { status, body })
    }
}

/// Long-lived delivery workers consuming the delivery queue.
#[derive(Debug)]
pub struct DeliveryWorkerPool {
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<Batch>>>,
    cancel_token: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl DeliveryWorkerPool {
    /// Spawns `thread_count` workers on the current runtime.
    #[must_use]
    pub fn start(
        thread_count: usize,
        receiver: mpsc::UnboundedReceiver<Batch>,
        flusher: Flusher,
        backup: Arc<BackupStore>,
    ) -> Self {
        let receiver = Arc::new(Mutex::new(receiver));
        let cancel_token = CancellationToken::new();

        let workers = (0..thread_count.max(1))
            .map(|id| {
                let worker = Worker {
                    receiver: Arc::clone(&receiver),
                    flusher: flusher.clone(),
                    backup: Arc::clone(&backup),
                    cancel_token: cancel_token.clone(),
                };
                tokio::spawn(worker.run().instrument(tracing::info_span!("worker", id)))
            })
            .collect();

        debug!("Started {} delivery workers", thread_count.max(1));
        DeliveryWorkerPool {
            receiver,
            cancel_token,
            workers,
        }
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Closes the queue, lets workers drain what remains and waits for them.
    pub async fn shutdown(self) {
        self.receiver.lock().await.close();
        self.cancel_token.cancel();

        for handle in self.workers {
            if let Err(e) = handle.await {
                error!("Delivery worker failed to join: {e}");
            }
        }
        debug!("Delivery workers stopped");
    }
}

struct Worker {
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<Batch>>>,
    flusher: Flusher,
    backup: Arc<BackupStore>,
    cancel_token: CancellationToken,
}

impl Worker {
    async fn run(self) {
        loop {
            let next = {
                let mut receiver = self.receiver.lock().await;
                tokio::time::timeout(DEQUEUE_TIMEOUT, receiver.recv()).await
            };

            match next {
                Ok(Some(batch)) => self.process(batch).await,
                Ok(None) => {
                    debug!("Delivery queue closed and drained");
                    break;
                }
                Err(_) if self.cancel_token.is_cancelled() => {
                    debug!("Cancellation requested, stopping");
                    break;
                }
                Err(_) => {}
            }
        }
    }

    async fn process(&self, mut batch: Batch) {
        let err = match self.flusher.deliver(&batch).await {
            Ok(()) => {
                info!(batch_id = %batch.id, records = batch.len(), "Batch delivered");
                batch.complete(BatchOutcome::Delivered);
                return;
            }
            Err(e) => e,
        };

        let reason = err.to_string();
        match self.backup.stage(&batch.records, &reason).await {
            Ok(path) => {
                error!(
                    batch_id = %batch.id,
                    records = batch.len(),
                    reason = %reason,
                    path = %path.display(),
                    "Batch not delivered, staged to backup"
                );
                batch.complete(BatchOutcome::Staged);
            }
            Err(e) => {
                error!(
                    batch_id = %batch.id,
                    records = batch.len(),
                    reason = %reason,
                    "Batch not delivered and staging failed, records lost: {e}"
                );
                batch.complete(BatchOutcome::Lost);
            }
        }
    }
}
