// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-invocation orchestration.
//!
//! A [`Shipper`] owns the pipeline for the lifetime of the process. Workers
//! are started once in [`Shipper::new`]; each call to [`Shipper::process`]
//! runs one cycle:
//!
//! 1. split every raw message into lines and parse each line as JSON
//! 2. unwrap `records` envelopes and normalize every event
//! 3. feed the batch assembler and seal the final partial batch
//! 4. wait until every batch of the cycle is delivered, staged or lost
//! 5. flush the backup store
//!
//! Unparsable lines are logged and dropped. No per-event or per-batch failure
//! aborts a cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error, info};

use crate::aggregator::{Batch, BatchAssembler, BatchOutcome, DeliveryQueue, QueueClosed};
use crate::backup::{BackupStore, FlushSummary};
use crate::config::Config;
use crate::error::{ParseError, ShipperError};
use crate::flusher::{DeliveryWorkerPool, Flusher};
use crate::http_utils::{get_client, listener_url};
use crate::normalizer::{flatten_envelope, Normalizer};
use crate::object_store::{self, ObjectStore};

/// Outcome counters for one invocation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    /// Events fed to the assembler after envelope flattening.
    pub events: usize,
    /// Lines dropped because they were not valid JSON.
    pub dropped: usize,
    pub batches: usize,
    pub delivered: usize,
    pub staged: usize,
    pub lost: usize,
}

impl CycleReport {
    fn record(&mut self, outcome: BatchOutcome) {
        match outcome {
            BatchOutcome::Delivered => self.delivered += 1,
            BatchOutcome::Staged => self.staged += 1,
            BatchOutcome::Lost => self.lost += 1,
        }
    }
}

#[derive(Debug)]
pub struct Shipper {
    normalizer: Normalizer,
    assembler: Mutex<BatchAssembler>,
    pool: Mutex<Option<DeliveryWorkerPool>>,
    backup: Arc<BackupStore>,
    shutting_down: AtomicBool,
}

impl Shipper {
    /// Builds the pipeline with the object store selected by `config`.
    pub async fn from_config(config: &Config) -> Result<Self, ShipperError> {
        let client = get_client(config.https_proxy.as_deref(), config.request_timeout);
        let store = object_store::from_config(config, client.clone());
        Self::with_client(config, client, store).await
    }

    /// Builds the pipeline around an existing object store and starts the
    /// delivery workers.
    pub async fn new(config: &Config, store: Arc<dyn ObjectStore>) -> Result<Self, ShipperError> {
        let client = get_client(config.https_proxy.as_deref(), config.request_timeout);
        Self::with_client(config, client, store).await
    }

    async fn with_client(
        config: &Config,
        client: reqwest::Client,
        store: Arc<dyn ObjectStore>,
    ) -> Result<Self, ShipperError> {
        config.validate()?;
        let url = listener_url(&config.endpoint_url, &config.auth_token, &config.log_type)?;

        let backup = Arc::new(
            BackupStore::new(
                &config.backup_dir,
                config.folder_max_size_mb,
                config.file_max_records,
                store,
            )
            .await?,
        );

        let (queue, receiver) = DeliveryQueue::new();
        let flusher = Flusher::new(client, url, config.delivery_mode, config.retry_strategy());
        let pool =
            DeliveryWorkerPool::start(config.thread_count, receiver, flusher, Arc::clone(&backup));

        info!(
            workers = pool.worker_count(),
            buffer_size = config.buffer_size,
            mode = ?config.delivery_mode,
            "Shipper started"
        );

        Ok(Shipper {
            normalizer: Normalizer::new(config.parse_empty_fields),
            assembler: Mutex::new(BatchAssembler::new(
                config.buffer_size,
                config.interval_time,
                queue,
            )),
            pool: Mutex::new(Some(pool)),
            backup,
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Runs one cycle over the raw messages of an invocation.
    pub async fn process(&self, messages: &[String]) -> Result<CycleReport, ShipperError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(ShipperError::ShuttingDown);
        }

        // One producer per cycle.
        let mut assembler = self.assembler.lock().await;
        let mut report = CycleReport::default();
        let mut unqueued = Vec::new();

        let lines = messages.iter().flat_map(|message| message.lines());
        for (idx, line) in lines.enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let parsed = match serde_json::from_str::<Value>(line) {
                Ok(parsed) => parsed,
                Err(source) => {
                    error!("{}", ParseError { line: idx + 1, source });
                    report.dropped += 1;
                    continue;
                }
            };

            for event in flatten_envelope(parsed) {
                report.events += 1;
                let event = self.normalizer.normalize(event);
                if let Err(QueueClosed(batch)) = assembler.add(&event) {
                    unqueued.push(batch);
                }
            }
        }
        debug!(
            records = assembler.in_progress_len(),
            "Sealing final batch of the cycle"
        );
        if let Err(QueueClosed(batch)) = assembler.seal() {
            unqueued.push(batch);
        }

        let acks = assembler.take_pending();
        report.batches = acks.len() + unqueued.len();
        for batch in unqueued {
            let outcome = self.stage_unqueued(batch).await;
            report.record(outcome);
        }
        self.await_outcomes(acks, &mut report).await;

        self.backup.flush().await;
        info!(
            events = report.events,
            dropped = report.dropped,
            batches = report.batches,
            delivered = report.delivered,
            staged = report.staged,
            lost = report.lost,
            "Cycle completed"
        );
        Ok(report)
    }

    /// Stops accepting cycles, waits for the current one, drains the workers
    /// and flushes the backup store one last time.
    pub async fn shutdown(&self) -> FlushSummary {
        self.shutting_down.store(true, Ordering::SeqCst);
        let _cycle = self.assembler.lock().await;

        if let Some(pool) = self.pool.lock().await.take() {
            debug!("Shutting down delivery workers");
            pool.shutdown().await;
        }
        self.backup.flush().await
    }

    #[must_use]
    pub fn backup(&self) -> &Arc<BackupStore> {
        &self.backup
    }

    async fn await_outcomes(
        &self,
        acks: Vec<oneshot::Receiver<BatchOutcome>>,
        report: &mut CycleReport,
    ) {
        for ack in acks {
            match ack.await {
                Ok(outcome) => report.record(outcome),
                Err(_) => {
                    error!("Delivery worker dropped a batch without reporting an outcome");
                    report.lost += 1;
                }
            }
        }
    }

    async fn stage_unqueued(&self, mut batch: Batch) -> BatchOutcome {
        let outcome = match self.backup.stage(&batch.records, "delivery queue closed").await {
            Ok(_) => BatchOutcome::Staged,
            Err(e) => {
                error!(batch_id = %batch.id, "Failed to stage unqueued batch, records lost: {e}");
                BatchOutcome::Lost
            }
        };
        batch.complete(outcome);
        outcome
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::BackoffKind;
    use crate::object_store::MemoryStore;
    use mockito::{Matcher, Server, ServerGuard};
    use std::time::Duration;
    use tracing_test::traced_test;

    fn config(server: &ServerGuard, dir: &tempfile::TempDir) -> Config {
        Config {
            endpoint_url: server.url(),
            auth_token: "test-token".to_string(),
            thread_count: 2,
            buffer_size: 2,
            max_retries: 2,
            retry_delay: Duration::ZERO,
            backoff: BackoffKind::Fixed,
            backup_dir: dir.path().to_path_buf(),
            ..Default::default()
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn test_unparsable_line_is_logged_and_dropped() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/")
            .match_query(Matcher::Any)
            .with_status(200)
            .create_async()
            .await;
        let dir = tempfile::tempdir().unwrap();
        let shipper = Shipper::new(&config(&server, &dir), Arc::new(MemoryStore::new()))
            .await
            .unwrap();

        let report = shipper
            .process(&[r#"{"a":1}"#.to_string(), "not-json".to_string()])
            .await
            .unwrap();

        assert!(logs_contain("Error parsing JSON on line 2"));
        assert_eq!(report.dropped, 1);
        assert_eq!(report.events, 1);
        assert_eq!(report.delivered, 1);
        shipper.shutdown().await;
    }

    #[tokio::test]
    async fn test_multiline_message_and_envelopes() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .match_query(Matcher::Any)
            .match_body("{\"a\":1}\n{\"b\":2}")
            .with_status(200)
            .expect(1)
            .create_async()
            .await;
        let dir = tempfile::tempdir().unwrap();
        let shipper = Shipper::new(&config(&server, &dir), Arc::new(MemoryStore::new()))
            .await
            .unwrap();

        let report = shipper
            .process(&[r#"{"records":[{"a":1,"c":""}]}
{"b":2}"#
                .to_string()])
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(report.events, 2);
        assert_eq!(report.batches, 1);
        shipper.shutdown().await;
    }

    #[tokio::test]
    async fn test_empty_invocation_sends_nothing() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", Matcher::Any)
            .expect(0)
            .create_async()
            .await;
        let dir = tempfile::tempdir().unwrap();
        let shipper = Shipper::new(&config(&server, &dir), Arc::new(MemoryStore::new()))
            .await
            .unwrap();

        let report = shipper.process(&[String::new()]).await.unwrap();

        assert_eq!(report, CycleReport::default());
        mock.assert_async().await;
        shipper.shutdown().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn test_batch_is_lost_when_delivery_and_staging_fail() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/")
            .match_query(Matcher::Any)
            .with_status(500)
            .create_async()
            .await;
        let dir = tempfile::tempdir().unwrap();
        let shipper = Shipper::new(&config(&server, &dir), Arc::new(MemoryStore::new()))
            .await
            .unwrap();
        std::fs::remove_dir_all(shipper.backup().current_folder_path().await).unwrap();

        let report = shipper.process(&[r#"{"a":1}"#.to_string()]).await.unwrap();

        assert_eq!(report.batches, 1);
        assert_eq!(report.lost, 1);
        assert_eq!(report.staged, 0);
        assert!(logs_contain("records lost"));
        assert!(shipper.backup().pending_uploads().await.is_empty());
        shipper.shutdown().await;
    }

    #[tokio::test]
    async fn test_process_after_shutdown_is_rejected() {
        let server = Server::new_async().await;
        let dir = tempfile::tempdir().unwrap();
        let shipper = Shipper::new(&config(&server, &dir), Arc::new(MemoryStore::new()))
            .await
            .unwrap();

        shipper.shutdown().await;
        let result = shipper.process(&["{}".to_string()]).await;
        assert!(matches!(result, Err(ShipperError::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let server = Server::new_async().await;
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&server, &dir);
        config.auth_token = String::new();

        let result = Shipper::new(&config, Arc::new(MemoryStore::new())).await;
        assert!(matches!(result, Err(ShipperError::Config(_))));
    }
}
