// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Durable local staging for batches that could not be delivered.
//!
//! Staged records are appended as NDJSON to a current file inside a current
//! folder below the backup root:
//!
//! ```text
//! <backup_dir>/
//!   2024-05-01-<32 hex>/          rotated once it holds folder_max_size_mb
//!     logs-<32 hex>.txt           rotated once it holds file_max_records
//!     logs-<32 hex>.txt
//! ```
//!
//! Every file that receives data is queued for upload. [`BackupStore::flush`]
//! pushes the full content of each queued file to the object store under the key
//! `<folder>/<file>`. Local files are never deleted.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::constants::BYTES_PER_MB;
use crate::error::{StagingError, UploadError};
use crate::object_store::ObjectStore;

#[derive(Debug)]
struct UploadEntry {
    key: String,
    /// Bumped on every append to the file. A flush only dequeues an entry whose
    /// sequence did not move while it was being uploaded.
    seq: u64,
}

#[derive(Debug)]
struct BackupState {
    folder_name: String,
    folder_path: PathBuf,
    folder_bytes: u64,
    file_name: String,
    file_records: usize,
    /// Length of the current file up to the last fully written record.
    file_bytes: u64,
    uploads: BTreeMap<PathBuf, UploadEntry>,
    next_seq: u64,
}

impl BackupState {
    fn file_path(&self) -> PathBuf {
        self.folder_path.join(&self.file_name)
    }

    fn object_key(&self) -> String {
        format!("{}/{}", self.folder_name, self.file_name)
    }
}

/// Result of one [`BackupStore::flush`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushSummary {
    /// Files uploaded and removed from the queue.
    pub uploaded: usize,
    /// Files uploaded but kept queued because they grew during the upload.
    pub requeued: usize,
    /// Files whose read or upload failed. They stay queued.
    pub failed: usize,
}

#[derive(Debug)]
pub struct BackupStore {
    root: PathBuf,
    folder_max_size_mb: u64,
    file_max_records: usize,
    store: Arc<dyn ObjectStore>,
    state: Mutex<BackupState>,
    flush_lock: Mutex<()>,
}

impl BackupStore {
    /// Creates the backup root and a first folder. The first file is created on
    /// the first write.
    pub async fn new(
        root: impl Into<PathBuf>,
        folder_max_size_mb: u64,
        file_max_records: usize,
        store: Arc<dyn ObjectStore>,
    ) -> Result<Self, StagingError> {
        let root = root.into();
        let (folder_name, folder_path) = create_folder(&root).await?;

        Ok(Self {
            root,
            folder_max_size_mb,
            file_max_records,
            store,
            state: Mutex::new(BackupState {
                folder_name,
                folder_path,
                folder_bytes: 0,
                file_name: new_file_name(),
                file_records: 0,
                file_bytes: 0,
                uploads: BTreeMap::new(),
                next_seq: 0,
            }),
            flush_lock: Mutex::new(()),
        })
    }

    /// Appends `records` to the current file as one unit, queues the file for
    /// upload and rotates the folder and file if they are now full.
    ///
    /// An error means nothing from this call was kept: a partial write is cut
    /// back to the last record boundary. Once the records are on disk the call
    /// succeeds even if the following rotation fails.
    pub async fn stage(&self, records: &[String], reason: &str) -> Result<PathBuf, StagingError> {
        let mut body = records.join("\n");
        body.push('\n');

        let mut state = self.state.lock().await;
        let path = state.file_path();
        append_at_boundary(&path, state.file_bytes, body.as_bytes()).await?;

        state.file_records += records.len();
        state.file_bytes += body.len() as u64;
        state.folder_bytes += body.len() as u64;
        state.next_seq += 1;
        let seq = state.next_seq;
        let key = state.object_key();
        state
            .uploads
            .entry(path.clone())
            .and_modify(|entry| entry.seq = seq)
            .or_insert(UploadEntry { key, seq });

        info!(
            records = records.len(),
            path = %path.display(),
            reason,
            "Staged records to backup"
        );

        let rotated = self
            .rotate_folder_locked(&mut state, self.folder_max_size_mb)
            .await;
        if let Err(e) = rotated {
            error!(
                folder = %state.folder_path.display(),
                "Backup folder rotation failed, staying in the current folder: {e}"
            );
        }
        rotate_file_locked(&mut state, self.file_max_records);
        Ok(path)
    }

    /// Starts a new file in the current folder if the current one holds at least
    /// `max_records` records. Returns whether a rotation happened.
    pub async fn rotate_file_if_full(&self, max_records: usize) -> bool {
        let mut state = self.state.lock().await;
        rotate_file_locked(&mut state, max_records)
    }

    /// Starts a new folder, with a new file in it, if the current folder holds at
    /// least `max_size_mb`. Returns whether a rotation happened.
    pub async fn rotate_folder_if_full(&self, max_size_mb: u64) -> Result<bool, StagingError> {
        let mut state = self.state.lock().await;
        self.rotate_folder_locked(&mut state, max_size_mb).await
    }

    async fn rotate_folder_locked(
        &self,
        state: &mut BackupState,
        max_size_mb: u64,
    ) -> Result<bool, StagingError> {
        if state.folder_bytes < max_size_mb.saturating_mul(BYTES_PER_MB) {
            return Ok(false);
        }

        let (folder_name, folder_path) = create_folder(&self.root).await?;
        debug!(
            "Backup folder {} reached {} bytes, rotating to {}",
            state.folder_name, state.folder_bytes, folder_name
        );
        state.folder_name = folder_name;
        state.folder_path = folder_path;
        state.folder_bytes = 0;
        state.file_name = new_file_name();
        state.file_records = 0;
        state.file_bytes = 0;
        Ok(true)
    }

    /// Uploads every queued file. Entries are removed only when the upload
    /// succeeded and the file did not grow in the meantime. An empty queue is a
    /// no-op.
    pub async fn flush(&self) -> FlushSummary {
        let _flushing = self.flush_lock.lock().await;
        let mut summary = FlushSummary::default();

        let queued: Vec<PathBuf> = self.state.lock().await.uploads.keys().cloned().collect();
        if queued.is_empty() {
            debug!("No backup files to upload");
            return summary;
        }

        for path in queued {
            // Read under the state lock so the content matches the sequence.
            let (key, seq, bytes) = {
                let state = self.state.lock().await;
                let Some(entry) = state.uploads.get(&path) else {
                    continue;
                };
                let mut bytes = tokio::fs::read(&path).await.map_err(|source| UploadError::Read {
                    path: path.clone(),
                    source,
                });
                // Never ship a torn tail of the file still being written.
                if path == state.file_path() {
                    if let Ok(bytes) = &mut bytes {
                        bytes.truncate(usize::try_from(state.file_bytes).unwrap_or(usize::MAX));
                    }
                }
                (entry.key.clone(), entry.seq, bytes)
            };

            let result = match bytes {
                Ok(bytes) => self.store.upload(&key, bytes).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                error!(key = %key, "Failed to upload backup file, keeping it queued: {e}");
                summary.failed += 1;
                continue;
            }

            let mut state = self.state.lock().await;
            match state.uploads.get(&path) {
                Some(entry) if entry.seq == seq => {
                    state.uploads.remove(&path);
                    summary.uploaded += 1;
                }
                _ => {
                    warn!(key = %key, "Backup file grew during upload, keeping it queued");
                    summary.requeued += 1;
                }
            }
        }

        info!(
            uploaded = summary.uploaded,
            requeued = summary.requeued,
            failed = summary.failed,
            "Backup flush completed"
        );
        summary
    }

    /// Files still waiting for a successful upload.
    pub async fn pending_uploads(&self) -> Vec<PathBuf> {
        self.state.lock().await.uploads.keys().cloned().collect()
    }

    pub async fn current_file_path(&self) -> PathBuf {
        self.state.lock().await.file_path()
    }

    pub async fn current_folder_path(&self) -> PathBuf {
        self.state.lock().await.folder_path.clone()
    }
}

fn rotate_file_locked(state: &mut BackupState, max_records: usize) -> bool {
    if state.file_records < max_records {
        return false;
    }
    state.file_name = new_file_name();
    state.file_records = 0;
    state.file_bytes = 0;
    true
}

/// Appends `body` to the file at `path`, whose last complete record ends at
/// `boundary`. Bytes past the boundary, left by an earlier failed write, are
/// dropped first, and a failed write is cut back to the boundary.
async fn append_at_boundary(path: &Path, boundary: u64, body: &[u8]) -> Result<(), StagingError> {
    let io_err = |source| StagingError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(io_err)?;

    let on_disk = file.metadata().await.map_err(io_err)?.len();
    if on_disk > boundary {
        warn!(
            path = %path.display(),
            torn_bytes = on_disk - boundary,
            "Dropping incomplete record left by a failed write"
        );
        file.set_len(boundary).await.map_err(io_err)?;
    }

    let written = async {
        file.write_all(body).await?;
        file.flush().await
    }
    .await;
    if let Err(source) = written {
        if let Err(e) = file.set_len(boundary).await {
            warn!(
                path = %path.display(),
                "Failed to cut back a partial write, the next write retries: {e}"
            );
        }
        return Err(io_err(source));
    }
    Ok(())
}

fn new_file_name() -> String {
    format!("logs-{}.txt", Uuid::new_v4().simple())
}

async fn create_folder(root: &Path) -> Result<(String, PathBuf), StagingError> {
    let name = format!(
        "{}-{}",
        chrono::Utc::now().format("%Y-%m-%d"),
        Uuid::new_v4().simple()
    );
    let path = root.join(&name);
    tokio::fs::create_dir_all(&path)
        .await
        .map_err(|source| StagingError::Io {
            path: path.clone(),
            source,
        })?;
    Ok((name, path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::MemoryStore;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use tokio::sync::Notify;
    use tracing_test::traced_test;

    async fn store_in(
        dir: &Path,
        folder_max_size_mb: u64,
        file_max_records: usize,
    ) -> (BackupStore, Arc<MemoryStore>) {
        let objects = Arc::new(MemoryStore::new());
        let backup = BackupStore::new(dir, folder_max_size_mb, file_max_records, objects.clone())
            .await
            .unwrap();
        (backup, objects)
    }

    fn lines(path: &Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[tokio::test]
    async fn test_new_creates_dated_folder() {
        let dir = tempfile::tempdir().unwrap();
        let (backup, _) = store_in(dir.path(), 10, 100).await;

        let folder = backup.current_folder_path().await;
        assert!(folder.is_dir());
        let name = folder.file_name().unwrap().to_str().unwrap().to_string();
        assert_eq!(name.len(), "2024-01-01-".len() + 32);
        assert!(name.starts_with(&chrono::Utc::now().format("%Y-%m-%d").to_string()));

        let file = backup.current_file_path().await;
        let file_name = file.file_name().unwrap().to_str().unwrap();
        assert!(file_name.starts_with("logs-") && file_name.ends_with(".txt"));
        assert!(backup.pending_uploads().await.is_empty());
    }

    #[tokio::test]
    async fn test_stage_appends_ndjson_and_queues_file() {
        let dir = tempfile::tempdir().unwrap();
        let (backup, _) = store_in(dir.path(), 10, 100).await;

        let path = backup
            .stage(&[r#"{"a":1}"#.to_string(), r#"{"b":2}"#.to_string()], "500")
            .await
            .unwrap();
        backup.stage(&[r#"{"c":3}"#.to_string()], "500").await.unwrap();

        assert_eq!(lines(&path), vec![r#"{"a":1}"#, r#"{"b":2}"#, r#"{"c":3}"#]);
        assert_eq!(backup.pending_uploads().await, vec![path]);
    }

    #[tokio::test]
    async fn test_file_rotates_after_max_records() {
        let dir = tempfile::tempdir().unwrap();
        let (backup, _) = store_in(dir.path(), 10, 3).await;

        let first = backup
            .stage(&["1".to_string(), "2".to_string()], "r")
            .await
            .unwrap();
        assert_eq!(backup.current_file_path().await, first);

        backup.stage(&["3".to_string()], "r").await.unwrap();
        let second = backup.current_file_path().await;
        assert_ne!(first, second);
        assert_eq!(first.parent(), second.parent());
        assert_eq!(lines(&first).len(), 3);
        assert!(!second.exists());
    }

    #[tokio::test]
    async fn test_explicit_rotation_thresholds() {
        let dir = tempfile::tempdir().unwrap();
        let (backup, _) = store_in(dir.path(), 10, 100).await;
        backup.stage(&["1".to_string()], "r").await.unwrap();

        assert!(!backup.rotate_file_if_full(2).await);
        assert!(backup.rotate_file_if_full(1).await);
        assert!(!backup.rotate_folder_if_full(1).await.unwrap());
    }

    #[tokio::test]
    async fn test_folder_rotates_after_max_size() {
        let dir = tempfile::tempdir().unwrap();
        let (backup, _) = store_in(dir.path(), 1, 100).await;
        let first_folder = backup.current_folder_path().await;

        let big = "x".repeat(BYTES_PER_MB as usize);
        let staged = backup.stage(&[big], "r").await.unwrap();

        let second_folder = backup.current_folder_path().await;
        assert_ne!(first_folder, second_folder);
        assert!(second_folder.is_dir());
        assert_eq!(staged.parent().unwrap(), first_folder);
        assert_eq!(backup.current_file_path().await.parent().unwrap(), second_folder);
    }

    #[tokio::test]
    async fn test_concurrent_staging_keeps_batches_whole() {
        let dir = tempfile::tempdir().unwrap();
        let (backup, _) = store_in(dir.path(), 10, 10).await;
        let backup = Arc::new(backup);

        let mut handles = Vec::new();
        for task in 0..20 {
            let backup = backup.clone();
            handles.push(tokio::spawn(async move {
                let records: Vec<String> = (0..5).map(|i| format!("{task}-{i}")).collect();
                backup.stage(&records, "concurrent").await.unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let files = backup.pending_uploads().await;
        assert_eq!(files.len(), 10);
        let mut seen = HashSet::new();
        for file in files {
            let content = lines(&file);
            assert_eq!(content.len(), 10);
            for chunk in content.chunks(5) {
                let task = chunk[0].split('-').next().unwrap().to_string();
                for (i, line) in chunk.iter().enumerate() {
                    assert_eq!(line, &format!("{task}-{i}"));
                }
                assert!(seen.insert(task));
            }
        }
        assert_eq!(seen.len(), 20);
    }

    #[tokio::test]
    async fn test_flush_on_empty_queue_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let (backup, objects) = store_in(dir.path(), 10, 100).await;

        assert_eq!(backup.flush().await, FlushSummary::default());
        assert_eq!(objects.upload_count(), 0);
    }

    #[tokio::test]
    async fn test_flush_twice_uploads_once() {
        let dir = tempfile::tempdir().unwrap();
        let (backup, objects) = store_in(dir.path(), 10, 100).await;
        let path = backup.stage(&["a".to_string()], "r").await.unwrap();

        let first = backup.flush().await;
        let second = backup.flush().await;

        assert_eq!(first.uploaded, 1);
        assert_eq!(second, FlushSummary::default());
        assert_eq!(objects.upload_count(), 1);
        assert!(backup.pending_uploads().await.is_empty());
        assert!(path.exists());

        let folder = path.parent().unwrap().file_name().unwrap().to_str().unwrap();
        let file = path.file_name().unwrap().to_str().unwrap();
        let key = format!("{folder}/{file}");
        assert_eq!(objects.get(&key).await.unwrap(), b"a\n".to_vec());
    }

    #[tokio::test]
    async fn test_failed_upload_keeps_entry() {
        let dir = tempfile::tempdir().unwrap();
        let objects = Arc::new(MemoryStore::failing());
        let backup = BackupStore::new(dir.path(), 10, 100, objects.clone())
            .await
            .unwrap();
        let path = backup.stage(&["a".to_string()], "r").await.unwrap();

        let summary = backup.flush().await;
        assert_eq!(summary.failed, 1);
        assert_eq!(backup.pending_uploads().await, vec![path.clone()]);

        objects.set_failing(false);
        assert_eq!(backup.flush().await.uploaded, 1);
        assert!(backup.pending_uploads().await.is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_rotation_failure_keeps_staged_records() {
        let dir = tempfile::tempdir().unwrap();
        let (mut backup, _) = store_in(dir.path(), 1, 100).await;
        let folder = backup.current_folder_path().await;
        // New folders cannot be created below a regular file.
        let not_a_dir = dir.path().join("not-a-dir");
        std::fs::write(&not_a_dir, b"").unwrap();
        backup.root = not_a_dir;

        let big = "x".repeat(BYTES_PER_MB as usize);
        let staged = backup.stage(&[big.clone()], "r").await.unwrap();

        assert_eq!(lines(&staged), vec![big]);
        assert_eq!(backup.pending_uploads().await, vec![staged]);
        assert_eq!(backup.current_folder_path().await, folder);
        assert!(logs_contain("Backup folder rotation failed"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_torn_tail_is_dropped_before_next_append() {
        let dir = tempfile::tempdir().unwrap();
        let (backup, objects) = store_in(dir.path(), 10, 100).await;
        let path = backup.stage(&["a".to_string()], "r").await.unwrap();

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        std::io::Write::write_all(&mut file, br#"{"x":"#).unwrap();
        drop(file);

        // A flush in between only ships complete records.
        backup.flush().await;
        let folder = path.parent().unwrap().file_name().unwrap().to_str().unwrap();
        let key = format!("{folder}/{}", path.file_name().unwrap().to_str().unwrap());
        assert_eq!(objects.get(&key).await.unwrap(), b"a\n".to_vec());

        backup.stage(&["b".to_string()], "r").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a\nb\n");
        assert!(logs_contain("Dropping incomplete record"));
    }

    #[derive(Debug)]
    struct GatedStore {
        started: Notify,
        release: Notify,
    }

    #[async_trait]
    impl ObjectStore for GatedStore {
        async fn upload(&self, _key: &str, _bytes: Vec<u8>) -> Result<(), UploadError> {
            self.started.notify_one();
            self.release.notified().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_file_written_during_upload_stays_queued() {
        let dir = tempfile::tempdir().unwrap();
        let gate = Arc::new(GatedStore {
            started: Notify::new(),
            release: Notify::new(),
        });
        let backup = Arc::new(
            BackupStore::new(dir.path(), 10, 100, gate.clone())
                .await
                .unwrap(),
        );
        let path = backup.stage(&["a".to_string()], "r").await.unwrap();

        let flushing = {
            let backup = backup.clone();
            tokio::spawn(async move { backup.flush().await })
        };
        gate.started.notified().await;
        backup.stage(&["b".to_string()], "r").await.unwrap();
        gate.release.notify_one();

        let summary = flushing.await.unwrap();
        assert_eq!(summary.requeued, 1);
        assert_eq!(backup.pending_uploads().await, vec![path]);
    }
}
