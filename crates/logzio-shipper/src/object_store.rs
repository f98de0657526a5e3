// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Destinations for staged backup files.
//!
//! The backup store only knows how to hand a key and the file's bytes to an
//! [`ObjectStore`]. Keys have the shape `<folder>/<file>`.

use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::Config;
use crate::constants::LOCAL_UPLOAD_DIR_NAME;
use crate::error::UploadError;

const BLOB_TYPE_HEADER: &str = "x-ms-blob-type";
const BLOCK_BLOB: &str = "BlockBlob";

#[async_trait]
pub trait ObjectStore: Debug + Send + Sync {
    /// Writes `bytes` under `key`, replacing any previous object.
    async fn upload(&self, key: &str, bytes: Vec<u8>) -> Result<(), UploadError>;
}

/// Picks the sink from configuration: Azure Blob when a container URL is set,
/// otherwise a local directory.
#[must_use]
pub fn from_config(config: &Config, client: reqwest::Client) -> Arc<dyn ObjectStore> {
    match &config.backup_container_url {
        Some(container_url) => Arc::new(AzureBlobStore::new(
            client,
            container_url,
            config.backup_sas_token.as_deref(),
        )),
        None => {
            let root = config
                .backup_upload_dir
                .clone()
                .unwrap_or_else(|| config.backup_dir.join(LOCAL_UPLOAD_DIR_NAME));
            Arc::new(LocalDirStore::new(root))
        }
    }
}

/// Azure Blob container reached through the Blob REST API.
#[derive(Clone)]
pub struct AzureBlobStore {
    client: reqwest::Client,
    container_url: String,
    sas_token: Option<String>,
}

impl fmt::Debug for AzureBlobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AzureBlobStore")
            .field("container_url", &self.container_url)
            .field("sas_token", &self.sas_token.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

impl AzureBlobStore {
    #[must_use]
    pub fn new(client: reqwest::Client, container_url: &str, sas_token: Option<&str>) -> Self {
        Self {
            client,
            container_url: container_url.trim_end_matches('/').to_string(),
            sas_token: sas_token
                .map(|token| token.trim_start_matches('?').to_string())
                .filter(|token| !token.is_empty()),
        }
    }

    fn blob_url(&self, key: &str) -> String {
        match &self.sas_token {
            Some(sas) => format!("{}/{key}?{sas}", self.container_url),
            None => format!("{}/{key}", self.container_url),
        }
    }
}

#[async_trait]
impl ObjectStore for AzureBlobStore {
    async fn upload(&self, key: &str, bytes: Vec<u8>) -> Result<(), UploadError> {
        let size = bytes.len();
        let resp = self
            .client
            .put(self.blob_url(key))
            .header(BLOB_TYPE_HEADER, BLOCK_BLOB)
            .body(bytes)
            .send()
            .await
            // The request URL carries the SAS token.
            .map_err(reqwest::Error::without_url)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(UploadError::Status {
                key: key.to_string(),
                status,
            });
        }
        debug!("Uploaded {size} bytes to blob {key}");
        Ok(())
    }
}

/// Writes objects as files below a root directory.
#[derive(Debug, Clone)]
pub struct LocalDirStore {
    root: PathBuf,
}

impl LocalDirStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ObjectStore for LocalDirStore {
    async fn upload(&self, key: &str, bytes: Vec<u8>) -> Result<(), UploadError> {
        let target = self.root.join(key);
        let io_err = |source| UploadError::Io {
            key: key.to_string(),
            source,
        };

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        tokio::fs::write(&target, bytes).await.map_err(io_err)?;
        debug!("Copied object {key} to {}", target.display());
        Ok(())
    }
}

/// In-memory store. Can be switched into a failing mode to exercise the
/// retained-entry path of a flush.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    uploads: AtomicUsize,
    failing: AtomicBool,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn failing() -> Self {
        let store = Self::default();
        store.set_failing(true);
        store
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of successful uploads, counting overwrites.
    #[must_use]
    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().await.get(key).cloned()
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn upload(&self, key: &str, bytes: Vec<u8>) -> Result<(), UploadError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(UploadError::Io {
                key: key.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "memory store is failing"),
            });
        }
        self.objects.lock().await.insert(key.to_string(), bytes);
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
