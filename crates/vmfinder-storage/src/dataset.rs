use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::info;
use uuid::Uuid;
use vmfinder_core::VmInstance;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record for provider `{found}` passed to replace for `{expected}`")]
    ProviderMismatch { expected: String, found: String },
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{context}: {source}")]
    Serde {
        context: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("stored value out of range: {0}")]
    OutOfRange(String),
}

/// Per-provider summary the query layer uses to report dataset freshness.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderFreshness {
    pub provider: String,
    pub records: usize,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Persistence seam for normalized records.
///
/// `replace_provider_data` is the only mutation: it drops every record tagged with
/// `provider` and inserts `records` as one atomic unit. Readers observe either the
/// old set or the new set for that provider, never a mix.
#[async_trait]
pub trait DatasetStore: Send + Sync {
    async fn replace_provider_data(
        &self,
        provider: &str,
        records: Vec<VmInstance>,
    ) -> Result<usize, StoreError>;

    async fn records_for_provider(&self, provider: &str) -> Result<Vec<VmInstance>, StoreError>;

    async fn all_records(&self) -> Result<Vec<VmInstance>, StoreError>;

    async fn freshness(&self) -> Result<Vec<ProviderFreshness>, StoreError> {
        Ok(summarize(&self.all_records().await?))
    }
}

fn io_err(context: String) -> impl FnOnce(std::io::Error) -> StoreError {
    move |source| StoreError::Io { context, source }
}

pub(crate) fn ensure_single_provider(
    provider: &str,
    records: &[VmInstance],
) -> Result<(), StoreError> {
    match records.iter().find(|r| r.provider != provider) {
        Some(stray) => Err(StoreError::ProviderMismatch {
            expected: provider.to_string(),
            found: stray.provider.clone(),
        }),
        None => Ok(()),
    }
}

pub(crate) fn summarize(records: &[VmInstance]) -> Vec<ProviderFreshness> {
    let mut by_provider: BTreeMap<&str, ProviderFreshness> = BTreeMap::new();
    for rec in records {
        let entry = by_provider
            .entry(rec.provider.as_str())
            .or_insert_with(|| ProviderFreshness {
                provider: rec.provider.clone(),
                records: 0,
                last_updated: None,
            });
        entry.records += 1;
        entry.last_updated = entry.last_updated.max(Some(rec.last_updated));
    }
    by_provider.into_values().collect()
}

type Snapshot = BTreeMap<String, Arc<Vec<VmInstance>>>;

fn group_by_provider(records: Vec<VmInstance>) -> Snapshot {
    let mut grouped: BTreeMap<String, Vec<VmInstance>> = BTreeMap::new();
    for rec in records {
        grouped.entry(rec.provider.clone()).or_default().push(rec);
    }
    grouped
        .into_iter()
        .map(|(provider, recs)| (provider, Arc::new(recs)))
        .collect()
}

fn flatten(snapshot: &Snapshot) -> Vec<VmInstance> {
    snapshot
        .values()
        .flat_map(|recs| recs.iter().cloned())
        .collect()
}

/// Process-local store; each provider's batch is swapped in under one write lock.
#[derive(Debug, Default)]
pub struct MemoryDatasetStore {
    providers: RwLock<Snapshot>,
}

impl MemoryDatasetStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DatasetStore for MemoryDatasetStore {
    async fn replace_provider_data(
        &self,
        provider: &str,
        records: Vec<VmInstance>,
    ) -> Result<usize, StoreError> {
        ensure_single_provider(provider, &records)?;
        let count = records.len();
        let batch = Arc::new(records);
        self.providers
            .write()
            .await
            .insert(provider.to_string(), batch);
        Ok(count)
    }

    async fn records_for_provider(&self, provider: &str) -> Result<Vec<VmInstance>, StoreError> {
        Ok(self
            .providers
            .read()
            .await
            .get(provider)
            .map(|recs| recs.as_ref().clone())
            .unwrap_or_default())
    }

    async fn all_records(&self) -> Result<Vec<VmInstance>, StoreError> {
        Ok(flatten(&*self.providers.read().await))
    }
}

/// Flat JSON file holding every provider's records.
///
/// Each replace rewrites the whole file through a temp file and rename, so a crash
/// leaves either the previous file or the new one on disk.
#[derive(Debug)]
pub struct JsonFileDatasetStore {
    path: PathBuf,
    snapshot: Mutex<Arc<Snapshot>>,
}

impl JsonFileDatasetStore {
    /// Opens `path`, loading existing records when the file is present.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let exists = fs::try_exists(&path).await.map_err(|source| StoreError::Io {
            context: format!("checking dataset file {}", path.display()),
            source,
        })?;

        let snapshot = if exists {
            let text = fs::read_to_string(&path)
                .await
                .map_err(|source| StoreError::Io {
                    context: format!("reading dataset file {}", path.display()),
                    source,
                })?;
            let records: Vec<VmInstance> =
                serde_json::from_str(&text).map_err(|source| StoreError::Serde {
                    context: format!("parsing dataset file {}", path.display()),
                    source,
                })?;
            info!(path = %path.display(), records = records.len(), "loaded dataset file");
            group_by_provider(records)
        } else {
            Snapshot::new()
        };

        Ok(Self {
            path,
            snapshot: Mutex::new(Arc::new(snapshot)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write_atomically(&self, records: &[VmInstance]) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(records).map_err(|source| StoreError::Serde {
            context: "serializing dataset".to_string(),
            source,
        })?;

        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .await
            .map_err(|source| StoreError::Io {
                context: format!("creating dataset directory {}", parent.display()),
                source,
            })?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io_err(format!("opening temp dataset file {}", temp_path.display())))?;

        let written = async {
            file.write_all(&bytes)
                .await
                .map_err(io_err(format!("writing temp dataset file {}", temp_path.display())))?;
            file.sync_all()
                .await
                .map_err(io_err(format!("syncing temp dataset file {}", temp_path.display())))?;
            drop(file);
            fs::rename(&temp_path, &self.path).await.map_err(io_err(format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                self.path.display()
            )))
        }
        .await;

        if written.is_err() {
            let _ = fs::remove_file(&temp_path).await;
        }
        written
    }
}

#[async_trait]
impl DatasetStore for JsonFileDatasetStore {
    async fn replace_provider_data(
        &self,
        provider: &str,
        records: Vec<VmInstance>,
    ) -> Result<usize, StoreError> {
        ensure_single_provider(provider, &records)?;
        let count = records.len();

        // Held across the write so file replaces are serialized.
        let mut current = self.snapshot.lock().await;
        let mut next = current.as_ref().clone();
        next.insert(provider.to_string(), Arc::new(records));

        self.write_atomically(&flatten(&next)).await?;
        *current = Arc::new(next);
        Ok(count)
    }

    async fn records_for_provider(&self, provider: &str) -> Result<Vec<VmInstance>, StoreError> {
        let snapshot = self.snapshot.lock().await.clone();
        Ok(snapshot
            .get(provider)
            .map(|recs| recs.as_ref().clone())
            .unwrap_or_default())
    }

    async fn all_records(&self) -> Result<Vec<VmInstance>, StoreError> {
        let snapshot = self.snapshot.lock().await.clone();
        Ok(flatten(&snapshot))
    }
}
