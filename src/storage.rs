use crate::error::{IngestError, Result};
use crate::extraction::{Chapter, Transcript};
use crate::pipeline::CandidateItem;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// What gets persisted for one imported item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportRecord {
    pub item: CandidateItem,
    pub transcript: Option<Transcript>,
    pub transcript_method: Option<String>,
    pub chapters: Vec<Chapter>,
    pub chapter_method: Option<String>,
    pub imported_at: DateTime<Utc>,
}

impl ImportRecord {
    pub fn item_id(&self) -> &str {
        &self.item.item_id
    }
}

/// Persistent store of imported items, keyed by item id
#[async_trait]
pub trait Storage: Send + Sync {
    async fn exists(&self, item_id: &str) -> Result<bool>;

    async fn persist(&self, record: &ImportRecord) -> Result<()>;

    async fn load(&self, item_id: &str) -> Result<Option<ImportRecord>>;
}

/// Storage kept entirely in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    records: Arc<RwLock<HashMap<String, ImportRecord>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.records.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn exists(&self, item_id: &str) -> Result<bool> {
        Ok(self.records.read().await.contains_key(item_id))
    }

    async fn persist(&self, record: &ImportRecord) -> Result<()> {
        self.records
            .write()
            .await
            .insert(record.item_id().to_string(), record.clone());
        Ok(())
    }

    async fn load(&self, item_id: &str) -> Result<Option<ImportRecord>> {
        Ok(self.records.read().await.get(item_id).cloned())
    }
}

/// One JSON file per imported item, with an in-memory index of known ids
#[derive(Debug, Clone)]
pub struct JsonFileStorage {
    dir: PathBuf,
    known: Arc<RwLock<HashMap<String, PathBuf>>>,
}

impl JsonFileStorage {
    /// Open (creating if needed) a storage directory and index the records in it
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;

        let storage = Self {
            dir,
            known: Arc::new(RwLock::new(HashMap::new())),
        };
        storage.index_existing().await?;

        let count = storage.known.read().await.len();
        info!("📊 Storage at {} holds {} items", storage.dir.display(), count);
        Ok(storage)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn index_existing(&self) -> Result<()> {
        let mut entries = fs::read_dir(&self.dir).await?;
        let mut known = self.known.write().await;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(false, |ext| ext == "json") {
                match path.file_stem().and_then(|s| s.to_str()) {
                    Some(item_id) => {
                        known.insert(item_id.to_string(), path.clone());
                    }
                    None => warn!("Skipping unreadable record name {}", path.display()),
                }
            }
        }

        debug!("📁 Indexed {} records", known.len());
        Ok(())
    }

    fn record_path(&self, item_id: &str) -> Result<PathBuf> {
        let valid = !item_id.is_empty()
            && item_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(IngestError::Storage(format!("invalid item id: {:?}", item_id)));
        }
        Ok(self.dir.join(format!("{}.json", item_id)))
    }
}

#[async_trait]
impl Storage for JsonFileStorage {
    async fn exists(&self, item_id: &str) -> Result<bool> {
        Ok(self.known.read().await.contains_key(item_id))
    }

    async fn persist(&self, record: &ImportRecord) -> Result<()> {
        let path = self.record_path(record.item_id())?;
        let content = serde_json::to_string_pretty(record)?;

        // Write then rename so a crash never leaves a truncated record behind
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, &path).await?;

        self.known.write().await.insert(record.item_id().to_string(), path);
        debug!("💾 Persisted {}", record.item_id());
        Ok(())
    }

    async fn load(&self, item_id: &str) -> Result<Option<ImportRecord>> {
        let path = match self.known.read().await.get(item_id) {
            Some(path) => path.clone(),
            None => return Ok(None),
        };
        let content = fs::read_to_string(&path).await?;
        Ok(Some(serde_json::from_str(&content)?))
    }
}
