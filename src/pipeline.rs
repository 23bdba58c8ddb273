use crate::config::ImportSettings;
use crate::error::{IngestError, Result};
use crate::extraction::{ExtractedItem, Extractor, LanguagePreference, RetryPolicy};
use crate::filters::{filter_by_duration, filter_existing, MetadataLookup};
use crate::planner;
use crate::storage::{ImportRecord, Storage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// An item found upstream, not yet known to be eligible or new
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateItem {
    pub item_id: String,
    pub title: String,
    pub published_at: Option<DateTime<Utc>>,
    /// Length in seconds, when discovery already knows it
    pub duration_secs: Option<u64>,
}

impl CandidateItem {
    pub fn new(item_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            title: title.into(),
            published_at: None,
            duration_secs: None,
        }
    }

    pub fn with_duration(mut self, seconds: u64) -> Self {
        self.duration_secs = Some(seconds);
        self
    }

    pub fn with_published_at(mut self, published_at: DateTime<Utc>) -> Self {
        self.published_at = Some(published_at);
        self
    }
}

/// Lists recent items of a channel
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn list_candidates(
        &self,
        source: &str,
        lookback: chrono::Duration,
        max_count: usize,
    ) -> Result<Vec<CandidateItem>>;
}

/// Stages of one import run, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportStage {
    Planning,
    Discovering,
    Filtering,
    Processing,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Succeeded,
    Failed,
    /// Never started because the run was cancelled
    Cancelled,
}

/// What happened to one selected candidate
#[derive(Debug, Clone, Serialize)]
pub struct ItemOutcome {
    /// Position in discovery order
    pub index: usize,
    pub item_id: String,
    pub title: String,
    pub status: ItemStatus,
    pub transcript_method: Option<String>,
    pub chapter_count: usize,
    pub attempts: usize,
    pub error: Option<String>,
    pub processing_time: Duration,
}

impl ItemOutcome {
    fn cancelled(index: usize, candidate: &CandidateItem) -> Self {
        Self {
            index,
            item_id: candidate.item_id.clone(),
            title: candidate.title.clone(),
            status: ItemStatus::Cancelled,
            transcript_method: None,
            chapter_count: 0,
            attempts: 0,
            error: None,
            processing_time: Duration::ZERO,
        }
    }

    fn failed(index: usize, candidate: &CandidateItem, error: String, processing_time: Duration) -> Self {
        Self {
            status: ItemStatus::Failed,
            error: Some(error),
            processing_time,
            ..Self::cancelled(index, candidate)
        }
    }
}

/// Tally of one channel import
#[derive(Debug, Clone, Serialize)]
pub struct ImportResult {
    pub source: String,
    pub requested: usize,
    pub fetch_size: usize,
    pub fetched: usize,
    pub filtered_duration: usize,
    pub filtered_duplicate: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Wanted items that did not survive filtering
    pub shortfall: usize,
    pub cancelled: bool,
    pub stage: ImportStage,
    pub discovery_error: Option<String>,
    pub outcomes: Vec<ItemOutcome>,
    pub total_time: Duration,
}

impl ImportResult {
    fn new(source: &str, requested: usize) -> Self {
        Self {
            source: source.to_string(),
            requested,
            fetch_size: 0,
            fetched: 0,
            filtered_duration: 0,
            filtered_duplicate: 0,
            processed: 0,
            succeeded: 0,
            failed: 0,
            shortfall: 0,
            cancelled: false,
            stage: ImportStage::Planning,
            discovery_error: None,
            outcomes: Vec::new(),
            total_time: Duration::ZERO,
        }
    }
}

/// Progress events emitted during a run
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ImportProgress {
    Stage {
        stage: ImportStage,
    },
    ItemFinished {
        index: usize,
        total: usize,
        item_id: String,
        status: ItemStatus,
    },
}

/// Discovery → filtering → extraction → persistence for one channel
pub struct ChannelPipeline {
    discovery: Arc<dyn Discovery>,
    metadata: Arc<dyn MetadataLookup>,
    storage: Arc<dyn Storage>,
    extractor: Arc<Extractor>,
    progress: Option<mpsc::UnboundedSender<ImportProgress>>,
    cancel: CancellationToken,
}

impl ChannelPipeline {
    pub fn new(
        discovery: Arc<dyn Discovery>,
        metadata: Arc<dyn MetadataLookup>,
        storage: Arc<dyn Storage>,
        extractor: Arc<Extractor>,
    ) -> Self {
        Self {
            discovery,
            metadata,
            storage,
            extractor,
            progress: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_progress(mut self, progress: mpsc::UnboundedSender<ImportProgress>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that stops new items from starting once cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn extractor(&self) -> &Arc<Extractor> {
        &self.extractor
    }

    /// Transcript and chapters of one item, outside of a channel import
    pub async fn extract_one(&self, item_id: &str, language: &LanguagePreference) -> Result<ExtractedItem> {
        self.extractor.extract_one(item_id, language).await
    }

    /// Import up to `settings.max_items` new items from `source`.
    ///
    /// Only configuration problems are returned as errors, and they are
    /// raised before any network call. Everything else ends up in the result.
    pub async fn run_channel_import(&self, source: &str, settings: &ImportSettings) -> Result<ImportResult> {
        self.validate(settings)?;

        let start = Instant::now();
        let mut result = ImportResult::new(source, settings.max_items);

        // Planning
        self.enter(&mut result, ImportStage::Planning);
        result.fetch_size = planner::fetch_size(settings.max_items);
        info!("🧮 Requesting {} candidates for {} new items", result.fetch_size, settings.max_items);

        // Discovering
        self.enter(&mut result, ImportStage::Discovering);
        let candidates = match self
            .discovery
            .list_candidates(source, settings.lookback(), result.fetch_size)
            .await
        {
            Ok(candidates) => candidates,
            Err(e) => {
                error!("❌ Discovery failed for {}: {}", source, e);
                result.discovery_error = Some(e.to_string());
                Vec::new()
            }
        };
        result.fetched = candidates.len();
        info!("🔍 Discovered {} candidates from {}", result.fetched, source);

        // Filtering: duration first, it does not depend on storage
        self.enter(&mut result, ImportStage::Filtering);
        let by_duration = filter_by_duration(candidates, self.metadata.as_ref(), settings).await;
        result.filtered_duration = by_duration.removed;
        let deduped = filter_existing(by_duration.kept, self.storage.as_ref(), settings).await;
        result.filtered_duplicate = deduped.removed;

        let mut selected = deduped.kept;
        selected.truncate(settings.max_items);
        result.shortfall = planner::shortfall(settings.max_items, selected.len());
        if result.shortfall > 0 {
            warn!("⚠️ Only {} new items available, {} short of {}", selected.len(), result.shortfall, settings.max_items);
        }

        // Processing
        self.enter(&mut result, ImportStage::Processing);
        result.outcomes = self.process(selected, settings).await;

        for outcome in &result.outcomes {
            match outcome.status {
                ItemStatus::Succeeded => result.succeeded += 1,
                ItemStatus::Failed => result.failed += 1,
                ItemStatus::Cancelled => result.cancelled = true,
            }
        }
        result.processed = result.succeeded + result.failed;
        result.cancelled |= self.cancel.is_cancelled();

        self.enter(&mut result, ImportStage::Done);
        result.total_time = start.elapsed();
        info!(
            "🎉 Import of {} done: {} succeeded, {} failed in {:.2}s",
            source,
            result.succeeded,
            result.failed,
            result.total_time.as_secs_f64()
        );

        Ok(result)
    }

    fn validate(&self, settings: &ImportSettings) -> Result<()> {
        settings.validate()?;
        if settings.extract_transcripts {
            self.extractor.validate()?;
        }
        Ok(())
    }

    fn enter(&self, result: &mut ImportResult, stage: ImportStage) {
        debug!("Stage {:?} → {:?}", result.stage, stage);
        result.stage = stage;
        self.emit(ImportProgress::Stage { stage });
    }

    fn emit(&self, event: ImportProgress) {
        if let Some(progress) = &self.progress {
            // A dropped receiver only means nobody is watching
            let _ = progress.send(event);
        }
    }

    /// Process in batches, in parallel within a batch. Outcomes come back in
    /// discovery order.
    async fn process(&self, selected: Vec<CandidateItem>, settings: &ImportSettings) -> Vec<ItemOutcome> {
        let total = selected.len();
        let mut slots: Vec<Option<ItemOutcome>> = vec![None; total];
        let semaphore = Arc::new(Semaphore::new(settings.concurrency));
        let policy = RetryPolicy::new(settings.max_retries, self.extractor.policy().backoff);

        let indexed: Vec<(usize, CandidateItem)> = selected.into_iter().enumerate().collect();

        for (batch_number, batch) in indexed.chunks(settings.batch_size).enumerate() {
            debug!("📦 Batch {} with {} items", batch_number + 1, batch.len());
            let (tx, mut rx) = mpsc::channel(batch.len().max(1));

            for (index, candidate) in batch.iter().cloned() {
                let tx = tx.clone();
                let semaphore = Arc::clone(&semaphore);
                let extractor = Arc::clone(&self.extractor);
                let storage = Arc::clone(&self.storage);
                let cancel = self.cancel.clone();
                let settings = settings.clone();

                tokio::spawn(async move {
                    let outcome = match semaphore.acquire().await {
                        Ok(_permit) if !cancel.is_cancelled() => {
                            info!("📹 Processing item {}/{}: {}", index + 1, total, candidate.item_id);
                            process_item(index, candidate, extractor, storage, &settings, policy).await
                        }
                        _ => ItemOutcome::cancelled(index, &candidate),
                    };

                    if let Err(e) = tx.send(outcome).await {
                        error!("Failed to send result: {}", e);
                    }
                });
            }

            // Drop the original sender to close the channel when all tasks complete
            drop(tx);

            while let Some(outcome) = rx.recv().await {
                match outcome.status {
                    ItemStatus::Succeeded => info!("✅ Completed: {} in {:.2}s", outcome.item_id, outcome.processing_time.as_secs_f64()),
                    ItemStatus::Failed => warn!("❌ Failed: {} - {}", outcome.item_id, outcome.error.as_deref().unwrap_or("Unknown error")),
                    ItemStatus::Cancelled => debug!("🛑 Not started: {}", outcome.item_id),
                }
                self.emit(ImportProgress::ItemFinished {
                    index: outcome.index,
                    total,
                    item_id: outcome.item_id.clone(),
                    status: outcome.status,
                });

                let index = outcome.index;
                slots[index] = Some(outcome);
            }
        }

        // A slot is only empty if its task panicked
        slots
            .into_iter()
            .zip(indexed.iter())
            .map(|(slot, (index, candidate))| {
                slot.unwrap_or_else(|| ItemOutcome::failed(*index, candidate, "processing task aborted".to_string(), Duration::ZERO))
            })
            .collect()
    }
}

async fn process_item(
    index: usize,
    candidate: CandidateItem,
    extractor: Arc<Extractor>,
    storage: Arc<dyn Storage>,
    settings: &ImportSettings,
    policy: RetryPolicy,
) -> ItemOutcome {
    let start = Instant::now();
    let timeout = settings.item_timeout();

    let work = async {
        let extracted = extractor
            .extract_item(
                &candidate.item_id,
                &settings.language,
                policy,
                settings.extract_transcripts,
                settings.extract_chapters,
            )
            .await?;

        let record = ImportRecord {
            item: candidate.clone(),
            transcript: extracted.transcript.clone(),
            transcript_method: extracted.transcript_method.clone(),
            chapters: extracted.chapters.clone(),
            chapter_method: extracted.chapter_method.clone(),
            imported_at: Utc::now(),
        };
        storage.persist(&record).await?;
        Ok::<ExtractedItem, IngestError>(extracted)
    };

    match tokio::time::timeout(timeout, work).await {
        Ok(Ok(extracted)) => ItemOutcome {
            index,
            item_id: candidate.item_id.clone(),
            title: candidate.title.clone(),
            status: ItemStatus::Succeeded,
            transcript_method: extracted.transcript_method,
            chapter_count: extracted.chapters.len(),
            attempts: extracted.attempts.len(),
            error: None,
            processing_time: start.elapsed(),
        },
        Ok(Err(e)) => {
            let attempts = match &e {
                IngestError::ExtractionExhausted { attempts, .. } => attempts.len(),
                _ => 0,
            };
            ItemOutcome {
                attempts,
                ..ItemOutcome::failed(index, &candidate, e.to_string(), start.elapsed())
            }
        }
        Err(_) => ItemOutcome::failed(index, &candidate, IngestError::Timeout(timeout).to_string(), start.elapsed()),
    }
}
