use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use yt_ingest::extraction::{AttemptOutcome, TrackKind, TranscriptMethod};
use yt_ingest::filters::{filter_by_duration, filter_existing};
use yt_ingest::pipeline::ItemStatus;
use yt_ingest::planner::{fetch_size, UPSTREAM_BATCH_CEILING};
use yt_ingest::pool::{PoolPhase, DEFAULT_ROTATION_INTERVAL};
use yt_ingest::{
    AddressIdentity, AddressPool, CandidateItem, ChannelPipeline, Discovery, Extractor, FetchError, ImportRecord,
    ImportSettings, IngestError, JsonFileStorage, LanguagePreference, MemoryStorage, MetadataLookup, Result,
    RetryPolicy, Storage, Transcript, TranscriptSegment,
};

/// Returns every candidate it holds, ignoring the requested size
struct FixedDiscovery {
    candidates: Vec<CandidateItem>,
    calls: AtomicUsize,
    requested: Mutex<Vec<usize>>,
}

impl FixedDiscovery {
    fn new(candidates: Vec<CandidateItem>) -> Arc<Self> {
        Arc::new(Self {
            candidates,
            calls: AtomicUsize::new(0),
            requested: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Discovery for FixedDiscovery {
    async fn list_candidates(&self, _source: &str, _lookback: chrono::Duration, max_count: usize) -> Result<Vec<CandidateItem>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requested.lock().unwrap().push(max_count);
        Ok(self.candidates.clone())
    }
}

struct Durations(HashMap<String, u64>);

#[async_trait]
impl MetadataLookup for Durations {
    async fn batch_durations(&self, item_ids: &[String]) -> Result<HashMap<String, Option<u64>>> {
        Ok(item_ids.iter().map(|id| (id.clone(), self.0.get(id).copied())).collect())
    }
}

struct BrokenMetadata;

#[async_trait]
impl MetadataLookup for BrokenMetadata {
    async fn batch_durations(&self, _item_ids: &[String]) -> Result<HashMap<String, Option<u64>>> {
        Err(IngestError::upstream("HTTP 503"))
    }
}

/// Succeeds with the item id as text. Sleeps for ids starting with "slow",
/// fails for ids starting with "bad", cancels `cancel_on` when it reaches it.
struct EchoTranscripts {
    cancel: Option<(String, CancellationToken)>,
    calls: AtomicUsize,
}

impl EchoTranscripts {
    fn new() -> Arc<Self> {
        Arc::new(Self { cancel: None, calls: AtomicUsize::new(0) })
    }

    fn cancelling_at(item_id: &str, token: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            cancel: Some((item_id.to_string(), token)),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl TranscriptMethod for EchoTranscripts {
    fn name(&self) -> &str {
        "echo"
    }

    async fn fetch_transcript(
        &self,
        item_id: &str,
        language: &LanguagePreference,
        _identity: &AddressIdentity,
    ) -> std::result::Result<Transcript, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some((at, token)) = &self.cancel {
            if at == item_id {
                token.cancel();
            }
        }
        if item_id.starts_with("slow") {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        if item_id.starts_with("bad") {
            return Err(FetchError::transient("connection reset by peer"));
        }
        Ok(Transcript {
            language: language.target.clone(),
            kind: TrackKind::Manual,
            segments: vec![TranscriptSegment::new(0.0, item_id)],
        })
    }
}

fn items(prefix: &str, count: usize) -> Vec<CandidateItem> {
    (0..count)
        .map(|i| CandidateItem::new(format!("{}{}", prefix, i), format!("Episode {}", i)))
        .collect()
}

fn record(candidate: &CandidateItem) -> ImportRecord {
    ImportRecord {
        item: candidate.clone(),
        transcript: None,
        transcript_method: None,
        chapters: Vec::new(),
        chapter_method: None,
        imported_at: chrono::Utc::now(),
    }
}

fn extractor(method: Arc<dyn TranscriptMethod>, pool_size: usize, max_retries: u32) -> Arc<Extractor> {
    let pool = AddressPool::rotating("gate.proxy.test", 80, "customer", "secret", pool_size, DEFAULT_ROTATION_INTERVAL).unwrap();
    Arc::new(Extractor::new(Arc::new(pool), RetryPolicy::new(max_retries, Duration::ZERO)).with_transcript_method(method))
}

fn settings(max_items: usize) -> ImportSettings {
    ImportSettings {
        max_items,
        batch_size: 4,
        concurrency: 3,
        ..ImportSettings::default()
    }
}

#[tokio::test]
async fn test_existing_items_are_skipped_without_requery() {
    let candidates = items("v", 50);
    let storage = Arc::new(MemoryStorage::new());
    for (i, candidate) in candidates.iter().enumerate() {
        if i % 5 < 3 {
            storage.persist(&record(candidate)).await.unwrap();
        }
    }
    assert_eq!(storage.len().await, 30);

    let discovery = FixedDiscovery::new(candidates);
    let pipeline = ChannelPipeline::new(
        discovery.clone(),
        Arc::new(Durations(HashMap::new())),
        storage.clone(),
        extractor(EchoTranscripts::new(), 3, 3),
    );

    let result = pipeline.run_channel_import("@channel", &settings(20)).await.unwrap();

    assert_eq!(discovery.calls.load(Ordering::SeqCst), 1);
    assert_eq!(*discovery.requested.lock().unwrap(), vec![40]);
    assert_eq!(result.fetched, 50);
    assert_eq!(result.filtered_duplicate, 30);
    assert_eq!(result.processed, 20);
    assert_eq!(result.succeeded, 20);
    assert_eq!(result.shortfall, 0);
    assert_eq!(storage.len().await, 50);
}

#[tokio::test]
async fn test_yield_matches_target_when_enough_new_items() {
    // One in four candidates is already known
    let candidates = items("v", 40);
    let storage = Arc::new(MemoryStorage::new());
    for candidate in candidates.iter().step_by(4) {
        storage.persist(&record(candidate)).await.unwrap();
    }

    let pipeline = ChannelPipeline::new(
        FixedDiscovery::new(candidates.clone()),
        Arc::new(Durations(HashMap::new())),
        storage,
        extractor(EchoTranscripts::new(), 2, 2),
    );
    let result = pipeline.run_channel_import("@channel", &settings(10)).await.unwrap();

    assert_eq!(result.processed, 10);
    let processed: Vec<&str> = result.outcomes.iter().map(|o| o.item_id.as_str()).collect();
    let expected: Vec<String> = candidates
        .iter()
        .enumerate()
        .filter(|(i, _)| i % 4 != 0)
        .take(10)
        .map(|(_, c)| c.item_id.clone())
        .collect();
    assert_eq!(processed, expected.iter().map(String::as_str).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_repeated_discovery_ids_import_once() {
    let a = CandidateItem::new("a", "First");
    let b = CandidateItem::new("b", "Second");
    let storage = Arc::new(MemoryStorage::new());
    let pipeline = ChannelPipeline::new(
        FixedDiscovery::new(vec![a.clone(), a, b]),
        Arc::new(Durations(HashMap::new())),
        storage.clone(),
        extractor(EchoTranscripts::new(), 2, 2),
    );

    let result = pipeline.run_channel_import("@channel", &settings(2)).await.unwrap();

    let processed: Vec<&str> = result.outcomes.iter().map(|o| o.item_id.as_str()).collect();
    assert_eq!(processed, vec!["a", "b"]);
    assert_eq!(result.filtered_duplicate, 1);
    assert_eq!(result.succeeded, 2);
    assert_eq!(result.shortfall, 0);
    assert_eq!(storage.len().await, 2);
}

#[tokio::test]
async fn test_unknown_durations_are_all_eligible() {
    let pipeline = ChannelPipeline::new(
        FixedDiscovery::new(items("v", 5)),
        Arc::new(BrokenMetadata),
        Arc::new(MemoryStorage::new()),
        extractor(EchoTranscripts::new(), 1, 1),
    );
    let result = pipeline.run_channel_import("@channel", &settings(5)).await.unwrap();

    assert_eq!(result.filtered_duration, 0);
    assert_eq!(result.processed, 5);
    assert_eq!(result.succeeded, 5);
}

#[tokio::test]
async fn test_shorts_filtered_before_dedup() {
    let candidates = vec![
        CandidateItem::new("short", "Quick tip").with_duration(45),
        CandidateItem::new("known", "Old"),
        CandidateItem::new("long", "Full class"),
        CandidateItem::new("edge", "Exactly a minute"),
    ];
    let durations = Durations(HashMap::from([("long".to_string(), 3600), ("edge".to_string(), 60)]));
    let storage = Arc::new(MemoryStorage::new());
    storage.persist(&record(&candidates[1])).await.unwrap();

    let pipeline = ChannelPipeline::new(FixedDiscovery::new(candidates), Arc::new(durations), storage, extractor(EchoTranscripts::new(), 1, 1));
    let result = pipeline.run_channel_import("@channel", &settings(5)).await.unwrap();

    assert_eq!(result.filtered_duration, 2);
    assert_eq!(result.filtered_duplicate, 1);
    assert_eq!(result.outcomes.len(), 1);
    assert_eq!(result.outcomes[0].item_id, "long");
    assert_eq!(result.shortfall, 4);
}

#[tokio::test]
async fn test_dedup_output_is_unknown_subset() {
    let candidates = items("v", 5);

    for mask in 0u32..32 {
        let storage = MemoryStorage::new();
        for (i, candidate) in candidates.iter().enumerate() {
            if mask & (1 << i) != 0 {
                storage.persist(&record(candidate)).await.unwrap();
            }
        }

        let outcome = filter_existing(candidates.clone(), &storage, &ImportSettings::default()).await;
        let input: HashSet<&str> = candidates.iter().map(|c| c.item_id.as_str()).collect();
        for kept in &outcome.kept {
            assert!(input.contains(kept.item_id.as_str()));
            assert!(!storage.exists(&kept.item_id).await.unwrap());
        }
        assert_eq!(outcome.kept.len() + outcome.removed, candidates.len());
    }
}

#[tokio::test]
async fn test_duration_filter_idempotent_over_mixed_batch() {
    let durations = Durations(HashMap::from([
        ("v0".to_string(), 30),
        ("v1".to_string(), 61),
        ("v2".to_string(), 600),
        ("v3".to_string(), 60),
    ]));
    let settings = ImportSettings::default();

    let once = filter_by_duration(items("v", 6), &durations, &settings).await;
    let twice = filter_by_duration(once.kept.clone(), &durations, &settings).await;
    assert_eq!(once.kept, twice.kept);
    assert_eq!(twice.removed, 0);
}

#[test]
fn test_planner_monotonic_and_bounded() {
    let sizes: Vec<usize> = (0..=200).map(fetch_size).collect();
    assert!(sizes.windows(2).all(|w| w[0] <= w[1]));
    assert!(sizes.iter().all(|s| *s <= UPSTREAM_BATCH_CEILING));
    assert_eq!(fetch_size(20), 40);
}

#[tokio::test]
async fn test_failed_item_reports_retry_bound() {
    let method = EchoTranscripts::new();
    let pipeline = ChannelPipeline::new(
        FixedDiscovery::new(vec![CandidateItem::new("bad0", "Broken"), CandidateItem::new("ok", "Fine")]),
        Arc::new(Durations(HashMap::new())),
        Arc::new(MemoryStorage::new()),
        extractor(method.clone(), 4, 3),
    );
    let result = pipeline.run_channel_import("@channel", &settings(2)).await.unwrap();

    assert_eq!(result.failed, 1);
    assert_eq!(result.succeeded, 1);
    let failed = &result.outcomes[0];
    assert_eq!(failed.status, ItemStatus::Failed);
    assert_eq!(failed.attempts, 3);
    assert!(failed.error.as_deref().unwrap_or("").contains("No transcript available"));
    assert_eq!(method.calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_slow_item_times_out_alone() {
    let candidates = vec![
        CandidateItem::new("a", "A"),
        CandidateItem::new("slow", "Stuck"),
        CandidateItem::new("c", "C"),
    ];
    let pipeline = ChannelPipeline::new(
        FixedDiscovery::new(candidates),
        Arc::new(Durations(HashMap::new())),
        Arc::new(MemoryStorage::new()),
        extractor(EchoTranscripts::new(), 1, 1),
    );
    let settings = ImportSettings {
        item_timeout_secs: 1,
        ..settings(3)
    };
    let result = pipeline.run_channel_import("@channel", &settings).await.unwrap();

    let statuses: Vec<ItemStatus> = result.outcomes.iter().map(|o| o.status).collect();
    assert_eq!(statuses, vec![ItemStatus::Succeeded, ItemStatus::Failed, ItemStatus::Succeeded]);
    assert!(result.outcomes[1].error.as_deref().unwrap_or("").contains("Timed out"));
}

#[tokio::test]
async fn test_cancellation_stops_new_items() {
    let cancel = CancellationToken::new();
    let method = EchoTranscripts::cancelling_at("v2", cancel.clone());
    let pipeline = ChannelPipeline::new(
        FixedDiscovery::new(items("v", 6)),
        Arc::new(Durations(HashMap::new())),
        Arc::new(MemoryStorage::new()),
        extractor(method.clone(), 1, 1),
    )
    .with_cancellation(cancel);

    let settings = ImportSettings {
        batch_size: 1,
        concurrency: 1,
        ..settings(6)
    };
    let result = pipeline.run_channel_import("@channel", &settings).await.unwrap();

    assert!(result.cancelled);
    assert_eq!(result.succeeded, 3);
    assert_eq!(result.processed, 3);
    assert_eq!(method.calls.load(Ordering::SeqCst), 3);
    let cancelled: Vec<&str> = result
        .outcomes
        .iter()
        .filter(|o| o.status == ItemStatus::Cancelled)
        .map(|o| o.item_id.as_str())
        .collect();
    assert_eq!(cancelled, vec!["v3", "v4", "v5"]);
}

#[tokio::test]
async fn test_outcomes_keep_discovery_order_under_concurrency() {
    let pipeline = ChannelPipeline::new(
        FixedDiscovery::new(items("v", 12)),
        Arc::new(Durations(HashMap::new())),
        Arc::new(MemoryStorage::new()),
        extractor(EchoTranscripts::new(), 3, 1),
    );
    let settings = ImportSettings {
        batch_size: 5,
        concurrency: 4,
        ..settings(12)
    };
    let result = pipeline.run_channel_import("@channel", &settings).await.unwrap();

    let indices: Vec<usize> = result.outcomes.iter().map(|o| o.index).collect();
    assert_eq!(indices, (0..12).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_whole_pool_failure_recovers() {
    let pool = Arc::new(AddressPool::rotating("gate.proxy.test", 80, "customer", "secret", 3, DEFAULT_ROTATION_INTERVAL).unwrap());
    let extractor = Extractor::new(pool.clone(), RetryPolicy::new(3, Duration::ZERO)).with_transcript_method(EchoTranscripts::new());

    let err = extractor.extract_transcript("bad-item", &LanguagePreference::default()).await.unwrap_err();
    match err {
        IngestError::ExtractionExhausted { attempts, .. } => {
            assert_eq!(attempts.len(), 3);
            assert!(attempts.iter().all(|a| a.outcome == AttemptOutcome::Transient));
            let identities: HashSet<usize> = attempts.iter().map(|a| a.identity).collect();
            assert_eq!(identities.len(), 3);
        }
        other => panic!("unexpected error: {}", other),
    }

    // Every identity failed; the next request still gets one
    let identity = pool.current();
    assert!(identity.index < 3);
    assert!(matches!(pool.phase(), PoolPhase::Healthy(_)));
    assert!(pool.failed_indices().is_empty());

    let ok = extractor.extract_transcript("fine", &LanguagePreference::default()).await.unwrap();
    assert_eq!(ok.value.segments[0].text, "fine");
}

#[tokio::test]
async fn test_json_storage_drives_dedup_across_runs() {
    let temp_dir = TempDir::new().unwrap();
    let candidates = items("v", 4);

    for expected in [4, 0] {
        let storage = Arc::new(JsonFileStorage::open(temp_dir.path()).await.unwrap());
        let pipeline = ChannelPipeline::new(
            FixedDiscovery::new(candidates.clone()),
            Arc::new(Durations(HashMap::new())),
            storage,
            extractor(EchoTranscripts::new(), 1, 1),
        );
        let result = pipeline.run_channel_import("@channel", &settings(4)).await.unwrap();
        assert_eq!(result.succeeded, expected);
    }

    let stored = std::fs::read_dir(temp_dir.path())
        .unwrap()
        .filter(|e| e.as_ref().map(|e| e.path().extension().map_or(false, |x| x == "json")).unwrap_or(false))
        .count();
    assert_eq!(stored, 4);
}

#[test]
fn test_extract_one_blocking() {
    let extractor = extractor(EchoTranscripts::new(), 2, 1);
    let item = tokio_test::block_on(extractor.extract_one("dQw4w9WgXcQ", &LanguagePreference::new("de"))).unwrap();

    assert_eq!(item.item_id, "dQw4w9WgXcQ");
    assert_eq!(item.transcript.as_ref().map(|t| t.language.as_str()), Some("de"));
    assert_eq!(item.transcript_method.as_deref(), Some("echo"));
    assert!(item.chapters.is_empty());
}
