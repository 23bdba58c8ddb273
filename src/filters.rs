//! Candidate filters: duration eligibility and deduplication against storage

use crate::config::ImportSettings;
use crate::error::Result;
use crate::pipeline::CandidateItem;
use crate::storage::Storage;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

/// Most ids the metadata lookup accepts per call
pub const DURATION_BATCH_CEILING: usize = 50;

/// Membership checks in flight at once; results keep input order
const MEMBERSHIP_CHECK_CONCURRENCY: usize = 8;

/// Resolves item durations in bulk
#[async_trait]
pub trait MetadataLookup: Send + Sync {
    /// Duration in seconds per id; `None` when unknown. Ids missing from the
    /// returned map are unknown too.
    async fn batch_durations(&self, item_ids: &[String]) -> Result<HashMap<String, Option<u64>>>;
}

/// Why the duration filter kept or dropped an item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    /// Duration could not be resolved; kept
    Unknown,
    /// At or below the shorts threshold
    Short,
}

impl Eligibility {
    pub fn is_eligible(self) -> bool {
        !matches!(self, Eligibility::Short)
    }
}

/// Classify one duration under the settings' shorts policy
pub fn classify(duration_secs: Option<u64>, settings: &ImportSettings) -> Eligibility {
    match duration_secs {
        None => Eligibility::Unknown,
        Some(d) if d <= settings.shorts_threshold_secs && !settings.include_shorts => Eligibility::Short,
        Some(_) => Eligibility::Eligible,
    }
}

#[derive(Debug, Clone, Default)]
pub struct FilterOutcome {
    pub kept: Vec<CandidateItem>,
    pub removed: usize,
}

/// Drop shorts. Durations already present on a candidate are trusted; the
/// rest are looked up in chunks. A failed chunk keeps all of its items.
pub async fn filter_by_duration(
    candidates: Vec<CandidateItem>,
    lookup: &dyn MetadataLookup,
    settings: &ImportSettings,
) -> FilterOutcome {
    let mut resolved: HashMap<String, Option<u64>> = HashMap::new();

    // Nothing is ever excluded when shorts are included, skip the lookups
    if !settings.include_shorts {
        let unknown: Vec<String> = candidates
            .iter()
            .filter(|c| c.duration_secs.is_none())
            .map(|c| c.item_id.clone())
            .collect();

        for chunk in unknown.chunks(DURATION_BATCH_CEILING) {
            match lookup.batch_durations(chunk).await {
                Ok(durations) => resolved.extend(durations),
                Err(e) => {
                    warn!("⚠️ Duration lookup failed for a batch of {} items, keeping them all: {}", chunk.len(), e);
                }
            }
        }
    }

    let mut kept = Vec::with_capacity(candidates.len());
    let mut removed = 0;

    for mut candidate in candidates {
        if candidate.duration_secs.is_none() {
            candidate.duration_secs = resolved.get(&candidate.item_id).copied().flatten();
        }

        match classify(candidate.duration_secs, settings) {
            Eligibility::Short => {
                debug!("⏭️ Skipping short {} ({:?}s)", candidate.item_id, candidate.duration_secs);
                removed += 1;
            }
            _ => kept.push(candidate),
        }
    }

    info!("⏱️ Duration filter kept {} items, removed {}", kept.len(), removed);
    FilterOutcome { kept, removed }
}

/// Drop repeats of an id within `candidates` and items the storage already
/// knows. Repeats are dropped even when `skip_existing` is off. A failed
/// membership check counts as not known.
pub async fn filter_existing(
    candidates: Vec<CandidateItem>,
    storage: &dyn Storage,
    settings: &ImportSettings,
) -> FilterOutcome {
    let mut seen = HashSet::with_capacity(candidates.len());
    let mut removed = 0;
    let candidates: Vec<CandidateItem> = candidates
        .into_iter()
        .filter(|candidate| {
            let first = seen.insert(candidate.item_id.clone());
            if !first {
                debug!("⏭️ Repeated in discovery: {}", candidate.item_id);
                removed += 1;
            }
            first
        })
        .collect();

    if !settings.skip_existing {
        return FilterOutcome {
            kept: candidates,
            removed,
        };
    }

    let checks: Vec<_> = stream::iter(candidates)
        .map(|candidate| async move {
            let known = storage.exists(&candidate.item_id).await;
            (candidate, known)
        })
        .buffered(MEMBERSHIP_CHECK_CONCURRENCY)
        .collect()
        .await;

    let mut kept = Vec::with_capacity(checks.len());

    for (candidate, known) in checks {
        match known {
            Ok(true) => {
                debug!("⏭️ Already imported: {}", candidate.item_id);
                removed += 1;
            }
            Ok(false) => kept.push(candidate),
            Err(e) => {
                warn!("Membership check failed for {}, treating as new: {}", candidate.item_id, e);
                kept.push(candidate);
            }
        }
    }

    info!("🔁 Dedup filter kept {} items, removed {}", kept.len(), removed);
    FilterOutcome { kept, removed }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IngestError;
    use crate::storage::{ImportRecord, MemoryStorage};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedDurations {
        durations: HashMap<String, Option<u64>>,
        calls: AtomicUsize,
        largest_batch: AtomicUsize,
    }

    impl FixedDurations {
        fn new(pairs: &[(&str, Option<u64>)]) -> Self {
            Self {
                durations: pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
                calls: AtomicUsize::new(0),
                largest_batch: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl MetadataLookup for FixedDurations {
        async fn batch_durations(&self, item_ids: &[String]) -> Result<HashMap<String, Option<u64>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.largest_batch.fetch_max(item_ids.len(), Ordering::SeqCst);
            Ok(item_ids
                .iter()
                .filter_map(|id| self.durations.get(id).map(|d| (id.clone(), *d)))
                .collect())
        }
    }

    struct FailingLookup;

    #[async_trait]
    impl MetadataLookup for FailingLookup {
        async fn batch_durations(&self, _item_ids: &[String]) -> Result<HashMap<String, Option<u64>>> {
            Err(IngestError::upstream("quota exceeded"))
        }
    }

    struct BrokenStorage;

    #[async_trait]
    impl Storage for BrokenStorage {
        async fn exists(&self, _item_id: &str) -> Result<bool> {
            Err(IngestError::Storage("connection reset".into()))
        }

        async fn persist(&self, _record: &ImportRecord) -> Result<()> {
            Ok(())
        }

        async fn load(&self, _item_id: &str) -> Result<Option<ImportRecord>> {
            Ok(None)
        }
    }

    fn candidates(ids: &[&str]) -> Vec<CandidateItem> {
        ids.iter().map(|id| CandidateItem::new(*id, *id)).collect()
    }

    fn ids(items: &[CandidateItem]) -> Vec<&str> {
        items.iter().map(|c| c.item_id.as_str()).collect()
    }

    #[test]
    fn test_classify() {
        let settings = ImportSettings::default();
        assert_eq!(classify(Some(60), &settings), Eligibility::Short);
        assert_eq!(classify(Some(61), &settings), Eligibility::Eligible);
        assert_eq!(classify(None, &settings), Eligibility::Unknown);
        assert!(classify(None, &settings).is_eligible());

        let with_shorts = ImportSettings {
            include_shorts: true,
            ..ImportSettings::default()
        };
        assert_eq!(classify(Some(10), &with_shorts), Eligibility::Eligible);
    }

    #[tokio::test]
    async fn test_duration_filter_drops_shorts() {
        let lookup = FixedDurations::new(&[("a", Some(30)), ("b", Some(600)), ("c", None)]);
        let outcome = filter_by_duration(candidates(&["a", "b", "c", "d"]), &lookup, &ImportSettings::default()).await;
        assert_eq!(ids(&outcome.kept), vec!["b", "c", "d"]);
        assert_eq!(outcome.removed, 1);
        assert_eq!(outcome.kept[0].duration_secs, Some(600));
    }

    #[tokio::test]
    async fn test_duration_filter_is_idempotent() {
        let lookup = FixedDurations::new(&[("a", Some(30)), ("b", Some(600)), ("c", Some(90))]);
        let settings = ImportSettings::default();
        let first = filter_by_duration(candidates(&["a", "b", "c"]), &lookup, &settings).await;
        let second = filter_by_duration(first.kept.clone(), &lookup, &settings).await;
        assert_eq!(ids(&first.kept), ids(&second.kept));
        assert_eq!(second.removed, 0);
    }

    #[tokio::test]
    async fn test_failed_lookup_keeps_everything() {
        let outcome = filter_by_duration(candidates(&["a", "b", "c", "d", "e"]), &FailingLookup, &ImportSettings::default()).await;
        assert_eq!(outcome.kept.len(), 5);
        assert_eq!(outcome.removed, 0);
    }

    #[tokio::test]
    async fn test_lookups_are_chunked() {
        let names: Vec<String> = (0..120).map(|i| format!("v{}", i)).collect();
        let items: Vec<CandidateItem> = names.iter().map(|n| CandidateItem::new(n.as_str(), n.as_str())).collect();
        let lookup = FixedDurations::new(&[]);

        filter_by_duration(items, &lookup, &ImportSettings::default()).await;
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 3);
        assert_eq!(lookup.largest_batch.load(Ordering::SeqCst), DURATION_BATCH_CEILING);
    }

    #[tokio::test]
    async fn test_dedup_removes_known_items() {
        let storage = MemoryStorage::new();
        for id in ["b", "d"] {
            storage
                .persist(&ImportRecord {
                    item: CandidateItem::new(id, id),
                    transcript: None,
                    transcript_method: None,
                    chapters: Vec::new(),
                    chapter_method: None,
                    imported_at: chrono::Utc::now(),
                })
                .await
                .unwrap();
        }

        let outcome = filter_existing(candidates(&["a", "b", "c", "d"]), &storage, &ImportSettings::default()).await;
        assert_eq!(ids(&outcome.kept), vec!["a", "c"]);
        assert_eq!(outcome.removed, 2);

        let passthrough = ImportSettings {
            skip_existing: false,
            ..ImportSettings::default()
        };
        let outcome = filter_existing(candidates(&["a", "b"]), &storage, &passthrough).await;
        assert_eq!(ids(&outcome.kept), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_dedup_drops_repeated_ids() {
        let storage = MemoryStorage::new();
        let outcome = filter_existing(candidates(&["a", "a", "b", "a"]), &storage, &ImportSettings::default()).await;
        assert_eq!(ids(&outcome.kept), vec!["a", "b"]);
        assert_eq!(outcome.removed, 2);

        let passthrough = ImportSettings {
            skip_existing: false,
            ..ImportSettings::default()
        };
        let outcome = filter_existing(candidates(&["a", "b", "b"]), &storage, &passthrough).await;
        assert_eq!(ids(&outcome.kept), vec!["a", "b"]);
        assert_eq!(outcome.removed, 1);
    }

    #[tokio::test]
    async fn test_failed_membership_check_keeps_item() {
        let outcome = filter_existing(candidates(&["a", "b"]), &BrokenStorage, &ImportSettings::default()).await;
        assert_eq!(outcome.kept.len(), 2);
    }
}
