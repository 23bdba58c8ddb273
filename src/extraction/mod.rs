//! Transcript and chapter extraction
//!
//! Each kind of data is fetched through an ordered chain of independent
//! methods. A method is retried on fresh identities from the address pool up
//! to the retry budget before the chain falls through to the next method.

pub mod chapters;
pub mod language;

pub use chapters::{format_timestamp, parse_description_chapters, Chapter, DescriptionChapters, DescriptionSource};
pub use language::{rank_tracks, CaptionTrack, LanguagePreference, TrackChoice, TrackKind};

use crate::error::{FetchError, IngestError, Result};
use crate::pool::{AddressIdentity, AddressPool};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One line of a transcript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    /// Seconds from the start of the item
    pub start: f64,
    pub duration: Option<f64>,
    pub text: String,
}

impl TranscriptSegment {
    pub fn new(start: f64, text: impl Into<String>) -> Self {
        Self {
            start,
            duration: None,
            text: text.into(),
        }
    }

    pub fn formatted_time(&self) -> String {
        format_timestamp(self.start)
    }
}

/// A fetched transcript in one language
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub language: String,
    pub kind: TrackKind,
    pub segments: Vec<TranscriptSegment>,
}

impl Transcript {
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Plain text with one segment per line
    pub fn text(&self) -> String {
        self.segments
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// How a single try ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    /// Identity or network failure, retried after rotation
    Transient,
    /// Method has nothing for this item, fall through immediately
    Unavailable,
}

/// Record of one try of one method through one identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionAttempt {
    pub method: String,
    pub identity: usize,
    pub outcome: AttemptOutcome,
    pub error: Option<String>,
}

/// Successful result of a fallback chain
#[derive(Debug, Clone, Serialize)]
pub struct Extraction<T> {
    pub value: T,
    /// Method that produced the value
    pub method: String,
    /// Every try made, failures first
    pub attempts: Vec<ExtractionAttempt>,
}

/// Transcript plus chapters for one item
#[derive(Debug, Clone, Serialize)]
pub struct ExtractedItem {
    pub item_id: String,
    pub transcript: Option<Transcript>,
    pub transcript_method: Option<String>,
    pub chapters: Vec<Chapter>,
    pub chapter_method: Option<String>,
    pub attempts: Vec<ExtractionAttempt>,
}

/// A way of obtaining a transcript
#[async_trait]
pub trait TranscriptMethod: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch_transcript(
        &self,
        item_id: &str,
        language: &LanguagePreference,
        identity: &AddressIdentity,
    ) -> std::result::Result<Transcript, FetchError>;
}

/// A way of obtaining chapters
#[async_trait]
pub trait ChapterMethod: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch_chapters(
        &self,
        item_id: &str,
        identity: &AddressIdentity,
    ) -> std::result::Result<Vec<Chapter>, FetchError>;
}

/// Retry budget for one method in a chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self { max_retries, backoff }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(IngestError::config("retry budget must be at least 1"));
        }
        Ok(())
    }
}

/// Uniform view over transcript and chapter methods for the chain runner
#[async_trait]
trait Attempt<T>: Send + Sync {
    fn method_name(&self) -> &str;
    async fn attempt(&self, identity: &AddressIdentity) -> std::result::Result<T, FetchError>;
}

struct TranscriptAttempt<'a> {
    method: &'a dyn TranscriptMethod,
    item_id: &'a str,
    language: &'a LanguagePreference,
}

#[async_trait]
impl<'a> Attempt<Transcript> for TranscriptAttempt<'a> {
    fn method_name(&self) -> &str {
        self.method.name()
    }

    async fn attempt(&self, identity: &AddressIdentity) -> std::result::Result<Transcript, FetchError> {
        let transcript = self.method.fetch_transcript(self.item_id, self.language, identity).await?;
        if transcript.is_empty() {
            return Err(FetchError::unavailable("transcript has no segments"));
        }
        Ok(transcript)
    }
}

struct ChapterAttempt<'a> {
    method: &'a dyn ChapterMethod,
    item_id: &'a str,
}

#[async_trait]
impl<'a> Attempt<Vec<Chapter>> for ChapterAttempt<'a> {
    fn method_name(&self) -> &str {
        self.method.name()
    }

    async fn attempt(&self, identity: &AddressIdentity) -> std::result::Result<Vec<Chapter>, FetchError> {
        let chapters = self.method.fetch_chapters(self.item_id, identity).await?;
        if chapters.is_empty() {
            return Err(FetchError::unavailable("no chapters"));
        }
        Ok(chapters)
    }
}

/// Runs the transcript and chapter fallback chains against a shared address pool
pub struct Extractor {
    pool: Arc<AddressPool>,
    transcript_methods: Vec<Arc<dyn TranscriptMethod>>,
    chapter_methods: Vec<Arc<dyn ChapterMethod>>,
    policy: RetryPolicy,
}

impl Extractor {
    pub fn new(pool: Arc<AddressPool>, policy: RetryPolicy) -> Self {
        Self {
            pool,
            transcript_methods: Vec::new(),
            chapter_methods: Vec::new(),
            policy,
        }
    }

    /// Append a transcript method to the end of the chain
    pub fn with_transcript_method(mut self, method: Arc<dyn TranscriptMethod>) -> Self {
        self.transcript_methods.push(method);
        self
    }

    /// Append a chapter method to the end of the chain
    pub fn with_chapter_method(mut self, method: Arc<dyn ChapterMethod>) -> Self {
        self.chapter_methods.push(method);
        self
    }

    pub fn pool(&self) -> &Arc<AddressPool> {
        &self.pool
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn transcript_method_names(&self) -> Vec<String> {
        self.transcript_methods.iter().map(|m| m.name().to_string()).collect()
    }

    /// Fatal configuration checks, done before any network call
    pub fn validate(&self) -> Result<()> {
        self.policy.validate()?;
        if self.transcript_methods.is_empty() {
            return Err(IngestError::config("no transcript methods configured"));
        }
        Ok(())
    }

    pub async fn extract_transcript(&self, item_id: &str, language: &LanguagePreference) -> Result<Extraction<Transcript>> {
        self.extract_transcript_with(item_id, language, self.policy).await
    }

    pub async fn extract_transcript_with(
        &self,
        item_id: &str,
        language: &LanguagePreference,
        policy: RetryPolicy,
    ) -> Result<Extraction<Transcript>> {
        let attempts: Vec<Box<dyn Attempt<Transcript> + '_>> = self
            .transcript_methods
            .iter()
            .map(|method| {
                Box::new(TranscriptAttempt {
                    method: method.as_ref(),
                    item_id,
                    language,
                }) as Box<dyn Attempt<Transcript> + '_>
            })
            .collect();

        self.run_chain(item_id, "transcript", attempts, policy).await
    }

    pub async fn extract_chapters(&self, item_id: &str) -> Result<Extraction<Vec<Chapter>>> {
        self.extract_chapters_with(item_id, self.policy).await
    }

    pub async fn extract_chapters_with(&self, item_id: &str, policy: RetryPolicy) -> Result<Extraction<Vec<Chapter>>> {
        let attempts: Vec<Box<dyn Attempt<Vec<Chapter>> + '_>> = self
            .chapter_methods
            .iter()
            .map(|method| {
                Box::new(ChapterAttempt {
                    method: method.as_ref(),
                    item_id,
                }) as Box<dyn Attempt<Vec<Chapter>> + '_>
            })
            .collect();

        self.run_chain(item_id, "chapters", attempts, policy).await
    }

    /// Transcript and chapters for a single item.
    ///
    /// A missing transcript fails the item; missing chapters only leave the
    /// chapter list empty.
    pub async fn extract_one(&self, item_id: &str, language: &LanguagePreference) -> Result<ExtractedItem> {
        self.validate()?;
        self.extract_item(item_id, language, self.policy, true, true).await
    }

    pub(crate) async fn extract_item(
        &self,
        item_id: &str,
        language: &LanguagePreference,
        policy: RetryPolicy,
        want_transcript: bool,
        want_chapters: bool,
    ) -> Result<ExtractedItem> {
        let mut item = ExtractedItem {
            item_id: item_id.to_string(),
            transcript: None,
            transcript_method: None,
            chapters: Vec::new(),
            chapter_method: None,
            attempts: Vec::new(),
        };

        if want_transcript {
            let extraction = self.extract_transcript_with(item_id, language, policy).await?;
            item.attempts.extend(extraction.attempts);
            item.transcript = Some(extraction.value);
            item.transcript_method = Some(extraction.method);
        }

        if want_chapters && !self.chapter_methods.is_empty() {
            match self.extract_chapters_with(item_id, policy).await {
                Ok(extraction) => {
                    item.attempts.extend(extraction.attempts);
                    item.chapters = extraction.value;
                    item.chapter_method = Some(extraction.method);
                }
                Err(IngestError::ExtractionExhausted { attempts, .. }) => {
                    debug!("📑 No chapters for {}", item_id);
                    item.attempts.extend(attempts);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(item)
    }

    async fn run_chain<T: Send>(
        &self,
        item_id: &str,
        kind: &'static str,
        methods: Vec<Box<dyn Attempt<T> + '_>>,
        policy: RetryPolicy,
    ) -> Result<Extraction<T>> {
        policy.validate()?;
        let mut log = Vec::new();

        for method in &methods {
            let name = method.method_name().to_string();

            for attempt in 1..=policy.max_retries {
                let identity = self.pool.current();
                debug!("🔎 {} {} via {} (attempt {}/{}) through {}", kind, item_id, name, attempt, policy.max_retries, identity);

                match method.attempt(&identity).await {
                    Ok(value) => {
                        log.push(ExtractionAttempt {
                            method: name.clone(),
                            identity: identity.index,
                            outcome: AttemptOutcome::Succeeded,
                            error: None,
                        });
                        info!("✅ Got {} for {} via {}", kind, item_id, name);
                        return Ok(Extraction {
                            value,
                            method: name,
                            attempts: log,
                        });
                    }
                    Err(FetchError::Unavailable(reason)) => {
                        debug!("{} unavailable for {} via {}: {}", kind, item_id, name, reason);
                        log.push(ExtractionAttempt {
                            method: name.clone(),
                            identity: identity.index,
                            outcome: AttemptOutcome::Unavailable,
                            error: Some(reason),
                        });
                        break;
                    }
                    Err(FetchError::Transient(reason)) => {
                        debug!("Attempt {} of {} failed through {}: {}", attempt, name, identity, reason);
                        log.push(ExtractionAttempt {
                            method: name.clone(),
                            identity: identity.index,
                            outcome: AttemptOutcome::Transient,
                            error: Some(reason),
                        });
                        self.pool.mark_failed(&identity);
                        self.pool.rotate();

                        if attempt < policy.max_retries && !policy.backoff.is_zero() {
                            tokio::time::sleep(policy.backoff).await;
                        }
                    }
                }
            }

            warn!("⚠️ Method {} exhausted for {} {}", name, kind, item_id);
        }

        Err(IngestError::ExtractionExhausted {
            item_id: item_id.to_string(),
            kind,
            attempts: log,
        })
    }
}
