//! Concrete upstream collaborators for the video platform
//!
//! Everything that talks to the network or to `yt-dlp` lives here. The core
//! only sees the collaborator traits.

pub mod data_api;
pub mod watch_page;
pub mod ytdlp;

pub use data_api::{parse_iso8601_duration, ChannelSource, DataApiClient};
pub use watch_page::WatchPageTranscripts;
pub use ytdlp::{YtDlp, YtDlpChapters, YtDlpTranscripts};

use crate::config::{Config, TranscriptMethodKind};
use crate::error::FetchError;
use crate::extraction::{
    DescriptionChapters, DescriptionSource, Extractor, RetryPolicy, Transcript, TranscriptSegment, TrackChoice,
};
use crate::pool::{AddressIdentity, AddressPool};
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Endpoint that echoes the caller's address, used to check an identity
pub const PROBE_URL: &str = "https://ipv4.webshare.io/";

pub const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Wire the configured transcript methods and both chapter methods into an
/// extractor. Description chapters need a description source (the Data API).
pub fn extractor_from_config(
    config: &Config,
    pool: Arc<AddressPool>,
    descriptions: Option<Arc<dyn DescriptionSource>>,
) -> Extractor {
    let timeout = Duration::from_secs(config.youtube.request_timeout_secs);
    let ytdlp = YtDlp::new(config.youtube.ytdlp_path.clone(), timeout * 4);
    let policy = RetryPolicy::new(config.import.max_retries, config.extraction.retry_backoff());

    let mut extractor = Extractor::new(pool, policy);
    for kind in &config.extraction.transcript_methods {
        extractor = match kind {
            TranscriptMethodKind::WatchPage => extractor.with_transcript_method(Arc::new(WatchPageTranscripts::new(timeout))),
            TranscriptMethodKind::YtDlp => {
                extractor.with_transcript_method(Arc::new(YtDlpTranscripts::new(ytdlp.clone(), timeout)))
            }
        };
    }

    extractor = extractor.with_chapter_method(Arc::new(YtDlpChapters::new(ytdlp)));
    if let Some(source) = descriptions {
        extractor = extractor.with_chapter_method(Arc::new(DescriptionChapters::new(source)));
    }
    extractor
}

/// HTTP client whose requests leave through `identity`
pub fn client_for(identity: &AddressIdentity, timeout: Duration) -> Result<Client, FetchError> {
    let mut builder = Client::builder().timeout(timeout).user_agent(USER_AGENT);

    match identity.proxy_url() {
        Some(proxy_url) => {
            let proxy = reqwest::Proxy::all(&proxy_url)
                .map_err(|e| FetchError::transient(format!("bad proxy for identity {}: {}", identity.index, e)))?;
            builder = builder.proxy(proxy);
        }
        // Direct identities ignore HTTP(S)_PROXY from the environment
        None => builder = builder.no_proxy(),
    }

    builder
        .build()
        .map_err(|e| FetchError::transient(format!("cannot build client: {}", e)))
}

/// Result of one health check through an identity
#[derive(Debug, Clone, Serialize)]
pub struct IdentityProbe {
    pub index: usize,
    pub identity: String,
    pub healthy: bool,
    pub message: String,
}

/// Issue one GET to `probe_url` through `identity`. Never touches pool state.
pub async fn probe_identity(identity: &AddressIdentity, probe_url: &str, timeout: Duration) -> IdentityProbe {
    let outcome = match client_for(identity, timeout) {
        Ok(client) => client.get(probe_url).send().await.map_err(|e| e.to_string()),
        Err(e) => Err(e.to_string()),
    };

    let (healthy, message) = match outcome {
        Ok(response) if response.status().is_success() => (true, format!("{} is working", identity)),
        Ok(response) => (false, format!("returned status {}", response.status())),
        Err(e) => (false, format!("request failed: {}", e)),
    };

    IdentityProbe {
        index: identity.index,
        identity: identity.to_string(),
        healthy,
        message,
    }
}

/// Map an HTTP status to a fetch error. Rate limiting and blocking are
/// transient; a missing resource is not.
pub(crate) fn status_error(status: reqwest::StatusCode) -> FetchError {
    match status.as_u16() {
        404 | 410 => FetchError::unavailable(format!("HTTP {}", status)),
        _ => FetchError::transient(format!("HTTP {}", status)),
    }
}

/// Pull an 11-character item id out of a bare id or a watch / short / embed URL
pub fn extract_video_id(input: &str) -> Option<String> {
    static BARE: OnceLock<Regex> = OnceLock::new();
    static URL: OnceLock<Regex> = OnceLock::new();

    let input = input.trim();
    let bare = BARE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{11}$").expect("valid id regex"));
    if bare.is_match(input) {
        return Some(input.to_string());
    }

    let url = URL.get_or_init(|| {
        Regex::new(r"(?:v=|youtu\.be/|/embed/|/shorts/|/live/|/v/)([A-Za-z0-9_-]{11})(?:[^A-Za-z0-9_-]|$)")
            .expect("valid url regex")
    });
    url.captures(input)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

#[derive(Debug, Deserialize)]
struct Json3 {
    #[serde(default)]
    events: Vec<Json3Event>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Json3Event {
    t_start_ms: Option<u64>,
    d_duration_ms: Option<u64>,
    #[serde(default)]
    segs: Vec<Json3Seg>,
}

#[derive(Debug, Deserialize)]
struct Json3Seg {
    #[serde(default)]
    utf8: String,
}

/// Parse a `json3` timed-text document into segments. Events without text
/// (window setup, bare newlines) are skipped.
pub fn parse_json3(body: &str) -> Result<Vec<TranscriptSegment>, FetchError> {
    let doc: Json3 = serde_json::from_str(body)?;

    let segments = doc
        .events
        .into_iter()
        .filter_map(|event| {
            let text: String = event.segs.iter().map(|s| s.utf8.as_str()).collect();
            let text = text.replace('\n', " ").trim().to_string();
            if text.is_empty() {
                return None;
            }
            Some(TranscriptSegment {
                start: event.t_start_ms.unwrap_or(0) as f64 / 1000.0,
                duration: event.d_duration_ms.map(|d| d as f64 / 1000.0),
                text,
            })
        })
        .collect();

    Ok(segments)
}

/// Download a ranked track choice as `json3` through `client`
pub(crate) async fn download_track(client: &Client, choice: &TrackChoice) -> Result<Transcript, FetchError> {
    let mut url = url::Url::parse(&choice.track().url)
        .map_err(|e| FetchError::unavailable(format!("bad track url: {}", e)))?;

    let keep: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != "fmt" && k != "tlang")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    {
        let mut query = url.query_pairs_mut();
        query.clear();
        for (k, v) in &keep {
            query.append_pair(k, v);
        }
        query.append_pair("fmt", "json3");
        if let TrackChoice::Translated { target, .. } = choice {
            query.append_pair("tlang", target);
        }
    }

    let response = client.get(url).send().await?;
    if !response.status().is_success() {
        return Err(status_error(response.status()));
    }
    let body = response.text().await?;
    if body.trim().is_empty() {
        // Timed-text endpoints answer blocked requests with an empty 200
        return Err(FetchError::transient("empty timed-text response"));
    }

    Ok(Transcript {
        language: choice.language().to_string(),
        kind: choice.kind(),
        segments: parse_json3(&body)?,
    })
}

/// Try ranked tracks in order. Returns the first non-empty transcript; a
/// transient failure aborts so the caller can rotate.
pub(crate) async fn download_first(client: &Client, choices: &[TrackChoice]) -> Result<Transcript, FetchError> {
    if choices.is_empty() {
        return Err(FetchError::unavailable("no caption tracks"));
    }

    for choice in choices {
        match download_track(client, choice).await {
            Ok(transcript) if !transcript.is_empty() => return Ok(transcript),
            Ok(_) => tracing::debug!("Track {} is empty, trying next", choice.language()),
            Err(FetchError::Unavailable(reason)) => {
                tracing::debug!("Track {} unavailable: {}", choice.language(), reason)
            }
            Err(e) => return Err(e),
        }
    }

    Err(FetchError::unavailable("every caption track was empty"))
}
