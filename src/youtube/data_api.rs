/// Data API client: channel resolution, candidate discovery, durations and descriptions
use super::{client_for, status_error};
use crate::config::{DiscoveryStrategy, YouTubeConfig};
use crate::error::{FetchError, IngestError, Result};
use crate::extraction::DescriptionSource;
use crate::filters::{MetadataLookup, DURATION_BATCH_CEILING};
use crate::pipeline::{CandidateItem, Discovery};
use crate::pool::AddressIdentity;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Page size limit of the list endpoints
const PAGE_SIZE: usize = 50;

/// Upper bound on pages walked per strategy
const MAX_PAGES: usize = 10;

/// How a channel was named by the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelSource {
    /// `UC` followed by 22 id characters
    Id(String),
    /// `@handle`, stored without the `@`
    Handle(String),
    /// Custom or legacy name, resolved by search
    Name(String),
}

impl ChannelSource {
    /// Accepts a channel id, `@handle`, a channel URL or a free-text name
    pub fn parse(input: &str) -> Result<Self> {
        static CHANNEL_ID: OnceLock<Regex> = OnceLock::new();
        static URL_PATH: OnceLock<Regex> = OnceLock::new();

        let input = input.trim();
        if input.is_empty() {
            return Err(IngestError::config("channel source is empty"));
        }

        let channel_id = CHANNEL_ID.get_or_init(|| Regex::new(r"^UC[A-Za-z0-9_-]{22}$").expect("valid channel id regex"));
        if channel_id.is_match(input) {
            return Ok(Self::Id(input.to_string()));
        }

        if let Some(handle) = input.strip_prefix('@') {
            return Ok(Self::Handle(handle.to_string()));
        }

        let url_path = URL_PATH.get_or_init(|| {
            Regex::new(r"youtube\.com/(?:(channel)/(UC[A-Za-z0-9_-]{22})|@([^/?#]+)|(?:c|user)/([^/?#]+))")
                .expect("valid channel url regex")
        });
        if let Some(captures) = url_path.captures(input) {
            if let Some(id) = captures.get(2) {
                return Ok(Self::Id(id.as_str().to_string()));
            }
            if let Some(handle) = captures.get(3) {
                let handle = urlencoding::decode(handle.as_str())
                    .map(|h| h.into_owned())
                    .unwrap_or_else(|_| handle.as_str().to_string());
                return Ok(Self::Handle(handle));
            }
            if let Some(name) = captures.get(4) {
                let name = urlencoding::decode(name.as_str())
                    .map(|n| n.into_owned())
                    .unwrap_or_else(|_| name.as_str().to_string());
                return Ok(Self::Name(name));
            }
        }

        Ok(Self::Name(input.to_string()))
    }
}

/// Parse `PT#H#M#S` / `P#DT#H#M#S` into seconds
pub fn parse_iso8601_duration(value: &str) -> Option<u64> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"^P(?:(\d+)D)?(?:T(?:(\d+)H)?(?:(\d+)M)?(?:(\d+)S)?)?$").expect("valid duration regex")
    });

    let captures = re.captures(value.trim())?;
    if value.trim() == "P" || value.trim() == "PT" {
        return None;
    }

    // Out-of-range values are treated as unknown
    let mut total: u64 = 0;
    for (group, unit) in [(1, 86_400u64), (2, 3600), (3, 60), (4, 1)] {
        if let Some(m) = captures.get(group) {
            let value: u64 = m.as_str().parse().ok()?;
            total = total.checked_add(value.checked_mul(unit)?)?;
        }
    }
    Some(total)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelItem {
    id: String,
    content_details: Option<ChannelContentDetails>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelContentDetails {
    related_playlists: RelatedPlaylists,
}

#[derive(Debug, Deserialize)]
struct RelatedPlaylists {
    uploads: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchItem {
    id: SearchId,
    #[serde(default)]
    snippet: Snippet,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchId {
    channel_id: Option<String>,
    video_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct Snippet {
    title: String,
    channel_title: String,
    description: String,
    published_at: Option<DateTime<Utc>>,
    #[serde(rename = "type")]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistItem {
    #[serde(default)]
    snippet: Snippet,
    content_details: PlaylistItemDetails,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistItemDetails {
    video_id: String,
    video_published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActivityItem {
    #[serde(default)]
    snippet: Snippet,
    content_details: Option<ActivityDetails>,
}

#[derive(Debug, Deserialize)]
struct ActivityDetails {
    upload: Option<ActivityUpload>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActivityUpload {
    video_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoItem {
    id: String,
    content_details: Option<VideoContentDetails>,
    #[serde(default)]
    snippet: Snippet,
}

#[derive(Debug, Deserialize)]
struct VideoContentDetails {
    duration: Option<String>,
}

/// Client for the platform's Data API
#[derive(Clone, Debug)]
pub struct DataApiClient {
    client: Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
    strategies: Vec<DiscoveryStrategy>,
}

impl DataApiClient {
    /// Discovery and duration lookups need an API key; without one this is a
    /// configuration error.
    pub fn new(config: &YouTubeConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| IngestError::config("YouTube Data API key is not set (YT_INGEST_API_KEY)"))?;

        if config.discovery_strategies.is_empty() {
            return Err(IngestError::config("no discovery strategies configured"));
        }

        let timeout = Duration::from_secs(config.request_timeout_secs);
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            api_key,
            timeout,
            strategies: config.discovery_strategies.clone(),
        })
    }

    async fn get<T: DeserializeOwned>(&self, endpoint: &str, params: &[(&str, String)]) -> Result<T> {
        let url = format!("{}/{}", self.base_url, endpoint);
        let response = self
            .client
            .get(&url)
            .query(params)
            .query(&[("key", self.api_key.as_str())])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(IngestError::upstream(format!("{} returned HTTP {}", endpoint, status)));
        }
        Ok(response.json::<T>().await?)
    }

    /// Resolve any accepted channel form to a channel id
    pub async fn resolve_channel_id(&self, source: &ChannelSource) -> Result<String> {
        match source {
            ChannelSource::Id(id) => Ok(id.clone()),
            ChannelSource::Handle(handle) => {
                let response: ListResponse<ChannelItem> = self
                    .get("channels", &[("part", "id".to_string()), ("forHandle", format!("@{}", handle))])
                    .await?;
                match response.items.into_iter().next() {
                    Some(channel) => Ok(channel.id),
                    None => {
                        // Some handles only resolve through search
                        debug!("forHandle found nothing for @{}, searching", handle);
                        self.search_channel(handle).await
                    }
                }
            }
            ChannelSource::Name(name) => self.search_channel(name).await,
        }
    }

    /// Exact title match, then containment, then the first hit
    async fn search_channel(&self, name: &str) -> Result<String> {
        let response: ListResponse<SearchItem> = self
            .get(
                "search",
                &[
                    ("part", "snippet".to_string()),
                    ("type", "channel".to_string()),
                    ("q", name.to_string()),
                    ("maxResults", "10".to_string()),
                ],
            )
            .await?;

        let wanted = name.to_lowercase();
        let title = |item: &SearchItem| {
            if item.snippet.channel_title.is_empty() {
                item.snippet.title.to_lowercase()
            } else {
                item.snippet.channel_title.to_lowercase()
            }
        };

        let chosen = response
            .items
            .iter()
            .find(|item| title(*item) == wanted)
            .or_else(|| response.items.iter().find(|item| title(*item).contains(&wanted)))
            .or_else(|| response.items.first());

        chosen
            .and_then(|item| item.id.channel_id.clone())
            .ok_or_else(|| IngestError::upstream(format!("no channel found for {:?}", name)))
    }

    async fn uploads_playlist(&self, channel_id: &str, cutoff: DateTime<Utc>, max_count: usize) -> Result<Vec<CandidateItem>> {
        let channels: ListResponse<ChannelItem> = self
            .get("channels", &[("part", "contentDetails".to_string()), ("id", channel_id.to_string())])
            .await?;
        let playlist_id = channels
            .items
            .into_iter()
            .next()
            .and_then(|c| c.content_details)
            .and_then(|d| d.related_playlists.uploads)
            .ok_or_else(|| IngestError::upstream(format!("channel {} has no uploads playlist", channel_id)))?;

        let mut candidates = Vec::new();
        let mut page_token: Option<String> = None;

        'pages: for _ in 0..MAX_PAGES {
            let mut params = vec![
                ("part", "snippet,contentDetails".to_string()),
                ("playlistId", playlist_id.clone()),
                ("maxResults", PAGE_SIZE.to_string()),
            ];
            if let Some(token) = &page_token {
                params.push(("pageToken", token.clone()));
            }

            let page: ListResponse<PlaylistItem> = self.get("playlistItems", &params).await?;
            for item in page.items {
                let published = item.content_details.video_published_at.or(item.snippet.published_at);
                // Uploads are newest first
                if published.map_or(false, |p| p < cutoff) {
                    break 'pages;
                }
                let mut candidate = CandidateItem::new(item.content_details.video_id, item.snippet.title);
                candidate.published_at = published;
                candidates.push(candidate);
                if candidates.len() >= max_count {
                    break 'pages;
                }
            }

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(candidates)
    }

    async fn activities(&self, channel_id: &str, cutoff: DateTime<Utc>, max_count: usize) -> Result<Vec<CandidateItem>> {
        let mut candidates = Vec::new();
        let mut page_token: Option<String> = None;

        for _ in 0..MAX_PAGES {
            let mut params = vec![
                ("part", "snippet,contentDetails".to_string()),
                ("channelId", channel_id.to_string()),
                ("publishedAfter", cutoff.to_rfc3339()),
                ("maxResults", PAGE_SIZE.to_string()),
            ];
            if let Some(token) = &page_token {
                params.push(("pageToken", token.clone()));
            }

            let page: ListResponse<ActivityItem> = self.get("activities", &params).await?;
            for item in page.items {
                if item.snippet.kind.as_deref() != Some("upload") {
                    continue;
                }
                if let Some(upload) = item.content_details.and_then(|d| d.upload) {
                    let mut candidate = CandidateItem::new(upload.video_id, item.snippet.title);
                    candidate.published_at = item.snippet.published_at;
                    candidates.push(candidate);
                }
            }

            match page.next_page_token {
                Some(token) if candidates.len() < max_count => page_token = Some(token),
                _ => break,
            }
        }

        Ok(candidates)
    }

    async fn search_uploads(&self, channel_id: &str, cutoff: DateTime<Utc>, max_count: usize) -> Result<Vec<CandidateItem>> {
        let mut candidates = Vec::new();
        let mut page_token: Option<String> = None;

        for _ in 0..MAX_PAGES {
            let mut params = vec![
                ("part", "snippet".to_string()),
                ("channelId", channel_id.to_string()),
                ("type", "video".to_string()),
                ("order", "date".to_string()),
                ("publishedAfter", cutoff.to_rfc3339()),
                ("maxResults", PAGE_SIZE.to_string()),
            ];
            if let Some(token) = &page_token {
                params.push(("pageToken", token.clone()));
            }

            let page: ListResponse<SearchItem> = self.get("search", &params).await?;
            for item in page.items {
                if let Some(video_id) = item.id.video_id {
                    let mut candidate = CandidateItem::new(video_id, item.snippet.title);
                    candidate.published_at = item.snippet.published_at;
                    candidates.push(candidate);
                }
            }

            match page.next_page_token {
                Some(token) if candidates.len() < max_count => page_token = Some(token),
                _ => break,
            }
        }

        Ok(candidates)
    }
}

#[async_trait]
impl Discovery for DataApiClient {
    async fn list_candidates(&self, source: &str, lookback: chrono::Duration, max_count: usize) -> Result<Vec<CandidateItem>> {
        if max_count == 0 {
            return Ok(Vec::new());
        }

        let channel = ChannelSource::parse(source)?;
        let channel_id = self.resolve_channel_id(&channel).await?;
        let cutoff = Utc::now() - lookback;
        info!("📺 Listing uploads of {} since {}", channel_id, cutoff.format("%Y-%m-%d"));

        let mut last_error = None;
        for strategy in &self.strategies {
            let listed = match strategy {
                DiscoveryStrategy::UploadsPlaylist => self.uploads_playlist(&channel_id, cutoff, max_count).await,
                DiscoveryStrategy::Activities => self.activities(&channel_id, cutoff, max_count).await,
                DiscoveryStrategy::Search => self.search_uploads(&channel_id, cutoff, max_count).await,
            };

            match listed {
                Ok(mut candidates) if !candidates.is_empty() => {
                    candidates.retain(|c| c.published_at.map_or(true, |p| p >= cutoff));
                    candidates.truncate(max_count);
                    info!("📋 {:?} found {} candidates", strategy, candidates.len());
                    return Ok(candidates);
                }
                Ok(_) => debug!("{:?} found nothing, trying next strategy", strategy),
                Err(e) => {
                    warn!("⚠️ Discovery strategy {:?} failed: {}", strategy, e);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(Vec::new()),
        }
    }
}

#[async_trait]
impl MetadataLookup for DataApiClient {
    async fn batch_durations(&self, item_ids: &[String]) -> Result<HashMap<String, Option<u64>>> {
        let mut durations = HashMap::with_capacity(item_ids.len());

        for chunk in item_ids.chunks(DURATION_BATCH_CEILING) {
            let response: ListResponse<VideoItem> = self
                .get("videos", &[("part", "contentDetails".to_string()), ("id", chunk.join(","))])
                .await?;

            for item in response.items {
                let seconds = item
                    .content_details
                    .and_then(|d| d.duration)
                    .and_then(|d| parse_iso8601_duration(&d))
                    // Live streams and premieres report zero
                    .filter(|s| *s > 0);
                durations.insert(item.id, seconds);
            }
        }

        Ok(durations)
    }
}

#[async_trait]
impl DescriptionSource for DataApiClient {
    async fn fetch_description(&self, item_id: &str, identity: &AddressIdentity) -> std::result::Result<String, FetchError> {
        let client = client_for(identity, self.timeout)?;
        let response = client
            .get(format!("{}/videos", self.base_url))
            .query(&[("part", "snippet"), ("id", item_id), ("key", self.api_key.as_str())])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(status_error(response.status()));
        }

        let body: ListResponse<VideoItem> = serde_json::from_str(&response.text().await?)?;
        body.items
            .into_iter()
            .next()
            .map(|item| item.snippet.description)
            .ok_or_else(|| FetchError::unavailable(format!("item {} not found", item_id)))
    }
}
