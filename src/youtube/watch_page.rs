/// Transcripts from the caption tracks embedded in the watch page
use super::{client_for, download_first, status_error};
use crate::error::FetchError;
use crate::extraction::{rank_tracks, CaptionTrack, LanguagePreference, Transcript, TranscriptMethod};
use crate::pool::AddressIdentity;
use async_trait::async_trait;
use scraper::{Html, Selector};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

const PLAYER_RESPONSE_MARKER: &str = "ytInitialPlayerResponse";

/// Structured transcript method: watch page → caption track list → timed text
#[derive(Debug, Clone)]
pub struct WatchPageTranscripts {
    base_url: String,
    timeout: Duration,
}

impl WatchPageTranscripts {
    pub fn new(timeout: Duration) -> Self {
        Self::with_base_url("https://www.youtube.com", timeout)
    }

    pub fn with_base_url(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl TranscriptMethod for WatchPageTranscripts {
    fn name(&self) -> &str {
        "watch_page"
    }

    async fn fetch_transcript(
        &self,
        item_id: &str,
        language: &LanguagePreference,
        identity: &AddressIdentity,
    ) -> Result<Transcript, FetchError> {
        let client = client_for(identity, self.timeout)?;
        let response = client
            .get(format!("{}/watch", self.base_url))
            .query(&[("v", item_id), ("hl", "en")])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(status_error(response.status()));
        }

        let html = response.text().await?;
        let tracks = caption_tracks_from_page(&html)?;
        debug!("🎞️ {} caption tracks on watch page of {}", tracks.len(), item_id);

        let choices = rank_tracks(&tracks, language);
        download_first(&client, &choices).await
    }
}

/// Find the embedded player response and read its caption track list
pub fn caption_tracks_from_page(html: &str) -> Result<Vec<CaptionTrack>, FetchError> {
    let player = player_response(html)?;
    check_playability(&player)?;

    let tracks = player
        .pointer("/captions/playerCaptionsTracklistRenderer/captionTracks")
        .and_then(Value::as_array)
        .ok_or_else(|| FetchError::unavailable("item has no captions"))?;

    Ok(tracks.iter().filter_map(parse_track).collect())
}

fn player_response(html: &str) -> Result<Value, FetchError> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("script").map_err(|e| FetchError::transient(format!("selector: {:?}", e)))?;

    for script in document.select(&selector) {
        let text: String = script.text().collect();
        let Some(marker) = text.find(PLAYER_RESPONSE_MARKER) else {
            continue;
        };
        let Some(open) = text[marker..].find('{').map(|i| marker + i) else {
            continue;
        };
        if let Some(object) = balanced_object(&text[open..]) {
            return Ok(serde_json::from_str(object)?);
        }
    }

    // Consent walls and bot checks serve a page without the player
    Err(FetchError::transient("watch page has no player response"))
}

/// Slice of `text` holding the JSON object that starts at its first byte
fn balanced_object(text: &str) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(&text[..=i]);
                }
            }
            _ => {}
        }
    }

    None
}

fn check_playability(player: &Value) -> Result<(), FetchError> {
    let status = player
        .pointer("/playabilityStatus/status")
        .and_then(Value::as_str)
        .unwrap_or("OK");
    let reason = player
        .pointer("/playabilityStatus/reason")
        .and_then(Value::as_str)
        .unwrap_or(status)
        .to_string();

    match status {
        "OK" => Ok(()),
        // Bot checks ask for a login; another identity usually gets through
        "LOGIN_REQUIRED" => Err(FetchError::transient(reason)),
        _ => Err(FetchError::unavailable(reason)),
    }
}

fn parse_track(track: &Value) -> Option<CaptionTrack> {
    let url = track.get("baseUrl")?.as_str()?.to_string();
    let language_code = track.get("languageCode")?.as_str()?.to_string();

    let name = track
        .pointer("/name/simpleText")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| {
            track.pointer("/name/runs").and_then(Value::as_array).map(|runs| {
                runs.iter()
                    .filter_map(|r| r.get("text").and_then(Value::as_str))
                    .collect::<String>()
            })
        });

    Some(CaptionTrack {
        language_code,
        name,
        generated: track.get("kind").and_then(Value::as_str) == Some("asr"),
        translatable: track.get("isTranslatable").and_then(Value::as_bool).unwrap_or(false),
        url,
    })
}
