use super::{client_for, download_first};
use crate::error::FetchError;
use crate::extraction::chapters::validate_chapters;
use crate::extraction::{rank_tracks, CaptionTrack, Chapter, ChapterMethod, LanguagePreference, Transcript, TranscriptMethod};
use crate::pool::AddressIdentity;
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Runs `yt-dlp` for item metadata, through an identity's proxy
#[derive(Debug, Clone)]
pub struct YtDlp {
    binary: PathBuf,
    timeout: Duration,
}

impl YtDlp {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    /// Check if yt-dlp is available
    pub async fn is_available(&self) -> bool {
        Command::new(&self.binary)
            .arg("--version")
            .output()
            .await
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    /// The `--dump-single-json` document for one item
    pub async fn metadata(&self, item_id: &str, identity: &AddressIdentity) -> Result<Value, FetchError> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--dump-single-json")
            .arg("--skip-download")
            .arg("--no-playlist")
            .arg("--no-warnings");

        if let Some(proxy) = identity.proxy_url() {
            cmd.arg("--proxy").arg(proxy);
        }

        cmd.arg(format!("https://www.youtube.com/watch?v={}", item_id))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("🛠️ Running {} for {} through {}", self.binary.display(), item_id, identity);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FetchError::unavailable(format!("{} not found", self.binary.display())));
            }
            Ok(Err(e)) => return Err(FetchError::transient(format!("failed to run yt-dlp: {}", e))),
            Err(_) => return Err(FetchError::transient(format!("yt-dlp timed out after {:?}", self.timeout))),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_stderr(&stderr));
        }

        Ok(serde_json::from_slice(&output.stdout)?)
    }
}

/// Tell apart "this item has nothing" from "this identity got blocked"
fn classify_stderr(stderr: &str) -> FetchError {
    let message = stderr
        .lines()
        .rev()
        .find(|l| l.contains("ERROR"))
        .unwrap_or(stderr)
        .trim()
        .to_string();

    const GONE: [&str; 5] = [
        "Video unavailable",
        "Private video",
        "has been removed",
        "This live event will begin",
        "members-only",
    ];

    if GONE.iter().any(|g| message.contains(g)) && !message.contains("confirm you") {
        FetchError::Unavailable(message)
    } else {
        FetchError::Transient(message)
    }
}

/// Caption tracks listed in yt-dlp metadata. Automatic entries that are
/// already translations are skipped; translation is requested explicitly.
pub fn caption_tracks_from_metadata(metadata: &Value) -> Vec<CaptionTrack> {
    let mut tracks = Vec::new();

    for (field, generated) in [("subtitles", false), ("automatic_captions", true)] {
        let Some(languages) = metadata.get(field).and_then(Value::as_object) else {
            continue;
        };

        for (language_code, formats) in languages {
            if language_code == "live_chat" {
                continue;
            }

            let json3 = formats
                .as_array()
                .into_iter()
                .flatten()
                .find(|f| f.get("ext").and_then(Value::as_str) == Some("json3"));

            let Some(format) = json3 else { continue };
            let Some(url) = format.get("url").and_then(Value::as_str) else { continue };
            if generated && url.contains("tlang=") {
                continue;
            }

            tracks.push(CaptionTrack {
                language_code: language_code.trim_end_matches("-orig").to_string(),
                name: format.get("name").and_then(Value::as_str).map(str::to_string),
                generated,
                translatable: true,
                url: url.to_string(),
            });
        }
    }

    tracks
}

/// Chapters from yt-dlp metadata, validated against the item duration
pub fn chapters_from_metadata(metadata: &Value) -> Vec<Chapter> {
    let chapters: Vec<Chapter> = metadata
        .get("chapters")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|c| {
            let start = c.get("start_time")?.as_f64()?;
            let title = c.get("title")?.as_str()?;
            Some(Chapter::new(start, title))
        })
        .collect();

    let duration = metadata.get("duration").and_then(Value::as_f64);
    validate_chapters(&chapters, duration)
}

/// Generic media tool transcript method
#[derive(Debug, Clone)]
pub struct YtDlpTranscripts {
    ytdlp: YtDlp,
    timeout: Duration,
}

impl YtDlpTranscripts {
    pub fn new(ytdlp: YtDlp, timeout: Duration) -> Self {
        Self { ytdlp, timeout }
    }
}

#[async_trait]
impl TranscriptMethod for YtDlpTranscripts {
    fn name(&self) -> &str {
        "yt_dlp"
    }

    async fn fetch_transcript(
        &self,
        item_id: &str,
        language: &LanguagePreference,
        identity: &AddressIdentity,
    ) -> Result<Transcript, FetchError> {
        let metadata = self.ytdlp.metadata(item_id, identity).await?;
        let tracks = caption_tracks_from_metadata(&metadata);
        debug!("🎞️ yt-dlp lists {} caption tracks for {}", tracks.len(), item_id);

        let client = client_for(identity, self.timeout)?;
        download_first(&client, &rank_tracks(&tracks, language)).await
    }
}

/// Primary chapter method: structured chapters from yt-dlp
#[derive(Debug, Clone)]
pub struct YtDlpChapters {
    ytdlp: YtDlp,
}

impl YtDlpChapters {
    pub fn new(ytdlp: YtDlp) -> Self {
        Self { ytdlp }
    }
}

#[async_trait]
impl ChapterMethod for YtDlpChapters {
    fn name(&self) -> &str {
        "yt_dlp_chapters"
    }

    async fn fetch_chapters(&self, item_id: &str, identity: &AddressIdentity) -> Result<Vec<Chapter>, FetchError> {
        let metadata = self.ytdlp.metadata(item_id, identity).await?;
        let chapters = chapters_from_metadata(&metadata);
        if chapters.is_empty() {
            return Err(FetchError::unavailable("no chapters in metadata"));
        }
        Ok(chapters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_caption_tracks_from_metadata() {
        let metadata = json!({
            "subtitles": {
                "en": [{"ext": "vtt", "url": "https://x/vtt"}, {"ext": "json3", "url": "https://x/en", "name": "English"}],
                "live_chat": [{"ext": "json3", "url": "https://x/chat"}]
            },
            "automatic_captions": {
                "pt-orig": [{"ext": "json3", "url": "https://x/pt?kind=asr"}],
                "de": [{"ext": "json3", "url": "https://x/pt?kind=asr&tlang=de"}]
            }
        });

        let tracks = caption_tracks_from_metadata(&metadata);
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].language_code, "en");
        assert!(!tracks[0].generated);
        assert_eq!(tracks[0].name.as_deref(), Some("English"));
        assert_eq!(tracks[1].language_code, "pt");
        assert!(tracks[1].generated);
    }

    #[test]
    fn test_chapters_from_metadata() {
        let metadata = json!({
            "duration": 600.0,
            "chapters": [
                {"start_time": 120.0, "end_time": 600.0, "title": "Drills"},
                {"start_time": 0.0, "end_time": 120.0, "title": "Warmup"},
                {"start_time": 700.0, "title": "Past the end"}
            ]
        });
        assert_eq!(
            chapters_from_metadata(&metadata),
            vec![Chapter::new(0.0, "Warmup"), Chapter::new(120.0, "Drills")]
        );
        assert!(chapters_from_metadata(&json!({"chapters": null})).is_empty());
    }

    #[test]
    fn test_classify_stderr() {
        assert!(!classify_stderr("ERROR: [youtube] abc: Video unavailable").is_transient());
        assert!(classify_stderr("ERROR: [youtube] abc: Sign in to confirm you're not a bot").is_transient());
        assert!(classify_stderr("ERROR: unable to download webpage: HTTP Error 429").is_transient());
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        let ytdlp = YtDlp::new("/nonexistent/yt-dlp-binary", Duration::from_secs(5));
        assert!(!ytdlp.is_available().await);
        let err = ytdlp.metadata("dQw4w9WgXcQ", &AddressIdentity::direct(0)).await.unwrap_err();
        assert!(!err.is_transient());
    }
}
