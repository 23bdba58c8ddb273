/// Chapter parsing from free-text descriptions
use super::ChapterMethod;
use crate::error::FetchError;
use crate::pool::AddressIdentity;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// Represents a single chapter in a video
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chapter {
    /// Seconds from the start of the item
    pub start: f64,
    /// Chapter title
    pub title: String,
}

impl Chapter {
    pub fn new(start: f64, title: impl Into<String>) -> Self {
        Self {
            start,
            title: title.into(),
        }
    }

    pub fn formatted_start(&self) -> String {
        format_timestamp(self.start)
    }
}

/// Supplies the free-text description of an item
#[async_trait]
pub trait DescriptionSource: Send + Sync {
    async fn fetch_description(&self, item_id: &str, identity: &AddressIdentity) -> Result<String, FetchError>;
}

fn chapter_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // "0:00 Intro", "01:02:03 - Title", "12:30 — Title", "5:00: Title"
        Regex::new(r"(\d{1,2}:\d{2}(?::\d{2})?)(?:\s*[-–—:|]\s*|\s+)(\S.*)").expect("valid chapter regex")
    })
}

/// Convert `MM:SS` or `HH:MM:SS` into seconds
pub fn parse_timestamp(value: &str) -> Option<u64> {
    let parts: Vec<u64> = value
        .trim()
        .split(':')
        .map(|p| p.parse::<u64>().ok())
        .collect::<Option<Vec<_>>>()?;

    match parts.as_slice() {
        [minutes, seconds] if *seconds < 60 => Some(minutes * 60 + seconds),
        [hours, minutes, seconds] if *minutes < 60 && *seconds < 60 => {
            Some(hours * 3600 + minutes * 60 + seconds)
        }
        _ => None,
    }
}

/// Render seconds as `MM:SS`, or `HH:MM:SS` past the hour
pub fn format_timestamp(seconds: f64) -> String {
    let total = if seconds.is_finite() && seconds > 0.0 { seconds as u64 } else { 0 };
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let secs = total % 60;

    if hours > 0 {
        format!("{:02}:{:02}:{:02}", hours, minutes, secs)
    } else {
        format!("{:02}:{:02}", minutes, secs)
    }
}

/// Scan a description for `<timestamp> <title>` lines.
///
/// Needs at least two matching lines to count as a chapter list; a single
/// timestamp in prose is not a chapter list.
pub fn parse_description_chapters(description: &str) -> Vec<Chapter> {
    let re = chapter_line_regex();
    let mut chapters = Vec::new();

    for line in description.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(captures) = re.captures(line) {
            let timestamp = captures.get(1).map(|m| m.as_str()).unwrap_or("");
            let title = captures.get(2).map(|m| m.as_str().trim()).unwrap_or("");

            if let Some(start) = parse_timestamp(timestamp) {
                chapters.push(Chapter::new(start as f64, title));
            }
        }
    }

    let chapters = validate_chapters(&chapters, None);
    if chapters.len() >= 2 {
        chapters
    } else {
        Vec::new()
    }
}

/// Drop untitled chapters, duplicate start times and chapters past the end, then sort
pub fn validate_chapters(chapters: &[Chapter], duration_secs: Option<f64>) -> Vec<Chapter> {
    let mut seen = HashSet::new();
    let mut valid: Vec<Chapter> = chapters
        .iter()
        .filter(|c| !c.title.trim().is_empty())
        .filter(|c| c.start >= 0.0)
        .filter(|c| duration_secs.map_or(true, |d| c.start <= d))
        .filter(|c| seen.insert(c.start.to_bits()))
        .map(|c| Chapter::new(c.start, c.title.trim()))
        .collect();

    valid.sort_by(|a, b| a.start.partial_cmp(&b.start).unwrap_or(std::cmp::Ordering::Equal));
    valid
}

/// Secondary chapter method: parse the item description
pub struct DescriptionChapters {
    source: Arc<dyn DescriptionSource>,
}

impl DescriptionChapters {
    pub fn new(source: Arc<dyn DescriptionSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl ChapterMethod for DescriptionChapters {
    fn name(&self) -> &str {
        "description"
    }

    async fn fetch_chapters(&self, item_id: &str, identity: &AddressIdentity) -> Result<Vec<Chapter>, FetchError> {
        let description = self.source.fetch_description(item_id, identity).await?;
        let chapters = parse_description_chapters(&description);
        debug!("📝 Parsed {} chapters from description of {}", chapters.len(), item_id);

        if chapters.is_empty() {
            return Err(FetchError::unavailable("description has no chapter list"));
        }
        Ok(chapters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_timestamp() {
        assert_eq!(parse_timestamp("0:00"), Some(0));
        assert_eq!(parse_timestamp("12:34"), Some(754));
        assert_eq!(parse_timestamp("1:02:03"), Some(3723));
        assert_eq!(parse_timestamp("1:75"), None);
        assert_eq!(parse_timestamp("abc"), None);
        assert_eq!(parse_timestamp("1:2:3:4"), None);
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(0.0), "00:00");
        assert_eq!(format_timestamp(754.9), "12:34");
        assert_eq!(format_timestamp(3723.0), "01:02:03");
        assert_eq!(format_timestamp(-5.0), "00:00");
    }

    #[test]
    fn test_parse_description_chapters() {
        let description = "Thanks for watching!\n\
            \n\
            0:00 Intro\n\
            1:30 - Setting up the guard\n\
            12:05 — Sweeps\n\
            1:02:03: Q&A\n\
            \n\
            Follow me on social media";

        let chapters = parse_description_chapters(description);
        assert_eq!(
            chapters,
            vec![
                Chapter::new(0.0, "Intro"),
                Chapter::new(90.0, "Setting up the guard"),
                Chapter::new(725.0, "Sweeps"),
                Chapter::new(3723.0, "Q&A"),
            ]
        );
    }

    #[test]
    fn test_single_timestamp_is_not_a_chapter_list() {
        assert!(parse_description_chapters("Live at 10:30 tonight").is_empty());
        assert!(parse_description_chapters("").is_empty());
    }

    #[test]
    fn test_chapters_are_sorted_and_deduplicated() {
        let description = "5:00 Second\n0:00 First\n5:00 Duplicate";
        let chapters = parse_description_chapters(description);
        assert_eq!(chapters, vec![Chapter::new(0.0, "First"), Chapter::new(300.0, "Second")]);
    }

    #[test]
    fn test_validate_drops_chapters_past_duration() {
        let chapters = vec![Chapter::new(0.0, "A"), Chapter::new(100.0, "B"), Chapter::new(50.0, "  ")];
        let valid = validate_chapters(&chapters, Some(60.0));
        assert_eq!(valid, vec![Chapter::new(0.0, "A")]);
    }
}
