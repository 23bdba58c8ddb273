/// Caption track selection by language preference
use serde::{Deserialize, Serialize};

/// Which transcript language to look for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LanguagePreference {
    /// Preferred language code, e.g. `en`
    pub target: String,
    /// Second choice before falling back to any track
    pub fallback: Option<String>,
    /// Accept upstream machine translation into `target` as a last resort
    pub allow_translation: bool,
}

impl Default for LanguagePreference {
    fn default() -> Self {
        Self {
            target: "en".to_string(),
            fallback: None,
            allow_translation: true,
        }
    }
}

impl LanguagePreference {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            ..Self::default()
        }
    }

    pub fn with_fallback(mut self, fallback: impl Into<String>) -> Self {
        self.fallback = Some(fallback.into());
        self
    }

    pub fn without_translation(mut self) -> Self {
        self.allow_translation = false;
        self
    }
}

/// How a transcript track came to be
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Manual,
    Generated,
    Translated,
}

/// One caption track advertised by the upstream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptionTrack {
    pub language_code: String,
    pub name: Option<String>,
    pub generated: bool,
    pub translatable: bool,
    /// Download location of the track
    pub url: String,
}

/// A track to try, in ranked order
#[derive(Debug, Clone, PartialEq)]
pub enum TrackChoice {
    Native(CaptionTrack),
    Translated { source: CaptionTrack, target: String },
}

impl TrackChoice {
    pub fn language(&self) -> &str {
        match self {
            TrackChoice::Native(track) => &track.language_code,
            TrackChoice::Translated { target, .. } => target,
        }
    }

    pub fn kind(&self) -> TrackKind {
        match self {
            TrackChoice::Native(track) if track.generated => TrackKind::Generated,
            TrackChoice::Native(_) => TrackKind::Manual,
            TrackChoice::Translated { .. } => TrackKind::Translated,
        }
    }

    pub fn track(&self) -> &CaptionTrack {
        match self {
            TrackChoice::Native(track) => track,
            TrackChoice::Translated { source, .. } => source,
        }
    }
}

/// `en` matches `en`, `en-US` and `en-GB`
pub fn language_matches(code: &str, wanted: &str) -> bool {
    let base = code.split(['-', '_']).next().unwrap_or(code);
    code.eq_ignore_ascii_case(wanted) || base.eq_ignore_ascii_case(wanted)
}

/// Order tracks for download: target language, fallback language, any other
/// native track, then translations into the target. Manual tracks come before
/// generated ones within each group.
pub fn rank_tracks(tracks: &[CaptionTrack], preference: &LanguagePreference) -> Vec<TrackChoice> {
    fn take<'t>(
        tracks: &'t [CaptionTrack],
        ordered: &mut Vec<&'t CaptionTrack>,
        predicate: impl Fn(&CaptionTrack) -> bool,
    ) {
        for generated in [false, true] {
            for track in tracks {
                if track.generated == generated
                    && predicate(track)
                    && !ordered.iter().any(|t| std::ptr::eq(*t, track))
                {
                    ordered.push(track);
                }
            }
        }
    }

    let mut ordered: Vec<&CaptionTrack> = Vec::with_capacity(tracks.len());
    take(tracks, &mut ordered, |t| language_matches(&t.language_code, &preference.target));
    if let Some(fallback) = &preference.fallback {
        take(tracks, &mut ordered, |t| language_matches(&t.language_code, fallback));
    }
    take(tracks, &mut ordered, |_| true);

    let mut choices: Vec<TrackChoice> = ordered.iter().map(|t| TrackChoice::Native((*t).clone())).collect();

    if preference.allow_translation {
        for generated in [false, true] {
            for track in tracks {
                if track.generated == generated
                    && track.translatable
                    && !language_matches(&track.language_code, &preference.target)
                {
                    choices.push(TrackChoice::Translated {
                        source: track.clone(),
                        target: preference.target.clone(),
                    });
                }
            }
        }
    }

    choices
}
