//! Stage detection and progress estimation from process output.
//!
//! The external process may announce stages explicitly with a marker line:
//!
//! ```text
//! ::stage::transcribing
//! ::stage::diarizing::40
//! ::stage::3 loading pyannote pipeline
//! ```
//!
//! Lines without a marker fall back to keyword matching against free text.
//! Either way the detected stage maps onto a fixed progress band. Detection
//! is advisory telemetry; it never completes a job.

use serde::Serialize;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Prefix of a structured stage marker line.
pub const STAGE_MARKER_PREFIX: &str = "::stage::";

/// Keyword fallback table, checked in order. First match wins.
const STAGE_KEYWORDS: &[(Stage, &[&str])] = &[
    (
        Stage::Initializing,
        &["upload", "initializ", "loading audio", "preparing"],
    ),
    (
        Stage::Transcribing,
        &["transcrib", "whisper", "speech recognition"],
    ),
    (Stage::Diarizing, &["diariz", "speaker", "clustering"]),
    (
        Stage::Finalizing,
        &["finaliz", "writing result", "saving", "merging"],
    ),
];

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// Ordered processing stages of the external compute process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Initializing = 1,
    Transcribing = 2,
    Diarizing = 3,
    Finalizing = 4,
}

impl Stage {
    pub fn ordinal(self) -> u8 {
        self as u8
    }

    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        match ordinal {
            1 => Some(Stage::Initializing),
            2 => Some(Stage::Transcribing),
            3 => Some(Stage::Diarizing),
            4 => Some(Stage::Finalizing),
            _ => None,
        }
    }

    /// Parse a marker stage token: a name or an ordinal.
    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "initializing" | "init" | "upload" => Some(Stage::Initializing),
            "transcribing" | "transcription" => Some(Stage::Transcribing),
            "diarizing" | "diarization" => Some(Stage::Diarizing),
            "finalizing" | "finalize" => Some(Stage::Finalizing),
            other => other.parse().ok().and_then(Stage::from_ordinal),
        }
    }

    /// Human-readable step label shown to polling clients.
    pub fn step_label(self) -> &'static str {
        match self {
            Stage::Initializing => "initializing",
            Stage::Transcribing => "transcribing",
            Stage::Diarizing => "identifying speakers",
            Stage::Finalizing => "finalizing",
        }
    }

    /// Progress band `[start, end)` for this stage.
    pub fn band(self) -> (u8, u8) {
        match self {
            Stage::Initializing => (10, 25),
            Stage::Transcribing => (25, 50),
            Stage::Diarizing => (50, 75),
            Stage::Finalizing => (75, 100),
        }
    }
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

/// A stage observed on one output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageSignal {
    pub stage: Stage,
    /// Completion within the stage (0..=100), from a marker only.
    pub percent: Option<u8>,
    /// Whether the signal came from a structured marker.
    pub explicit: bool,
}

/// Parse a structured `::stage::<name>[::<percent>]` marker.
///
/// Returns `None` for lines that are not markers or are malformed markers.
pub fn parse_marker(line: &str) -> Option<StageSignal> {
    let rest = line.trim().strip_prefix(STAGE_MARKER_PREFIX)?;
    // Anything after the first whitespace is free text.
    let token = rest.split_whitespace().next()?;
    let mut parts = token.split("::");
    let stage = Stage::from_token(parts.next()?)?;
    let percent = match parts.next() {
        Some(raw) => Some(raw.trim().parse::<u8>().ok()?.min(100)),
        None => None,
    };
    Some(StageSignal {
        stage,
        percent,
        explicit: true,
    })
}

/// Keyword fallback for free-text lines.
pub fn match_keywords(line: &str) -> Option<Stage> {
    let lower = line.to_lowercase();
    STAGE_KEYWORDS
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| lower.contains(k)))
        .map(|(stage, _)| *stage)
}

/// Detect a stage on one line: marker first, keywords as fallback.
pub fn detect(line: &str) -> Option<StageSignal> {
    if line.trim_start().starts_with(STAGE_MARKER_PREFIX) {
        return parse_marker(line);
    }
    match_keywords(line).map(|stage| StageSignal {
        stage,
        percent: None,
        explicit: false,
    })
}

/// Map a stage (and optional in-stage percent) to overall progress.
///
/// The result stays strictly below the band end so that a stage never
/// reports the next stage's start, and never reaches 100.
pub fn estimate_progress(stage: Stage, percent: Option<u8>) -> u8 {
    let (start, end) = stage.band();
    let Some(percent) = percent else {
        return start;
    };
    let span = u32::from(end - start);
    let offset = span * u32::from(percent.min(100)) / 100;
    let value = u32::from(start) + offset;
    value.min(u32::from(end) - 1) as u8
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// A progress change to publish for a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub stage: Stage,
    pub step: String,
    pub progress: u8,
}

/// Per-job stage state. Feeds lines in, emits forward-only updates.
#[derive(Debug, Default)]
pub struct StageTracker {
    current: Option<Stage>,
    progress: u8,
}

impl StageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Stage> {
        self.current
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    /// Observe one output line. Returns an update only when the stage
    /// advances or the estimated progress increases.
    pub fn observe(&mut self, line: &str) -> Option<ProgressUpdate> {
        let signal = detect(line)?;
        if self.current.is_some_and(|current| signal.stage < current) {
            return None;
        }

        let estimate = estimate_progress(signal.stage, signal.percent);
        let stage_changed = self.current != Some(signal.stage);
        if !stage_changed && estimate <= self.progress {
            return None;
        }

        self.current = Some(signal.stage);
        self.progress = self.progress.max(estimate);
        Some(ProgressUpdate {
            stage: signal.stage,
            step: signal.stage.step_label().to_string(),
            progress: self.progress,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
