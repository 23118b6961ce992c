//! Transcript result payload produced by the external process.
//!
//! The process writes a JSON document with time-aligned, speaker-labelled
//! segments and aggregate metrics. [`TranscriptResult::normalize`] validates
//! it and puts it in canonical form before it is committed.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Speaker labels follow `SPEAKER_00`, `SPEAKER_01`, ...
static SPEAKER_LABEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^SPEAKER_\d{2,}$").expect("valid regex"));

/// Canonical label for the `index`-th speaker.
pub fn speaker_label(index: usize) -> String {
    format!("SPEAKER_{index:02}")
}

pub fn is_speaker_label(label: &str) -> bool {
    SPEAKER_LABEL_RE.is_match(label)
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// A time-aligned span of speech. Times are seconds from the start of the
/// source media.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
    pub speaker: String,
    pub text: String,
}

/// Aggregate metrics reported alongside the segments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingMetrics {
    pub total_processing_secs: f64,
    pub audio_duration_secs: f64,
    /// Seconds spent per stage, keyed by stage name.
    pub stage_timings: BTreeMap<String, f64>,
    /// Processing time divided by audio duration.
    pub realtime_factor: f64,
    pub segment_count: usize,
    pub speaker_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptResult {
    pub segments: Vec<Segment>,
    #[serde(default)]
    pub metrics: ProcessingMetrics,
}

impl TranscriptResult {
    /// Parse the raw JSON artifact written by the process.
    pub fn from_json(bytes: &[u8]) -> Result<Self, CoreError> {
        serde_json::from_slice(bytes)
            .map_err(|e| CoreError::Validation(format!("malformed transcript JSON: {e}")))
    }

    /// Validate segment times, sort by start, and recompute derived counts.
    pub fn normalize(mut self) -> Result<Self, CoreError> {
        for (i, segment) in self.segments.iter().enumerate() {
            if !segment.start.is_finite() || !segment.end.is_finite() {
                return Err(CoreError::Validation(format!(
                    "segment {i} has a non-finite timestamp"
                )));
            }
            if segment.start < 0.0 {
                return Err(CoreError::Validation(format!(
                    "segment {i} starts before zero ({})",
                    segment.start
                )));
            }
            if segment.end < segment.start {
                return Err(CoreError::Validation(format!(
                    "segment {i} ends ({}) before it starts ({})",
                    segment.end, segment.start
                )));
            }
        }

        self.segments
            .sort_by(|a, b| a.start.total_cmp(&b.start).then(a.end.total_cmp(&b.end)));

        let speakers: BTreeSet<&str> = self.segments.iter().map(|s| s.speaker.as_str()).collect();
        self.metrics.segment_count = self.segments.len();
        self.metrics.speaker_count = speakers.len();

        if self.metrics.realtime_factor == 0.0 && self.metrics.audio_duration_secs > 0.0 {
            self.metrics.realtime_factor =
                self.metrics.total_processing_secs / self.metrics.audio_duration_secs;
        }

        Ok(self)
    }

    /// Labels that do not follow the `SPEAKER_NN` pattern.
    pub fn nonstandard_speakers(&self) -> Vec<&str> {
        let mut labels: Vec<&str> = self
            .segments
            .iter()
            .map(|s| s.speaker.as_str())
            .filter(|label| !is_speaker_label(label))
            .collect();
        labels.sort_unstable();
        labels.dedup();
        labels
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(start: f64, end: f64, speaker: &str) -> Segment {
        Segment {
            start,
            end,
            speaker: speaker.to_string(),
            text: "hello".to_string(),
        }
    }

    #[test]
    fn speaker_labels_are_zero_padded() {
        assert_eq!(speaker_label(0), "SPEAKER_00");
        assert_eq!(speaker_label(7), "SPEAKER_07");
        assert_eq!(speaker_label(123), "SPEAKER_123");
        assert!(is_speaker_label("SPEAKER_01"));
        assert!(!is_speaker_label("SPEAKER_1"));
        assert!(!is_speaker_label("speaker_01"));
    }

    #[test]
    fn normalize_sorts_segments_and_recomputes_counts() {
        let result = TranscriptResult {
            segments: vec![
                segment(5.0, 7.0, "SPEAKER_01"),
                segment(0.0, 2.5, "SPEAKER_00"),
                segment(2.5, 5.0, "SPEAKER_00"),
            ],
            metrics: ProcessingMetrics {
                total_processing_secs: 30.0,
                audio_duration_secs: 60.0,
                segment_count: 99,
                ..Default::default()
            },
        }
        .normalize()
        .unwrap();

        let starts: Vec<f64> = result.segments.iter().map(|s| s.start).collect();
        assert_eq!(starts, vec![0.0, 2.5, 5.0]);
        assert_eq!(result.metrics.segment_count, 3);
        assert_eq!(result.metrics.speaker_count, 2);
        assert_eq!(result.metrics.realtime_factor, 0.5);
    }

    #[test]
    fn normalize_rejects_inverted_segment() {
        let result = TranscriptResult {
            segments: vec![segment(4.0, 3.0, "SPEAKER_00")],
            metrics: ProcessingMetrics::default(),
        };
        assert!(result.normalize().is_err());
    }

    #[test]
    fn from_json_tolerates_missing_metrics() {
        let json = br#"{"segments":[{"start":0.0,"end":1.0,"speaker":"SPEAKER_00","text":"hi"}]}"#;
        let result = TranscriptResult::from_json(json).unwrap().normalize().unwrap();
        assert_eq!(result.metrics.segment_count, 1);
        assert!(result.metrics.stage_timings.is_empty());
    }

    #[test]
    fn from_json_rejects_garbage() {
        assert!(TranscriptResult::from_json(b"not json").is_err());
        assert!(TranscriptResult::from_json(br#"{"metrics":{}}"#).is_err());
    }

    #[test]
    fn nonstandard_speakers_are_reported_once() {
        let result = TranscriptResult {
            segments: vec![
                segment(0.0, 1.0, "alice"),
                segment(1.0, 2.0, "SPEAKER_00"),
                segment(2.0, 3.0, "alice"),
            ],
            metrics: ProcessingMetrics::default(),
        };
        assert_eq!(result.nonstandard_speakers(), vec!["alice"]);
    }
}
