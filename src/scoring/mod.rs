// Detection Summary - Frame Scoring
// Wraps the external scoring oracle: field mapping, failure values, event log.

pub mod pool;
pub mod ranking;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::FieldMapping;
use crate::constants::{FIELD_GENERIC_SCORE, SUMMARY_PREVIEW_CHARS};

/// Quality scores for one frame, as consumed by ranking and selection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreResult {
    pub person_score: f64,
    pub face_score: f64,
    pub frame_score: f64,
    pub pose: String,
    pub summary: String,
    /// Raw oracle output, kept verbatim
    pub structured: Map<String, Value>,
}

impl ScoreResult {
    pub fn new(person_score: f64, face_score: f64, frame_score: f64, pose: &str, summary: &str) -> Self {
        Self {
            person_score,
            face_score,
            frame_score,
            pose: pose.to_string(),
            summary: summary.to_string(),
            structured: Map::new(),
        }
    }

    /// Zero scores, empty strings. Stands in when nothing could be scored.
    pub fn placeholder() -> Self {
        Self::default()
    }

    pub fn has_person(&self) -> bool {
        self.person_score > 0.0
    }

    /// Build from raw oracle output using the configured key names.
    /// Person falls back to a generic "score" key; frame falls back to person.
    pub fn from_structured(data: Map<String, Value>, mapping: &FieldMapping) -> Self {
        let person_score = read_number(data.get(&mapping.person_score))
            .or_else(|| read_number(data.get(FIELD_GENERIC_SCORE)))
            .unwrap_or(0.0);
        let face_score = read_number(data.get(&mapping.face_score)).unwrap_or(0.0);
        let frame_score = read_number(data.get(&mapping.frame_score)).unwrap_or(person_score);
        let pose = read_text(data.get(&mapping.pose)).to_lowercase();
        let summary = read_text(data.get(&mapping.summary));

        Self {
            person_score,
            face_score,
            frame_score,
            pose,
            summary,
            structured: data,
        }
    }
}

fn read_number(value: Option<&Value>) -> Option<f64> {
    let n = match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }?;
    n.is_finite().then_some(n)
}

fn read_text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string().trim().to_string(),
    }
}

/// Why an index has no result.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScoreFailure {
    #[error("provider error: {0}")]
    Provider(String),

    #[error("provider timed out")]
    Timeout,

    #[error("no frame captured at this index")]
    MissingFrame,
}

pub type ScoreOutcome = std::result::Result<ScoreResult, ScoreFailure>;

/// Per-index scoring seam used by the selection engine.
pub trait FrameScorer {
    fn score_frame(&self, index: usize) -> ScoreOutcome;

    /// Score several indices; results may come back in any order.
    fn score_frames(&self, indices: &[usize]) -> Vec<(usize, ScoreOutcome)> {
        indices.iter().map(|&i| (i, self.score_frame(i))).collect()
    }
}

/// Adapts a closure into a FrameScorer.
pub struct ScoreFn<F>(pub F);

impl<F> FrameScorer for ScoreFn<F>
where
    F: Fn(usize) -> ScoreOutcome,
{
    fn score_frame(&self, index: usize) -> ScoreOutcome {
        (self.0)(index)
    }
}

/// External vision oracle. Returns the raw structured answer for one image.
pub trait ScoringOracle: Send + Sync {
    fn score_frame(
        &self,
        frame_ref: &str,
        instructions: &str,
        expected_fields: &[String],
    ) -> anyhow::Result<Map<String, Value>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OracleEventKind {
    Score,
    ImageGeneration,
}

/// One external call, summarized for the published record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleEvent {
    pub kind: OracleEventKind,
    pub frame_index: Option<usize>,
    pub elapsed_secs: f64,
    pub model: Option<String>,
    pub person_score: f64,
    pub face_score: f64,
    pub frame_score: f64,
    pub pose: String,
    pub summary_preview: String,
    pub failure: Option<String>,
}

impl OracleEvent {
    pub fn image_generation(elapsed_secs: f64, model: Option<String>, failure: Option<String>) -> Self {
        Self {
            kind: OracleEventKind::ImageGeneration,
            frame_index: None,
            elapsed_secs,
            model,
            person_score: 0.0,
            face_score: 0.0,
            frame_score: 0.0,
            pose: String::new(),
            summary_preview: String::new(),
            failure,
        }
    }
}

fn preview(text: &str) -> String {
    text.chars().take(SUMMARY_PREVIEW_CHARS).collect()
}

fn model_of(data: &Map<String, Value>) -> Option<String> {
    data.get("_meta")
        .and_then(|m| m.get("model"))
        .and_then(|m| m.as_str())
        .map(|s| s.to_string())
}

fn round_millis(secs: f64) -> f64 {
    (secs * 1000.0).round() / 1000.0
}

/// Scores captured frames through the oracle, applying the field mapping
/// and recording an event per call. Indices without a captured frame fail
/// with MissingFrame and never reach the oracle.
pub struct OracleScorer {
    oracle: Arc<dyn ScoringOracle>,
    frame_refs: HashMap<usize, String>,
    instructions: String,
    expected_fields: Vec<String>,
    mapping: FieldMapping,
    label: String,
    log_events: bool,
    events: Mutex<Vec<OracleEvent>>,
}

impl OracleScorer {
    pub fn new(
        oracle: Arc<dyn ScoringOracle>,
        frame_refs: HashMap<usize, String>,
        mapping: FieldMapping,
    ) -> Self {
        Self {
            oracle,
            frame_refs,
            instructions: String::new(),
            expected_fields: Vec::new(),
            mapping,
            label: String::new(),
            log_events: false,
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn with_instructions(mut self, instructions: &str, expected_fields: &[String]) -> Self {
        self.instructions = instructions.to_string();
        self.expected_fields = expected_fields.to_vec();
        self
    }

    /// Log prefix (e.g. "[garage] session=...") and whether to log each call.
    pub fn with_logging(mut self, label: impl Into<String>, enabled: bool) -> Self {
        self.label = label.into();
        self.log_events = enabled;
        self
    }

    /// Drain the recorded events, in call-completion order.
    pub fn take_events(&self) -> Vec<OracleEvent> {
        let mut guard = self.events.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *guard)
    }

    fn record(&self, event: OracleEvent) {
        let mut guard = self.events.lock().unwrap_or_else(|e| e.into_inner());
        guard.push(event);
    }
}

impl FrameScorer for OracleScorer {
    fn score_frame(&self, index: usize) -> ScoreOutcome {
        let Some(frame_ref) = self.frame_refs.get(&index) else {
            return Err(ScoreFailure::MissingFrame);
        };

        if self.log_events {
            log::info!("{} score start idx={} ref={}", self.label, index, frame_ref);
        }

        let started = Instant::now();
        let outcome = self
            .oracle
            .score_frame(frame_ref, &self.instructions, &self.expected_fields);
        let elapsed = round_millis(started.elapsed().as_secs_f64());

        match outcome {
            Ok(data) => {
                let model = model_of(&data);
                let result = ScoreResult::from_structured(data, &self.mapping);
                if self.log_events {
                    log::info!(
                        "{} score done idx={} elapsed_s={:.3} person={:.2} face={:.2} frame={:.2} pose={:?} summary_preview={:?}",
                        self.label, index, elapsed, result.person_score, result.face_score,
                        result.frame_score, result.pose, preview(&result.summary)
                    );
                }
                self.record(OracleEvent {
                    kind: OracleEventKind::Score,
                    frame_index: Some(index),
                    elapsed_secs: elapsed,
                    model,
                    person_score: result.person_score,
                    face_score: result.face_score,
                    frame_score: result.frame_score,
                    pose: result.pose.clone(),
                    summary_preview: preview(&result.summary),
                    failure: None,
                });
                Ok(result)
            }
            Err(e) => {
                let failure = match e.downcast_ref::<ScoreFailure>() {
                    Some(f) => f.clone(),
                    None => ScoreFailure::Provider(e.to_string()),
                };
                log::warn!("{} scoring failed for {}: {}", self.label, frame_ref, failure);
                self.record(OracleEvent {
                    kind: OracleEventKind::Score,
                    frame_index: Some(index),
                    elapsed_secs: elapsed,
                    model: None,
                    person_score: 0.0,
                    face_score: 0.0,
                    frame_score: 0.0,
                    pose: String::new(),
                    summary_preview: String::new(),
                    failure: Some(failure.to_string()),
                });
                Err(failure)
            }
        }
    }
}
