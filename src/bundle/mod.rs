// Detection Summary - Result Records
//
// build_record is pure: session + selection + oracle events in, record out.
// Artifact writers below are called separately by the episode worker.


use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::capture::{secs_between, CaptureSession};
use crate::config::TraceConfig;
use crate::constants::{CAPTURED_SUBDIR, RECORD_JSON_FILENAME, TRACE_META_FILENAME, TRACE_SUBDIR};
use crate::error::Result;
use crate::paths::frame_filename;
use crate::scoring::ranking::rank_best_to_worst;
use crate::scoring::{OracleEvent, OracleEventKind, ScoreResult};
use crate::selection::{Selection, SelectionMeta};

/// The chosen frame, flattened for consumers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BestView {
    pub summary: String,
    /// Ranking score used by window lookups (the person score)
    pub score: f64,
    pub person_score: f64,
    pub face_score: f64,
    pub frame_score: f64,
    pub pose: String,
    pub image_ref: String,
    #[serde(default)]
    pub structured: Map<String, Value>,
    #[serde(default)]
    pub placeholder: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateView {
    pub index: usize,
    pub image_ref: String,
    pub person_score: f64,
    pub face_score: f64,
    pub frame_score: f64,
    pub pose: String,
    pub summary: String,
    #[serde(default)]
    pub structured: Map<String, Value>,
}

/// Metadata returned by the image-generation oracle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeneratedImage {
    pub image_ref: String,
    pub source_ref: String,
    pub model: Option<String>,
    pub elapsed_secs: f64,
    #[serde(default)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureTiming {
    pub capture_started_at: DateTime<Utc>,
    pub capture_ended_at: DateTime<Utc>,
    pub capture_duration_secs: f64,
    pub motion_detected_secs: f64,
    /// Capture time past the last motion (the off-grace tail)
    pub buffer_overhang_secs: f64,
    pub timed_out: bool,
    pub captured_frames: usize,
    pub scored_frames: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionTrace {
    #[serde(flatten)]
    pub meta: SelectionMeta,
    pub ranked_indices_best_to_worst: Vec<usize>,
}

/// Published outcome of one session. Only `consumed`/`consumed_at` change
/// after publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub session_id: String,
    pub episode_key: String,
    pub created_at: DateTime<Utc>,
    pub best_index: usize,
    pub best: BestView,
    pub candidates: Vec<CandidateView>,
    pub generated_image: Option<GeneratedImage>,
    pub selection_trace: SelectionTrace,
    pub timing: CaptureTiming,
    #[serde(default)]
    pub oracle_events: Vec<OracleEvent>,
    #[serde(default)]
    pub camera_ref: String,
    #[serde(default)]
    pub trigger_ref: String,
    #[serde(default)]
    pub consumed: bool,
    #[serde(default)]
    pub consumed_at: Option<DateTime<Utc>>,
    /// Set when background processing failed and the record is a stub
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResultRecord {
    /// Value compared by window lookups.
    pub fn score(&self) -> f64 {
        self.best.score
    }
}

/// Everything needed to assemble a record.
pub struct RecordInputs<'a> {
    pub episode_key: &'a str,
    pub camera_ref: &'a str,
    pub trigger_ref: &'a str,
    pub session: &'a CaptureSession,
    pub selection: &'a Selection,
    pub generated_image: Option<GeneratedImage>,
    pub oracle_events: Vec<OracleEvent>,
    pub created_at: DateTime<Utc>,
}

fn round_millis(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

pub fn capture_timing(session: &CaptureSession, scored_frames: usize, fallback_end: DateTime<Utc>) -> CaptureTiming {
    let ended = session.ended_at.unwrap_or(fallback_end);
    let duration = secs_between(session.started_at, ended);
    let motion = session.motion_on_accumulated_secs.max(0.0);

    CaptureTiming {
        capture_started_at: session.started_at,
        capture_ended_at: ended,
        capture_duration_secs: round_millis(duration),
        motion_detected_secs: round_millis(motion),
        buffer_overhang_secs: round_millis((duration - motion).max(0.0)),
        timed_out: session.timed_out,
        captured_frames: session.attempted_frames,
        scored_frames,
    }
}

fn image_ref_for(session: &CaptureSession, index: usize) -> String {
    session
        .frames
        .iter()
        .find(|f| f.index == index)
        .map(|f| f.image_ref.clone())
        .unwrap_or_default()
}

fn candidate(session: &CaptureSession, index: usize, res: Option<&ScoreResult>) -> CandidateView {
    let empty = ScoreResult::placeholder();
    let res = res.unwrap_or(&empty);
    CandidateView {
        index,
        image_ref: image_ref_for(session, index),
        person_score: res.person_score,
        face_score: res.face_score,
        frame_score: res.frame_score,
        pose: res.pose.clone(),
        summary: res.summary.clone(),
        structured: res.structured.clone(),
    }
}

/// Score events best-to-worst by frame rank, then unranked score events in
/// call order, then image-generation events.
pub fn order_events(events: Vec<OracleEvent>, ranked: &[usize]) -> Vec<OracleEvent> {
    let (score_events, image_events): (Vec<OracleEvent>, Vec<OracleEvent>) = events
        .into_iter()
        .partition(|e| e.kind == OracleEventKind::Score);

    let mut taken = vec![false; score_events.len()];
    let mut out = Vec::with_capacity(score_events.len() + image_events.len());

    for idx in ranked {
        // last event for an index wins, matching a per-index lookup
        if let Some(pos) = score_events
            .iter()
            .rposition(|e| e.frame_index == Some(*idx))
        {
            if !taken[pos] {
                taken[pos] = true;
                out.push(score_events[pos].clone());
            }
        }
    }
    for (pos, ev) in score_events.into_iter().enumerate() {
        if !taken[pos] {
            out.push(ev);
        }
    }
    out.extend(image_events);
    out
}

/// Assemble the record for one session. No I/O.
pub fn build_record(inputs: RecordInputs<'_>) -> ResultRecord {
    let RecordInputs {
        episode_key,
        camera_ref,
        trigger_ref,
        session,
        selection,
        generated_image,
        oracle_events,
        created_at,
    } = inputs;

    let meta = &selection.meta;
    let best_index = meta.best_index;
    let best_res = selection.scored.get(&best_index);
    let ranked = rank_best_to_worst(&selection.scored);

    let best = match best_res {
        Some(r) => BestView {
            summary: r.summary.trim().to_string(),
            score: r.person_score,
            person_score: r.person_score,
            face_score: r.face_score,
            frame_score: r.frame_score,
            pose: r.pose.clone(),
            image_ref: image_ref_for(session, best_index),
            structured: r.structured.clone(),
            placeholder: meta.placeholder,
        },
        None => BestView {
            placeholder: true,
            ..BestView::default()
        },
    };

    let candidates = meta
        .scored_indices
        .iter()
        .map(|&i| candidate(session, i, selection.scored.get(&i)))
        .collect();

    let scored_frames = if meta.placeholder { 0 } else { selection.scored.len() };

    ResultRecord {
        session_id: session.id.clone(),
        episode_key: episode_key.to_string(),
        created_at,
        best_index,
        best,
        candidates,
        generated_image,
        selection_trace: SelectionTrace {
            meta: meta.clone(),
            ranked_indices_best_to_worst: ranked.clone(),
        },
        timing: capture_timing(session, scored_frames, created_at),
        oracle_events: order_events(oracle_events, &ranked),
        camera_ref: camera_ref.to_string(),
        trigger_ref: trigger_ref.to_string(),
        consumed: false,
        consumed_at: None,
        error: None,
    }
}

/// Stub published when background processing fails outright, so waiters
/// still see the session.
pub fn failed_record(
    episode_key: &str,
    session: &CaptureSession,
    error: &str,
    created_at: DateTime<Utc>,
) -> ResultRecord {
    let meta = SelectionMeta {
        budget: 0,
        scored_indices: vec![0],
        probe_order: Vec::new(),
        cutoff_index_inclusive: 0,
        best_index: 0,
        placeholder: true,
    };
    ResultRecord {
        session_id: session.id.clone(),
        episode_key: episode_key.to_string(),
        created_at,
        best_index: 0,
        best: BestView {
            placeholder: true,
            ..BestView::default()
        },
        candidates: Vec::new(),
        generated_image: None,
        selection_trace: SelectionTrace {
            meta,
            ranked_indices_best_to_worst: Vec::new(),
        },
        timing: capture_timing(session, 0, created_at),
        oracle_events: Vec::new(),
        camera_ref: String::new(),
        trigger_ref: String::new(),
        consumed: false,
        consumed_at: None,
        error: Some(error.to_string()),
    }
}

#[derive(Serialize)]
struct TraceEntry<'a> {
    person_score: f64,
    face_score: f64,
    frame_score: f64,
    pose: &'a str,
    summary: &'a str,
}

#[derive(Serialize)]
struct TraceMeta<'a> {
    #[serde(flatten)]
    meta: &'a SelectionMeta,
    scored: std::collections::BTreeMap<String, TraceEntry<'a>>,
}

/// Write trace/meta.json and copy the scored frames found under
/// `<run_dir>/captured` into trace/selected and trace/best.
pub fn write_trace(run_dir: &Path, selection: &Selection, cfg: &TraceConfig) -> Result<()> {
    if !cfg.enabled {
        return Ok(());
    }

    let trace_dir = run_dir.join(TRACE_SUBDIR);
    let selected_dir = trace_dir.join("selected");
    let best_dir = trace_dir.join("best");
    fs::create_dir_all(&selected_dir)?;
    fs::create_dir_all(&best_dir)?;

    let frames_dir = run_dir.join(CAPTURED_SUBDIR);
    let kept: Vec<(&usize, &ScoreResult)> = selection.scored.iter().take(cfg.max_entries).collect();

    for (idx, _) in &kept {
        let name = frame_filename(**idx);
        let src = frames_dir.join(&name);
        if src.exists() {
            fs::copy(&src, selected_dir.join(&name))?;
        }
    }
    let best_name = frame_filename(selection.meta.best_index);
    let best_src = frames_dir.join(&best_name);
    if best_src.exists() {
        fs::copy(&best_src, best_dir.join(&best_name))?;
    }

    let out = TraceMeta {
        meta: &selection.meta,
        scored: kept
            .iter()
            .map(|(i, r)| {
                (
                    i.to_string(),
                    TraceEntry {
                        person_score: r.person_score,
                        face_score: r.face_score,
                        frame_score: r.frame_score,
                        pose: &r.pose,
                        summary: &r.summary,
                    },
                )
            })
            .collect(),
    };
    fs::write(trace_dir.join(TRACE_META_FILENAME), serde_json::to_string_pretty(&out)?)?;
    Ok(())
}

/// Write the record as summary.json under the run directory.
pub fn write_record_json(run_dir: &Path, record: &ResultRecord) -> Result<()> {
    fs::create_dir_all(run_dir)?;
    fs::write(run_dir.join(RECORD_JSON_FILENAME), serde_json::to_string_pretty(record)?)?;
    Ok(())
}
