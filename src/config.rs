// Detection Summary - Configuration
// One SummaryConfig per episode key. Loaded from JSON, validated once at
// construction; contract violations are returned, never defaulted.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::error::{Result, SummaryError};

static EPISODE_KEY_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(EPISODE_KEY_PATTERN).ok());

/// Check an episode key against the allowed alphabet.
pub fn validate_episode_key(key: &str) -> Result<()> {
    match EPISODE_KEY_RE.as_ref() {
        Some(re) if re.is_match(key) => Ok(()),
        _ => Err(SummaryError::InvalidEpisodeKey(key.to_string())),
    }
}

/// Capture cadence and stop conditions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub snapshot_interval_secs: f64,
    pub off_grace_secs: f64,
    /// 0 disables the hard cap
    pub capture_max_secs: f64,
    pub off_poll_secs: f64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            snapshot_interval_secs: DEFAULT_SNAPSHOT_INTERVAL_SECS,
            off_grace_secs: DEFAULT_OFF_GRACE_SECS,
            capture_max_secs: DEFAULT_CAPTURE_MAX_SECS,
            off_poll_secs: DEFAULT_OFF_POLL_SECS,
        }
    }
}

/// Key names the scoring oracle uses for the five consumed fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldMapping {
    pub person_score: String,
    pub face_score: String,
    pub frame_score: String,
    pub pose: String,
    pub summary: String,
}

impl Default for FieldMapping {
    fn default() -> Self {
        Self {
            person_score: FIELD_PERSON_SCORE.to_string(),
            face_score: FIELD_FACE_SCORE.to_string(),
            frame_score: FIELD_FRAME_SCORE.to_string(),
            pose: FIELD_POSE.to_string(),
            summary: FIELD_SUMMARY.to_string(),
        }
    }
}

/// Selection trace artifacts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    pub enabled: bool,
    pub max_entries: usize,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_entries: DEFAULT_TRACE_MAX_ENTRIES,
        }
    }
}

/// Store location and retention cap
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub state_path: PathBuf,
    pub max_records_per_key: usize,
}

impl StoreConfig {
    pub fn new(state_path: impl Into<PathBuf>) -> Self {
        Self {
            state_path: state_path.into(),
            max_records_per_key: DEFAULT_MAX_RECORDS_PER_KEY,
        }
    }

    /// Location from DETECTION_SUMMARY_STATE_PATH or the home-dir default.
    pub fn from_env() -> Self {
        Self::new(crate::paths::resolve_state_path(None))
    }

    pub fn with_max_records(mut self, max: usize) -> Self {
        self.max_records_per_key = max;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SummaryConfig {
    pub episode_key: String,
    pub camera_ref: String,
    pub trigger_ref: String,
    pub trigger_on_value: String,
    pub capture: CaptureConfig,

    // selection / scoring
    pub budget: usize,
    pub no_people_threshold: f64,
    pub lookahead_after_no_people: usize,
    pub scoring_parallelism: usize,
    pub scoring_instructions: String,
    pub expected_fields: Vec<String>,
    pub field_mapping: FieldMapping,

    // cooldown
    pub cooldown_secs: f64,
    pub cooldown_backoff_max_secs: f64,

    // publish
    pub retention_hours: f64,
    pub image_generation_enabled: bool,
    pub image_prompt: String,
    /// Base directory reference for per-run frames and artifacts
    pub runs_ref: String,
    /// Local directory mirroring `runs_ref` for trace/summary artifacts
    pub local_run_dir: Option<PathBuf>,
    pub write_record_json: bool,
    pub trace: TraceConfig,

    // logging
    pub log_capture_events: bool,
    pub log_scoring_events: bool,
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            episode_key: String::new(),
            camera_ref: String::new(),
            trigger_ref: String::new(),
            trigger_on_value: DEFAULT_TRIGGER_ON_VALUE.to_string(),
            capture: CaptureConfig::default(),
            budget: DEFAULT_SCORING_BUDGET,
            no_people_threshold: DEFAULT_NO_PEOPLE_THRESHOLD,
            lookahead_after_no_people: DEFAULT_LOOKAHEAD_AFTER_NO_PEOPLE,
            scoring_parallelism: DEFAULT_SCORING_PARALLELISM,
            scoring_instructions: String::new(),
            expected_fields: Vec::new(),
            field_mapping: FieldMapping::default(),
            cooldown_secs: DEFAULT_COOLDOWN_SECS,
            cooldown_backoff_max_secs: DEFAULT_COOLDOWN_BACKOFF_MAX_SECS,
            retention_hours: DEFAULT_RETENTION_HOURS,
            image_generation_enabled: false,
            image_prompt: String::new(),
            runs_ref: "runs".to_string(),
            local_run_dir: None,
            write_record_json: false,
            trace: TraceConfig::default(),
            log_capture_events: true,
            log_scoring_events: true,
        }
    }
}

impl SummaryConfig {
    pub fn new(episode_key: impl Into<String>) -> Self {
        Self {
            episode_key: episode_key.into(),
            ..Self::default()
        }
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let cfg: SummaryConfig = serde_json::from_str(&raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject contract violations up front.
    pub fn validate(&self) -> Result<()> {
        validate_episode_key(&self.episode_key)?;

        if self.budget < 1 {
            return Err(SummaryError::Config("budget must be at least 1".to_string()));
        }
        if self.scoring_parallelism < 1 {
            return Err(SummaryError::Config(
                "scoring_parallelism must be at least 1".to_string(),
            ));
        }

        let cap = &self.capture;
        let durations = [
            ("snapshot_interval_secs", cap.snapshot_interval_secs),
            ("off_grace_secs", cap.off_grace_secs),
            ("capture_max_secs", cap.capture_max_secs),
            ("off_poll_secs", cap.off_poll_secs),
            ("cooldown_secs", self.cooldown_secs),
            ("cooldown_backoff_max_secs", self.cooldown_backoff_max_secs),
            ("retention_hours", self.retention_hours),
        ];
        for (name, value) in durations {
            if !value.is_finite() || value < 0.0 {
                return Err(SummaryError::Config(format!(
                    "{} must be a non-negative number (got {})",
                    name, value
                )));
            }
        }

        for (name, value) in [
            ("snapshot_interval_secs", cap.snapshot_interval_secs),
            ("off_poll_secs", cap.off_poll_secs),
        ] {
            if value > MAX_TICK_DELAY_SECS {
                return Err(SummaryError::Config(format!(
                    "{} must be at most {} (got {})",
                    name, MAX_TICK_DELAY_SECS, value
                )));
            }
        }

        if self.image_generation_enabled && self.image_prompt.trim().is_empty() {
            return Err(SummaryError::Config(
                "image_prompt is required when image generation is enabled".to_string(),
            ));
        }

        Ok(())
    }
}
