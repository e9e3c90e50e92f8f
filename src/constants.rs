// Detection Summary Constants
// Defaults for every tunable. Config files override these per episode.

// Capture cadence
pub const DEFAULT_SNAPSHOT_INTERVAL_SECS: f64 = 3.0;
pub const DEFAULT_OFF_GRACE_SECS: f64 = 15.0;
pub const DEFAULT_CAPTURE_MAX_SECS: f64 = 300.0;
pub const DEFAULT_OFF_POLL_SECS: f64 = 1.0;
pub const MIN_OFF_POLL_SECS: f64 = 0.1;
pub const MAX_TICK_DELAY_SECS: f64 = 3600.0;

// Trigger
pub const DEFAULT_TRIGGER_ON_VALUE: &str = "on";
pub const DEFAULT_COOLDOWN_SECS: f64 = 60.0;
pub const DEFAULT_COOLDOWN_BACKOFF_MAX_SECS: f64 = 1800.0;

// Selection
pub const DEFAULT_SCORING_BUDGET: usize = 10;
pub const DEFAULT_NO_PEOPLE_THRESHOLD: f64 = 1.0;
pub const DEFAULT_LOOKAHEAD_AFTER_NO_PEOPLE: usize = 2;
pub const PEAK_SEARCH_MAX_ITERATIONS: usize = 6;
pub const PEAK_SEARCH_MIN_ITERATIONS: usize = 2;
pub const SEED_EARLY_FRACTION: f64 = 0.75;
pub const SEED_MIDPOINT_JITTER_DIVISOR: usize = 6;
pub const NEIGHBOR_MIN_RADIUS: usize = 3;

// Scoring concurrency
pub const DEFAULT_SCORING_PARALLELISM: usize = 4;
pub const SUMMARY_PREVIEW_CHARS: usize = 160;

// Pose ranking (case-insensitive)
pub const POSE_RANKS: [(&str, u8); 5] = [
    ("standing", 3),
    ("stationary", 3),
    ("sitting", 2),
    ("walking", 1),
    ("moving", 1),
];

// Default oracle field names
pub const FIELD_PERSON_SCORE: &str = "person_score";
pub const FIELD_FACE_SCORE: &str = "face_score";
pub const FIELD_FRAME_SCORE: &str = "frame_score";
pub const FIELD_POSE: &str = "pose";
pub const FIELD_SUMMARY: &str = "summary";
pub const FIELD_GENERIC_SCORE: &str = "score";

// Store
pub const STORE_VERSION: u32 = 1;
pub const DEFAULT_MAX_RECORDS_PER_KEY: usize = 50;
pub const DEFAULT_RETENTION_HOURS: f64 = 24.0;
pub const STATE_PATH_ENV: &str = "DETECTION_SUMMARY_STATE_PATH";
pub const STATE_FOLDER: &str = ".detection-summary";
pub const STATE_FILENAME: &str = "store.json";

// Run artifacts
pub const CAPTURED_SUBDIR: &str = "captured";
pub const TRACE_SUBDIR: &str = "trace";
pub const TRACE_META_FILENAME: &str = "meta.json";
pub const RECORD_JSON_FILENAME: &str = "summary.json";
pub const GENERATED_FILENAME: &str = "generated.png";
pub const DEFAULT_TRACE_MAX_ENTRIES: usize = 50;

// Episode key: what may appear in a store key and a directory name
pub const EPISODE_KEY_PATTERN: &str = r"^[A-Za-z0-9_.-]{1,64}$";

// Polling cadence while the background worker is busy
pub const PROCESSING_POLL_SECS: f64 = 1.0;
