// End-to-end episode flow with in-process fakes

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chrono::{Duration as ChronoDuration, TimeZone};
use serde_json::json;
use tempfile::TempDir;

use super::*;
use crate::config::StoreConfig;
use crate::constants::{RECORD_JSON_FILENAME, TRACE_META_FILENAME, TRACE_SUBDIR};

struct Motion {
    on: AtomicBool,
}

impl MotionSource for Motion {
    fn motion_state(&self, _entity_ref: &str) -> anyhow::Result<String> {
        Ok(if self.on.load(Ordering::SeqCst) { "on" } else { "off" }.to_string())
    }
}

struct Camera {
    broken: bool,
}

impl FrameCapturer for Camera {
    fn capture_frame(&self, _camera_ref: &str, _dest_ref: &str) -> anyhow::Result<()> {
        if self.broken {
            anyhow::bail!("camera offline");
        }
        Ok(())
    }
}

fn frame_index(frame_ref: &str) -> usize {
    let name = frame_ref.rsplit('/').next().unwrap_or_default();
    name.trim_start_matches("frame_")
        .trim_end_matches(".jpg")
        .parse()
        .unwrap()
}

/// Person visible in frames 2..=6, clearest face at 4.
struct Oracle;

impl ScoringOracle for Oracle {
    fn score_frame(&self, frame_ref: &str, _instructions: &str, _expected: &[String]) -> anyhow::Result<Map<String, Value>> {
        let i = frame_index(frame_ref);
        let person = if (2..=6).contains(&i) { 9 } else { 0 };
        let face = if i == 4 { 10 } else { 0 };
        let out = json!({
            "person_score": person,
            "face_score": face,
            "frame_score": if person > 0 { 5 } else { 0 },
            "pose": if person > 0 { "standing" } else { "" },
            "summary": if person > 0 { format!("person in frame {}", i) } else { String::new() },
            "_meta": {"model": "vision-test"},
        });
        Ok(out.as_object().cloned().unwrap())
    }
}

struct Painter {
    fail: bool,
}

impl ImageGenerator for Painter {
    fn generate_image(&self, _input_ref: &str, _prompt: &str, _output_ref: &str) -> anyhow::Result<Map<String, Value>> {
        if self.fail {
            anyhow::bail!("quota exceeded");
        }
        Ok(json!({"_meta": {"model": "paint-1"}}).as_object().cloned().unwrap())
    }
}

#[derive(Default)]
struct Inbox {
    messages: Mutex<Vec<(String, String, Option<String>)>>,
}

impl NotificationSink for Inbox {
    fn notify(&self, title: &str, message: &str, image_ref: Option<&str>) -> anyhow::Result<()> {
        self.messages
            .lock()
            .unwrap()
            .push((title.to_string(), message.to_string(), image_ref.map(|s| s.to_string())));
        Ok(())
    }
}

struct Harness {
    _dir: TempDir,
    motion: Arc<Motion>,
    inbox: Arc<Inbox>,
    store: Arc<ResultStore>,
    manager: EpisodeManager,
}

fn config(dir: &TempDir) -> SummaryConfig {
    let mut cfg = SummaryConfig::new("garage");
    cfg.camera_ref = "camera.garage".to_string();
    cfg.trigger_ref = "binary_sensor.garage_motion".to_string();
    cfg.budget = 9;
    cfg.capture.snapshot_interval_secs = 1.0;
    cfg.capture.off_grace_secs = 2.0;
    cfg.capture.capture_max_secs = 60.0;
    cfg.cooldown_secs = 30.0;
    cfg.cooldown_backoff_max_secs = 100.0;
    cfg.local_run_dir = Some(dir.path().join("runs"));
    cfg
}

fn harness_with(cfg: impl FnOnce(&TempDir) -> SummaryConfig, camera_broken: bool, painter: Option<Painter>) -> Harness {
    let dir = TempDir::new().unwrap();
    let cfg = cfg(&dir);
    let motion = Arc::new(Motion {
        on: AtomicBool::new(true),
    });
    let inbox = Arc::new(Inbox::default());
    let store = Arc::new(ResultStore::open(StoreConfig::new(dir.path().join("store.json"))).unwrap());
    let pool = Arc::new(WorkerPool::new(1, "episode-test").unwrap());

    let collaborators = Collaborators {
        capturer: Arc::new(Camera { broken: camera_broken }),
        motion: motion.clone(),
        oracle: Arc::new(Oracle),
        image_generator: painter.map(|p| Arc::new(p) as Arc<dyn ImageGenerator>),
        notifier: Some(inbox.clone()),
    };
    let manager = EpisodeManager::new(cfg, collaborators, store.clone(), pool).unwrap();

    Harness {
        _dir: dir,
        motion,
        inbox,
        store,
        manager,
    }
}

fn harness() -> Harness {
    harness_with(config, false, None)
}

fn t(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 2, 18, 0, 0).unwrap() + ChronoDuration::seconds(secs)
}

/// Motion on for `on_ticks` one-second ticks, then off until capture ends
/// and the record is published. Returns all events and the last tick time.
fn run_episode(h: &mut Harness, start: i64, on_ticks: i64) -> (Vec<EpisodeEvent>, i64) {
    let mut events = Vec::new();
    events.extend(h.manager.on_trigger(t(start)).unwrap());

    h.motion.on.store(true, Ordering::SeqCst);
    let mut now = start;
    for _ in 0..on_ticks {
        events.extend(h.manager.tick(t(now)).unwrap().events);
        now += 1;
    }

    h.motion.on.store(false, Ordering::SeqCst);
    for _ in 0..500 {
        let out = h.manager.tick(t(now)).unwrap();
        let done = out.next_delay.is_none();
        events.extend(out.events);
        if done {
            return (events, now);
        }
        if h.manager.phase() == EpisodePhase::Processing {
            std::thread::sleep(Duration::from_millis(10));
        } else {
            now += 1;
        }
    }
    panic!("episode never finished");
}

fn published(events: &[EpisodeEvent]) -> (String, String) {
    events
        .iter()
        .find_map(|e| match e {
            EpisodeEvent::Published { session_id, summary, .. } => Some((session_id.clone(), summary.clone())),
            _ => None,
        })
        .expect("no publish event")
}

#[test]
fn test_episode_publishes_best_frame() {
    let mut h = harness();
    let (events, _) = run_episode(&mut h, 0, 12);

    assert!(matches!(events[0], EpisodeEvent::SessionStarted { .. }));
    assert!(events
        .iter()
        .any(|e| matches!(e, EpisodeEvent::CaptureDone { captured: 12, timed_out: false, .. })));

    let (session_id, summary) = published(&events);
    assert_eq!(summary, "person in frame 4");

    let record = h.store.get_by_id("garage", &session_id, false).unwrap();
    assert_eq!(record.best_index, 4);
    assert!(record.selection_trace.meta.scored_indices.len() <= 9);
    assert!(record.oracle_events.iter().all(|e| e.model.as_deref() == Some("vision-test")));
    assert_eq!(record.oracle_events[0].frame_index, Some(4));
    assert_eq!(record.camera_ref, "camera.garage");

    let messages = h.inbox.messages.lock().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].0, "Detection summary: garage");
    assert_eq!(messages[0].1, "person in frame 4");
    assert!(messages[0].2.as_deref().unwrap().ends_with("frame_004.jpg"));
    assert_eq!(h.manager.phase(), EpisodePhase::Idle);
}

#[test]
fn test_triggers_ignored_in_flight_and_during_cooldown() {
    let mut h = harness();
    assert!(h.manager.on_trigger(t(0)).unwrap().is_some());
    assert!(h.manager.on_trigger(t(1)).unwrap().is_none());
    assert_eq!(h.manager.phase(), EpisodePhase::Capturing);

    // finish the first session
    h.manager.tick(t(0)).unwrap();
    h.motion.on.store(false, Ordering::SeqCst);
    let mut now = 1;
    while h.manager.phase() != EpisodePhase::Idle {
        h.manager.tick(t(now)).unwrap();
        if h.manager.phase() == EpisodePhase::Processing {
            std::thread::sleep(Duration::from_millis(10));
        } else {
            now += 1;
        }
    }

    // cooldown is measured from the previous start
    assert!(h.manager.on_trigger(t(20)).unwrap().is_none());
    assert!(h.manager.on_state_change("off", t(40)).unwrap().is_none());
    assert!(h.manager.on_state_change("on", t(40)).unwrap().is_some());
}

#[test]
fn test_timeout_doubles_cooldown_until_cap() {
    let mut h = harness_with(
        |dir| {
            let mut cfg = config(dir);
            cfg.capture.capture_max_secs = 5.0;
            cfg
        },
        false,
        None,
    );

    // motion never stops; the hard cap ends each session
    let (events, _) = run_episode(&mut h, 0, 10);
    assert!(events
        .iter()
        .any(|e| matches!(e, EpisodeEvent::CaptureDone { timed_out: true, .. })));
    assert_eq!(h.manager.effective_cooldown_secs(), 60.0);

    run_episode(&mut h, 100, 10);
    assert_eq!(h.manager.effective_cooldown_secs(), 100.0);

    // a normal session resets to the base
    let mut h2 = harness();
    run_episode(&mut h2, 0, 3);
    assert_eq!(h2.manager.effective_cooldown_secs(), 30.0);
}

#[test]
fn test_broken_camera_publishes_placeholder() {
    let mut h = harness_with(config, true, None);
    let (events, _) = run_episode(&mut h, 0, 4);

    let (session_id, summary) = published(&events);
    assert_eq!(summary, "");
    let record = h.store.get_by_id("garage", &session_id, false).unwrap();
    assert!(record.best.placeholder);
    assert!(record.oracle_events.is_empty());
    assert_eq!(record.timing.captured_frames, 4);
    assert_eq!(record.timing.scored_frames, 0);

    let messages = h.inbox.messages.lock().unwrap();
    assert_eq!(messages[0].1, "No person detected");
    assert_eq!(messages[0].2, None);
}

#[test]
fn test_image_generation_attached_to_record() {
    let mut h = harness_with(
        |dir| {
            let mut cfg = config(dir);
            cfg.image_generation_enabled = true;
            cfg.image_prompt = "watercolor".to_string();
            cfg
        },
        false,
        Some(Painter { fail: false }),
    );
    let (events, _) = run_episode(&mut h, 0, 8);
    let (session_id, _) = published(&events);

    let record = h.store.get_by_id("garage", &session_id, false).unwrap();
    let generated = record.generated_image.unwrap();
    assert!(generated.image_ref.ends_with("/generated.png"));
    assert!(generated.source_ref.ends_with("frame_004.jpg"));
    assert_eq!(generated.model.as_deref(), Some("paint-1"));
    assert_eq!(
        record.oracle_events.last().unwrap().kind,
        crate::scoring::OracleEventKind::ImageGeneration
    );

    let messages = h.inbox.messages.lock().unwrap();
    assert_eq!(messages[0].2.as_deref(), Some(generated.image_ref.as_str()));
}

#[test]
fn test_image_generation_failure_is_not_fatal() {
    let mut h = harness_with(
        |dir| {
            let mut cfg = config(dir);
            cfg.image_generation_enabled = true;
            cfg.image_prompt = "watercolor".to_string();
            cfg
        },
        false,
        Some(Painter { fail: true }),
    );
    let (events, _) = run_episode(&mut h, 0, 8);
    let (session_id, _) = published(&events);

    let record = h.store.get_by_id("garage", &session_id, false).unwrap();
    assert!(record.generated_image.is_none());
    assert_eq!(
        record.oracle_events.last().unwrap().failure.as_deref(),
        Some("Image generation error: quota exceeded")
    );
    assert_eq!(record.best_index, 4);
}

#[test]
fn test_run_artifacts_written_when_enabled() {
    let mut h = harness_with(
        |dir| {
            let mut cfg = config(dir);
            cfg.write_record_json = true;
            cfg.trace.enabled = true;
            cfg
        },
        false,
        None,
    );
    let (events, _) = run_episode(&mut h, 0, 8);
    let (session_id, _) = published(&events);

    let run_dir = h._dir.path().join("runs").join(&session_id);
    assert!(run_dir.join(RECORD_JSON_FILENAME).exists());
    assert!(run_dir.join(TRACE_SUBDIR).join(TRACE_META_FILENAME).exists());
}

#[test]
fn test_invalid_config_rejected() {
    let dir = TempDir::new().unwrap();
    let mut cfg = config(&dir);
    cfg.episode_key = "bad key!".to_string();

    let collaborators = Collaborators {
        capturer: Arc::new(Camera { broken: false }),
        motion: Arc::new(Motion {
            on: AtomicBool::new(false),
        }),
        oracle: Arc::new(Oracle),
        image_generator: None,
        notifier: None,
    };
    let store = Arc::new(ResultStore::open(StoreConfig::new(dir.path().join("store.json"))).unwrap());
    let pool = Arc::new(WorkerPool::new(1, "episode-test").unwrap());

    assert!(EpisodeManager::new(cfg, collaborators, store, pool).is_err());
}
