// Detection Summary - Episode Manager
//
// Owns one episode key: gates triggers (in-flight + cooldown with backoff),
// drives the capture machine tick by tick, hands the ended session to the
// worker pool and publishes the finished record on a later tick. Nothing
// here blocks; the embedding scheduler calls `tick` after `next_delay`.

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::bundle::{self, GeneratedImage, RecordInputs, ResultRecord};
use crate::capture::{secs_between, CaptureMachine, CaptureSession, FrameCapturer, MotionSource, TickResult};
use crate::config::SummaryConfig;
use crate::constants::{GENERATED_FILENAME, PROCESSING_POLL_SECS};
use crate::error::{Result, SummaryError};
use crate::jobs::{JobHandle, WorkerPool};
use crate::paths;
use crate::scoring::pool::PooledScorer;
use crate::scoring::{OracleEvent, OracleScorer, ScoringOracle};
use crate::selection::{adaptive_select_and_score, SelectionParams};
use crate::store::ResultStore;

/// Renders a stylized image from the chosen frame. Returns provider
/// metadata; `_meta.model` is picked up when present.
pub trait ImageGenerator: Send + Sync {
    fn generate_image(&self, input_ref: &str, prompt: &str, output_ref: &str) -> anyhow::Result<Map<String, Value>>;
}

/// Receives a short message after each publish.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, title: &str, message: &str, image_ref: Option<&str>) -> anyhow::Result<()>;
}

/// External services one episode talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub capturer: Arc<dyn FrameCapturer>,
    pub motion: Arc<dyn MotionSource>,
    pub oracle: Arc<dyn ScoringOracle>,
    pub image_generator: Option<Arc<dyn ImageGenerator>>,
    pub notifier: Option<Arc<dyn NotificationSink>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EpisodeEvent {
    SessionStarted {
        session_id: String,
        started_at: DateTime<Utc>,
    },
    CaptureDone {
        session_id: String,
        captured: usize,
        ended_at: DateTime<Utc>,
        timed_out: bool,
    },
    Published {
        session_id: String,
        created_at: DateTime<Utc>,
        summary: String,
        generated_image_ref: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpisodePhase {
    Idle,
    Capturing,
    Processing,
}

#[derive(Debug, Default)]
pub struct TickOutcome {
    /// When to tick again; `None` once the episode is idle.
    pub next_delay: Option<Duration>,
    pub events: Vec<EpisodeEvent>,
}

enum ActiveRun {
    Capturing {
        session_id: String,
        run_ref: String,
    },
    Processing {
        session: CaptureSession,
        handle: JobHandle<ResultRecord>,
    },
}

pub struct EpisodeManager {
    config: SummaryConfig,
    collaborators: Collaborators,
    store: Arc<ResultStore>,
    pool: Arc<WorkerPool>,
    machine: CaptureMachine,
    active: Option<ActiveRun>,
    last_run_started: Option<DateTime<Utc>>,
    effective_cooldown_secs: f64,
    label: String,
}

impl EpisodeManager {
    pub fn new(
        config: SummaryConfig,
        collaborators: Collaborators,
        store: Arc<ResultStore>,
        pool: Arc<WorkerPool>,
    ) -> Result<Self> {
        config.validate()?;

        let label = format!("[{}]", config.episode_key);
        let machine = CaptureMachine::new(config.capture.clone()).with_logging(label.clone(), config.log_capture_events);
        let effective_cooldown_secs = config.cooldown_secs;

        log::info!(
            "{} episode ready: trigger={} camera={} budget={} parallelism={} grace={:.0}s cap={:.0}s",
            label,
            config.trigger_ref,
            config.camera_ref,
            config.budget,
            config.scoring_parallelism,
            config.capture.off_grace_secs,
            config.capture.capture_max_secs
        );

        Ok(Self {
            config,
            collaborators,
            store,
            pool,
            machine,
            active: None,
            last_run_started: None,
            effective_cooldown_secs,
            label,
        })
    }

    pub fn episode_key(&self) -> &str {
        &self.config.episode_key
    }

    pub fn phase(&self) -> EpisodePhase {
        match self.active {
            None => EpisodePhase::Idle,
            Some(ActiveRun::Capturing { .. }) => EpisodePhase::Capturing,
            Some(ActiveRun::Processing { .. }) => EpisodePhase::Processing,
        }
    }

    pub fn effective_cooldown_secs(&self) -> f64 {
        self.effective_cooldown_secs
    }

    /// Feed a raw trigger state change; only the configured on-value starts
    /// a session.
    pub fn on_state_change(&mut self, new_value: &str, now: DateTime<Utc>) -> Result<Option<EpisodeEvent>> {
        if new_value != self.config.trigger_on_value {
            return Ok(None);
        }
        self.on_trigger(now)
    }

    /// Start a session unless one is in flight or the cooldown is running.
    /// Ignored triggers are dropped, not queued.
    pub fn on_trigger(&mut self, now: DateTime<Utc>) -> Result<Option<EpisodeEvent>> {
        if self.active.is_some() {
            log::debug!("{} trigger ignored: session in flight", self.label);
            return Ok(None);
        }
        if self.effective_cooldown_secs > 0.0 {
            if let Some(last) = self.last_run_started {
                let since = secs_between(last, now);
                if since < self.effective_cooldown_secs {
                    log::debug!(
                        "{} trigger ignored: cooldown {:.0}s ({:.0}s elapsed)",
                        self.label,
                        self.effective_cooldown_secs,
                        since
                    );
                    return Ok(None);
                }
            }
        }

        let session_id = Uuid::new_v4().to_string();
        self.machine.start(&session_id, now)?;
        let run_ref = paths::run_ref(&self.config.runs_ref, &session_id);
        self.active = Some(ActiveRun::Capturing {
            session_id: session_id.clone(),
            run_ref,
        });

        log::info!(
            "{} session={} capturing while motion is on; stop after off for {:.0}s (cap {:.0}s)",
            self.label,
            session_id,
            self.config.capture.off_grace_secs,
            self.config.capture.capture_max_secs
        );

        Ok(Some(EpisodeEvent::SessionStarted {
            session_id,
            started_at: now,
        }))
    }

    /// One scheduler step. The first tick should follow `on_trigger`
    /// immediately.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Result<TickOutcome> {
        match self.active.take() {
            None => Ok(TickOutcome::default()),
            Some(ActiveRun::Capturing { session_id, run_ref }) => self.tick_capture(now, session_id, run_ref),
            Some(ActiveRun::Processing { session, handle }) => self.tick_processing(now, session, handle),
        }
    }

    fn tick_capture(&mut self, now: DateTime<Utc>, session_id: String, run_ref: String) -> Result<TickOutcome> {
        let motion_on = match self.collaborators.motion.motion_state(&self.config.trigger_ref) {
            Ok(state) => state == self.config.trigger_on_value,
            Err(e) => {
                log::warn!("{} motion state unavailable, treating as off: {}", self.label, e);
                false
            }
        };

        let step = self.machine.tick(
            now,
            motion_on,
            self.collaborators.capturer.as_ref(),
            &self.config.camera_ref,
            &run_ref,
        );
        let step = match step {
            Ok(step) => step,
            Err(e) => {
                self.active = Some(ActiveRun::Capturing { session_id, run_ref });
                return Err(e);
            }
        };

        match step {
            TickResult::Continue { delay } => {
                self.active = Some(ActiveRun::Capturing { session_id, run_ref });
                Ok(TickOutcome {
                    next_delay: Some(delay),
                    events: Vec::new(),
                })
            }
            TickResult::Ended(session) => {
                let ended_at = session.ended_at.unwrap_or(now);
                let done = EpisodeEvent::CaptureDone {
                    session_id: session.id.clone(),
                    captured: session.frames.len(),
                    ended_at,
                    timed_out: session.timed_out,
                };
                log::info!(
                    "{} session={} capture complete (captured={} timed_out={}); starting background processing",
                    self.label,
                    session.id,
                    session.frames.len(),
                    session.timed_out
                );

                let job = ProcessJob {
                    config: self.config.clone(),
                    oracle: Arc::clone(&self.collaborators.oracle),
                    image_generator: self.collaborators.image_generator.clone(),
                    run_ref,
                    label: self.label.clone(),
                    session: session.clone(),
                };
                let job_label = format!("summary-{}", short_id(&session.id));
                match self.pool.submit(&job_label, move || job.run()) {
                    Ok(handle) => {
                        self.active = Some(ActiveRun::Processing { session, handle });
                        Ok(TickOutcome {
                            next_delay: Some(Duration::from_secs_f64(PROCESSING_POLL_SECS)),
                            events: vec![done],
                        })
                    }
                    Err(e) => {
                        log::error!("{} session={} could not start processing: {}", self.label, session.id, e);
                        let record = bundle::failed_record(&self.config.episode_key, &session, &e.to_string(), Utc::now());
                        let mut events = vec![done];
                        events.push(self.finalize(&session, record));
                        Ok(TickOutcome {
                            next_delay: None,
                            events,
                        })
                    }
                }
            }
        }
    }

    fn tick_processing(
        &mut self,
        _now: DateTime<Utc>,
        session: CaptureSession,
        mut handle: JobHandle<ResultRecord>,
    ) -> Result<TickOutcome> {
        let record = match handle.try_take() {
            None => {
                self.active = Some(ActiveRun::Processing { session, handle });
                return Ok(TickOutcome {
                    next_delay: Some(Duration::from_secs_f64(PROCESSING_POLL_SECS)),
                    events: Vec::new(),
                });
            }
            Some(Ok(record)) => record,
            Some(Err(e)) => {
                log::error!("{} session={} processing failed: {}", self.label, session.id, e);
                bundle::failed_record(&self.config.episode_key, &session, &e.to_string(), Utc::now())
            }
        };

        let published = self.finalize(&session, record);
        Ok(TickOutcome {
            next_delay: None,
            events: vec![published],
        })
    }

    /// Publish, prune, notify, update cooldown. Always leaves the episode idle.
    fn finalize(&mut self, session: &CaptureSession, record: ResultRecord) -> EpisodeEvent {
        if let Err(e) = self.store.publish(&self.config.episode_key, &record) {
            log::error!("{} session={} failed to persist record: {}", self.label, session.id, e);
        }
        if let Err(e) = self.store.cleanup(self.config.retention_hours) {
            log::warn!("{} store cleanup failed: {}", self.label, e);
        }

        let generated_image_ref = record.generated_image.as_ref().map(|g| g.image_ref.clone());
        self.notify(&record, generated_image_ref.as_deref());

        if session.timed_out {
            self.effective_cooldown_secs = (self.effective_cooldown_secs * 2.0)
                .max(self.config.cooldown_secs)
                .min(self.config.cooldown_backoff_max_secs);
        } else {
            self.effective_cooldown_secs = self.config.cooldown_secs;
        }
        self.last_run_started = Some(session.started_at);
        self.active = None;

        log::info!(
            "{} published session={} best_index={} person={:.2} face={:.2} frame={:.2} cooldown={:.0}s",
            self.label,
            record.session_id,
            record.best_index,
            record.best.person_score,
            record.best.face_score,
            record.best.frame_score,
            self.effective_cooldown_secs
        );

        EpisodeEvent::Published {
            session_id: record.session_id.clone(),
            created_at: record.created_at,
            summary: record.best.summary.clone(),
            generated_image_ref,
        }
    }

    fn notify(&self, record: &ResultRecord, generated_image_ref: Option<&str>) {
        let Some(sink) = self.collaborators.notifier.as_ref() else {
            return;
        };

        let title = format!("Detection summary: {}", self.config.episode_key);
        let message = if record.best.summary.is_empty() {
            "No person detected".to_string()
        } else {
            record.best.summary.clone()
        };
        let image = generated_image_ref.or_else(|| {
            let r = record.best.image_ref.as_str();
            (!r.is_empty()).then_some(r)
        });

        if let Err(e) = sink.notify(&title, &message, image) {
            log::warn!("{} notification failed: {}", self.label, e);
        }
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

/// Everything the background worker needs, moved in by value.
struct ProcessJob {
    config: SummaryConfig,
    oracle: Arc<dyn ScoringOracle>,
    image_generator: Option<Arc<dyn ImageGenerator>>,
    run_ref: String,
    label: String,
    session: CaptureSession,
}

impl ProcessJob {
    fn run(self) -> Result<ResultRecord> {
        let cfg = &self.config;
        let session = &self.session;
        let log_label = format!("{} session={}", self.label, session.id);

        let frame_refs: HashMap<usize, String> = session.frame_refs();
        let scorer = OracleScorer::new(Arc::clone(&self.oracle), frame_refs.clone(), cfg.field_mapping.clone())
            .with_instructions(&cfg.scoring_instructions, &cfg.expected_fields)
            .with_logging(log_label.clone(), cfg.log_scoring_events);
        let pooled = PooledScorer::new(scorer, cfg.scoring_parallelism);

        let params = SelectionParams::new(session.attempted_frames, cfg.budget, session.id.clone())?
            .with_no_people_threshold(cfg.no_people_threshold)
            .with_lookahead(cfg.lookahead_after_no_people);

        let started = Instant::now();
        let selection = adaptive_select_and_score(&params, &pooled);
        let mut events = pooled.inner().take_events();
        log::info!(
            "{} selection done in {:.2}s: best={} cutoff={} scored={:?} probes={:?}",
            log_label,
            started.elapsed().as_secs_f64(),
            selection.meta.best_index,
            selection.meta.cutoff_index_inclusive,
            selection.meta.scored_indices,
            selection.meta.probe_order
        );

        let generated_image = if selection.meta.placeholder {
            None
        } else {
            frame_refs
                .get(&selection.meta.best_index)
                .and_then(|best_ref| self.generate_image(best_ref, &mut events))
        };

        let record = bundle::build_record(RecordInputs {
            episode_key: &cfg.episode_key,
            camera_ref: &cfg.camera_ref,
            trigger_ref: &cfg.trigger_ref,
            session,
            selection: &selection,
            generated_image,
            oracle_events: events,
            created_at: Utc::now(),
        });

        if let Some(dir) = cfg.local_run_dir.as_ref() {
            let run_dir = dir.join(&session.id);
            if let Err(e) = bundle::write_trace(&run_dir, &selection, &cfg.trace) {
                log::warn!("{} failed to write selection trace: {}", log_label, e);
            }
            if cfg.write_record_json {
                if let Err(e) = bundle::write_record_json(&run_dir, &record) {
                    log::warn!("{} failed to write record json: {}", log_label, e);
                }
            }
        }

        Ok(record)
    }

    fn generate_image(&self, best_ref: &str, events: &mut Vec<OracleEvent>) -> Option<GeneratedImage> {
        if !self.config.image_generation_enabled {
            return None;
        }
        let generator = self.image_generator.as_ref()?;
        let output_ref = format!("{}/{}", self.run_ref, GENERATED_FILENAME);

        let started = Instant::now();
        let outcome = generator.generate_image(best_ref, &self.config.image_prompt, &output_ref);
        let elapsed = (started.elapsed().as_secs_f64() * 1000.0).round() / 1000.0;

        match outcome {
            Ok(meta) => {
                let model = meta
                    .get("_meta")
                    .and_then(|m| m.get("model"))
                    .and_then(|m| m.as_str())
                    .map(|s| s.to_string());
                events.push(OracleEvent::image_generation(elapsed, model.clone(), None));
                Some(GeneratedImage {
                    image_ref: output_ref,
                    source_ref: best_ref.to_string(),
                    model,
                    elapsed_secs: elapsed,
                    extra: meta,
                })
            }
            Err(e) => {
                let err = SummaryError::ImageGeneration(e.to_string());
                log::warn!("{} session={} {}", self.label, self.session.id, err);
                events.push(OracleEvent::image_generation(elapsed, None, Some(err.to_string())));
                None
            }
        }
    }
}
