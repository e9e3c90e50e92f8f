// Detection Summary - Capture State Machine
//
// Idle -> Capturing -> Draining -> Ended, driven by discrete ticks from an
// external scheduler. Each tick does at most one capture call and returns
// the delay until the next tick.


use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::CaptureConfig;
use crate::constants::{MAX_TICK_DELAY_SECS, MIN_OFF_POLL_SECS};
use crate::error::{Result, SummaryError};
use crate::paths;

/// Takes one snapshot from a camera into the given destination reference.
pub trait FrameCapturer: Send + Sync {
    fn capture_frame(&self, camera_ref: &str, dest_ref: &str) -> anyhow::Result<()>;
}

/// Reads the current value of the motion entity.
pub trait MotionSource: Send + Sync {
    fn motion_state(&self, entity_ref: &str) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapturePhase {
    Idle,
    Capturing,
    Draining,
    Ended,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub index: usize,
    pub captured_at: DateTime<Utc>,
    pub image_ref: String,
}

/// One capture episode. Frozen once `ended_at` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureSession {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub frames: Vec<Frame>,
    pub motion_on_accumulated_secs: f64,
    pub timed_out: bool,
    /// Capture indices handed out so far, including failed ones
    pub attempted_frames: usize,
}

impl CaptureSession {
    fn new(id: String, started_at: DateTime<Utc>) -> Self {
        Self {
            id,
            started_at,
            ended_at: None,
            frames: Vec::new(),
            motion_on_accumulated_secs: 0.0,
            timed_out: false,
            attempted_frames: 0,
        }
    }

    /// Seconds from start to end (or 0 while still open).
    pub fn duration_secs(&self) -> f64 {
        match self.ended_at {
            Some(end) => secs_between(self.started_at, end),
            None => 0.0,
        }
    }

    /// index -> image reference for every frame that was captured.
    pub fn frame_refs(&self) -> HashMap<usize, String> {
        self.frames
            .iter()
            .map(|f| (f.index, f.image_ref.clone()))
            .collect()
    }
}

/// Non-negative seconds between two instants, millisecond precision.
pub fn secs_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    ((to - from).num_milliseconds().max(0) as f64) / 1000.0
}

/// Scheduler delay, capped at MAX_TICK_DELAY_SECS.
fn tick_delay(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.min(MAX_TICK_DELAY_SECS)).unwrap_or(Duration::ZERO)
}

#[derive(Debug)]
pub enum TickResult {
    /// Schedule the next tick after `delay`.
    Continue { delay: Duration },
    /// Capture finished; the session is handed off by value.
    Ended(CaptureSession),
}

pub struct CaptureMachine {
    config: CaptureConfig,
    phase: CapturePhase,
    session: Option<CaptureSession>,
    last_motion_on: bool,
    last_change: DateTime<Utc>,
    off_since: Option<DateTime<Utc>>,
    label: String,
    log_events: bool,
}

impl CaptureMachine {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            phase: CapturePhase::Idle,
            session: None,
            last_motion_on: false,
            last_change: Utc::now(),
            off_since: None,
            label: String::new(),
            log_events: false,
        }
    }

    pub fn with_logging(mut self, label: impl Into<String>, enabled: bool) -> Self {
        self.label = label.into();
        self.log_events = enabled;
        self
    }

    pub fn phase(&self) -> CapturePhase {
        self.phase
    }

    pub fn session(&self) -> Option<&CaptureSession> {
        self.session.as_ref()
    }

    pub fn is_active(&self) -> bool {
        matches!(self.phase, CapturePhase::Capturing | CapturePhase::Draining)
    }

    /// Open a session. The trigger fired, so motion counts as on from `now`.
    pub fn start(&mut self, session_id: &str, now: DateTime<Utc>) -> Result<()> {
        if self.is_active() {
            return Err(SummaryError::SessionActive(self.label.clone()));
        }
        self.session = Some(CaptureSession::new(session_id.to_string(), now));
        self.phase = CapturePhase::Capturing;
        self.last_motion_on = true;
        self.last_change = now;
        self.off_since = None;
        Ok(())
    }

    /// Advance one step. Capture failures are logged and leave a gap in
    /// the frame indices; they never end the session.
    pub fn tick(
        &mut self,
        now: DateTime<Utc>,
        motion_on: bool,
        capturer: &dyn FrameCapturer,
        camera_ref: &str,
        run_ref: &str,
    ) -> Result<TickResult> {
        if !self.is_active() {
            return Err(SummaryError::Capture("no active capture session".to_string()));
        }

        // Motion accounting runs before any stop decision.
        if motion_on != self.last_motion_on {
            if self.last_motion_on {
                self.add_motion_on(now);
            }
            self.last_motion_on = motion_on;
            self.last_change = now;
        }

        if self.should_stop(now, motion_on) {
            return self.end(now);
        }

        if motion_on {
            self.phase = CapturePhase::Capturing;
            self.capture_one(now, capturer, camera_ref, run_ref);
            return Ok(TickResult::Continue {
                delay: tick_delay(self.config.snapshot_interval_secs.max(0.0)),
            });
        }

        self.phase = CapturePhase::Draining;
        Ok(TickResult::Continue {
            delay: tick_delay(self.config.off_poll_secs.max(MIN_OFF_POLL_SECS)),
        })
    }

    fn should_stop(&mut self, now: DateTime<Utc>, motion_on: bool) -> bool {
        let Some(session) = self.session.as_mut() else {
            return true;
        };

        let cap = self.config.capture_max_secs;
        if cap > 0.0 && secs_between(session.started_at, now) >= cap {
            session.timed_out = true;
            return true;
        }

        if motion_on {
            self.off_since = None;
            return false;
        }

        let off_since = *self.off_since.get_or_insert(now);
        secs_between(off_since, now) >= self.config.off_grace_secs
    }

    fn capture_one(&mut self, now: DateTime<Utc>, capturer: &dyn FrameCapturer, camera_ref: &str, run_ref: &str) {
        let Some(session) = self.session.as_mut() else {
            return;
        };

        let index = session.attempted_frames;
        session.attempted_frames += 1;
        let dest = paths::frame_ref(run_ref, index);

        match capturer.capture_frame(camera_ref, &dest) {
            Ok(()) => {
                if self.log_events {
                    log::info!("{} session={} captured frame {} -> {}", self.label, session.id, index, dest);
                }
                session.frames.push(Frame {
                    index,
                    captured_at: now,
                    image_ref: dest,
                });
            }
            Err(e) => {
                log::warn!("{} session={} snapshot failed for frame {}: {}", self.label, session.id, index, e);
            }
        }
    }

    fn add_motion_on(&mut self, until: DateTime<Utc>) {
        if let Some(session) = self.session.as_mut() {
            session.motion_on_accumulated_secs += secs_between(self.last_change, until);
        }
    }

    fn end(&mut self, now: DateTime<Utc>) -> Result<TickResult> {
        if self.last_motion_on {
            self.add_motion_on(now);
            self.last_change = now;
        }
        self.phase = CapturePhase::Ended;
        self.off_since = None;

        let mut session = self
            .session
            .take()
            .ok_or_else(|| SummaryError::Capture("no active capture session".to_string()))?;
        session.ended_at = Some(now);

        log::info!(
            "{} session={} capture complete (captured={} attempted={} timed_out={} motion_on={:.1}s)",
            self.label,
            session.id,
            session.frames.len(),
            session.attempted_frames,
            session.timed_out,
            session.motion_on_accumulated_secs
        );

        Ok(TickResult::Ended(session))
    }
}
