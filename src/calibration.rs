// src/calibration.rs - timed T-pose capture producing body scale factors
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, TrackerError};
use crate::skeleton::{Joint, JointName, Skeleton};

/// Wrist-to-wrist span of the canonical T-pose, in output units.
pub const REFERENCE_WIDTH: f64 = 2.9;
/// Head-to-ground height of the canonical T-pose, in output units.
pub const REFERENCE_HEIGHT: f64 = 3.1;

/// Scale factors measured from a subject's T-pose.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationProfile {
    /// `w1`: applied to x.
    pub width_scale: f64,
    /// `w2`: applied to the distance above the ground.
    pub height_scale: f64,
    /// Lowest ankle y at calibration time.
    pub ground_y: f64,
}

impl CalibrationProfile {
    pub fn from_tpose(skeleton: &Skeleton) -> Result<Self> {
        let left_wrist = skeleton.joint(JointName::LeftWrist);
        let right_wrist = skeleton.joint(JointName::RightWrist);
        let head = skeleton.joint(JointName::Head);
        let ground_y = skeleton
            .joint(JointName::LeftAnkle)
            .y
            .max(skeleton.joint(JointName::RightAnkle).y);

        let span = left_wrist.x.abs() + right_wrist.x.abs();
        let height = head.y.abs() + ground_y.abs();
        if !(span > 0.0 && height > 0.0) {
            return Err(TrackerError::CalibrationFailed(format!(
                "degenerate T-pose (wrist span {span}, height {height})"
            )));
        }

        Ok(Self {
            width_scale: REFERENCE_WIDTH / span,
            height_scale: REFERENCE_HEIGHT / height,
            ground_y,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalibrationState {
    Idle,
    Countdown,
    Capturing,
    Averaging,
    Ready,
    Failed,
}

/// How phase durations are measured.
///
/// Video files have a known frame rate, so their phases are counted in
/// frames; live sources use the wall clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CaptureTiming {
    WallClock,
    FrameIndexed { fps: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationSettings {
    pub countdown: Duration,
    pub capture: Duration,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            countdown: Duration::from_secs(5),
            capture: Duration::from_secs(10),
        }
    }
}

/// Snapshot emitted after every frame fed to the controller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationProgress {
    pub state: CalibrationState,
    /// Time left in the current phase.
    pub remaining: Duration,
    pub samples: usize,
}

pub struct CalibrationController {
    settings: CalibrationSettings,
    timing: CaptureTiming,
    state: CalibrationState,
    phase_started: Option<Instant>,
    phase_frames: usize,
    samples: Vec<Skeleton>,
    profile: Option<CalibrationProfile>,
}

impl CalibrationController {
    /// A frame-indexed timing without a positive rate falls back to the
    /// wall clock, otherwise the phases would never advance.
    pub fn new(settings: CalibrationSettings, timing: CaptureTiming) -> Self {
        let timing = match timing {
            CaptureTiming::FrameIndexed { fps } if !(fps.is_finite() && fps > 0.0) => {
                warn!(fps, "unusable frame rate for calibration timing, using wall clock");
                CaptureTiming::WallClock
            }
            timing => timing,
        };
        Self {
            settings,
            timing,
            state: CalibrationState::Idle,
            phase_started: None,
            phase_frames: 0,
            samples: Vec::new(),
            profile: None,
        }
    }

    pub fn state(&self) -> CalibrationState {
        self.state
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn profile(&self) -> Result<CalibrationProfile> {
        self.profile
            .ok_or(TrackerError::CalibrationNotReady(self.state))
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, CalibrationState::Ready | CalibrationState::Failed)
    }

    /// Begins the countdown. Restarting discards any earlier attempt.
    pub fn start(&mut self, now: Instant) -> CalibrationProgress {
        self.samples.clear();
        self.profile = None;
        self.enter(CalibrationState::Countdown, now);
        self.progress(now)
    }

    /// Feeds one frame's detection result.
    ///
    /// Frames without a detection still advance the timers but are not
    /// sampled. Once the capture window closes the samples are averaged and
    /// the profile is frozen; an empty window fails the calibration.
    pub fn advance(&mut self, now: Instant, detection: Result<Skeleton>) -> Result<CalibrationProgress> {
        match self.state {
            CalibrationState::Idle => return Err(TrackerError::CalibrationNotReady(self.state)),
            CalibrationState::Countdown => {
                self.phase_frames += 1;
                if self.phase_elapsed(now) >= self.settings.countdown {
                    self.enter(CalibrationState::Capturing, now);
                }
            }
            CalibrationState::Capturing => {
                match detection {
                    Ok(skeleton) => self.samples.push(skeleton),
                    Err(TrackerError::NoDetection) => debug!("calibration frame without detection"),
                    Err(e) => return Err(e),
                }
                self.phase_frames += 1;
                if self.phase_elapsed(now) >= self.settings.capture {
                    self.finish(now)?;
                }
            }
            CalibrationState::Averaging | CalibrationState::Ready | CalibrationState::Failed => {}
        }
        Ok(self.progress(now))
    }

    /// Closes the capture window early (e.g. the source ran out of frames)
    /// and computes the profile from what was captured.
    pub fn finish(&mut self, now: Instant) -> Result<CalibrationProfile> {
        if let Some(profile) = self.profile {
            return Ok(profile);
        }
        self.enter(CalibrationState::Averaging, now);
        info!(samples = self.samples.len(), "averaging T-pose samples");

        let result = average_skeletons(&self.samples)
            .ok_or_else(|| {
                TrackerError::CalibrationFailed("no pose detected during capture".to_string())
            })
            .and_then(|averaged| CalibrationProfile::from_tpose(&averaged));

        match result {
            Ok(profile) => {
                info!(
                    w1 = profile.width_scale,
                    w2 = profile.height_scale,
                    ground_y = profile.ground_y,
                    "calibration ready"
                );
                self.profile = Some(profile);
                self.enter(CalibrationState::Ready, now);
                Ok(profile)
            }
            Err(e) => {
                warn!("calibration failed: {}", e);
                self.enter(CalibrationState::Failed, now);
                Err(e)
            }
        }
    }

    fn enter(&mut self, state: CalibrationState, now: Instant) {
        debug!(from = ?self.state, to = ?state, "calibration state change");
        self.state = state;
        self.phase_started = Some(now);
        self.phase_frames = 0;
    }

    fn phase_elapsed(&self, now: Instant) -> Duration {
        match self.timing {
            CaptureTiming::WallClock => self
                .phase_started
                .map(|start| now.saturating_duration_since(start))
                .unwrap_or_default(),
            CaptureTiming::FrameIndexed { fps } => {
                Duration::from_secs_f64(self.phase_frames as f64 / fps)
            }
        }
    }

    fn progress(&self, now: Instant) -> CalibrationProgress {
        let budget = match self.state {
            CalibrationState::Countdown => self.settings.countdown,
            CalibrationState::Capturing => self.settings.capture,
            _ => Duration::ZERO,
        };
        CalibrationProgress {
            state: self.state,
            remaining: budget.saturating_sub(self.phase_elapsed(now)),
            samples: self.samples.len(),
        }
    }
}

/// Per-joint, per-axis arithmetic mean. `z` is kept only for joints that
/// carry it in every sample.
pub fn average_skeletons(samples: &[Skeleton]) -> Option<Skeleton> {
    if samples.is_empty() {
        return None;
    }
    let n = samples.len() as f64;
    let mut joints = BTreeMap::new();
    for name in JointName::ALL {
        let x = samples.iter().map(|s| s.joint(name).x).sum::<f64>() / n;
        let y = samples.iter().map(|s| s.joint(name).y).sum::<f64>() / n;
        let z = samples
            .iter()
            .map(|s| s.joint(name).z)
            .sum::<Option<f64>>()
            .map(|sum| sum / n);
        joints.insert(name, Joint { x, y, z, name });
    }
    Skeleton::from_joints(joints).ok()
}
