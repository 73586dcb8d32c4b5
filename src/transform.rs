// src/transform.rs - coordinate stages applied to a derived skeleton
use std::collections::VecDeque;
use std::fmt;

use image::{ImageBuffer, Luma};
use thiserror::Error;

use crate::calibration::CalibrationProfile;
use crate::skeleton::{JointName, Skeleton};

/// Fixed exaggeration applied to model depth when converting to output units.
pub const DEPTH_EXAGGERATION: f64 = 2.5;

/// Pixels per output unit for screen-space skeletons carrying model z.
pub const PIXELS_PER_UNIT: f64 = 111.0;

/// Number of hip-depth samples in the moving average.
pub const DEPTH_WINDOW: usize = 10;

/// Per-pixel depth aligned with the video frame.
pub type DepthMap = ImageBuffer<Luma<f32>, Vec<f32>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Denormalize,
    ScaleToUnits,
    MovableUnits,
    DepthCorrection,
    LateralRecenter,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Denormalize => "denormalize",
            Stage::ScaleToUnits => "scale-to-units",
            Stage::MovableUnits => "movable-units",
            Stage::DepthCorrection => "depth-correction",
            Stage::LateralRecenter => "lateral-recenter",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum TransformError {
    #[error("stage {0} was already applied to this skeleton")]
    StageAlreadyApplied(Stage),

    #[error("invalid frame size {width}x{height}")]
    InvalidFrameSize { width: u32, height: u32 },

    #[error("depth map is empty")]
    EmptyDepthMap,
}

/// Ordered log of the stages a skeleton has been through.
///
/// None of the stages are idempotent, so each may be recorded once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppliedStages(Vec<Stage>);

impl AppliedStages {
    pub fn contains(&self, stage: Stage) -> bool {
        self.0.contains(&stage)
    }

    pub fn count(&self, stage: Stage) -> usize {
        self.0.iter().filter(|s| **s == stage).count()
    }

    pub fn as_slice(&self) -> &[Stage] {
        &self.0
    }

    fn record(&mut self, stage: Stage) -> Result<(), TransformError> {
        if self.contains(stage) {
            return Err(TransformError::StageAlreadyApplied(stage));
        }
        self.0.push(stage);
        Ok(())
    }
}

pub fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Normalized `[0, 1]` coordinates -> pixels of a `width` x `height` frame.
pub fn denormalize(skeleton: &mut Skeleton, width: u32, height: u32) -> Result<(), TransformError> {
    if width == 0 || height == 0 {
        return Err(TransformError::InvalidFrameSize { width, height });
    }
    skeleton.stages_mut().record(Stage::Denormalize)?;
    let (w, h) = (width as f64, height as f64);
    for joint in skeleton.joints_mut() {
        joint.x = round3(joint.x * w);
        joint.y = round3(joint.y * h);
    }
    Ok(())
}

/// Re-expresses world coordinates in the subject's calibrated units.
pub fn scale_to_units(skeleton: &mut Skeleton, profile: &CalibrationProfile) -> Result<(), TransformError> {
    skeleton.stages_mut().record(Stage::ScaleToUnits)?;
    for joint in skeleton.joints_mut() {
        joint.x = round3(joint.x * profile.width_scale);
        joint.y = round3((profile.ground_y - joint.y) * profile.height_scale);
        joint.z = joint.z.map(|z| round3(z * DEPTH_EXAGGERATION));
    }
    Ok(())
}

/// Pixel-space skeleton with model z -> output units, feet on `y = 0`.
pub fn to_movable_units(skeleton: &mut Skeleton, frame_height: u32) -> Result<(), TransformError> {
    if frame_height == 0 {
        return Err(TransformError::InvalidFrameSize { width: 0, height: frame_height });
    }
    let h = frame_height as f64;
    let lowest_y = skeleton
        .joint(JointName::LeftAnkle)
        .y
        .max(skeleton.joint(JointName::RightAnkle).y);
    let ground = (h - lowest_y) / PIXELS_PER_UNIT;

    skeleton.stages_mut().record(Stage::MovableUnits)?;
    for joint in skeleton.joints_mut() {
        joint.x = round3(joint.x / PIXELS_PER_UNIT);
        joint.y = round3((h - joint.y) / PIXELS_PER_UNIT - ground);
        joint.z = joint.z.map(|z| round3(z * DEPTH_EXAGGERATION));
    }
    Ok(())
}

/// Bounded FIFO of the most recent hip-depth samples.
#[derive(Debug, Clone)]
pub struct DepthHistory {
    samples: VecDeque<f64>,
    capacity: usize,
    seen: usize,
}

impl DepthHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            seen: 0,
        }
    }

    pub fn push(&mut self, sample: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        self.seen += 1;
    }

    /// Mean of the retained samples.
    pub fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Samples pushed since the last reset, including evicted ones.
    pub fn seen(&self) -> usize {
        self.seen
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.seen = 0;
    }
}

impl Default for DepthHistory {
    fn default() -> Self {
        Self::new(DEPTH_WINDOW)
    }
}

/// Session-lifetime depth state: the smoothing window and the first frame's
/// hip depth that every later frame is measured against.
#[derive(Debug, Clone, Default)]
pub struct DepthTracker {
    history: DepthHistory,
    baseline: Option<f64>,
}

impl DepthTracker {
    pub fn new(window: usize) -> Self {
        Self {
            history: DepthHistory::new(window),
            baseline: None,
        }
    }

    /// Records one hip-depth sample and returns the z shift for this frame.
    ///
    /// Until the window has overflowed the raw sample is used as-is; after
    /// that the rounded mean of the window is.
    pub fn observe(&mut self, hip_depth: f64) -> f64 {
        self.history.push(hip_depth);
        let baseline = *self.baseline.get_or_insert(hip_depth);
        let current = self.smoothed().unwrap_or(hip_depth);
        current - baseline
    }

    /// The depth value the next shift is computed from.
    pub fn smoothed(&self) -> Option<f64> {
        let latest = self.history.samples.back().copied()?;
        if self.history.seen() > self.history.capacity() {
            self.history.mean().map(round3)
        } else {
            Some(latest)
        }
    }

    pub fn baseline(&self) -> Option<f64> {
        self.baseline
    }

    pub fn history(&self) -> &DepthHistory {
        &self.history
    }

    pub fn reset(&mut self) {
        self.history.clear();
        self.baseline = None;
    }
}

/// Reads the depth at a normalized frame position, clamped to the map.
pub fn sample_depth(map: &DepthMap, norm_x: f64, norm_y: f64) -> Result<f64, TransformError> {
    let (w, h) = map.dimensions();
    if w == 0 || h == 0 {
        return Err(TransformError::EmptyDepthMap);
    }
    let px = ((norm_x * w as f64).floor().max(0.0) as u32).min(w - 1);
    let py = ((norm_y * h as f64).floor().max(0.0) as u32).min(h - 1);
    Ok(map.get_pixel(px, py).0[0] as f64)
}

/// Moves every joint's z by `z_shift` so the body tracks forward/back motion.
pub fn apply_depth_shift(skeleton: &mut Skeleton, z_shift: f64) -> Result<(), TransformError> {
    skeleton.stages_mut().record(Stage::DepthCorrection)?;
    for joint in skeleton.joints_mut() {
        joint.z = joint.z.map(|z| round3(z + z_shift));
    }
    Ok(())
}

/// Shifts every joint's x by the hip's horizontal offset from frame center.
///
/// `hip_norm_x` is the hip's pixel x divided by frame width; `lateral_span`
/// is how many output units the full frame width covers.
pub fn recenter_lateral(
    skeleton: &mut Skeleton,
    hip_norm_x: f64,
    lateral_span: f64,
) -> Result<(), TransformError> {
    skeleton.stages_mut().record(Stage::LateralRecenter)?;
    let offset = (hip_norm_x - 0.5) * lateral_span;
    for joint in skeleton.joints_mut() {
        joint.x = round3(joint.x + offset);
    }
    Ok(())
}
