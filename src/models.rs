// src/models.rs - pose and depth model seams, plus file-backed replays
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use image::{DynamicImage, ImageBuffer, Luma};
use tracing::{debug, info};

use crate::error::{Result, TrackerError};
use crate::skeleton::PoseDetection;
use crate::transform::DepthMap;

/// External pose model: 33 landmarks per frame, or nothing.
pub trait PoseEstimator: Send {
    fn estimate(&mut self, frame: &DynamicImage) -> Result<Option<PoseDetection>>;
}

/// External depth model: a dense depth map for the frame.
pub trait DepthEstimator: Send {
    fn infer(&mut self, frame: &DynamicImage) -> Result<DepthMap>;
}

/// Landmarks captured ahead of time, replayed one entry per frame.
///
/// The file is a JSON array; each entry is `null` (no detection) or an
/// object with `screen` and optionally `world` landmark arrays.
#[derive(Debug, Clone, Default)]
pub struct LandmarkRecording {
    frames: VecDeque<Option<PoseDetection>>,
    replayed: usize,
}

impl LandmarkRecording {
    pub fn new(frames: impl IntoIterator<Item = Option<PoseDetection>>) -> Self {
        Self {
            frames: frames.into_iter().collect(),
            replayed: 0,
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let frames: Vec<Option<PoseDetection>> = serde_json::from_str(&text)?;
        info!(path = %path.display(), frames = frames.len(), "landmark recording loaded");
        Ok(Self::new(frames))
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl PoseEstimator for LandmarkRecording {
    fn estimate(&mut self, _frame: &DynamicImage) -> Result<Option<PoseDetection>> {
        match self.frames.pop_front() {
            Some(entry) => {
                self.replayed += 1;
                Ok(entry)
            }
            None => {
                debug!(replayed = self.replayed, "landmark recording exhausted");
                Ok(None)
            }
        }
    }
}

/// Depth maps stored as grayscale images in a directory, replayed in name order.
#[derive(Debug, Clone)]
pub struct DepthMapSequence {
    paths: Vec<PathBuf>,
    next: usize,
}

impl DepthMapSequence {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| is_image_file(p))
            .collect();
        paths.sort();
        if paths.is_empty() {
            return Err(TrackerError::Inference(format!(
                "no depth images found in {}",
                dir.display()
            )));
        }
        info!(dir = %dir.display(), maps = paths.len(), "depth map sequence opened");
        Ok(Self { paths, next: 0 })
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl DepthEstimator for DepthMapSequence {
    fn infer(&mut self, _frame: &DynamicImage) -> Result<DepthMap> {
        let path = self.paths.get(self.next).ok_or_else(|| {
            TrackerError::Inference(format!("depth sequence exhausted after {} maps", self.next))
        })?;
        self.next += 1;
        let image = image::open(path)
            .map_err(|e| TrackerError::Inference(format!("{}: {}", path.display(), e)))?;
        Ok(to_depth_map(&image))
    }
}

/// Converts any image to a single-channel map with values in `[0, 1]`.
pub fn to_depth_map(image: &DynamicImage) -> DepthMap {
    let luma = image.to_luma16();
    ImageBuffer::from_fn(luma.width(), luma.height(), |x, y| {
        Luma([luma.get_pixel(x, y).0[0] as f32 / u16::MAX as f32])
    })
}

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| matches!(ext.to_ascii_lowercase().as_str(), "png" | "jpg" | "jpeg"))
        .unwrap_or(false)
}
