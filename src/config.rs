// src/config.rs
use anyhow::{ensure, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::broadcast::{BroadcastOptions, QueuePolicy};
use crate::calibration::CalibrationSettings;
use crate::video::{NetworkCameraOptions, SourceOptions};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
    #[serde(default)]
    pub depth: DepthConfig,
    #[serde(default)]
    pub recenter: RecenterConfig,
    #[serde(default)]
    pub network_camera: NetworkCameraConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// `unbounded`, or `drop_oldest` with a `capacity`
    #[serde(default)]
    pub queue: QueuePolicy,
}

fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8765 }

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            queue: QueuePolicy::default(),
        }
    }
}

impl StreamConfig {
    pub fn broadcast_options(&self) -> BroadcastOptions {
        BroadcastOptions {
            host: self.host.clone(),
            port: self.port,
            queue: self.queue,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CalibrationConfig {
    /// Run the T-pose capture before streaming
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_countdown_secs")]
    pub countdown_secs: f64,
    #[serde(default = "default_capture_secs")]
    pub capture_secs: f64,
    /// Frame rate assumed for videos that report none
    #[serde(default = "default_fallback_fps")]
    pub fallback_fps: f64,
}

fn default_countdown_secs() -> f64 { 5.0 }
fn default_capture_secs() -> f64 { 10.0 }
fn default_fallback_fps() -> f64 { 30.0 }

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            countdown_secs: default_countdown_secs(),
            capture_secs: default_capture_secs(),
            fallback_fps: default_fallback_fps(),
        }
    }
}

impl CalibrationConfig {
    pub fn settings(&self) -> Result<CalibrationSettings> {
        Ok(CalibrationSettings {
            countdown: Duration::try_from_secs_f64(self.countdown_secs)
                .context("calibration.countdown_secs must be a non-negative number")?,
            capture: Duration::try_from_secs_f64(self.capture_secs)
                .context("calibration.capture_secs must be a non-negative number")?,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DepthConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Hip-depth samples in the moving average
    #[serde(default = "default_depth_window")]
    pub window: usize,
}

fn default_depth_window() -> usize { crate::transform::DEPTH_WINDOW }

impl Default for DepthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window: default_depth_window(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecenterConfig {
    /// Output units spanned by the full frame width
    #[serde(default = "default_lateral_span")]
    pub lateral_span: f64,
}

fn default_lateral_span() -> f64 { crate::calibration::REFERENCE_WIDTH }

impl Default for RecenterConfig {
    fn default() -> Self {
        Self { lateral_span: default_lateral_span() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkCameraConfig {
    #[serde(default = "default_camera_port")]
    pub port: u16,
    #[serde(default = "default_camera_path")]
    pub path: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_frame_timeout_ms")]
    pub frame_timeout_ms: u64,
}

fn default_camera_port() -> u16 { 8080 }
fn default_camera_path() -> String { "/shot.jpg".to_string() }
fn default_connect_timeout_ms() -> u64 { 5000 }
fn default_frame_timeout_ms() -> u64 { 1500 }

impl Default for NetworkCameraConfig {
    fn default() -> Self {
        Self {
            port: default_camera_port(),
            path: default_camera_path(),
            connect_timeout_ms: default_connect_timeout_ms(),
            frame_timeout_ms: default_frame_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutputConfig {
    /// Defaults to `Documents/PoseStream`, or `./outputs` without a home directory
    #[serde(default)]
    pub directory: Option<PathBuf>,
    /// Defaults to a timestamped name
    #[serde(default)]
    pub filename: Option<String>,
}

impl OutputConfig {
    pub fn directory(&self) -> PathBuf {
        self.directory.clone().unwrap_or_else(default_output_dir)
    }
}

fn default_output_dir() -> PathBuf {
    directories::UserDirs::new()
        .and_then(|dirs| dirs.document_dir().map(|d| d.join("PoseStream")))
        .unwrap_or_else(|| PathBuf::from("outputs"))
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    pub fn source_options(&self) -> Result<SourceOptions> {
        let fallback_fps = self.calibration.fallback_fps;
        ensure!(
            fallback_fps.is_finite() && fallback_fps > 0.0,
            "calibration.fallback_fps must be a positive number, got {}",
            fallback_fps
        );
        let camera = &self.network_camera;
        Ok(SourceOptions {
            network_camera: NetworkCameraOptions {
                port: camera.port,
                path: camera.path.clone(),
                connect_timeout: Duration::from_millis(camera.connect_timeout_ms),
                frame_timeout: Duration::from_millis(camera.frame_timeout_ms),
            },
            fallback_fps,
        })
    }
}
