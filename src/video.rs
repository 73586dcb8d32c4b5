// src/video.rs - frame sources: still images, video files, network and local cameras
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use image::DynamicImage;
use tracing::{debug, info, warn};

use crate::calibration::CaptureTiming;
use crate::error::TrackerError;

/// Upper bound on a single network snapshot body.
const MAX_SNAPSHOT_BYTES: u64 = 32 * 1024 * 1024;

/// How a source failed to produce a frame.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The source cannot be opened or has gone away for good.
    #[error("source unavailable: {0}")]
    Unavailable(String),
    /// A single request failed; the next one may succeed.
    #[error("transient source failure: {0}")]
    Transient(String),
    /// Bytes arrived but did not decode into an image.
    #[error("malformed frame: {0}")]
    Malformed(String),
}

impl From<SourceError> for TrackerError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::Unavailable(msg) | SourceError::Transient(msg) => {
                TrackerError::SourceUnavailable(msg)
            }
            SourceError::Malformed(msg) => TrackerError::MalformedFrame(msg),
        }
    }
}

/// Produces frames one at a time until exhausted.
///
/// Sources are opened on the thread that reads them, so they need not be `Send`.
pub trait FrameSource {
    /// `Ok(None)` means the source has no more frames.
    fn next_frame(&mut self) -> Result<Option<DynamicImage>, SourceError>;

    /// How calibration phases should be timed against this source.
    fn timing(&self) -> CaptureTiming {
        CaptureTiming::WallClock
    }

    fn describe(&self) -> String;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    Image(PathBuf),
    VideoFile(PathBuf),
    NetworkCamera { host: String },
    Camera(u32),
}

impl SourceKind {
    pub fn is_single_image(&self) -> bool {
        matches!(self, SourceKind::Image(_))
    }

    pub fn open(&self, options: &SourceOptions) -> Result<Box<dyn FrameSource>, SourceError> {
        let source: Box<dyn FrameSource> = match self {
            SourceKind::Image(path) => Box::new(StillImage::open(path)?),
            SourceKind::VideoFile(path) => {
                Box::new(VideoFileReader::open(path, options.fallback_fps)?)
            }
            SourceKind::NetworkCamera { host } => Box::new(NetworkCamera::connect(
                host,
                &options.network_camera,
            )?),
            #[cfg(feature = "camera")]
            SourceKind::Camera(index) => Box::new(camera::LocalCamera::open(*index)?),
            #[cfg(not(feature = "camera"))]
            SourceKind::Camera(index) => {
                return Err(SourceError::Unavailable(format!(
                    "camera {} requested but this build has no camera support (enable the `camera` feature)",
                    index
                )))
            }
        };
        info!(source = %source.describe(), "source opened");
        Ok(source)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceOptions {
    pub network_camera: NetworkCameraOptions,
    /// Used when a video file does not report a usable frame rate.
    pub fallback_fps: f64,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            network_camera: NetworkCameraOptions::default(),
            fallback_fps: 30.0,
        }
    }
}

/// A single image, yielded once.
pub struct StillImage {
    path: PathBuf,
    image: Option<DynamicImage>,
}

impl StillImage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let path = path.as_ref().to_path_buf();
        let image = image::open(&path).map_err(|e| {
            SourceError::Unavailable(format!("cannot read image {}: {}", path.display(), e))
        })?;
        Ok(Self {
            path,
            image: Some(image),
        })
    }
}

impl FrameSource for StillImage {
    fn next_frame(&mut self) -> Result<Option<DynamicImage>, SourceError> {
        Ok(self.image.take())
    }

    fn describe(&self) -> String {
        format!("image {}", self.path.display())
    }
}

/// Video file decoded through the `ffmpeg` command line tools.
///
/// Frames are extracted to a temporary directory on open and read back one
/// at a time; the directory is removed on drop.
pub struct VideoFileReader {
    path: PathBuf,
    frame_dir: PathBuf,
    frames: Vec<PathBuf>,
    current_frame: usize,
    fps: f64,
}

impl VideoFileReader {
    pub fn open(path: impl AsRef<Path>, fallback_fps: f64) -> Result<Self, SourceError> {
        let path = path.as_ref().to_path_buf();
        if !path.is_file() {
            return Err(SourceError::Unavailable(format!(
                "video file does not exist: {}",
                path.display()
            )));
        }

        let probe = probe_video(&path)?;
        let fps = probe.fps.filter(|f| f.is_finite() && *f > 0.0).unwrap_or_else(|| {
            warn!(path = %path.display(), fallback_fps, "video reports no frame rate");
            fallback_fps
        });

        let frame_dir = std::env::temp_dir().join(format!("pose_stream_{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&frame_dir).map_err(|e| {
            SourceError::Unavailable(format!("cannot create temporary directory: {}", e))
        })?;

        let frames = match extract_frames(&path, &frame_dir) {
            Ok(frames) => frames,
            Err(e) => {
                let _ = fs::remove_dir_all(&frame_dir);
                return Err(e);
            }
        };
        info!(
            path = %path.display(),
            frames = frames.len(),
            width = probe.width,
            height = probe.height,
            fps,
            "video frames extracted"
        );

        Ok(Self {
            path,
            frame_dir,
            frames,
            current_frame: 0,
            fps,
        })
    }

    pub fn total_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }
}

impl FrameSource for VideoFileReader {
    fn next_frame(&mut self) -> Result<Option<DynamicImage>, SourceError> {
        let Some(frame_path) = self.frames.get(self.current_frame) else {
            return Ok(None);
        };
        self.current_frame += 1;
        image::open(frame_path).map(Some).map_err(|e| {
            SourceError::Malformed(format!("frame {}: {}", self.current_frame, e))
        })
    }

    fn timing(&self) -> CaptureTiming {
        CaptureTiming::FrameIndexed { fps: self.fps }
    }

    fn describe(&self) -> String {
        format!("video {}", self.path.display())
    }
}

impl Drop for VideoFileReader {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.frame_dir) {
            debug!(dir = %self.frame_dir.display(), "failed to remove frame directory: {}", e);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct VideoProbe {
    width: u32,
    height: u32,
    fps: Option<f64>,
}

fn probe_video(path: &Path) -> Result<VideoProbe, SourceError> {
    let output = Command::new("ffprobe")
        .args(["-v", "error", "-select_streams", "v:0"])
        .args(["-show_entries", "stream=width,height,r_frame_rate"])
        .args(["-of", "csv=p=0"])
        .arg(path)
        .output()
        .map_err(|e| {
            SourceError::Unavailable(format!("ffprobe is not installed or not in PATH: {}", e))
        })?;
    if !output.status.success() {
        return Err(SourceError::Unavailable(format!(
            "ffprobe rejected {}: {}",
            path.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    parse_probe(&String::from_utf8_lossy(&output.stdout))
}

fn parse_probe(info: &str) -> Result<VideoProbe, SourceError> {
    let parts: Vec<&str> = info.trim().split(',').map(str::trim).collect();
    if parts.len() < 3 {
        return Err(SourceError::Unavailable(
            "invalid video format or corrupted file".to_string(),
        ));
    }
    let width = parts[0]
        .parse()
        .map_err(|_| SourceError::Unavailable(format!("invalid video width: {}", parts[0])))?;
    let height = parts[1]
        .parse()
        .map_err(|_| SourceError::Unavailable(format!("invalid video height: {}", parts[1])))?;
    Ok(VideoProbe {
        width,
        height,
        fps: parse_frame_rate(parts[2]),
    })
}

/// Parses ffprobe's `num/den` or plain decimal frame rate.
fn parse_frame_rate(rate: &str) -> Option<f64> {
    let fps = match rate.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => rate.trim().parse().ok()?,
    };
    (fps.is_finite() && fps > 0.0).then_some(fps)
}

fn extract_frames(video: &Path, frame_dir: &Path) -> Result<Vec<PathBuf>, SourceError> {
    let pattern = frame_dir.join("frame_%06d.png");
    let status = Command::new("ffmpeg")
        .args(["-v", "error", "-i"])
        .arg(video)
        .arg(&pattern)
        .status()
        .map_err(|e| {
            SourceError::Unavailable(format!("ffmpeg is not installed or not in PATH: {}", e))
        })?;
    if !status.success() {
        return Err(SourceError::Unavailable(
            "ffmpeg frame extraction failed; the video format may be unsupported".to_string(),
        ));
    }

    let mut frames: Vec<PathBuf> = fs::read_dir(frame_dir)
        .map_err(|e| SourceError::Unavailable(format!("cannot list extracted frames: {}", e)))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "png"))
        .collect();
    frames.sort();

    if frames.is_empty() {
        return Err(SourceError::Unavailable(
            "no frames could be extracted from the video".to_string(),
        ));
    }
    Ok(frames)
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetworkCameraOptions {
    pub port: u16,
    pub path: String,
    /// Budget for the first snapshot, which decides whether the camera is reachable.
    pub connect_timeout: Duration,
    /// Budget for every later snapshot.
    pub frame_timeout: Duration,
}

impl Default for NetworkCameraOptions {
    fn default() -> Self {
        Self {
            port: 8080,
            path: "/shot.jpg".to_string(),
            connect_timeout: Duration::from_secs(5),
            frame_timeout: Duration::from_millis(1500),
        }
    }
}

/// A phone or IP camera serving JPEG snapshots over HTTP.
pub struct NetworkCamera {
    url: String,
    agent: ureq::Agent,
    frame_timeout: Duration,
    first: Option<DynamicImage>,
}

impl NetworkCamera {
    /// Fetches one snapshot up front; failure means the camera is unreachable.
    pub fn connect(host: &str, options: &NetworkCameraOptions) -> Result<Self, SourceError> {
        let url = snapshot_url(host, options);
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(options.connect_timeout)
            .build();

        let first = fetch_snapshot(&agent, &url, options.connect_timeout).map_err(|e| match e {
            SourceError::Transient(msg) => {
                SourceError::Unavailable(format!("cannot reach camera at {}: {}", url, msg))
            }
            other => other,
        })?;

        Ok(Self {
            url,
            agent,
            frame_timeout: options.frame_timeout,
            first: Some(first),
        })
    }
}

impl FrameSource for NetworkCamera {
    fn next_frame(&mut self) -> Result<Option<DynamicImage>, SourceError> {
        if let Some(first) = self.first.take() {
            return Ok(Some(first));
        }
        fetch_snapshot(&self.agent, &self.url, self.frame_timeout).map(Some)
    }

    fn describe(&self) -> String {
        format!("network camera {}", self.url)
    }
}

fn snapshot_url(host: &str, options: &NetworkCameraOptions) -> String {
    let path = if options.path.starts_with('/') {
        options.path.clone()
    } else {
        format!("/{}", options.path)
    };
    format!("http://{}:{}{}", host, options.port, path)
}

fn fetch_snapshot(agent: &ureq::Agent, url: &str, timeout: Duration) -> Result<DynamicImage, SourceError> {
    let response = agent
        .get(url)
        .timeout(timeout)
        .call()
        .map_err(|e| SourceError::Transient(e.to_string()))?;

    let mut body = Vec::new();
    response
        .into_reader()
        .take(MAX_SNAPSHOT_BYTES)
        .read_to_end(&mut body)
        .map_err(|e| SourceError::Transient(format!("reading snapshot body: {}", e)))?;

    decode_snapshot(&body)
}

fn decode_snapshot(body: &[u8]) -> Result<DynamicImage, SourceError> {
    image::load_from_memory(body).map_err(|e| SourceError::Malformed(e.to_string()))
}

#[cfg(feature = "camera")]
mod camera {
    use image::{DynamicImage, ImageBuffer};
    use nokhwa::pixel_format::RgbFormat;
    use nokhwa::utils::{CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType, Resolution};
    use nokhwa::Camera;
    use tracing::debug;

    use super::{FrameSource, SourceError};

    /// Local webcam, mirrored so the subject sees themselves as in a mirror.
    pub struct LocalCamera {
        index: u32,
        camera: Camera,
    }

    impl LocalCamera {
        pub fn open(index: u32) -> Result<Self, SourceError> {
            let format = CameraFormat::new(Resolution::new(640, 480), FrameFormat::MJPEG, 30);
            let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(format));
            let mut camera = Camera::new(CameraIndex::Index(index), requested)
                .map_err(|e| SourceError::Unavailable(format!("failed to open camera {}: {}", index, e)))?;
            camera
                .open_stream()
                .map_err(|e| SourceError::Unavailable(format!("failed to open camera stream: {}", e)))?;
            debug!(index, "camera stream open");
            Ok(Self { index, camera })
        }
    }

    impl FrameSource for LocalCamera {
        fn next_frame(&mut self) -> Result<Option<DynamicImage>, SourceError> {
            let frame = self
                .camera
                .frame()
                .map_err(|e| SourceError::Unavailable(format!("failed to capture frame: {}", e)))?;
            let decoded = frame
                .decode_image::<RgbFormat>()
                .map_err(|e| SourceError::Malformed(format!("failed to decode frame: {}", e)))?;
            let (width, height) = decoded.dimensions();
            let rgb = ImageBuffer::from_raw(width, height, decoded.into_raw())
                .ok_or_else(|| SourceError::Malformed("camera frame has the wrong size".to_string()))?;
            Ok(Some(DynamicImage::ImageRgb8(image::imageops::flip_horizontal(&rgb))))
        }

        fn describe(&self) -> String {
            format!("camera {}", self.index)
        }
    }

    impl Drop for LocalCamera {
        fn drop(&mut self) {
            let _ = self.camera.stop_stream();
        }
    }
}
