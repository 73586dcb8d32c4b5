// src/pipeline.rs - session orchestration: source -> deriver -> transforms -> sinks
//!
//! A session runs on its own thread. The controller owns the models between
//! sessions, hands them to the worker on `start` and gets them back when the
//! worker exits. Cancellation is a token the loop checks before pulling each
//! frame.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use image::DynamicImage;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broadcast::{BroadcastOptions, Broadcaster, FrameSender, StreamFrame};
use crate::calibration::{CalibrationController, CalibrationProfile, CalibrationProgress, CalibrationSettings, CalibrationState};
use crate::error::{Result, TrackerError};
use crate::models::{DepthEstimator, PoseEstimator};
use crate::persistence::KeypointRecorder;
use crate::skeleton::{derive_skeleton, JointName, PoseDetection, Skeleton};
use crate::transform::{self, DepthMap, DepthTracker};
use crate::video::{FrameSource, SourceError, SourceKind, SourceOptions};

/// Pause before retrying a source after a transient failure.
const RETRY_BACKOFF: Duration = Duration::from_millis(100);
/// Frames kept in the processing-time window.
const STATS_WINDOW: usize = 30;

/// Which landmark set feeds the skeleton and which stages it goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, clap::ValueEnum)]
pub enum Mode {
    /// Screen landmarks in pixel space.
    #[default]
    #[value(name = "2d")]
    Screen2D,
    /// World landmarks, optionally calibrated and depth corrected.
    #[value(name = "3d")]
    World3D,
    /// Screen landmarks with z, converted to units anchored on the ground.
    #[value(name = "movable")]
    Movable3D,
}

impl Mode {
    /// Screen output stays in pixels, so only the unit-based modes take a
    /// calibration profile.
    pub fn calibrates(self) -> bool {
        !matches!(self, Mode::Screen2D)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordOptions {
    pub output_dir: PathBuf,
    pub session_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub mode: Mode,
    /// Run a T-pose calibration before streaming.
    pub calibration: Option<CalibrationSettings>,
    pub depth_enabled: bool,
    pub depth_window: usize,
    pub lateral_span: f64,
    pub stream: Option<BroadcastOptions>,
    pub record: Option<RecordOptions>,
    /// Attach the source frame to every `Frame` event.
    pub preview: bool,
    pub source: SourceOptions,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            calibration: None,
            depth_enabled: false,
            depth_window: transform::DEPTH_WINDOW,
            lateral_span: crate::calibration::REFERENCE_WIDTH,
            stream: None,
            record: None,
            preview: false,
            source: SourceOptions::default(),
        }
    }
}

/// The external models a session runs against.
pub struct Models {
    pub pose: Box<dyn PoseEstimator>,
    pub depth: Option<Box<dyn DepthEstimator>>,
}

impl Models {
    pub fn new(pose: impl PoseEstimator + 'static) -> Self {
        Self {
            pose: Box::new(pose),
            depth: None,
        }
    }

    pub fn with_depth(mut self, depth: impl DepthEstimator + 'static) -> Self {
        self.depth = Some(Box::new(depth));
        self
    }
}

/// Notifications for whatever drives the controller.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    Started { source: String },
    CalibrationProgress(CalibrationProgress),
    CalibrationReady(CalibrationProfile),
    Frame {
        index: u64,
        skeleton: Skeleton,
        preview: Option<DynamicImage>,
    },
    /// Terminal: the session ended normally or was stopped.
    Finished {
        message: String,
        stats: SessionStats,
        output: Option<PathBuf>,
    },
    /// Terminal: the session could not continue.
    Error { message: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionStats {
    pub frames_read: u64,
    pub emitted: u64,
    /// Frames without a usable detection.
    pub skipped: u64,
    pub malformed: u64,
    pub retried: u64,
    pub avg_processing_ms: f32,
    pub avg_fps: f32,
    #[serde(skip)]
    frame_times: VecDeque<f32>,
}

impl SessionStats {
    pub fn record_processing(&mut self, elapsed: Duration) {
        self.frame_times.push_front(elapsed.as_secs_f32());
        if self.frame_times.len() > STATS_WINDOW {
            self.frame_times.pop_back();
        }
        let avg = self.frame_times.iter().sum::<f32>() / self.frame_times.len() as f32;
        self.avg_processing_ms = avg * 1000.0;
        self.avg_fps = if avg > 0.0 { 1.0 / avg } else { 0.0 };
    }
}

/// Per-session mutable state threaded through every frame.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub depth: DepthTracker,
    pub profile: Option<CalibrationProfile>,
}

impl SessionState {
    pub fn new(depth_window: usize, profile: Option<CalibrationProfile>) -> Self {
        Self {
            depth: DepthTracker::new(depth_window),
            profile,
        }
    }
}

/// The per-frame knobs that do not change within a session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransformOptions {
    pub mode: Mode,
    pub depth_enabled: bool,
    pub lateral_span: f64,
}

impl From<&SessionOptions> for TransformOptions {
    fn from(opts: &SessionOptions) -> Self {
        Self {
            mode: opts.mode,
            depth_enabled: opts.depth_enabled && opts.mode == Mode::World3D,
            lateral_span: opts.lateral_span,
        }
    }
}

/// The skeleton a mode starts from, before any unit conversion. This is
/// also what calibration samples.
pub fn base_skeleton(mode: Mode, detection: &PoseDetection, frame_size: (u32, u32)) -> Result<Skeleton> {
    let (width, height) = frame_size;
    match mode {
        Mode::Screen2D | Mode::Movable3D => {
            let mut skeleton = derive_skeleton(&detection.screen)?;
            transform::denormalize(&mut skeleton, width, height)?;
            Ok(skeleton)
        }
        Mode::World3D => {
            let world = detection.world.as_deref().ok_or(TrackerError::NoDetection)?;
            derive_skeleton(world)
        }
    }
}

/// Runs one detection through every stage its mode calls for, each exactly
/// once.
pub fn process_detection(
    detection: &PoseDetection,
    frame_size: (u32, u32),
    depth_map: Option<&DepthMap>,
    state: &mut SessionState,
    opts: TransformOptions,
) -> Result<Skeleton> {
    let mut skeleton = base_skeleton(opts.mode, detection, frame_size)?;

    match (opts.mode, state.profile.as_ref()) {
        (Mode::Screen2D, _) => {}
        (_, Some(profile)) => transform::scale_to_units(&mut skeleton, profile)?,
        (Mode::Movable3D, None) => transform::to_movable_units(&mut skeleton, frame_size.1)?,
        _ => {}
    }

    if opts.depth_enabled {
        let map = depth_map.ok_or_else(|| {
            TrackerError::Inference("depth correction needs a depth map for every frame".to_string())
        })?;
        // The screen landmarks locate the hip in the frame; world ones do not.
        let screen = derive_skeleton(&detection.screen)?;
        let hip = screen.joint(JointName::Hip);
        let hip_depth = transform::sample_depth(map, hip.x, hip.y)?;
        let z_shift = state.depth.observe(hip_depth);
        transform::apply_depth_shift(&mut skeleton, z_shift)?;
        transform::recenter_lateral(&mut skeleton, hip.x, opts.lateral_span)?;
    }

    Ok(skeleton)
}

/// Starts, stops and observes processing sessions.
pub struct PipelineController {
    models: Option<Models>,
    worker: Option<JoinHandle<Models>>,
    cancel: CancellationToken,
    events_tx: Sender<PipelineEvent>,
    events_rx: Receiver<PipelineEvent>,
}

impl PipelineController {
    pub fn new(models: Models) -> Self {
        let (events_tx, events_rx) = unbounded();
        Self {
            models: Some(models),
            worker: None,
            cancel: CancellationToken::new(),
            events_tx,
            events_rx,
        }
    }

    pub fn events(&self) -> Receiver<PipelineEvent> {
        self.events_rx.clone()
    }

    /// Opens `kind` on a new session thread and starts processing.
    pub fn start(&mut self, kind: SourceKind, opts: SessionOptions) -> Result<()> {
        let single_image = kind.is_single_image();
        self.spawn(move |source_opts| kind.open(source_opts), single_image, opts)
    }

    /// Like [`start`](Self::start) with a caller-supplied source.
    pub fn start_with<F>(&mut self, open: F, opts: SessionOptions) -> Result<()>
    where
        F: FnOnce(&SourceOptions) -> std::result::Result<Box<dyn FrameSource>, SourceError> + Send + 'static,
    {
        self.spawn(open, false, opts)
    }

    fn spawn<F>(&mut self, open: F, single_image: bool, opts: SessionOptions) -> Result<()>
    where
        F: FnOnce(&SourceOptions) -> std::result::Result<Box<dyn FrameSource>, SourceError> + Send + 'static,
    {
        if self.is_running() {
            return Err(TrackerError::AlreadyRunning);
        }
        self.reclaim_models();
        let models = self.models.take().ok_or_else(|| {
            TrackerError::Inference("models were lost when the previous session panicked".to_string())
        })?;

        if opts.depth_enabled && opts.mode == Mode::World3D && models.depth.is_none() {
            self.models = Some(models);
            return Err(TrackerError::Inference(
                "depth correction is enabled but no depth model was provided".to_string(),
            ));
        }
        if opts.depth_enabled && opts.mode != Mode::World3D {
            warn!(mode = ?opts.mode, "depth correction only applies to 3d mode; ignoring");
        }

        self.cancel = CancellationToken::new();
        let session = Session {
            opts,
            single_image,
            cancel: self.cancel.clone(),
            events: self.events_tx.clone(),
        };

        let handle = thread::Builder::new()
            .name("pose-session".to_string())
            .spawn(move || {
                let mut models = models;
                session.run(open, &mut models);
                models
            })?;
        self.worker = Some(handle);
        Ok(())
    }

    /// Asks the running session to stop before its next frame.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Blocks until the current session, if any, has exited.
    pub fn wait(&mut self) {
        self.reclaim_models();
    }

    fn reclaim_models(&mut self) {
        if let Some(handle) = self.worker.take() {
            match handle.join() {
                Ok(models) => self.models = Some(models),
                Err(_) => error!("session thread panicked"),
            }
        }
    }
}

impl Drop for PipelineController {
    fn drop(&mut self) {
        self.stop();
        self.reclaim_models();
    }
}

struct Session {
    opts: SessionOptions,
    single_image: bool,
    cancel: CancellationToken,
    events: Sender<PipelineEvent>,
}

/// How the main loop ended.
enum Outcome {
    Complete,
    Stopped,
}

impl Session {
    fn emit(&self, event: PipelineEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    fn run<F>(self, open: F, models: &mut Models)
    where
        F: FnOnce(&SourceOptions) -> std::result::Result<Box<dyn FrameSource>, SourceError>,
    {
        let mut stats = SessionStats::default();
        let mut recorder = self
            .opts
            .record
            .as_ref()
            .map(|r| KeypointRecorder::new(&r.output_dir, r.session_name.clone()));

        let result = self.run_inner(open, models, &mut stats, recorder.as_mut());

        let result = result.and_then(|outcome| {
            let output = match &recorder {
                Some(recorder) => recorder.save(self.single_image)?,
                None => None,
            };
            Ok((outcome, output))
        });

        match result {
            Ok((outcome, output)) => {
                let message = match outcome {
                    Outcome::Stopped => "stopped by user",
                    Outcome::Complete => "processing complete",
                };
                info!(
                    frames = stats.frames_read,
                    emitted = stats.emitted,
                    skipped = stats.skipped,
                    "session finished: {}",
                    message
                );
                self.emit(PipelineEvent::Finished {
                    message: message.to_string(),
                    stats,
                    output,
                });
            }
            Err(e) => {
                error!("session failed: {}", e);
                self.emit(PipelineEvent::Error { message: e.to_string() });
            }
        }
    }

    fn run_inner<F>(
        &self,
        open: F,
        models: &mut Models,
        stats: &mut SessionStats,
        mut recorder: Option<&mut KeypointRecorder>,
    ) -> Result<Outcome>
    where
        F: FnOnce(&SourceOptions) -> std::result::Result<Box<dyn FrameSource>, SourceError>,
    {
        let mut source = open(&self.opts.source)?;
        self.emit(PipelineEvent::Started { source: source.describe() });

        let broadcaster = match &self.opts.stream {
            Some(stream) => {
                let broadcaster = Broadcaster::new(stream.clone());
                broadcaster.start()?;
                Some(broadcaster)
            }
            None => None,
        };
        let sender = broadcaster.as_ref().map(Broadcaster::sender);

        let outcome = self.stream_frames(source.as_mut(), models, stats, sender.as_ref(), recorder.as_deref_mut());

        if let Some(broadcaster) = broadcaster {
            broadcaster.stop()?;
        }
        outcome
    }

    fn stream_frames(
        &self,
        source: &mut dyn FrameSource,
        models: &mut Models,
        stats: &mut SessionStats,
        sender: Option<&FrameSender>,
        mut recorder: Option<&mut KeypointRecorder>,
    ) -> Result<Outcome> {
        let profile = match self.opts.calibration {
            Some(_) if self.single_image => {
                warn!("calibration needs a frame sequence; skipping for a still image");
                None
            }
            Some(_) if !self.opts.mode.calibrates() => {
                warn!(mode = ?self.opts.mode, "calibration only applies to 3d and movable modes; skipping");
                None
            }
            Some(settings) => match self.calibrate(source, models, settings, stats)? {
                Some(profile) => Some(profile),
                None => return Ok(Outcome::Stopped),
            },
            None => None,
        };

        let transform_opts = TransformOptions::from(&self.opts);
        let mut state = SessionState::new(self.opts.depth_window, profile);
        let mut index: u64 = 0;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(Outcome::Stopped);
            }
            let Some(frame) = self.pull_frame(source, stats)? else {
                continue;
            };
            let Some(frame) = frame else {
                return Ok(Outcome::Complete);
            };

            let started = Instant::now();
            match self.process_frame(&frame, models, &mut state, transform_opts) {
                Ok(skeleton) => {
                    stats.record_processing(started.elapsed());
                    stats.emitted += 1;
                    if let Some(sender) = sender {
                        sender.enqueue(StreamFrame::from_skeleton(&skeleton)?);
                    }
                    if let Some(recorder) = recorder.as_deref_mut() {
                        recorder.add_frame(skeleton.clone());
                    }
                    self.emit(PipelineEvent::Frame {
                        index,
                        skeleton,
                        preview: self.opts.preview.then(|| frame.clone()),
                    });
                }
                Err(TrackerError::NoDetection) => {
                    stats.skipped += 1;
                    debug!(index, "no pose detected");
                }
                Err(TrackerError::Inference(msg)) => {
                    stats.skipped += 1;
                    warn!(index, "inference failed: {}", msg);
                }
                Err(e) => return Err(e),
            }
            index += 1;
        }
    }

    /// `Ok(None)` means skip this iteration; `Ok(Some(None))` means the
    /// source is exhausted.
    fn pull_frame(
        &self,
        source: &mut dyn FrameSource,
        stats: &mut SessionStats,
    ) -> Result<Option<Option<DynamicImage>>> {
        match source.next_frame() {
            Ok(Some(frame)) => {
                stats.frames_read += 1;
                Ok(Some(Some(frame)))
            }
            Ok(None) => Ok(Some(None)),
            Err(SourceError::Transient(msg)) => {
                stats.retried += 1;
                warn!("frame request failed, retrying: {}", msg);
                thread::sleep(RETRY_BACKOFF);
                Ok(None)
            }
            Err(SourceError::Malformed(msg)) => {
                stats.malformed += 1;
                warn!("skipping malformed frame: {}", msg);
                Ok(None)
            }
            Err(e @ SourceError::Unavailable(_)) => Err(e.into()),
        }
    }

    fn process_frame(
        &self,
        frame: &DynamicImage,
        models: &mut Models,
        state: &mut SessionState,
        opts: TransformOptions,
    ) -> Result<Skeleton> {
        let detection = models.pose.estimate(frame)?.ok_or(TrackerError::NoDetection)?;
        let depth_map = match (&mut models.depth, opts.depth_enabled) {
            (Some(depth), true) => Some(depth.infer(frame)?),
            _ => None,
        };
        process_detection(
            &detection,
            (frame.width(), frame.height()),
            depth_map.as_ref(),
            state,
            opts,
        )
    }

    /// Runs the T-pose capture. `Ok(None)` means the session was stopped.
    fn calibrate(
        &self,
        source: &mut dyn FrameSource,
        models: &mut Models,
        settings: CalibrationSettings,
        stats: &mut SessionStats,
    ) -> Result<Option<CalibrationProfile>> {
        let mut controller = CalibrationController::new(settings, source.timing());
        info!(timing = ?source.timing(), "calibration started, hold a T-pose after the countdown");
        self.emit(PipelineEvent::CalibrationProgress(controller.start(Instant::now())));

        loop {
            if self.cancel.is_cancelled() {
                return Ok(None);
            }
            let Some(frame) = self.pull_frame(source, stats)? else {
                continue;
            };
            let Some(frame) = frame else {
                // Source ran dry mid-capture: use what we have.
                let profile = controller.finish(Instant::now())?;
                self.emit(PipelineEvent::CalibrationReady(profile));
                return Ok(Some(profile));
            };

            let sample = match models.pose.estimate(&frame) {
                Ok(Some(detection)) => {
                    base_skeleton(self.opts.mode, &detection, (frame.width(), frame.height()))
                }
                Ok(None) => Err(TrackerError::NoDetection),
                Err(e) => {
                    warn!("inference failed during calibration: {}", e);
                    Err(TrackerError::NoDetection)
                }
            };

            let progress = controller.advance(Instant::now(), sample)?;
            self.emit(PipelineEvent::CalibrationProgress(progress));
            if progress.state == CalibrationState::Ready {
                let profile = controller.profile()?;
                self.emit(PipelineEvent::CalibrationReady(profile));
                return Ok(Some(profile));
            }
        }
    }
}
