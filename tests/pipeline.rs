use std::collections::VecDeque;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use crossbeam_channel::Receiver;
use image::{DynamicImage, ImageBuffer, Luma, RgbImage};
use pose_stream::calibration::{CalibrationSettings, CaptureTiming};
use pose_stream::persistence::{load_document, SkeletonDocument};
use pose_stream::pipeline::RecordOptions;
use pose_stream::transform::{DepthMap, Stage};
use pose_stream::{
    DepthEstimator, FrameSource, LandmarkRecording, Mode, Models, PipelineController,
    PipelineEvent, PoseDetection, PoseEstimator, RawLandmark, SessionOptions, SourceError,
    SourceKind, TrackerError,
};

enum Step {
    Frame,
    Transient,
    Malformed,
}

struct ScriptedSource {
    steps: VecDeque<Step>,
    timing: CaptureTiming,
}

impl ScriptedSource {
    fn frames(n: usize) -> Self {
        Self::new((0..n).map(|_| Step::Frame), CaptureTiming::FrameIndexed { fps: 2.0 })
    }

    fn new(steps: impl IntoIterator<Item = Step>, timing: CaptureTiming) -> Self {
        Self {
            steps: steps.into_iter().collect(),
            timing,
        }
    }
}

impl FrameSource for ScriptedSource {
    fn next_frame(&mut self) -> Result<Option<DynamicImage>, SourceError> {
        match self.steps.pop_front() {
            Some(Step::Frame) => Ok(Some(DynamicImage::new_rgb8(640, 480))),
            Some(Step::Transient) => Err(SourceError::Transient("timed out".into())),
            Some(Step::Malformed) => Err(SourceError::Malformed("bad jpeg".into())),
            None => Ok(None),
        }
    }

    fn timing(&self) -> CaptureTiming {
        self.timing
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}

/// Never runs dry; paces itself so a stop lands mid-stream.
struct EndlessSource;

impl FrameSource for EndlessSource {
    fn next_frame(&mut self) -> Result<Option<DynamicImage>, SourceError> {
        thread::sleep(Duration::from_millis(5));
        Ok(Some(DynamicImage::new_rgb8(64, 48)))
    }

    fn describe(&self) -> String {
        "endless".to_string()
    }
}

struct FixedPose(PoseDetection);

impl PoseEstimator for FixedPose {
    fn estimate(&mut self, _frame: &DynamicImage) -> pose_stream::Result<Option<PoseDetection>> {
        Ok(Some(self.0.clone()))
    }
}

struct FlatDepth(f32);

impl DepthEstimator for FlatDepth {
    fn infer(&mut self, frame: &DynamicImage) -> pose_stream::Result<DepthMap> {
        Ok(ImageBuffer::from_pixel(frame.width(), frame.height(), Luma([self.0])))
    }
}

fn screen_landmarks() -> Vec<RawLandmark> {
    (0..33)
        .map(|i| RawLandmark::with_z(0.3 + i as f64 * 0.01, 0.2 + i as f64 * 0.02, 0.0))
        .collect()
}

fn tpose_world() -> Vec<RawLandmark> {
    let mut raw = vec![RawLandmark::with_z(0.0, 1.5, 0.0); 33];
    for idx in [0, 7, 8] {
        raw[idx] = RawLandmark::with_z(0.0, 0.1, 0.0);
    }
    raw[15] = RawLandmark::with_z(-1.45, 1.0, 0.0);
    raw[16] = RawLandmark::with_z(1.45, 1.0, 0.0);
    raw[27] = RawLandmark::with_z(-0.2, 3.2, 0.0);
    raw[28] = RawLandmark::with_z(0.2, 3.2, 0.0);
    raw
}

fn detection() -> PoseDetection {
    PoseDetection {
        screen: screen_landmarks(),
        world: Some(tpose_world()),
    }
}

fn one_second_calibration() -> CalibrationSettings {
    CalibrationSettings {
        countdown: Duration::from_secs(1),
        capture: Duration::from_secs(1),
    }
}

/// Collects events up to and including the terminal one.
fn run_to_end(events: &Receiver<PipelineEvent>) -> Vec<PipelineEvent> {
    let mut seen = Vec::new();
    loop {
        let event = events
            .recv_timeout(Duration::from_secs(10))
            .expect("session did not finish");
        let terminal = matches!(event, PipelineEvent::Finished { .. } | PipelineEvent::Error { .. });
        seen.push(event);
        if terminal {
            return seen;
        }
    }
}

fn temp_output() -> PathBuf {
    std::env::temp_dir().join(format!("pose_stream_it_{}", uuid::Uuid::new_v4()))
}

#[test]
fn calibrated_depth_session_applies_each_stage_once() {
    // 2 countdown frames + 2 capture frames at 2 fps, then 3 streamed frames.
    let recording = LandmarkRecording::new((0..7).map(|_| Some(detection())));
    let mut controller = PipelineController::new(Models::new(recording).with_depth(FlatDepth(0.4)));
    let events = controller.events();

    let opts = SessionOptions {
        mode: Mode::World3D,
        calibration: Some(one_second_calibration()),
        depth_enabled: true,
        ..SessionOptions::default()
    };
    controller
        .start_with(|_| Ok(Box::new(ScriptedSource::frames(7))), opts)
        .unwrap();
    let seen = run_to_end(&events);

    let profile = seen
        .iter()
        .find_map(|e| match e {
            PipelineEvent::CalibrationReady(p) => Some(*p),
            _ => None,
        })
        .expect("calibration did not finish");
    assert!((profile.width_scale - 1.0).abs() < 1e-9);
    assert!((profile.height_scale - 3.1 / 3.3).abs() < 1e-9);
    assert_eq!(profile.ground_y, 3.2);

    let frames: Vec<_> = seen
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::Frame { skeleton, .. } => Some(skeleton),
            _ => None,
        })
        .collect();
    assert_eq!(frames.len(), 3);
    for skeleton in frames {
        assert_eq!(skeleton.len(), 16);
        assert_eq!(
            skeleton.stages().as_slice(),
            &[Stage::ScaleToUnits, Stage::DepthCorrection, Stage::LateralRecenter]
        );
    }

    match seen.last() {
        Some(PipelineEvent::Finished { message, stats, .. }) => {
            assert_eq!(message, "processing complete");
            assert_eq!(stats.emitted, 3);
            assert_eq!(stats.frames_read, 7);
        }
        other => panic!("unexpected terminal event: {:?}", other),
    }
}

#[test]
fn calibration_without_a_pose_fails_the_session() {
    let recording = LandmarkRecording::new((0..4).map(|_| None));
    let mut controller = PipelineController::new(Models::new(recording));
    let events = controller.events();

    let opts = SessionOptions {
        mode: Mode::World3D,
        calibration: Some(one_second_calibration()),
        ..SessionOptions::default()
    };
    controller
        .start_with(|_| Ok(Box::new(ScriptedSource::frames(4))), opts)
        .unwrap();

    match run_to_end(&events).last() {
        Some(PipelineEvent::Error { message }) => assert!(message.contains("calibration failed")),
        other => panic!("expected a calibration failure, got {:?}", other),
    }
}

#[test]
fn screen_session_skips_calibration() {
    let recording = LandmarkRecording::new((0..3).map(|_| Some(detection())));
    let mut controller = PipelineController::new(Models::new(recording));
    let events = controller.events();

    let opts = SessionOptions {
        mode: Mode::Screen2D,
        calibration: Some(one_second_calibration()),
        ..SessionOptions::default()
    };
    controller
        .start_with(|_| Ok(Box::new(ScriptedSource::frames(3))), opts)
        .unwrap();

    let seen = run_to_end(&events);
    assert!(!seen.iter().any(|e| matches!(
        e,
        PipelineEvent::CalibrationProgress(_) | PipelineEvent::CalibrationReady(_)
    )));
    let frames: Vec<_> = seen
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::Frame { skeleton, .. } => Some(skeleton),
            _ => None,
        })
        .collect();
    assert_eq!(frames.len(), 3);
    for skeleton in frames {
        assert_eq!(skeleton.stages().as_slice(), &[Stage::Denormalize]);
    }
    assert!(matches!(seen.last(), Some(PipelineEvent::Finished { .. })));
}

#[test]
fn stop_ends_a_live_session() {
    let mut controller = PipelineController::new(Models::new(FixedPose(detection())));
    let events = controller.events();
    controller
        .start_with(|_| Ok(Box::new(EndlessSource)), SessionOptions::default())
        .unwrap();
    assert!(controller.is_running());

    // Wait until frames flow, then cancel.
    loop {
        match events.recv_timeout(Duration::from_secs(10)).unwrap() {
            PipelineEvent::Frame { .. } => break,
            PipelineEvent::Error { message } => panic!("session failed: {}", message),
            _ => {}
        }
    }
    controller.stop();

    match run_to_end(&events).last() {
        Some(PipelineEvent::Finished { message, .. }) => assert_eq!(message, "stopped by user"),
        other => panic!("unexpected terminal event: {:?}", other),
    }
    controller.wait();
    assert!(!controller.is_running());
}

#[test]
fn a_second_start_is_rejected_while_running() {
    let mut controller = PipelineController::new(Models::new(FixedPose(detection())));
    let events = controller.events();
    controller
        .start_with(|_| Ok(Box::new(EndlessSource)), SessionOptions::default())
        .unwrap();

    let again = controller.start_with(|_| Ok(Box::new(EndlessSource)), SessionOptions::default());
    assert!(matches!(again, Err(TrackerError::AlreadyRunning)));

    controller.stop();
    run_to_end(&events);
    controller.wait();

    // Models come back after the session, so a new one can start.
    controller
        .start_with(|_| Ok(Box::new(ScriptedSource::frames(1))), SessionOptions::default())
        .unwrap();
    assert!(matches!(run_to_end(&events).last(), Some(PipelineEvent::Finished { .. })));
}

#[test]
fn bad_network_frames_are_skipped_not_fatal() {
    let recording = LandmarkRecording::new(vec![Some(detection()), Some(detection())]);
    let mut controller = PipelineController::new(Models::new(recording));
    let events = controller.events();

    let steps = [Step::Frame, Step::Malformed, Step::Transient, Step::Frame];
    controller
        .start_with(
            move |_| Ok(Box::new(ScriptedSource::new(steps, CaptureTiming::WallClock))),
            SessionOptions::default(),
        )
        .unwrap();

    match run_to_end(&events).last() {
        Some(PipelineEvent::Finished { stats, .. }) => {
            assert_eq!(stats.frames_read, 2);
            assert_eq!(stats.emitted, 2);
            assert_eq!(stats.malformed, 1);
            assert_eq!(stats.retried, 1);
        }
        other => panic!("unexpected terminal event: {:?}", other),
    }
}

#[test]
fn frames_without_detection_are_skipped() {
    let recording = LandmarkRecording::new(vec![None, Some(detection()), None]);
    let mut controller = PipelineController::new(Models::new(recording));
    let events = controller.events();
    controller
        .start_with(|_| Ok(Box::new(ScriptedSource::frames(3))), SessionOptions::default())
        .unwrap();

    let seen = run_to_end(&events);
    let indices: Vec<u64> = seen
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::Frame { index, .. } => Some(*index),
            _ => None,
        })
        .collect();
    assert_eq!(indices, vec![1]);
    match seen.last() {
        Some(PipelineEvent::Finished { stats, .. }) => assert_eq!(stats.skipped, 2),
        other => panic!("unexpected terminal event: {:?}", other),
    }
}

#[test]
fn unavailable_source_is_reported_once() {
    let mut controller = PipelineController::new(Models::new(LandmarkRecording::default()));
    let events = controller.events();
    controller
        .start_with(
            |_| Err(SourceError::Unavailable("camera unplugged".into())),
            SessionOptions::default(),
        )
        .unwrap();

    let seen = run_to_end(&events);
    assert_eq!(seen.len(), 1);
    match &seen[0] {
        PipelineEvent::Error { message } => assert!(message.contains("camera unplugged")),
        other => panic!("unexpected event: {:?}", other),
    }
}

#[test]
fn depth_without_a_depth_model_is_refused_up_front() {
    let mut controller = PipelineController::new(Models::new(LandmarkRecording::default()));
    let opts = SessionOptions {
        mode: Mode::World3D,
        depth_enabled: true,
        ..SessionOptions::default()
    };
    let result = controller.start_with(|_| Ok(Box::new(ScriptedSource::frames(1))), opts);
    assert!(matches!(result, Err(TrackerError::Inference(_))));
    assert!(!controller.is_running());
}

#[test]
fn video_sessions_record_a_sequence() {
    let dir = temp_output();
    let recording = LandmarkRecording::new((0..3).map(|_| Some(detection())));
    let mut controller = PipelineController::new(Models::new(recording));
    let events = controller.events();
    let opts = SessionOptions {
        record: Some(RecordOptions {
            output_dir: dir.clone(),
            session_name: Some("clip".to_string()),
        }),
        ..SessionOptions::default()
    };
    controller
        .start_with(|_| Ok(Box::new(ScriptedSource::frames(3))), opts)
        .unwrap();

    let output = match run_to_end(&events).pop() {
        Some(PipelineEvent::Finished { output: Some(path), .. }) => path,
        other => panic!("unexpected terminal event: {:?}", other),
    };
    assert_eq!(output, dir.join("keypoints").join("clip.json"));
    match load_document(&output).unwrap() {
        SkeletonDocument::Sequence(frames) => assert_eq!(frames.len(), 3),
        SkeletonDocument::Single(_) => panic!("expected a sequence"),
    }
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn image_sessions_record_a_single_mapping() {
    let dir = temp_output();
    std::fs::create_dir_all(&dir).unwrap();
    let image_path = dir.join("pose.png");
    RgbImage::new(320, 240).save(&image_path).unwrap();

    let recording = LandmarkRecording::new(vec![Some(detection())]);
    let mut controller = PipelineController::new(Models::new(recording));
    let events = controller.events();
    let opts = SessionOptions {
        // Ignored for a still image.
        calibration: Some(one_second_calibration()),
        record: Some(RecordOptions {
            output_dir: dir.clone(),
            session_name: Some("still".to_string()),
        }),
        ..SessionOptions::default()
    };
    controller.start(SourceKind::Image(image_path), opts).unwrap();

    let seen = run_to_end(&events);
    let output = match seen.last() {
        Some(PipelineEvent::Finished { output: Some(path), .. }) => path.clone(),
        other => panic!("unexpected terminal event: {:?}", other),
    };
    let SkeletonDocument::Single(skeleton) = load_document(&output).unwrap() else {
        panic!("expected a single mapping");
    };
    assert_eq!(skeleton.len(), 16);
    let _ = std::fs::remove_dir_all(&dir);
}
