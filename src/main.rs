// src/main.rs
use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::{bounded, never, select};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use pose_stream::calibration::CalibrationState;
use pose_stream::config::Config;
use pose_stream::pipeline::RecordOptions;
use pose_stream::{
    DepthMapSequence, LandmarkRecording, Mode, Models, PipelineController, PipelineEvent,
    SessionOptions, SourceKind,
};

#[derive(Debug, Parser)]
#[command(name = "pose_stream", version, about = "Stream calibrated pose skeletons over WebSocket")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long, value_enum, default_value_t = Mode::Screen2D)]
    mode: Mode,

    /// Landmarks recorded by the pose model, one JSON entry per frame
    #[arg(short, long)]
    landmarks: PathBuf,

    /// Directory of depth-map images, one per frame; enables depth correction
    #[arg(long)]
    depth_maps: Option<PathBuf>,

    /// Run the T-pose calibration before streaming
    #[arg(long)]
    calibrate: bool,

    /// Override the broadcaster port
    #[arg(long)]
    port: Option<u16>,

    /// Do not start the WebSocket broadcaster
    #[arg(long)]
    no_stream: bool,

    /// Do not write a keypoints file
    #[arg(long)]
    no_save: bool,

    /// Output directory for keypoints
    #[arg(short, long)]
    output: Option<PathBuf>,

    #[command(subcommand)]
    source: Source,
}

#[derive(Debug, Subcommand)]
enum Source {
    /// A single image
    Image { path: PathBuf },
    /// A video file (requires ffmpeg)
    Video { path: PathBuf },
    /// A phone or IP camera serving JPEG snapshots
    Phone { host: String },
    /// A local camera
    Camera {
        #[arg(default_value_t = 0)]
        index: u32,
    },
}

enum Input {
    /// `false` once the signal thread has gone away.
    Interrupt(bool),
    Event(Option<PipelineEvent>),
}

impl From<Source> for SourceKind {
    fn from(source: Source) -> Self {
        match source {
            Source::Image { path } => SourceKind::Image(path),
            Source::Video { path } => SourceKind::VideoFile(path),
            Source::Phone { host } => SourceKind::NetworkCamera { host },
            Source::Camera { index } => SourceKind::Camera(index),
        }
    }
}

fn main() -> ExitCode {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    match run(Cli::parse()) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Returns whether the session ended without an error.
fn run(cli: Cli) -> Result<bool> {
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    let pose = LandmarkRecording::load(&cli.landmarks)
        .with_context(|| format!("failed to load landmarks from {}", cli.landmarks.display()))?;
    let mut models = Models::new(pose);
    let depth_enabled = cli.depth_maps.is_some() || config.depth.enabled;
    if let Some(dir) = &cli.depth_maps {
        let depth = DepthMapSequence::open(dir)
            .with_context(|| format!("failed to open depth maps in {}", dir.display()))?;
        models = models.with_depth(depth);
    }

    let mut stream = config.stream.broadcast_options();
    if let Some(port) = cli.port {
        stream.port = port;
    }
    let calibration = (cli.calibrate || config.calibration.enabled)
        .then(|| config.calibration.settings())
        .transpose()?;

    let opts = SessionOptions {
        mode: cli.mode,
        calibration,
        depth_enabled,
        depth_window: config.depth.window,
        lateral_span: config.recenter.lateral_span,
        stream: (!cli.no_stream).then_some(stream),
        record: (!cli.no_save).then(|| RecordOptions {
            output_dir: cli.output.clone().unwrap_or_else(|| config.output.directory()),
            session_name: config.output.filename.clone(),
        }),
        preview: false,
        source: config.source_options()?,
    };

    let mut controller = PipelineController::new(models);
    let events = controller.events();
    controller.start(cli.source.into(), opts)?;

    let (interrupt_tx, interrupt_rx) = bounded::<()>(1);
    thread::Builder::new()
        .name("ctrl-c".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(runtime) => runtime,
                Err(e) => {
                    warn!("Ctrl-C handling unavailable: {}", e);
                    return;
                }
            };
            if runtime.block_on(tokio::signal::ctrl_c()).is_ok() {
                let _ = interrupt_tx.send(());
            }
        })
        .context("failed to spawn signal thread")?;

    let mut interrupts = interrupt_rx;
    let mut last_state = None;
    let succeeded = loop {
        let input = select! {
            recv(interrupts) -> signal => Input::Interrupt(signal.is_ok()),
            recv(events) -> event => Input::Event(event.ok()),
        };
        let event = match input {
            Input::Interrupt(true) => {
                info!("stopping session");
                controller.stop();
                continue;
            }
            Input::Interrupt(false) => {
                interrupts = never();
                continue;
            }
            Input::Event(None) => break false,
            Input::Event(Some(event)) => event,
        };

        match event {
            PipelineEvent::Started { source } => info!("reading from {}", source),
            PipelineEvent::CalibrationProgress(progress) => {
                if last_state != Some(progress.state) {
                    match progress.state {
                        CalibrationState::Countdown => info!(
                            "get ready: hold a T-pose in {:.0}s",
                            progress.remaining.as_secs_f64()
                        ),
                        CalibrationState::Capturing => info!(
                            "capturing T-pose for {:.0}s",
                            progress.remaining.as_secs_f64()
                        ),
                        state => debug!(?state, "calibration state"),
                    }
                    last_state = Some(progress.state);
                }
            }
            PipelineEvent::CalibrationReady(profile) => info!(
                "calibrated: w1={:.4} w2={:.4} ground={:.3}",
                profile.width_scale, profile.height_scale, profile.ground_y
            ),
            PipelineEvent::Frame { index, .. } => debug!(index, "frame emitted"),
            PipelineEvent::Finished { message, stats, output } => {
                info!(
                    "{}: {} frames read, {} emitted, {} without detection, {:.1} fps",
                    message, stats.frames_read, stats.emitted, stats.skipped, stats.avg_fps
                );
                if let Some(path) = output {
                    info!("keypoints written to {}", path.display());
                }
                break true;
            }
            PipelineEvent::Error { message } => {
                error!("{}", message);
                break false;
            }
        }
    };

    controller.wait();
    Ok(succeeded)
}
