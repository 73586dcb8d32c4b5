// src/lib.rs
//! Pose landmarks in, calibrated 16-joint skeletons out.
//!
//! Each frame's 33 landmarks are mapped onto a fixed skeleton
//! ([`skeleton`]), moved into pixel or calibrated units ([`transform`],
//! [`calibration`]) and handed to WebSocket subscribers ([`broadcast`]) and
//! a keypoint file ([`persistence`]). [`pipeline`] ties it together per
//! session.

pub mod broadcast;
pub mod calibration;
pub mod config;
pub mod error;
pub mod models;
pub mod persistence;
pub mod pipeline;
pub mod skeleton;
pub mod transform;
pub mod video;

pub use broadcast::{BroadcastOptions, Broadcaster, FrameSender, QueuePolicy, StreamFrame};
pub use calibration::{CalibrationController, CalibrationProfile, CalibrationSettings, CalibrationState};
pub use error::{Result, TrackerError};
pub use models::{DepthEstimator, DepthMapSequence, LandmarkRecording, PoseEstimator};
pub use pipeline::{Mode, Models, PipelineController, PipelineEvent, SessionOptions, SessionStats};
pub use skeleton::{derive_skeleton, Joint, JointName, PoseDetection, RawLandmark, Skeleton};
pub use video::{FrameSource, SourceError, SourceKind};
