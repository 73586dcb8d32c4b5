// src/skeleton.rs - 33 raw pose landmarks -> fixed 16-joint skeleton
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Result, TrackerError};
use crate::transform::AppliedStages;

/// Number of landmarks the pose model reports for one detected body.
pub const RAW_LANDMARK_COUNT: usize = 33;

// MediaPipe pose landmark indices
const NOSE: usize = 0;
const LEFT_EAR: usize = 7;
const RIGHT_EAR: usize = 8;
const MOUTH_LEFT: usize = 9;
const MOUTH_RIGHT: usize = 10;
const LEFT_SHOULDER: usize = 11;
const RIGHT_SHOULDER: usize = 12;
const LEFT_ELBOW: usize = 13;
const RIGHT_ELBOW: usize = 14;
const LEFT_WRIST: usize = 15;
const RIGHT_WRIST: usize = 16;
const LEFT_HIP: usize = 23;
const RIGHT_HIP: usize = 24;
const LEFT_KNEE: usize = 25;
const RIGHT_KNEE: usize = 26;
const LEFT_ANKLE: usize = 27;
const RIGHT_ANKLE: usize = 28;

/// Raw landmarks copied straight into the skeleton under a new name.
const DIRECT_JOINTS: [(JointName, usize); 12] = [
    (JointName::LeftShoulder, LEFT_SHOULDER),
    (JointName::RightShoulder, RIGHT_SHOULDER),
    (JointName::LeftElbow, LEFT_ELBOW),
    (JointName::RightElbow, RIGHT_ELBOW),
    (JointName::LeftWrist, LEFT_WRIST),
    (JointName::RightWrist, RIGHT_WRIST),
    (JointName::LeftUpLeg, LEFT_HIP),
    (JointName::RightUpLeg, RIGHT_HIP),
    (JointName::LeftKnee, LEFT_KNEE),
    (JointName::RightKnee, RIGHT_KNEE),
    (JointName::LeftAnkle, LEFT_ANKLE),
    (JointName::RightAnkle, RIGHT_ANKLE),
];

/// Every raw index the deriver reads.
const REFERENCED: [usize; 17] = [
    NOSE, LEFT_EAR, RIGHT_EAR, MOUTH_LEFT, MOUTH_RIGHT,
    LEFT_SHOULDER, RIGHT_SHOULDER, LEFT_ELBOW, RIGHT_ELBOW, LEFT_WRIST, RIGHT_WRIST,
    LEFT_HIP, RIGHT_HIP, LEFT_KNEE, RIGHT_KNEE, LEFT_ANKLE, RIGHT_ANKLE,
];

/// One body point as reported by the pose model.
///
/// Screen landmarks are normalized to `[0, 1]` of the frame; world landmarks
/// carry true-scale coordinates. `z` is only present for 3D output.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawLandmark {
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z: Option<f64>,
}

impl RawLandmark {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y, z: None }
    }

    pub fn with_z(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z: Some(z) }
    }

    fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.map_or(true, f64::is_finite)
    }
}

/// Landmarks produced by the pose model for one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseDetection {
    /// Normalized screen-space landmarks.
    pub screen: Vec<RawLandmark>,
    /// True-scale world landmarks, when the model provides them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub world: Option<Vec<RawLandmark>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JointName {
    LeftShoulder,
    RightShoulder,
    LeftElbow,
    RightElbow,
    LeftWrist,
    RightWrist,
    LeftUpLeg,
    RightUpLeg,
    LeftKnee,
    RightKnee,
    LeftAnkle,
    RightAnkle,
    Hip,
    Spine,
    Neck,
    Head,
}

impl JointName {
    pub const ALL: [JointName; 16] = [
        JointName::LeftShoulder,
        JointName::RightShoulder,
        JointName::LeftElbow,
        JointName::RightElbow,
        JointName::LeftWrist,
        JointName::RightWrist,
        JointName::LeftUpLeg,
        JointName::RightUpLeg,
        JointName::LeftKnee,
        JointName::RightKnee,
        JointName::LeftAnkle,
        JointName::RightAnkle,
        JointName::Hip,
        JointName::Spine,
        JointName::Neck,
        JointName::Head,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JointName::LeftShoulder => "left_shoulder",
            JointName::RightShoulder => "right_shoulder",
            JointName::LeftElbow => "left_elbow",
            JointName::RightElbow => "right_elbow",
            JointName::LeftWrist => "left_wrist",
            JointName::RightWrist => "right_wrist",
            JointName::LeftUpLeg => "left_up_leg",
            JointName::RightUpLeg => "right_up_leg",
            JointName::LeftKnee => "left_knee",
            JointName::RightKnee => "right_knee",
            JointName::LeftAnkle => "left_ankle",
            JointName::RightAnkle => "right_ankle",
            JointName::Hip => "hip",
            JointName::Spine => "spine",
            JointName::Neck => "neck",
            JointName::Head => "head",
        }
    }

    /// Joints computed from other landmarks rather than read directly.
    pub fn is_synthesized(&self) -> bool {
        matches!(
            self,
            JointName::Hip | JointName::Spine | JointName::Neck | JointName::Head
        )
    }
}

impl fmt::Display for JointName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Joint {
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z: Option<f64>,
    pub name: JointName,
}

impl Joint {
    fn from_raw(name: JointName, raw: &RawLandmark) -> Self {
        Self { x: raw.x, y: raw.y, z: raw.z, name }
    }
}

/// A complete 16-joint skeleton.
///
/// Only [`derive_skeleton`], [`Skeleton::from_joints`] and deserialization
/// construct one, and all three refuse anything short of 16 joints.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Skeleton {
    joints: BTreeMap<JointName, Joint>,
    #[serde(skip)]
    stages: AppliedStages,
}

impl Skeleton {
    /// Builds a skeleton from joints keyed by name. Fails unless all 16 names
    /// are present.
    pub fn from_joints(joints: BTreeMap<JointName, Joint>) -> Result<Self> {
        if joints.len() != JointName::ALL.len() {
            return Err(TrackerError::NoDetection);
        }
        let joints = joints
            .into_iter()
            .map(|(name, joint)| (name, Joint { name, ..joint }))
            .collect();
        Ok(Self { joints, stages: AppliedStages::default() })
    }

    pub fn joint(&self, name: JointName) -> &Joint {
        &self.joints[&name]
    }

    pub fn joints(&self) -> impl Iterator<Item = &Joint> {
        self.joints.values()
    }

    pub(crate) fn joints_mut(&mut self) -> impl Iterator<Item = &mut Joint> {
        self.joints.values_mut()
    }

    pub fn len(&self) -> usize {
        self.joints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joints.is_empty()
    }

    pub fn stages(&self) -> &AppliedStages {
        &self.stages
    }

    pub(crate) fn stages_mut(&mut self) -> &mut AppliedStages {
        &mut self.stages
    }
}

impl<'de> Deserialize<'de> for Skeleton {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let joints = BTreeMap::<JointName, Joint>::deserialize(deserializer)?;
        let found = joints.len();
        Skeleton::from_joints(joints).map_err(|_| {
            serde::de::Error::custom(format!(
                "skeleton has {} joints, expected {}",
                found,
                JointName::ALL.len()
            ))
        })
    }
}

/// Maps the 33 raw landmarks of one frame onto the 16-joint skeleton.
///
/// Synthesized joints are per-axis means of their inputs; `z` survives only
/// when every input carries one. Missing or non-finite inputs are reported as
/// [`TrackerError::NoDetection`].
pub fn derive_skeleton(landmarks: &[RawLandmark]) -> Result<Skeleton> {
    if landmarks.len() < RAW_LANDMARK_COUNT {
        return Err(TrackerError::NoDetection);
    }
    if REFERENCED.iter().any(|&idx| !landmarks[idx].is_finite()) {
        return Err(TrackerError::NoDetection);
    }

    let at = |idx: usize| landmarks[idx];

    let spine = centroid(&[at(LEFT_HIP), at(RIGHT_HIP), at(RIGHT_SHOULDER), at(LEFT_SHOULDER)]);
    let hip = centroid(&[at(LEFT_HIP), at(RIGHT_HIP), spine]);
    let neck = centroid(&[at(MOUTH_LEFT), at(MOUTH_RIGHT), at(RIGHT_SHOULDER), at(LEFT_SHOULDER)]);
    let head = centroid(&[at(NOSE), at(LEFT_EAR), at(RIGHT_EAR)]);

    let mut joints = BTreeMap::new();
    for (name, idx) in DIRECT_JOINTS {
        joints.insert(name, Joint::from_raw(name, &landmarks[idx]));
    }
    for (name, point) in [
        (JointName::Hip, hip),
        (JointName::Spine, spine),
        (JointName::Neck, neck),
        (JointName::Head, head),
    ] {
        joints.insert(name, Joint::from_raw(name, &point));
    }

    Skeleton::from_joints(joints)
}

fn centroid(points: &[RawLandmark]) -> RawLandmark {
    let n = points.len() as f64;
    let x = points.iter().map(|p| p.x).sum::<f64>() / n;
    let y = points.iter().map(|p| p.y).sum::<f64>() / n;
    let z = points
        .iter()
        .map(|p| p.z)
        .sum::<Option<f64>>()
        .map(|sum| sum / n);
    RawLandmark { x, y, z }
}
