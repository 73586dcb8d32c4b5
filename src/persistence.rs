// src/persistence.rs - keypoint documents written at the end of a session
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;
use crate::skeleton::Skeleton;

/// A session's output: one mapping for a still image, a list otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SkeletonDocument {
    Single(Skeleton),
    Sequence(Vec<Skeleton>),
}

impl SkeletonDocument {
    pub fn skeletons(&self) -> &[Skeleton] {
        match self {
            SkeletonDocument::Single(skeleton) => std::slice::from_ref(skeleton),
            SkeletonDocument::Sequence(frames) => frames,
        }
    }
}

/// Collects emitted skeletons and writes them as one JSON file.
pub struct KeypointRecorder {
    output_dir: PathBuf,
    session_name: String,
    frames: Vec<Skeleton>,
}

impl KeypointRecorder {
    pub fn new(output_dir: impl AsRef<Path>, session_name: Option<String>) -> Self {
        let session_name = session_name
            .unwrap_or_else(|| format!("keypoints_{}", Local::now().format("%Y%m%d_%H%M%S")));

        Self {
            output_dir: output_dir.as_ref().to_path_buf(),
            session_name,
            frames: Vec::new(),
        }
    }

    pub fn add_frame(&mut self, skeleton: Skeleton) {
        self.frames.push(skeleton);
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    pub fn path(&self) -> PathBuf {
        self.output_dir
            .join("keypoints")
            .join(format!("{}.json", self.session_name))
    }

    /// Writes the document. With `single` the first skeleton is written on its
    /// own, and nothing is written if there is none.
    pub fn save(&self, single: bool) -> Result<Option<PathBuf>> {
        let document = if single {
            match self.frames.first() {
                Some(skeleton) => SkeletonDocument::Single(skeleton.clone()),
                None => return Ok(None),
            }
        } else {
            SkeletonDocument::Sequence(self.frames.clone())
        };

        let path = self.path();
        write_document(&path, &document)?;
        info!(path = %path.display(), frames = document.skeletons().len(), "keypoints saved");
        Ok(Some(path))
    }
}

pub fn write_document(path: &Path, document: &SkeletonDocument) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut writer = BufWriter::new(File::create(path)?);
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut writer, formatter);
    document.serialize(&mut serializer)?;
    writer.flush()?;
    Ok(())
}

pub fn load_document(path: impl AsRef<Path>) -> Result<SkeletonDocument> {
    let reader = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}
