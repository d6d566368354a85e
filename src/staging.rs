//! The staging directory: one current video, one current subtitle.
//!
//! Files live under fixed names so the HTTP layer can serve them directly and
//! every upload naturally overwrites the previous one.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};

pub const VIDEO_FILE_NAME: &str = "video.mp4";
pub const SUBTITLE_FILE_NAME: &str = "subtitle.vtt";
const SUBTITLE_SOURCE_STEM: &str = "subtitle";

/// Logical artifact slots inside the staging directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot {
    Video,
    Subtitle,
    /// Temporary home of an uploaded legacy subtitle while it is converted.
    SubtitleSource(String),
}

impl Slot {
    pub fn file_name(&self) -> String {
        match self {
            Self::Video => VIDEO_FILE_NAME.to_string(),
            Self::Subtitle => SUBTITLE_FILE_NAME.to_string(),
            Self::SubtitleSource(ext) => format!("{SUBTITLE_SOURCE_STEM}.{ext}"),
        }
    }
}

pub trait StagingStore: Send + Sync {
    /// Removes every regular file in the staging directory. Files vanishing
    /// concurrently are not an error.
    fn clear(&self) -> Result<()>;

    /// Writes `content` to the slot, replacing whatever was there.
    fn admit(&self, slot: &Slot, content: &[u8]) -> Result<PathBuf>;

    /// Fixed location of a slot, whether or not a file exists there.
    fn slot_path(&self, slot: &Slot) -> PathBuf;

    /// Location of a slot only if a file currently exists there.
    fn artifact_path(&self, slot: &Slot) -> Option<PathBuf> {
        let path = self.slot_path(slot);
        path.is_file().then_some(path)
    }

    /// Directory the HTTP layer serves from.
    fn root(&self) -> &Path;
}

#[derive(Debug, Clone)]
pub struct FsStagingStore {
    root: PathBuf,
}

impl FsStagingStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Creates the staging directory if needed.
    pub fn prepare(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("creating staging dir {}", self.root.display()))
    }
}

impl StagingStore for FsStagingStore {
    fn clear(&self) -> Result<()> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return self.prepare(),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("listing staging dir {}", self.root.display()));
            }
        };

        for entry in entries {
            let entry = entry.with_context(|| format!("listing {}", self.root.display()))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err).with_context(|| format!("removing {}", path.display()));
                }
            }
        }
        Ok(())
    }

    fn admit(&self, slot: &Slot, content: &[u8]) -> Result<PathBuf> {
        let path = self.slot_path(slot);
        fs::write(&path, content).with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }

    fn slot_path(&self, slot: &Slot) -> PathBuf {
        self.root.join(slot.file_name())
    }

    fn root(&self) -> &Path {
        &self.root
    }
}
