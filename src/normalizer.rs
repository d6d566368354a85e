//! Turns whatever subtitle the user supplied (or none) into a single WebVTT
//! file in the staging directory.
//!
//! Formats are recognised purely by file extension. A mislabelled file is
//! handled according to its claimed extension and conversion errors surface
//! as failures instead of being downgraded to "no subtitle".

use std::{io, path::Path, path::PathBuf, sync::Arc};

use axum::body::Bytes;
use thiserror::Error;

use crate::{
    config::UnknownSubtitlePolicy,
    staging::{Slot, StagingStore},
    transcoder::{Ffmpeg, TranscodeError},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubtitleFormat {
    /// WebVTT; served as is.
    Canonical,
    /// A text format ffmpeg can turn into WebVTT. Holds the lowercase
    /// extension.
    Legacy(String),
    Unknown(String),
}

const LEGACY_EXTENSIONS: &[&str] = &["srt", "ass", "ssa"];

impl SubtitleFormat {
    pub fn from_file_name(name: &str) -> Self {
        let ext = Path::new(name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .unwrap_or_default();
        if ext == "vtt" {
            Self::Canonical
        } else if LEGACY_EXTENSIONS.contains(&ext.as_str()) {
            Self::Legacy(ext)
        } else {
            Self::Unknown(ext)
        }
    }
}

/// A file received from the upload form. `content` shares the buffer the
/// multipart reader produced.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub file_name: String,
    pub content: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// No subtitle was uploaded and the video carries no usable track.
    NoEmbeddedTrack,
    /// The uploaded subtitle had an extension we do not handle.
    UnsupportedFormat(String),
}

/// How the current subtitle artifact came to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubtitleOutcome {
    PassThrough(PathBuf),
    Converted(PathBuf),
    Extracted(PathBuf),
    Skipped(SkipReason),
}

impl SubtitleOutcome {
    pub fn artifact(&self) -> Option<&Path> {
        match self {
            Self::PassThrough(path) | Self::Converted(path) | Self::Extracted(path) => Some(path),
            Self::Skipped(_) => None,
        }
    }

    pub fn provenance(&self) -> &'static str {
        match self {
            Self::PassThrough(_) => "uploaded",
            Self::Converted(_) => "converted",
            Self::Extracted(_) => "extracted",
            Self::Skipped(_) => "none",
        }
    }
}

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("subtitle conversion failed: {0}")]
    Transcode(#[from] TranscodeError),

    #[error("staging subtitle failed: {0:#}")]
    Staging(#[from] anyhow::Error),

    #[error("unsupported subtitle format `.{0}`")]
    UnsupportedFormat(String),
}

pub struct SubtitleNormalizer<'a> {
    staging: Arc<dyn StagingStore>,
    ffmpeg: &'a Ffmpeg,
    unknown_policy: UnknownSubtitlePolicy,
}

impl<'a> SubtitleNormalizer<'a> {
    pub fn new(
        staging: Arc<dyn StagingStore>,
        ffmpeg: &'a Ffmpeg,
        unknown_policy: UnknownSubtitlePolicy,
    ) -> Self {
        Self {
            staging,
            ffmpeg,
            unknown_policy,
        }
    }

    /// Resolves the subtitle artifact for the freshly admitted `video`.
    ///
    /// Extraction only happens when nothing was uploaded; it is never a
    /// fallback for a failed conversion.
    pub async fn normalize(
        &self,
        video: &Path,
        uploaded: Option<&UploadedFile>,
    ) -> Result<SubtitleOutcome, NormalizeError> {
        let Some(uploaded) = uploaded else {
            return Ok(self.extract(video).await);
        };

        match SubtitleFormat::from_file_name(&uploaded.file_name) {
            SubtitleFormat::Canonical => {
                let path = self.admit(Slot::Subtitle, uploaded.content.clone()).await?;
                Ok(SubtitleOutcome::PassThrough(path))
            }
            SubtitleFormat::Legacy(ext) => self.convert(ext, uploaded.content.clone()).await,
            SubtitleFormat::Unknown(ext) => match self.unknown_policy {
                UnknownSubtitlePolicy::Skip => {
                    tracing::info!(
                        file_name = %uploaded.file_name,
                        "ignoring subtitle with unsupported extension"
                    );
                    Ok(SubtitleOutcome::Skipped(SkipReason::UnsupportedFormat(ext)))
                }
                UnknownSubtitlePolicy::Reject => Err(NormalizeError::UnsupportedFormat(ext)),
            },
        }
    }

    /// Writes `content` into `slot` on the blocking pool.
    async fn admit(&self, slot: Slot, content: Bytes) -> Result<PathBuf, NormalizeError> {
        let staging = Arc::clone(&self.staging);
        let path = tokio::task::spawn_blocking(move || staging.admit(&slot, &content))
            .await
            .map_err(anyhow::Error::from)??;
        Ok(path)
    }

    async fn convert(
        &self,
        ext: String,
        content: Bytes,
    ) -> Result<SubtitleOutcome, NormalizeError> {
        let source = self.admit(Slot::SubtitleSource(ext), content).await?;
        let output = self.staging.slot_path(&Slot::Subtitle);

        let result = self.ffmpeg.convert_to_webvtt(&source, &output).await;
        remove_if_present(&source).await;

        match result {
            Ok(()) => Ok(SubtitleOutcome::Converted(output)),
            Err(err) => {
                remove_if_present(&output).await;
                Err(err.into())
            }
        }
    }

    async fn extract(&self, video: &Path) -> SubtitleOutcome {
        let output = self.staging.slot_path(&Slot::Subtitle);
        match self.ffmpeg.extract_webvtt(video, &output).await {
            Ok(()) => {
                if is_non_empty(&output).await {
                    return SubtitleOutcome::Extracted(output);
                }
                tracing::debug!("extraction produced no subtitle data");
            }
            Err(err) => tracing::debug!(error = %err, "no embedded subtitle extracted"),
        }
        remove_if_present(&output).await;
        SubtitleOutcome::Skipped(SkipReason::NoEmbeddedTrack)
    }
}

async fn is_non_empty(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .is_ok_and(|meta| meta.is_file() && meta.len() > 0)
}

async fn remove_if_present(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => tracing::warn!(path = %path.display(), error = %err, "could not remove file"),
    }
}
