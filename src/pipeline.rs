//! The upload transaction: clear the staging directory, admit the video,
//! resolve the subtitle.
//!
//! The staging directory is global state, so the whole sequence runs under
//! one lock. Otherwise two interleaved uploads could leave a subtitle next to
//! a video it was not uploaded with.

use std::{path::Path, sync::Arc};

use thiserror::Error;
use tokio::sync::Mutex;

use crate::{
    config::UnknownSubtitlePolicy,
    normalizer::{NormalizeError, SubtitleNormalizer, SubtitleOutcome, UploadedFile},
    staging::{Slot, StagingStore},
    transcoder::Ffmpeg,
};

#[derive(Debug, Clone)]
pub struct Upload {
    pub video: Option<UploadedFile>,
    pub subtitle: Option<UploadedFile>,
}

/// Result of a completed upload. File names are relative to the staging
/// directory, ready to be linked under `/static/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    pub video: String,
    pub subtitle: Option<String>,
    pub outcome: SubtitleOutcome,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("a video file is required")]
    MissingVideo,

    #[error("staging video failed: {0:#}")]
    Staging(#[source] anyhow::Error),

    #[error(transparent)]
    Subtitle(#[from] NormalizeError),

    #[error("staging task aborted: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl PipelineError {
    /// Whether the user sent something invalid, as opposed to the server
    /// failing to process a valid upload.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::MissingVideo | Self::Subtitle(NormalizeError::UnsupportedFormat(_))
        )
    }
}

/// Currently staged artifacts, as seen by the dashboard.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagedArtifacts {
    pub video: Option<String>,
    pub subtitle: Option<String>,
}

pub struct UploadPipeline {
    staging: Arc<dyn StagingStore>,
    ffmpeg: Ffmpeg,
    unknown_policy: UnknownSubtitlePolicy,
    lock: Mutex<()>,
}

impl UploadPipeline {
    pub fn new(
        staging: Arc<dyn StagingStore>,
        ffmpeg: Ffmpeg,
        unknown_policy: UnknownSubtitlePolicy,
    ) -> Self {
        Self {
            staging,
            ffmpeg,
            unknown_policy,
            lock: Mutex::new(()),
        }
    }

    pub fn staging_root(&self) -> &Path {
        self.staging.root()
    }

    /// Runs one upload. An upload without a video is rejected before the
    /// staging directory is touched. The video part needs both a file name
    /// and content; a subtitle part without a file name counts as absent.
    pub async fn run(&self, upload: Upload) -> Result<UploadReport, PipelineError> {
        let Upload { video, subtitle } = upload;
        let video = video
            .filter(|file| !file.file_name.is_empty() && !file.content.is_empty())
            .ok_or(PipelineError::MissingVideo)?;
        let subtitle = subtitle.filter(|file| !file.file_name.is_empty());

        let _guard = self.lock.lock().await;

        let staging = self.staging.clone();
        let video_path = tokio::task::spawn_blocking(move || {
            staging.clear()?;
            staging.admit(&Slot::Video, &video.content)
        })
        .await?
        .map_err(PipelineError::Staging)?;

        tracing::info!(path = %video_path.display(), "video staged");

        let normalizer =
            SubtitleNormalizer::new(self.staging.clone(), &self.ffmpeg, self.unknown_policy);
        let outcome = normalizer.normalize(&video_path, subtitle.as_ref()).await?;

        tracing::info!(provenance = outcome.provenance(), "subtitle resolved");

        Ok(UploadReport {
            video: Slot::Video.file_name(),
            subtitle: outcome.artifact().map(|_| Slot::Subtitle.file_name()),
            outcome,
        })
    }

    /// Names of the artifacts currently on disk. Waits for an in-flight upload
    /// so it never reports a half-finished state.
    pub async fn current(&self) -> StagedArtifacts {
        let _guard = self.lock.lock().await;
        StagedArtifacts {
            video: self
                .staging
                .artifact_path(&Slot::Video)
                .map(|_| Slot::Video.file_name()),
            subtitle: self
                .staging
                .artifact_path(&Slot::Subtitle)
                .map(|_| Slot::Subtitle.file_name()),
        }
    }
}
