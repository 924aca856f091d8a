//! Error types.
//!
//! End of a frame feed is not an error; `FrameSource::read_frame` signals it with `None`.
use std::path::PathBuf;

use thiserror::Error;

/// Failure to acquire a frame source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("device {device} unavailable: {reason}")]
    DeviceUnavailable { device: String, reason: String },
}

impl SourceError {
    pub fn unavailable(device: impl Into<String>, reason: impl ToString) -> Self {
        Self::DeviceUnavailable {
            device: device.into(),
            reason: reason.to_string(),
        }
    }
}

/// Failure to run the detector on one image.
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("image has zero width or height")]
    EmptyImage,
    #[error("unexpected model output shape {0:?}")]
    OutputShape(Vec<usize>),
    #[error("model run failed: {0}")]
    Run(#[from] anyhow::Error),
}

/// Failure to encode one frame into a still image.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("frame has zero width or height")]
    EmptyFrame,
    #[error(transparent)]
    Image(#[from] image::ImageError),
}

/// Failure to make the detection model available at startup.
#[derive(Debug, Error)]
pub enum ModelLoadError {
    #[error("model file {0} not found and no download url given")]
    Missing(PathBuf),
    #[error("failed to download model from {url}: {source}")]
    Download {
        url: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to load model {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
}
