//! Utility functions
//!
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use reqwest::Client;

use crate::{
    error::ModelLoadError,
    nn::{Detector, YoloModel},
    settings::Settings,
};

/// Model file used when none is configured.
pub fn default_model_path() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("detect_server")
        .join("yolov8n.onnx")
}

/// Download a file from a URL to a given filepath.
///
/// The data is written next to the target first and moved in place once complete.
pub async fn download_file(
    client: &Client,
    url: &str,
    filepath: impl AsRef<Path>,
) -> anyhow::Result<()> {
    let filepath = filepath.as_ref();
    let resp = client.get(url).send().await?.error_for_status()?;
    let content = resp.bytes().await?;

    if let Some(parent) = filepath.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let partial = filepath.with_extension("part");
    tokio::fs::write(&partial, &content)
        .await
        .with_context(|| format!("writing {}", partial.display()))?;
    tokio::fs::rename(&partial, filepath).await?;

    Ok(())
}

/// Make sure the model file exists, downloading it from `url` if it does not.
pub async fn ensure_model_file(path: &Path, url: Option<&str>) -> Result<(), ModelLoadError> {
    if path.is_file() {
        return Ok(());
    }

    let url = url.ok_or_else(|| ModelLoadError::Missing(path.to_owned()))?;
    log::info!("Downloading model from {} to {}", url, path.display());
    download_file(&Client::new(), url, path)
        .await
        .map_err(|source| ModelLoadError::Download {
            url: url.to_owned(),
            source,
        })
}

/// Fetch and load the configured detection model.
pub async fn load_detector(settings: &Settings) -> Result<Arc<dyn Detector>, ModelLoadError> {
    ensure_model_file(&settings.model_path, settings.model_url.as_deref()).await?;

    let path = settings.model_path.clone();
    let (input_size, max_iou) = (settings.input_size, settings.max_iou);
    let model = tokio::task::spawn_blocking(move || YoloModel::load(&path, input_size, max_iou))
        .await
        .map_err(|e| ModelLoadError::Load {
            path: settings.model_path.clone(),
            source: e.into(),
        })??;

    Ok(Arc::new(model))
}
