//! Server configuration.
use std::{net::SocketAddr, path::PathBuf};

use crate::{
    encode::{StillFormat, DEFAULT_JPEG_QUALITY},
    publisher::StreamSettings,
    sensors::CameraSpec,
    utils::default_model_path,
};

/// Name of the upload directory below the static directory.
pub const UPLOADS: &str = "uploads";

/// Prefix of annotated upload files.
pub const DETECTED_PREFIX: &str = "detected_";

#[derive(Clone, Debug)]
pub struct Settings {
    pub server_address: SocketAddr,
    pub model_path: PathBuf,
    pub model_url: Option<String>,
    /// Side length of the square network input.
    pub input_size: u32,
    pub max_iou: f32,
    pub camera: CameraSpec,
    pub static_dir: PathBuf,
    pub jpeg_quality: u8,
    pub max_upload_bytes: usize,
    pub stream: StreamSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_address: SocketAddr::from(([127, 0, 0, 1], 3000)),
            model_path: default_model_path(),
            model_url: None,
            input_size: 640,
            max_iou: 0.45,
            camera: CameraSpec::Device(0),
            static_dir: PathBuf::from("static"),
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            max_upload_bytes: 16 * 1024 * 1024,
            stream: StreamSettings {
                format: StillFormat::Jpeg {
                    quality: DEFAULT_JPEG_QUALITY,
                },
                ..Default::default()
            },
        }
    }
}

impl Settings {
    /// Directory uploaded and annotated images are stored in.
    pub fn upload_dir(&self) -> PathBuf {
        self.static_dir.join(UPLOADS)
    }

    pub fn min_confidence(&self) -> f32 {
        self.stream.min_confidence
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn uploads_live_below_static_dir() {
        let settings = Settings {
            static_dir: PathBuf::from("/srv/www"),
            ..Default::default()
        };
        assert_eq!(settings.upload_dir(), PathBuf::from("/srv/www/uploads"));
        assert_eq!(settings.min_confidence(), 0.4);
        assert_eq!(
            settings.stream.format,
            StillFormat::Jpeg {
                quality: DEFAULT_JPEG_QUALITY
            }
        );
    }
}
