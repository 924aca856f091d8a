//! Sensors module.
//!
//! Frame sources deliver decoded RGB frames one at a time. A source is released when it is
//! dropped.
use std::path::{Path, PathBuf};

use image::RgbImage;

use crate::error::SourceError;

/// Producer of successive frames.
pub trait FrameSource {
    /// Capture the next frame, `None` once the feed has ended.
    fn read_frame(&mut self) -> Option<RgbImage>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn read_frame(&mut self) -> Option<RgbImage> {
        (**self).read_frame()
    }
}

pub type BoxedSource = Box<dyn FrameSource>;

/// Where the stream takes its frames from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CameraSpec {
    /// Video device `/dev/video<index>`.
    Device(u32),
    /// Still images of a directory, played once in file name order.
    Folder(PathBuf),
}

impl CameraSpec {
    /// Acquire the source.
    pub fn open(&self) -> Result<BoxedSource, SourceError> {
        match self {
            CameraSpec::Device(index) => open_device(*index),
            CameraSpec::Folder(path) => Ok(Box::new(FolderSource::open(path)?)),
        }
    }
}

impl std::fmt::Display for CameraSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CameraSpec::Device(index) => write!(f, "/dev/video{index}"),
            CameraSpec::Folder(path) => write!(f, "{}", path.display()),
        }
    }
}

#[cfg(feature = "v4l")]
fn open_device(index: u32) -> Result<BoxedSource, SourceError> {
    Ok(Box::new(v4l::V4lCamera::open(index, None, None)?))
}

#[cfg(not(feature = "v4l"))]
fn open_device(index: u32) -> Result<BoxedSource, SourceError> {
    Err(SourceError::unavailable(
        format!("/dev/video{index}"),
        "built without the `v4l` feature",
    ))
}

/// Replays the images of a directory as a finite feed.
pub struct FolderSource {
    paths: std::vec::IntoIter<PathBuf>,
}

impl FolderSource {
    pub fn open(dir: &Path) -> Result<Self, SourceError> {
        let device = dir.display().to_string();
        let entries = std::fs::read_dir(dir).map_err(|e| SourceError::unavailable(&device, e))?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.is_file() && image::ImageFormat::from_path(path).is_ok())
            .collect();
        if paths.is_empty() {
            return Err(SourceError::unavailable(device, "no images found"));
        }
        paths.sort();

        log::info!("Using {} frames from {}", paths.len(), &device);
        Ok(Self {
            paths: paths.into_iter(),
        })
    }
}

impl FrameSource for FolderSource {
    fn read_frame(&mut self) -> Option<RgbImage> {
        let path = self.paths.next()?;
        match image::open(&path) {
            Ok(image) => Some(image.to_rgb8()),
            Err(e) => {
                log::error!("Error reading frame {}: {e}", path.display());
                None
            }
        }
    }
}

#[cfg(feature = "v4l")]
pub mod v4l {
    //! Live cameras through Video4Linux.
    use image::RgbImage;
    use rscam::{Camera, Config};

    use super::FrameSource;
    use crate::error::SourceError;

    const FORMAT: &[u8] = b"MJPG";

    /// Started MJPG camera.
    pub struct V4lCamera {
        cam: Camera,
        device: String,
    }

    impl V4lCamera {
        /// Open `/dev/video<index>`, using the largest resolution and frame rate if not given.
        pub fn open(
            index: u32,
            resolution: Option<(u32, u32)>,
            frame_rate: Option<(u32, u32)>,
        ) -> Result<Self, SourceError> {
            let device = format!("/dev/video{index}");
            let unavailable = |e: &dyn std::fmt::Display| SourceError::unavailable(&device, e);

            let mut cam = Camera::new(&device).map_err(|e| unavailable(&e))?;
            log_supported_formats(&cam);

            let resolution = match resolution {
                Some(resolution) => resolution,
                None => get_max_resolution(&cam).map_err(|e| unavailable(&e))?,
            };
            let frame_rate = match frame_rate {
                Some(frame_rate) => frame_rate,
                None => get_max_frame_rate(&cam, resolution).map_err(|e| unavailable(&e))?,
            };

            cam.start(&Config {
                interval: frame_rate,
                resolution,
                format: FORMAT,
                ..Default::default()
            })
            .map_err(|e| unavailable(&e))?;

            log::info!(
                "Using camera {} at {}x{}, interval {}/{}",
                &device,
                resolution.0,
                resolution.1,
                frame_rate.0,
                frame_rate.1
            );
            Ok(Self { cam, device })
        }
    }

    impl FrameSource for V4lCamera {
        fn read_frame(&mut self) -> Option<RgbImage> {
            let frame = match self.cam.capture() {
                Ok(frame) => frame,
                Err(e) => {
                    log::error!("Error capturing frame from {}: {e}", &self.device);
                    return None;
                }
            };

            match image::load_from_memory_with_format(&frame[..], image::ImageFormat::Jpeg) {
                Ok(image) => Some(image.to_rgb8()),
                Err(e) => {
                    log::error!("Error decoding frame from {}: {e}", &self.device);
                    None
                }
            }
        }
    }

    impl Drop for V4lCamera {
        fn drop(&mut self) {
            log::debug!("Releasing camera {}", &self.device);
        }
    }

    /// Get the maximum supported resolution.
    fn get_max_resolution(cam: &Camera) -> Result<(u32, u32), String> {
        let resolution_info = cam.resolutions(FORMAT).map_err(|e| e.to_string())?;
        log::debug!("Found resolutions: {:?}", &resolution_info);
        match resolution_info {
            rscam::ResolutionInfo::Discretes(resolutions) => resolutions
                .iter()
                // Highest resolution in terms of number of pixels
                .max_by_key(|res| res.0 * res.1)
                .copied(),
            rscam::ResolutionInfo::Stepwise { max, .. } => Some(max),
        }
        .ok_or_else(|| "no resolution found".to_owned())
    }

    /// Get the maximum supported frame rate for the given resolution.
    fn get_max_frame_rate(cam: &Camera, resolution: (u32, u32)) -> Result<(u32, u32), String> {
        let interval_info = cam
            .intervals(FORMAT, resolution)
            .map_err(|e| e.to_string())?;
        log::debug!("Found frame rates: {:?}", &interval_info);
        match interval_info {
            // Intervals are (numerator, denominator) seconds per frame
            rscam::IntervalInfo::Discretes(intervals) => intervals
                .iter()
                .max_by_key(|(num, den)| den / (*num).max(1))
                .copied(),
            rscam::IntervalInfo::Stepwise { min, .. } => Some(min),
        }
        .ok_or_else(|| "no frame rate found".to_owned())
    }

    fn log_supported_formats(cam: &Camera) {
        let formats: Vec<_> = cam.formats().filter_map(|fmt| fmt.ok()).collect();
        log::debug!("Supported formats: {:?}", formats);
    }
}
