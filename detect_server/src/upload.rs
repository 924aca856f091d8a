//! Detection on uploaded images.
//!
//! An upload is decoded, run through the detector and annotated before anything touches the disk.
//! The original and the annotated image are then stored side by side in the upload directory, the
//! latter with the `detected_` prefix.
use std::{
    io::Write,
    path::{Path, PathBuf},
    sync::Mutex,
};

use tempfile::NamedTempFile;
use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

use crate::{
    annotate::annotate,
    encode::{encode_as, output_format_for},
    error::{EncodeError, InferenceError},
    nn::{Detection, Detector},
    pages::Flash,
    settings::DETECTED_PREFIX,
};

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("no file part")]
    NoFilePart,
    #[error("no selected file")]
    NoSelectedFile,
    #[error("invalid file name")]
    InvalidFilename,
    #[error("unsupported image format")]
    UnsupportedFormat,
    #[error("malformed upload: {0}")]
    Multipart(String),
    #[error("detection model unavailable")]
    ModelUnavailable,
    #[error("could not read image: {0}")]
    UnreadableImage(#[from] image::ImageError),
    #[error("detection failed: {0}")]
    Detection(#[from] InferenceError),
    #[error("could not encode result: {0}")]
    Encode(#[from] EncodeError),
    #[error("could not store files: {0}")]
    Storage(#[from] std::io::Error),
}

impl UploadError {
    /// Message shown to the user after the redirect.
    pub fn flash(&self) -> Flash {
        match self {
            UploadError::NoFilePart | UploadError::Multipart(_) => Flash::NoFilePart,
            UploadError::NoSelectedFile => Flash::NoSelectedFile,
            UploadError::InvalidFilename | UploadError::UnsupportedFormat => Flash::InvalidFile,
            UploadError::ModelUnavailable => Flash::ModelUnavailable,
            UploadError::UnreadableImage(_)
            | UploadError::Detection(_)
            | UploadError::Encode(_)
            | UploadError::Storage(_) => Flash::ProcessingFailed,
        }
    }
}

/// Stored result of one upload.
#[derive(Debug)]
pub struct UploadOutcome {
    pub filename: String,
    pub detected_filename: String,
    pub detections: Vec<Detection>,
}

/// Serializes moving finished files in place, so concurrent uploads of the same name never leave
/// the original of one next to the annotated image of another.
static PUBLISH: Mutex<()> = Mutex::new(());

/// Reduce a client supplied file name to a safe, flat ASCII name.
///
/// Accented letters are decomposed and lose their accents, other non-ASCII characters are
/// dropped. Path separators become word breaks, runs of whitespace become one underscore and
/// everything but ASCII letters, digits, `_`, `.` and `-` is dropped. Leading and trailing dots
/// and underscores are stripped. Returns `None` if nothing is left.
pub fn secure_filename(name: &str) -> Option<String> {
    let name: String = name.nfkd().filter(char::is_ascii).collect();
    let name = name.replace(|c: char| c == '/' || c == '\\', " ");
    let joined = name.split_whitespace().collect::<Vec<_>>().join("_");
    let filtered: String = joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .collect();
    let trimmed = filtered.trim_matches(|c: char| c == '.' || c == '_');

    match trimmed.is_empty() {
        true => None,
        false => Some(trimmed.to_owned()),
    }
}

/// Run detection on an uploaded image and store it with its annotated version.
///
/// `filename` must already be sanitized. Nothing is written unless detection and encoding
/// succeeded.
pub fn process_upload(
    detector: &dyn Detector,
    data: &[u8],
    filename: &str,
    upload_dir: &Path,
    min_confidence: f32,
    jpeg_quality: u8,
) -> Result<UploadOutcome, UploadError> {
    let format =
        output_format_for(filename, jpeg_quality).ok_or(UploadError::UnsupportedFormat)?;

    let image = image::load_from_memory(data)?.to_rgb8();
    let detections = detector.detect(&image, min_confidence)?;
    log::info!("Found {} objects in {}", detections.len(), filename);

    let annotated = encode_as(&annotate(&image, &detections), format)?;
    let detected_filename = format!("{DETECTED_PREFIX}{filename}");

    store_artifacts(
        upload_dir,
        &[
            (filename, data),
            (detected_filename.as_str(), annotated.as_slice()),
        ],
    )?;

    Ok(UploadOutcome {
        filename: filename.to_owned(),
        detected_filename,
        detections,
    })
}

/// Write all files or none.
///
/// Each file is written to a temporary file of its own in `dir`, then all are moved in place
/// together. If any file fails, the files already moved by this call are removed again.
fn store_artifacts(dir: &Path, files: &[(&str, &[u8])]) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;

    let res = write_temporaries(dir, files).and_then(|written| {
        // The lock guards no data, a poisoned one is as good as a healthy one
        let _guard = PUBLISH.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        persist_all(dir, written)
    });

    if let Err(e) = &res {
        log::error!("Storing upload in {} failed: {e}", dir.display());
    }
    res
}

/// Temporary files are deleted when dropped, so a failure here leaves no trace.
fn write_temporaries<'a>(
    dir: &Path,
    files: &[(&'a str, &[u8])],
) -> std::io::Result<Vec<(&'a str, NamedTempFile)>> {
    files
        .iter()
        .map(|(name, data)| {
            let mut file = NamedTempFile::new_in(dir)?;
            file.write_all(data)?;
            file.as_file().sync_all()?;
            Ok((*name, file))
        })
        .collect()
}

fn persist_all(dir: &Path, written: Vec<(&str, NamedTempFile)>) -> std::io::Result<()> {
    let mut stored: Vec<PathBuf> = Vec::with_capacity(written.len());
    for (name, file) in written {
        let target = dir.join(name);
        if let Err(e) = file.persist(&target) {
            for path in stored {
                std::fs::remove_file(path).ok();
            }
            return Err(e.into());
        }
        stored.push(target);
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use std::io::Cursor;

    use image::{DynamicImage, ImageOutputFormat, Rgb, RgbImage};

    use super::*;
    use crate::nn::BBox;

    /// Finds a single person in the middle of every image.
    struct OnePerson;

    impl Detector for OnePerson {
        fn detect(&self, image: &RgbImage, _: f32) -> Result<Vec<Detection>, InferenceError> {
            if image.width() == 0 || image.height() == 0 {
                return Err(InferenceError::EmptyImage);
            }
            let bbox = BBox {
                x1: 0.3,
                y1: 0.2,
                x2: 0.7,
                y2: 0.9,
            };
            Ok(vec![Detection::new(bbox, 0, 0.91)])
        }
    }

    struct NoObjects;

    impl Detector for NoObjects {
        fn detect(&self, _: &RgbImage, _: f32) -> Result<Vec<Detection>, InferenceError> {
            Ok(vec![])
        }
    }

    struct Broken;

    impl Detector for Broken {
        fn detect(&self, _: &RgbImage, _: f32) -> Result<Vec<Detection>, InferenceError> {
            Err(InferenceError::Run(anyhow::anyhow!("no model")))
        }
    }

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let image = RgbImage::from_pixel(width, height, Rgb([90, 120, 150]));
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(image)
            .write_to(&mut buf, ImageOutputFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    fn dir_entries(dir: &Path) -> Vec<String> {
        match std::fs::read_dir(dir) {
            Err(_) => vec![],
            Ok(entries) => {
                let mut names: Vec<String> = entries
                    .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                    .collect();
                names.sort();
                names
            }
        }
    }

    #[test]
    fn sanitizes_file_names() {
        assert_eq!(
            secure_filename("My cool movie.mov").as_deref(),
            Some("My_cool_movie.mov")
        );
        assert_eq!(
            secure_filename("../../../etc/passwd").as_deref(),
            Some("etc_passwd")
        );
        assert_eq!(
            secure_filename("C:\\Users\\me\\photo (1).jpg").as_deref(),
            Some("C_Users_me_photo_1.jpg")
        );
        assert_eq!(secure_filename("säge.png").as_deref(), Some("sage.png"));
        assert_eq!(
            secure_filename("naïve café.JPG").as_deref(),
            Some("naive_cafe.JPG")
        );
        assert_eq!(secure_filename(".hidden.png").as_deref(), Some("hidden.png"));
        assert_eq!(secure_filename(""), None);
        assert_eq!(secure_filename("../.."), None);
        assert_eq!(secure_filename("日本"), None);
    }

    #[test]
    fn upload_stores_original_and_annotated_image() {
        let dir = tempfile::tempdir().unwrap();
        let upload_dir = dir.path().join("uploads");
        let data = png_bytes(640, 480);

        let outcome = process_upload(&OnePerson, &data, "street.png", &upload_dir, 0.4, 80).unwrap();

        assert_eq!(outcome.filename, "street.png");
        assert_eq!(outcome.detected_filename, "detected_street.png");
        assert_eq!(outcome.detections.len(), 1);
        assert_eq!(outcome.detections[0].label, "person");

        assert_eq!(std::fs::read(upload_dir.join("street.png")).unwrap(), data);
        let annotated = image::open(upload_dir.join("detected_street.png")).unwrap();
        assert_eq!((annotated.width(), annotated.height()), (640, 480));
        assert_ne!(annotated.to_rgb8(), image::load_from_memory(&data).unwrap().to_rgb8());
        assert_eq!(
            dir_entries(&upload_dir),
            vec!["detected_street.png", "street.png"]
        );
    }

    #[test]
    fn annotated_image_keeps_upload_format() {
        let dir = tempfile::tempdir().unwrap();

        for (name, format) in [
            ("anim.gif", image::ImageFormat::Gif),
            ("scan.tiff", image::ImageFormat::Tiff),
            ("old.bmp", image::ImageFormat::Bmp),
        ] {
            let outcome = process_upload(&OnePerson, &png_bytes(64, 48), name, dir.path(), 0.4, 80)
                .unwrap();

            let annotated = std::fs::read(dir.path().join(&outcome.detected_filename)).unwrap();
            assert_eq!(image::guess_format(&annotated).unwrap(), format);
            let annotated = image::load_from_memory(&annotated).unwrap();
            assert_eq!((annotated.width(), annotated.height()), (64, 48));
        }
    }

    #[test]
    fn concurrent_uploads_of_one_name_store_a_matching_pair() {
        let dir = tempfile::tempdir().unwrap();
        let upload_dir = dir.path();

        std::thread::scope(|scope| {
            for thread in 0..8u8 {
                scope.spawn(move || {
                    for round in 0..25u8 {
                        let shade = thread.wrapping_mul(31).wrapping_add(round);
                        let image = RgbImage::from_pixel(16, 16, Rgb([shade, 0, 255 - shade]));
                        let mut buf = Cursor::new(Vec::new());
                        DynamicImage::ImageRgb8(image)
                            .write_to(&mut buf, ImageOutputFormat::Png)
                            .unwrap();

                        process_upload(&NoObjects, buf.get_ref(), "same.png", upload_dir, 0.4, 80)
                            .unwrap();
                    }
                });
            }
        });

        assert_eq!(dir_entries(upload_dir), vec!["detected_same.png", "same.png"]);
        // Without detections the annotated image is a lossless copy of the original
        let original = image::open(upload_dir.join("same.png")).unwrap().to_rgb8();
        let annotated = image::open(upload_dir.join("detected_same.png"))
            .unwrap()
            .to_rgb8();
        assert_eq!(original, annotated);
    }

    #[test]
    fn failed_detection_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let res = process_upload(&Broken, &png_bytes(8, 8), "a.png", dir.path(), 0.4, 80);

        assert!(matches!(res, Err(UploadError::Detection(_))));
        assert!(dir_entries(dir.path()).is_empty());
    }

    #[test]
    fn unreadable_and_unsupported_uploads_write_nothing() {
        let dir = tempfile::tempdir().unwrap();

        let res = process_upload(&OnePerson, b"not an image", "a.png", dir.path(), 0.4, 80);
        assert!(matches!(res, Err(UploadError::UnreadableImage(_))));

        for name in ["a.txt", "noext"] {
            let res = process_upload(&OnePerson, &png_bytes(8, 8), name, dir.path(), 0.4, 80);
            assert!(matches!(res, Err(UploadError::UnsupportedFormat)));
        }

        assert!(dir_entries(dir.path()).is_empty());
    }

    #[test]
    fn partially_stored_upload_is_rolled_back() {
        let dir = tempfile::tempdir().unwrap();
        // A directory in the way of the annotated file makes the second rename fail
        std::fs::create_dir(dir.path().join("detected_a.png")).unwrap();

        let res = process_upload(&OnePerson, &png_bytes(8, 8), "a.png", dir.path(), 0.4, 80);

        assert!(matches!(res, Err(UploadError::Storage(_))));
        assert_eq!(dir_entries(dir.path()), vec!["detected_a.png"]);
    }

    #[test]
    fn errors_map_to_flash_messages() {
        assert_eq!(UploadError::NoSelectedFile.flash(), Flash::NoSelectedFile);
        assert_eq!(UploadError::ModelUnavailable.flash(), Flash::ModelUnavailable);
        assert_eq!(
            UploadError::Detection(InferenceError::EmptyImage).flash(),
            Flash::ProcessingFailed
        );
    }
}
