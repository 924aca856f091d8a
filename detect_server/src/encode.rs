//! Still image encoding and multipart stream framing.
use std::io::Cursor;
use std::path::Path;

use bytes::Bytes;
use image::{
    codecs::{jpeg::JpegEncoder, png::PngEncoder},
    ColorType, DynamicImage, ImageEncoder, ImageFormat, ImageOutputFormat, RgbImage,
};

use crate::error::EncodeError;

/// Content type of the multipart stream response.
pub const STREAM_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// Default JPEG quality of streamed and uploaded images.
pub const DEFAULT_JPEG_QUALITY: u8 = 80;

/// Still image format to encode stream frames into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StillFormat {
    Jpeg { quality: u8 },
    Png,
}

impl Default for StillFormat {
    fn default() -> Self {
        StillFormat::Jpeg {
            quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

impl StillFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            StillFormat::Jpeg { .. } => "image/jpeg",
            StillFormat::Png => "image/png",
        }
    }
}

/// Output format matching the extension of `path`.
///
/// `None` if the extension is unknown or `image` has no encoder for it. JPEG is written with
/// `jpeg_quality`.
pub fn output_format_for(path: impl AsRef<Path>, jpeg_quality: u8) -> Option<ImageOutputFormat> {
    let format = ImageFormat::from_path(path).ok()?;
    match ImageOutputFormat::from(format) {
        ImageOutputFormat::Unsupported(_) => None,
        ImageOutputFormat::Jpeg(_) => Some(ImageOutputFormat::Jpeg(jpeg_quality)),
        output => Some(output),
    }
}

/// Compress a frame into a still image.
pub fn encode(frame: &RgbImage, format: StillFormat) -> Result<Vec<u8>, EncodeError> {
    let (width, height) = frame.dimensions();
    if width == 0 || height == 0 {
        return Err(EncodeError::EmptyFrame);
    }

    let mut buf = Cursor::new(Vec::new());
    match format {
        StillFormat::Jpeg { quality } => {
            JpegEncoder::new_with_quality(&mut buf, quality).encode(
                frame,
                width,
                height,
                ColorType::Rgb8,
            )?;
        }
        StillFormat::Png => {
            PngEncoder::new(&mut buf).write_image(frame, width, height, ColorType::Rgb8)?;
        }
    }

    Ok(buf.into_inner())
}

/// Compress an image into any format `image` can write, see `output_format_for`.
pub fn encode_as(image: &RgbImage, format: ImageOutputFormat) -> Result<Vec<u8>, EncodeError> {
    if image.width() == 0 || image.height() == 0 {
        return Err(EncodeError::EmptyFrame);
    }

    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image.clone()).write_to(&mut buf, format)?;

    Ok(buf.into_inner())
}

/// Wrap an encoded image into one part of the multipart stream.
pub fn multipart_chunk(data: &[u8], format: StillFormat) -> Bytes {
    Bytes::from(
        [
            "--frame\r\nContent-Type: ".as_bytes(),
            format.mime_type().as_bytes(),
            "\r\n\r\n".as_bytes(),
            data,
            "\r\n".as_bytes(),
        ]
        .concat(),
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn jpeg_round_trip_keeps_dimensions() {
        let frame = RgbImage::from_pixel(32, 24, image::Rgb([200, 100, 50]));
        let data = encode(&frame, StillFormat::default()).unwrap();

        assert_eq!(&data[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&data).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 24));
    }

    #[test]
    fn png_is_lossless() {
        let frame = RgbImage::from_fn(5, 3, |x, y| image::Rgb([x as u8, y as u8, 7]));
        let data = encode(&frame, StillFormat::Png).unwrap();
        assert_eq!(image::load_from_memory(&data).unwrap().to_rgb8(), frame);
    }

    #[test]
    fn empty_frame_is_rejected() {
        let res = encode(&RgbImage::new(0, 4), StillFormat::default());
        assert!(matches!(res, Err(EncodeError::EmptyFrame)));
    }

    #[test]
    fn chunk_framing() {
        let chunk = multipart_chunk(b"JPEGDATA", StillFormat::default());
        assert_eq!(
            &chunk[..],
            b"--frame\r\nContent-Type: image/jpeg\r\n\r\nJPEGDATA\r\n"
        );
    }

    #[test]
    fn output_formats_from_file_names() {
        assert_eq!(
            output_format_for("a.JPG", 90),
            Some(ImageOutputFormat::Jpeg(90))
        );
        assert_eq!(output_format_for("a.png", 90), Some(ImageOutputFormat::Png));
        assert_eq!(output_format_for("a.bmp", 90), Some(ImageOutputFormat::Bmp));
        assert_eq!(output_format_for("a.gif", 90), Some(ImageOutputFormat::Gif));
        assert_eq!(output_format_for("a.tiff", 90), Some(ImageOutputFormat::Tiff));
        assert_eq!(output_format_for("a.tif", 90), Some(ImageOutputFormat::Tiff));
        assert_eq!(output_format_for("a.txt", 90), None);
        assert_eq!(output_format_for("noext", 90), None);
    }

    #[test]
    fn gif_and_tiff_keep_dimensions() {
        let frame = RgbImage::from_pixel(12, 7, image::Rgb([10, 200, 30]));
        for (format, expected) in [
            (ImageOutputFormat::Gif, ImageFormat::Gif),
            (ImageOutputFormat::Tiff, ImageFormat::Tiff),
        ] {
            let data = encode_as(&frame, format).unwrap();
            assert_eq!(image::guess_format(&data).unwrap(), expected);
            let decoded = image::load_from_memory(&data).unwrap();
            assert_eq!((decoded.width(), decoded.height()), (12, 7));
        }
        assert!(matches!(
            encode_as(&RgbImage::new(3, 0), ImageOutputFormat::Png),
            Err(EncodeError::EmptyFrame)
        ));
    }
}
