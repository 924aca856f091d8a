//! Draw detections onto frames.
use image::{Rgb, RgbImage};
use imageproc::{
    drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size},
    rect::Rect,
};
use lazy_static::lazy_static;
use rusttype::{Font, Scale};

use crate::nn::Detection;

const LABEL_SCALE: Scale = Scale { x: 16.0, y: 16.0 };
const LABEL_PADDING: i32 = 2;
const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);

/// Box colors, cycled by class index.
const PALETTE: [[u8; 3]; 20] = [
    [0xFF, 0x38, 0x38],
    [0xFF, 0x9D, 0x97],
    [0xFF, 0x70, 0x1F],
    [0xFF, 0xB2, 0x1D],
    [0xCF, 0xD2, 0x31],
    [0x48, 0xF9, 0x0A],
    [0x92, 0xCC, 0x17],
    [0x3D, 0xDB, 0x86],
    [0x1A, 0x93, 0x34],
    [0x00, 0xD4, 0xBB],
    [0x2C, 0x99, 0xA8],
    [0x00, 0xC2, 0xFF],
    [0x34, 0x45, 0x93],
    [0x64, 0x73, 0xFF],
    [0x00, 0x18, 0xEC],
    [0x84, 0x38, 0xFF],
    [0x52, 0x00, 0x85],
    [0xCB, 0x38, 0xFF],
    [0xFF, 0x95, 0xC8],
    [0xFF, 0x37, 0xC7],
];

lazy_static! {
    static ref DEJAVU_MONO: Font<'static> = {
        let font_data: &[u8] = include_bytes!("../../resources/DejaVuSansMono.ttf");
        Font::try_from_bytes(font_data).expect("failed to load font")
    };
}

/// Text shown next to a detection box.
pub fn label_text(detection: &Detection) -> String {
    format!("{} {:.2}", detection.label, detection.confidence)
}

fn class_color(class_id: usize) -> Rgb<u8> {
    Rgb(PALETTE[class_id % PALETTE.len()])
}

/// Draw bounding boxes with labels and confidence scores on a copy of the image.
pub fn annotate(image: &RgbImage, detections: &[Detection]) -> RgbImage {
    let mut frame = image.clone();
    let (width, height) = frame.dimensions();
    if width == 0 || height == 0 {
        return frame;
    }

    for detection in detections {
        let color = class_color(detection.class_id);
        let (x, y, rect_width, rect_height) = detection.bbox.to_pixels(width, height);

        // Two pixel wide outline
        draw_hollow_rect_mut(&mut frame, Rect::at(x, y).of_size(rect_width, rect_height), color);
        if rect_width > 2 && rect_height > 2 {
            let inner = Rect::at(x + 1, y + 1).of_size(rect_width - 2, rect_height - 2);
            draw_hollow_rect_mut(&mut frame, inner, color);
        }

        draw_label(&mut frame, &label_text(detection), x, y, color);
    }

    frame
}

/// Draw the label on a filled background, above the box if there is room, else inside it.
fn draw_label(frame: &mut RgbImage, text: &str, x: i32, y: i32, color: Rgb<u8>) {
    let (text_width, text_height) = text_size(LABEL_SCALE, &DEJAVU_MONO, text);
    let box_width = (text_width + 2 * LABEL_PADDING).max(1);
    let box_height = (text_height + 2 * LABEL_PADDING).max(1);

    let label_y = if y >= box_height { y - box_height } else { y };
    let label_rect = Rect::at(x, label_y).of_size(box_width as u32, box_height as u32);

    draw_filled_rect_mut(frame, label_rect, color);
    draw_text_mut(
        frame,
        TEXT_COLOR,
        x + LABEL_PADDING,
        label_y + LABEL_PADDING,
        LABEL_SCALE,
        &DEJAVU_MONO,
        text,
    );
}
