//! HTML pages.
use crate::{annotate::label_text, nn::Detection, upload::UploadOutcome};

/// One-shot message shown on the index page after a redirect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flash {
    NoFilePart,
    NoSelectedFile,
    InvalidFile,
    ProcessingFailed,
    ModelUnavailable,
}

impl Flash {
    /// Query parameter value identifying the message.
    pub fn code(&self) -> &'static str {
        match self {
            Flash::NoFilePart => "no_file_part",
            Flash::NoSelectedFile => "no_selected_file",
            Flash::InvalidFile => "invalid_file",
            Flash::ProcessingFailed => "processing_failed",
            Flash::ModelUnavailable => "model_unavailable",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        [
            Flash::NoFilePart,
            Flash::NoSelectedFile,
            Flash::InvalidFile,
            Flash::ProcessingFailed,
            Flash::ModelUnavailable,
        ]
        .into_iter()
        .find(|flash| flash.code() == code)
    }

    pub fn message(&self) -> &'static str {
        match self {
            Flash::NoFilePart => "No file part",
            Flash::NoSelectedFile => "No selected file",
            Flash::InvalidFile => "Unsupported image format",
            Flash::ProcessingFailed => "Error processing file",
            Flash::ModelUnavailable => "The detection model is not loaded",
        }
    }

    /// Location of the index page showing this message.
    pub fn redirect_target(&self) -> String {
        format!("/?flash={}", self.code())
    }
}

fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn layout(title: &str, body: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>{title}</title>
</head>
<body>
<div class="container">
{body}
</div>
</body>
</html>
"#,
        title = escape(title),
    )
}

pub fn index_page(flash: Option<Flash>) -> String {
    let flash = flash
        .map(|flash| format!(r#"    <p class="flash">{}</p>"#, escape(flash.message())))
        .unwrap_or_default();

    layout(
        "Object Detection",
        &format!(
            r#"    <h3>Object Detection</h3>
{flash}
    <form action="/upload" method="post" enctype="multipart/form-data">
        <input type="file" name="file" accept="image/*">
        <input type="submit" value="Upload">
    </form>
    <p><a href="/webcam">Live webcam detection</a></p>"#
        ),
    )
}

pub fn webcam_page() -> String {
    layout(
        "Live Detection",
        r#"    <h3>Live Detection</h3>
    <img src="/video_feed" width="100%">
    <p><a href="/">Back</a></p>"#,
    )
}

fn detection_row(detection: &Detection) -> String {
    let bbox = &detection.bbox;
    format!(
        "        <tr><td>{}</td><td>{:.2}</td><td>{:.3}, {:.3}, {:.3}, {:.3}</td></tr>",
        escape(&label_text(detection)),
        detection.confidence,
        bbox.x1,
        bbox.y1,
        bbox.x2,
        bbox.y2
    )
}

/// Result of an upload with links to both stored images.
pub fn result_page(outcome: &UploadOutcome, uploads_url: &str) -> String {
    let uploaded = escape(&format!("{uploads_url}/{}", outcome.filename));
    let detected = escape(&format!("{uploads_url}/{}", outcome.detected_filename));

    let rows: Vec<String> = outcome.detections.iter().map(detection_row).collect();
    let detections = match rows.is_empty() {
        true => "    <p>No objects detected.</p>".to_owned(),
        false => format!(
            "    <table>\n        <tr><th>Object</th><th>Confidence</th><th>Box</th></tr>\n{}\n    </table>",
            rows.join("\n")
        ),
    };

    layout(
        "Detection Result",
        &format!(
            r#"    <h3>Detection Result</h3>
    <h4>Uploaded</h4>
    <img src="{uploaded}" width="45%">
    <h4>Detected</h4>
    <img src="{detected}" width="45%">
{detections}
    <p><a href="/">Upload another image</a></p>"#
        ),
    )
}
