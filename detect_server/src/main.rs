//! Detection server binary.
//!
use std::{net::SocketAddr, path::PathBuf};

use anyhow::Result;
use clap::Parser;
use detect_server::{
    encode::{StillFormat, DEFAULT_JPEG_QUALITY},
    meter::spawn_meter_logger,
    publisher::{InferencePolicy, StreamSettings},
    routes::{app, AppState},
    sensors::CameraSpec,
    settings::Settings,
    utils::{default_model_path, load_detector},
};
use env_logger::TimestampPrecision;

#[derive(Parser, Debug)]
#[clap(author, version)]
struct Args {
    /// Address to serve HTTP on
    #[clap(long, default_value = "127.0.0.1:3000")]
    server_address: SocketAddr,

    /// YOLOv8 ONNX model file [default: <cache dir>/detect_server/yolov8n.onnx]
    #[clap(long)]
    model: Option<PathBuf>,

    /// URL to download the model from if the model file does not exist
    #[clap(long)]
    model_url: Option<String>,

    /// Side length of the square model input
    #[clap(long, default_value_t = 640)]
    input_size: u32,

    /// Minimum confidence of reported detections
    #[clap(long, default_value_t = 0.4)]
    confidence: f32,

    /// Maximum overlap of two detections of the same class
    #[clap(long, default_value_t = 0.45)]
    iou: f32,

    /// Index of the video device to stream from
    #[clap(long, default_value_t = 0)]
    camera: u32,

    /// Stream the images of this directory instead of a camera
    #[clap(long)]
    frames_dir: Option<PathBuf>,

    /// Directory served under /static, uploads are stored in its `uploads` subdirectory
    #[clap(long, default_value = "static")]
    static_dir: PathBuf,

    /// JPEG quality of streamed and annotated images
    #[clap(long, default_value_t = DEFAULT_JPEG_QUALITY)]
    jpeg_quality: u8,

    /// Maximum size of an upload in megabytes
    #[clap(long, default_value_t = 16)]
    max_upload_mb: usize,

    /// Skip frames the model fails on instead of closing the stream
    #[clap(long)]
    skip_failed_inference: bool,
}

impl From<Args> for Settings {
    fn from(args: Args) -> Self {
        let camera = match args.frames_dir {
            Some(dir) => CameraSpec::Folder(dir),
            None => CameraSpec::Device(args.camera),
        };
        let inference_policy = match args.skip_failed_inference {
            true => InferencePolicy::SkipFrame,
            false => InferencePolicy::EndStream,
        };

        Settings {
            server_address: args.server_address,
            model_path: args.model.unwrap_or_else(default_model_path),
            model_url: args.model_url,
            input_size: args.input_size,
            max_iou: args.iou,
            camera,
            static_dir: args.static_dir,
            jpeg_quality: args.jpeg_quality,
            max_upload_bytes: args.max_upload_mb.saturating_mul(1024 * 1024),
            stream: StreamSettings {
                min_confidence: args.confidence,
                format: StillFormat::Jpeg {
                    quality: args.jpeg_quality,
                },
                inference_policy,
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logger
    env_logger::builder()
        .format_timestamp(Some(TimestampPrecision::Millis))
        .init();

    let settings = Settings::from(args);

    // The server keeps serving pages without a model, detection endpoints report it missing
    let detector = match load_detector(&settings).await {
        Ok(detector) => Some(detector),
        Err(e) => {
            log::error!("Detection unavailable: {e}");
            None
        }
    };

    tokio::fs::create_dir_all(settings.upload_dir()).await?;

    spawn_meter_logger();

    let addr = settings.server_address;
    let router = app(AppState { detector, settings });

    // Serve HTTP server
    log::info!("Listening on http://{addr}");
    axum::Server::bind(&addr)
        .serve(router.into_make_service())
        .await?;

    Ok(())
}
