//! Stream publisher.
//!
//! One publisher serves one client of the video feed. It owns the frame source and moves through
//! the states `Starting -> Streaming -> Draining -> Closed`. Every frame is read, passed through
//! the detector, annotated, encoded and handed to a `ChunkSink` as one part of the multipart
//! stream. The source is released in `Draining`, whatever ended the stream.
//!
//! The loop blocks on the camera and on the sink, so it runs on a blocking thread and hands chunks
//! to the async response body over a channel of capacity one. A client that goes away closes the
//! channel, which ends the loop.
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::{
    annotate::annotate,
    encode::{encode, multipart_chunk, StillFormat},
    error::{EncodeError, InferenceError, SourceError},
    meter::{StreamTicket, METER},
    nn::Detector,
    sensors::FrameSource,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Starting,
    Streaming,
    Draining,
    Closed,
}

/// Why a stream stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndReason {
    EndOfStream,
    InferenceFailed,
    ClientDisconnected,
}

/// What to do when the detector fails on a frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum InferencePolicy {
    /// Close the stream.
    #[default]
    EndStream,
    /// Drop the frame and continue with the next one.
    SkipFrame,
}

#[derive(Clone, Debug)]
pub struct StreamSettings {
    pub min_confidence: f32,
    pub format: StillFormat,
    pub inference_policy: InferencePolicy,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            min_confidence: 0.4,
            format: StillFormat::default(),
            inference_policy: InferencePolicy::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamSummary {
    pub emitted: u64,
    pub skipped: u64,
    pub end: EndReason,
}

/// The receiving end of a stream is gone.
#[derive(Debug)]
pub struct Disconnected;

/// Consumer of multipart chunks.
pub trait ChunkSink {
    /// Deliver one chunk, blocking until the consumer accepted it.
    fn emit(&mut self, chunk: Bytes) -> Result<(), Disconnected>;

    /// Whether the consumer is known to be gone before the next chunk is produced.
    fn is_closed(&self) -> bool {
        false
    }
}

impl ChunkSink for Vec<Bytes> {
    fn emit(&mut self, chunk: Bytes) -> Result<(), Disconnected> {
        self.push(chunk);
        Ok(())
    }
}

/// Sink feeding the body of an HTTP response from a blocking thread.
pub struct ChannelSink(pub mpsc::Sender<Bytes>);

impl ChunkSink for ChannelSink {
    fn emit(&mut self, chunk: Bytes) -> Result<(), Disconnected> {
        self.0.blocking_send(chunk).map_err(|_| Disconnected)
    }

    fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

/// Result of one iteration of the streaming loop.
enum FrameOutcome {
    Chunk(Bytes),
    EndOfStream,
    InferenceFailed(InferenceError),
    EncodeFailed(EncodeError),
}

pub struct StreamPublisher<S: FrameSource> {
    source: Option<S>,
    ticket: Option<StreamTicket<'static>>,
    detector: Arc<dyn Detector>,
    settings: StreamSettings,
    state: StreamState,
    emitted: u64,
    skipped: u64,
}

impl<S: FrameSource> StreamPublisher<S> {
    /// Acquire the frame source. On failure the stream is closed before emitting anything.
    pub fn start<F>(
        open: F,
        detector: Arc<dyn Detector>,
        settings: StreamSettings,
    ) -> Result<Self, SourceError>
    where
        F: FnOnce() -> Result<S, SourceError>,
    {
        log::debug!("Stream starting");
        match open() {
            Ok(source) => {
                log::debug!("Stream source acquired");
                Ok(Self {
                    source: Some(source),
                    ticket: Some(METER.open_stream()),
                    detector,
                    settings,
                    state: StreamState::Streaming,
                    emitted: 0,
                    skipped: 0,
                })
            }
            Err(e) => {
                log::warn!("Stream closed on start: {e}");
                Err(e)
            }
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Stream frames into `sink` until the feed ends, inference fails or the sink disconnects.
    pub fn run(mut self, sink: &mut impl ChunkSink) -> StreamSummary {
        let end = loop {
            if sink.is_closed() {
                break EndReason::ClientDisconnected;
            }

            match self.next_outcome() {
                FrameOutcome::Chunk(chunk) => {
                    if sink.emit(chunk).is_err() {
                        break EndReason::ClientDisconnected;
                    }
                    self.emitted += 1;
                    if let Some(ticket) = &self.ticket {
                        ticket.frame_sent();
                    }
                }
                FrameOutcome::EndOfStream => break EndReason::EndOfStream,
                FrameOutcome::InferenceFailed(e) => match self.settings.inference_policy {
                    InferencePolicy::EndStream => {
                        log::error!("Error during detection, closing stream: {e}");
                        break EndReason::InferenceFailed;
                    }
                    InferencePolicy::SkipFrame => {
                        log::warn!("Error during detection, skipping frame: {e}");
                        self.skip();
                    }
                },
                FrameOutcome::EncodeFailed(e) => {
                    log::warn!("Error encoding frame, skipping it: {e}");
                    self.skip();
                }
            }
        };

        self.drain();

        StreamSummary {
            emitted: self.emitted,
            skipped: self.skipped,
            end,
        }
    }

    fn next_outcome(&mut self) -> FrameOutcome {
        let frame = match self.source.as_mut().and_then(|source| source.read_frame()) {
            Some(frame) => frame,
            None => return FrameOutcome::EndOfStream,
        };
        log::debug!("Frame read");

        let detections = match self
            .detector
            .detect(&frame, self.settings.min_confidence)
        {
            Ok(detections) => detections,
            Err(e) => return FrameOutcome::InferenceFailed(e),
        };
        log::debug!("Found {} objects in frame", detections.len());

        let annotated = annotate(&frame, &detections);
        match encode(&annotated, self.settings.format) {
            Ok(data) => FrameOutcome::Chunk(multipart_chunk(&data, self.settings.format)),
            Err(e) => FrameOutcome::EncodeFailed(e),
        }
    }

    fn skip(&mut self) {
        self.skipped += 1;
        if let Some(ticket) = &self.ticket {
            ticket.frame_skipped();
        }
    }

    fn drain(&mut self) {
        self.state = StreamState::Draining;
        if self.source.take().is_some() {
            log::debug!("Stream source released");
        }
        self.ticket = None;
        self.state = StreamState::Closed;
    }
}

impl<S: FrameSource> Drop for StreamPublisher<S> {
    fn drop(&mut self) {
        if self.state != StreamState::Closed {
            self.drain();
        }
    }
}

/// Start a publisher on a blocking thread.
///
/// Resolves once the source is acquired, with the receiving end of the chunk stream, or with the
/// error that closed the stream on start.
pub async fn spawn_publisher<S, F>(
    open: F,
    detector: Arc<dyn Detector>,
    settings: StreamSettings,
) -> Result<mpsc::Receiver<Bytes>, SourceError>
where
    S: FrameSource + 'static,
    F: FnOnce() -> Result<S, SourceError> + Send + 'static,
{
    let (started_tx, started_rx) = oneshot::channel();
    let (chunk_tx, chunk_rx) = mpsc::channel(1);

    tokio::task::spawn_blocking(move || {
        let publisher = match StreamPublisher::start(open, detector, settings) {
            Ok(publisher) => publisher,
            Err(e) => {
                started_tx.send(Err(e)).ok();
                return;
            }
        };
        if started_tx.send(Ok(())).is_err() {
            return;
        }

        let summary = publisher.run(&mut ChannelSink(chunk_tx));
        log::info!(
            "Stream closed ({:?}): {} frames sent, {} skipped",
            summary.end,
            summary.emitted,
            summary.skipped
        );
    });

    match started_rx.await {
        Ok(Ok(())) => Ok(chunk_rx),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(SourceError::unavailable(
            "stream",
            "publisher ended before acquiring a source",
        )),
    }
}
