//! Load of the video feed.
//!
//! Every running stream holds a `StreamTicket` for its lifetime and reports the frames it sent or
//! skipped through it. A background task logs the totals of all streams every few seconds.
use std::{
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    time::{Duration, Instant},
};

use tokio::{task::JoinHandle, time::interval};

const LOG_PERIOD: Duration = Duration::from_secs(2);

pub static METER: Meter = Meter::new();

pub struct Meter {
    open_streams: AtomicUsize,
    sent_frames: AtomicU64,
    skipped_frames: AtomicU64,
}

/// Counters of a meter since it was last read.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Load {
    pub open_streams: usize,
    pub sent_frames: u64,
    pub skipped_frames: u64,
}

impl Load {
    pub fn is_idle(&self) -> bool {
        self.open_streams == 0 && self.sent_frames == 0 && self.skipped_frames == 0
    }
}

impl Meter {
    pub const fn new() -> Meter {
        Meter {
            open_streams: AtomicUsize::new(0),
            sent_frames: AtomicU64::new(0),
            skipped_frames: AtomicU64::new(0),
        }
    }

    /// Register a running stream. It is counted until the ticket is dropped.
    pub fn open_stream(&self) -> StreamTicket<'_> {
        self.open_streams.fetch_add(1, Ordering::Relaxed);
        StreamTicket { meter: self }
    }

    /// Read the counters. Frame counts start over, open streams keep being counted.
    pub fn take(&self) -> Load {
        Load {
            open_streams: self.open_streams.load(Ordering::Relaxed),
            sent_frames: self.sent_frames.swap(0, Ordering::Relaxed),
            skipped_frames: self.skipped_frames.swap(0, Ordering::Relaxed),
        }
    }
}

/// Membership of one stream in a meter.
pub struct StreamTicket<'a> {
    meter: &'a Meter,
}

impl StreamTicket<'_> {
    pub fn frame_sent(&self) {
        self.meter.sent_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_skipped(&self) {
        self.meter.skipped_frames.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for StreamTicket<'_> {
    fn drop(&mut self) {
        self.meter.open_streams.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Log the load of the global meter periodically, staying quiet while no stream runs.
pub fn spawn_meter_logger() -> JoinHandle<()> {
    tokio::spawn(async {
        let mut log_interval = interval(LOG_PERIOD);
        log_interval.tick().await;
        let mut last = Instant::now();

        loop {
            log_interval.tick().await;
            let load = METER.take();
            let elapsed = last.elapsed().as_secs_f32();
            last = Instant::now();

            if load.is_idle() {
                continue;
            }
            log::info!(
                "{} open streams, sent {:.2} fps, skipped {:.2} fps",
                load.open_streams,
                load.sent_frames as f32 / elapsed,
                load.skipped_frames as f32 / elapsed
            );
        }
    })
}
