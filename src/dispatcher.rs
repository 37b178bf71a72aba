//! Ordered decode + asynchronous track dispatch
//!
//! ```text
//!  listener ──chunks──▶ decode worker ──readings──▶ match worker ──▶ playback
//!            (bounded,   (one per        (unbounded,   (one per
//!             ordered)    connection,     hand-off)     process)
//!                         owns decoder)
//! ```
//!
//! Each connection gets its own decode worker fed by a bounded queue, so
//! chunks reach the decoder in read order and only that worker touches the
//! decode buffer. Readings are handed to a single process-wide match worker
//! through an unbounded channel; the decode worker never waits on track
//! selection or playback.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::catalog::Catalog;
use crate::decoder::{FrameDecoder, TempoReading};
use crate::playback::PlaybackController;
use crate::selector;

/// Default bound on queued, undecoded chunks per connection
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Entry point for byte chunks and manual readings
#[derive(Clone)]
pub struct Dispatcher {
    readings: mpsc::UnboundedSender<TempoReading>,
    last_reading: Arc<Mutex<Option<TempoReading>>>,
    queue_capacity: usize,
}

impl Dispatcher {
    /// Spawn the match worker and return the dispatcher feeding it
    ///
    /// The worker ends once every clone of the dispatcher and every
    /// attached decode worker is gone.
    pub fn spawn(
        catalog: Arc<Catalog>,
        playback: PlaybackController,
        queue_capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (readings_tx, readings_rx) = mpsc::unbounded_channel();
        let last_reading = Arc::new(Mutex::new(None));

        let worker = tokio::spawn(match_worker(
            readings_rx,
            catalog,
            playback,
            Arc::clone(&last_reading),
        ));

        let dispatcher = Self {
            readings: readings_tx,
            last_reading,
            queue_capacity: queue_capacity.max(1),
        };
        (dispatcher, worker)
    }

    /// Start a decode worker for a new connection
    ///
    /// Returns the sender the connection's listener pushes chunks into.
    /// The worker, and its decode buffer, go away when that sender drops.
    pub fn attach(&self, source: &str) -> mpsc::Sender<Vec<u8>> {
        let (chunks_tx, chunks_rx) = mpsc::channel(self.queue_capacity);
        tokio::spawn(decode_worker(
            chunks_rx,
            self.readings.clone(),
            source.to_string(),
        ));
        chunks_tx
    }

    /// Inject a reading as if it had been decoded
    pub fn submit(&self, reading: TempoReading) -> bool {
        self.readings.send(reading).is_ok()
    }

    /// Most recent reading seen by the match worker
    pub fn last_reading(&self) -> Option<TempoReading> {
        *self.last_reading.lock()
    }
}

async fn decode_worker(
    mut chunks: mpsc::Receiver<Vec<u8>>,
    readings: mpsc::UnboundedSender<TempoReading>,
    source: String,
) {
    let mut decoder = FrameDecoder::new();
    debug!("Decode worker for {} started", source);

    while let Some(chunk) = chunks.recv().await {
        decoder.feed(&chunk, |reading| {
            debug!("📈 {} BPM from {}", reading.value, source);
            let _ = readings.send(reading);
        });
    }

    debug!(
        "Decode worker for {} finished ({} frames, {} dropped)",
        source,
        decoder.frames_emitted(),
        decoder.frames_dropped()
    );
}

async fn match_worker(
    mut readings: mpsc::UnboundedReceiver<TempoReading>,
    catalog: Arc<Catalog>,
    playback: PlaybackController,
    last_reading: Arc<Mutex<Option<TempoReading>>>,
) {
    while let Some(reading) = readings.recv().await {
        *last_reading.lock() = Some(reading);
        dispatch_reading(&reading, &catalog, &playback);
    }
    debug!("Match worker finished");
}

fn dispatch_reading(reading: &TempoReading, catalog: &Catalog, playback: &PlaybackController) {
    info!("Attempting to play song that matches {}BPM", reading.value);

    match selector::select(reading.value, catalog.tracks()) {
        Some(track) => {
            debug!(
                "Selected {} (distance {:.2})",
                track,
                selector::harmonic_distance(reading.value, track.bpm)
            );
            playback.play(track.clone());
        }
        None => debug!("No track to play for {}BPM", reading.value),
    }
}
