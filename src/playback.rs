//! Playback controller
//!
//! Owns the single active playback session. Starting a track requests a stop
//! of the previous session and immediately starts the new one on the blocking
//! pool; the old session's teardown may overlap the new session's startup.
//!
//! Sessions carry increasing ids. A session that ends (finished, failed or
//! stopped) only clears the active slot if it is still the current session.
//! A session also stops once every controller handle has been dropped.

use std::fs::File;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::Track;
use crate::error::PlaybackError;

/// How often a running session checks for a stop request
pub const DEFAULT_SESSION_POLL: Duration = Duration::from_millis(50);

/// Audio output seam
///
/// `acquire` runs on the session's own blocking thread, so implementations
/// may hold thread-bound output handles.
pub trait AudioBackend: Send + Sync + 'static {
    /// Open the track's resource and start it playing
    fn acquire(&self, track: &Track) -> Result<Box<dyn PlayingSound>, PlaybackError>;
}

/// A sound that has been started by a backend
pub trait PlayingSound {
    /// True once the resource has played to the end
    fn is_finished(&self) -> bool;

    /// Stop output and release the resource
    fn stop(&mut self);
}

struct Session {
    id: u64,
    track: Track,
    cancel: CancellationToken,
}

#[derive(Default)]
struct ActiveSlot {
    latest_id: u64,
    session: Option<Session>,
}

/// Starts and stops playback sessions, at most one active at a time
#[derive(Clone)]
pub struct PlaybackController {
    backend: Arc<dyn AudioBackend>,
    slot: Arc<Mutex<ActiveSlot>>,
    poll_interval: Duration,
}

impl PlaybackController {
    pub fn new(backend: Arc<dyn AudioBackend>) -> Self {
        Self::with_poll_interval(backend, DEFAULT_SESSION_POLL)
    }

    pub fn with_poll_interval(backend: Arc<dyn AudioBackend>, poll_interval: Duration) -> Self {
        Self {
            backend,
            slot: Arc::new(Mutex::new(ActiveSlot::default())),
            poll_interval,
        }
    }

    /// Play `track`, superseding whatever is playing
    ///
    /// Returns immediately with the new session id. Must be called from
    /// inside a Tokio runtime.
    pub fn play(&self, track: Track) -> u64 {
        let cancel = CancellationToken::new();
        let id = {
            let mut slot = self.slot.lock();
            if let Some(previous) = slot.session.take() {
                debug!("⏹ Requesting stop of session #{} ({})", previous.id, previous.track);
                previous.cancel.cancel();
            }
            slot.latest_id += 1;
            let id = slot.latest_id;
            slot.session = Some(Session {
                id,
                track: track.clone(),
                cancel: cancel.clone(),
            });
            id
        };

        let backend = Arc::clone(&self.backend);
        let owner = Arc::downgrade(&self.slot);
        let poll_interval = self.poll_interval;

        tokio::task::spawn_blocking(move || {
            run_session(backend.as_ref(), &track, &cancel, &owner, poll_interval, id);
            if let Some(slot) = owner.upgrade() {
                Self::release(&slot, id);
            }
        });

        id
    }

    /// Stop the active session, if any
    pub fn stop(&self) -> bool {
        match self.slot.lock().session.take() {
            Some(session) => {
                info!("⏹ Stopping {}", session.track);
                session.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Track of the active session
    pub fn active_track(&self) -> Option<Track> {
        self.slot.lock().session.as_ref().map(|s| s.track.clone())
    }

    /// Id of the active session
    pub fn active_session(&self) -> Option<u64> {
        self.slot.lock().session.as_ref().map(|s| s.id)
    }

    fn release(slot: &Mutex<ActiveSlot>, id: u64) {
        let mut slot = slot.lock();
        if slot.session.as_ref().map(|s| s.id) == Some(id) {
            slot.session = None;
            debug!("Session #{} released", id);
        }
    }
}

fn run_session(
    backend: &dyn AudioBackend,
    track: &Track,
    cancel: &CancellationToken,
    owner: &Weak<Mutex<ActiveSlot>>,
    poll_interval: Duration,
    id: u64,
) {
    if cancel.is_cancelled() {
        debug!("Session #{} superseded before start", id);
        return;
    }

    let mut sound = match backend.acquire(track) {
        Ok(sound) => sound,
        Err(e) => {
            warn!("Playback of {} failed: {}", track, e);
            return;
        }
    };

    info!("🎵 Now playing: {}", track);

    loop {
        if cancel.is_cancelled() || owner.strong_count() == 0 {
            sound.stop();
            debug!("Session #{} stopped", id);
            return;
        }
        if sound.is_finished() {
            info!("Finished: {}", track);
            return;
        }
        std::thread::sleep(poll_interval);
    }
}

/// Backend used when the crate is built without audio output
///
/// Verifies the resource can be opened, then holds the session silently
/// until it is stopped.
#[derive(Debug, Default)]
pub struct SilentBackend;

struct SilentSound {
    _file: File,
}

impl AudioBackend for SilentBackend {
    fn acquire(&self, track: &Track) -> Result<Box<dyn PlayingSound>, PlaybackError> {
        let file = File::open(&track.path).map_err(|source| PlaybackError::Open {
            path: track.path.clone(),
            source,
        })?;
        debug!("Audio output disabled, holding {} silently", track.path.display());
        Ok(Box::new(SilentSound { _file: file }))
    }
}

impl PlayingSound for SilentSound {
    fn is_finished(&self) -> bool {
        false
    }

    fn stop(&mut self) {}
}

#[cfg(feature = "audio")]
pub use rodio_backend::RodioBackend;

#[cfg(feature = "audio")]
mod rodio_backend {
    use std::fs::File;
    use std::io::BufReader;

    use rodio::{Decoder, OutputStream, Sink};

    use super::{AudioBackend, PlayingSound};
    use crate::catalog::Track;
    use crate::error::PlaybackError;

    /// System audio output through rodio
    #[derive(Debug, Default)]
    pub struct RodioBackend;

    struct RodioSound {
        // Output stops when the stream is dropped
        _stream: OutputStream,
        sink: Sink,
    }

    impl AudioBackend for RodioBackend {
        fn acquire(&self, track: &Track) -> Result<Box<dyn PlayingSound>, PlaybackError> {
            let file = File::open(&track.path).map_err(|source| PlaybackError::Open {
                path: track.path.clone(),
                source,
            })?;
            let source = Decoder::new(BufReader::new(file)).map_err(|e| PlaybackError::Decode {
                path: track.path.clone(),
                reason: e.to_string(),
            })?;

            let (stream, handle) =
                OutputStream::try_default().map_err(|e| PlaybackError::Output(e.to_string()))?;
            let sink = Sink::try_new(&handle).map_err(|e| PlaybackError::Output(e.to_string()))?;
            sink.append(source);

            Ok(Box::new(RodioSound {
                _stream: stream,
                sink,
            }))
        }
    }

    impl PlayingSound for RodioSound {
        fn is_finished(&self) -> bool {
            self.sink.empty()
        }

        fn stop(&mut self) {
            self.sink.stop();
        }
    }
}

/// Backend for the current build: rodio with the `audio` feature, silent otherwise
pub fn default_backend() -> Arc<dyn AudioBackend> {
    #[cfg(feature = "audio")]
    {
        Arc::new(RodioBackend)
    }
    #[cfg(not(feature = "audio"))]
    {
        Arc::new(SilentBackend)
    }
}
