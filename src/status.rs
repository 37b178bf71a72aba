//! Periodic station status
//!
//! A ticker samples the connection and playback state on a fixed period,
//! publishes the result on a watch channel for the presentation layer, and
//! warns once when a connected sensor goes quiet for too long.

use std::fmt;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, trace, warn};

use crate::catalog::Track;
use crate::connection::{ConnectionManager, ConnectionState};
use crate::dispatcher::Dispatcher;
use crate::playback::PlaybackController;

/// Everything the operator display shows
#[derive(Debug, Clone, PartialEq)]
pub struct StationStatus {
    pub state: ConnectionState,
    pub port: String,
    /// `None` = never
    pub since_last_handshake: Option<Duration>,
    pub stale: bool,
    pub last_reading: Option<f64>,
    pub now_playing: Option<Track>,
}

impl StationStatus {
    pub fn disconnected() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            port: String::new(),
            since_last_handshake: None,
            stale: false,
            last_reading: None,
            now_playing: None,
        }
    }
}

impl fmt::Display for StationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let port = if self.port.is_empty() { "-" } else { &self.port };
        write!(f, "{} [{}] last handshake: ", port, self.state)?;
        match self.since_last_handshake {
            Some(elapsed) => write!(f, "{}ms ago", elapsed.as_millis())?,
            None => f.write_str("never")?,
        }
        if self.stale {
            f.write_str(" (stale)")?;
        }
        if let Some(bpm) = self.last_reading {
            write!(f, " | last reading: {}BPM", bpm)?;
        }
        match &self.now_playing {
            Some(track) => write!(f, " | playing: {}", track),
            None => f.write_str(" | idle"),
        }
    }
}

/// Sources the ticker samples
#[derive(Clone)]
pub struct StatusSources {
    pub connection: ConnectionManager,
    pub dispatcher: Dispatcher,
    pub playback: PlaybackController,
}

impl StatusSources {
    pub fn sample(&self, stale_after: Duration) -> StationStatus {
        let snapshot = self.connection.snapshot();
        let since = snapshot.since_last_handshake();
        let stale = snapshot.state == ConnectionState::Connected
            && since.map(|d| d > stale_after).unwrap_or(false);

        StationStatus {
            state: snapshot.state,
            port: snapshot.port,
            since_last_handshake: since,
            stale,
            last_reading: self.dispatcher.last_reading().map(|r| r.value),
            now_playing: self.playback.active_track(),
        }
    }
}

/// Start the ticker; it stops when `cancel` fires
pub fn spawn_status_ticker(
    sources: StatusSources,
    period: Duration,
    stale_after: Duration,
    cancel: CancellationToken,
) -> (watch::Receiver<StationStatus>, JoinHandle<()>) {
    let (tx, rx) = watch::channel(sources.sample(stale_after));

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut was_stale = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let status = sources.sample(stale_after);
                    trace!("{}", status);

                    if status.stale && !was_stale {
                        warn!("⚠️  No data from {} for over {}ms", status.port, stale_after.as_millis());
                    } else if !status.stale && was_stale && status.state == ConnectionState::Connected {
                        info!("Data flowing again from {}", status.port);
                    }
                    was_stale = status.stale;

                    if tx.send(status).is_err() {
                        break;
                    }
                }
            }
        }
    });

    (rx, handle)
}
