//! Sensor connection lifecycle
//!
//! `Disconnected → Connecting → Connected → Disconnected`, driven by
//! [`ConnectionManager::request_connection`], [`ConnectionManager::close`]
//! and listener failure.
//!
//! Every request or close bumps the attempt id. Work belonging to an older
//! attempt (a slow open, a listener winding down) checks the id before it
//! touches state, so the newest attempt always owns the state machine no
//! matter in which order older attempts complete.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dispatcher::Dispatcher;
use crate::error::ConnectionError;
use crate::listener::{FrameListener, Liveness};
use crate::serial::{PortOpener, SerialSettings, SerialSource};

/// Connection state as seen by the presentation layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(label)
    }
}

/// Point-in-time view of the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub port: String,
    /// Last successful read (or connection establishment); `None` = never
    pub last_handshake: Option<Instant>,
    pub attempt: u64,
}

impl ConnectionSnapshot {
    pub fn since_last_handshake(&self) -> Option<Duration> {
        self.last_handshake.map(|at| at.elapsed())
    }
}

/// Callback invoked on every state transition
pub type StatusCallback = Arc<dyn Fn(&ConnectionSnapshot) + Send + Sync>;

struct Inner {
    state: ConnectionState,
    port: String,
    attempt: u64,
    cancel: Option<CancellationToken>,
}

/// Owns the connection state machine
///
/// Cheap to clone; clones share the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    opener: Arc<dyn PortOpener>,
    settings: SerialSettings,
    dispatcher: Dispatcher,
    inner: Arc<Mutex<Inner>>,
    liveness: Liveness,
    status_callbacks: Arc<RwLock<Vec<StatusCallback>>>,
}

impl ConnectionManager {
    pub fn new(opener: Arc<dyn PortOpener>, settings: SerialSettings, dispatcher: Dispatcher) -> Self {
        Self {
            opener,
            settings,
            dispatcher,
            inner: Arc::new(Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                port: String::new(),
                attempt: 0,
                cancel: None,
            })),
            liveness: Liveness::new(),
            status_callbacks: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Subscribe to state transitions
    pub fn subscribe_connection_status(&self, callback: StatusCallback) {
        self.status_callbacks.write().push(callback);
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        let inner = self.inner.lock();
        ConnectionSnapshot {
            state: inner.state,
            port: inner.port.clone(),
            last_handshake: self.liveness.last(),
            attempt: inner.attempt,
        }
    }

    /// Start connecting to `port` in the background
    ///
    /// Supersedes any attempt in flight and any open connection. Returns the
    /// new attempt id. Must be called from inside a Tokio runtime.
    pub fn request_connection(&self, port: impl Into<String>) -> u64 {
        let port = port.into();
        let cancel = CancellationToken::new();

        let attempt = {
            let mut inner = self.inner.lock();
            if let Some(previous) = inner.cancel.take() {
                debug!("Superseding attempt #{} on {}", inner.attempt, inner.port);
                previous.cancel();
            }
            inner.attempt += 1;
            inner.state = ConnectionState::Connecting;
            inner.port = port.clone();
            inner.cancel = Some(cancel.clone());
            inner.attempt
        };
        self.emit_status();

        let manager = self.clone();
        tokio::spawn(async move {
            manager.run_attempt(attempt, port, cancel).await;
        });

        attempt
    }

    /// Tear down the connection or abandon the attempt in flight
    ///
    /// Returns false if there was nothing to close.
    pub fn close(&self) -> bool {
        let closed = {
            let mut inner = self.inner.lock();
            let active = inner.state != ConnectionState::Disconnected;
            inner.attempt += 1;
            if let Some(cancel) = inner.cancel.take() {
                cancel.cancel();
            }
            inner.state = ConnectionState::Disconnected;
            active
        };

        if closed {
            info!("🔌 Connection closed");
            self.emit_status();
        }
        closed
    }

    async fn run_attempt(&self, attempt: u64, port: String, cancel: CancellationToken) {
        info!("🔌 Connecting to {} (attempt #{})", port, attempt);

        let source = match self.open(&port, &cancel).await {
            Some(Ok(source)) => source,
            Some(Err(e)) => {
                error!("Could not open port {}: {}", port, e);
                self.finish_attempt(attempt);
                return;
            }
            None => {
                debug!("Attempt #{} on {} abandoned", attempt, port);
                return;
            }
        };

        {
            let mut inner = self.inner.lock();
            if inner.attempt != attempt {
                debug!("Discarding late open of {} (attempt #{})", port, attempt);
                return;
            }
            inner.state = ConnectionState::Connected;
            self.liveness.touch();
        }
        info!("✅ Opened port {}", port);
        self.emit_status();

        let listener = FrameListener::new(
            port.clone(),
            source,
            self.dispatcher.attach(&port),
            self.liveness.clone(),
            cancel,
            self.settings.poll_interval,
        );

        match listener.spawn().await {
            Ok(Ok(())) => debug!("Listener on {} stopped", port),
            Ok(Err(e)) => warn!("⚠️  Lost connection to {}: {}", port, e),
            Err(e) => warn!("⚠️  Listener on {} aborted: {}", port, e),
        }
        self.finish_attempt(attempt);
    }

    /// Open the port on the blocking pool, racing cancellation and the deadline
    ///
    /// `None` when the attempt was cancelled. A blocking open that completes
    /// after that point has its port dropped unused.
    async fn open(
        &self,
        port: &str,
        cancel: &CancellationToken,
    ) -> Option<Result<Box<dyn SerialSource>, ConnectionError>> {
        let opener = Arc::clone(&self.opener);
        let settings = self.settings.clone();
        let port_name = port.to_string();
        let open = tokio::task::spawn_blocking(move || opener.open(&port_name, &settings));

        tokio::select! {
            _ = cancel.cancelled() => None,
            _ = tokio::time::sleep(self.settings.open_timeout) => {
                Some(Err(ConnectionError::OpenTimeout {
                    port: port.to_string(),
                    timeout_ms: self.settings.open_timeout.as_millis() as u64,
                }))
            }
            joined = open => Some(joined.unwrap_or_else(|e| {
                Err(ConnectionError::Open {
                    port: port.to_string(),
                    reason: e.to_string(),
                })
            })),
        }
    }

    fn finish_attempt(&self, attempt: u64) {
        let changed = {
            let mut inner = self.inner.lock();
            if inner.attempt != attempt || inner.state == ConnectionState::Disconnected {
                false
            } else {
                inner.state = ConnectionState::Disconnected;
                inner.cancel = None;
                true
            }
        };
        if changed {
            self.emit_status();
        }
    }

    fn emit_status(&self) {
        let snapshot = self.snapshot();
        for callback in self.status_callbacks.read().iter() {
            callback(&snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::playback::testing::{wait_for, RecordingBackend};
    use crate::playback::PlaybackController;
    use crate::serial::testing::{OpenPlan, ScriptedOpener, Step};
    use std::sync::mpsc as std_mpsc;

    fn setup(opener: ScriptedOpener) -> (ConnectionManager, Arc<ScriptedOpener>, Dispatcher) {
        let opener = Arc::new(opener);
        let playback = PlaybackController::new(Arc::new(RecordingBackend::default()));
        let (dispatcher, _) = Dispatcher::spawn(Arc::new(Catalog::new()), playback, 8);
        let settings = SerialSettings {
            poll_interval: Duration::from_millis(2),
            open_timeout: Duration::from_secs(2),
            ..Default::default()
        };
        let manager = ConnectionManager::new(opener.clone(), settings, dispatcher.clone());
        (manager, opener, dispatcher)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_successful_connection() {
        let (manager, _, dispatcher) = setup(ScriptedOpener::new(vec![OpenPlan::Ready(vec![
            Step::Data(b"s12".to_vec()),
            Step::Data(b"3e".to_vec()),
        ])]));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.snapshot().last_handshake.is_none());

        manager.request_connection("COM3");
        assert!(wait_for(|| manager.state() == ConnectionState::Connected).await);

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.port, "COM3");
        assert!(snapshot.since_last_handshake().is_some());

        assert!(wait_for(|| dispatcher.last_reading().map(|r| r.value) == Some(123.0)).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_open_failure_returns_to_disconnected() {
        let (manager, _, _) = setup(ScriptedOpener::new(vec![OpenPlan::Refuse]));

        manager.request_connection("COM9");
        assert!(wait_for(|| manager.state() == ConnectionState::Disconnected).await);
        assert!(manager.snapshot().last_handshake.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_listener_failure_disconnects() {
        let (manager, _, _) = setup(ScriptedOpener::new(vec![OpenPlan::Ready(vec![
            Step::Data(b"s90e".to_vec()),
            Step::Fail,
        ])]));

        let transitions = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&transitions);
        manager.subscribe_connection_status(Arc::new(move |s: &ConnectionSnapshot| {
            seen.lock().push(s.state);
        }));

        manager.request_connection("COM3");
        assert!(wait_for(|| transitions.lock().len() == 3).await);
        assert_eq!(
            transitions.lock().as_slice(),
            &[
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnected
            ]
        );
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_late_result_of_superseded_attempt_is_discarded() {
        let (gate_tx, gate_rx) = std_mpsc::channel();
        let (manager, opener, _) = setup(ScriptedOpener::new(vec![
            OpenPlan::Gated(gate_rx, Vec::new()),
            OpenPlan::Refuse,
        ]));

        let first = manager.request_connection("COM1");
        // Let the first open start blocking before superseding it
        assert!(wait_for(|| manager.state() == ConnectionState::Connecting).await);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second = manager.request_connection("COM2");
        assert!(second > first);
        assert!(wait_for(|| manager.state() == ConnectionState::Disconnected).await);

        // The first open now completes successfully, but too late
        gate_tx.send(()).unwrap();
        assert!(wait_for(|| opener.opened.lock().contains(&"COM1".to_string())).await);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.state, ConnectionState::Disconnected);
        assert_eq!(snapshot.port, "COM2");
        assert_eq!(snapshot.attempt, second);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_open_timeout() {
        let (_gate_tx, gate_rx) = std_mpsc::channel::<()>();
        let opener = Arc::new(ScriptedOpener::new(vec![OpenPlan::Gated(gate_rx, Vec::new())]));
        let playback = PlaybackController::new(Arc::new(RecordingBackend::default()));
        let (dispatcher, _) = Dispatcher::spawn(Arc::new(Catalog::new()), playback, 8);
        let settings = SerialSettings {
            open_timeout: Duration::from_millis(30),
            ..Default::default()
        };
        let manager = ConnectionManager::new(opener, settings, dispatcher);

        manager.request_connection("COM5");
        assert_eq!(manager.state(), ConnectionState::Connecting);
        assert!(wait_for(|| manager.state() == ConnectionState::Disconnected).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_connected() {
        let (manager, _, _) = setup(ScriptedOpener::new(vec![OpenPlan::Ready(Vec::new())]));

        assert!(!manager.close());
        manager.request_connection("COM3");
        assert!(wait_for(|| manager.state() == ConnectionState::Connected).await);

        assert!(manager.close());
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        // The listener winding down must not flip anything back
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reconnect_replaces_active_connection() {
        let (manager, opener, _) = setup(ScriptedOpener::new(vec![
            OpenPlan::Ready(Vec::new()),
            OpenPlan::Ready(Vec::new()),
        ]));

        manager.request_connection("COM3");
        assert!(wait_for(|| manager.state() == ConnectionState::Connected).await);

        let second = manager.request_connection("COM4");
        assert!(wait_for(|| {
            let s = manager.snapshot();
            s.state == ConnectionState::Connected && s.port == "COM4"
        })
        .await);

        // The first listener's shutdown must not disconnect the second
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(manager.snapshot().attempt, second);
        assert_eq!(opener.opened.lock().len(), 2);
    }
}
