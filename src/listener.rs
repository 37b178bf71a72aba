//! Serial read loop
//!
//! One listener per open connection. It runs on the blocking pool, polls the
//! port every `poll_interval` when nothing is waiting, and pushes each chunk
//! it reads into the connection's ordered decode queue. Shutdown is
//! cooperative: the cancellation token is checked at the top of every
//! iteration, so a close may take up to one poll interval to land.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::ConnectionError;
use crate::serial::SerialSource;

/// Largest chunk taken from the port in one read
pub const READ_BUFFER_SIZE: usize = 1024;

/// Timestamp of the most recent successful read
#[derive(Debug, Clone, Default)]
pub struct Liveness(Arc<Mutex<Option<Instant>>>);

impl Liveness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn touch(&self) {
        *self.0.lock() = Some(Instant::now());
    }

    /// `None` means no handshake has ever happened
    pub fn last(&self) -> Option<Instant> {
        *self.0.lock()
    }

    pub fn since(&self) -> Option<Duration> {
        self.last().map(|at| at.elapsed())
    }
}

/// Reads one open port until cancelled or the port fails
pub struct FrameListener {
    port: String,
    source: Box<dyn SerialSource>,
    chunks: mpsc::Sender<Vec<u8>>,
    liveness: Liveness,
    cancel: CancellationToken,
    poll_interval: Duration,
}

impl FrameListener {
    pub fn new(
        port: String,
        source: Box<dyn SerialSource>,
        chunks: mpsc::Sender<Vec<u8>>,
        liveness: Liveness,
        cancel: CancellationToken,
        poll_interval: Duration,
    ) -> Self {
        Self {
            port,
            source,
            chunks,
            liveness,
            cancel,
            poll_interval,
        }
    }

    /// Run the read loop on the blocking pool
    pub fn spawn(self) -> JoinHandle<Result<(), ConnectionError>> {
        tokio::task::spawn_blocking(move || self.run())
    }

    /// Blocking read loop
    ///
    /// `Ok` on cancellation, `Err` when the port fails or the decode queue
    /// has gone away.
    pub fn run(mut self) -> Result<(), ConnectionError> {
        debug!("👂 Listening on {}", self.port);
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let mut total: u64 = 0;

        loop {
            if self.cancel.is_cancelled() {
                debug!("Listener on {} cancelled after {} bytes", self.port, total);
                return Ok(());
            }
            if self.chunks.is_closed() {
                return Err(ConnectionError::DispatchClosed);
            }

            let available = self.source.bytes_available().map_err(|source| {
                ConnectionError::Read {
                    port: self.port.clone(),
                    source,
                }
            })?;
            if available == 0 {
                std::thread::sleep(self.poll_interval);
                continue;
            }

            let want = available.min(buf.len());
            let read = self
                .source
                .read_available(&mut buf[..want])
                .map_err(|source| ConnectionError::Read {
                    port: self.port.clone(),
                    source,
                })?;
            if read == 0 {
                std::thread::sleep(self.poll_interval);
                continue;
            }

            total += read as u64;
            self.liveness.touch();
            trace!("Read {} bytes from {}", read, self.port);

            self.chunks
                .blocking_send(buf[..read].to_vec())
                .map_err(|_| ConnectionError::DispatchClosed)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::testing::{ScriptedSource, Step};

    fn listener(
        steps: Vec<Step>,
        cancel: CancellationToken,
    ) -> (FrameListener, mpsc::Receiver<Vec<u8>>, Liveness) {
        let (tx, rx) = mpsc::channel(16);
        let liveness = Liveness::new();
        let listener = FrameListener::new(
            "TEST".to_string(),
            Box::new(ScriptedSource::new(steps)),
            tx,
            liveness.clone(),
            cancel,
            Duration::from_millis(2),
        );
        (listener, rx, liveness)
    }

    #[tokio::test]
    async fn test_chunks_arrive_in_order_and_touch_liveness() {
        let cancel = CancellationToken::new();
        let (listener, mut rx, liveness) = listener(
            vec![
                Step::Data(b"s1".to_vec()),
                Step::Data(b"2".to_vec()),
                Step::Data(b"3e".to_vec()),
            ],
            cancel.clone(),
        );
        assert!(liveness.last().is_none());

        let handle = listener.spawn();
        assert_eq!(rx.recv().await.unwrap(), b"s1".to_vec());
        assert_eq!(rx.recv().await.unwrap(), b"2".to_vec());
        assert_eq!(rx.recv().await.unwrap(), b"3e".to_vec());
        assert!(liveness.last().is_some());

        cancel.cancel();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_read_failure_ends_loop_with_error() {
        let (listener, mut rx, _) = listener(
            vec![Step::Data(b"s60e".to_vec()), Step::Fail],
            CancellationToken::new(),
        );

        let result = listener.spawn().await.unwrap();
        assert!(matches!(result, Err(ConnectionError::Read { .. })));
        assert_eq!(rx.recv().await.unwrap(), b"s60e".to_vec());
    }

    #[tokio::test]
    async fn test_closed_queue_ends_loop() {
        let (listener, rx, _) = listener(
            vec![Step::Data(b"s60e".to_vec())],
            CancellationToken::new(),
        );
        drop(rx);

        let result = listener.spawn().await.unwrap();
        assert!(matches!(result, Err(ConnectionError::DispatchClosed)));
    }

    #[tokio::test]
    async fn test_idle_listener_ends_when_queue_closes() {
        let (listener, rx, _) = listener(Vec::new(), CancellationToken::new());
        let handle = listener.spawn();

        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(rx);
        assert!(matches!(
            handle.await.unwrap(),
            Err(ConnectionError::DispatchClosed)
        ));
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (listener, _rx, liveness) = listener(vec![Step::Data(b"s60e".to_vec())], cancel);

        assert!(listener.spawn().await.unwrap().is_ok());
        assert!(liveness.last().is_none());
    }
}
