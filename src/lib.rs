//! TempoSteps
//!
//! Listens to a step-tempo sensor on a serial line, decodes the `s<bpm>e`
//! frames it sends and plays the catalog track whose tempo best matches.

pub mod catalog;
pub mod cli;
pub mod config;
pub mod connection;
pub mod decoder;
pub mod dispatcher;
pub mod error;
pub mod listener;
pub mod paths;
pub mod playback;
pub mod selector;
pub mod serial;
pub mod status;

pub use catalog::{Catalog, Track};
pub use connection::{ConnectionManager, ConnectionSnapshot, ConnectionState};
pub use decoder::{FrameDecoder, TempoReading};
pub use dispatcher::Dispatcher;
pub use error::{CatalogError, ConnectionError, PlaybackError};
pub use playback::{AudioBackend, PlaybackController, PlayingSound};
pub use serial::{PortOpener, SerialSettings, SerialSource};
