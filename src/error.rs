//! Typed errors for the library modules
//!
//! The binary and the configuration layer use `anyhow`; everything that a
//! caller may want to match on is expressed here.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Catalog import failure
///
/// Returned in place of a row count. Rows parsed before the failing row stay
/// in the catalog.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read catalog {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("catalog line {line}: expected 4 tab-separated fields, found {found}")]
    FieldCount { line: u64, found: usize },

    #[error("catalog line {line}: tempo '{value}' is not a positive integer")]
    InvalidTempo { line: u64, value: String },

    #[error("catalog line {line}: {source}")]
    Malformed {
        line: u64,
        #[source]
        source: csv::Error,
    },
}

/// Playback acquisition / output failure
#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("cannot open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot decode {path}: {reason}")]
    Decode { path: PathBuf, reason: String },

    #[error("audio output unavailable: {0}")]
    Output(String),
}

/// Serial connection failure
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("could not open port {port}: {reason}")]
    Open { port: String, reason: String },

    #[error("opening port {port} timed out after {timeout_ms}ms")]
    OpenTimeout { port: String, timeout_ms: u64 },

    #[error("read failed on {port}: {source}")]
    Read {
        port: String,
        #[source]
        source: io::Error,
    },

    #[error("dispatch queue closed")]
    DispatchClosed,
}
