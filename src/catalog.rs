//! Track catalog
//!
//! The catalog is an ordered list of tracks imported once at startup from a
//! tab-separated file (`title`, `artist`, `bpm`, `path` per line). Order is
//! significant: the selector breaks ties in favour of earlier tracks.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::CatalogError;

/// A playable catalog entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Track {
    pub title: String,
    pub artist: String,
    /// Tempo in beats per minute, always > 0
    pub bpm: u32,
    /// Location of the audio resource
    pub path: PathBuf,
}

impl Track {
    pub fn new(
        title: impl Into<String>,
        artist: impl Into<String>,
        bpm: u32,
        path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            title: title.into(),
            artist: artist.into(),
            bpm,
            path: path.into(),
        }
    }
}

impl std::fmt::Display for Track {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} - {} ({}BPM)", self.title, self.artist, self.bpm)
    }
}

/// Ordered track list
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    tracks: Vec<Track>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tracks(tracks: Vec<Track>) -> Self {
        Self { tracks }
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Import tracks from a catalog file
    ///
    /// Returns the number of rows imported by this call. On the first bad
    /// row the import stops with an error; rows before it are kept.
    pub fn import_file(&mut self, path: impl AsRef<Path>) -> Result<usize, CatalogError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let result = self.import_reader(BufReader::new(file));
        match &result {
            Ok(count) => info!("📚 Imported {} tracks from {}", count, path.display()),
            Err(e) => warn!(
                "Catalog import from {} stopped after {} tracks: {}",
                path.display(),
                self.tracks.len(),
                e
            ),
        }
        result
    }

    /// Import tracks from any reader, same contract as [`Catalog::import_file`]
    pub fn import_reader<R: Read>(&mut self, reader: R) -> Result<usize, CatalogError> {
        let mut rows = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .flexible(true)
            .quoting(false)
            .from_reader(reader);

        let mut imported = 0;
        for record in rows.records() {
            let record = record.map_err(|source| CatalogError::Malformed {
                line: source.position().map(|p| p.line()).unwrap_or(0),
                source,
            })?;
            let line = record.position().map(|p| p.line()).unwrap_or(0);

            let track = parse_row(&record, line)?;
            debug!("Catalog line {}: {}", line, track);
            self.tracks.push(track);
            imported += 1;
        }

        Ok(imported)
    }
}

fn parse_row(record: &csv::StringRecord, line: u64) -> Result<Track, CatalogError> {
    if record.len() != 4 {
        return Err(CatalogError::FieldCount {
            line,
            found: record.len(),
        });
    }

    let raw_bpm = &record[2];
    let bpm = raw_bpm
        .trim()
        .parse::<u32>()
        .ok()
        .filter(|bpm| *bpm > 0)
        .ok_or_else(|| CatalogError::InvalidTempo {
            line,
            value: raw_bpm.to_string(),
        })?;

    Ok(Track::new(&record[0], &record[1], bpm, &record[3]))
}
