//! Tempo frame decoder
//!
//! Turns the sensor's ASCII byte stream into tempo readings. A frame is
//! `s` + digits/`.` + `e`; every other byte is line noise and is skipped.
//! The decoder keeps its partial frame between calls, so chunk boundaries
//! can fall anywhere.

use std::time::Instant;

use tracing::trace;

/// Start-of-frame sentinel
pub const FRAME_START: u8 = b's';

/// End-of-frame sentinel
pub const FRAME_END: u8 = b'e';

/// Longest numeric body accepted inside a frame
///
/// A sensor that loses its end sentinel would otherwise grow the buffer
/// without bound. Longer frames are dropped at the next `e`.
pub const MAX_FRAME_LEN: usize = 32;

/// One decoded tempo value
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TempoReading {
    /// Beats per minute as reported by the sensor
    pub value: f64,
    /// When the terminating sentinel was decoded
    pub observed_at: Instant,
}

impl TempoReading {
    pub fn new(value: f64) -> Self {
        Self {
            value,
            observed_at: Instant::now(),
        }
    }
}

/// Stateful frame parser, owned by exactly one decode worker
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: String,
    overflowed: bool,
    frames_emitted: u64,
    frames_dropped: u64,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, calling `emit` once per complete, parseable frame
    pub fn feed(&mut self, chunk: &[u8], mut emit: impl FnMut(TempoReading)) {
        for &byte in chunk {
            match byte {
                FRAME_START => self.clear(),
                b'0'..=b'9' | b'.' => self.push(byte),
                FRAME_END => {
                    if let Some(reading) = self.finish_frame() {
                        emit(reading);
                    }
                }
                _ => {}
            }
        }
    }

    /// Feed a chunk and collect the readings it completes
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<TempoReading> {
        let mut readings = Vec::new();
        self.feed(chunk, |reading| readings.push(reading));
        readings
    }

    /// Current partial frame body
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped
    }

    fn push(&mut self, byte: u8) {
        if self.buffer.len() >= MAX_FRAME_LEN {
            self.overflowed = true;
            return;
        }
        self.buffer.push(byte as char);
    }

    fn clear(&mut self) {
        self.buffer.clear();
        self.overflowed = false;
    }

    // The buffer is reset whatever the parse outcome.
    fn finish_frame(&mut self) -> Option<TempoReading> {
        let parsed = if self.overflowed {
            None
        } else {
            self.buffer.parse::<f64>().ok()
        };

        if parsed.is_some() {
            self.frames_emitted += 1;
        } else {
            trace!("Dropping malformed frame body {:?}", self.buffer);
            self.frames_dropped += 1;
        }

        self.clear();
        parsed.map(TempoReading::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn values(decoder: &mut FrameDecoder, chunk: &str) -> Vec<f64> {
        decoder
            .decode(chunk.as_bytes())
            .into_iter()
            .map(|r| r.value)
            .collect()
    }

    #[test]
    fn test_single_frame() {
        let mut decoder = FrameDecoder::new();
        assert_eq!(values(&mut decoder, "s123e"), vec![123.0]);
        assert_eq!(decoder.pending(), "");
    }

    #[test]
    fn test_fractional_frame() {
        let mut decoder = FrameDecoder::new();
        assert_eq!(values(&mut decoder, "s58.5e"), vec![58.5]);
    }

    #[test]
    fn test_split_chunks() {
        let mut decoder = FrameDecoder::new();
        assert!(values(&mut decoder, "s12").is_empty());
        assert_eq!(decoder.pending(), "12");
        assert_eq!(values(&mut decoder, "3e"), vec![123.0]);
    }

    #[test]
    fn test_nested_start_resets_buffer() {
        let mut decoder = FrameDecoder::new();
        assert_eq!(values(&mut decoder, "s12s34e"), vec![34.0]);
    }

    #[test]
    fn test_malformed_frames_are_dropped() {
        let mut decoder = FrameDecoder::new();
        assert!(values(&mut decoder, "se").is_empty());
        assert!(values(&mut decoder, "s1.2.3e").is_empty());
        assert!(values(&mut decoder, "s.e").is_empty());
        assert_eq!(decoder.frames_dropped(), 3);
        assert_eq!(decoder.pending(), "");

        // The buffer was cleared, so the next frame is clean
        assert_eq!(values(&mut decoder, "s90e"), vec![90.0]);
    }

    #[test]
    fn test_noise_is_ignored() {
        let mut decoder = FrameDecoder::new();
        assert_eq!(
            values(&mut decoder, "boot ok\r\ns1x2\n0e\r\nstatus\r\n"),
            vec![120.0]
        );
    }

    #[test]
    fn test_multiple_frames_in_one_chunk() {
        let mut decoder = FrameDecoder::new();
        assert_eq!(values(&mut decoder, "s60es61.5e\ns62e"), vec![60.0, 61.5, 62.0]);
        assert_eq!(decoder.frames_emitted(), 3);
    }

    #[test]
    fn test_overlong_frame_is_dropped() {
        let mut decoder = FrameDecoder::new();
        let body = "1".repeat(MAX_FRAME_LEN + 5);
        assert!(values(&mut decoder, &format!("s{}e", body)).is_empty());
        assert_eq!(values(&mut decoder, "s75e"), vec![75.0]);
    }

    proptest! {
        #[test]
        fn prop_numeric_frame_round_trips(value in 0u32..100_000, frac in proptest::option::of(0u32..1000)) {
            let body = match frac {
                Some(f) => format!("{}.{}", value, f),
                None => value.to_string(),
            };
            let expected: f64 = body.parse().unwrap();
            let mut decoder = FrameDecoder::new();
            let got = values(&mut decoder, &format!("s{}e", body));
            prop_assert_eq!(got, vec![expected]);
        }

        #[test]
        fn prop_split_point_does_not_matter(
            stream in "[se0-9. \r\nxz]{0,64}",
            split in 0usize..65,
        ) {
            let bytes = stream.as_bytes();
            let split = split.min(bytes.len());

            let mut whole = FrameDecoder::new();
            let expected: Vec<f64> = whole.decode(bytes).into_iter().map(|r| r.value).collect();

            let mut parts = FrameDecoder::new();
            let mut got: Vec<f64> = parts.decode(&bytes[..split]).into_iter().map(|r| r.value).collect();
            got.extend(parts.decode(&bytes[split..]).into_iter().map(|r| r.value));

            prop_assert_eq!(got, expected);
            prop_assert_eq!(parts.pending(), whole.pending());
        }

        #[test]
        fn prop_non_numeric_body_emits_nothing(body in "[a-df-rt-z]{0,10}") {
            let mut decoder = FrameDecoder::new();
            let frame = format!("s{}e", body);
            prop_assert!(values(&mut decoder, &frame).is_empty());
        }
    }
}
