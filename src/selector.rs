//! Tempo matching
//!
//! A reading matches a track at its own tempo, at double tempo or at half
//! tempo; the best match is the smallest of the three distances.

use crate::catalog::Track;

/// Harmonic-aware distance between a target tempo and a track tempo
pub fn harmonic_distance(target_bpm: f64, track_bpm: u32) -> f64 {
    let bpm = f64::from(track_bpm);
    let direct = (target_bpm - bpm).abs();
    let double = (target_bpm - bpm * 2.0).abs();
    let half = (target_bpm - bpm / 2.0).abs();
    direct.min(double).min(half)
}

/// Pick the catalog track closest to `target_bpm`
///
/// Ties go to the track that appears first. Returns `None` for an empty
/// catalog or a non-finite target.
pub fn select(target_bpm: f64, tracks: &[Track]) -> Option<&Track> {
    if !target_bpm.is_finite() {
        return None;
    }

    let mut best: Option<(&Track, f64)> = None;
    for track in tracks {
        let distance = harmonic_distance(target_bpm, track.bpm);
        match best {
            Some((_, best_distance)) if distance >= best_distance => {}
            _ => best = Some((track, distance)),
        }
    }
    best.map(|(track, _)| track)
}
