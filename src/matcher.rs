//! Track matching
//!
//! Resolves a source track to a destination catalog entry: an exact ISRC
//! lookup first, then a fuzzy search scored on title, artist and duration.
//! Scoring is deterministic for identical inputs.

use std::collections::HashSet;

use serde::Serialize;
use tracing::debug;
use unaccent::unaccent;

use crate::config::MatcherConfig;
use crate::platforms::{AccessContext, NormalizedTrack, PlatformAdapter, PlatformError};

/// Within this window the duration term is a full 1.0.
const DURATION_EXACT_MS: u64 = 2_000;
/// Confidence multiplier for candidates outside the duration tolerance.
const DURATION_MISMATCH_PENALTY: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    Isrc,
    Search,
}

/// Outcome of matching one track. `candidate` is `None` when nothing reached
/// the threshold; `confidence` is then the best score seen.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub candidate: Option<NormalizedTrack>,
    pub confidence: f64,
    pub method: Option<MatchMethod>,
}

impl MatchResult {
    fn unmatched(confidence: f64) -> Self {
        Self {
            candidate: None,
            confidence,
            method: None,
        }
    }

    pub fn is_match(&self) -> bool {
        self.candidate.is_some()
    }
}

/// Lowercases, strips accents and punctuation, and collapses whitespace.
pub fn normalize_text(input: &str) -> String {
    let folded = unaccent(&input.to_lowercase());
    folded
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Jaccard overlap of whitespace tokens; tolerant to word reordering.
fn token_overlap(a: &str, b: &str) -> f64 {
    let left: HashSet<&str> = a.split_whitespace().collect();
    let right: HashSet<&str> = b.split_whitespace().collect();
    let union = left.union(&right).count();
    if union == 0 {
        return 0.0;
    }
    left.intersection(&right).count() as f64 / union as f64
}

/// Similarity of two already-normalized strings in [0, 1].
pub fn similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    jaro_winkler::jaro_winkler(a, b).max(token_overlap(a, b))
}

pub fn isrc_equal(a: &str, b: &str) -> bool {
    let (a, b) = (a.trim(), b.trim());
    !a.is_empty() && a.eq_ignore_ascii_case(b)
}

#[derive(Debug, Clone)]
pub struct TrackMatcher {
    config: MatcherConfig,
}

impl TrackMatcher {
    pub fn new(config: MatcherConfig) -> Self {
        Self { config }
    }

    /// Duration term: 1.0 within 2s, linear down to 0.5 at the tolerance,
    /// 0.0 beyond it.
    fn duration_term(&self, diff_ms: u64) -> f64 {
        let tolerance = self.config.duration_tolerance_ms.max(DURATION_EXACT_MS);
        if diff_ms <= DURATION_EXACT_MS {
            1.0
        } else if diff_ms <= tolerance {
            let span = (tolerance - DURATION_EXACT_MS).max(1) as f64;
            1.0 - 0.5 * (diff_ms - DURATION_EXACT_MS) as f64 / span
        } else {
            0.0
        }
    }

    /// Weighted confidence of `candidate` being `source`.
    pub fn score(&self, source: &NormalizedTrack, candidate: &NormalizedTrack) -> f64 {
        let cfg = &self.config;
        let title_sim = similarity(
            &normalize_text(&source.title),
            &normalize_text(&candidate.title),
        );
        let artist_sim = similarity(
            &normalize_text(&source.artist),
            &normalize_text(&candidate.artist),
        );

        let score = match (source.duration_ms, candidate.duration_ms) {
            (Some(a), Some(b)) => {
                let diff = a.abs_diff(b);
                let weighted = cfg.title_weight * title_sim
                    + cfg.artist_weight * artist_sim
                    + cfg.duration_weight * self.duration_term(diff);
                if diff > cfg.duration_tolerance_ms {
                    weighted * DURATION_MISMATCH_PENALTY
                } else {
                    weighted
                }
            }
            _ => {
                let text_weight = cfg.title_weight + cfg.artist_weight;
                if text_weight <= 0.0 {
                    0.0
                } else {
                    (cfg.title_weight * title_sim + cfg.artist_weight * artist_sim) / text_weight
                }
            }
        };

        score.clamp(0.0, 1.0)
    }

    /// Picks the best candidate at or above the threshold. On equal scores the
    /// earlier candidate in search order wins.
    pub fn best_candidate(
        &self,
        source: &NormalizedTrack,
        candidates: Vec<NormalizedTrack>,
    ) -> MatchResult {
        let mut best: Option<(f64, NormalizedTrack)> = None;
        for candidate in candidates {
            let score = self.score(source, &candidate);
            if best.as_ref().is_none_or(|(top, _)| score > *top) {
                best = Some((score, candidate));
            }
        }

        match best {
            Some((score, candidate)) if score >= self.config.threshold => MatchResult {
                candidate: Some(candidate),
                confidence: score,
                method: Some(MatchMethod::Search),
            },
            Some((score, _)) => MatchResult::unmatched(score),
            None => MatchResult::unmatched(0.0),
        }
    }

    /// Resolves `source` on the destination platform. Provider errors are
    /// returned to the caller, which records them per track.
    pub async fn match_track(
        &self,
        source: &NormalizedTrack,
        destination: &dyn PlatformAdapter,
        ctx: &AccessContext,
    ) -> Result<MatchResult, PlatformError> {
        if let Some(isrc) = source.isrc.as_deref().filter(|i| !i.trim().is_empty()) {
            if let Some(found) = destination.search_by_isrc(ctx, isrc).await? {
                if found.isrc.as_deref().is_some_and(|other| isrc_equal(isrc, other)) {
                    return Ok(MatchResult {
                        candidate: Some(found),
                        confidence: 1.0,
                        method: Some(MatchMethod::Isrc),
                    });
                }
                debug!(isrc, "ISRC lookup returned a different recording");
            }
        }

        let query = format!("{} {}", source.title, source.artist);
        let candidates = destination
            .search_track(ctx, query.trim(), self.config.candidate_limit)
            .await?;
        Ok(self.best_candidate(source, candidates))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(title: &str, artist: &str, duration_ms: Option<u64>) -> NormalizedTrack {
        NormalizedTrack {
            provider_track_id: format!("{}-{}", title, artist),
            title: title.to_string(),
            artist: artist.to_string(),
            album: None,
            duration_ms,
            isrc: None,
        }
    }

    fn matcher() -> TrackMatcher {
        TrackMatcher::new(MatcherConfig::default())
    }

    #[test]
    fn normalization_folds_case_accents_and_punctuation() {
        assert_eq!(normalize_text("  Beyoncé -- Halo!! "), "beyonce halo");
        assert_eq!(normalize_text("Don't   Stop"), "don t stop");
    }

    #[test]
    fn identical_tracks_score_one() {
        let t = track("Halo", "Beyoncé", Some(261_000));
        assert!((matcher().score(&t, &t) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn duration_term_shape() {
        let m = matcher();
        assert_eq!(m.duration_term(0), 1.0);
        assert_eq!(m.duration_term(2_000), 1.0);
        assert!((m.duration_term(6_000) - 0.75).abs() < 1e-9);
        assert!((m.duration_term(10_000) - 0.5).abs() < 1e-9);
        assert_eq!(m.duration_term(10_001), 0.0);
    }

    #[test]
    fn far_durations_are_penalized() {
        let m = matcher();
        let source = track("Halo", "Beyonce", Some(261_000));
        let live = track("Halo", "Beyonce", Some(300_000));
        // (0.45 + 0.35 + 0) * 0.5
        assert!((m.score(&source, &live) - 0.4).abs() < 1e-9);
        assert!(!m.best_candidate(&source, vec![live]).is_match());
    }

    #[test]
    fn unknown_duration_renormalizes_text_weights() {
        let m = matcher();
        let source = track("Halo", "Beyonce", Some(261_000));
        let video = track("Halo", "Beyonce", None);
        assert!((m.score(&source, &video) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn ties_keep_earlier_candidate() {
        let m = matcher();
        let source = track("Halo", "Beyonce", Some(261_000));
        let mut first = track("Halo", "Beyonce", Some(261_000));
        first.provider_track_id = "first".into();
        let mut second = first.clone();
        second.provider_track_id = "second".into();

        let result = m.best_candidate(&source, vec![first, second]);
        assert_eq!(result.candidate.unwrap().provider_track_id, "first");
    }

    #[test]
    fn below_threshold_is_unmatched_with_best_score() {
        let m = matcher();
        let source = track("Halo", "Beyonce", Some(261_000));
        let other = track("Smells Like Teen Spirit", "Nirvana", Some(301_000));
        let result = m.best_candidate(&source, vec![other]);
        assert!(result.candidate.is_none());
        assert!(result.confidence < 0.75);
    }

    #[test]
    fn reordered_words_match_via_tokens() {
        assert_eq!(similarity("the beatles", "beatles the"), 1.0);
    }

    #[test]
    fn isrc_comparison_ignores_case_and_whitespace() {
        assert!(isrc_equal(" usrc17607839", "USRC17607839 "));
        assert!(!isrc_equal("", ""));
        assert!(!isrc_equal("USRC17607839", "USRC17607840"));
    }
}
