//! Session-stable mood classification.
//!
//! [`VibeClassifier`] collects aggregate [`VibeScores`] for one asset, commits
//! to a [`VibeMode`] once enough music has been heard and allows a single
//! early correction afterwards.

use serde::{Deserialize, Serialize};

use crate::analysis::{FeatureFrames, TempoEstimate};

const WARMUP_SECS: f64 = 12.0;
const WARMUP_BEATS: u32 = 16;
const PROBATION_EXTRA_BEATS: u32 = 8;
const LOCK_CONFIDENCE: f32 = 0.55;
const LOCK_MARGIN: f32 = 0.15;
const RELOCK_CONFIDENCE: f32 = 0.65;
const RELOCK_MARGIN: f32 = 0.35;
const RELOCK_SINCE_LOCK_SECS: f64 = 10.0;
const RELOCK_TOTAL_SECS: f64 = 25.0;
const FAST_DRIVE_BPM: f32 = 160.0;
const NEUTRAL_FLOOR: f32 = 0.3;

const QUIET_BELOW_PEAK_DB: f32 = 12.0;
const DYNAMIC_RANGE_DB: f32 = 30.0;
const DENSITY_FULL: f32 = 8.0;
const LEVEL_FLOOR_DB: f32 = -60.0;

/// Aggregate descriptors over the audio heard so far. Everything but `bpm`
/// lies in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct VibeScores {
    pub bpm: f32,
    pub bpm_confidence: f32,
    pub energy: f32,
    pub brightness: f32,
    pub vocality: f32,
    pub space: f32,
    pub density: f32,
    pub compression: f32,
    pub valence: f32,
}

impl VibeScores {
    /// Derives scores from one analysed range.
    pub fn from_features(frames: &FeatureFrames, tempo: Option<TempoEstimate>) -> Self {
        let (bpm, bpm_confidence) = tempo.map(|t| (t.bpm, t.confidence)).unwrap_or((0.0, 0.0));
        if frames.is_empty() {
            return Self {
                bpm,
                bpm_confidence,
                ..Default::default()
            };
        }
        let n = frames.len() as f32;

        let levels: Vec<f32> = frames.rms_db.iter().map(|db| db.max(LEVEL_FLOOR_DB)).collect();
        let energy = levels.iter().map(|db| (db - LEVEL_FLOOR_DB) / -LEVEL_FLOOR_DB).sum::<f32>() / n;

        let mut sorted = levels.clone();
        sorted.sort_by(f32::total_cmp);
        let percentile = |p: f32| sorted[((sorted.len() - 1) as f32 * p).round() as usize];
        let range_db = percentile(0.95) - percentile(0.10);
        let compression = 1.0 - range_db / DYNAMIC_RANGE_DB;

        let peak = sorted[sorted.len() - 1];
        let quiet = levels.iter().filter(|db| **db < peak - QUIET_BELOW_PEAK_DB).count() as f32 / n;
        let density = frames.onset_density.iter().sum::<f32>() / n / DENSITY_FULL;
        let density = density.clamp(0.0, 1.0);
        let space = 0.5 * quiet + 0.5 * (1.0 - density);

        let mut chroma = [0.0_f32; 12];
        for frame in &frames.chroma {
            for (acc, v) in chroma.iter_mut().zip(frame) {
                *acc += v;
            }
        }
        let root = chroma
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap_or(0);
        let major = chroma[(root + 4) % 12];
        let minor = chroma[(root + 3) % 12];
        let valence = 0.5 + 0.5 * (major - minor) / (major + minor).max(1e-6);

        Self {
            bpm,
            bpm_confidence,
            energy: energy.clamp(0.0, 1.0),
            brightness: (frames.centroid.iter().sum::<f32>() / n).clamp(0.0, 1.0),
            vocality: (frames.pitch_confidence.iter().sum::<f32>() / n).clamp(0.0, 1.0),
            space: space.clamp(0.0, 1.0),
            density,
            compression: compression.clamp(0.0, 1.0),
            valence: valence.clamp(0.0, 1.0),
        }
    }

    /// Frame-weighted running mean, used to fold per-chunk scores together.
    pub fn blend(&self, other: &VibeScores, weight: f32) -> VibeScores {
        let w = weight.clamp(0.0, 1.0);
        let mix = |a: f32, b: f32| a * (1.0 - w) + b * w;
        VibeScores {
            bpm: mix(self.bpm, other.bpm),
            bpm_confidence: mix(self.bpm_confidence, other.bpm_confidence),
            energy: mix(self.energy, other.energy),
            brightness: mix(self.brightness, other.brightness),
            vocality: mix(self.vocality, other.vocality),
            space: mix(self.space, other.space),
            density: mix(self.density, other.density),
            compression: mix(self.compression, other.compression),
            valence: mix(self.valence, other.valence),
        }
    }
}

/// Duration-weighted mean of per-chunk scores.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScoreTally {
    scores: Option<VibeScores>,
    seconds: f64,
}

impl ScoreTally {
    /// Starts from scores already averaged over `seconds`.
    pub fn seeded(scores: Option<VibeScores>, seconds: f64) -> Self {
        Self {
            seconds: if scores.is_some() { seconds.max(0.0) } else { 0.0 },
            scores,
        }
    }

    pub fn add(&mut self, scores: VibeScores, seconds: f64) {
        let seconds = seconds.max(0.0);
        self.seconds += seconds;
        self.scores = Some(match self.scores {
            Some(current) if self.seconds > 0.0 => {
                current.blend(&scores, (seconds / self.seconds) as f32)
            }
            _ => scores,
        });
    }

    pub fn scores(&self) -> Option<VibeScores> {
        self.scores
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VibeMode {
    Hype,
    Ambient,
    PopBright,
    PopMoody,
    FastDrive,
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VibePhase {
    Collecting,
    Probation,
    Locked(VibeMode),
}

/// Outcome of scoring one set of [`VibeScores`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VibeDecision {
    pub mode: VibeMode,
    pub score: f32,
    pub margin: f32,
    pub confidence: f32,
}

/// Weighted candidate scores, in declaration order of [`VibeMode`].
pub fn score_modes(s: &VibeScores) -> [(VibeMode, f32); 6] {
    let fast_drive = if s.bpm > FAST_DRIVE_BPM {
        0.5 * s.density + 0.3 * s.energy + 0.2 * s.bpm_confidence
    } else {
        0.0
    };
    [
        (VibeMode::Hype, 0.5 * s.energy + 0.3 * s.density + 0.2 * s.compression),
        (
            VibeMode::Ambient,
            0.5 * (1.0 - s.energy) + 0.4 * s.space + 0.2 * (1.0 - s.valence),
        ),
        (
            VibeMode::PopBright,
            0.4 * s.valence + 0.3 * s.brightness + 0.3 * s.vocality,
        ),
        (
            VibeMode::PopMoody,
            0.4 * (1.0 - s.valence) + 0.3 * s.vocality + 0.3 * (1.0 - s.brightness),
        ),
        (VibeMode::FastDrive, fast_drive),
        (VibeMode::Neutral, NEUTRAL_FLOOR),
    ]
}

/// Picks the best candidate and measures how clearly it won.
pub fn evaluate(scores: &VibeScores) -> VibeDecision {
    let mut ranked = score_modes(scores);
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    let (mode, best) = ranked[0];
    let runner_up = ranked[1].1;
    let confidence = best * (0.7 + 0.3 * scores.bpm_confidence.clamp(0.0, 1.0));
    VibeDecision {
        mode,
        score: best,
        margin: best - runner_up,
        confidence: confidence.clamp(0.0, 1.0),
    }
}

/// Tracks exactly one asset from `start()` until the next `start()`.
#[derive(Debug, Clone)]
pub struct VibeClassifier {
    asset_key: Option<String>,
    phase: VibePhase,
    confidence: f32,
    locked_at: f64,
    relock_used: bool,
    probation_from: (f64, u32),
}

impl Default for VibeClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl VibeClassifier {
    pub fn new() -> Self {
        Self {
            asset_key: None,
            phase: VibePhase::Collecting,
            confidence: 0.0,
            locked_at: 0.0,
            relock_used: false,
            probation_from: (0.0, 0),
        }
    }

    /// Forgets everything about the previous asset.
    pub fn start(&mut self, asset_key: impl Into<String>) {
        *self = Self::new();
        self.asset_key = Some(asset_key.into());
    }

    /// Locks straight away to a previously stored decision. No relock is
    /// offered for a restored vibe.
    pub fn restore(&mut self, mode: VibeMode, confidence: f32) {
        self.phase = VibePhase::Locked(mode);
        self.confidence = confidence.clamp(0.0, 1.0);
        self.relock_used = true;
    }

    pub fn asset_key(&self) -> Option<&str> {
        self.asset_key.as_deref()
    }

    pub fn phase(&self) -> VibePhase {
        self.phase
    }

    pub fn mode(&self) -> Option<VibeMode> {
        match self.phase {
            VibePhase::Locked(mode) => Some(mode),
            _ => None,
        }
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    /// Feeds one update. `elapsed` is listening time since `start()`,
    /// `beats` the beats heard in that time.
    pub fn update(&mut self, elapsed: f64, beats: u32, scores: &VibeScores) -> VibePhase {
        match self.phase {
            VibePhase::Collecting => {
                if elapsed >= WARMUP_SECS || beats >= WARMUP_BEATS {
                    let decision = evaluate(scores);
                    if decision.confidence >= LOCK_CONFIDENCE && decision.margin >= LOCK_MARGIN {
                        self.lock(decision, elapsed);
                    } else {
                        tracing::debug!(
                            candidate = ?decision.mode,
                            confidence = decision.confidence,
                            margin = decision.margin,
                            "vibe undecided, entering probation"
                        );
                        self.phase = VibePhase::Probation;
                        self.probation_from = (elapsed, beats.max(WARMUP_BEATS));
                    }
                }
            }
            VibePhase::Probation => {
                let (since, from_beats) = self.probation_from;
                let beat_seconds = if scores.bpm > 0.0 {
                    60.0 / scores.bpm as f64
                } else {
                    60.0 / 120.0
                };
                let extended = beats >= from_beats + PROBATION_EXTRA_BEATS
                    || elapsed >= since + PROBATION_EXTRA_BEATS as f64 * beat_seconds;
                if extended {
                    self.lock(evaluate(scores), elapsed);
                }
            }
            VibePhase::Locked(current) => {
                let in_window = !self.relock_used
                    && elapsed - self.locked_at <= RELOCK_SINCE_LOCK_SECS
                    && elapsed <= RELOCK_TOTAL_SECS;
                if in_window {
                    let decision = evaluate(scores);
                    if decision.mode != current
                        && decision.confidence >= RELOCK_CONFIDENCE
                        && decision.margin >= RELOCK_MARGIN
                    {
                        tracing::info!(from = ?current, to = ?decision.mode, "vibe relocked");
                        self.phase = VibePhase::Locked(decision.mode);
                        self.confidence = decision.confidence;
                        self.relock_used = true;
                    }
                }
            }
        }
        self.phase
    }

    fn lock(&mut self, decision: VibeDecision, elapsed: f64) {
        tracing::info!(
            mode = ?decision.mode,
            confidence = decision.confidence,
            asset = self.asset_key.as_deref().unwrap_or(""),
            "vibe locked"
        );
        self.phase = VibePhase::Locked(decision.mode);
        self.confidence = decision.confidence;
        self.locked_at = elapsed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hype_scores() -> VibeScores {
        VibeScores {
            bpm: 120.0,
            bpm_confidence: 0.9,
            energy: 0.9,
            brightness: 0.5,
            vocality: 0.1,
            space: 0.1,
            density: 0.9,
            compression: 0.9,
            valence: 0.5,
        }
    }

    fn ambient_scores() -> VibeScores {
        VibeScores {
            bpm: 120.0,
            bpm_confidence: 0.9,
            energy: 0.05,
            brightness: 0.2,
            vocality: 0.05,
            space: 0.95,
            density: 0.05,
            compression: 0.1,
            valence: 0.1,
        }
    }

    /// Feeds `scores` every half second (one beat at 120 BPM) up to `until`.
    fn feed(classifier: &mut VibeClassifier, from: f64, until: f64, scores: &VibeScores) {
        let mut t = from;
        while t <= until + 1e-9 {
            classifier.update(t, (t * 2.0) as u32, scores);
            t += 0.5;
        }
    }

    #[test]
    fn collects_until_warm_up() {
        let mut classifier = VibeClassifier::new();
        classifier.start("track");
        assert_eq!(classifier.update(3.0, 6, &hype_scores()), VibePhase::Collecting);
    }

    #[test]
    fn energetic_input_locks_hype() {
        let mut classifier = VibeClassifier::new();
        classifier.start("track");
        feed(&mut classifier, 0.5, 8.0, &hype_scores());
        assert_eq!(classifier.phase(), VibePhase::Locked(VibeMode::Hype));
        assert!(classifier.confidence() >= 0.55);
    }

    #[test]
    fn relocks_once_inside_window() {
        let mut classifier = VibeClassifier::new();
        classifier.start("track");
        feed(&mut classifier, 0.5, 8.0, &hype_scores());
        assert_eq!(classifier.mode(), Some(VibeMode::Hype));

        classifier.update(12.0, 24, &ambient_scores());
        assert_eq!(classifier.mode(), Some(VibeMode::Ambient));

        classifier.update(13.0, 26, &hype_scores());
        assert_eq!(classifier.mode(), Some(VibeMode::Ambient));
    }

    #[test]
    fn no_relock_outside_window() {
        let mut classifier = VibeClassifier::new();
        classifier.start("track");
        feed(&mut classifier, 0.5, 8.0, &hype_scores());
        classifier.update(18.5, 37, &ambient_scores());
        assert_eq!(classifier.mode(), Some(VibeMode::Hype));
    }

    #[test]
    fn ambiguous_input_goes_through_probation_then_force_locks() {
        let flat = VibeScores {
            bpm: 120.0,
            bpm_confidence: 0.2,
            energy: 0.5,
            brightness: 0.5,
            vocality: 0.5,
            space: 0.5,
            density: 0.5,
            compression: 0.5,
            valence: 0.5,
        };
        let mut classifier = VibeClassifier::new();
        classifier.start("track");
        assert_eq!(classifier.update(8.0, 16, &flat), VibePhase::Probation);
        assert_eq!(classifier.update(9.0, 18, &flat), VibePhase::Probation);
        assert!(matches!(classifier.update(12.0, 24, &flat), VibePhase::Locked(_)));
    }

    #[test]
    fn start_resets_previous_asset() {
        let mut classifier = VibeClassifier::new();
        classifier.start("first");
        feed(&mut classifier, 0.5, 8.0, &hype_scores());
        classifier.start("second");
        assert_eq!(classifier.phase(), VibePhase::Collecting);
        assert_eq!(classifier.asset_key(), Some("second"));
        assert_eq!(classifier.confidence(), 0.0);
    }

    #[test]
    fn fast_drive_needs_high_tempo() {
        let mut scores = hype_scores();
        scores.bpm = 150.0;
        let fast = score_modes(&scores)[4].1;
        assert_eq!(fast, 0.0);
        scores.bpm = 170.0;
        assert!(score_modes(&scores)[4].1 > 0.5);
    }

    #[test]
    fn restored_vibe_is_final() {
        let mut classifier = VibeClassifier::new();
        classifier.start("track");
        classifier.restore(VibeMode::PopMoody, 0.7);
        classifier.update(2.0, 4, &hype_scores());
        assert_eq!(classifier.mode(), Some(VibeMode::PopMoody));
    }

    #[test]
    fn tally_weights_chunks_by_duration() {
        let quiet = ambient_scores();
        let loud = hype_scores();
        let mut tally = ScoreTally::default();
        assert_eq!(tally.scores(), None);
        tally.add(quiet, 3.0);
        tally.add(loud, 1.0);
        let mixed = tally.scores().unwrap();
        let expected = quiet.energy * 0.75 + loud.energy * 0.25;
        assert!((mixed.energy - expected).abs() < 1e-5);

        let mut resumed = ScoreTally::seeded(Some(quiet), 3.0);
        resumed.add(loud, 1.0);
        assert_eq!(resumed.scores(), Some(mixed));
    }

    #[test]
    fn scores_from_silence_are_empty() {
        let frames = FeatureFrames::default();
        let scores = VibeScores::from_features(&frames, None);
        assert_eq!(scores, VibeScores::default());
    }
}
