//! Offline analysis pipeline: features, tempo and event detection over a
//! fully known PCM range.

pub mod detect;
pub mod features;
pub(crate) mod stats;
pub mod tempo;

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

pub use detect::EventDetector;
pub use features::{FeatureExtractor, FeatureFrames};
pub use tempo::{TempoEstimate, TempoEstimator};

use crate::{event::BeatEvent, AnalyzerConfig, BeatlineError, PcmSource, Result, VibeScores};

/// Steps slower than this are logged but never aborted.
const STEP_BUDGET: Duration = Duration::from_millis(120);

/// Runs `f` and warns when it exceeds the soft step budget.
pub(crate) fn timed<T>(step: &'static str, f: impl FnOnce() -> T) -> T {
    let started = Instant::now();
    let out = f();
    let elapsed = started.elapsed();
    if elapsed > STEP_BUDGET {
        tracing::warn!(
            step,
            elapsed_ms = elapsed.as_millis() as u64,
            "analysis step over budget"
        );
    }
    out
}

/// Output of one analysis call. Empty when the input was empty or the call
/// was cancelled.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Analysis {
    pub events: Vec<BeatEvent>,
    pub tempo: Option<TempoEstimate>,
    pub scores: Option<VibeScores>,
}

impl Analysis {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.tempo.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct Analyzer {
    config: AnalyzerConfig,
}

impl Analyzer {
    pub fn new(config: AnalyzerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// Analyses a PCM buffer whose first sample sits at `offset` seconds.
    pub fn analyze(
        &self,
        samples: &[f32],
        offset: f64,
        cancel: &CancellationToken,
    ) -> Result<Analysis> {
        if samples.is_empty() {
            return Ok(Analysis::default());
        }

        let mut extractor = FeatureExtractor::new(&self.config);
        let Some(mut frames) = extractor.extract(samples, offset, cancel)? else {
            tracing::debug!(offset, "analysis cancelled during extraction");
            return Ok(Analysis::default());
        };
        if cancel.is_cancelled() {
            return Ok(Analysis::default());
        }

        let estimator = TempoEstimator::new(&self.config);
        let tempo = timed("tempo", || estimator.estimate(&frames.flux));

        let detector = EventDetector::new(&self.config);
        let Some(events) = detector.detect(&mut frames, cancel) else {
            tracing::debug!(offset, "analysis cancelled during detection");
            return Ok(Analysis::default());
        };

        let scores = VibeScores::from_features(&frames, tempo);
        tracing::debug!(
            offset,
            frames = frames.len(),
            events = events.len(),
            bpm = tempo.map(|t| t.bpm),
            "analysed range"
        );
        Ok(Analysis {
            events,
            tempo,
            scores: Some(scores),
        })
    }

    /// Analyses `[start, end)` of `source` with `context_pad` seconds of audio
    /// on both sides, so windowed detectors see history and events that are
    /// only finalised after the range ends still land in it. Only events
    /// inside the range are kept.
    pub fn analyze_range(
        &self,
        source: &dyn PcmSource,
        start: f64,
        end: f64,
        context_pad: f64,
        cancel: &CancellationToken,
    ) -> Result<Analysis> {
        if source.sample_rate() != self.config.sample_rate {
            return Err(BeatlineError::invalid(format!(
                "source sample rate {} does not match analyzer rate {}",
                source.sample_rate(),
                self.config.sample_rate
            )));
        }
        if end <= start || cancel.is_cancelled() {
            return Ok(Analysis::default());
        }

        let pad = context_pad.max(0.0);
        let read_start = (start - pad).max(0.0);
        let read_end = end + pad;
        let samples = source.read(read_start, read_end - read_start)?;
        let mut analysis = self.analyze(&samples, read_start, cancel)?;
        analysis.events.retain(|event| event.t() >= start && event.t() < end);
        Ok(analysis)
    }

    /// Analyses a whole asset in one pass.
    pub fn analyze_source(
        &self,
        source: &dyn PcmSource,
        cancel: &CancellationToken,
    ) -> Result<Analysis> {
        let duration = source.duration();
        // Frames are centred on hop multiples, so the last one may land on
        // the end of the asset.
        let end = duration + self.config.hop_seconds();
        let mut analysis = self.analyze_range(source, 0.0, end, 0.0, cancel)?;
        analysis.events.retain(|event| event.t() <= duration);
        Ok(analysis)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{AssetIdentity, MemoryPcm};

    /// Decaying 1 kHz bursts every `period` seconds.
    pub(crate) fn click_track(sample_rate: u32, seconds: f64, period: f64) -> Vec<f32> {
        let total = (seconds * sample_rate as f64) as usize;
        let burst = (0.03 * sample_rate as f64) as usize;
        let mut samples = vec![0.0_f32; total];
        let mut onset = 0.0;
        while onset < seconds {
            let first = (onset * sample_rate as f64).round() as usize;
            for k in 0..burst {
                let Some(sample) = samples.get_mut(first + k) else {
                    break;
                };
                let t = k as f32 / sample_rate as f32;
                *sample = 0.8
                    * (-t * 120.0).exp()
                    * (2.0 * std::f32::consts::PI * 1000.0 * t).sin();
            }
            onset += period;
        }
        samples
    }

    #[test]
    fn click_track_tempo() {
        let config = AnalyzerConfig::default();
        let samples = click_track(config.sample_rate, 20.0, 0.5);
        let analyzer = Analyzer::new(config).unwrap();
        let analysis = analyzer
            .analyze(&samples, 0.0, &CancellationToken::new())
            .unwrap();

        let tempo = analysis.tempo.expect("tempo for a click track");
        assert!((tempo.bpm - 120.0).abs() <= 2.0, "bpm {}", tempo.bpm);
        assert!(tempo.confidence > 0.5, "confidence {}", tempo.confidence);
        assert!(!analysis.events.is_empty());
    }

    #[test]
    fn repeated_runs_are_identical() {
        let config = AnalyzerConfig::default();
        let samples = click_track(config.sample_rate, 8.0, 0.5);
        let analyzer = Analyzer::new(config).unwrap();
        let cancel = CancellationToken::new();
        let first = analyzer.analyze(&samples, 0.0, &cancel).unwrap();
        let second = analyzer.analyze(&samples, 0.0, &cancel).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn strengths_stay_in_unit_range() {
        let config = AnalyzerConfig::default();
        let samples = click_track(config.sample_rate, 8.0, 0.37);
        let analyzer = Analyzer::new(config).unwrap();
        let analysis = analyzer
            .analyze(&samples, 0.0, &CancellationToken::new())
            .unwrap();
        assert!(analysis
            .events
            .iter()
            .all(|e| (0.0..=1.0).contains(&e.strength())));
        assert!(analysis
            .events
            .windows(2)
            .all(|pair| pair[0].t() <= pair[1].t()));
    }

    #[test]
    fn empty_input_is_not_an_error() {
        let analyzer = Analyzer::new(AnalyzerConfig::default()).unwrap();
        let analysis = analyzer.analyze(&[], 0.0, &CancellationToken::new()).unwrap();
        assert!(analysis.is_empty());
    }

    #[test]
    fn cancelled_call_returns_empty() {
        let config = AnalyzerConfig::default();
        let samples = click_track(config.sample_rate, 4.0, 0.5);
        let analyzer = Analyzer::new(config).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let analysis = analyzer.analyze(&samples, 0.0, &cancel).unwrap();
        assert_eq!(analysis, Analysis::default());
    }

    #[test]
    fn range_keeps_only_inner_events() {
        let config = AnalyzerConfig::default();
        let samples = click_track(config.sample_rate, 10.0, 0.5);
        let pcm = MemoryPcm::new(AssetIdentity::new("click.wav", 1), config.sample_rate, samples);
        let analyzer = Analyzer::new(config).unwrap();
        let analysis = analyzer
            .analyze_range(&pcm, 4.0, 6.0, 2.0, &CancellationToken::new())
            .unwrap();
        assert!(!analysis.events.is_empty());
        assert!(analysis.events.iter().all(|e| e.t() >= 4.0 && e.t() < 6.0));
    }

    /// Steady 440 Hz tone with a quiet stretch over `[dip_start, dip_end)`.
    fn tone_with_dip(sample_rate: u32, seconds: f64, dip_start: f64, dip_end: f64) -> Vec<f32> {
        let total = (seconds * sample_rate as f64) as usize;
        (0..total)
            .map(|i| {
                let t = i as f64 / sample_rate as f64;
                let level = if t >= dip_start && t < dip_end { 0.02 } else { 0.5 };
                level * (2.0 * std::f64::consts::PI * 440.0 * t).sin() as f32
            })
            .collect()
    }

    fn breakdown_times(events: &[BeatEvent]) -> Vec<f64> {
        events
            .iter()
            .filter(|e| e.kind() == crate::event::BeatKind::Breakdown)
            .map(|e| e.t())
            .collect()
    }

    #[test]
    fn breakdown_across_chunk_boundary_matches_whole_file() {
        let config = AnalyzerConfig::default();
        let samples = tone_with_dip(config.sample_rate, 12.0, 5.7, 6.3);
        let pcm = MemoryPcm::new(AssetIdentity::new("dip.wav", 1), config.sample_rate, samples);
        let analyzer = Analyzer::new(config).unwrap();
        let cancel = CancellationToken::new();

        let whole = analyzer.analyze_source(&pcm, &cancel).unwrap();
        let expected = breakdown_times(&whole.events);
        assert_eq!(expected.len(), 1, "whole-file breakdowns {expected:?}");

        let mut chunked = Vec::new();
        for (start, end) in [(0.0, 6.0), (6.0, 12.0)] {
            let part = analyzer.analyze_range(&pcm, start, end, 1.0, &cancel).unwrap();
            chunked.extend(breakdown_times(&part.events));
        }
        assert_eq!(chunked.len(), 1, "chunked breakdowns {chunked:?}");
        assert!((chunked[0] - expected[0]).abs() < 0.05);
    }

    #[test]
    fn rejects_mismatched_sample_rate() {
        let pcm = MemoryPcm::new(AssetIdentity::new("a.wav", 1), 44_100, vec![0.0; 10]);
        let analyzer = Analyzer::new(AnalyzerConfig::default()).unwrap();
        let result = analyzer.analyze_source(&pcm, &CancellationToken::new());
        assert!(matches!(result, Err(BeatlineError::InvalidInput(_))));
    }
}
