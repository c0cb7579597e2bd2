use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{BeatlineError, Result};

/// Top-level configuration structure for an engine instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub analyzer: AnalyzerConfig,
    pub lookahead: LookaheadConfig,
    pub scheduler: SchedulerConfig,
    /// How far ahead of the playhead events are released to the consumer.
    pub lead_time: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            analyzer: AnalyzerConfig::default(),
            lookahead: LookaheadConfig::default(),
            scheduler: SchedulerConfig::default(),
            lead_time: 0.03,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.analyzer.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Defaults, except for the analysis sample rate which must follow the
    /// PCM collaborator.
    pub fn with_sample_rate(sample_rate: u32) -> Self {
        let mut config = Self::default();
        config.analyzer.sample_rate = sample_rate;
        config
    }
}

/// Parameters of a single analysis run.
///
/// The whole struct is stored with every cache record. Bumping `version`
/// invalidates all records written with an older value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub sample_rate: u32,
    pub frame_size: usize,
    pub hop_size: usize,
    pub bass_low_hz: f32,
    pub bass_high_hz: f32,
    /// Adaptive threshold window for onset peaks, in seconds.
    pub flux_window: f32,
    pub flux_multiplier: f32,
    pub bass_window: f32,
    pub bass_multiplier: f32,
    /// Fraction of the clip's peak flux an onset needs to count as a drop.
    pub drop_threshold: f32,
    pub min_bpm: f32,
    pub max_bpm: f32,
    pub version: u32,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            sample_rate: 22_050,
            frame_size: 2048,
            hop_size: 512,
            bass_low_hz: 20.0,
            bass_high_hz: 150.0,
            flux_window: 0.5,
            flux_multiplier: 1.5,
            bass_window: 0.5,
            bass_multiplier: 1.4,
            drop_threshold: 0.6,
            min_bpm: 70.0,
            max_bpm: 180.0,
            version: 3,
        }
    }
}

impl AnalyzerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(BeatlineError::invalid("sample rate must be positive"));
        }
        if self.frame_size < 64 || self.frame_size % 2 != 0 {
            return Err(BeatlineError::invalid(format!(
                "frame size must be even and at least 64, got {}",
                self.frame_size
            )));
        }
        if self.hop_size == 0 || self.hop_size > self.frame_size {
            return Err(BeatlineError::invalid(format!(
                "hop size must be in 1..={}, got {}",
                self.frame_size, self.hop_size
            )));
        }
        if !(self.bass_low_hz >= 0.0 && self.bass_low_hz < self.bass_high_hz) {
            return Err(BeatlineError::invalid("bass range is empty"));
        }
        if !(self.min_bpm > 0.0 && self.min_bpm < self.max_bpm) {
            return Err(BeatlineError::invalid(format!(
                "invalid BPM range [{:.1}, {:.1}]",
                self.min_bpm, self.max_bpm
            )));
        }
        Ok(())
    }

    /// Seconds between two consecutive feature frames.
    pub fn hop_seconds(&self) -> f64 {
        self.hop_size as f64 / self.sample_rate as f64
    }

    /// Converts a duration in seconds into a frame count, never below one.
    pub fn frames_for(&self, seconds: f64) -> usize {
        ((seconds / self.hop_seconds()).round() as usize).max(1)
    }
}

/// Tuning for the background lookahead session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LookaheadConfig {
    /// Seconds of analysed audio to keep ahead of the playhead.
    pub target_ahead: f64,
    pub prime_window: f64,
    pub chunk_len: f64,
    /// Audio analysed before each chunk so windowed detectors see history.
    pub context_pad: f64,
    pub poll_interval_ms: u64,
}

impl Default for LookaheadConfig {
    fn default() -> Self {
        Self {
            target_ahead: 8.0,
            prime_window: 12.0,
            chunk_len: 6.0,
            context_pad: 2.0,
            poll_interval_ms: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Upper bound on events popped per tick.
    pub max_batch: usize,
    /// Transient kinds allowed to fire together in one coalescing group.
    pub max_transients: usize,
    /// Due events older than this many seconds are dropped as stale.
    pub late_tolerance: f64,
    /// Below this tempo confidence the flat coalescing window is used.
    pub confidence_floor: f32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_batch: 64,
            max_transients: 2,
            late_tolerance: 0.25,
            confidence_floor: 0.45,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(AnalyzerConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_hop_larger_than_frame() {
        let config = AnalyzerConfig {
            hop_size: 4096,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(BeatlineError::InvalidInput(_))
        ));
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config =
            EngineConfig::from_json_str(r#"{ "analyzer": { "hop_size": 256 }, "lead_time": 0.05 }"#)
                .unwrap();
        assert_eq!(config.analyzer.hop_size, 256);
        assert_eq!(config.analyzer.frame_size, 2048);
        assert_eq!(config.lookahead, LookaheadConfig::default());
        assert_eq!(config.lead_time, 0.05);
    }

    #[test]
    fn frame_conversion_uses_hop() {
        let config = AnalyzerConfig::default();
        let frames = config.frames_for(1.0);
        assert_eq!(frames, 43);
        assert_eq!(config.frames_for(0.0), 1);
    }
}
