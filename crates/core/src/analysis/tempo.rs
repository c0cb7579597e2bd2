//! Autocorrelation tempo estimation over the cleaned spectral-flux envelope.

use serde::{Deserialize, Serialize};

use super::stats::{self, EPSILON};
use crate::AnalyzerConfig;

const SMOOTHING_SECS: f64 = 0.12;
/// Relative gain an octave candidate needs over the current winner.
const OCTAVE_MARGIN: f32 = 1.05;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TempoEstimate {
    pub bpm: f32,
    pub confidence: f32,
}

impl TempoEstimate {
    pub fn beat_seconds(&self) -> f64 {
        60.0 / self.bpm.max(EPSILON) as f64
    }
}

#[derive(Debug, Clone)]
pub struct TempoEstimator {
    hop_seconds: f64,
    min_bpm: f32,
    max_bpm: f32,
}

impl TempoEstimator {
    pub fn new(config: &AnalyzerConfig) -> Self {
        Self {
            hop_seconds: config.hop_seconds(),
            min_bpm: config.min_bpm,
            max_bpm: config.max_bpm,
        }
    }

    /// Estimates tempo from a spectral-flux envelope. Returns `None` when the
    /// envelope is too short to hold the slowest tempo or carries no energy.
    pub fn estimate(&self, flux: &[f32]) -> Option<TempoEstimate> {
        let envelope = self.onset_envelope(flux);
        let n = envelope.len();

        let lag_min = ((60.0 / (self.max_bpm as f64 * self.hop_seconds)).floor() as usize).max(1);
        let lag_max = ((60.0 / (self.min_bpm as f64 * self.hop_seconds)).ceil() as usize).min(n / 2);
        if lag_max <= lag_min || envelope.iter().all(|v| *v <= EPSILON) {
            tracing::debug!(frames = n, "envelope too short or silent for tempo");
            return None;
        }

        let (mut best_lag, mut best_r) = (lag_min..=lag_max)
            .map(|lag| (lag, autocorrelation(&envelope, lag)))
            .fold((lag_min, f32::MIN), |acc, cur| if cur.1 > acc.1 { cur } else { acc });

        let winner = best_lag;
        let half = (winner / 2).clamp(lag_min, lag_max);
        let double = (winner * 2).clamp(lag_min, lag_max);

        let half_r = autocorrelation(&envelope, half);
        if half_r > best_r * OCTAVE_MARGIN {
            best_lag = half;
            best_r = half_r;
        }
        let double_r = autocorrelation(&envelope, double);
        if double_r > best_r * OCTAVE_MARGIN {
            best_lag = double;
            best_r = double_r;
        }

        let lag = refine_lag(&envelope, best_lag, lag_min, lag_max);
        let bpm = (60.0 / (lag * self.hop_seconds)) as f32;
        let estimate = TempoEstimate {
            bpm: bpm.clamp(self.min_bpm, self.max_bpm),
            confidence: best_r.clamp(0.0, 1.0),
        };
        tracing::debug!(bpm = estimate.bpm, confidence = estimate.confidence, "tempo estimate");
        Some(estimate)
    }

    /// First difference, half-wave rectified, box-smoothed and normalised.
    pub fn onset_envelope(&self, flux: &[f32]) -> Vec<f32> {
        if flux.is_empty() {
            return Vec::new();
        }
        let mut rectified = Vec::with_capacity(flux.len());
        rectified.push(0.0);
        for pair in flux.windows(2) {
            rectified.push((pair[1] - pair[0]).max(0.0));
        }

        let width = ((SMOOTHING_SECS / self.hop_seconds).round() as usize).max(1);
        let mut smoothed = stats::local_means(&rectified, width / 2);
        stats::normalize_max(&mut smoothed);
        smoothed
    }
}

/// Correlation of the envelope with itself shifted by `lag`, normalised by
/// the energy of both overlapping parts.
fn autocorrelation(envelope: &[f32], lag: usize) -> f32 {
    if lag >= envelope.len() {
        return 0.0;
    }
    let head = &envelope[..envelope.len() - lag];
    let tail = &envelope[lag..];
    let dot: f32 = head.iter().zip(tail).map(|(a, b)| a * b).sum();
    let e_head: f32 = head.iter().map(|v| v * v).sum();
    let e_tail: f32 = tail.iter().map(|v| v * v).sum();
    dot / (e_head * e_tail).sqrt().max(EPSILON)
}

/// Sub-frame lag from a parabola through the winner and its neighbours.
fn refine_lag(envelope: &[f32], lag: usize, lag_min: usize, lag_max: usize) -> f64 {
    if lag <= lag_min.max(1) || lag >= lag_max {
        return lag as f64;
    }
    let left = autocorrelation(envelope, lag - 1);
    let center = autocorrelation(envelope, lag);
    let right = autocorrelation(envelope, lag + 1);
    let curvature = left - 2.0 * center + right;
    if curvature.abs() <= EPSILON {
        return lag as f64;
    }
    let delta = (0.5 * (left - right) / curvature).clamp(-0.5, 0.5);
    lag as f64 + delta as f64
}
