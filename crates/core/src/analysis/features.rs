use std::{f32::consts::PI, fmt, sync::Arc};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};
use tokio_util::sync::CancellationToken;

use super::{
    stats::{self, EPSILON},
    timed,
};
use crate::{AnalyzerConfig, Result};

/// Centre frequencies of the fixed energy bands, in Hz.
pub const BAND_CENTERS: [f32; 6] = [250.0, 500.0, 1000.0, 2000.0, 4000.0, 8000.0];

const C4_HZ: f32 = 261.6256;
const CHROMA_MIN_HZ: f32 = 20.0;
const CHROMA_MAX_HZ: f32 = 5000.0;
const PITCH_MIN_HZ: f32 = 120.0;
const PITCH_MAX_HZ: f32 = 800.0;
const PITCH_STRIDE: usize = 4;
const PITCH_DECAY: f32 = 0.85;
/// Frames quieter than this carry no pitch confidence.
pub(crate) const ENERGY_FLOOR_DB: f32 = -45.0;
const VOCAL_GATE: f32 = 0.3;
const VOCAL_BOOST: f32 = 0.5;
const VOCAL_BAND_MAX_HZ: f32 = 4000.0;
const SLOPE_WINDOW_SECS: f64 = 1.0;
const SLOPE_FLOOR_DB: f32 = -60.0;
const DENSITY_RADIUS_SECS: f64 = 1.0;

/// Per-hop feature arrays, all index-aligned with `times`.
#[derive(Debug, Clone, Default)]
pub struct FeatureFrames {
    pub times: Vec<f64>,
    pub hop_seconds: f64,
    pub magnitudes: Vec<Vec<f32>>,
    /// Positive spectral change, max-normalised over the analysed range.
    pub flux: Vec<f32>,
    pub bass: Vec<f32>,
    pub chroma: Vec<[f32; 12]>,
    pub rms_db: Vec<f32>,
    pub pitch_confidence: Vec<f32>,
    pub band_energies: Vec<[f32; 6]>,
    pub centroid: Vec<f32>,
    /// Onsets per second within one second either side. Filled in by
    /// [`FeatureFrames::set_onset_density`] once onsets are known.
    pub onset_density: Vec<f32>,
    /// dB per frame, zero where the regression window does not fit.
    pub energy_slope: Vec<f32>,
}

impl FeatureFrames {
    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// Mean of the 500 Hz, 1 kHz and 2 kHz bands.
    pub fn midband(&self, index: usize) -> f32 {
        let bands = &self.band_energies[index];
        (bands[1] + bands[2] + bands[3]) / 3.0
    }

    pub fn frames_for(&self, seconds: f64) -> usize {
        if self.hop_seconds <= 0.0 {
            return 1;
        }
        ((seconds / self.hop_seconds).round() as usize).max(1)
    }

    /// Counts onsets within one second of every frame. `onset_times` must be
    /// sorted ascending.
    pub fn set_onset_density(&mut self, onset_times: &[f64]) {
        self.onset_density = self
            .times
            .iter()
            .map(|&t| {
                let lo = onset_times.partition_point(|&o| o < t - DENSITY_RADIUS_SECS);
                let hi = onset_times.partition_point(|&o| o <= t + DENSITY_RADIUS_SECS);
                (hi - lo) as f32 / (2.0 * DENSITY_RADIUS_SECS) as f32
            })
            .collect();
    }
}

/// Turns mono PCM into [`FeatureFrames`] with a Hann-windowed real FFT per hop.
pub struct FeatureExtractor {
    config: AnalyzerConfig,
    window: Vec<f32>,
    fft_planner: RealFftPlanner<f32>,
    fft: Option<FftResources>,
}

impl FeatureExtractor {
    pub fn new(config: &AnalyzerConfig) -> Self {
        Self {
            config: config.clone(),
            window: hann_window(config.frame_size),
            fft_planner: RealFftPlanner::new(),
            fft: None,
        }
    }

    /// Extracts every feature except onset density.
    ///
    /// Frames are centred on `offset + i * hop / sample_rate`. Returns
    /// `Ok(None)` as soon as `cancel` fires at one of the step checkpoints.
    pub fn extract(
        &mut self,
        samples: &[f32],
        offset: f64,
        cancel: &CancellationToken,
    ) -> Result<Option<FeatureFrames>> {
        if samples.is_empty() {
            return Ok(Some(FeatureFrames {
                hop_seconds: self.config.hop_seconds(),
                ..Default::default()
            }));
        }
        if cancel.is_cancelled() {
            return Ok(None);
        }

        let hop = self.config.hop_size;
        let count = samples.len() / hop + 1;
        let hop_seconds = self.config.hop_seconds();

        let (magnitudes, rms_db) = timed("spectrum", || self.spectral_pass(samples, count))?;
        if cancel.is_cancelled() {
            return Ok(None);
        }

        let bin_hz = self.config.sample_rate as f32 / self.config.frame_size as f32;
        let flux = timed("flux", || spectral_flux(&magnitudes));
        let bass = timed("bass", || {
            band_sum(&magnitudes, bin_hz, self.config.bass_low_hz, self.config.bass_high_hz)
        });
        let chroma = timed("chroma", || chroma_frames(&magnitudes, bin_hz));
        let centroid = timed("centroid", || spectral_centroid(&magnitudes, bin_hz));
        if cancel.is_cancelled() {
            return Ok(None);
        }

        let pitch_confidence = timed("pitch", || self.pitch_pass(samples, count, &rms_db));
        if cancel.is_cancelled() {
            return Ok(None);
        }

        let band_energies = timed("bands", || {
            band_energies(&magnitudes, bin_hz, &pitch_confidence)
        });
        let slope_window = self.config.frames_for(SLOPE_WINDOW_SECS) | 1;
        let energy_slope = timed("slope", || energy_slope(&rms_db, slope_window));

        tracing::trace!(frames = count, offset, "extracted features");

        Ok(Some(FeatureFrames {
            times: (0..count).map(|i| offset + i as f64 * hop_seconds).collect(),
            hop_seconds,
            magnitudes,
            flux,
            bass,
            chroma,
            rms_db,
            pitch_confidence,
            band_energies,
            centroid,
            onset_density: vec![0.0; count],
            energy_slope,
        }))
    }

    fn spectral_pass(&mut self, samples: &[f32], count: usize) -> Result<(Vec<Vec<f32>>, Vec<f32>)> {
        let frame_size = self.config.frame_size;
        let hop = self.config.hop_size;
        let mut frame = vec![0.0_f32; frame_size];
        let mut magnitudes = Vec::with_capacity(count);
        let mut rms_db = Vec::with_capacity(count);

        self.prepare_fft()?;
        let window = &self.window;
        let fft = self
            .fft
            .as_mut()
            .ok_or_else(|| crate::BeatlineError::Fft("fft resources missing".into()))?;

        for index in 0..count {
            fill_frame(samples, index * hop, &mut frame);
            let energy: f32 = frame.iter().map(|s| s * s).sum();
            let rms = (energy / frame_size as f32).sqrt();
            rms_db.push(20.0 * rms.max(1e-6).log10());

            for ((slot, sample), w) in fft.input.iter_mut().zip(&frame).zip(window) {
                *slot = sample * w;
            }
            fft.plan
                .process_with_scratch(&mut fft.input, &mut fft.spectrum, &mut fft.scratch)?;
            magnitudes.push(fft.spectrum.iter().map(|bin| bin.norm()).collect());
        }

        Ok((magnitudes, rms_db))
    }

    fn pitch_pass(&self, samples: &[f32], count: usize, rms_db: &[f32]) -> Vec<f32> {
        let sample_rate = self.config.sample_rate as f32;
        let min_lag = ((sample_rate / PITCH_MAX_HZ).floor() as usize).max(1);
        let max_lag = (sample_rate / PITCH_MIN_HZ).ceil() as usize;
        let mut frame = vec![0.0_f32; self.config.frame_size];
        let mut confidence = vec![0.0_f32; count];

        let mut computed = Vec::new();
        for index in (0..count).step_by(PITCH_STRIDE) {
            confidence[index] = if rms_db[index] < ENERGY_FLOOR_DB {
                0.0
            } else {
                fill_frame(samples, index * self.config.hop_size, &mut frame);
                autocorrelation_peak(&frame, min_lag, max_lag)
            };
            computed.push(index);
        }
        fill_strides(&mut confidence, &computed);

        for (value, db) in confidence.iter_mut().zip(rms_db) {
            if *db < ENERGY_FLOOR_DB {
                *value = 0.0;
            }
        }
        confidence
    }

    fn prepare_fft(&mut self) -> Result<()> {
        let size = self.config.frame_size;
        let rebuild = self
            .fft
            .as_ref()
            .map(|fft| fft.size != size)
            .unwrap_or(true);

        if rebuild {
            let plan = self.fft_planner.plan_fft_forward(size);
            let scratch = plan.make_scratch_vec();
            let spectrum = plan.make_output_vec();
            let input = plan.make_input_vec();
            self.fft = Some(FftResources {
                size,
                plan,
                scratch,
                spectrum,
                input,
            });
        }

        Ok(())
    }
}

struct FftResources {
    size: usize,
    plan: Arc<dyn RealToComplex<f32>>,
    scratch: Vec<Complex32>,
    spectrum: Vec<Complex32>,
    input: Vec<f32>,
}

impl fmt::Debug for FeatureExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeatureExtractor")
            .field("frame_size", &self.config.frame_size)
            .field("hop_size", &self.config.hop_size)
            .field("fft_ready", &self.fft.is_some())
            .finish()
    }
}

/// Copies the frame centred on `center`, zero-filling outside the buffer.
fn fill_frame(samples: &[f32], center: usize, frame: &mut [f32]) {
    let half = frame.len() / 2;
    for (j, slot) in frame.iter_mut().enumerate() {
        *slot = (center + j)
            .checked_sub(half)
            .and_then(|idx| samples.get(idx))
            .copied()
            .unwrap_or(0.0);
    }
}

fn hann_window(len: usize) -> Vec<f32> {
    if len <= 1 {
        return vec![1.0; len];
    }
    (0..len)
        .map(|i| 0.5 - 0.5 * ((2.0 * PI * i as f32) / (len as f32 - 1.0)).cos())
        .collect()
}

fn spectral_flux(magnitudes: &[Vec<f32>]) -> Vec<f32> {
    let mut flux = Vec::with_capacity(magnitudes.len());
    flux.push(0.0);
    for pair in magnitudes.windows(2) {
        let rise: f32 = pair[1]
            .iter()
            .zip(&pair[0])
            .map(|(now, prev)| (now - prev).max(0.0))
            .sum();
        flux.push(rise);
    }
    flux.truncate(magnitudes.len());
    stats::normalize_max(&mut flux);
    flux
}

fn band_sum(magnitudes: &[Vec<f32>], bin_hz: f32, low: f32, high: f32) -> Vec<f32> {
    let first = (low / bin_hz).ceil() as usize;
    let last = (high / bin_hz).floor() as usize;
    let mut energy: Vec<f32> = magnitudes
        .iter()
        .map(|frame| {
            frame
                .iter()
                .take(last + 1)
                .skip(first)
                .sum::<f32>()
        })
        .collect();
    stats::normalize_max(&mut energy);
    energy
}

fn pitch_class(freq: f32) -> Option<usize> {
    if !(CHROMA_MIN_HZ..=CHROMA_MAX_HZ).contains(&freq) {
        return None;
    }
    let semitone = (12.0 * (freq / C4_HZ).log2()).round() as i64;
    Some(semitone.rem_euclid(12) as usize)
}

fn chroma_frames(magnitudes: &[Vec<f32>], bin_hz: f32) -> Vec<[f32; 12]> {
    let bins = magnitudes.first().map(Vec::len).unwrap_or(0);
    let classes: Vec<Option<usize>> = (0..bins).map(|k| pitch_class(k as f32 * bin_hz)).collect();

    magnitudes
        .iter()
        .map(|frame| {
            let mut chroma = [0.0_f32; 12];
            for (mag, class) in frame.iter().zip(&classes) {
                if let Some(pc) = class {
                    chroma[*pc] += mag;
                }
            }
            stats::normalize_max(&mut chroma);
            chroma
        })
        .collect()
}

fn spectral_centroid(magnitudes: &[Vec<f32>], bin_hz: f32) -> Vec<f32> {
    let mut centroid: Vec<f32> = magnitudes
        .iter()
        .map(|frame| {
            let mut weighted = 0.0;
            let mut total = 0.0;
            for (k, mag) in frame.iter().enumerate() {
                weighted += mag * k as f32 * bin_hz;
                total += mag;
            }
            weighted / total.max(EPSILON)
        })
        .collect();
    stats::normalize_max(&mut centroid);
    centroid
}

/// Octave-wide band energies normalised by bandwidth, then by the largest
/// value across every band and frame, then lifted in the vocal range while
/// the frame is pitched.
fn band_energies(magnitudes: &[Vec<f32>], bin_hz: f32, pitch: &[f32]) -> Vec<[f32; 6]> {
    let mut bands: Vec<[f32; 6]> = magnitudes
        .iter()
        .map(|frame| {
            let mut out = [0.0_f32; 6];
            for (slot, center) in out.iter_mut().zip(BAND_CENTERS) {
                let low = center / std::f32::consts::SQRT_2;
                let high = center * std::f32::consts::SQRT_2;
                let first = (low / bin_hz).ceil() as usize;
                let last = ((high / bin_hz).floor() as usize).min(frame.len().saturating_sub(1));
                let sum: f32 = frame.iter().take(last + 1).skip(first).sum();
                *slot = sum / (high - low).max(EPSILON);
            }
            out
        })
        .collect();

    let max = bands
        .iter()
        .flat_map(|b| b.iter().copied())
        .fold(0.0_f32, f32::max);
    for (frame, confidence) in bands.iter_mut().zip(pitch) {
        for (value, center) in frame.iter_mut().zip(BAND_CENTERS) {
            *value /= max.max(EPSILON);
            if *confidence > VOCAL_GATE && center <= VOCAL_BAND_MAX_HZ {
                let octaves = (center / 1000.0).log2();
                let weight = (-0.5 * octaves * octaves).exp();
                *value = (*value * (1.0 + VOCAL_BOOST * confidence * weight)).min(1.0);
            }
        }
    }
    bands
}

/// Linear interpolation between the `computed` frames, then a geometric
/// decay after the last one.
fn fill_strides(confidence: &mut [f32], computed: &[usize]) {
    for pair in computed.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        let (va, vb) = (confidence[a], confidence[b]);
        for i in a + 1..b {
            let frac = (i - a) as f32 / (b - a) as f32;
            confidence[i] = va + (vb - va) * frac;
        }
    }
    if let Some(&last) = computed.last() {
        let mut value = confidence[last];
        for slot in confidence.iter_mut().skip(last + 1) {
            value *= PITCH_DECAY;
            *slot = value;
        }
    }
}

fn energy_slope(rms_db: &[f32], window: usize) -> Vec<f32> {
    let half = window / 2;
    let floored: Vec<f32> = rms_db.iter().map(|db| db.max(SLOPE_FLOOR_DB)).collect();
    (0..floored.len())
        .map(|i| {
            if i < half || i + half >= floored.len() {
                0.0
            } else {
                stats::linear_slope(&floored[i - half..=i + half])
            }
        })
        .collect()
}

/// Highest normalised autocorrelation among the interior peaks of
/// `min_lag..=max_lag`. A correlation that only decays across the range (low
/// bass, DC) has no interior peak and scores zero.
fn autocorrelation_peak(frame: &[f32], min_lag: usize, max_lag: usize) -> f32 {
    let len = frame.len();
    if len < 4 {
        return 0.0;
    }
    let mut prefix = Vec::with_capacity(len + 1);
    prefix.push(0.0_f32);
    for s in frame {
        let last = prefix[prefix.len() - 1];
        prefix.push(last + s * s);
    }
    if prefix[len] <= EPSILON {
        return 0.0;
    }

    let first = min_lag.saturating_sub(1).max(1);
    let last = (max_lag + 1).min(len - 1);
    let correlation: Vec<f32> = (first..=last)
        .map(|lag| {
            let dot: f32 = frame[..len - lag]
                .iter()
                .zip(&frame[lag..])
                .map(|(a, b)| a * b)
                .sum();
            let head = prefix[len - lag];
            let tail = prefix[len] - prefix[lag];
            dot / (head * tail).sqrt().max(EPSILON)
        })
        .collect();

    let mut best = 0.0_f32;
    for i in 1..correlation.len().saturating_sub(1) {
        let r = correlation[i];
        if r > correlation[i - 1] && r >= correlation[i + 1] {
            best = best.max(r);
        }
    }
    best.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, seconds: f32, sample_rate: u32, amplitude: f32) -> Vec<f32> {
        let len = (seconds * sample_rate as f32) as usize;
        (0..len)
            .map(|i| amplitude * (2.0 * PI * freq * i as f32 / sample_rate as f32).sin())
            .collect()
    }

    fn extract(samples: &[f32]) -> FeatureFrames {
        let config = AnalyzerConfig::default();
        let mut extractor = FeatureExtractor::new(&config);
        extractor
            .extract(samples, 0.0, &CancellationToken::new())
            .unwrap()
            .expect("not cancelled")
    }

    #[test]
    fn empty_input_yields_no_frames() {
        let frames = extract(&[]);
        assert!(frames.is_empty());
    }

    #[test]
    fn arrays_are_index_aligned() {
        let frames = extract(&sine(440.0, 1.0, 22_050, 0.5));
        let n = frames.len();
        assert!(n > 40);
        assert_eq!(frames.flux.len(), n);
        assert_eq!(frames.chroma.len(), n);
        assert_eq!(frames.band_energies.len(), n);
        assert_eq!(frames.energy_slope.len(), n);
        assert_eq!(frames.onset_density.len(), n);
        assert!((frames.times[1] - 512.0 / 22_050.0).abs() < 1e-9);
    }

    #[test]
    fn a440_folds_into_pitch_class_a() {
        let frames = extract(&sine(440.0, 1.0, 22_050, 0.5));
        let middle = frames.len() / 2;
        let chroma = frames.chroma[middle];
        let strongest = chroma
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(strongest, 9);
        assert_eq!(chroma[9], 1.0);
    }

    #[test]
    fn sine_is_pitched_and_silence_is_not() {
        let mut samples = sine(220.0, 1.0, 22_050, 0.5);
        samples.extend(std::iter::repeat(0.0).take(22_050));
        let frames = extract(&samples);
        let middle = frames.len() / 4;
        assert!(frames.pitch_confidence[middle] > 0.9);
        assert_eq!(*frames.pitch_confidence.last().unwrap(), 0.0);
        assert!(*frames.rms_db.last().unwrap() <= -119.0);
    }

    #[test]
    fn normalised_features_stay_in_unit_range() {
        let mut samples = sine(80.0, 0.5, 22_050, 0.8);
        samples.extend(sine(3000.0, 0.5, 22_050, 0.3));
        let frames = extract(&samples);
        for i in 0..frames.len() {
            for value in [frames.flux[i], frames.bass[i], frames.centroid[i]] {
                assert!((0.0..=1.0).contains(&value));
            }
            assert!(frames.band_energies[i].iter().all(|v| (0.0..=1.0).contains(v)));
        }
        assert!(frames.bass[frames.len() / 4] > frames.bass[3 * frames.len() / 4]);
    }

    #[test]
    fn onset_density_counts_two_second_window() {
        let mut frames = extract(&vec![0.1; 22_050 * 3]);
        frames.set_onset_density(&[1.0, 1.2, 1.4, 2.9]);
        let at = |t: f64| {
            let i = frames.times.iter().position(|&x| x >= t).unwrap();
            frames.onset_density[i]
        };
        assert_eq!(at(1.2), 1.5);
        assert_eq!(at(0.0), 0.5);
    }

    #[test]
    fn cancelled_token_stops_extraction() {
        let config = AnalyzerConfig::default();
        let mut extractor = FeatureExtractor::new(&config);
        let token = CancellationToken::new();
        token.cancel();
        let result = extractor.extract(&[0.5; 4096], 0.0, &token).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn low_bass_is_not_pitched() {
        let frames = extract(&sine(60.0, 1.0, 22_050, 0.5));
        assert!(frames.pitch_confidence[frames.len() / 2] < 0.3);
    }

    #[test]
    fn pitch_between_strides_is_interpolated_then_decays() {
        let mut confidence = [0.2_f32, 0.0, 0.0, 0.0, 0.6, 0.0, 0.0];
        fill_strides(&mut confidence, &[0, 4]);
        let expected: [f32; 7] = [0.2, 0.3, 0.4, 0.5, 0.6, 0.6 * 0.85, 0.6 * 0.85 * 0.85];
        for (got, want) in confidence.iter().zip(expected) {
            assert!((got - want).abs() < 1e-6, "{confidence:?}");
        }
    }

    #[test]
    fn pitched_frames_lift_the_vocal_bands() {
        let bin_hz = 22_050.0 / 2048.0;
        let loud = vec![4.0_f32; 1025];
        let quiet = vec![1.0_f32; 1025];
        let bands = band_energies(&[loud, quiet.clone(), quiet], bin_hz, &[0.0, 0.0, 1.0]);
        let (plain, voiced) = (bands[1], bands[2]);

        // 1 kHz sits at the centre of the lift.
        assert!((voiced[2] - plain[2] * (1.0 + VOCAL_BOOST)).abs() < 1e-5);
        assert!(voiced[0] > plain[0]);
        assert!(voiced[0] / plain[0] < voiced[2] / plain[2]);
        // 8 kHz is above the vocal range.
        assert_eq!(voiced[5], plain[5]);
    }

    #[test]
    fn rising_level_has_positive_slope() {
        let samples: Vec<f32> = (0..22_050 * 3)
            .map(|i| {
                let gain = i as f32 / (22_050.0 * 3.0);
                gain * (2.0 * PI * 300.0 * i as f32 / 22_050.0).sin()
            })
            .collect();
        let frames = extract(&samples);
        let middle = frames.len() / 2;
        assert!(frames.energy_slope[middle] > 0.0);
        assert_eq!(frames.energy_slope[0], 0.0);
    }
}
