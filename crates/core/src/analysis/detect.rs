//! Rule-based event detectors. Each pass reads [`FeatureFrames`] and emits
//! zero or more events of its kinds; [`EventDetector::detect`] runs them all
//! and merges the output by time.

use tokio_util::sync::CancellationToken;

use super::{
    features::{FeatureFrames, ENERGY_FLOOR_DB},
    stats::{self, EPSILON},
    timed,
};
use crate::{
    event::{sort_events, BeatEvent, EventPayload},
    AnalyzerConfig,
};

const MIN_PEAK: f32 = 0.05;

const DROP_LOOKBACK_SECS: f64 = 0.8;
const DROP_SURROUND_SECS: f64 = 1.5;

const CHORUS_WINDOW: usize = 8;
const CHORUS_STRIDE: usize = 4;
const CHORUS_SIMILARITY: f32 = 0.55;
const CHORUS_MIN_DB: f32 = -25.0;
const CHORUS_RELEASE_SECS: f64 = 1.0;

const NOVELTY_RATIO: f32 = 1.4;
const NOVELTY_RADIUS_SECS: f64 = 2.0;
const MIN_NOVELTY: f32 = 0.05;
const SECTION_SPACING_SECS: f64 = 1.0;

const VOCAL_PITCH: f32 = 0.5;
const VOCAL_MIDBAND: f32 = 0.3;
const VOCAL_RELEASE_SECS: f64 = 0.25;
const MIN_PHRASE_SECS: f64 = 0.3;

const BUILD_SLOPE: f32 = 0.08;
const BUILD_DENSITY: f32 = 2.0;
const BUILD_SLOPE_FULL: f32 = 0.3;

const BREAKDOWN_DROP_DB: f32 = 6.0;
const BREAKDOWN_MIN_SECS: f64 = 0.4;
const BREAKDOWN_MAX_SECS: f64 = 0.8;
const BREAKDOWN_REFERENCE_SECS: f64 = 1.0;
const BREAKDOWN_FLOOR_DB: f32 = -60.0;
const BREAKDOWN_FULL_DB: f32 = 24.0;

const BRIGHTNESS_RATIO: f32 = 1.5;
const BRIGHTNESS_RADIUS_SECS: f64 = 0.5;
const MIN_CENTROID: f32 = 0.1;
const BRIGHTNESS_SPACING_SECS: f64 = 0.25;

const SUSTAIN_WINDOW: usize = 30;
const SUSTAIN_DENSITY: f32 = 2.0;
const SUSTAIN_VARIANCE: f32 = 0.15;

#[derive(Debug, Clone, Copy)]
struct Peak {
    index: usize,
    value: f32,
    strength: f32,
}

#[derive(Debug, Clone)]
pub struct EventDetector {
    config: AnalyzerConfig,
}

impl EventDetector {
    pub fn new(config: &AnalyzerConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Runs every pass and returns the merged, time-sorted events.
    ///
    /// Onsets are detected first so `frames.onset_density` can be filled in
    /// for the passes that depend on it. Returns `None` when `cancel` fires
    /// between passes.
    pub fn detect(
        &self,
        frames: &mut FeatureFrames,
        cancel: &CancellationToken,
    ) -> Option<Vec<BeatEvent>> {
        if frames.is_empty() {
            return Some(Vec::new());
        }
        if cancel.is_cancelled() {
            return None;
        }

        let onsets = timed("onset", || {
            adaptive_peaks(
                &frames.flux,
                frames.frames_for(self.config.flux_window as f64 / 2.0),
                self.config.flux_multiplier,
            )
        });
        let onset_times: Vec<f64> = onsets.iter().map(|p| frames.times[p.index]).collect();
        frames.set_onset_density(&onset_times);

        let frames = &*frames;
        let mut events: Vec<BeatEvent> = onsets
            .iter()
            .map(|p| {
                BeatEvent::new(
                    frames.times[p.index],
                    p.strength,
                    EventPayload::Onset { flux: p.value },
                )
            })
            .collect();

        let passes: [(&'static str, &dyn Fn() -> Vec<BeatEvent>); 9] = [
            ("bass", &|| self.bass(frames)),
            ("drop", &|| self.drops(frames, &onsets)),
            ("chorus", &|| chorus(frames)),
            ("section", &|| section_boundaries(frames)),
            ("vocal", &|| vocals(frames)),
            ("build_up", &|| build_ups(frames)),
            ("breakdown", &|| breakdowns(frames)),
            ("brightness", &|| brightness_spikes(frames)),
            ("sustain", &|| sustains(frames)),
        ];
        for (name, pass) in passes {
            if cancel.is_cancelled() {
                return None;
            }
            events.extend(timed(name, pass));
        }

        sort_events(&mut events);
        Some(events)
    }

    fn bass(&self, frames: &FeatureFrames) -> Vec<BeatEvent> {
        adaptive_peaks(
            &frames.bass,
            frames.frames_for(self.config.bass_window as f64 / 2.0),
            self.config.bass_multiplier,
        )
        .into_iter()
        .map(|p| {
            BeatEvent::new(
                frames.times[p.index],
                p.strength,
                EventPayload::Bass { energy: p.value },
            )
        })
        .collect()
    }

    /// Loud onsets that follow a quiet stretch.
    fn drops(&self, frames: &FeatureFrames, onsets: &[Peak]) -> Vec<BeatEvent> {
        let global_max = frames.flux.iter().copied().fold(0.0_f32, f32::max);
        let lookback = frames.frames_for(DROP_LOOKBACK_SECS);
        let surround = frames.frames_for(DROP_SURROUND_SECS / 2.0);

        onsets
            .iter()
            .filter(|p| p.index > 0 && p.value >= self.config.drop_threshold * global_max)
            .filter_map(|p| {
                let preceding = &frames.flux[p.index.saturating_sub(lookback)..p.index];
                let preceding_mean = stats::mean(preceding);
                let range = stats::window(p.index, surround, frames.len());
                let surround_median = stats::median(&frames.flux[range]);
                (preceding_mean < 0.5 * surround_median).then(|| {
                    BeatEvent::new(
                        frames.times[p.index],
                        p.value / global_max.max(EPSILON),
                        EventPayload::Drop {
                            flux: p.value,
                            preceding_mean,
                        },
                    )
                })
            })
            .collect()
    }
}

/// Local maxima above `multiplier` times the centred local mean.
fn adaptive_peaks(values: &[f32], radius: usize, multiplier: f32) -> Vec<Peak> {
    let means = stats::local_means(values, radius);
    values
        .iter()
        .enumerate()
        .filter_map(|(index, &value)| {
            let threshold = means[index] * multiplier;
            if value < MIN_PEAK || value <= threshold || !stats::is_local_max(values, index) {
                return None;
            }
            Some(Peak {
                index,
                value,
                strength: (value - threshold) / value.max(EPSILON),
            })
        })
        .collect()
}

fn chorus(frames: &FeatureFrames) -> Vec<BeatEvent> {
    let release = frames.frames_for(CHORUS_RELEASE_SECS);
    let mut events = Vec::new();
    let mut open: Option<usize> = None;
    let mut quiet_since: Option<usize> = None;

    let mut end = CHORUS_WINDOW;
    while end <= frames.len() {
        let start = end - CHORUS_WINDOW;
        let chroma = &frames.chroma[start..end];
        let mut similarity = 0.0_f32;
        for a in 0..chroma.len() {
            for b in a + 1..chroma.len() {
                similarity = similarity.max(stats::cosine_similarity(&chroma[a], &chroma[b]));
            }
        }
        let loud = stats::mean(&frames.rms_db[start..end]) > CHORUS_MIN_DB;
        let active = similarity > CHORUS_SIMILARITY && loud;

        match (open, active) {
            (None, true) => {
                events.push(BeatEvent::new(
                    frames.times[start],
                    similarity,
                    EventPayload::ChorusStart { similarity },
                ));
                open = Some(start);
                quiet_since = None;
            }
            (Some(_), true) => quiet_since = None,
            (Some(opened), false) => {
                let since = *quiet_since.get_or_insert(start);
                if end - since >= release {
                    let duration = (frames.times[since] - frames.times[opened]) as f32;
                    events.push(BeatEvent::new(
                        frames.times[since],
                        1.0,
                        EventPayload::ChorusEnd { duration },
                    ));
                    open = None;
                    quiet_since = None;
                }
            }
            (None, false) => {}
        }
        end += CHORUS_STRIDE;
    }
    events
}

fn section_boundaries(frames: &FeatureFrames) -> Vec<BeatEvent> {
    let mut novelty = vec![0.0_f32; frames.len()];
    for i in 1..frames.len() {
        let audible = frames.rms_db[i] >= ENERGY_FLOOR_DB && frames.rms_db[i - 1] >= ENERGY_FLOOR_DB;
        if audible {
            let diff: f32 = frames.chroma[i]
                .iter()
                .zip(&frames.chroma[i - 1])
                .map(|(a, b)| (a - b).abs())
                .sum();
            novelty[i] = diff / 12.0;
        }
    }

    let means = stats::local_means(&novelty, frames.frames_for(NOVELTY_RADIUS_SECS));
    let mut events: Vec<BeatEvent> = Vec::new();
    for i in 0..novelty.len() {
        let threshold = NOVELTY_RATIO * means[i];
        let value = novelty[i];
        if value < MIN_NOVELTY || value <= threshold || !stats::is_local_max(&novelty, i) {
            continue;
        }
        if let Some(last) = events.last() {
            if frames.times[i] - last.t() < SECTION_SPACING_SECS {
                continue;
            }
        }
        events.push(BeatEvent::new(
            frames.times[i],
            (value - threshold) / value.max(EPSILON),
            EventPayload::SectionBoundary { novelty: value },
        ));
    }
    events
}

/// `vocalIn` on the rising edge of pitched midband energy and `vocalPhrase`
/// when that section closes.
fn vocals(frames: &FeatureFrames) -> Vec<BeatEvent> {
    let release = frames.frames_for(VOCAL_RELEASE_SECS);
    let mut events = Vec::new();
    let mut opened: Option<usize> = None;
    let mut pitch_sum = 0.0_f32;
    let mut voiced_frames = 0_usize;
    let mut misses = 0_usize;

    for i in 0..frames.len() {
        let pitch = frames.pitch_confidence[i];
        let midband = frames.midband(i);
        let voiced = pitch > VOCAL_PITCH && midband > VOCAL_MIDBAND;

        let Some(start) = opened else {
            if voiced {
                events.push(BeatEvent::new(
                    frames.times[i],
                    pitch,
                    EventPayload::VocalIn {
                        pitch_confidence: pitch,
                        midband,
                    },
                ));
                opened = Some(i);
                pitch_sum = pitch;
                voiced_frames = 1;
                misses = 0;
            }
            continue;
        };

        if voiced {
            pitch_sum += pitch;
            voiced_frames += 1;
            misses = 0;
            continue;
        }

        misses += 1;
        if misses >= release {
            let end = i + 1 - misses;
            let duration = frames.times[end] - frames.times[start];
            if duration >= MIN_PHRASE_SECS {
                let mean_pitch = pitch_sum / voiced_frames.max(1) as f32;
                events.push(BeatEvent::new(
                    frames.times[end],
                    mean_pitch,
                    EventPayload::VocalPhrase {
                        duration: duration as f32,
                        mean_pitch_confidence: mean_pitch,
                    },
                ));
            }
            opened = None;
        }
    }
    events
}

fn build_ups(frames: &FeatureFrames) -> Vec<BeatEvent> {
    let mut events = Vec::new();
    let mut building = false;
    for i in 0..frames.len() {
        let slope = frames.energy_slope[i];
        let density = frames.onset_density[i];
        let active = slope > BUILD_SLOPE && density > BUILD_DENSITY;
        if active && !building {
            events.push(BeatEvent::new(
                frames.times[i],
                slope / BUILD_SLOPE_FULL,
                EventPayload::BuildUp {
                    slope,
                    onset_density: density,
                },
            ));
        }
        building = active;
    }
    events
}

enum BreakdownState {
    Idle,
    Tracking { start: usize, reference: f32, deepest: f32 },
    Holding { reference: f32 },
}

/// Level dips of more than 6 dB below the preceding second that last between
/// 0.4 s and 0.8 s. A dip is finalised when the level recovers or when it
/// reaches the upper bound, whichever comes first.
fn breakdowns(frames: &FeatureFrames) -> Vec<BeatEvent> {
    let levels: Vec<f32> = frames.rms_db.iter().map(|db| db.max(BREAKDOWN_FLOOR_DB)).collect();
    let reference_len = frames.frames_for(BREAKDOWN_REFERENCE_SECS);
    let mut events = Vec::new();
    let mut state = BreakdownState::Idle;

    let emit = |events: &mut Vec<BeatEvent>, start: usize, duration: f64, deepest: f32| {
        events.push(BeatEvent::new(
            frames.times[start],
            deepest / BREAKDOWN_FULL_DB,
            EventPayload::Breakdown {
                drop_db: deepest,
                duration: duration as f32,
            },
        ));
    };

    for i in 0..levels.len() {
        let level = levels[i];
        state = match state {
            BreakdownState::Idle if i >= reference_len => {
                let reference = stats::median(&levels[i - reference_len..i]);
                if reference - level > BREAKDOWN_DROP_DB {
                    BreakdownState::Tracking {
                        start: i,
                        reference,
                        deepest: reference - level,
                    }
                } else {
                    BreakdownState::Idle
                }
            }
            BreakdownState::Idle => BreakdownState::Idle,
            BreakdownState::Tracking {
                start,
                reference,
                deepest,
            } => {
                let drop = reference - level;
                let duration = frames.times[i] - frames.times[start];
                if drop > BREAKDOWN_DROP_DB {
                    let deepest = deepest.max(drop);
                    if duration >= BREAKDOWN_MAX_SECS {
                        emit(&mut events, start, BREAKDOWN_MAX_SECS, deepest);
                        BreakdownState::Holding { reference }
                    } else {
                        BreakdownState::Tracking {
                            start,
                            reference,
                            deepest,
                        }
                    }
                } else {
                    if duration >= BREAKDOWN_MIN_SECS {
                        emit(&mut events, start, duration, deepest);
                    }
                    BreakdownState::Idle
                }
            }
            BreakdownState::Holding { reference } => {
                if reference - level > BREAKDOWN_DROP_DB {
                    BreakdownState::Holding { reference }
                } else {
                    BreakdownState::Idle
                }
            }
        };
    }
    events
}

fn brightness_spikes(frames: &FeatureFrames) -> Vec<BeatEvent> {
    let means = stats::local_means(&frames.centroid, frames.frames_for(BRIGHTNESS_RADIUS_SECS));
    let mut events: Vec<BeatEvent> = Vec::new();
    for i in 0..frames.len() {
        let value = frames.centroid[i];
        let threshold = BRIGHTNESS_RATIO * means[i];
        if value < MIN_CENTROID
            || value <= threshold
            || frames.rms_db[i] < ENERGY_FLOOR_DB
            || !stats::is_local_max(&frames.centroid, i)
        {
            continue;
        }
        if let Some(last) = events.last() {
            if frames.times[i] - last.t() < BRIGHTNESS_SPACING_SECS {
                continue;
            }
        }
        events.push(BeatEvent::new(
            frames.times[i],
            (value - threshold) / value.max(EPSILON),
            EventPayload::BrightnessSpike { centroid: value },
        ));
    }
    events
}

/// Quiet-onset, steady-level stretches, checked over consecutive 30-frame
/// windows and reported once per stretch.
fn sustains(frames: &FeatureFrames) -> Vec<BeatEvent> {
    let linear: Vec<f32> = frames
        .rms_db
        .iter()
        .map(|db| 10.0_f32.powf(db / 20.0))
        .collect();
    let peak = linear.iter().copied().fold(0.0_f32, f32::max).max(EPSILON);
    let normalized: Vec<f32> = linear.iter().map(|v| v / peak).collect();

    let mut events = Vec::new();
    let mut sustaining = false;
    let mut start = 0;
    while start + SUSTAIN_WINDOW <= frames.len() {
        let range = start..start + SUSTAIN_WINDOW;
        let density = stats::mean(&frames.onset_density[range.clone()]);
        let variance = stats::variance(&normalized[range.clone()]);
        let audible = stats::mean(&frames.rms_db[range]) >= ENERGY_FLOOR_DB;
        let active = audible && density < SUSTAIN_DENSITY && variance < SUSTAIN_VARIANCE;
        if active && !sustaining {
            events.push(BeatEvent::new(
                frames.times[start],
                1.0 - variance / SUSTAIN_VARIANCE,
                EventPayload::Sustain {
                    rms_variance: variance,
                },
            ));
        }
        sustaining = active;
        start += SUSTAIN_WINDOW;
    }
    events
}
