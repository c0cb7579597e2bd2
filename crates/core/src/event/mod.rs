use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// Category of a detected musical event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BeatKind {
    Onset,
    Bass,
    Drop,
    ChorusStart,
    ChorusEnd,
    SectionBoundary,
    VocalIn,
    VocalPhrase,
    BuildUp,
    Breakdown,
    BrightnessSpike,
    Sustain,
}

impl BeatKind {
    pub const ALL: [BeatKind; 12] = [
        BeatKind::Onset,
        BeatKind::Bass,
        BeatKind::Drop,
        BeatKind::ChorusStart,
        BeatKind::ChorusEnd,
        BeatKind::SectionBoundary,
        BeatKind::VocalIn,
        BeatKind::VocalPhrase,
        BeatKind::BuildUp,
        BeatKind::Breakdown,
        BeatKind::BrightnessSpike,
        BeatKind::Sustain,
    ];

    /// Kinds that compete for the same visual "hit" when they coincide.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            BeatKind::Onset | BeatKind::Drop | BeatKind::SectionBoundary | BeatKind::BrightnessSpike
        )
    }

    /// Firing priority, lower ranks win a conflict.
    pub fn priority(self) -> u8 {
        match self {
            BeatKind::Drop => 0,
            BeatKind::SectionBoundary => 1,
            BeatKind::ChorusStart | BeatKind::ChorusEnd => 2,
            BeatKind::BuildUp => 3,
            BeatKind::Bass => 4,
            BeatKind::Onset => 5,
            BeatKind::VocalPhrase => 6,
            BeatKind::BrightnessSpike => 7,
            BeatKind::Sustain => 8,
            BeatKind::VocalIn | BeatKind::Breakdown => 9,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BeatKind::Onset => "onset",
            BeatKind::Bass => "bass",
            BeatKind::Drop => "drop",
            BeatKind::ChorusStart => "chorusStart",
            BeatKind::ChorusEnd => "chorusEnd",
            BeatKind::SectionBoundary => "sectionBoundary",
            BeatKind::VocalIn => "vocalIn",
            BeatKind::VocalPhrase => "vocalPhrase",
            BeatKind::BuildUp => "buildUp",
            BeatKind::Breakdown => "breakdown",
            BeatKind::BrightnessSpike => "brightnessSpike",
            BeatKind::Sustain => "sustain",
        }
    }
}

/// Measurement attached to an event by the detector that produced it.
///
/// The variant fixes the event's [`BeatKind`], so a kind can never carry the
/// wrong payload.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum EventPayload {
    Onset { flux: f32 },
    Bass { energy: f32 },
    Drop { flux: f32, preceding_mean: f32 },
    ChorusStart { similarity: f32 },
    ChorusEnd { duration: f32 },
    SectionBoundary { novelty: f32 },
    VocalIn { pitch_confidence: f32, midband: f32 },
    VocalPhrase { duration: f32, mean_pitch_confidence: f32 },
    BuildUp { slope: f32, onset_density: f32 },
    Breakdown { drop_db: f32, duration: f32 },
    BrightnessSpike { centroid: f32 },
    Sustain { rms_variance: f32 },
}

impl EventPayload {
    pub fn kind(&self) -> BeatKind {
        match self {
            EventPayload::Onset { .. } => BeatKind::Onset,
            EventPayload::Bass { .. } => BeatKind::Bass,
            EventPayload::Drop { .. } => BeatKind::Drop,
            EventPayload::ChorusStart { .. } => BeatKind::ChorusStart,
            EventPayload::ChorusEnd { .. } => BeatKind::ChorusEnd,
            EventPayload::SectionBoundary { .. } => BeatKind::SectionBoundary,
            EventPayload::VocalIn { .. } => BeatKind::VocalIn,
            EventPayload::VocalPhrase { .. } => BeatKind::VocalPhrase,
            EventPayload::BuildUp { .. } => BeatKind::BuildUp,
            EventPayload::Breakdown { .. } => BeatKind::Breakdown,
            EventPayload::BrightnessSpike { .. } => BeatKind::BrightnessSpike,
            EventPayload::Sustain { .. } => BeatKind::Sustain,
        }
    }
}

/// A single timed musical event. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeatEvent {
    t: f64,
    strength: f32,
    payload: EventPayload,
}

impl BeatEvent {
    /// Builds an event, clamping `strength` into `[0, 1]`. Non-finite values
    /// are kept as-is so the scheduler can count and filter them.
    pub fn new(t: f64, strength: f32, payload: EventPayload) -> Self {
        Self {
            t,
            strength: strength.clamp(0.0, 1.0),
            payload,
        }
    }

    pub fn t(&self) -> f64 {
        self.t
    }

    pub fn strength(&self) -> f32 {
        self.strength
    }

    pub fn kind(&self) -> BeatKind {
        self.payload.kind()
    }

    pub fn payload(&self) -> &EventPayload {
        &self.payload
    }

    pub fn is_finite(&self) -> bool {
        self.t.is_finite() && self.strength.is_finite()
    }

    /// Total order used everywhere events are sorted: time, then kind.
    pub fn chronological(a: &BeatEvent, b: &BeatEvent) -> Ordering {
        a.t.total_cmp(&b.t).then_with(|| a.kind().cmp(&b.kind()))
    }
}

/// Sorts a batch in place with [`BeatEvent::chronological`].
pub fn sort_events(events: &mut [BeatEvent]) {
    events.sort_by(BeatEvent::chronological);
}
