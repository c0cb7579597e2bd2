use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use serde::{Deserialize, Serialize};

use crate::{
    event::{sort_events, BeatEvent, BeatKind},
    SchedulerConfig,
};

const MIN_WINDOW: f64 = 0.02;
const MAX_WINDOW: f64 = 0.1;
const FALLBACK_WINDOW: f64 = 0.06;
const WINDOW_BEATS: f64 = 0.08;

/// Anything that can report the current playback position in seconds.
pub trait Playhead: Send + Sync {
    fn now(&self) -> f64;
}

impl<F> Playhead for F
where
    F: Fn() -> f64 + Send + Sync,
{
    fn now(&self) -> f64 {
        self()
    }
}

/// Playback position shared between the tick callback and background tasks.
/// Clones observe the same position.
#[derive(Debug, Default, Clone)]
pub struct PlaybackClock {
    time_seconds: Arc<Mutex<f64>>,
}

impl PlaybackClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn time(&self) -> f64 {
        *self.lock()
    }

    pub fn set(&self, seconds: f64) {
        *self.lock() = seconds.max(0.0);
    }

    pub fn reset(&self) {
        self.set(0.0);
    }

    pub fn advance(&self, delta: f64) {
        let mut time = self.lock();
        *time = (*time + delta).max(0.0);
    }

    // A poisoned position is still a valid f64.
    fn lock(&self) -> MutexGuard<'_, f64> {
        self.time_seconds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Playhead for PlaybackClock {
    fn now(&self) -> f64 {
        self.time()
    }
}

/// Pull-only telemetry owned by one [`EventScheduler`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStats {
    /// Running mean of `|first fired t - now|` in milliseconds.
    pub avg_skew_ms: f64,
    pub fired: u64,
    pub coalesced: u64,
    pub dropped_conflict: u64,
    pub dropped_overflow: u64,
    pub dropped_non_finite: u64,
    pub dropped_stale: u64,
}

/// Queue of pending events, drained once per playback tick.
#[derive(Debug)]
pub struct EventScheduler {
    config: SchedulerConfig,
    queue: VecDeque<BeatEvent>,
    bpm: f32,
    tempo_confidence: f32,
    stats: SchedulerStats,
    skew_samples: u64,
}

impl Default for EventScheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

impl EventScheduler {
    /// Until [`EventScheduler::set_tempo`] says otherwise the `bpm` passed to
    /// each tick is trusted.
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            queue: VecDeque::new(),
            bpm: 0.0,
            tempo_confidence: 1.0,
            stats: SchedulerStats::default(),
            skew_samples: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Takes ownership of a batch. Non-finite events are counted and dropped
    /// here so they never reach a consumer; exact repeats of queued events
    /// are ignored.
    pub fn enqueue(&mut self, events: impl IntoIterator<Item = BeatEvent>) {
        let before = self.queue.len();
        for event in events {
            if event.is_finite() {
                self.queue.push_back(event);
            } else {
                self.stats.dropped_non_finite += 1;
            }
        }
        if self.queue.len() != before {
            let mut pending: Vec<BeatEvent> = self.queue.drain(..).collect();
            sort_events(&mut pending);
            let mut seen = HashSet::with_capacity(pending.len());
            pending.retain(|event| {
                seen.insert((event.t().to_bits(), event.kind(), event.strength().to_bits()))
            });
            self.queue = pending.into();
        }
    }

    /// Records the current tempo estimate. Below the confidence floor the
    /// coalescing window ignores the tempo.
    pub fn set_tempo(&mut self, bpm: f32, confidence: f32) {
        self.bpm = bpm;
        self.tempo_confidence = confidence;
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = SchedulerStats::default();
        self.skew_samples = 0;
    }

    /// Width of the coalescing window for `bpm`.
    pub fn coalesce_window(&self, bpm: f32) -> f64 {
        let bpm = if bpm.is_finite() && bpm > 0.0 { bpm } else { self.bpm };
        if self.tempo_confidence < self.config.confidence_floor {
            return FALLBACK_WINDOW;
        }
        let window = WINDOW_BEATS * 60.0 / bpm as f64;
        if !window.is_finite() || window <= 0.0 {
            return FALLBACK_WINDOW;
        }
        window.clamp(MIN_WINDOW, MAX_WINDOW)
    }

    /// Pops everything due by `now + lead_time` and returns what should fire,
    /// time-sorted.
    pub fn get_events_to_fire(&mut self, now: f64, lead_time: f64, bpm: f32) -> Vec<BeatEvent> {
        let horizon = now + lead_time.max(0.0);
        let stale_before = now - self.config.late_tolerance;

        let mut due = Vec::new();
        while self.queue.front().is_some_and(|event| event.t() <= horizon) {
            let Some(event) = self.queue.pop_front() else {
                break;
            };
            if event.t() < stale_before {
                self.stats.dropped_stale += 1;
            } else if due.len() >= self.config.max_batch {
                self.stats.dropped_overflow += 1;
            } else {
                due.push(event);
            }
        }
        if due.is_empty() {
            return due;
        }

        let window = self.coalesce_window(bpm);
        let mut fired = Vec::with_capacity(due.len());
        for group in anchor_groups(due, window) {
            let before = group.len();
            let kept = strongest_per_kind(group);
            self.stats.coalesced += (before - kept.len()) as u64;
            let kept = self.resolve_transients(kept);
            fired.extend(kept);
        }
        fired.retain(BeatEvent::is_finite);
        sort_events(&mut fired);

        if let Some(first) = fired.first() {
            let skew_ms = (first.t() - now).abs() * 1000.0;
            self.skew_samples += 1;
            self.stats.avg_skew_ms += (skew_ms - self.stats.avg_skew_ms) / self.skew_samples as f64;
            self.stats.fired += fired.len() as u64;
        }
        fired
    }

    fn resolve_transients(&mut self, group: Vec<BeatEvent>) -> Vec<BeatEvent> {
        let (mut transients, mut rest): (Vec<_>, Vec<_>) =
            group.into_iter().partition(|event| event.kind().is_transient());
        if transients.len() > self.config.max_transients {
            transients.sort_by(|a, b| {
                a.kind()
                    .priority()
                    .cmp(&b.kind().priority())
                    .then_with(|| b.strength().total_cmp(&a.strength()))
            });
            let excess = transients.len() - self.config.max_transients;
            transients.truncate(self.config.max_transients);
            self.stats.dropped_conflict += excess as u64;
        }
        rest.extend(transients);
        rest
    }
}

/// Splits sorted events into groups that start at their first event and span
/// at most `window` seconds.
fn anchor_groups(events: Vec<BeatEvent>, window: f64) -> Vec<Vec<BeatEvent>> {
    let mut groups: Vec<Vec<BeatEvent>> = Vec::new();
    let mut anchor = f64::NEG_INFINITY;
    for event in events {
        match groups.last_mut() {
            Some(group) if event.t() - anchor <= window => group.push(event),
            _ => {
                anchor = event.t();
                groups.push(vec![event]);
            }
        }
    }
    groups
}

/// Keeps the strongest event of each kind; the earlier one wins a tie.
fn strongest_per_kind(group: Vec<BeatEvent>) -> Vec<BeatEvent> {
    let mut best: HashMap<BeatKind, BeatEvent> = HashMap::new();
    for event in group {
        match best.get(&event.kind()) {
            Some(current) if current.strength() >= event.strength() => {}
            _ => {
                best.insert(event.kind(), event);
            }
        }
    }
    best.into_values().collect()
}
