use std::sync::Arc;

use tokio::sync::mpsc;

use crate::{
    analysis::{Analyzer, TempoEstimate},
    cache::PersistentCache,
    event::BeatEvent,
    lookahead::{ChunkSummary, LookaheadScheduler, SessionReport, SinkMessage, StartOutcome},
    timeline::{EventScheduler, PlaybackClock, SchedulerStats},
    vibe::{ScoreTally, VibeClassifier, VibeMode, VibePhase, VibeScores},
    EngineConfig, PcmSource, Result,
};

/// Longest gap between ticks that still counts as listening time.
const MAX_TICK_GAP: f64 = 0.25;

/// Single entry point for a playback consumer: load an asset, then call
/// [`BeatEngine::tick`] from the playback clock callback.
pub struct BeatEngine {
    config: EngineConfig,
    clock: PlaybackClock,
    lookahead: LookaheadScheduler,
    inbox: mpsc::UnboundedReceiver<SinkMessage>,
    scheduler: EventScheduler,
    vibe: VibeClassifier,
    tempo: Option<TempoEstimate>,
    scores: ScoreTally,
    listened: f64,
    last_tick: Option<f64>,
    recorded_vibe: Option<VibeMode>,
}

impl BeatEngine {
    pub fn new(config: EngineConfig, cache: Option<PersistentCache>) -> Result<Self> {
        let analyzer = Analyzer::new(config.analyzer.clone())?;
        let (sink, inbox) = mpsc::unbounded_channel();
        let lookahead =
            LookaheadScheduler::new(config.lookahead.clone(), analyzer, cache, Arc::new(sink));
        let scheduler = EventScheduler::new(config.scheduler.clone());
        Ok(Self {
            config,
            clock: PlaybackClock::new(),
            lookahead,
            inbox,
            scheduler,
            vibe: VibeClassifier::new(),
            tempo: None,
            scores: ScoreTally::default(),
            listened: 0.0,
            last_tick: None,
            recorded_vibe: None,
        })
    }

    /// Playback position the background session reads.
    pub fn clock(&self) -> PlaybackClock {
        self.clock.clone()
    }

    /// Switches to a new asset. The previous session is fully retired first.
    pub async fn load(&mut self, source: Arc<dyn PcmSource>) -> Result<StartOutcome> {
        self.lookahead.stop().await;
        while self.inbox.try_recv().is_ok() {}
        self.scheduler.clear();
        self.scheduler.set_tempo(0.0, 1.0);
        self.tempo = None;
        self.scores = ScoreTally::default();
        self.listened = 0.0;
        self.last_tick = None;
        self.recorded_vibe = None;
        self.clock.reset();

        let identity = source.identity();
        self.vibe
            .start(PersistentCache::key(&identity, source.duration()));

        let outcome = self
            .lookahead
            .start(source, Arc::new(self.clock.clone()))
            .await?;
        if let Some(tempo) = outcome.tempo {
            self.apply_tempo(tempo);
        }
        if let Some((mode, confidence)) = outcome.vibe {
            self.vibe.restore(mode, confidence);
            self.recorded_vibe = Some(mode);
        }
        self.pump();
        Ok(outcome)
    }

    /// Jumps the playhead. Pending events are discarded; the session replays
    /// what it already has from `at` on.
    pub fn seek(&mut self, at: f64) {
        self.pump();
        self.scheduler.clear();
        self.clock.set(at);
        self.last_tick = None;
        self.lookahead.on_seek(at);
    }

    /// Advances to `now` and returns the events to fire on this tick.
    pub fn tick(&mut self, now: f64) -> Vec<BeatEvent> {
        self.clock.set(now);
        self.pump();

        if let Some(last) = self.last_tick {
            let delta = now - last;
            if delta > 0.0 && delta <= MAX_TICK_GAP {
                self.listened += delta;
            }
        }
        self.last_tick = Some(now);
        self.update_vibe();

        let bpm = self.tempo.map(|t| t.bpm).unwrap_or(0.0);
        self.scheduler
            .get_events_to_fire(now, self.config.lead_time, bpm)
    }

    pub fn tempo(&self) -> Option<TempoEstimate> {
        self.tempo
    }

    pub fn vibe_phase(&self) -> VibePhase {
        self.vibe.phase()
    }

    pub fn vibe_confidence(&self) -> f32 {
        self.vibe.confidence()
    }

    pub fn scores(&self) -> Option<VibeScores> {
        self.scores.scores()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    pub fn reset_stats(&mut self) {
        self.scheduler.reset_stats();
    }

    pub fn pending(&self) -> usize {
        self.scheduler.len()
    }

    pub async fn stop(&mut self) -> Option<SessionReport> {
        self.lookahead.stop().await
    }

    /// Moves everything the session delivered since the last call into the
    /// scheduler.
    fn pump(&mut self) {
        while let Ok(message) = self.inbox.try_recv() {
            match message {
                SinkMessage::Events(events) => self.scheduler.enqueue(events),
                SinkMessage::Summary(summary) => self.absorb(summary),
            }
        }
    }

    fn absorb(&mut self, summary: ChunkSummary) {
        if let Some(tempo) = summary.tempo {
            if self.tempo.map_or(true, |best| tempo.confidence >= best.confidence) {
                self.apply_tempo(tempo);
            }
        }
        if let Some(scores) = summary.scores {
            self.scores.add(scores, summary.range.len());
        }
    }

    fn apply_tempo(&mut self, tempo: TempoEstimate) {
        self.tempo = Some(tempo);
        self.scheduler.set_tempo(tempo.bpm, tempo.confidence);
    }

    fn update_vibe(&mut self) {
        let Some(mut scores) = self.scores.scores() else {
            return;
        };
        if let Some(tempo) = self.tempo {
            scores.bpm = tempo.bpm;
            scores.bpm_confidence = tempo.confidence;
        }
        let beats = (self.listened * scores.bpm as f64 / 60.0).floor() as u32;
        self.vibe.update(self.listened, beats, &scores);

        if let Some(mode) = self.vibe.mode() {
            if self.recorded_vibe != Some(mode) {
                self.lookahead.record_vibe(mode, self.vibe.confidence());
                self.recorded_vibe = Some(mode);
            }
        }
    }
}
