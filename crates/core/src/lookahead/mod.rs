//! Background analysis that stays ahead of the playhead.
//!
//! A session primes the audio around the playhead, then a spawned task rolls
//! forward one chunk at a time. The task is the only writer of the session's
//! event buffer; consumers receive copies through an [`EventSink`].

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    analysis::{Analyzer, TempoEstimate},
    cache::{CachedAnalysis, Coverage, PersistentCache, TimeRange},
    event::{sort_events, BeatEvent},
    vibe::ScoreTally,
    AssetIdentity, BeatlineError, LookaheadConfig, PcmSource, Playhead, Result, VibeMode,
    VibeScores,
};

/// What one analysed range contributed besides its events.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkSummary {
    pub range: TimeRange,
    pub tempo: Option<TempoEstimate>,
    pub scores: Option<VibeScores>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SinkMessage {
    Events(Vec<BeatEvent>),
    Summary(ChunkSummary),
}

/// Receiver of analysis output. The session never owns the consumer: a
/// closed channel or a dropped receiver only means nobody is listening.
pub trait EventSink: Send + Sync {
    fn deliver(&self, events: Vec<BeatEvent>);

    fn summary(&self, _summary: ChunkSummary) {}
}

impl EventSink for mpsc::UnboundedSender<SinkMessage> {
    fn deliver(&self, events: Vec<BeatEvent>) {
        if self.send(SinkMessage::Events(events)).is_err() {
            tracing::debug!("event sink closed");
        }
    }

    fn summary(&self, summary: ChunkSummary) {
        if self.send(SinkMessage::Summary(summary)).is_err() {
            tracing::debug!("event sink closed");
        }
    }
}

/// Adapts a closure into an [`EventSink`] that only takes events.
pub struct CallbackSink<F>(pub F);

impl<F> EventSink for CallbackSink<F>
where
    F: Fn(Vec<BeatEvent>) + Send + Sync,
{
    fn deliver(&self, events: Vec<BeatEvent>) {
        (self.0)(events)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Complete record; nothing left to analyse.
    Hit,
    /// Record covering part of the asset; only the gaps are analysed.
    Partial,
    Miss,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StartOutcome {
    pub cache: CacheStatus,
    /// Events handed to the sink before `start` returned.
    pub delivered: usize,
    pub tempo: Option<TempoEstimate>,
    pub vibe: Option<(VibeMode, f32)>,
}

/// Summary of a finished session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionReport {
    pub chunks: usize,
    pub events: usize,
    pub complete: bool,
    /// Set when a chunk failed and the session stopped early.
    pub error: Option<String>,
}

enum Command {
    Seek(f64),
    Vibe(VibeMode, f32),
}

struct Session {
    cancel: CancellationToken,
    work: Arc<Mutex<CancellationToken>>,
    commands: mpsc::UnboundedSender<Command>,
    handle: JoinHandle<SessionReport>,
}

pub struct LookaheadScheduler {
    config: LookaheadConfig,
    analyzer: Analyzer,
    cache: Option<PersistentCache>,
    sink: Arc<dyn EventSink>,
    session: Option<Session>,
    /// Events of a complete cache hit, replayed on seek since no task runs.
    retained: Vec<BeatEvent>,
}

impl LookaheadScheduler {
    pub fn new(
        config: LookaheadConfig,
        analyzer: Analyzer,
        cache: Option<PersistentCache>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            analyzer,
            cache,
            sink,
            session: None,
            retained: Vec::new(),
        }
    }

    /// Starts a session for `source`, retiring any previous one first.
    ///
    /// A complete cache record is delivered as-is and no task is spawned; a
    /// complete record without vibe data is analysed again. Otherwise the
    /// prime window around the playhead is analysed before this returns and
    /// the roll loop continues in the background.
    pub async fn start(
        &mut self,
        source: Arc<dyn PcmSource>,
        playhead: Arc<dyn Playhead>,
    ) -> Result<StartOutcome> {
        self.stop().await;
        self.retained.clear();

        if source.sample_rate() != self.analyzer.config().sample_rate {
            return Err(BeatlineError::invalid(format!(
                "source sample rate {} does not match analyzer rate {}",
                source.sample_rate(),
                self.analyzer.config().sample_rate
            )));
        }

        let identity = source.identity();
        let duration = source.duration();
        let cached = self
            .cache
            .as_ref()
            .and_then(|cache| cache.load(&identity, duration, self.analyzer.config()))
            .filter(|record| {
                let usable = !record.is_complete() || record.has_vibe_data();
                if !usable {
                    tracing::info!(file = %identity.filename, "cache record has no vibe data");
                }
                usable
            });
        let vibe = cached
            .as_ref()
            .and_then(|record| record.vibe_mode.zip(record.vibe_confidence));

        let (status, seed) = match cached {
            Some(record) if record.is_complete() => {
                tracing::info!(file = %identity.filename, events = record.events.len(), "lookahead cache hit");
                let delivered = record.events.len();
                self.retained = record.events.clone();
                self.sink.deliver(record.events);
                self.sink.summary(ChunkSummary {
                    range: TimeRange::new(0.0, duration),
                    tempo: record.tempo,
                    scores: record.scores,
                });
                return Ok(StartOutcome {
                    cache: CacheStatus::Hit,
                    delivered,
                    tempo: record.tempo,
                    vibe,
                });
            }
            Some(record) => {
                tracing::info!(
                    file = %identity.filename,
                    ranges = record.coverage.ranges().len(),
                    "lookahead resuming partial record"
                );
                (CacheStatus::Partial, Some(record))
            }
            None => {
                tracing::info!(file = %identity.filename, duration, "lookahead cache miss");
                (CacheStatus::Miss, None)
            }
        };

        let cancel = CancellationToken::new();
        let work = Arc::new(Mutex::new(cancel.child_token()));
        let mut roll = Roll {
            source,
            playhead,
            sink: Arc::clone(&self.sink),
            analyzer: self.analyzer.clone(),
            cache: self.cache.clone(),
            config: self.config.clone(),
            identity,
            duration,
            buffer: Vec::new(),
            coverage: Coverage::new(),
            tempo: None,
            scores: ScoreTally::default(),
            vibe,
            report: SessionReport::default(),
            dirty: false,
            session: cancel.clone(),
            work: Arc::clone(&work),
        };
        if let Some(record) = seed {
            roll.scores = ScoreTally::seeded(record.scores, record.coverage.total());
            roll.buffer = record.events;
            roll.coverage = record.coverage;
            roll.tempo = record.tempo;
        }

        let now = roll.playhead.now();
        let seeded = roll.replay_from(now);
        roll.prime(now).await?;
        roll.persist().await;

        let outcome = StartOutcome {
            cache: status,
            delivered: seeded + roll.report.events,
            tempo: roll.tempo,
            vibe: roll.vibe,
        };

        let (commands, receiver) = mpsc::unbounded_channel();
        let handle = tokio::spawn(roll.run(receiver));
        self.session = Some(Session {
            cancel,
            work,
            commands,
            handle,
        });
        Ok(outcome)
    }

    /// Abandons in-flight analysis and re-primes from `at`. Already buffered
    /// events are kept and replayed.
    pub fn on_seek(&self, at: f64) {
        let Some(session) = &self.session else {
            let events: Vec<BeatEvent> = self
                .retained
                .iter()
                .filter(|event| event.t() >= at)
                .cloned()
                .collect();
            if !events.is_empty() {
                tracing::debug!(at, events = events.len(), "replaying cached events");
                self.sink.deliver(events);
            }
            return;
        };
        lock_token(&session.work).cancel();
        if session.commands.send(Command::Seek(at)).is_err() {
            tracing::debug!(at, "seek after lookahead session ended");
        }
    }

    /// Stores the locked vibe with the session's cache record.
    pub fn record_vibe(&self, mode: VibeMode, confidence: f32) {
        if let Some(session) = &self.session {
            if session.commands.send(Command::Vibe(mode, confidence)).is_err() {
                tracing::debug!(?mode, "vibe after lookahead session ended");
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| !session.handle.is_finished())
    }

    /// Cancels the session and waits until its task has fully exited.
    pub async fn stop(&mut self) -> Option<SessionReport> {
        let session = self.session.take()?;
        session.cancel.cancel();
        match session.handle.await {
            Ok(report) => Some(report),
            Err(err) => {
                tracing::warn!(error = %err, "lookahead task did not exit cleanly");
                None
            }
        }
    }
}

impl Drop for LookaheadScheduler {
    fn drop(&mut self) {
        if let Some(session) = &self.session {
            session.cancel.cancel();
        }
    }
}

/// State owned by one session's task.
struct Roll {
    source: Arc<dyn PcmSource>,
    playhead: Arc<dyn Playhead>,
    sink: Arc<dyn EventSink>,
    analyzer: Analyzer,
    cache: Option<PersistentCache>,
    config: LookaheadConfig,
    identity: AssetIdentity,
    duration: f64,
    buffer: Vec<BeatEvent>,
    coverage: Coverage,
    tempo: Option<TempoEstimate>,
    scores: ScoreTally,
    vibe: Option<(VibeMode, f32)>,
    report: SessionReport,
    dirty: bool,
    session: CancellationToken,
    work: Arc<Mutex<CancellationToken>>,
}

impl Roll {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) -> SessionReport {
        let mut ticker = interval(Duration::from_millis(self.config.poll_interval_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let session = self.session.clone();

        loop {
            if !self.report.complete && self.coverage.is_complete(self.duration) {
                tracing::info!(file = %self.identity.filename, chunks = self.report.chunks, "lookahead complete");
                self.report.complete = true;
                self.persist().await;
            }

            let step = tokio::select! {
                biased;
                _ = session.cancelled() => break,
                command = commands.recv() => match command {
                    Some(Command::Seek(at)) => self.seek(at).await,
                    Some(Command::Vibe(mode, confidence)) => {
                        self.vibe = Some((mode, confidence));
                        self.dirty = true;
                        if self.report.complete {
                            self.persist().await;
                        }
                        Ok(())
                    }
                    None => break,
                },
                _ = ticker.tick(), if !self.report.complete => self.roll_step().await,
            };

            if let Err(err) = step {
                tracing::warn!(error = %err, "lookahead chunk failed, stopping session");
                self.report.error = Some(err.to_string());
                break;
            }
        }

        self.persist().await;
        self.report
    }

    async fn roll_step(&mut self) -> Result<()> {
        let now = self.playhead.now().clamp(0.0, self.duration);
        let ahead = self.coverage.contiguous_end(now) - now;
        if ahead >= self.config.target_ahead {
            return Ok(());
        }
        let Some(gap) = self.coverage.next_gap(now, self.duration) else {
            return Ok(());
        };
        let chunk = TimeRange::new(gap.start, gap.end.min(gap.start + self.config.chunk_len));
        self.analyze(chunk).await.map(|_| ())
    }

    async fn seek(&mut self, at: f64) -> Result<()> {
        tracing::info!(at, "lookahead seek");
        self.replay_from(at);
        self.prime(at).await
    }

    /// Analyses every gap inside the prime window around `at`.
    async fn prime(&mut self, at: f64) -> Result<()> {
        let window = prime_window(at, self.config.prime_window, self.duration);
        tracing::debug!(start = window.start, end = window.end, "lookahead prime");
        let mut cursor = window.start;
        while let Some(gap) = self.coverage.next_gap(cursor, window.end) {
            if !self.analyze(gap).await? {
                break;
            }
            cursor = gap.end;
        }
        Ok(())
    }

    /// Analyses one range on the blocking pool. Returns `false` when the work
    /// was cancelled and its output discarded.
    async fn analyze(&mut self, range: TimeRange) -> Result<bool> {
        let cancel = self.work_token();
        let analyzer = self.analyzer.clone();
        let source = Arc::clone(&self.source);
        let pad = self.config.context_pad;
        let token = cancel.clone();
        let analysis = tokio::task::spawn_blocking(move || {
            analyzer.analyze_range(source.as_ref(), range.start, range.end, pad, &token)
        })
        .await??;

        if cancel.is_cancelled() {
            tracing::debug!(start = range.start, end = range.end, "chunk discarded");
            return Ok(false);
        }

        self.coverage.insert(range);
        if let Some(tempo) = analysis.tempo {
            if self.tempo.map_or(true, |best| tempo.confidence >= best.confidence) {
                self.tempo = Some(tempo);
            }
        }
        if let Some(scores) = analysis.scores {
            self.scores.add(scores, range.len());
        }
        self.buffer.extend(analysis.events.iter().cloned());
        sort_events(&mut self.buffer);
        self.report.chunks += 1;
        self.report.events += analysis.events.len();
        self.dirty = true;

        tracing::debug!(
            start = range.start,
            end = range.end,
            events = analysis.events.len(),
            "lookahead chunk analysed"
        );
        self.sink.deliver(analysis.events);
        self.sink.summary(ChunkSummary {
            range,
            tempo: analysis.tempo,
            scores: analysis.scores,
        });
        Ok(true)
    }

    /// Hands buffered events from `at` on to the sink again.
    fn replay_from(&self, at: f64) -> usize {
        let events: Vec<BeatEvent> = self
            .buffer
            .iter()
            .filter(|event| event.t() >= at)
            .cloned()
            .collect();
        let count = events.len();
        if count > 0 {
            self.sink.deliver(events);
        }
        count
    }

    fn work_token(&self) -> CancellationToken {
        let token = self.session.child_token();
        *lock_token(&self.work) = token.clone();
        token
    }

    async fn persist(&mut self) {
        let Some(cache) = self.cache.clone() else {
            return;
        };
        if !self.dirty {
            return;
        }
        let mut record = CachedAnalysis::new(self.duration, self.analyzer.config().clone());
        record.events = self.buffer.clone();
        record.coverage = self.coverage.clone();
        record.tempo = self.tempo;
        record.vibe_mode = self.vibe.map(|(mode, _)| mode);
        record.vibe_confidence = self.vibe.map(|(_, confidence)| confidence);
        record.scores = self.scores.scores();

        let identity = self.identity.clone();
        match tokio::task::spawn_blocking(move || cache.save(&identity, &record)).await {
            Ok(Ok(())) => self.dirty = false,
            Ok(Err(err)) => tracing::warn!(error = %err, "could not save cache record"),
            Err(err) => tracing::warn!(error = %err, "cache save task failed"),
        }
    }
}

/// `width` seconds starting at `at`, shifted back to fit inside the asset.
fn prime_window(at: f64, width: f64, duration: f64) -> TimeRange {
    let start = if at.is_finite() { at.clamp(0.0, duration) } else { 0.0 };
    let end = (start + width).min(duration);
    TimeRange::new((end - width).max(0.0).min(start), end)
}

// A poisoned token is still usable.
fn lock_token(token: &Mutex<CancellationToken>) -> MutexGuard<'_, CancellationToken> {
    token.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        analysis::tests::click_track, event::EventPayload, AnalyzerConfig, MemoryPcm,
        PlaybackClock,
    };
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::time::{sleep, timeout};

    const RATE: u32 = 22_050;

    fn source(seconds: f64) -> Arc<MemoryPcm> {
        let samples = click_track(RATE, seconds, 0.5);
        Arc::new(MemoryPcm::new(
            AssetIdentity::new("clicks.wav", samples.len() as u64 * 4),
            RATE,
            samples,
        ))
    }

    fn config(target_ahead: f64) -> LookaheadConfig {
        LookaheadConfig {
            target_ahead,
            prime_window: 4.0,
            chunk_len: 3.0,
            context_pad: 1.0,
            poll_interval_ms: 10,
        }
    }

    fn scheduler(
        config: LookaheadConfig,
        cache: Option<PersistentCache>,
    ) -> (LookaheadScheduler, mpsc::UnboundedReceiver<SinkMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let analyzer = Analyzer::new(AnalyzerConfig::default()).unwrap();
        (LookaheadScheduler::new(config, analyzer, cache, Arc::new(tx)), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SinkMessage>) -> Vec<SinkMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    fn events(messages: &[SinkMessage]) -> Vec<BeatEvent> {
        messages
            .iter()
            .filter_map(|m| match m {
                SinkMessage::Events(events) => Some(events.clone()),
                SinkMessage::Summary(_) => None,
            })
            .flatten()
            .collect()
    }

    /// Waits for a summary matching `wanted`, collecting every message seen.
    async fn wait_for_summary(
        rx: &mut mpsc::UnboundedReceiver<SinkMessage>,
        wanted: impl Fn(&ChunkSummary) -> bool,
    ) -> Vec<SinkMessage> {
        let mut seen = Vec::new();
        timeout(Duration::from_secs(60), async {
            while let Some(message) = rx.recv().await {
                let done = matches!(&message, SinkMessage::Summary(s) if wanted(s));
                seen.push(message);
                if done {
                    return;
                }
            }
        })
        .await
        .expect("summary in time");
        seen
    }

    #[tokio::test]
    async fn miss_primes_and_saves_partial_record() {
        let dir = TempDir::new().unwrap();
        let cache = PersistentCache::new(dir.path());
        let (mut lookahead, mut rx) = scheduler(config(2.0), Some(cache.clone()));
        let pcm = source(10.0);

        let outcome = lookahead
            .start(pcm.clone(), Arc::new(|| 0.0_f64))
            .await
            .unwrap();
        assert_eq!(outcome.cache, CacheStatus::Miss);
        assert!(outcome.delivered > 0);

        let delivered = events(&drain(&mut rx));
        assert_eq!(delivered.len(), outcome.delivered);
        assert!(delivered.iter().all(|e| e.t() < 4.0));

        let report = lookahead.stop().await.unwrap();
        assert!(!report.complete);
        let record = cache
            .load(&pcm.identity(), pcm.duration(), &AnalyzerConfig::default())
            .expect("record saved after prime");
        assert_eq!(record.coverage.ranges(), &[TimeRange::new(0.0, 4.0)]);
        assert!(!record.is_complete());
    }

    #[tokio::test]
    async fn roll_loop_completes_and_next_start_hits_cache() {
        let dir = TempDir::new().unwrap();
        let cache = PersistentCache::new(dir.path());
        let (mut lookahead, mut rx) = scheduler(config(30.0), Some(cache.clone()));
        let pcm = source(10.0);

        lookahead.start(pcm.clone(), Arc::new(|| 0.0_f64)).await.unwrap();
        wait_for_summary(&mut rx, |s| s.range.end >= 10.0).await;
        sleep(Duration::from_millis(50)).await;
        lookahead.record_vibe(VibeMode::Hype, 0.8);
        sleep(Duration::from_millis(50)).await;
        let report = lookahead.stop().await.unwrap();
        assert!(report.complete);
        assert!(report.error.is_none());

        let (mut replay, mut replay_rx) = scheduler(config(30.0), Some(cache));
        let outcome = replay.start(pcm, Arc::new(|| 0.0_f64)).await.unwrap();
        assert_eq!(outcome.cache, CacheStatus::Hit);
        assert_eq!(outcome.vibe, Some((VibeMode::Hype, 0.8)));
        assert!(!replay.is_active());

        let replayed = events(&drain(&mut replay_rx));
        assert_eq!(replayed.len(), outcome.delivered);
        assert!(replayed.windows(2).all(|p| p[0].t() <= p[1].t()));
    }

    #[tokio::test]
    async fn seek_reprimes_and_replays_buffered_events() {
        let clock = PlaybackClock::new();
        let (mut lookahead, mut rx) = scheduler(config(1.0), None);
        lookahead
            .start(source(10.0), Arc::new(clock.clone()))
            .await
            .unwrap();
        drain(&mut rx);

        clock.set(6.0);
        lookahead.on_seek(6.0);
        wait_for_summary(&mut rx, |s| s.range.start == 6.0).await;

        clock.set(1.0);
        lookahead.on_seek(1.0);
        let seen = wait_for_summary(&mut rx, |s| s.range == TimeRange::new(4.0, 5.0)).await;
        let replayed = events(&seen);
        assert!(replayed.iter().any(|e| e.t() >= 1.0 && e.t() < 4.0));
        assert!(replayed.iter().all(|e| e.t() >= 1.0));

        lookahead.stop().await;
    }

    #[tokio::test]
    async fn partial_record_seeds_buffer() {
        let dir = TempDir::new().unwrap();
        let cache = PersistentCache::new(dir.path());
        let pcm = source(10.0);
        let marker = BeatEvent::new(1.0, 0.5, EventPayload::Sustain { rms_variance: 0.01 });
        let mut record = CachedAnalysis::new(pcm.duration(), AnalyzerConfig::default());
        record.events = vec![marker.clone()];
        record.coverage.insert(TimeRange::new(0.0, 4.0));
        cache.save(&pcm.identity(), &record).unwrap();

        let (mut lookahead, mut rx) = scheduler(config(1.0), Some(cache));
        let outcome = lookahead.start(pcm, Arc::new(|| 0.0_f64)).await.unwrap();
        assert_eq!(outcome.cache, CacheStatus::Partial);
        assert_eq!(outcome.delivered, 1);
        assert_eq!(events(&drain(&mut rx)), vec![marker]);

        let report = lookahead.stop().await.unwrap();
        assert_eq!(report.chunks, 0);
    }

    struct FailingPcm {
        inner: Arc<MemoryPcm>,
    }

    impl PcmSource for FailingPcm {
        fn identity(&self) -> AssetIdentity {
            self.inner.identity()
        }

        fn duration(&self) -> f64 {
            self.inner.duration()
        }

        fn sample_rate(&self) -> u32 {
            self.inner.sample_rate()
        }

        fn read(&self, start: f64, duration: f64) -> Result<Vec<f32>> {
            if start + duration > 5.0 {
                return Err(BeatlineError::msg("disk went away"));
            }
            self.inner.read(start, duration)
        }
    }

    #[tokio::test]
    async fn chunk_failure_stops_the_session() {
        let (mut lookahead, mut rx) = scheduler(config(8.0), None);
        let pcm = Arc::new(FailingPcm { inner: source(10.0) });
        let outcome = lookahead.start(pcm, Arc::new(|| 0.0_f64)).await.unwrap();
        assert!(outcome.delivered > 0);

        timeout(Duration::from_secs(30), async {
            while lookahead.is_active() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session stops after failure");

        let report = lookahead.stop().await.unwrap();
        assert!(report.error.is_some());
        assert!(!events(&drain(&mut rx)).is_empty());
    }

    fn complete_record(pcm: &MemoryPcm, events: Vec<BeatEvent>) -> CachedAnalysis {
        let mut record = CachedAnalysis::new(pcm.duration(), AnalyzerConfig::default());
        record.events = events;
        record.coverage = Coverage::full(pcm.duration());
        record
    }

    #[tokio::test]
    async fn seek_after_cache_hit_replays_retained_events() {
        let dir = TempDir::new().unwrap();
        let cache = PersistentCache::new(dir.path());
        let pcm = source(10.0);
        let onsets: Vec<BeatEvent> = (0..9)
            .map(|i| BeatEvent::new(0.5 + i as f64, 0.8, EventPayload::Onset { flux: 0.8 }))
            .collect();
        let mut record = complete_record(&pcm, onsets);
        record.scores = Some(VibeScores::default());
        cache.save(&pcm.identity(), &record).unwrap();

        let (mut lookahead, mut rx) = scheduler(config(1.0), Some(cache));
        let outcome = lookahead.start(pcm, Arc::new(|| 0.0_f64)).await.unwrap();
        assert_eq!(outcome.cache, CacheStatus::Hit);
        let first = drain(&mut rx);
        assert!(first
            .iter()
            .any(|m| matches!(m, SinkMessage::Summary(s) if s.scores.is_some())));

        lookahead.on_seek(4.0);
        let replayed = events(&drain(&mut rx));
        let times: Vec<f64> = replayed.iter().map(BeatEvent::t).collect();
        assert_eq!(times, vec![4.5, 5.5, 6.5, 7.5, 8.5]);
    }

    #[tokio::test]
    async fn complete_record_without_vibe_data_is_analysed_again() {
        let dir = TempDir::new().unwrap();
        let cache = PersistentCache::new(dir.path());
        let pcm = source(6.0);
        cache.save(&pcm.identity(), &complete_record(&pcm, Vec::new())).unwrap();

        let (mut lookahead, _rx) = scheduler(config(1.0), Some(cache));
        let outcome = lookahead.start(pcm, Arc::new(|| 0.0_f64)).await.unwrap();
        assert_eq!(outcome.cache, CacheStatus::Miss);
        assert!(outcome.delivered > 0);
        lookahead.stop().await;
    }

    /// Blocks reads that start at or after `from` until released.
    struct GatedPcm {
        inner: Arc<MemoryPcm>,
        from: f64,
        gated_reads: AtomicUsize,
        released: AtomicBool,
    }

    impl PcmSource for GatedPcm {
        fn identity(&self) -> AssetIdentity {
            self.inner.identity()
        }

        fn duration(&self) -> f64 {
            self.inner.duration()
        }

        fn sample_rate(&self) -> u32 {
            self.inner.sample_rate()
        }

        fn read(&self, start: f64, duration: f64) -> Result<Vec<f32>> {
            if start >= self.from {
                self.gated_reads.fetch_add(1, Ordering::SeqCst);
                while !self.released.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
            self.inner.read(start, duration)
        }
    }

    #[tokio::test]
    async fn seek_discards_chunk_in_flight() {
        let pcm = Arc::new(GatedPcm {
            inner: source(7.0),
            from: 2.0,
            gated_reads: AtomicUsize::new(0),
            released: AtomicBool::new(false),
        });
        let (mut lookahead, mut rx) = scheduler(config(6.0), None);
        lookahead
            .start(pcm.clone(), Arc::new(|| 0.0_f64))
            .await
            .unwrap();
        drain(&mut rx);

        timeout(Duration::from_secs(30), async {
            while pcm.gated_reads.load(Ordering::SeqCst) == 0 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("next chunk starts");

        lookahead.on_seek(0.0);
        pcm.released.store(true, Ordering::SeqCst);
        wait_for_summary(&mut rx, |s| s.range.start == 4.0).await;
        let report = lookahead.stop().await.unwrap();

        // The abandoned read left no coverage behind, so the chunk was read again.
        assert_eq!(pcm.gated_reads.load(Ordering::SeqCst), 2);
        assert_eq!(report.chunks, 2);
        assert!(report.error.is_none());
    }

    #[tokio::test]
    async fn rejects_mismatched_sample_rate() {
        let (mut lookahead, _rx) = scheduler(config(1.0), None);
        let pcm = Arc::new(MemoryPcm::new(AssetIdentity::new("x.wav", 1), 44_100, vec![0.0; 100]));
        let result = lookahead.start(pcm, Arc::new(|| 0.0_f64)).await;
        assert!(matches!(result, Err(BeatlineError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn callback_sink_receives_events() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let store = Arc::clone(&received);
        let sink = CallbackSink(move |events: Vec<BeatEvent>| {
            lock_events(&store).extend(events);
        });
        let analyzer = Analyzer::new(AnalyzerConfig::default()).unwrap();
        let mut lookahead = LookaheadScheduler::new(config(1.0), analyzer, None, Arc::new(sink));
        let outcome = lookahead.start(source(6.0), Arc::new(|| 0.0_f64)).await.unwrap();
        lookahead.stop().await;
        assert_eq!(lock_events(&received).len(), outcome.delivered);
    }

    fn lock_events(store: &Mutex<Vec<BeatEvent>>) -> MutexGuard<'_, Vec<BeatEvent>> {
        store.lock().unwrap()
    }

    #[test]
    fn prime_window_fits_inside_asset() {
        assert_eq!(prime_window(2.0, 4.0, 10.0), TimeRange::new(2.0, 6.0));
        assert_eq!(prime_window(9.0, 4.0, 10.0), TimeRange::new(6.0, 10.0));
        assert_eq!(prime_window(0.0, 12.0, 5.0), TimeRange::new(0.0, 5.0));
        assert_eq!(prime_window(-3.0, 4.0, 10.0), TimeRange::new(0.0, 4.0));
    }
}
