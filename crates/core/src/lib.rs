//! Core library for Beatline.
//!
//! Extracts musical structure (beats, drops, choruses, vocal entries and
//! more) from decoded PCM, keeps that analysis ahead of a moving playhead,
//! and hands a time-ordered event stream to a real-time effects consumer.
//! A separate classifier settles on one coarse vibe per track.

pub mod analysis;
pub mod audio;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod lookahead;
pub mod timeline;
pub mod vibe;

pub use analysis::{Analysis, Analyzer, FeatureFrames, TempoEstimate};
pub use audio::{AssetIdentity, MemoryPcm, PcmSource};
pub use cache::{CachedAnalysis, Coverage, PersistentCache, TimeRange};
pub use config::{AnalyzerConfig, EngineConfig, LookaheadConfig, SchedulerConfig};
pub use engine::BeatEngine;
pub use error::{BeatlineError, Result};
pub use event::{BeatEvent, BeatKind, EventPayload};
pub use lookahead::{
    CacheStatus, CallbackSink, ChunkSummary, EventSink, LookaheadScheduler, SessionReport,
    SinkMessage, StartOutcome,
};
pub use timeline::{EventScheduler, PlaybackClock, Playhead, SchedulerStats};
pub use vibe::{ScoreTally, VibeClassifier, VibeMode, VibePhase, VibeScores};
