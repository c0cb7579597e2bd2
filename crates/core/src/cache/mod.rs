//! On-disk store of analysis results, keyed by asset identity and duration.
//!
//! Records are advisory: anything unreadable, stale or mismatched is a miss
//! and the caller simply analyses again.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    analysis::TempoEstimate, event::BeatEvent, AnalyzerConfig, AssetIdentity, BeatlineError,
    Result, VibeMode, VibeScores,
};

/// Largest accepted difference between stored and requested duration.
pub const DURATION_TOLERANCE: f64 = 0.1;
const APP_DIR: &str = "beatline";
const RANGE_EPSILON: f64 = 1e-6;

/// Half-open time range in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= RANGE_EPSILON
    }

    pub fn contains(&self, t: f64) -> bool {
        t >= self.start && t < self.end
    }
}

/// Sorted, merged set of analysed ranges.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Coverage {
    ranges: Vec<TimeRange>,
}

impl Coverage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn full(duration: f64) -> Self {
        let mut coverage = Self::new();
        coverage.insert(TimeRange::new(0.0, duration));
        coverage
    }

    pub fn ranges(&self) -> &[TimeRange] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Adds a range, merging it with anything it overlaps or touches.
    pub fn insert(&mut self, range: TimeRange) {
        if range.is_empty() {
            return;
        }
        let mut merged = range;
        let mut kept = Vec::with_capacity(self.ranges.len() + 1);
        for existing in self.ranges.drain(..) {
            if existing.end + RANGE_EPSILON < merged.start
                || merged.end + RANGE_EPSILON < existing.start
            {
                kept.push(existing);
            } else {
                merged.start = merged.start.min(existing.start);
                merged.end = merged.end.max(existing.end);
            }
        }
        kept.push(merged);
        kept.sort_by(|a, b| a.start.total_cmp(&b.start));
        self.ranges = kept;
    }

    /// End of the covered stretch that contains `from`, or `from` itself when
    /// it is not covered.
    pub fn contiguous_end(&self, from: f64) -> f64 {
        self.ranges
            .iter()
            .find(|r| r.start <= from + RANGE_EPSILON && from < r.end)
            .map(|r| r.end)
            .unwrap_or(from)
    }

    /// First uncovered range at or after `from`, bounded by `limit`.
    pub fn next_gap(&self, from: f64, limit: f64) -> Option<TimeRange> {
        let mut cursor = from.max(0.0);
        for range in &self.ranges {
            if range.end <= cursor {
                continue;
            }
            if range.start > cursor + RANGE_EPSILON {
                break;
            }
            cursor = range.end;
        }
        if cursor >= limit - RANGE_EPSILON {
            return None;
        }
        let end = self
            .ranges
            .iter()
            .map(|r| r.start)
            .find(|start| *start > cursor)
            .unwrap_or(limit)
            .min(limit);
        Some(TimeRange::new(cursor, end))
    }

    /// Total analysed seconds.
    pub fn total(&self) -> f64 {
        self.ranges.iter().map(TimeRange::len).sum()
    }

    pub fn is_complete(&self, duration: f64) -> bool {
        self.next_gap(0.0, duration).is_none()
    }
}

/// One persisted analysis result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedAnalysis {
    pub version: u32,
    pub duration: f64,
    pub events: Vec<BeatEvent>,
    pub config: AnalyzerConfig,
    /// Ranges the events were detected over. A record does not claim
    /// anything outside them.
    pub coverage: Coverage,
    pub tempo: Option<TempoEstimate>,
    pub vibe_mode: Option<VibeMode>,
    pub vibe_confidence: Option<f32>,
    /// Running vibe descriptors over the covered ranges.
    #[serde(default)]
    pub scores: Option<VibeScores>,
}

impl CachedAnalysis {
    pub fn new(duration: f64, config: AnalyzerConfig) -> Self {
        Self {
            version: config.version,
            duration,
            events: Vec::new(),
            config,
            coverage: Coverage::new(),
            tempo: None,
            vibe_mode: None,
            vibe_confidence: None,
            scores: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.coverage.is_complete(self.duration)
    }

    /// Whether a consumer can settle a vibe from this record alone.
    pub fn has_vibe_data(&self) -> bool {
        self.vibe_mode.is_some() || self.scores.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct PersistentCache {
    dir: PathBuf,
}

impl PersistentCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Platform cache directory, e.g. `~/.cache/beatline` on Linux.
    pub fn default_dir() -> Result<PathBuf> {
        dirs::cache_dir()
            .map(|p| p.join(APP_DIR))
            .ok_or_else(|| BeatlineError::msg("could not determine the user cache directory"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Stable key for an asset. The duration is rounded to whole seconds so
    /// tiny decoder differences land on the same record and the tolerance
    /// check decides.
    pub fn key(identity: &AssetIdentity, duration: f64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(identity.filename.as_bytes());
        hasher.update([0]);
        hasher.update(identity.size.to_le_bytes());
        hasher.update([0]);
        hasher.update((duration.round() as i64).to_le_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    /// Returns the stored record when it matches `duration` and `config`.
    /// Every failure is a miss.
    pub fn load(
        &self,
        identity: &AssetIdentity,
        duration: f64,
        config: &AnalyzerConfig,
    ) -> Option<CachedAnalysis> {
        if !duration.is_finite() {
            return None;
        }
        let path = self.path_for(&Self::key(identity, duration));
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(file = %identity.filename, "cache miss");
                return None;
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "unreadable cache record");
                return None;
            }
        };
        let record: CachedAnalysis = match serde_json::from_slice(&bytes) {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "corrupt cache record");
                return None;
            }
        };

        if record.version != config.version || record.config != *config {
            tracing::debug!(
                stored = record.version,
                wanted = config.version,
                "cache record written with other analyzer settings"
            );
            return None;
        }
        if (record.duration - duration).abs() > DURATION_TOLERANCE {
            tracing::debug!(stored = record.duration, wanted = duration, "cache duration mismatch");
            return None;
        }
        Some(record)
    }

    /// Writes the whole record in one atomic replace.
    pub fn save(&self, identity: &AssetIdentity, record: &CachedAnalysis) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let key = Self::key(identity, record.duration);
        let path = self.path_for(&key);
        let staging = self.dir.join(format!("{key}.json.tmp"));
        let bytes = serde_json::to_vec(record)?;
        fs::write(&staging, bytes)?;
        fs::rename(&staging, &path)?;
        tracing::debug!(
            file = %identity.filename,
            events = record.events.len(),
            complete = record.is_complete(),
            "cache record saved"
        );
        Ok(())
    }

    pub fn remove(&self, identity: &AssetIdentity, duration: f64) -> Result<()> {
        let path = self.path_for(&Self::key(identity, duration));
        match fs::remove_file(path) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }
}
