use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{BeatlineError, Result};

/// What the cache needs to recognise an asset without hashing its content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssetIdentity {
    pub filename: String,
    pub size: u64,
}

impl AssetIdentity {
    pub fn new(filename: impl Into<String>, size: u64) -> Self {
        Self {
            filename: filename.into(),
            size,
        }
    }
}

/// Supplier of decoded mono PCM. Decoding happens elsewhere; this crate only
/// ever asks for time ranges.
pub trait PcmSource: Send + Sync {
    fn identity(&self) -> AssetIdentity;

    /// Length of the asset in seconds.
    fn duration(&self) -> f64;

    fn sample_rate(&self) -> u32;

    /// Samples covering `[start, start + duration)`, truncated at the end of
    /// the asset. A range past the end yields an empty buffer.
    fn read(&self, start: f64, duration: f64) -> Result<Vec<f32>>;
}

/// PCM held fully in memory. Cloning shares the sample buffer.
#[derive(Debug, Clone)]
pub struct MemoryPcm {
    identity: AssetIdentity,
    sample_rate: u32,
    samples: Arc<[f32]>,
}

impl MemoryPcm {
    pub fn new(identity: AssetIdentity, sample_rate: u32, samples: Vec<f32>) -> Self {
        Self {
            identity,
            sample_rate,
            samples: samples.into(),
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }
}

impl PcmSource for MemoryPcm {
    fn identity(&self) -> AssetIdentity {
        self.identity.clone()
    }

    fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn read(&self, start: f64, duration: f64) -> Result<Vec<f32>> {
        if !start.is_finite() || !duration.is_finite() || duration < 0.0 {
            return Err(BeatlineError::invalid(format!(
                "cannot read range start={start} duration={duration}"
            )));
        }
        let rate = self.sample_rate as f64;
        let len = self.samples.len();
        let from = ((start.max(0.0) * rate).round() as usize).min(len);
        let to = (((start + duration).max(0.0) * rate).round() as usize).clamp(from, len);
        Ok(self.samples[from..to].to_vec())
    }
}
