use std::path::Path;

use beatline_core::{AssetIdentity, BeatlineError, MemoryPcm, Result};

/// Decodes a WAV file into mono PCM, averaging all channels.
pub fn load(path: &Path) -> Result<MemoryPcm> {
    let size = std::fs::metadata(path)?.len();
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    let reader = hound::WavReader::open(path)
        .map_err(|e| BeatlineError::msg(format!("failed to open WAV '{}': {e}", path.display())))?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| BeatlineError::msg(format!("failed to read float samples: {e}")))?,
        hound::SampleFormat::Int => {
            let scale = (1_i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
            reader
                .into_samples::<i32>()
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| BeatlineError::msg(format!("failed to read int samples: {e}")))?
                .into_iter()
                .map(|s| s as f32 / scale)
                .collect()
        }
    };

    let mono = downmix(&interleaved, channels);
    tracing::debug!(
        file = %filename,
        sample_rate = spec.sample_rate,
        channels,
        samples = mono.len(),
        "decoded wav"
    );
    Ok(MemoryPcm::new(
        AssetIdentity::new(filename, size),
        spec.sample_rate,
        mono,
    ))
}

fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels == 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn averages_channels() {
        assert_eq!(downmix(&[1.0, 0.0, 0.5, 0.5], 2), vec![0.5, 0.5]);
        assert_eq!(downmix(&[0.25, 0.75], 1), vec![0.25, 0.75]);
    }
}
