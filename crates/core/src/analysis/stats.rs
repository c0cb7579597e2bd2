//! Small numeric helpers shared by the feature, tempo and detector passes.

use std::cmp::Ordering;

pub(crate) const EPSILON: f32 = 1e-9;

/// Divides every value by the slice maximum. All-zero input stays zero.
pub(crate) fn normalize_max(values: &mut [f32]) {
    let max = values.iter().copied().fold(0.0_f32, f32::max);
    if max <= EPSILON {
        values.iter_mut().for_each(|v| *v = 0.0);
        return;
    }
    values.iter_mut().for_each(|v| *v /= max);
}

pub(crate) fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f32>() / values.len() as f32
}

pub(crate) fn variance(values: &[f32]) -> f32 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    values.iter().map(|v| (v - m) * (v - m)).sum::<f32>() / values.len() as f32
}

pub(crate) fn median(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) * 0.5
    } else {
        sorted[mid]
    }
}

/// Inclusive-exclusive index range of `radius` frames around `index`,
/// clipped to `len`.
pub(crate) fn window(index: usize, radius: usize, len: usize) -> std::ops::Range<usize> {
    index.saturating_sub(radius)..(index + radius + 1).min(len)
}

/// Centred moving average with a `radius` frame half-width, computed from a
/// prefix sum so long envelopes stay linear.
pub(crate) fn local_means(values: &[f32], radius: usize) -> Vec<f32> {
    let mut prefix = Vec::with_capacity(values.len() + 1);
    prefix.push(0.0_f64);
    for v in values {
        let last = prefix[prefix.len() - 1];
        prefix.push(last + *v as f64);
    }

    (0..values.len())
        .map(|i| {
            let range = window(i, radius, values.len());
            let sum = prefix[range.end] - prefix[range.start];
            (sum / range.len() as f64) as f32
        })
        .collect()
}

/// True when `values[i]` is a strict peak against its left neighbour and at
/// least as large as its right neighbour.
pub(crate) fn is_local_max(values: &[f32], i: usize) -> bool {
    let v = values[i];
    let left = if i > 0 { values[i - 1] } else { f32::NEG_INFINITY };
    let right = values.get(i + 1).copied().unwrap_or(f32::NEG_INFINITY);
    v > left && v >= right
}

/// Least-squares slope of `values` against their index.
pub(crate) fn linear_slope(values: &[f32]) -> f32 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let x_mean = (n - 1) as f32 * 0.5;
    let y_mean = mean(values);
    let mut num = 0.0;
    let mut den = 0.0;
    for (i, y) in values.iter().enumerate() {
        let dx = i as f32 - x_mean;
        num += dx * (y - y_mean);
        den += dx * dx;
    }
    num / den.max(EPSILON)
}

pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    dot / (na * nb).max(EPSILON)
}
