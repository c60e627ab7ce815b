use serde::Serialize;
use std::time::Duration;

pub fn mean(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    Some(samples.iter().sum::<f64>() / samples.len() as f64)
}

/// Sample standard deviation (n - 1 denominator). A single sample has no spread.
pub fn sample_std_dev(samples: &[f64]) -> Option<f64> {
    let mu = mean(samples)?;
    if samples.len() < 2 {
        return Some(0.0);
    }
    let sum_sq: f64 = samples.iter().map(|v| (v - mu).powi(2)).sum();
    Some((sum_sq / (samples.len() - 1) as f64).sqrt())
}

/// Nearest-rank index into an ascending sample of length `len`: `ceil(p/100 * len) - 1`,
/// clamped to `[0, len - 1]`.
pub fn nearest_rank_index(pct: f64, len: usize) -> Option<usize> {
    if len == 0 || !pct.is_finite() {
        return None;
    }
    let pct = pct.clamp(0.0, 100.0);
    // p * n first keeps integral products exact (95 * 5 / 100 stays 4.75).
    let rank = (pct * len as f64 / 100.0).ceil() as usize;
    Some(rank.saturating_sub(1).min(len - 1))
}

pub fn percentile_sorted(sorted: &[f64], pct: f64) -> Option<f64> {
    nearest_rank_index(pct, sorted.len()).and_then(|idx| sorted.get(idx).copied())
}

pub fn percentile(samples: &[f64], pct: f64) -> Option<f64> {
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    percentile_sorted(&sorted, pct)
}

pub fn duration_ms(duration: Duration) -> f64 {
    duration.as_nanos() as f64 / 1_000_000.0
}

/// Latency summary in milliseconds. Median is the nearest-rank p50.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencyStats {
    pub count: usize,
    pub min_ms: f64,
    pub max_ms: f64,
    pub mean_ms: f64,
    pub median_ms: f64,
    pub std_dev_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

impl LatencyStats {
    pub fn from_durations(samples: &[Duration]) -> Option<Self> {
        let millis: Vec<f64> = samples.iter().map(|d| duration_ms(*d)).collect();
        Self::from_millis(&millis)
    }

    pub fn from_millis(samples: &[f64]) -> Option<Self> {
        let mut sorted = samples.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let min_ms = *sorted.first()?;
        let max_ms = *sorted.last()?;
        Some(Self {
            count: sorted.len(),
            min_ms,
            max_ms,
            mean_ms: mean(&sorted)?,
            median_ms: percentile_sorted(&sorted, 50.0)?,
            std_dev_ms: sample_std_dev(&sorted)?,
            p95_ms: percentile_sorted(&sorted, 95.0)?,
            p99_ms: percentile_sorted(&sorted, 99.0)?,
        })
    }
}
