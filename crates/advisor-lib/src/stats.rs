//! Descriptive statistics over utilization samples
//!
//! Percentiles use linear interpolation on the 1-based rank `r = p * n / 100`,
//! clamped to `[1, n]`. For `[10, 20, ..., 100]` the 95th percentile is 95.
//! Every percentile in the crate (record P95, classifier quartiles) goes
//! through [`percentile`] so stored records and estimates agree.

/// Summary of one node's sample set
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct UtilizationStats {
    pub avg: f64,
    pub p95: f64,
    pub max: f64,
    pub min: f64,
}

impl UtilizationStats {
    /// Aggregate raw values. An empty slice yields all zeros.
    pub fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        let sorted = sorted_copy(values);
        let max = sorted[sorted.len() - 1];
        let min = sorted[0];

        // Clamp so float rounding in the sum never lets avg or p95 exceed max
        Self {
            avg: mean(values).min(max),
            p95: percentile(&sorted, 95.0).min(max),
            max,
            min,
        }
    }
}

/// Copy and sort ascending; NaN compares equal so it never panics
pub fn sorted_copy(values: &[f64]) -> Vec<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    sorted
}

/// Percentile `p` (0-100) of an ascending slice
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let n = sorted.len();
    let rank = (p * n as f64 / 100.0).clamp(1.0, n as f64);
    let lower = rank.floor() as usize;
    let frac = rank - lower as f64;
    let lo = sorted[lower - 1];
    if lower >= n {
        return lo;
    }
    lo + frac * (sorted[lower] - lo)
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation (n - 1 denominator)
pub fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let sum_sq: f64 = values.iter().map(|v| (v - m).powi(2)).sum();
    (sum_sq / (values.len() - 1) as f64).sqrt()
}

/// Standard deviation over mean; zero for a zero mean
pub fn coefficient_of_variation(values: &[f64]) -> f64 {
    let m = mean(values);
    if m.abs() < f64::EPSILON {
        return 0.0;
    }
    std_dev(values) / m
}
