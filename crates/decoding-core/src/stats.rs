//! Running statistics for streaming score normalization.
//!
//! Everything here is computed incrementally so that a session fed one epoch
//! at a time produces exactly the same numbers as a single pass over the
//! whole recording.

use serde::{Deserialize, Serialize};

/// Median of `data`, sorting it in place; 0 when empty.
pub fn median(data: &mut [f64]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    data.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = data.len() / 2;
    if data.len() % 2 == 0 {
        (data[mid - 1] + data[mid]) / 2.0
    } else {
        data[mid]
    }
}

/// Welford's online mean/variance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningStats {
    count: usize,
    mean: f64,
    m2: f64,
}

impl RunningStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Unbiased sample variance; 0 with fewer than two samples.
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        self.m2 / (self.count - 1) as f64
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }
}

/// Least-squares line `y = slope * t + intercept` through `(t, y)` for
/// `t = 0..n`, from the running sums `Σy` and `Σ t*y`.
pub fn line_fit(n: usize, sum_y: f64, sum_ty: f64) -> (f64, f64) {
    if n == 0 {
        return (0.0, 0.0);
    }
    let nf = n as f64;
    let sum_t = nf * (nf - 1.0) / 2.0;
    let sum_tt = (nf - 1.0) * nf * (2.0 * nf - 1.0) / 6.0;
    let denom = nf * sum_tt - sum_t * sum_t;
    if denom.abs() < f64::EPSILON {
        return (0.0, sum_y / nf);
    }
    let slope = (nf * sum_ty - sum_t * sum_y) / denom;
    let intercept = (sum_y - slope * sum_t) / nf;
    (slope, intercept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_running_stats_match_batch() {
        let data = vec![2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let mut stats = RunningStats::new();
        for &x in &data {
            stats.push(x);
        }
        let mean = data.iter().sum::<f64>() / data.len() as f64;
        let variance = data.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (data.len() - 1) as f64;

        assert_eq!(stats.count(), 8);
        assert_relative_eq!(stats.mean(), mean, epsilon = 1e-12);
        assert_relative_eq!(stats.variance(), variance, epsilon = 1e-12);
    }

    #[test]
    fn test_median_odd_even_and_empty() {
        assert_eq!(median(&mut [5.0, 1.0, 100.0, 2.0, 3.0]), 3.0);
        assert_eq!(median(&mut [4.0, 1.0, 3.0, 2.0]), 2.5);
        assert_eq!(median(&mut []), 0.0);
    }

    #[test]
    fn test_running_stats_small_samples() {
        let mut stats = RunningStats::new();
        assert_eq!(stats.variance(), 0.0);
        stats.push(3.0);
        assert_eq!(stats.mean(), 3.0);
        assert_eq!(stats.variance(), 0.0);
    }

    #[test]
    fn test_line_fit_recovers_line() {
        // y = 0.5 t + 2 for t = 0..10
        let ys: Vec<f64> = (0..10).map(|t| 0.5 * t as f64 + 2.0).collect();
        let sum_y: f64 = ys.iter().sum();
        let sum_ty: f64 = ys.iter().enumerate().map(|(t, y)| t as f64 * y).sum();
        let (slope, intercept) = line_fit(10, sum_y, sum_ty);
        assert_relative_eq!(slope, 0.5, epsilon = 1e-10);
        assert_relative_eq!(intercept, 2.0, epsilon = 1e-10);
    }

    #[test]
    fn test_line_fit_single_point() {
        assert_eq!(line_fit(1, 3.0, 0.0), (0.0, 3.0));
        assert_eq!(line_fit(0, 0.0, 0.0), (0.0, 0.0));
    }
}
