//! Maximally-overlapping Allan deviation.
//!
//! For each averaging window of `m` samples the series is passed through a
//! causal unit-gain box filter, differenced at lag `m`, and the Allan variance
//! is half the mean squared difference over every valid starting offset.
//! Window lengths grow geometrically (`ceil(1.1^k)`), capped at `N / 9` so the
//! largest window still has enough independent averages.
//!
//! # Example
//!
//! ```
//! use fog_daq::data::allan::allan_deviation;
//!
//! let samples: Vec<f64> = (0..900).map(|i| ((i * 7919) % 101) as f64 / 100.0).collect();
//! let curve = allan_deviation(&samples, 1.0);
//! assert_eq!(curve.first().map(|p| p.tau), Some(1.0));
//! ```

use serde::{Deserialize, Serialize};

/// Growth ratio between successive candidate window lengths.
pub const WINDOW_GROWTH: f64 = 1.1;

/// Minimum number of largest-window spans the series must contain.
pub const MIN_SPANS: f64 = 9.0;

/// One point of an Allan-deviation curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AllanPoint {
    /// Averaging time in seconds
    pub tau: f64,
    /// Deviation, in the units of the input series
    pub sigma: f64,
}

/// Allan-deviation curve with strictly increasing `tau`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllanCurve {
    points: Vec<AllanPoint>,
}

impl AllanCurve {
    /// Points in increasing `tau` order.
    pub fn points(&self) -> &[AllanPoint] {
        &self.points
    }

    /// Averaging times in seconds.
    pub fn taus(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.tau).collect()
    }

    /// Deviations matching [`taus`](Self::taus).
    pub fn sigmas(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.sigma).collect()
    }

    /// Number of points.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether the series was too short to produce any point.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Shortest-tau point.
    pub fn first(&self) -> Option<AllanPoint> {
        self.points.first().copied()
    }

    /// Point with the smallest deviation (the bias-instability floor).
    pub fn min_sigma(&self) -> Option<AllanPoint> {
        self.points
            .iter()
            .copied()
            .min_by(|a, b| a.sigma.total_cmp(&b.sigma))
    }
}

/// Averaging windows, in samples, evaluated for a series of `n` samples.
///
/// Candidates are `ceil(1.1^k)` for `k = 0, 1, 2, ...`, stopping once a
/// candidate exceeds `n / 9`; repeated values are collapsed. Series shorter
/// than nine samples produce no windows.
pub fn window_lengths(n: usize) -> Vec<usize> {
    let m_max = n as f64 / MIN_SPANS;
    let mut windows: Vec<usize> = Vec::new();
    let mut k = 0i32;
    loop {
        let candidate = WINDOW_GROWTH.powf(f64::from(k)).ceil();
        if candidate > m_max {
            break;
        }
        let m = candidate as usize;
        if windows.last() != Some(&m) {
            windows.push(m);
        }
        k += 1;
    }
    windows
}

/// Compute the overlapping Allan deviation of `samples` taken every `dt` seconds.
///
/// Returns an empty curve when the series is too short for any window.
pub fn allan_deviation(samples: &[f64], dt: f64) -> AllanCurve {
    let n = samples.len();
    let windows = window_lengths(n);
    if windows.is_empty() {
        return AllanCurve::default();
    }

    // Differences are offset invariant; centring keeps the prefix sums small
    let mean = samples.iter().sum::<f64>() / n as f64;
    let mut prefix = Vec::with_capacity(n + 1);
    prefix.push(0.0);
    let mut running = 0.0;
    for x in samples {
        running += x - mean;
        prefix.push(running);
    }

    let points = windows
        .into_iter()
        .filter_map(|m| {
            overlapping_variance(&prefix, n, m).map(|variance| AllanPoint {
                tau: m as f64 * dt,
                sigma: variance.sqrt(),
            })
        })
        .collect();

    AllanCurve { points }
}

/// Causal moving average of length `m` ending at sample `k` (zero-padded before 0).
fn moving_average(prefix: &[f64], k: usize, m: usize) -> f64 {
    let lo = (k + 1).saturating_sub(m);
    (prefix[k + 1] - prefix[lo]) / m as f64
}

/// Allan variance for window `m`.
///
/// The filtered series is trimmed of its first `m` samples (filter
/// transient) and its last sample (edge artifact), differenced at lag `m`,
/// and the first `m + 1` and final differences are discarded. What remains is
/// `d(i) = y(m + i) - y(i)` for `i` in `m + 1 .. n - m - 2`.
fn overlapping_variance(prefix: &[f64], n: usize, m: usize) -> Option<f64> {
    let trimmed = n.checked_sub(m + 1)?;
    let end = trimmed.checked_sub(1)?;
    let start = m + 1;
    if end <= start {
        return None;
    }

    let mut sum_sq = 0.0;
    for i in start..end {
        let d = moving_average(prefix, m + i, m) - moving_average(prefix, i, m);
        sum_sq += d * d;
    }
    Some(0.5 * sum_sq / (end - start) as f64)
}

/// Non-overlapping "sigma deviation": the standard deviation of block means.
///
/// Averaging times are ~30 log-spaced integer seconds between 1 and the
/// series length; each block holds `rate * tau` samples and any trailing
/// partial block is dropped. Taus whose block is empty or longer than the
/// series are skipped.
pub fn sigma_deviation(samples: &[f64], rate: f64) -> AllanCurve {
    const STEPS: usize = 30;
    let n = samples.len();
    if n == 0 || !(rate > 0.0) {
        return AllanCurve::default();
    }

    let top = (n as f64).log10();
    let mut taus: Vec<usize> = (0..STEPS)
        .map(|i| {
            let exponent = top * i as f64 / (STEPS - 1) as f64;
            10f64.powf(exponent) as usize
        })
        .collect();
    taus.dedup();

    let points = taus
        .into_iter()
        .filter_map(|tau| {
            let spacing = (rate * tau as f64).round() as usize;
            if spacing == 0 || spacing > n {
                return None;
            }
            let blocks = n / spacing;
            let means: Vec<f64> = samples[..blocks * spacing]
                .chunks_exact(spacing)
                .map(|chunk| chunk.iter().sum::<f64>() / spacing as f64)
                .collect();
            let grand = means.iter().sum::<f64>() / blocks as f64;
            let variance =
                means.iter().map(|m| (m - grand).powi(2)).sum::<f64>() / blocks as f64;
            Some(AllanPoint {
                tau: tau as f64,
                sigma: variance.sqrt(),
            })
        })
        .collect();

    AllanCurve { points }
}
