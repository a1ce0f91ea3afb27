//! Negative-binomial emission distributions.

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use statrs::function::gamma::ln_gamma;

use crate::stats::poisson::log_factorial;
use crate::stats::{percentile_sorted, KahanSum};

use super::ModelKind;

/// Overdispersion floor: variance / mean must stay at or above this ratio,
/// which bounds the failures parameter from above via
/// `r <= mean / (ratio - 1)`.
pub const MIN_VARIANCE_TO_MEAN: f64 = 1.0 + 1e-3;

const MIN_MEAN: f64 = 1e-10;
const MIN_FAILURES: f64 = 1e-10;

/// Negative binomial with mean `mu` and failures `r`:
/// `Var = mu + mu^2 / r`, success probability `p = mu / (mu + r)`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct NegBinEmission {
    mean: f64,
    failures: f64,
}

impl NegBinEmission {
    pub fn new(mean: f64, failures: f64) -> Self {
        let mean = mean.max(MIN_MEAN);
        let max_failures = mean / (MIN_VARIANCE_TO_MEAN - 1.0);
        NegBinEmission {
            mean,
            failures: failures.clamp(MIN_FAILURES, max_failures),
        }
    }

    /// Method-of-moments parameterization: `r = mean^2 / (var - mean)`.
    /// Underdispersed moments fall onto the overdispersion floor.
    pub fn from_moments(mean: f64, variance: f64) -> Self {
        let mean = mean.max(MIN_MEAN);
        let failures = if variance > mean {
            mean * mean / (variance - mean)
        } else {
            f64::INFINITY
        };
        Self::new(mean, failures)
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn failures(&self) -> f64 {
        self.failures
    }

    pub fn variance(&self) -> f64 {
        self.mean + self.mean * self.mean / self.failures
    }

    pub fn success_prob(&self) -> f64 {
        self.mean / (self.mean + self.failures)
    }

    /// `ln P(X = k)` via the gamma-function form, valid for non-integer
    /// failures.
    pub fn log_pmf(&self, k: u32) -> f64 {
        let r = self.failures;
        let p = self.success_prob();
        let k = k as f64;
        ln_gamma(k + r) - ln_gamma(r) - log_factorial(k as u64) + k * p.ln() + r * (1.0 - p).ln()
    }

    pub(crate) fn with_mean(&self, mean: f64) -> Self {
        Self::new(mean, self.failures)
    }
}

/// Initialize emission rows from the data.
///
/// With two rows (the analyze and compare default) the low row takes the
/// median and variance of the lowest `low_fraction` of nonzero counts and
/// the high row those of the top `high_fraction`. More rows split the
/// nonzero counts into even quantile bands.
pub(crate) fn init_emissions(
    kind: ModelKind,
    counts_per_dim: &[Vec<u32>],
    low_fraction: f64,
    high_fraction: f64,
) -> Array2<NegBinEmission> {
    let rows = kind.n_emission_rows();
    let dims = counts_per_dim.len();
    Array2::from_shape_fn((rows, dims), |(row, dim)| {
        let mut nonzero: Vec<f64> = counts_per_dim[dim]
            .iter()
            .filter(|&&c| c > 0)
            .map(|&c| c as f64)
            .collect();
        if nonzero.is_empty() {
            return NegBinEmission::new(MIN_MEAN, 1.0);
        }
        nonzero.sort_by(|a, b| a.partial_cmp(b).expect("counts are finite"));
        let band = if rows == 2 {
            match row {
                0 => {
                    let n = ((nonzero.len() as f64 * low_fraction).ceil() as usize).max(1);
                    &nonzero[..n]
                }
                _ => {
                    let n = ((nonzero.len() as f64 * high_fraction).ceil() as usize).max(1);
                    &nonzero[nonzero.len() - n..]
                }
            }
        } else {
            let lo = nonzero.len() * row / rows;
            let hi = (nonzero.len() * (row + 1) / rows).max(lo + 1);
            &nonzero[lo..hi.min(nonzero.len())]
        };
        moments_emission(band)
    })
}

fn moments_emission(sorted_band: &[f64]) -> NegBinEmission {
    let mean = percentile_sorted(sorted_band, 0.5);
    let mut sq = KahanSum::new();
    let avg = sorted_band.iter().sum::<f64>() / sorted_band.len() as f64;
    for &v in sorted_band {
        sq.add((v - avg) * (v - avg));
    }
    let variance = sq.sum() / sorted_band.len() as f64;
    NegBinEmission::from_moments(mean, variance)
}
