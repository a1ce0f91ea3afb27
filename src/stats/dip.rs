//! Hartigan's dip test of unimodality.
//!
//! The dip statistic is the smallest sup-norm distance between the empirical
//! distribution function and any unimodal distribution function. Significance
//! is assessed by bootstrapping the statistic under the uniform null, which
//! is the asymptotically least favorable unimodal distribution.

use rand::Rng;

#[derive(Clone, Copy, Debug)]
pub struct DipTest {
    pub statistic: f64,
    pub p_value: f64,
}

/// Dip statistic of a sample.
///
/// For every candidate mode position the empirical cdf is fitted from the
/// left by its greatest convex minorant and from the right by its least
/// concave majorant; the dip is half the smallest achievable worst-side
/// deviation.
pub fn dip_statistic(samples: &[f64]) -> f64 {
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).expect("dip input must not contain NaN"));
    dip_sorted(&sorted)
}

fn dip_sorted(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n < 4 || sorted[0] == sorted[n - 1] {
        return 0.0;
    }
    // collapse ties so hull abscissae are strictly increasing
    let mut points: Vec<(f64, f64)> = Vec::with_capacity(n);
    for (i, &x) in sorted.iter().enumerate() {
        let cdf = (i + 1) as f64 / n as f64;
        match points.last_mut() {
            Some(last) if last.0 == x => last.1 = cdf,
            _ => points.push((x, cdf)),
        }
    }
    if points.len() < 3 {
        return 0.0;
    }

    // left_dev is non-decreasing and right_dev non-increasing in the mode
    // position, so the minimax sits at their crossing
    let m = points.len();
    let (mut lo, mut hi) = (0, m - 1);
    while lo < hi {
        let mid = (lo + hi) / 2;
        if convex_minorant_deviation(&points[..=mid]) >= concave_majorant_deviation(&points[mid..])
        {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    let mut best = f64::INFINITY;
    for mode in lo.saturating_sub(1)..=(lo + 1).min(m - 1) {
        let left = convex_minorant_deviation(&points[..=mode]);
        let right = concave_majorant_deviation(&points[mode..]);
        best = best.min(left.max(right));
    }
    0.5 * best
}

/// Maximal excess of the cdf points above their greatest convex minorant.
fn convex_minorant_deviation(points: &[(f64, f64)]) -> f64 {
    hull_deviation(points, false)
}

/// Maximal excess of the least concave majorant above the cdf points.
fn concave_majorant_deviation(points: &[(f64, f64)]) -> f64 {
    hull_deviation(points, true)
}

fn hull_deviation(points: &[(f64, f64)], upper: bool) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut hull: Vec<(f64, f64)> = Vec::with_capacity(points.len());
    for &p in points {
        while hull.len() >= 2 {
            let a = hull[hull.len() - 2];
            let b = hull[hull.len() - 1];
            let keep = if upper {
                slope(a, b) > slope(b, p)
            } else {
                slope(a, b) < slope(b, p)
            };
            if keep {
                break;
            }
            hull.pop();
        }
        hull.push(p);
    }

    let mut deviation = 0.0f64;
    let mut segment = 0;
    for &(x, y) in points {
        while segment + 1 < hull.len() - 1 && hull[segment + 1].0 < x {
            segment += 1;
        }
        let (a, b) = (hull[segment], hull[segment + 1]);
        let fitted = if b.0 == a.0 {
            a.1
        } else {
            a.1 + slope(a, b) * (x - a.0)
        };
        let excess = if upper { fitted - y } else { y - fitted };
        deviation = deviation.max(excess);
    }
    deviation
}

fn slope(a: (f64, f64), b: (f64, f64)) -> f64 {
    (b.1 - a.1) / (b.0 - a.0)
}

/// Dip test with a bootstrapped uniform null.
pub fn dip_test<R: Rng>(samples: &[f64], bootstraps: usize, rng: &mut R) -> DipTest {
    let statistic = dip_statistic(samples);
    let n = samples.len();
    let mut at_least_as_large = 0usize;
    for _ in 0..bootstraps {
        let mut uniform: Vec<f64> = (0..n).map(|_| rng.gen::<f64>()).collect();
        uniform.sort_by(|a, b| a.partial_cmp(b).expect("uniform draws are not NaN"));
        if dip_sorted(&uniform) >= statistic {
            at_least_as_large += 1;
        }
    }
    DipTest {
        statistic,
        p_value: (at_least_as_large + 1) as f64 / (bootstraps + 1) as f64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use statrs::distribution::{ContinuousCDF, Normal};

    fn bimodal_sample(n_per_mode: usize) -> Vec<f64> {
        let left = Normal::new(-2.0, 1.0).unwrap();
        let right = Normal::new(2.0, 1.0).unwrap();
        let mut samples = Vec::with_capacity(2 * n_per_mode);
        for i in 0..n_per_mode {
            let q = (i as f64 + 0.5) / n_per_mode as f64;
            samples.push(left.inverse_cdf(q));
        }
        for i in 0..n_per_mode {
            let q = (i as f64 + 0.5) / n_per_mode as f64;
            samples.push(right.inverse_cdf(q));
        }
        samples
    }

    fn uniform_sample(n: usize) -> Vec<f64> {
        (0..n).map(|i| (i as f64 + 0.5) / n as f64).collect()
    }

    #[test]
    fn test_bimodal_rejects_unimodality() {
        let samples = bimodal_sample(200);
        let mut rng = StdRng::seed_from_u64(42);
        let result = dip_test(&samples, 1000, &mut rng);
        assert!(
            result.p_value < 0.05,
            "bimodal sample p = {}",
            result.p_value
        );
    }

    #[test]
    fn test_uniform_accepts_unimodality() {
        let samples = uniform_sample(400);
        let mut rng = StdRng::seed_from_u64(42);
        let result = dip_test(&samples, 1000, &mut rng);
        assert!(
            result.p_value > 0.05,
            "uniform sample p = {}",
            result.p_value
        );
    }

    #[test]
    fn test_bimodal_dip_exceeds_unimodal_dip() {
        let bimodal = dip_statistic(&bimodal_sample(200));
        let unimodal: Vec<f64> = {
            let normal = Normal::new(0.0, 1.0).unwrap();
            (0..400)
                .map(|i| normal.inverse_cdf((i as f64 + 0.5) / 400.0))
                .collect()
        };
        assert!(bimodal > dip_statistic(&unimodal) * 2.0);
    }

    #[test]
    fn test_degenerate_samples() {
        assert_eq!(dip_statistic(&[1.0, 1.0, 1.0, 1.0]), 0.0);
        assert_eq!(dip_statistic(&[1.0, 2.0]), 0.0);
    }
}
