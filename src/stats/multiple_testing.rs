//! Multiple-testing correction in log space.
//!
//! P-values enter and leave as natural-log values so that extremely small
//! probabilities survive the correction without underflow.

use ordered_float::NotNan;

/// Benjamini–Hochberg adjustment of a vector of log p-values.
///
/// The k-th smallest log-p becomes `log p + ln(M) - ln(k + 1)`; the adjusted
/// values are made monotone non-increasing from the largest rank down and
/// mapped back to the original order. Results are clamped to valid log
/// probabilities.
pub fn benjamini_hochberg_log(log_ps: &[f64]) -> Vec<f64> {
    let m = log_ps.len();
    if m == 0 {
        return Vec::new();
    }
    let ln_m = (m as f64).ln();
    let mut order: Vec<usize> = (0..m).collect();
    order.sort_by_key(|&i| NotNan::new(log_ps[i]).expect("log p-values must not be NaN"));

    let mut adjusted_sorted: Vec<f64> = order
        .iter()
        .enumerate()
        .map(|(k, &i)| log_ps[i] + ln_m - ((k + 1) as f64).ln())
        .collect();
    // enforce monotonicity: q_(k) = min(q_(k), q_(k+1), ...)
    for k in (0..m - 1).rev() {
        adjusted_sorted[k] = adjusted_sorted[k].min(adjusted_sorted[k + 1]);
    }

    let mut adjusted = vec![0.0; m];
    for (k, &i) in order.iter().enumerate() {
        adjusted[i] = adjusted_sorted[k].min(0.0);
    }
    adjusted
}

/// Bonferroni adjustment: each log-p gains `ln(M)`, clamped to 0.
pub fn bonferroni_log(log_ps: &[f64]) -> Vec<f64> {
    let ln_m = (log_ps.len() as f64).ln();
    log_ps.iter().map(|&p| (p + ln_m).min(0.0)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Reference BH rejection set computed in plain probability space.
    fn bh_reject_reference(ps: &[f64], alpha: f64) -> Vec<bool> {
        let m = ps.len();
        let mut order: Vec<usize> = (0..m).collect();
        order.sort_by(|&a, &b| ps[a].partial_cmp(&ps[b]).unwrap());
        let mut max_k = None;
        for (k, &i) in order.iter().enumerate() {
            if ps[i] <= (k + 1) as f64 / m as f64 * alpha {
                max_k = Some(k);
            }
        }
        let mut reject = vec![false; m];
        if let Some(max_k) = max_k {
            for &i in &order[..=max_k] {
                reject[i] = true;
            }
        }
        reject
    }

    #[test]
    fn test_bh_matches_standard_rejection_set() {
        let ps: Vec<f64> = vec![0.001, 0.008, 0.039, 0.041, 0.042, 0.06, 0.074, 0.205, 0.5, 0.9];
        let log_ps: Vec<f64> = ps.iter().map(|p| p.ln()).collect();
        let alpha = 0.05f64;
        let adjusted = benjamini_hochberg_log(&log_ps);
        let rejected: Vec<bool> = adjusted.iter().map(|&q| q <= alpha.ln()).collect();
        assert_eq!(rejected, bh_reject_reference(&ps, alpha));
    }

    #[test]
    fn test_bh_monotone_and_order_preserved() {
        let log_ps = vec![(0.04f64).ln(), (0.001f64).ln(), (0.9f64).ln()];
        let adjusted = benjamini_hochberg_log(&log_ps);
        // adjusted values respect the ranking of the input
        assert!(adjusted[1] <= adjusted[0]);
        assert!(adjusted[0] <= adjusted[2]);
        assert!(adjusted.iter().all(|&q| q <= 0.0));
    }

    #[test]
    fn test_bh_extreme_values_stay_in_log_domain() {
        let log_ps = vec![-5000.0, -4000.0, -1.0];
        let adjusted = benjamini_hochberg_log(&log_ps);
        assert!(adjusted[0] < -4000.0);
        assert!(adjusted[1] < -3000.0);
    }

    #[test]
    fn test_bonferroni() {
        let log_ps = vec![(0.01f64).ln(), (0.5f64).ln()];
        let adjusted = bonferroni_log(&log_ps);
        assert_relative_eq!(adjusted[0], (0.02f64).ln(), max_relative = 1e-12);
        assert_eq!(adjusted[1], 0.0);
    }

    #[test]
    fn test_empty() {
        assert!(benjamini_hochberg_log(&[]).is_empty());
    }
}
