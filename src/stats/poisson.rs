//! Log-space Poisson upper tail.

use bio::stats::LogProb;
use lazy_static::lazy_static;
use statrs::function::gamma::ln_gamma;

/// Log-factorials are cached as a prefix sum up to this count; beyond it the
/// recurrence extends the last cached value by `ln(i)` terms.
const LOG_FACTORIAL_CACHE: usize = 10_001;

/// Successive tail terms smaller than this stop the accumulation.
const CONVERGENCE: f64 = 1e-5;

lazy_static! {
    static ref LOG_FACTORIALS: Vec<f64> = {
        let mut cache = Vec::with_capacity(LOG_FACTORIAL_CACHE);
        cache.push(0.0);
        for i in 1..LOG_FACTORIAL_CACHE {
            cache.push(cache[i - 1] + (i as f64).ln());
        }
        cache
    };
}

pub(crate) fn log_factorial(k: u64) -> f64 {
    if (k as usize) < LOG_FACTORIAL_CACHE {
        LOG_FACTORIALS[k as usize]
    } else {
        ln_gamma(k as f64 + 1.0)
    }
}

/// `log P(N >= k)` for `N ~ Poisson(lambda)`.
///
/// Accumulates `logsumexp_{i >= k} (i ln lambda - lambda - ln i!)` with the
/// term recurrence `t_{i+1} = t_i + ln lambda - ln(i + 1)`, stopping once the
/// accumulated value changes by less than the convergence threshold. The
/// result is clamped to be a valid log probability.
pub fn log_poisson_survival(k: u64, lambda: f64) -> f64 {
    assert!(lambda > 0.0, "lambda must be positive");
    if k == 0 {
        return 0.0;
    }
    let ln_lambda = lambda.ln();
    let mut term = k as f64 * ln_lambda - lambda - log_factorial(k);
    let mut acc = term;
    let mut i = k;
    loop {
        i += 1;
        term += ln_lambda - (i as f64).ln();
        let next = *LogProb(acc).ln_add_exp(LogProb(term));
        if (next - acc).abs() < CONVERGENCE && i > (lambda.ceil() as u64).max(k) {
            acc = next;
            break;
        }
        acc = next;
    }
    acc.min(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_log_factorial_cache_and_fallback() {
        assert_eq!(log_factorial(0), 0.0);
        assert_relative_eq!(log_factorial(5), 120.0f64.ln(), max_relative = 1e-12);
        // beyond the cache, the gamma fallback must agree with the recurrence
        let beyond = LOG_FACTORIAL_CACHE as u64 + 10;
        let mut expected = LOG_FACTORIALS[LOG_FACTORIAL_CACHE - 1];
        for i in LOG_FACTORIAL_CACHE as u64..=beyond {
            expected += (i as f64).ln();
        }
        assert_relative_eq!(log_factorial(beyond), expected, max_relative = 1e-10);
    }

    #[test]
    fn test_survival_certain_event() {
        assert_eq!(log_poisson_survival(0, 3.0), 0.0);
    }

    #[test]
    fn test_survival_small_counts() {
        // P(N >= 1) = 1 - e^-lambda
        let lambda = 2.5;
        let expected = (1.0 - (-lambda as f64).exp()).ln();
        assert_relative_eq!(log_poisson_survival(1, lambda), expected, max_relative = 1e-6);
        // P(N >= 2) = 1 - e^-l (1 + l)
        let expected = (1.0 - (-lambda as f64).exp() * (1.0 + lambda)).ln();
        assert_relative_eq!(log_poisson_survival(2, lambda), expected, max_relative = 1e-6);
    }

    #[test]
    fn test_survival_deep_tail_is_small_and_monotone() {
        let p50 = log_poisson_survival(50, 1.0);
        let p60 = log_poisson_survival(60, 1.0);
        assert!(p50 < -100.0);
        assert!(p60 < p50);
    }

    #[test]
    fn test_survival_large_lambda() {
        // far below the mean the survival is essentially certain
        let p = log_poisson_survival(10, 1000.0);
        assert!(p > -1e-6);
        assert!(p <= 0.0);
    }
}
