//! Kernel-density summit refinement.
//!
//! In summit mode each primary candidate is replaced by the modes of its
//! Gaussian-smoothed raw signal: local maxima expanded while the smoothed
//! value keeps falling, subject to a minimum mode length and a minimum
//! inter-mode distance.

use std::ops::Range;

#[derive(Clone, Copy, Debug)]
pub struct SummitConfig {
    /// Kernel bandwidth in bins; sigma is half of it.
    pub bandwidth: usize,
    /// Minimum mode length, in bandwidths.
    pub min_length_factor: usize,
    /// Minimum inter-mode distance, in bandwidths.
    pub min_distance_factor: usize,
}

impl Default for SummitConfig {
    fn default() -> Self {
        SummitConfig {
            bandwidth: 3,
            min_length_factor: 3,
            min_distance_factor: 2,
        }
    }
}

/// Area-normalized Gaussian kernel with `sigma = bandwidth / 2` and radius
/// `ceil(bandwidth / 2)`.
pub(crate) fn gaussian_kernel(bandwidth: usize) -> Vec<f64> {
    let sigma = (bandwidth as f64 / 2.0).max(0.5);
    let radius = (bandwidth as f64 / 2.0).ceil() as i64;
    let mut kernel: Vec<f64> = (-radius..=radius)
        .map(|j| (-(j * j) as f64 / (2.0 * sigma * sigma)).exp())
        .collect();
    let total: f64 = kernel.iter().sum();
    for w in &mut kernel {
        *w /= total;
    }
    kernel
}

/// Convolve with edge renormalization so boundary bins are not deflated.
pub(crate) fn smooth(signal: &[f64], kernel: &[f64]) -> Vec<f64> {
    let radius = (kernel.len() / 2) as i64;
    let n = signal.len() as i64;
    (0..n)
        .map(|i| {
            let mut value = 0.0;
            let mut mass = 0.0;
            for (k, &w) in kernel.iter().enumerate() {
                let j = i + k as i64 - radius;
                if j >= 0 && j < n {
                    value += w * signal[j as usize];
                    mass += w;
                }
            }
            value / mass
        })
        .collect()
}

/// Mode sub-ranges of the signal, in ascending order.
pub fn find_summits(signal: &[f64], config: &SummitConfig) -> Vec<Range<usize>> {
    let n = signal.len();
    if n == 0 {
        return Vec::new();
    }
    let bandwidth = config.bandwidth.max(1);
    let smoothed = smooth(signal, &gaussian_kernel(bandwidth));

    let peak_height = smoothed.iter().copied().fold(0.0f64, f64::max);
    if peak_height <= 0.0 {
        return Vec::new();
    }
    let slope_eps = peak_height * 1e-3;

    let mut modes: Vec<Range<usize>> = Vec::new();
    for i in 0..n {
        let left_lower = i == 0 || smoothed[i - 1] < smoothed[i];
        let right_not_higher = i + 1 == n || smoothed[i + 1] <= smoothed[i];
        if !(left_lower && right_not_higher) {
            continue;
        }
        let range = expand_mode(&smoothed, i, bandwidth, slope_eps);
        match modes.last_mut() {
            Some(last) if last.end > range.start => last.end = last.end.max(range.end),
            _ => modes.push(range),
        }
    }

    enforce_min_length(&mut modes, bandwidth * config.min_length_factor, n);
    enforce_min_distance(&mut modes, bandwidth * config.min_distance_factor, bandwidth);
    modes
}

/// Walk outwards from a local maximum while the smoothed value keeps
/// falling, stopping once the slope stays near zero for a full bandwidth.
fn expand_mode(smoothed: &[f64], peak: usize, bandwidth: usize, slope_eps: f64) -> Range<usize> {
    let mut start = peak;
    let mut flat = 0usize;
    while start > 0 {
        let step = smoothed[start] - smoothed[start - 1];
        if step < -slope_eps {
            break;
        }
        flat = if step.abs() <= slope_eps { flat + 1 } else { 0 };
        if flat >= bandwidth {
            break;
        }
        start -= 1;
    }
    let mut end = peak + 1;
    flat = 0;
    while end < smoothed.len() {
        let step = smoothed[end - 1] - smoothed[end];
        if step < -slope_eps {
            break;
        }
        flat = if step.abs() <= slope_eps { flat + 1 } else { 0 };
        if flat >= bandwidth {
            break;
        }
        end += 1;
    }
    start..end
}

fn enforce_min_length(modes: &mut [Range<usize>], min_length: usize, n: usize) {
    for mode in modes.iter_mut() {
        while mode.len() < min_length && (mode.start > 0 || mode.end < n) {
            if mode.start > 0 {
                mode.start -= 1;
            }
            if mode.len() < min_length && mode.end < n {
                mode.end += 1;
            }
        }
    }
}

/// Consecutive modes closer than the minimum distance are trimmed equally
/// from both facing sides; modes that would shrink below one bandwidth are
/// merged instead.
fn enforce_min_distance(modes: &mut Vec<Range<usize>>, min_distance: usize, bandwidth: usize) {
    let mut i = 0;
    while i + 1 < modes.len() {
        let gap = modes[i + 1].start.saturating_sub(modes[i].end);
        if gap >= min_distance {
            i += 1;
            continue;
        }
        let deficit = min_distance - gap;
        let trim_left = deficit / 2 + deficit % 2;
        let trim_right = deficit / 2;
        let left_len = modes[i].len();
        let right_len = modes[i + 1].len();
        if left_len > trim_left + bandwidth && right_len > trim_right + bandwidth {
            modes[i].end -= trim_left;
            modes[i + 1].start += trim_right;
            i += 1;
        } else {
            let merged = modes[i].start..modes[i + 1].end;
            modes[i] = merged;
            modes.remove(i + 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_kernel_is_normalized_and_symmetric() {
        let kernel = gaussian_kernel(4);
        assert_eq!(kernel.len(), 5);
        assert_relative_eq!(kernel.iter().sum::<f64>(), 1.0, max_relative = 1e-12);
        assert_relative_eq!(kernel[0], kernel[4]);
        assert!(kernel[2] > kernel[1]);
    }

    #[test]
    fn test_smooth_preserves_constant_signal() {
        let smoothed = smooth(&[2.0; 20], &gaussian_kernel(4));
        for v in smoothed {
            assert_relative_eq!(v, 2.0, max_relative = 1e-12);
        }
    }

    #[test]
    fn test_single_mode() {
        let mut signal = vec![0.0; 40];
        for (i, v) in signal.iter_mut().enumerate().take(26).skip(14) {
            *v = 10.0 - (i as f64 - 20.0).abs();
        }
        let config = SummitConfig {
            bandwidth: 2,
            ..Default::default()
        };
        let summits = find_summits(&signal, &config);
        assert_eq!(summits.len(), 1);
        assert!(summits[0].contains(&20));
    }

    #[test]
    fn test_two_well_separated_modes() {
        let mut signal = vec![0.1; 100];
        for i in 10..20 {
            signal[i] = 10.0;
        }
        for i in 60..70 {
            signal[i] = 8.0;
        }
        let config = SummitConfig {
            bandwidth: 2,
            ..Default::default()
        };
        let summits = find_summits(&signal, &config);
        assert_eq!(summits.len(), 2);
        assert!(summits[0].start >= 5 && summits[0].end <= 30);
        assert!(summits[1].start >= 50 && summits[1].end <= 80);
    }

    #[test]
    fn test_close_modes_merge_or_separate() {
        let mut signal = vec![0.1; 40];
        for i in 10..14 {
            signal[i] = 10.0;
        }
        for i in 16..20 {
            signal[i] = 9.0;
        }
        let config = SummitConfig {
            bandwidth: 2,
            ..Default::default()
        };
        let summits = find_summits(&signal, &config);
        // the two bumps sit closer than the minimum distance: they either
        // merge into one mode or keep the required separation
        if summits.len() == 2 {
            assert!(summits[1].start - summits[0].end >= 4);
        } else {
            assert_eq!(summits.len(), 1);
        }
        for summit in &summits {
            assert!(summit.len() >= 2);
        }
    }

    #[test]
    fn test_flat_zero_signal_has_no_summits() {
        assert!(find_summits(&[0.0; 30], &SummitConfig::default()).is_empty());
    }
}
