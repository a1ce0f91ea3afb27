// Copyright 2016-2019 Johannes Köster, David Lähnemann.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

//! Sensitivity estimation: choosing the log-PEP threshold without a
//! user-tuned parameter.
//!
//! The estimator sweeps log-spaced thresholds over the observed log-null
//! range and summarizes each by candidate count and mean candidate length.
//! On the resulting curve it locates the "sensitivity triangle" (the
//! before-merge, stable, and before-noise inflections) and then picks, in
//! the stable stretch, the threshold at which newly appearing candidates
//! are rarest.

use itertools::Itertools;
use itertools_num::linspace;
use log::{debug, info, warn};
use rayon::prelude::*;

use crate::errors::Error;
use crate::utils::CancellationToken;

use super::candidates::runs_below;

/// Ceiling on log null during sweeps; posteriors closer to certainty than
/// this do not separate thresholds meaningfully.
pub(crate) const MIN_SENSITIVITY: f64 = -1e-10;

const SWEEP_STEPS: usize = 100;

/// More consecutive equal candidate counts than this at the loose end of
/// the sweep trigger a re-run on the truncated range.
const DEGENERATE_RUN: usize = 5;

/// The before-merge index must not sit in the first fifth of the sweep.
const TRIANGLE_MIN_FRACTION: f64 = 0.2;

/// Window around the candidate-count argmax searched for the stable index.
const STABLE_WINDOW: usize = 5;

#[derive(Clone, Debug)]
pub struct SensitivityResult {
    /// The chosen log-PEP threshold t*.
    pub threshold: f64,
    /// A stricter threshold for the summit-refining pass, when the
    /// triangle was found.
    pub summit_threshold: Option<f64>,
    /// Swept thresholds, ascending (strict to loose).
    pub thresholds: Vec<f64>,
    pub candidate_counts: Vec<usize>,
    pub mean_lengths: Vec<f64>,
    /// (before-merge, stable, before-noise) sweep indices.
    pub triangle: Option<(usize, usize, usize)>,
}

/// Estimate the sensitivity from per-chromosome log-null tracks.
///
/// Falls back to `ln(fdr)` when the triangle cannot be located.
pub fn estimate(
    log_null: &[(&str, &[f32])],
    fdr: f64,
    cancel: &CancellationToken,
) -> Result<SensitivityResult, Error> {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for (_, track) in log_null {
        for &value in *track {
            let value = value as f64;
            min = min.min(value);
            max = max.max(value);
        }
    }
    max = max.min(MIN_SENSITIVITY);
    if !min.is_finite() || min >= max {
        warn!(
            "log null posteriors span no usable range; \
             falling back to ln(FDR) sensitivity"
        );
        return Ok(fallback(fdr));
    }

    let (mut thresholds, mut counts, mut lengths) = sweep(log_null, min, max, cancel)?;
    if let Some(flat_start) = degenerate_top(&counts) {
        debug!(
            "sweep top degenerate from index {}; re-running on truncated range",
            flat_start
        );
        let truncated_max = thresholds[flat_start];
        if min < truncated_max {
            let rerun = sweep(log_null, min, truncated_max, cancel)?;
            thresholds = rerun.0;
            counts = rerun.1;
            lengths = rerun.2;
        }
    }

    let triangle = detect_triangle(&counts, &lengths);
    let threshold = match triangle {
        Some((i1, i2, _)) => {
            additive_threshold(log_null, &thresholds, i1, i2, cancel)?
                .unwrap_or_else(|| thresholds[i2])
        }
        None => {
            warn!("sensitivity triangle not found; falling back to ln(FDR)");
            fdr.ln()
        }
    };
    info!(
        "sensitivity threshold {:.4} (triangle {:?})",
        threshold, triangle
    );

    Ok(SensitivityResult {
        threshold,
        summit_threshold: triangle.map(|(i1, _, _)| thresholds[i1]),
        thresholds,
        candidate_counts: counts,
        mean_lengths: lengths,
        triangle,
    })
}

fn fallback(fdr: f64) -> SensitivityResult {
    SensitivityResult {
        threshold: fdr.ln(),
        summit_threshold: None,
        thresholds: Vec::new(),
        candidate_counts: Vec::new(),
        mean_lengths: Vec::new(),
        triangle: None,
    }
}

/// Log-spaced sweep from the strict bound to the loose bound. Both bounds
/// are negative; spacing is uniform in `ln(-s)`.
fn sweep(
    log_null: &[(&str, &[f32])],
    min: f64,
    max: f64,
    cancel: &CancellationToken,
) -> Result<(Vec<f64>, Vec<usize>, Vec<f64>), Error> {
    let thresholds: Vec<f64> = linspace((-min).ln(), (-max).ln(), SWEEP_STEPS)
        .map(|l| -l.exp())
        .collect();
    let summaries: Result<Vec<(usize, f64)>, Error> = thresholds
        .par_iter()
        .map(|&threshold| {
            cancel.check()?;
            let mut count = 0usize;
            let mut total_length = 0usize;
            for (_, track) in log_null {
                for run in runs_below(track, threshold, 0) {
                    count += 1;
                    total_length += run.len();
                }
            }
            let mean_length = if count == 0 {
                0.0
            } else {
                total_length as f64 / count as f64
            };
            Ok((count, mean_length))
        })
        .collect();
    let (counts, lengths) = summaries?.into_iter().unzip();
    Ok((thresholds, counts, lengths))
}

/// Index where the loose end of the sweep goes flat, if the flat stretch is
/// longer than the degeneracy limit.
fn degenerate_top(counts: &[usize]) -> Option<usize> {
    let last = *counts.last()?;
    let flat = counts.iter().rev().take_while(|&&c| c == last).count();
    if flat > DEGENERATE_RUN {
        Some(counts.len() - flat)
    } else {
        None
    }
}

/// Locate the indices i1 < i2 < i3 maximizing the geometric mean of the
/// absolute signed areas of the triangles (0, i1, i2) and (i2, i3, end) on
/// the (log(1+count), log(1+length)) curve.
fn detect_triangle(counts: &[usize], lengths: &[f64]) -> Option<(usize, usize, usize)> {
    let n = counts.len();
    if n < 4 {
        return None;
    }
    let points: Vec<(f64, f64)> = counts
        .iter()
        .zip(lengths)
        .map(|(&c, &l)| ((1.0 + c as f64).ln(), (1.0 + l).ln()))
        .collect();

    let argmax = counts
        .iter()
        .position_max_by_key(|&&c| c)
        .expect("counts is non-empty");
    let i1_min = ((n as f64 * TRIANGLE_MIN_FRACTION).ceil() as usize).max(1);

    let mut best: Option<((usize, usize, usize), f64)> = None;
    let stable_lo = argmax.saturating_sub(STABLE_WINDOW);
    let stable_hi = (argmax + STABLE_WINDOW).min(n - 2);
    for i2 in stable_lo..=stable_hi {
        if i2 <= i1_min || i2 + 1 >= n - 1 {
            continue;
        }
        let i1 = (i1_min..i2)
            .max_by(|&a, &b| {
                area(&points, 0, a, i2)
                    .abs()
                    .total_cmp(&area(&points, 0, b, i2).abs())
            })
            .expect("non-empty range");
        let i3 = (i2 + 1..n - 1)
            .max_by(|&a, &b| {
                area(&points, i2, a, n - 1)
                    .abs()
                    .total_cmp(&area(&points, i2, b, n - 1).abs())
            })
            .expect("non-empty range");
        let criterion = triangle_criterion(&points, i1, i2, i3);
        if criterion > 0.0 && best.map_or(true, |(_, c)| criterion > c) {
            best = Some(((i1, i2, i3), criterion));
        }
    }
    let ((mut i1, i2, mut i3), mut criterion) = best?;

    // refine the outer indices towards the stable one while it improves
    loop {
        let mut improved = false;
        if i1 + 1 < i2 {
            let candidate = triangle_criterion(&points, i1 + 1, i2, i3);
            if candidate > criterion {
                i1 += 1;
                criterion = candidate;
                improved = true;
            }
        }
        if i3 > i2 + 1 {
            let candidate = triangle_criterion(&points, i1, i2, i3 - 1);
            if candidate > criterion {
                i3 -= 1;
                criterion = candidate;
                improved = true;
            }
        }
        if !improved {
            break;
        }
    }
    Some((i1, i2, i3))
}

fn triangle_criterion(points: &[(f64, f64)], i1: usize, i2: usize, i3: usize) -> f64 {
    let first = area(points, 0, i1, i2).abs();
    let second = area(points, i2, i3, points.len() - 1).abs();
    (first * second).sqrt()
}

fn area(points: &[(f64, f64)], a: usize, b: usize, c: usize) -> f64 {
    let (ax, ay) = points[a];
    let (bx, by) = points[b];
    let (cx, cy) = points[c];
    0.5 * ((bx - ax) * (cy - ay) - (cx - ax) * (by - ay))
}

/// Additive-candidate analysis over the stable stretch: at each threshold,
/// the fraction of candidates that do not intersect any candidate of the
/// previous (stricter) threshold. The threshold minimizing that fraction
/// admits the fewest newcomers.
fn additive_threshold(
    log_null: &[(&str, &[f32])],
    thresholds: &[f64],
    i1: usize,
    i2: usize,
    cancel: &CancellationToken,
) -> Result<Option<f64>, Error> {
    let mut best: Option<(usize, f64)> = None;
    for t in i1.max(1)..i2 {
        cancel.check()?;
        let mut new = 0usize;
        let mut total = 0usize;
        for (_, track) in log_null {
            let previous = runs_below(track, thresholds[t - 1], 0);
            let current = runs_below(track, thresholds[t], 0);
            total += current.len();
            let mut p = 0;
            for run in &current {
                while p < previous.len() && previous[p].end <= run.start {
                    p += 1;
                }
                let intersects = p < previous.len() && previous[p].start < run.end;
                if !intersects {
                    new += 1;
                }
            }
        }
        if total == 0 {
            continue;
        }
        let ratio = new as f64 / total as f64;
        if best.map_or(true, |(_, r)| ratio < r) {
            best = Some((t, ratio));
        }
    }
    Ok(best.map(|(t, _)| thresholds[t]))
}
