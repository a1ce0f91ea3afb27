//! Candidate interval aggregation and merge-gap estimation.
//!
//! Foreground bins (log null at or below the chosen sensitivity) form
//! maximal runs; runs separated by at most `gap` background bins merge into
//! one candidate. The merge gap compensates for peak fragmentation: the
//! faster candidates fuse as the gap grows, the stronger the fragmentation
//! and the larger the chosen gap.

use std::ops::Range;

use bv::{BitVec, Bits, BitsMut};
use log::{debug, info};

/// Fragmentation is compensated beyond this span.
const FRAGMENTATION_THRESHOLD_BP: f64 = 500.0;

/// Gap sweep ceiling in base pairs.
const GAP_SWEEP_BP: f64 = 5000.0;

/// A candidate enriched interval in bin coordinates, optionally refined to
/// summit sub-ranges. Sub-ranges are disjoint, ordered, and contained in
/// `bins`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Candidate {
    pub bins: Range<usize>,
    pub summits: Vec<Range<usize>>,
}

impl Candidate {
    pub fn new(bins: Range<usize>) -> Self {
        Candidate {
            bins,
            summits: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.bins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }
}

/// Foreground mask of a chromosome: one bit per bin.
pub fn mask_from_log_null(log_null: &[f32], threshold: f64) -> BitVec {
    let mut mask = BitVec::new_fill(false, log_null.len() as u64);
    for (i, &value) in log_null.iter().enumerate() {
        if (value as f64) <= threshold {
            mask.set_bit(i as u64, true);
        }
    }
    mask
}

/// Maximal runs of set bits, merging runs separated by at most `gap` clear
/// bits. Deterministic and total.
pub fn aggregate_mask(mask: &BitVec, gap: usize) -> Vec<Range<usize>> {
    let mut runs = Vec::new();
    let mut current: Option<Range<usize>> = None;
    for i in 0..mask.len() {
        if !mask.get_bit(i) {
            continue;
        }
        let i = i as usize;
        current = Some(match current.take() {
            Some(run) if i - run.end <= gap => run.start..i + 1,
            Some(run) => {
                runs.push(run);
                i..i + 1
            }
            None => i..i + 1,
        });
    }
    if let Some(run) = current {
        runs.push(run);
    }
    runs
}

/// Runs of bins with `log_null <= threshold`, without materializing a mask.
/// Used by the sensitivity sweep.
pub(crate) fn runs_below(log_null: &[f32], threshold: f64, gap: usize) -> Vec<Range<usize>> {
    let mut runs = Vec::new();
    let mut current: Option<Range<usize>> = None;
    for (i, &value) in log_null.iter().enumerate() {
        if value as f64 > threshold {
            continue;
        }
        current = Some(match current.take() {
            Some(run) if i - run.end <= gap => run.start..i + 1,
            Some(run) => {
                runs.push(run);
                i..i + 1
            }
            None => i..i + 1,
        });
    }
    if let Some(run) = current {
        runs.push(run);
    }
    runs
}

/// Histogram of inter-run separations up to `g_max` (exclusive), from runs
/// aggregated at gap 0. `count(g) = count(0) - sum of separations <= g`.
fn separation_histogram(runs_per_chromosome: &[Vec<Range<usize>>], g_max: usize) -> Vec<usize> {
    let mut histogram = vec![0usize; g_max];
    for runs in runs_per_chromosome {
        for pair in runs.windows(2) {
            let separation = pair[1].start - pair[0].end;
            if separation < g_max {
                histogram[separation] += 1;
            }
        }
    }
    histogram
}

/// Choose the fragmentation-compensation gap from candidate runs at gap 0.
///
/// `f(g) = count(g) / count(0)` is the normalized candidate count as the
/// merge gap grows; the area above that curve measures how fast candidates
/// fuse. Below the fragmentation threshold the data is considered
/// unfragmented and the gap stays zero.
pub fn estimate_gap(runs_per_chromosome: &[Vec<Range<usize>>], bin_size: u32) -> usize {
    let g_max = (GAP_SWEEP_BP / bin_size as f64).ceil() as usize;
    let count0: usize = runs_per_chromosome.iter().map(|r| r.len()).sum();
    if count0 == 0 {
        info!("no candidates at gap 0; fragmentation not detectable");
        return 0;
    }
    let histogram = separation_histogram(runs_per_chromosome, g_max);
    let mut merged = 0usize;
    let mut f_sum = 0.0;
    for &h in histogram.iter().take(g_max) {
        merged += h;
        // count(g) never drops below zero; separations are between distinct runs
        f_sum += (count0 - merged.min(count0 - 1)) as f64 / count0 as f64;
    }
    let score = g_max as f64 - f_sum;
    let threshold = FRAGMENTATION_THRESHOLD_BP / bin_size as f64;
    debug!(
        "fragmentation score {:.2} over {} gaps (threshold {:.2})",
        score, g_max, threshold
    );
    if score < threshold {
        0
    } else {
        (score - threshold).floor() as usize
    }
}
