// Copyright 2016-2019 Johannes Köster, David Lähnemann.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

//! Candidate scoring: combined model and Poisson significance, density
//! clipping, and the enrichment value.
//!
//! Each candidate decomposes into score blocks holding its most confidently
//! enriched bins; the blocks' model log posterior is combined with an
//! upper-tail Poisson test of signal against control (or against the
//! genome-wide noise density), and block values aggregate into a
//! length-weighted candidate log p-value.

use std::ops::Range;

use anyhow::Result;

use crate::coverage::CoveragePair;
use crate::genome::GenomeLayout;
use crate::stats::poisson::log_poisson_survival;
use crate::stats::{percentile, KahanSum};

use super::candidates::Candidate;

/// Maximal separation (in bins) bridged inside a score block.
const SCORE_BLOCK_GAP: usize = 3;

/// Shrink steps tried during boundary clipping, as fractions of one bin,
/// applied largest first.
const CLIP_STEPS: [f64; 13] = [
    10.0, 5.0, 2.0, 1.5, 1.0, 0.8, 0.6, 0.5, 0.4, 0.3, 0.2, 0.1, 0.05,
];

/// At most this fraction of the original peak length may be clipped away
/// from each side.
const MAX_CLIPPED_FRACTION: f64 = 0.4;

/// Genome-wide signal context shared by all chromosome scorers.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SignalContext {
    /// Mean per-bp signal over bins inside candidates.
    pub(crate) signal_density: Option<f64>,
    /// Mean per-bp signal over bins outside candidates.
    pub(crate) noise_density: Option<f64>,
    /// Clipped boundary density bound: noise + clip * (signal - noise).
    pub(crate) clip: f64,
}

impl SignalContext {
    fn max_clipped_density(&self) -> Option<f64> {
        let signal = self.signal_density?;
        let noise = self.noise_density?;
        if signal <= noise {
            return None;
        }
        Some(noise + self.clip * (signal - noise))
    }
}

/// Scored candidate, still in bin coordinates.
#[derive(Clone, Debug)]
pub(crate) struct ScoredCandidate {
    pub(crate) bins: Range<usize>,
    pub(crate) log_p: f64,
    pub(crate) model_log_p: f64,
    pub(crate) score: u64,
    pub(crate) control_score: Option<u64>,
}

pub(crate) struct ChromosomeScorer<'a> {
    pub(crate) chromosome: &'a str,
    pub(crate) layout: &'a GenomeLayout,
    pub(crate) log_null: &'a [f32],
    pub(crate) pairs: &'a [CoveragePair],
    pub(crate) context: SignalContext,
}

impl<'a> ChromosomeScorer<'a> {
    /// Score the candidate, or each of its summit sub-ranges when present.
    pub(crate) fn score_candidate(&self, candidate: &Candidate) -> Result<Vec<ScoredCandidate>> {
        if candidate.summits.is_empty() {
            Ok(vec![self.score_unit(candidate.bins.clone())?])
        } else {
            candidate
                .summits
                .iter()
                .map(|summit| self.score_unit(summit.clone()))
                .collect()
        }
    }

    fn score_unit(&self, bins: Range<usize>) -> Result<ScoredCandidate> {
        let blocks = self.score_blocks(&bins);
        let mut scored: Vec<(Range<usize>, u64)> = Vec::with_capacity(blocks.len());
        for block in blocks {
            let score = self.signal_score(&block)?;
            scored.push((block, score));
        }
        // ascending score order stabilizes the weighted aggregation
        scored.sort_by_key(|&(_, score)| score);

        let mut weighted = KahanSum::new();
        let mut total_length = 0usize;
        let mut model_total = KahanSum::new();
        for (block, score) in &scored {
            let (log_p, model_log_p) = self.block_log_p(block, *score)?;
            weighted.add(log_p * block.len() as f64);
            model_total.add(model_log_p);
            total_length += block.len();
        }
        let log_p = (weighted.sum() / total_length as f64).min(0.0);

        let score = self.signal_score(&bins)?;
        let control_score = self.control_score(&bins)?;
        Ok(ScoredCandidate {
            bins,
            log_p,
            model_log_p: model_total.sum(),
            score,
            control_score,
        })
    }

    /// Bins at or below the candidate's median log null, aggregated with a
    /// small gap. Falls back to the whole candidate.
    fn score_blocks(&self, bins: &Range<usize>) -> Vec<Range<usize>> {
        let values: Vec<f64> = self.log_null[bins.clone()].iter().map(|&v| v as f64).collect();
        let median = match percentile(&values, 0.5) {
            Some(median) => median,
            None => return vec![bins.clone()],
        };
        let mut blocks: Vec<Range<usize>> = Vec::new();
        let mut current: Option<Range<usize>> = None;
        for (offset, &value) in values.iter().enumerate() {
            if value > median {
                continue;
            }
            let bin = bins.start + offset;
            current = Some(match current.take() {
                Some(block) if bin - block.end <= SCORE_BLOCK_GAP => block.start..bin + 1,
                Some(block) => {
                    blocks.push(block);
                    bin..bin + 1
                }
                None => bin..bin + 1,
            });
        }
        if let Some(block) = current {
            blocks.push(block);
        }
        if blocks.is_empty() {
            blocks.push(bins.clone());
        }
        blocks
    }

    fn block_log_p(&self, block: &Range<usize>, score: u64) -> Result<(f64, f64)> {
        let mut model = KahanSum::new();
        for &value in &self.log_null[block.clone()] {
            model.add(value as f64);
        }
        let model_log_p = model.sum().min(0.0);

        let (start, end) = self.base_range(block);
        let lambda = match self.control_score(block)? {
            Some(control) => Some(control as f64 + 1.0),
            None => self
                .context
                .noise_density
                .map(|noise| noise * (end - start) as f64 + 1.0),
        };
        let log_p = match lambda {
            Some(lambda) => {
                let signal_log_p = log_poisson_survival(score + 1, lambda);
                // both factors are non-positive; the geometric combination
                // is again a non-positive log value
                -(model_log_p * signal_log_p).sqrt()
            }
            None => model_log_p,
        };
        Ok((log_p.min(0.0), model_log_p))
    }

    fn base_range(&self, bins: &Range<usize>) -> (u64, u64) {
        let bin_size = self.layout.bin_size() as u64;
        let length = self
            .layout
            .length(self.chromosome)
            .expect("scored chromosome is in the layout");
        let start = bins.start as u64 * bin_size;
        let end = (bins.end as u64 * bin_size).min(length);
        (start, end)
    }

    /// Treatment score summed over all replicate dimensions.
    fn signal_score(&self, bins: &Range<usize>) -> Result<u64> {
        let (start, end) = self.base_range(bins);
        let mut total = 0;
        for pair in self.pairs {
            total += pair.score(self.chromosome, start, end)?;
        }
        Ok(total)
    }

    /// Control score summed over dimensions; `None` unless every replicate
    /// carries a control.
    fn control_score(&self, bins: &Range<usize>) -> Result<Option<u64>> {
        if !self.pairs.iter().all(|pair| pair.control_available()) {
            return Ok(None);
        }
        let (start, end) = self.base_range(bins);
        let mut total = 0;
        for pair in self.pairs {
            total += pair
                .control_score(self.chromosome, start, end)?
                .expect("control availability was checked");
        }
        Ok(Some(total))
    }

    /// Shrink the peak from both sides while the clipped slivers stay below
    /// the clipped-density bound, never removing more than the allowed
    /// fraction per side.
    pub(crate) fn clip_boundaries(&self, start: u64, end: u64) -> Result<(u64, u64)> {
        let max_density = match self.context.max_clipped_density() {
            Some(max_density) => max_density,
            None => return Ok((start, end)),
        };
        let bin_size = self.layout.bin_size() as f64;
        let max_clip = ((end - start) as f64 * MAX_CLIPPED_FRACTION) as u64;

        let mut clipped_start = start;
        let mut clipped = 0u64;
        for fraction in CLIP_STEPS {
            let step = (fraction * bin_size).round().max(1.0) as u64;
            if clipped + step > max_clip || clipped_start + step >= end {
                continue;
            }
            let sliver = self.density(clipped_start, clipped_start + step)?;
            if sliver < max_density {
                clipped_start += step;
                clipped += step;
            }
        }

        let mut clipped_end = end;
        clipped = 0;
        for fraction in CLIP_STEPS {
            let step = (fraction * bin_size).round().max(1.0) as u64;
            if clipped + step > max_clip || clipped_end <= clipped_start + step {
                continue;
            }
            let sliver = self.density(clipped_end - step, clipped_end)?;
            if sliver < max_density {
                clipped_end -= step;
                clipped += step;
            }
        }
        Ok((clipped_start, clipped_end))
    }

    fn density(&self, start: u64, end: u64) -> Result<f64> {
        let mut total = 0;
        for pair in self.pairs {
            total += pair.score(self.chromosome, start, end)?;
        }
        Ok(total as f64 / (end - start) as f64)
    }

    /// Enrichment value of a scored candidate.
    pub(crate) fn value(&self, scored: &ScoredCandidate) -> f64 {
        let (start, end) = self.base_range(&scored.bins);
        match (scored.control_score, self.context.noise_density) {
            (Some(control), _) => (scored.score + 1) as f64 / (control + 1) as f64,
            (None, Some(noise)) => {
                (scored.score + 1) as f64 / (noise * (end - start) as f64 + 1.0)
            }
            (None, None) => -scored.model_log_p,
        }
    }
}

/// Genome-wide signal and noise densities from binned treatment counts and
/// the candidate masks, in counts per base pair.
pub(crate) fn signal_noise_densities(
    tracks: &[(&str, &[u32], Vec<Range<usize>>)],
    bin_size: u32,
) -> (Option<f64>, Option<f64>) {
    let mut signal_count = 0u64;
    let mut signal_bins = 0u64;
    let mut noise_count = 0u64;
    let mut noise_bins = 0u64;
    for (_, bins, candidates) in tracks {
        let mut inside = vec![false; bins.len()];
        for candidate in candidates {
            for flag in &mut inside[candidate.clone()] {
                *flag = true;
            }
        }
        for (&count, &is_signal) in bins.iter().zip(&inside) {
            if is_signal {
                signal_count += count as u64;
                signal_bins += 1;
            } else {
                noise_count += count as u64;
                noise_bins += 1;
            }
        }
    }
    let density = |count: u64, bins: u64| {
        (bins > 0).then(|| count as f64 / (bins * bin_size as u64) as f64)
    };
    (
        density(signal_count, signal_bins),
        density(noise_count, noise_bins),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::testing::FixedCoverage;
    use approx::assert_relative_eq;

    fn layout() -> GenomeLayout {
        GenomeLayout::new(vec![("chr1".to_owned(), 4000)], 100).unwrap()
    }

    fn pair(bins: Vec<u32>) -> CoveragePair {
        CoveragePair::without_control(Box::new(FixedCoverage::new("t", 100, [("chr1", bins)])))
    }

    fn scorer_fixture<'a>(
        layout: &'a GenomeLayout,
        log_null: &'a [f32],
        pairs: &'a [CoveragePair],
        noise: f64,
    ) -> ChromosomeScorer<'a> {
        ChromosomeScorer {
            chromosome: "chr1",
            layout,
            log_null,
            pairs,
            context: SignalContext {
                signal_density: Some(0.5),
                noise_density: Some(noise),
                clip: 0.4,
            },
        }
    }

    #[test]
    fn test_score_blocks_selects_confident_bins() {
        let layout = layout();
        let mut log_null = vec![-0.1f32; 40];
        for v in log_null.iter_mut().take(20).skip(10) {
            *v = -30.0;
        }
        let pairs = vec![pair(vec![1; 40])];
        let scorer = scorer_fixture(&layout, &log_null, &pairs, 0.01);
        let blocks = scorer.score_blocks(&(5..25));
        // median over [5, 25) separates the deep bins
        assert_eq!(blocks, vec![10..20]);
    }

    #[test]
    fn test_whole_candidate_block_fallback() {
        let layout = layout();
        let log_null = vec![-2.0f32; 40];
        let pairs = vec![pair(vec![1; 40])];
        let scorer = scorer_fixture(&layout, &log_null, &pairs, 0.01);
        // uniform values: everything is at the median, one block spans all
        let blocks = scorer.score_blocks(&(0..40));
        assert_eq!(blocks, vec![0..40]);
    }

    #[test]
    fn test_stronger_enrichment_scores_smaller_log_p() {
        let layout = layout();
        let mut weak = vec![-0.05f32; 40];
        let mut strong = vec![-0.05f32; 40];
        for i in 10..20 {
            weak[i] = -5.0;
            strong[i] = -50.0;
        }
        let mut bins = vec![1u32; 40];
        for b in bins.iter_mut().take(20).skip(10) {
            *b = 30;
        }
        let pairs = vec![pair(bins)];
        let weak_scored = scorer_fixture(&layout, &weak, &pairs, 0.01)
            .score_unit(10..20)
            .unwrap();
        let strong_scored = scorer_fixture(&layout, &strong, &pairs, 0.01)
            .score_unit(10..20)
            .unwrap();
        assert!(strong_scored.log_p < weak_scored.log_p);
        assert!(strong_scored.log_p < 0.0);
    }

    #[test]
    fn test_value_prefers_control_ratio() {
        let layout = layout();
        let log_null = vec![-10.0f32; 40];
        let pairs = vec![pair(vec![10; 40])];
        let scorer = scorer_fixture(&layout, &log_null, &pairs, 0.02);
        let scored = ScoredCandidate {
            bins: 0..10,
            log_p: -20.0,
            model_log_p: -100.0,
            score: 99,
            control_score: Some(24),
        };
        assert_relative_eq!(scorer.value(&scored), 100.0 / 25.0);
        let no_control = ScoredCandidate {
            control_score: None,
            ..scored
        };
        // noise 0.02/bp over 1000 bp -> lambda-like denominator 21
        assert_relative_eq!(scorer.value(&no_control), 100.0 / 21.0);
    }

    #[test]
    fn test_clipping_trims_low_density_flanks() {
        let layout = layout();
        let log_null = vec![-10.0f32; 40];
        // high signal in the core, nothing on the flanks
        let mut bins = vec![0u32; 40];
        for b in bins.iter_mut().take(25).skip(15) {
            *b = 50;
        }
        let pairs = vec![pair(bins)];
        let mut scorer = scorer_fixture(&layout, &log_null, &pairs, 0.0);
        scorer.context.signal_density = Some(0.5);
        scorer.context.noise_density = Some(0.0);
        let (start, end) = scorer.clip_boundaries(1000, 3000).unwrap();
        assert!(start > 1000, "left flank should be clipped");
        assert!(end < 3000, "right flank should be clipped");
        // clipping is bounded per side
        assert!(start <= 1000 + 800);
        assert!(end >= 3000 - 800);
        assert!(start < end);
    }

    #[test]
    fn test_no_clipping_when_signal_below_noise() {
        let layout = layout();
        let log_null = vec![-10.0f32; 40];
        let pairs = vec![pair(vec![1; 40])];
        let mut scorer = scorer_fixture(&layout, &log_null, &pairs, 0.9);
        scorer.context.signal_density = Some(0.5);
        let (start, end) = scorer.clip_boundaries(1000, 3000).unwrap();
        assert_eq!((start, end), (1000, 3000));
    }

    #[test]
    fn test_signal_noise_densities() {
        let bins: Vec<u32> = vec![10, 10, 1, 1, 1, 1, 1, 1];
        let tracks = vec![("chr1", bins.as_slice(), vec![0..2])];
        let (signal, noise) = signal_noise_densities(&tracks, 100);
        assert_relative_eq!(signal.unwrap(), 20.0 / 200.0);
        assert_relative_eq!(noise.unwrap(), 6.0 / 600.0);
    }
}
