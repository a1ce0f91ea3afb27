// Copyright 2016-2019 Johannes Köster, David Lähnemann.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

//! The peak calling pipeline: binned coverage, HMM fit, sensitivity-driven
//! candidate selection, fragmentation compensation, scoring, and
//! FDR-controlled peak emission.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::Result;
use derive_builder::Builder;
use log::{info, warn};
use rayon::prelude::*;

use crate::coverage::{BinnedTrack, CoverageCache, CoveragePair};
use crate::errors::Error;
use crate::genome::{is_unplaced_contig, GenomeLayout};
use crate::hmm::{self, FitConfig, FitResult, ModelKind};
use crate::stats::multiple_testing::benjamini_hochberg_log;
use crate::utils::CancellationToken;

pub mod candidates;
pub mod peaks;
pub mod scoring;
pub mod sensitivity;
pub mod summits;

pub use candidates::Candidate;
pub use peaks::Peak;
pub use sensitivity::SensitivityResult;
pub use summits::SummitConfig;

use candidates::{aggregate_mask, estimate_gap, mask_from_log_null, runs_below};
use peaks::{name_peaks, sort_peaks};
use scoring::{signal_noise_densities, ChromosomeScorer, ScoredCandidate, SignalContext};

/// Tunables of the candidate selection and scoring stages. Immutable during
/// a run.
#[derive(Clone, Debug)]
pub struct PeakCallingConfig {
    /// Target false discovery rate, within (0, 1).
    pub fdr: f64,
    /// Caller-supplied merge gap; estimated from fragmentation when absent.
    pub gap: Option<usize>,
    /// Replace candidates by kernel-density summits.
    pub summits: bool,
    pub summit_config: SummitConfig,
    /// Boundary clipping strength, within [0, 1).
    pub clip: f64,
    /// Prefix of emitted peak names.
    pub peak_name_prefix: String,
}

impl Default for PeakCallingConfig {
    fn default() -> Self {
        PeakCallingConfig {
            fdr: 0.05,
            gap: None,
            summits: false,
            summit_config: SummitConfig::default(),
            clip: 0.4,
            peak_name_prefix: "omnipeak".to_owned(),
        }
    }
}

impl PeakCallingConfig {
    fn validate(&self) -> Result<(), Error> {
        if !(self.fdr > 0.0 && self.fdr < 1.0) {
            return Err(Error::InvalidFdr { value: self.fdr });
        }
        if !(0.0..1.0).contains(&self.clip) {
            return Err(Error::InvalidClip { value: self.clip });
        }
        Ok(())
    }
}

/// Genomic regions excluded from peak calling, merged per chromosome.
#[derive(Clone, Debug, Default)]
pub struct Blacklist {
    ranges: HashMap<String, Vec<(u64, u64)>>,
}

impl Blacklist {
    pub fn new(intervals: impl IntoIterator<Item = (String, u64, u64)>) -> Self {
        let mut ranges: HashMap<String, Vec<(u64, u64)>> = HashMap::new();
        for (chromosome, start, end) in intervals {
            ranges.entry(chromosome).or_default().push((start, end));
        }
        for intervals in ranges.values_mut() {
            intervals.sort_unstable();
            let mut merged: Vec<(u64, u64)> = Vec::with_capacity(intervals.len());
            for &(start, end) in intervals.iter() {
                match merged.last_mut() {
                    Some(last) if start <= last.1 => last.1 = last.1.max(end),
                    _ => merged.push((start, end)),
                }
            }
            *intervals = merged;
        }
        Blacklist { ranges }
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn intersects(&self, chromosome: &str, start: u64, end: u64) -> bool {
        let intervals = match self.ranges.get(chromosome) {
            Some(intervals) => intervals,
            None => return false,
        };
        let i = intervals.partition_point(|&(_, e)| e <= start);
        i < intervals.len() && intervals[i].0 < end
    }
}

/// The peak calling engine.
///
/// Work is partitioned at chromosome granularity over a thread pool of
/// configurable size; the only cross-chromosome coordination is the global
/// q-value vector, which observes the fixed chromosome name order.
#[derive(Builder)]
#[builder(pattern = "owned")]
pub struct PeakCaller {
    layout: Arc<GenomeLayout>,
    /// One treatment (with optional control) per signal dimension.
    tracks: Vec<CoveragePair>,
    #[builder(default = "ModelKind::Analyze { free_states: 2 }")]
    model: ModelKind,
    #[builder(default)]
    fit_config: FitConfig,
    #[builder(default)]
    config: PeakCallingConfig,
    #[builder(default)]
    blacklist: Blacklist,
    /// Worker threads; zero selects the default.
    #[builder(default)]
    threads: usize,
    #[builder(default)]
    cancel: CancellationToken,
}

impl PeakCaller {
    pub fn builder() -> PeakCallerBuilder {
        PeakCallerBuilder::default()
    }

    /// Run the full pipeline and return the sorted, named peak list.
    pub fn call_peaks(&self) -> Result<Vec<Peak>> {
        self.config.validate()?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .build()?;
        pool.install(|| {
            let (input, binned) = self.binned_input()?;
            let fit = hmm::fit(&input, self.model, &self.fit_config, &self.cancel)?;
            self.peaks_from_fit(&fit, &binned, input.layout())
        })
    }

    /// Fit the model without calling peaks (for persistence).
    pub fn fit(&self) -> Result<FitResult> {
        self.config.validate()?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .build()?;
        pool.install(|| {
            let (input, _) = self.binned_input()?;
            Ok(hmm::fit(&input, self.model, &self.fit_config, &self.cancel)?)
        })
    }

    /// Call peaks from a previously computed (e.g. persisted) fit.
    pub fn call_peaks_with_fit(&self, fit: &FitResult) -> Result<Vec<Peak>> {
        self.config.validate()?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .build()?;
        pool.install(|| {
            let (input, binned) = self.binned_input()?;
            self.peaks_from_fit(fit, &binned, input.layout())
        })
    }

    /// Bin every track and reduce the genome to chromosomes with any
    /// coverage.
    fn binned_input(&self) -> Result<(hmm::FitInput, Vec<BinnedTrack>)> {
        if self.tracks.is_empty() {
            return Err(Error::NoTreatmentTracks.into());
        }
        let mut cache = CoverageCache::new();
        let binned: Result<Vec<BinnedTrack>> = self
            .tracks
            .iter()
            .map(|pair| {
                self.cancel.check()?;
                pair.binned(&mut cache, &self.layout)
            })
            .collect();
        let binned = binned?;

        let covered: Vec<&str> = self
            .layout
            .names()
            .filter(|chromosome| {
                binned.iter().any(|track| {
                    track
                        .bins(chromosome)
                        .map_or(false, |bins| bins.iter().any(|&c| c > 0))
                })
            })
            .collect();
        if covered.len() < self.layout.len() {
            warn!(
                "{} chromosomes without treatment coverage removed from the query",
                self.layout.len() - covered.len()
            );
        }
        let effective = Arc::new(
            self.layout
                .restricted(|name| covered.contains(&name))?,
        );
        let restricted: Vec<Arc<BinnedTrack>> = binned
            .iter()
            .map(|track| Arc::new(track.restricted(&effective)))
            .collect();
        let input = hmm::FitInput::new(effective, restricted)?;
        Ok((input, binned))
    }

    fn peaks_from_fit(
        &self,
        fit: &FitResult,
        binned: &[BinnedTrack],
        layout: &Arc<GenomeLayout>,
    ) -> Result<Vec<Peak>> {
        // unplaced contigs never produce peaks
        let chromosomes: Vec<&str> = layout
            .names()
            .filter(|name| !is_unplaced_contig(name))
            .filter(|name| fit.log_null(name).is_some())
            .collect();
        if chromosomes.len() < layout.len() {
            info!(
                "calling peaks on {} of {} chromosomes",
                chromosomes.len(),
                layout.len()
            );
        }

        let log_null_tracks: Vec<(&str, &[f32])> = chromosomes
            .iter()
            .map(|&name| (name, fit.log_null(name).expect("filtered above")))
            .collect();
        let sens = sensitivity::estimate(&log_null_tracks, self.config.fdr, &self.cancel)?;

        // candidate runs at gap zero drive the fragmentation estimate
        let runs0: Vec<Vec<_>> = log_null_tracks
            .par_iter()
            .map(|(_, track)| runs_below(track, sens.threshold, 0))
            .collect();
        let gap = match self.config.gap {
            Some(gap) => gap,
            None if self.config.summits => 0,
            None => estimate_gap(&runs0, layout.bin_size()),
        };
        info!("merge gap {} bins at sensitivity {:.4}", gap, sens.threshold);

        // per-dimension sums feed summit refinement and density estimates
        let summed_bins: BTreeMap<&str, Vec<u32>> = chromosomes
            .iter()
            .map(|&name| {
                let n = layout.n_bins(name).unwrap_or(0);
                let mut sum = vec![0u32; n];
                for track in binned {
                    if let Some(bins) = track.bins(name) {
                        for (s, &b) in sum.iter_mut().zip(bins) {
                            *s += b;
                        }
                    }
                }
                (name, sum)
            })
            .collect();

        let candidates_per_chromosome: Result<Vec<Vec<Candidate>>> = log_null_tracks
            .par_iter()
            .map(|&(name, track)| {
                self.cancel.check()?;
                let mask = mask_from_log_null(track, sens.threshold);
                let mut result = Vec::new();
                for bins in aggregate_mask(&mask, gap) {
                    let mut candidate = Candidate::new(bins);
                    if self.config.summits {
                        candidate.summits = self.refine_summits(
                            &candidate,
                            &summed_bins[name],
                            track,
                            sens.summit_threshold,
                        );
                    }
                    let bin_size = layout.bin_size() as u64;
                    let start = candidate.bins.start as u64 * bin_size;
                    let end = candidate.bins.end as u64 * bin_size;
                    if !self.blacklist.intersects(name, start, end) {
                        result.push(candidate);
                    }
                }
                Ok(result)
            })
            .collect();
        let candidates_per_chromosome = candidates_per_chromosome?;

        let density_tracks: Vec<(&str, &[u32], Vec<_>)> = chromosomes
            .iter()
            .zip(&candidates_per_chromosome)
            .map(|(&name, candidates)| {
                (
                    name,
                    summed_bins[name].as_slice(),
                    candidates.iter().map(|c| c.bins.clone()).collect(),
                )
            })
            .collect();
        let (signal_density, noise_density) =
            signal_noise_densities(&density_tracks, layout.bin_size());
        if let (Some(signal), Some(noise)) = (signal_density, noise_density) {
            if signal <= noise {
                warn!(
                    "average signal density {:.4} does not exceed noise density {:.4}; \
                     boundary clipping disabled",
                    signal, noise
                );
            }
        }
        let context = SignalContext {
            signal_density,
            noise_density,
            clip: self.config.clip,
        };

        // score candidates chromosome-parallel, in fixed chromosome order
        let scored_per_chromosome: Result<Vec<Vec<ScoredCandidate>>> = chromosomes
            .par_iter()
            .zip(&candidates_per_chromosome)
            .map(|(&name, candidates)| {
                self.cancel.check()?;
                let scorer = self.scorer(name, layout, fit, context)?;
                let mut scored = Vec::new();
                for candidate in candidates {
                    scored.extend(scorer.score_candidate(candidate)?);
                }
                Ok(scored)
            })
            .collect();
        let scored_per_chromosome = scored_per_chromosome?;

        // global multiple-testing correction over the fixed chromosome order
        let log_ps: Vec<f64> = scored_per_chromosome
            .iter()
            .flat_map(|scored| scored.iter().map(|s| s.log_p))
            .collect();
        let log_qs = benjamini_hochberg_log(&log_ps);
        let ln_fdr = self.config.fdr.ln();

        let mut peaks = Vec::new();
        let mut index = 0;
        for (&name, scored) in chromosomes.iter().zip(&scored_per_chromosome) {
            self.cancel.check()?;
            let scorer = self.scorer(name, layout, fit, context)?;
            for candidate in scored {
                let log_q = log_qs[index];
                index += 1;
                if candidate.log_p > ln_fdr || log_q > ln_fdr {
                    continue;
                }
                let bin_size = layout.bin_size() as u64;
                let length = layout.length(name).expect("chromosome from layout");
                let start = candidate.bins.start as u64 * bin_size;
                let end = (candidate.bins.end as u64 * bin_size).min(length);
                let (start, end) = scorer.clip_boundaries(start, end)?;
                peaks.push(Peak::new(
                    name.to_owned(),
                    start,
                    end,
                    scorer.value(candidate),
                    -candidate.log_p / std::f64::consts::LN_10,
                    -log_q / std::f64::consts::LN_10,
                ));
            }
        }

        sort_peaks(&mut peaks);
        name_peaks(&mut peaks, &self.config.peak_name_prefix);
        info!("{} peaks called at FDR {}", peaks.len(), self.config.fdr);
        Ok(peaks)
    }

    fn scorer<'a>(
        &'a self,
        chromosome: &'a str,
        layout: &'a Arc<GenomeLayout>,
        fit: &'a FitResult,
        context: SignalContext,
    ) -> Result<ChromosomeScorer<'a>> {
        Ok(ChromosomeScorer {
            chromosome,
            layout: layout.as_ref(),
            log_null: fit
                .log_null(chromosome)
                .ok_or_else(|| Error::UnknownChromosome {
                    name: chromosome.to_owned(),
                })?,
            pairs: &self.tracks,
            context,
        })
    }

    /// Summit sub-ranges of a candidate: kernel-density modes of the raw
    /// signal, each anchored by at least one bin at the stricter summit
    /// threshold when one is available.
    fn refine_summits(
        &self,
        candidate: &Candidate,
        bins: &[u32],
        log_null: &[f32],
        summit_threshold: Option<f64>,
    ) -> Vec<std::ops::Range<usize>> {
        let signal: Vec<f64> = bins[candidate.bins.clone()]
            .iter()
            .map(|&b| b as f64)
            .collect();
        summits::find_summits(&signal, &self.config.summit_config)
            .into_iter()
            .map(|mode| candidate.bins.start + mode.start..candidate.bins.start + mode.end)
            .filter(|mode| match summit_threshold {
                Some(threshold) => log_null[mode.clone()]
                    .iter()
                    .any(|&v| (v as f64) <= threshold),
                None => true,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blacklist_intersection() {
        let blacklist = Blacklist::new(vec![
            ("chr1".to_owned(), 100, 200),
            ("chr1".to_owned(), 150, 300),
            ("chr2".to_owned(), 0, 50),
        ]);
        assert!(blacklist.intersects("chr1", 250, 260));
        assert!(blacklist.intersects("chr1", 0, 101));
        assert!(!blacklist.intersects("chr1", 300, 400));
        assert!(!blacklist.intersects("chr3", 0, 1000));
        assert!(!blacklist.intersects("chr2", 50, 60));
    }

    #[test]
    fn test_config_validation() {
        let mut config = PeakCallingConfig::default();
        assert!(config.validate().is_ok());
        config.fdr = 0.0;
        assert!(matches!(config.validate(), Err(Error::InvalidFdr { .. })));
        config.fdr = 0.05;
        config.clip = 1.0;
        assert!(matches!(config.validate(), Err(Error::InvalidClip { .. })));
    }
}
