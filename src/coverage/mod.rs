// Copyright 2016-2019 Johannes Köster, David Lähnemann.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

//! Binned coverage providers.
//!
//! A coverage source turns a treatment or control file into per-bin
//! non-negative integer counts over a [`GenomeLayout`]. Reading of the
//! underlying formats is delegated to external decoders ([`ReadsDecoder`]
//! for alignment formats, [`SummaryDecoder`] for continuous coverage);
//! the providers here only bin, deduplicate, scale, and regress.
//!
//! Sources are constructed eagerly and frozen afterwards; memoization of
//! binned tracks lives in an engine-owned [`CoverageCache`], keyed by the
//! deterministic source identifier.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::Result;

use crate::genome::GenomeLayout;

pub mod reads;
pub mod regression;
pub mod summary;

pub use reads::{ReadsCoverage, ReadsDecoder, Strand, TaggedRead};
pub use regression::ControlNormalization;
pub use summary::{SummaryCoverage, SummaryDecoder};

/// Narrow query interface over a single coverage file.
pub trait CoverageSource: Send + Sync {
    /// Deterministic identifier built from the source path stem, bin size,
    /// fragment, and flags. Used as the cache key.
    fn id(&self) -> &str;

    /// Per-bin counts for the chromosome, in ascending bin order.
    fn bin(&self, chromosome: &str) -> Result<Vec<u32>>;

    /// Sum of counts over the base range `[start, end)`.
    fn score(&self, chromosome: &str, start: u64, end: u64) -> Result<u64>;
}

/// A binned coverage track over every chromosome of a layout, ordered by
/// chromosome name.
#[derive(Clone, Debug)]
pub struct BinnedTrack {
    bins: BTreeMap<String, Vec<u32>>,
}

impl BinnedTrack {
    pub fn from_source(source: &dyn CoverageSource, layout: &GenomeLayout) -> Result<Self> {
        let mut bins = BTreeMap::new();
        for chromosome in layout.names() {
            bins.insert(chromosome.to_owned(), source.bin(chromosome)?);
        }
        Ok(BinnedTrack { bins })
    }

    pub fn bins(&self, chromosome: &str) -> Option<&[u32]> {
        self.bins.get(chromosome).map(|b| b.as_slice())
    }

    pub fn chromosomes(&self) -> impl Iterator<Item = (&str, &[u32])> {
        self.bins.iter().map(|(name, b)| (name.as_str(), b.as_slice()))
    }

    pub fn total_count(&self) -> u64 {
        self.bins
            .values()
            .flat_map(|b| b.iter())
            .map(|&c| c as u64)
            .sum()
    }

    pub fn is_empty_coverage(&self) -> bool {
        self.total_count() == 0
    }

    pub fn from_map(bins: BTreeMap<String, Vec<u32>>) -> Self {
        BinnedTrack { bins }
    }

    /// Restrict the track to the chromosomes of the given layout.
    pub fn restricted(&self, layout: &GenomeLayout) -> BinnedTrack {
        BinnedTrack {
            bins: self
                .bins
                .iter()
                .filter(|(name, _)| layout.contains(name))
                .map(|(name, bins)| (name.clone(), bins.clone()))
                .collect(),
        }
    }
}

/// Engine-owned memoization of binned tracks.
///
/// Sources stay free of interior mutability; the engine resolves each
/// source through this cache exactly once per identifier.
#[derive(Default)]
pub struct CoverageCache {
    tracks: HashMap<String, Arc<BinnedTrack>>,
}

impl CoverageCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn binned(
        &mut self,
        source: &dyn CoverageSource,
        layout: &GenomeLayout,
    ) -> Result<Arc<BinnedTrack>> {
        if let Some(track) = self.tracks.get(source.id()) {
            return Ok(Arc::clone(track));
        }
        let track = Arc::new(BinnedTrack::from_source(source, layout)?);
        self.tracks.insert(source.id().to_owned(), Arc::clone(&track));
        Ok(track)
    }
}

/// A treatment source with its optional control and the fitted
/// control-regression coefficients.
///
/// Implements the scoring operations of the binned coverage provider:
/// treatment score, control score, and the control-normalized score used
/// for model fitting.
pub struct CoveragePair {
    treatment: Box<dyn CoverageSource>,
    control: Option<Box<dyn CoverageSource>>,
    normalization: Option<ControlNormalization>,
}

impl CoveragePair {
    /// A treatment-only pair.
    pub fn without_control(treatment: Box<dyn CoverageSource>) -> Self {
        CoveragePair {
            treatment,
            control: None,
            normalization: None,
        }
    }

    /// Pair a treatment with a control, estimating the linear rescaling
    /// factor and, when `regress` is set, the regression coefficient β
    /// over genome-wide bins.
    pub fn with_control(
        treatment: Box<dyn CoverageSource>,
        control: Box<dyn CoverageSource>,
        layout: &GenomeLayout,
        regress: bool,
    ) -> Result<Self> {
        let treatment_track = BinnedTrack::from_source(treatment.as_ref(), layout)?;
        let control_track = BinnedTrack::from_source(control.as_ref(), layout)?;
        let normalization =
            regression::estimate(&treatment_track, &control_track, layout, regress);
        Ok(CoveragePair {
            treatment,
            control: Some(control),
            normalization: Some(normalization),
        })
    }

    pub fn treatment(&self) -> &dyn CoverageSource {
        self.treatment.as_ref()
    }

    pub fn control_available(&self) -> bool {
        self.control.is_some()
    }

    pub fn normalization(&self) -> Option<&ControlNormalization> {
        self.normalization.as_ref()
    }

    /// Binned per-chromosome counts for model fitting, resolved through the
    /// engine-owned cache so that a control file shared between replicates
    /// is decoded and binned only once.
    pub fn binned(&self, cache: &mut CoverageCache, layout: &GenomeLayout) -> Result<BinnedTrack> {
        let treatment = cache.binned(self.treatment.as_ref(), layout)?;
        match (&self.control, &self.normalization) {
            (Some(control), Some(normalization)) if normalization.beta > 0.0 => {
                let control = cache.binned(control.as_ref(), layout)?;
                let mut bins = BTreeMap::new();
                for (chromosome, treatment_bins) in treatment.chromosomes() {
                    let control_bins = control.bins(chromosome).unwrap_or(&[]);
                    let normalized = treatment_bins
                        .iter()
                        .enumerate()
                        .map(|(i, &t)| {
                            let c = control_bins.get(i).copied().unwrap_or(0);
                            normalization.normalized_count(t, c)
                        })
                        .collect();
                    bins.insert(chromosome.to_owned(), normalized);
                }
                Ok(BinnedTrack::from_map(bins))
            }
            _ => Ok(treatment.as_ref().clone()),
        }
    }

    /// Per-bin counts used for model fitting: control-regressed when a
    /// control with regression is attached, raw treatment otherwise.
    pub fn bin(&self, chromosome: &str) -> Result<Vec<u32>> {
        let treatment = self.treatment.bin(chromosome)?;
        match (&self.control, &self.normalization) {
            (Some(control), Some(normalization)) if normalization.beta > 0.0 => {
                let control = control.bin(chromosome)?;
                Ok(treatment
                    .iter()
                    .zip(&control)
                    .map(|(&t, &c)| normalization.normalized_count(t, c))
                    .collect())
            }
            _ => Ok(treatment),
        }
    }

    /// Sum of treatment counts over `[start, end)`.
    pub fn score(&self, chromosome: &str, start: u64, end: u64) -> Result<u64> {
        self.treatment.score(chromosome, start, end)
    }

    /// Sum of control counts over `[start, end)`, if a control is attached.
    pub fn control_score(&self, chromosome: &str, start: u64, end: u64) -> Result<Option<u64>> {
        match &self.control {
            Some(control) => Ok(Some(control.score(chromosome, start, end)?)),
            None => Ok(None),
        }
    }

    /// Control-normalized score: `max(0, T - β s C)` over `[start, end)`,
    /// rounded to integer. Without control or regression this is the
    /// treatment score.
    pub fn control_normalized_score(
        &self,
        chromosome: &str,
        start: u64,
        end: u64,
    ) -> Result<u64> {
        let treatment = self.treatment.score(chromosome, start, end)?;
        match (&self.control, &self.normalization) {
            (Some(control), Some(normalization)) if normalization.beta > 0.0 => {
                let control = control.score(chromosome, start, end)?;
                Ok(normalization.normalized_score(treatment, control))
            }
            _ => Ok(treatment),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FixedCoverage;
    use super::*;

    fn layout() -> GenomeLayout {
        GenomeLayout::new(vec![("chr1".to_owned(), 400)], 100).unwrap()
    }

    #[test]
    fn test_cache_reuses_identifier() {
        let layout = layout();
        let source = FixedCoverage::new("t1_100", 100, [("chr1", vec![1, 2, 3, 4])]);
        let mut cache = CoverageCache::new();
        let a = cache.binned(&source, &layout).unwrap();
        let b = cache.binned(&source, &layout).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.bins("chr1"), Some(&[1u32, 2, 3, 4][..]));
        assert_eq!(a.total_count(), 10);
    }

    #[test]
    fn test_pair_without_control_scores_treatment() {
        let pair = CoveragePair::without_control(Box::new(FixedCoverage::new(
            "t",
            100,
            [("chr1", vec![5, 0, 0, 5])],
        )));
        assert!(!pair.control_available());
        assert_eq!(pair.control_normalized_score("chr1", 0, 100).unwrap(), 5);
        assert_eq!(pair.control_score("chr1", 0, 100).unwrap(), None);
    }

    #[test]
    fn test_pair_with_control_regresses_bins() {
        let layout = layout();
        // treatment tracks the control closely; regression should remove
        // most of the shared signal
        let treatment = FixedCoverage::new("t", 100, [("chr1", vec![10, 20, 30, 40])]);
        let control = FixedCoverage::new("c", 100, [("chr1", vec![11, 19, 31, 39])]);
        let pair =
            CoveragePair::with_control(Box::new(treatment), Box::new(control), &layout, true)
                .unwrap();
        assert!(pair.control_available());
        let normalization = *pair.normalization().unwrap();
        assert!(normalization.beta > 0.5);

        let bins = pair.bin("chr1").unwrap();
        let expected: Vec<u32> = [(10u32, 11u32), (20, 19), (30, 31), (40, 39)]
            .iter()
            .map(|&(t, c)| normalization.normalized_count(t, c))
            .collect();
        assert_eq!(bins, expected);

        let mut cache = CoverageCache::new();
        let track = pair.binned(&mut cache, &layout).unwrap();
        assert_eq!(track.bins("chr1").unwrap(), expected.as_slice());
    }
}
