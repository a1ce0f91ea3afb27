//! Summary-based coverage: bins per-range sums from continuous coverage
//! files (BigWig and friends, decoded externally).

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use log::{debug, warn};

use crate::errors::Error;
use crate::genome::GenomeLayout;
use crate::stats::percentile;

use super::CoverageSource;

/// The scaled 99th-percentile bin signal is kept inside
/// `[LOW_FACTOR * bin_size, HIGH_FACTOR * bin_size]` so that summary tracks
/// from different pipelines remain comparable.
const LOW_FACTOR: f64 = 0.2;
const HIGH_FACTOR: f64 = 2.0;

/// External decoder of continuous coverage formats.
pub trait SummaryDecoder: Send + Sync {
    /// Sum of coverage over `[start, end)`, or `None` when the chromosome
    /// is absent from the file.
    fn summary(&self, chromosome: &str, start: u64, end: u64) -> Result<Option<f64>>;

    /// Stem of the underlying file, used in identifiers.
    fn stem(&self) -> &str;
}

/// Coverage source over per-range summary sums, rescaled to read-like
/// magnitudes at construction and frozen afterwards.
pub struct SummaryCoverage<D> {
    id: String,
    decoder: D,
    layout: Arc<GenomeLayout>,
    scale: f64,
    bins: BTreeMap<String, Vec<u32>>,
}

impl<D: SummaryDecoder> SummaryCoverage<D> {
    pub fn new(decoder: D, layout: Arc<GenomeLayout>) -> Result<Self> {
        let mut raw = BTreeMap::new();
        for chromosome in layout.names() {
            let n_bins = layout.n_bins(chromosome).expect("chromosome from layout");
            let mut values = Vec::with_capacity(n_bins);
            let mut missing = false;
            for bin in 0..n_bins {
                let range = layout
                    .bin_range(chromosome, bin)
                    .expect("bin index within chromosome");
                let value = match decoder.summary(chromosome, range.start, range.end)? {
                    Some(value) => value,
                    None => {
                        missing = true;
                        break;
                    }
                };
                if value < 0.0 {
                    return Err(Error::NegativeSummaryValue {
                        chromosome: chromosome.to_owned(),
                        start: range.start,
                        end: range.end,
                        value,
                    }
                    .into());
                }
                values.push(value);
            }
            if missing {
                warn!(
                    "chromosome {} absent from summary coverage; assuming zero signal",
                    chromosome
                );
                values = vec![0.0; n_bins];
            }
            raw.insert(chromosome.to_owned(), values);
        }

        let scale = scaling_factor(
            raw.values().flat_map(|v| v.iter().copied()),
            layout.bin_size(),
        );
        debug!("summary coverage scaling factor {:.6}", scale);

        let bins = raw
            .into_iter()
            .map(|(chromosome, values)| {
                let scaled = values.iter().map(|&v| (v * scale).round() as u32).collect();
                (chromosome, scaled)
            })
            .collect();

        let id = format!("{}_{}_summary", decoder.stem(), layout.bin_size());
        Ok(SummaryCoverage {
            id,
            decoder,
            layout,
            scale,
            bins,
        })
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }
}

fn scaling_factor(values: impl Iterator<Item = f64>, bin_size: u32) -> f64 {
    let nonzero: Vec<f64> = values.filter(|&v| v > 0.0).collect();
    let p99 = match percentile(&nonzero, 0.99) {
        Some(p99) if p99 > 0.0 => p99,
        _ => return 1.0,
    };
    let low = LOW_FACTOR * bin_size as f64;
    let high = HIGH_FACTOR * bin_size as f64;
    if p99 > high {
        high / p99
    } else if p99 < low {
        low / p99
    } else {
        1.0
    }
}

impl<D: SummaryDecoder> CoverageSource for SummaryCoverage<D> {
    fn id(&self) -> &str {
        &self.id
    }

    fn bin(&self, chromosome: &str) -> Result<Vec<u32>> {
        Ok(self.bins.get(chromosome).cloned().unwrap_or_else(|| {
            vec![0; self.layout.n_bins(chromosome).unwrap_or(0)]
        }))
    }

    fn score(&self, chromosome: &str, start: u64, end: u64) -> Result<u64> {
        if !self.layout.contains(chromosome) {
            return Ok(0);
        }
        match self.decoder.summary(chromosome, start, end)? {
            Some(value) if value < 0.0 => Err(Error::NegativeSummaryValue {
                chromosome: chromosome.to_owned(),
                start,
                end,
                value,
            }
            .into()),
            Some(value) => Ok((value * self.scale).round().max(0.0) as u64),
            None => Ok(0),
        }
    }
}
