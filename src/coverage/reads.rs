//! Read-based coverage: bins tagged read positions from alignment files.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use itertools::Itertools;

use crate::genome::GenomeLayout;

use super::CoverageSource;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Strand {
    Forward,
    Reverse,
}

/// A read reduced to its 5′ position and strand.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaggedRead {
    pub pos: u64,
    pub strand: Strand,
}

/// External decoder of alignment formats (BAM/SAM/CRAM/BED); see the
/// interface contract in the crate documentation. Decoding failures are
/// fatal input errors.
pub trait ReadsDecoder: Send + Sync {
    /// All reads on the chromosome, in any order. Unknown chromosomes yield
    /// an empty vector.
    fn reads(&self, chromosome: &str) -> Result<Vec<TaggedRead>>;

    /// Stem of the underlying file, used in identifiers.
    fn stem(&self) -> &str;
}

/// Coverage source counting reads whose (optionally fragment-shifted) 5′
/// position falls inside each bin.
///
/// All decoding happens at construction; afterwards the source is frozen
/// and answers queries from sorted per-chromosome position vectors.
pub struct ReadsCoverage {
    id: String,
    layout: Arc<GenomeLayout>,
    // shifted 5′ positions, sorted ascending, per chromosome
    positions: BTreeMap<String, Vec<u64>>,
}

impl ReadsCoverage {
    pub fn new(
        decoder: &dyn ReadsDecoder,
        layout: Arc<GenomeLayout>,
        fragment: Option<u32>,
        unique: bool,
    ) -> Result<Self> {
        let shift = fragment.map(|f| (f / 2) as u64).unwrap_or(0);
        let mut positions = BTreeMap::new();
        for chromosome in layout.names() {
            let length = layout.length(chromosome).expect("chromosome from layout");
            let mut reads = decoder.reads(chromosome)?;
            if unique {
                // at most one read per genomic position per strand
                reads.sort_by_key(|r| (r.pos, r.strand));
                reads.dedup();
            }
            let mut shifted: Vec<u64> = reads
                .iter()
                .map(|r| match r.strand {
                    Strand::Forward => (r.pos + shift).min(length - 1),
                    Strand::Reverse => r.pos.saturating_sub(shift),
                })
                .collect();
            shifted.sort_unstable();
            positions.insert(chromosome.to_owned(), shifted);
        }
        let mut id = format!("{}_{}", decoder.stem(), layout.bin_size());
        if let Some(fragment) = fragment {
            id += &format!("_{}", fragment);
        }
        if unique {
            id += "_unique";
        }
        Ok(ReadsCoverage {
            id,
            layout,
            positions,
        })
    }
}

impl CoverageSource for ReadsCoverage {
    fn id(&self) -> &str {
        &self.id
    }

    fn bin(&self, chromosome: &str) -> Result<Vec<u32>> {
        let n_bins = self.layout.n_bins(chromosome).unwrap_or(0);
        let mut bins = vec![0u32; n_bins];
        if let Some(positions) = self.positions.get(chromosome) {
            let bin_size = self.layout.bin_size() as u64;
            for (bin, group) in &positions.iter().group_by(|&&p| (p / bin_size) as usize) {
                if bin < n_bins {
                    bins[bin] += group.count() as u32;
                }
            }
        }
        Ok(bins)
    }

    fn score(&self, chromosome: &str, start: u64, end: u64) -> Result<u64> {
        let positions = match self.positions.get(chromosome) {
            Some(positions) => positions,
            None => return Ok(0),
        };
        let lo = positions.partition_point(|&p| p < start);
        let hi = positions.partition_point(|&p| p < end);
        Ok((hi - lo) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedReads {
        reads: Vec<TaggedRead>,
    }

    impl ReadsDecoder for FixedReads {
        fn reads(&self, chromosome: &str) -> Result<Vec<TaggedRead>> {
            if chromosome == "chr1" {
                Ok(self.reads.clone())
            } else {
                Ok(Vec::new())
            }
        }

        fn stem(&self) -> &str {
            "fixed"
        }
    }

    fn layout() -> Arc<GenomeLayout> {
        Arc::new(GenomeLayout::new(vec![("chr1".to_owned(), 1000)], 100).unwrap())
    }

    fn forward(pos: u64) -> TaggedRead {
        TaggedRead {
            pos,
            strand: Strand::Forward,
        }
    }

    fn reverse(pos: u64) -> TaggedRead {
        TaggedRead {
            pos,
            strand: Strand::Reverse,
        }
    }

    #[test]
    fn test_binning_by_five_prime_position() {
        let decoder = FixedReads {
            reads: vec![forward(0), forward(99), forward(100), forward(950), reverse(105)],
        };
        let coverage = ReadsCoverage::new(&decoder, layout(), None, false).unwrap();
        let bins = coverage.bin("chr1").unwrap();
        assert_eq!(bins[0], 2);
        assert_eq!(bins[1], 2);
        assert_eq!(bins[9], 1);
        assert_eq!(coverage.score("chr1", 0, 100).unwrap(), 2);
        assert_eq!(coverage.score("chr1", 100, 200).unwrap(), 2);
    }

    #[test]
    fn test_unique_keeps_one_read_per_position_and_strand() {
        let decoder = FixedReads {
            reads: vec![forward(50), forward(50), forward(50), reverse(50)],
        };
        let coverage = ReadsCoverage::new(&decoder, layout(), None, true).unwrap();
        assert_eq!(coverage.bin("chr1").unwrap()[0], 2);

        let coverage = ReadsCoverage::new(&decoder, layout(), None, false).unwrap();
        assert_eq!(coverage.bin("chr1").unwrap()[0], 4);
    }

    #[test]
    fn test_fragment_shift_moves_reads_towards_fragment_center() {
        let decoder = FixedReads {
            reads: vec![forward(80), reverse(130)],
        };
        // shift = fragment / 2 = 50: forward 80 -> 130, reverse 130 -> 80
        let coverage = ReadsCoverage::new(&decoder, layout(), Some(100), false).unwrap();
        let bins = coverage.bin("chr1").unwrap();
        assert_eq!(bins[0], 1);
        assert_eq!(bins[1], 1);
    }

    #[test]
    fn test_shift_clamped_to_chromosome() {
        let decoder = FixedReads {
            reads: vec![forward(990), reverse(5)],
        };
        let coverage = ReadsCoverage::new(&decoder, layout(), Some(100), false).unwrap();
        let bins = coverage.bin("chr1").unwrap();
        assert_eq!(bins[9], 1);
        assert_eq!(bins[0], 1);
    }

    #[test]
    fn test_identifier_reflects_flags() {
        let decoder = FixedReads { reads: vec![] };
        let coverage = ReadsCoverage::new(&decoder, layout(), Some(150), true).unwrap();
        assert_eq!(coverage.id(), "fixed_100_150_unique");
    }
}
