//! Genome layout and bin indexing.
//!
//! A [`GenomeLayout`] maps chromosome names to lengths at a fixed bin size;
//! a [`BinIndex`] assigns each chromosome a contiguous span in the
//! concatenated genome-wide bin vector. Both are immutable after
//! construction. Chromosomes are kept sorted by name so that every numeric
//! layout derived from them is deterministic.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::ops::Range;
use std::path::Path;

use crate::errors::Error;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chromosome {
    name: String,
    length: u64,
}

impl Chromosome {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn length(&self) -> u64 {
        self.length
    }
}

#[derive(Clone, Debug)]
pub struct GenomeLayout {
    // sorted by name
    chromosomes: Vec<Chromosome>,
    index: HashMap<String, usize>,
    bin_size: u32,
}

impl GenomeLayout {
    pub fn new(
        sizes: impl IntoIterator<Item = (String, u64)>,
        bin_size: u32,
    ) -> Result<Self, Error> {
        if bin_size == 0 {
            return Err(Error::ZeroBinSize);
        }
        let mut chromosomes = Vec::new();
        for (name, length) in sizes {
            if length == 0 {
                return Err(Error::ZeroLengthChromosome { name });
            }
            chromosomes.push(Chromosome { name, length });
        }
        chromosomes.sort_by(|a, b| a.name.cmp(&b.name));
        let mut index = HashMap::with_capacity(chromosomes.len());
        for (i, chromosome) in chromosomes.iter().enumerate() {
            if index.insert(chromosome.name.clone(), i).is_some() {
                return Err(Error::DuplicateChromosome {
                    name: chromosome.name.clone(),
                });
            }
        }
        Ok(GenomeLayout {
            chromosomes,
            index,
            bin_size,
        })
    }

    /// Load a layout from a chromosome-sizes file: two whitespace-separated
    /// columns (name, length), one line per chromosome.
    pub fn from_chrom_sizes<P: AsRef<Path>>(path: P, bin_size: u32) -> Result<Self, Error> {
        let file = File::open(path.as_ref()).map_err(|e| Error::UnreadableInput {
            path: path.as_ref().to_owned(),
            msg: e.to_string(),
        })?;
        let reader = BufReader::new(file);
        let mut sizes = Vec::new();
        for (i, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| Error::UnreadableInput {
                path: path.as_ref().to_owned(),
                msg: e.to_string(),
            })?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let name = fields
                .next()
                .ok_or(Error::InvalidChromosomeSizes { line: i + 1 })?;
            let length: u64 = fields
                .next()
                .and_then(|f| f.parse().ok())
                .ok_or(Error::InvalidChromosomeSizes { line: i + 1 })?;
            sizes.push((name.to_owned(), length));
        }
        Self::new(sizes, bin_size)
    }

    pub fn bin_size(&self) -> u32 {
        self.bin_size
    }

    /// Chromosomes in name order.
    pub fn chromosomes(&self) -> impl Iterator<Item = &Chromosome> {
        self.chromosomes.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.chromosomes.iter().map(|c| c.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.chromosomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chromosomes.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn length(&self, name: &str) -> Option<u64> {
        self.index.get(name).map(|&i| self.chromosomes[i].length)
    }

    /// Number of bins on the given chromosome: ⌈length / bin size⌉.
    pub fn n_bins(&self, name: &str) -> Option<usize> {
        self.length(name)
            .map(|len| ((len + self.bin_size as u64 - 1) / self.bin_size as u64) as usize)
    }

    /// Base range covered by bin `bin` on the given chromosome. The last bin
    /// may be shorter than the bin size.
    pub fn bin_range(&self, name: &str, bin: usize) -> Option<Range<u64>> {
        let length = self.length(name)?;
        let start = bin as u64 * self.bin_size as u64;
        if start >= length {
            return None;
        }
        Some(start..(start + self.bin_size as u64).min(length))
    }

    /// Restrict the layout to the given chromosome names, keeping name order.
    pub(crate) fn restricted(&self, keep: impl Fn(&str) -> bool) -> Result<GenomeLayout, Error> {
        GenomeLayout::new(
            self.chromosomes
                .iter()
                .filter(|c| keep(&c.name))
                .map(|c| (c.name.clone(), c.length)),
            self.bin_size,
        )
    }
}

/// Spans of each chromosome in the concatenated genome-wide bin vector,
/// strictly partitioning `[0, total_bins)` in chromosome name order.
#[derive(Clone, Debug)]
pub struct BinIndex {
    spans: Vec<Range<usize>>,
    index: HashMap<String, usize>,
    total_bins: usize,
}

impl BinIndex {
    pub fn new(layout: &GenomeLayout) -> Self {
        let mut spans = Vec::with_capacity(layout.len());
        let mut index = HashMap::with_capacity(layout.len());
        let mut offset = 0;
        for (i, chromosome) in layout.chromosomes().enumerate() {
            let n = layout
                .n_bins(chromosome.name())
                .expect("chromosome comes from the layout");
            spans.push(offset..offset + n);
            index.insert(chromosome.name().to_owned(), i);
            offset += n;
        }
        BinIndex {
            spans,
            index,
            total_bins: offset,
        }
    }

    pub fn span(&self, name: &str) -> Option<Range<usize>> {
        self.index.get(name).map(|&i| self.spans[i].clone())
    }

    pub fn total_bins(&self) -> usize {
        self.total_bins
    }
}

/// Unplaced contigs (alternate haplotypes, random fragments, unlocalized
/// scaffolds) are excluded from peak calling.
pub fn is_unplaced_contig(name: &str) -> bool {
    if name.contains('_') {
        return true;
    }
    let lower = name.to_ascii_lowercase();
    lower.contains("random") || lower.contains("un")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn layout() -> GenomeLayout {
        GenomeLayout::new(
            vec![
                ("chr2".to_owned(), 1050),
                ("chr1".to_owned(), 2000),
                ("chr3".to_owned(), 99),
            ],
            100,
        )
        .unwrap()
    }

    #[test]
    fn test_sorted_by_name() {
        let layout = layout();
        let names: Vec<_> = layout.names().collect();
        assert_eq!(names, vec!["chr1", "chr2", "chr3"]);
    }

    #[test]
    fn test_bin_counts_ceil() {
        let layout = layout();
        assert_eq!(layout.n_bins("chr1"), Some(20));
        assert_eq!(layout.n_bins("chr2"), Some(11));
        assert_eq!(layout.n_bins("chr3"), Some(1));
    }

    #[test]
    fn test_bin_range_last_bin_shorter() {
        let layout = layout();
        assert_eq!(layout.bin_range("chr2", 0), Some(0..100));
        assert_eq!(layout.bin_range("chr2", 10), Some(1000..1050));
        assert_eq!(layout.bin_range("chr2", 11), None);
        assert_eq!(layout.bin_range("chr3", 0), Some(0..99));
    }

    #[test]
    fn test_zero_length_chromosome_rejected() {
        let err = GenomeLayout::new(vec![("chrM".to_owned(), 0)], 100).unwrap_err();
        assert!(matches!(err, Error::ZeroLengthChromosome { .. }));
    }

    #[test]
    fn test_bin_index_partitions_genome() {
        let layout = layout();
        let index = BinIndex::new(&layout);
        assert_eq!(index.span("chr1"), Some(0..20));
        assert_eq!(index.span("chr2"), Some(20..31));
        assert_eq!(index.span("chr3"), Some(31..32));
        assert_eq!(index.total_bins(), 32);
    }

    #[test]
    fn test_from_chrom_sizes() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "chr1\t2000").unwrap();
        writeln!(file, "chr2 1050").unwrap();
        writeln!(file, "# comment").unwrap();
        let layout = GenomeLayout::from_chrom_sizes(file.path(), 200).unwrap();
        assert_eq!(layout.length("chr1"), Some(2000));
        assert_eq!(layout.length("chr2"), Some(1050));
        assert_eq!(layout.len(), 2);
    }

    #[test]
    fn test_unplaced_contigs() {
        assert!(is_unplaced_contig("chr1_gl000191_random"));
        assert!(is_unplaced_contig("chrUn_gl000220"));
        assert!(is_unplaced_contig("chr4_random"));
        assert!(!is_unplaced_contig("chr17"));
        assert!(!is_unplaced_contig("chrX"));
    }
}
