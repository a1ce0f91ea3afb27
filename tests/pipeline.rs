//! End-to-end pipeline scenarios on synthetic coverage.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::Arc;

use anyhow::Result;
use rand::distributions::Distribution;
use rand::rngs::StdRng;
use rand::SeedableRng;
use statrs::distribution::Poisson;

use omnipeak::calling::peaks::{read_bed, write_bed};
use omnipeak::calling::PeakCallingConfig;
use omnipeak::coverage::{CoveragePair, CoverageSource};
use omnipeak::persist::{self, FitInformation};
use omnipeak::{GenomeLayout, ModelKind, PeakCaller};

/// In-memory coverage source over fixed per-bin counts; counts are spread
/// uniformly inside each bin for sub-bin scoring queries.
struct TestCoverage {
    id: String,
    bin_size: u64,
    bins: BTreeMap<String, Vec<u32>>,
}

impl TestCoverage {
    fn new(id: &str, bin_size: u64, bins: BTreeMap<String, Vec<u32>>) -> Self {
        TestCoverage {
            id: id.to_owned(),
            bin_size,
            bins,
        }
    }
}

impl CoverageSource for TestCoverage {
    fn id(&self) -> &str {
        &self.id
    }

    fn bin(&self, chromosome: &str) -> Result<Vec<u32>> {
        Ok(self.bins.get(chromosome).cloned().unwrap_or_default())
    }

    fn score(&self, chromosome: &str, start: u64, end: u64) -> Result<u64> {
        let bins = match self.bins.get(chromosome) {
            Some(bins) => bins,
            None => return Ok(0),
        };
        let mut total = 0.0;
        let first = (start / self.bin_size) as usize;
        let last = ((end + self.bin_size - 1) / self.bin_size) as usize;
        for (i, &count) in bins.iter().enumerate().take(last.min(bins.len())).skip(first) {
            let bin_start = i as u64 * self.bin_size;
            let bin_end = bin_start + self.bin_size;
            let overlap = end.min(bin_end).saturating_sub(start.max(bin_start));
            total += count as f64 * overlap as f64 / self.bin_size as f64;
        }
        Ok(total.round() as u64)
    }
}

const BIN: u64 = 200;

/// Three-chromosome test genome: chr1 carries an enriched stretch in bins
/// 1000..2000 (Poisson mean 50) and a zero stretch in bins 3000..4000; the
/// rest of the genome is Poisson mean 1 background.
fn enriched_genome(rng: &mut StdRng) -> (Arc<GenomeLayout>, BTreeMap<String, Vec<u32>>) {
    let background = Poisson::new(1.0).unwrap();
    let enriched = Poisson::new(50.0).unwrap();

    let mut bins = BTreeMap::new();
    let mut chr1: Vec<u32> = (0..5000)
        .map(|_| background.sample(rng).round() as u32)
        .collect();
    for bin in chr1.iter_mut().take(2000).skip(1000) {
        *bin = enriched.sample(rng).round() as u32;
    }
    for bin in chr1.iter_mut().take(4000).skip(3000) {
        *bin = 0;
    }
    bins.insert("chr1".to_owned(), chr1);
    for name in ["chr2", "chr3"] {
        bins.insert(
            name.to_owned(),
            (0..2000).map(|_| background.sample(rng).round() as u32).collect(),
        );
    }

    let layout = Arc::new(
        GenomeLayout::new(
            bins.iter().map(|(name, b)| (name.clone(), b.len() as u64 * BIN)),
            BIN as u32,
        )
        .unwrap(),
    );
    (layout, bins)
}

fn caller_for(layout: Arc<GenomeLayout>, bins: BTreeMap<String, Vec<u32>>) -> PeakCaller {
    let source = TestCoverage::new("treatment_200", BIN, bins);
    PeakCaller::builder()
        .layout(layout)
        .tracks(vec![CoveragePair::without_control(Box::new(source))])
        .config(PeakCallingConfig {
            fdr: 0.05,
            ..Default::default()
        })
        .threads(2)
        .build()
        .unwrap()
}

#[test]
fn test_single_enriched_region_is_called() {
    let mut rng = StdRng::seed_from_u64(20);
    let (layout, bins) = enriched_genome(&mut rng);
    let caller = caller_for(layout, bins);
    let peaks = caller.call_peaks().unwrap();

    assert!(!peaks.is_empty(), "the enriched region must be detected");
    // at least one peak covers the bin-granular core of the enriched region
    let core_start = 1100 * BIN;
    let core_end = 1900 * BIN;
    assert!(
        peaks.iter().any(|p| {
            p.chromosome() == "chr1" && p.start() <= core_start && p.end() >= core_end
        }),
        "no peak covers [{}, {}): {:?}",
        core_start,
        core_end,
        peaks
            .iter()
            .map(|p| (p.chromosome().clone(), p.start(), p.end()))
            .collect::<Vec<_>>()
    );
    // and nothing is called inside the zero stretch
    assert!(
        !peaks
            .iter()
            .any(|p| p.chromosome() == "chr1" && p.start() >= 3000 * BIN && p.end() <= 4000 * BIN),
        "zero coverage must not produce peaks"
    );
}

#[test]
fn test_peaks_are_sorted_named_and_in_score_range() {
    let mut rng = StdRng::seed_from_u64(21);
    let (layout, mut bins) = enriched_genome(&mut rng);
    // add a second enriched region on chr2 so several peaks are emitted
    let enriched = Poisson::new(40.0).unwrap();
    for bin in bins.get_mut("chr2").unwrap().iter_mut().take(600).skip(400) {
        *bin = enriched.sample(&mut rng).round() as u32;
    }
    let caller = caller_for(layout, bins);
    let peaks = caller.call_peaks().unwrap();
    assert!(peaks.len() >= 2);

    for pair in peaks.windows(2) {
        let key = |p: &omnipeak::Peak| (p.chromosome().clone(), p.start(), p.end());
        assert!(key(&pair[0]) <= key(&pair[1]), "peaks must be sorted");
    }
    for (i, peak) in peaks.iter().enumerate() {
        assert_eq!(peak.name(), &format!("omnipeak_{}", i + 1));
        assert!(peak.score() <= 1000);
        assert!(peak.log10_p() >= 0.0);
        assert!(peak.log10_q() >= 0.0);
        assert!(peak.start() < peak.end());
    }
}

#[test]
fn test_bed_round_trip_through_files() {
    let mut rng = StdRng::seed_from_u64(22);
    let (layout, bins) = enriched_genome(&mut rng);
    let caller = caller_for(layout, bins);
    let peaks = caller.call_peaks().unwrap();
    assert!(!peaks.is_empty());

    let mut buffer = Vec::new();
    write_bed(&peaks, &mut buffer).unwrap();
    let parsed = read_bed(Cursor::new(buffer)).unwrap();
    assert_eq!(parsed, peaks);
}

#[test]
fn test_persistence_round_trip_is_exact() {
    let mut rng = StdRng::seed_from_u64(23);
    let (layout, bins) = enriched_genome(&mut rng);
    let caller = caller_for(Arc::clone(&layout), bins);
    let fit = caller.fit().unwrap();

    let kind = ModelKind::Analyze { free_states: 2 };
    let information = FitInformation::new(kind, &["treatment"], &layout, None, false, true);
    let artifact = persist::ModelArtifact::new(&information, &fit).unwrap();

    let directory = tempfile::tempdir().unwrap();
    let path = directory.path().join("model.omni");
    persist::save(&path, &artifact).unwrap();

    let loaded = persist::load_compatible(&path, &information).unwrap();
    // parameters must match bit for bit
    assert_eq!(
        bincode::serialize(fit.parameters()).unwrap(),
        bincode::serialize(loaded.parameters()).unwrap()
    );
    // per-bin log-null vectors must be byte-equal floats
    for (chromosome, values) in fit.log_null_map() {
        let restored = loaded.log_null(chromosome).unwrap();
        assert_eq!(values.len(), restored.len());
        for (&a, &b) in values.iter().zip(restored) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }
    assert_eq!(loaded.log_likelihood(), fit.log_likelihood());

    // an incompatible request must fail with a named field
    let other = FitInformation::new(kind, &["treatment"], &layout, Some(150), false, true);
    let err = persist::load_compatible(&path, &other).unwrap_err();
    assert!(err.to_string().contains("identifier"));
}

#[test]
fn test_peaks_from_persisted_fit_match_fresh_run() {
    let mut rng = StdRng::seed_from_u64(24);
    let (layout, bins) = enriched_genome(&mut rng);
    let caller = caller_for(Arc::clone(&layout), bins);

    let fit = caller.fit().unwrap();
    let from_fit = caller.call_peaks_with_fit(&fit).unwrap();
    let fresh = caller.call_peaks().unwrap();
    assert_eq!(from_fit, fresh);
}

#[test]
fn test_empty_treatment_is_fatal() {
    let layout = Arc::new(GenomeLayout::new(vec![("chr1".to_owned(), 10_000)], 200).unwrap());
    let mut bins = BTreeMap::new();
    bins.insert("chr1".to_owned(), vec![0u32; 50]);
    let caller = caller_for(layout, bins);
    let err = caller.call_peaks().unwrap_err();
    assert!(err.to_string().contains("empty coverage"));
}

#[test]
fn test_blacklisted_region_is_dropped() {
    use omnipeak::calling::Blacklist;

    let mut rng = StdRng::seed_from_u64(25);
    let (layout, bins) = enriched_genome(&mut rng);
    let source = TestCoverage::new("treatment_200", BIN, bins);
    let caller = PeakCaller::builder()
        .layout(layout)
        .tracks(vec![CoveragePair::without_control(Box::new(source))])
        .config(PeakCallingConfig {
            fdr: 0.05,
            ..Default::default()
        })
        .blacklist(Blacklist::new(vec![(
            "chr1".to_owned(),
            900 * BIN,
            2100 * BIN,
        )]))
        .build()
        .unwrap();
    let peaks = caller.call_peaks().unwrap();
    assert!(
        !peaks
            .iter()
            .any(|p| p.chromosome() == "chr1" && p.start() < 2100 * BIN && p.end() > 900 * BIN),
        "blacklisted candidates must be dropped"
    );
}
