//! Peak value objects and BED6+3 serialization.

use std::io::{self, BufRead, Write};

use anyhow::{Context, Result};
use getset::{CopyGetters, Getters};

/// A called peak: base-offset interval, enrichment value, and significance.
///
/// Serialized as tab-separated BED6+3:
/// `chrom start end name score . value -log10(p) -log10(q)`.
#[derive(Clone, Debug, PartialEq, Getters, CopyGetters)]
pub struct Peak {
    #[getset(get = "pub")]
    chromosome: String,
    #[getset(get_copy = "pub")]
    start: u64,
    #[getset(get_copy = "pub")]
    end: u64,
    #[getset(get = "pub")]
    name: String,
    /// Integer display score in `[0, 1000]`: `min(1000, -log10 q)`.
    #[getset(get_copy = "pub")]
    score: u32,
    /// Enrichment value (fold over control or noise, or the model log-p
    /// magnitude as a fallback).
    #[getset(get_copy = "pub")]
    value: f64,
    #[getset(get_copy = "pub")]
    log10_p: f64,
    #[getset(get_copy = "pub")]
    log10_q: f64,
}

impl Peak {
    pub(crate) fn new(
        chromosome: String,
        start: u64,
        end: u64,
        value: f64,
        log10_p: f64,
        log10_q: f64,
    ) -> Self {
        assert!(start < end, "peak interval must be non-empty");
        Peak {
            chromosome,
            start,
            end,
            name: String::new(),
            score: score_from_log10_q(log10_q),
            value,
            log10_p,
            log10_q,
        }
    }

    pub(crate) fn set_name(&mut self, name: String) {
        self.name = name;
    }

    pub fn bed_line(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}\t{}\t.\t{}\t{}\t{}",
            self.chromosome,
            self.start,
            self.end,
            self.name,
            self.score,
            self.value,
            self.log10_p,
            self.log10_q
        )
    }

    pub fn from_bed_line(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.trim_end().split('\t').collect();
        anyhow::ensure!(
            fields.len() == 9,
            "BED6+3 line must have 9 fields, got {}",
            fields.len()
        );
        let start: u64 = fields[1].parse().context("invalid start")?;
        let end: u64 = fields[2].parse().context("invalid end")?;
        anyhow::ensure!(start < end, "peak interval must be non-empty");
        Ok(Peak {
            chromosome: fields[0].to_owned(),
            start,
            end,
            name: fields[3].to_owned(),
            score: fields[4].parse().context("invalid score")?,
            value: fields[6].parse().context("invalid value")?,
            log10_p: fields[7].parse().context("invalid -log10(p)")?,
            log10_q: fields[8].parse().context("invalid -log10(q)")?,
        })
    }
}

pub(crate) fn score_from_log10_q(log10_q: f64) -> u32 {
    log10_q.max(0.0).min(1000.0) as u32
}

/// Sort peaks lexicographically by chromosome, then ascending start and end.
pub(crate) fn sort_peaks(peaks: &mut [Peak]) {
    peaks.sort_by(|a, b| {
        a.chromosome
            .cmp(&b.chromosome)
            .then(a.start.cmp(&b.start))
            .then(a.end.cmp(&b.end))
    });
}

/// Assign `<prefix>_<n>` names over the already sorted list, 1-based.
pub(crate) fn name_peaks(peaks: &mut [Peak], prefix: &str) {
    for (i, peak) in peaks.iter_mut().enumerate() {
        peak.set_name(format!("{}_{}", prefix, i + 1));
    }
}

pub fn write_bed<W: Write>(peaks: &[Peak], writer: &mut W) -> io::Result<()> {
    for peak in peaks {
        writeln!(writer, "{}", peak.bed_line())?;
    }
    Ok(())
}

pub fn read_bed<R: BufRead>(reader: R) -> Result<Vec<Peak>> {
    let mut peaks = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with("track") {
            continue;
        }
        peaks.push(Peak::from_bed_line(trimmed)?);
    }
    Ok(peaks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn peak(chromosome: &str, start: u64, end: u64) -> Peak {
        Peak::new(chromosome.to_owned(), start, end, 3.5, 7.25, 4.125)
    }

    #[test]
    fn test_score_range() {
        assert_eq!(score_from_log10_q(4.6), 4);
        assert_eq!(score_from_log10_q(0.0), 0);
        assert_eq!(score_from_log10_q(-1.0), 0);
        assert_eq!(score_from_log10_q(2500.0), 1000);
    }

    #[test]
    fn test_sort_and_name() {
        let mut peaks = vec![peak("chr2", 100, 200), peak("chr1", 500, 600), peak("chr1", 100, 300)];
        sort_peaks(&mut peaks);
        name_peaks(&mut peaks, "omnipeak");
        assert_eq!(peaks[0].chromosome(), "chr1");
        assert_eq!(peaks[0].start(), 100);
        assert_eq!(peaks[1].start(), 500);
        assert_eq!(peaks[2].chromosome(), "chr2");
        assert_eq!(peaks[0].name(), "omnipeak_1");
        assert_eq!(peaks[2].name(), "omnipeak_3");
    }

    #[test]
    fn test_bed_round_trip() {
        let mut peaks = vec![peak("chr1", 1000, 2600), peak("chr2", 0, 150)];
        name_peaks(&mut peaks, "p");
        let mut buffer = Vec::new();
        write_bed(&peaks, &mut buffer).unwrap();
        let parsed = read_bed(Cursor::new(buffer)).unwrap();
        assert_eq!(parsed, peaks);
    }

    #[test]
    fn test_bed_format() {
        let mut p = peak("chr1", 10, 20);
        p.set_name("x_1".to_owned());
        assert_eq!(p.bed_line(), "chr1\t10\t20\tx_1\t4\t.\t3.5\t7.25\t4.125");
    }
}
