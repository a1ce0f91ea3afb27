use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the peak calling engine.
///
/// Numerical irregularities (low signal-to-noise fits, swapped states,
/// undetectable fragmentation) are never errors; they are logged and the
/// pipeline continues with documented fallback behavior.
#[derive(Error, Debug)]
pub enum Error {
    // configuration
    #[error("FDR must be within (0, 1), got {value}")]
    InvalidFdr { value: f64 },
    #[error("merge gap must be non-negative, got {value}")]
    InvalidGap { value: i64 },
    #[error("clip fraction must be within [0, 1), got {value}")]
    InvalidClip { value: f64 },
    #[error(
        "number of treatment files ({treatment}) does not match number of control files ({control})"
    )]
    MismatchedPathLists { treatment: usize, control: usize },
    #[error("at least one treatment track is required")]
    NoTreatmentTracks,

    // input
    #[error("unable to read {path}: {msg}")]
    UnreadableInput { path: PathBuf, msg: String },
    #[error("chromosome sizes file line {line} does not contain two whitespace-separated columns")]
    InvalidChromosomeSizes { line: usize },
    #[error("zero-length chromosome {name} in genome layout")]
    ZeroLengthChromosome { name: String },
    #[error("duplicate chromosome {name} in genome layout")]
    DuplicateChromosome { name: String },
    #[error("bin size must be positive")]
    ZeroBinSize,
    #[error("chromosome {name} not found in genome layout")]
    UnknownChromosome { name: String },
    #[error("negative summary coverage value {value} on {chromosome}:{start}-{end}")]
    NegativeSummaryValue {
        chromosome: String,
        start: u64,
        end: u64,
        value: f64,
    },
    #[error("model can't be trained on empty coverage")]
    EmptyCoverage,

    // model incompatibility
    #[error("persisted model is incompatible: {field} was {stored}, requested {requested}")]
    IncompatibleFit {
        field: &'static str,
        stored: String,
        requested: String,
    },
    #[error("unsupported model artifact version {version} (expected {expected})")]
    UnsupportedModelVersion { version: u32, expected: u32 },

    // cancellation (cooperative, distinct from failure)
    #[error("peak calling was cancelled")]
    Cancelled,

    // cache I/O, after cleanup and one retry
    #[error("failed to write model artifact {path} after retry: {msg}")]
    ModelWriteFailed { path: PathBuf, msg: String },
}
