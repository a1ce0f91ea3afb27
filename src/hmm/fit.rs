// Copyright 2016-2019 Johannes Köster, David Lähnemann.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

//! Baum–Welch fitting of the zero-inflated negative-binomial HMM and
//! posterior extraction.
//!
//! Training runs expectation–maximization over all chromosomes jointly:
//! the E-step is a log-space forward–backward pass per chromosome
//! (chromosome-parallel), the M-step pools sufficient statistics across
//! chromosomes. After training, states are sorted by ascending mean and
//! per-bin log posteriors are emitted, together with the log posterior of
//! the null-hypothesis state set ("log null") that drives candidate
//! selection downstream.

use std::collections::BTreeMap;
use std::sync::Arc;

use bio::stats::LogProb;
use log::{debug, info, warn};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::coverage::BinnedTrack;
use crate::errors::Error;
use crate::genome::GenomeLayout;
use crate::stats::dip::dip_test;
use crate::utils::CancellationToken;

use super::emission::{init_emissions, NegBinEmission};
use super::{HmmParameters, ModelKind};

/// Default three-state priors (Z, L, H).
const ANALYZE_PRIORS: [f64; 3] = [0.75, 0.249, 0.001];

/// Default three-state transition matrix, row-stochastic.
const ANALYZE_TRANSITIONS: [[f64; 3]; 3] = [
    [0.75, 0.2499, 0.0001],
    [0.2, 0.798, 0.002],
    [0.005, 0.015, 0.98],
];

/// Bins sampled for the bimodality diagnostic.
const DIP_SAMPLE_CAP: usize = 10_000;
const DIP_BOOTSTRAPS: usize = 100;

#[derive(Clone, Debug)]
pub struct FitConfig {
    /// EM stops after this many iterations even without convergence.
    pub max_iterations: usize,
    /// Relative log-likelihood change below which EM is converged.
    pub convergence: f64,
    /// Fraction of the lowest nonzero bins seeding the low state mean.
    pub low_fraction: f64,
    /// Fraction of the top nonzero bins seeding the high state mean.
    pub high_fraction: f64,
    /// Minimal allowed ratio of high to low state mean; below it the high
    /// mean is clamped and the fit flagged out of SNR range.
    pub min_snr: Option<f64>,
    /// Materialize full per-state posteriors in addition to log null.
    pub keep_state_posteriors: bool,
    /// Run the dip-test diagnostic on the nonzero coverage distribution.
    pub bimodality_check: bool,
}

impl Default for FitConfig {
    fn default() -> Self {
        FitConfig {
            max_iterations: 10,
            convergence: 1e-4,
            low_fraction: 0.5,
            high_fraction: 0.1,
            min_snr: None,
            keep_state_posteriors: false,
            bimodality_check: true,
        }
    }
}

/// The D coverage tracks entering a fit, all sharing one layout.
pub struct FitInput {
    layout: Arc<GenomeLayout>,
    tracks: Vec<Arc<BinnedTrack>>,
}

impl FitInput {
    pub fn new(layout: Arc<GenomeLayout>, tracks: Vec<Arc<BinnedTrack>>) -> Result<Self, Error> {
        if tracks.is_empty() {
            return Err(Error::NoTreatmentTracks);
        }
        if tracks.iter().all(|t| t.is_empty_coverage()) {
            return Err(Error::EmptyCoverage);
        }
        Ok(FitInput { layout, tracks })
    }

    pub fn layout(&self) -> &Arc<GenomeLayout> {
        &self.layout
    }

    pub fn n_dimensions(&self) -> usize {
        self.tracks.len()
    }

    /// D x T count matrix for a chromosome.
    fn counts(&self, chromosome: &str) -> Array2<u32> {
        let t = self.layout.n_bins(chromosome).unwrap_or(0);
        let mut counts = Array2::zeros((self.tracks.len(), t));
        for (d, track) in self.tracks.iter().enumerate() {
            if let Some(bins) = track.bins(chromosome) {
                for (i, &c) in bins.iter().enumerate().take(t) {
                    counts[(d, i)] = c;
                }
            }
        }
        counts
    }

    fn counts_per_dim(&self) -> Vec<Vec<u32>> {
        self.tracks
            .iter()
            .map(|track| {
                track
                    .chromosomes()
                    .flat_map(|(_, bins)| bins.iter().copied())
                    .collect()
            })
            .collect()
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct FitFlags {
    pub converged: bool,
    pub low_quality_flip: bool,
    pub out_of_snr_range: bool,
    pub unimodal_coverage: bool,
}

#[derive(Debug)]
pub struct FitResult {
    parameters: HmmParameters,
    log_likelihood: f64,
    flags: FitFlags,
    log_null: BTreeMap<String, Vec<f32>>,
    state_posteriors: Option<BTreeMap<String, Array2<f32>>>,
}

impl FitResult {
    pub fn parameters(&self) -> &HmmParameters {
        &self.parameters
    }

    pub fn log_likelihood(&self) -> f64 {
        self.log_likelihood
    }

    pub fn flags(&self) -> FitFlags {
        self.flags
    }

    /// Per-bin log posterior of the null state set; every value is finite
    /// and at most zero.
    pub fn log_null(&self, chromosome: &str) -> Option<&[f32]> {
        self.log_null.get(chromosome).map(|v| v.as_slice())
    }

    pub fn log_null_map(&self) -> &BTreeMap<String, Vec<f32>> {
        &self.log_null
    }

    /// `n_states x n_bins` log posterior matrix, when requested.
    pub fn state_posteriors(&self, chromosome: &str) -> Option<&Array2<f32>> {
        self.state_posteriors.as_ref()?.get(chromosome)
    }

    pub(crate) fn from_parts(
        parameters: HmmParameters,
        log_likelihood: f64,
        flags: FitFlags,
        log_null: BTreeMap<String, Vec<f32>>,
    ) -> Self {
        FitResult {
            parameters,
            log_likelihood,
            flags,
            log_null,
            state_posteriors: None,
        }
    }
}

/// Sufficient statistics pooled across chromosomes in one E-step.
struct EStepStats {
    log_likelihood: f64,
    initial: Array1<f64>,
    transitions: Array2<f64>,
    /// per (emission row, dimension): (weight, weighted sum, weighted square sum)
    emissions: Array2<(f64, f64, f64)>,
}

impl EStepStats {
    fn zeros(n_states: usize, rows: usize, dims: usize) -> Self {
        EStepStats {
            log_likelihood: 0.0,
            initial: Array1::zeros(n_states),
            transitions: Array2::zeros((n_states, n_states)),
            emissions: Array2::from_elem((rows, dims), (0.0, 0.0, 0.0)),
        }
    }

    fn merge(mut self, other: &EStepStats) -> Self {
        self.log_likelihood += other.log_likelihood;
        self.initial += &other.initial;
        self.transitions += &other.transitions;
        for (acc, inc) in self.emissions.iter_mut().zip(other.emissions.iter()) {
            acc.0 += inc.0;
            acc.1 += inc.1;
            acc.2 += inc.2;
        }
        self
    }
}

/// Fit the HMM on the given input and emit posteriors.
pub fn fit(
    input: &FitInput,
    kind: ModelKind,
    config: &FitConfig,
    cancel: &CancellationToken,
) -> Result<FitResult, Error> {
    if let Some(expected) = kind.expected_dimensions() {
        assert_eq!(
            input.n_dimensions(),
            expected,
            "compare model dimensions must match the group sizes"
        );
    }
    let counts_per_dim = input.counts_per_dim();
    let mut flags = FitFlags::default();
    if config.bimodality_check {
        flags.unimodal_coverage = !coverage_is_bimodal(&counts_per_dim[0]);
        if flags.unimodal_coverage {
            warn!(
                "nonzero coverage distribution shows no bimodality; \
                 signal-to-noise may be low"
            );
        }
    }

    let emissions = init_emissions(kind, &counts_per_dim, config.low_fraction, config.high_fraction);
    let mut parameters = initial_parameters(kind, input.n_dimensions(), emissions);
    debug!(
        "initial emission means: {:?}",
        parameters.emissions().iter().map(|e| e.mean()).collect::<Vec<_>>()
    );

    let chromosomes: Vec<&str> = input
        .layout
        .names()
        .filter(|c| input.layout.n_bins(c).unwrap_or(0) > 0)
        .collect();

    let mut log_likelihood = f64::NEG_INFINITY;
    for iteration in 0..config.max_iterations {
        cancel.check()?;
        let stats = e_step(input, &chromosomes, &parameters, cancel)?;
        m_step(&mut parameters, &stats, config, &mut flags);

        let previous = log_likelihood;
        log_likelihood = stats.log_likelihood;
        debug!(
            "EM iteration {}: log likelihood {:.4}",
            iteration + 1,
            log_likelihood
        );
        if previous.is_finite() {
            let relative = ((log_likelihood - previous) / previous).abs();
            if relative <= config.convergence {
                flags.converged = true;
                info!(
                    "EM converged after {} iterations (relative change {:.2e})",
                    iteration + 1,
                    relative
                );
                break;
            }
        }
    }
    if !flags.converged {
        warn!(
            "EM did not converge within {} iterations; using the last iterate",
            config.max_iterations
        );
    }

    flags.low_quality_flip = parameters.sort_states();
    if flags.low_quality_flip {
        warn!("state means and success probabilities disagree on ordering; fit is low quality");
    }

    // final posterior pass with the sorted parameters
    let null_states = kind.null_states();
    let posterior_results: Result<Vec<_>, Error> = chromosomes
        .par_iter()
        .map(|&chromosome| {
            cancel.check()?;
            let counts = input.counts(chromosome);
            let posterior = Posterior::compute(&parameters, &counts);
            let log_null = posterior.log_null(&null_states);
            let states = config
                .keep_state_posteriors
                .then(|| posterior.log_gamma_f32());
            Ok((chromosome.to_owned(), log_null, states))
        })
        .collect();

    let mut log_null = BTreeMap::new();
    let mut state_posteriors = config.keep_state_posteriors.then(BTreeMap::new);
    for (chromosome, null, states) in posterior_results? {
        log_null.insert(chromosome.clone(), null);
        if let (Some(map), Some(states)) = (state_posteriors.as_mut(), states) {
            map.insert(chromosome, states);
        }
    }

    Ok(FitResult {
        parameters,
        log_likelihood,
        flags,
        log_null,
        state_posteriors,
    })
}

fn coverage_is_bimodal(counts: &[u32]) -> bool {
    let nonzero: Vec<f64> = counts.iter().filter(|&&c| c > 0).map(|&c| c as f64).collect();
    if nonzero.len() < 16 {
        return true;
    }
    let mut rng = StdRng::seed_from_u64(0);
    let stride = (nonzero.len() / DIP_SAMPLE_CAP).max(1);
    // dither the integer counts so ties do not inflate the statistic
    // against the continuous uniform null
    let sample: Vec<f64> = nonzero
        .iter()
        .step_by(stride)
        .map(|&c| c + rng.gen::<f64>() - 0.5)
        .collect();
    dip_test(&sample, DIP_BOOTSTRAPS, &mut rng).p_value <= 0.05
}

fn initial_parameters(
    kind: ModelKind,
    n_dimensions: usize,
    emissions: Array2<NegBinEmission>,
) -> HmmParameters {
    let k = kind.n_states();
    let (priors, transitions) = if k == 3 {
        (
            ANALYZE_PRIORS.to_vec(),
            Array2::from_shape_fn((3, 3), |(i, j)| ANALYZE_TRANSITIONS[i][j]),
        )
    } else {
        // diagonal-dominant defaults for the larger alphabets
        let mut priors = vec![0.2 / (k - 1) as f64; k];
        priors[0] = 0.8;
        let transitions =
            Array2::from_shape_fn((k, k), |(i, j)| if i == j { 0.9 } else { 0.1 / (k - 1) as f64 });
        (priors, transitions)
    };
    HmmParameters::new(kind, n_dimensions, &priors, &transitions, emissions)
}

fn e_step(
    input: &FitInput,
    chromosomes: &[&str],
    parameters: &HmmParameters,
    cancel: &CancellationToken,
) -> Result<EStepStats, Error> {
    let per_chromosome: Result<Vec<EStepStats>, Error> = chromosomes
        .par_iter()
        .map(|&chromosome| {
            cancel.check()?;
            let counts = input.counts(chromosome);
            Ok(chromosome_stats(parameters, &counts))
        })
        .collect();
    let k = parameters.n_states();
    let rows = parameters.kind().n_emission_rows();
    let dims = parameters.n_dimensions();
    Ok(per_chromosome?
        .iter()
        .fold(EStepStats::zeros(k, rows, dims), EStepStats::merge))
}

fn chromosome_stats(parameters: &HmmParameters, counts: &Array2<u32>) -> EStepStats {
    let kind = parameters.kind();
    let k = parameters.n_states();
    let rows = kind.n_emission_rows();
    let dims = parameters.n_dimensions();
    let mut stats = EStepStats::zeros(k, rows, dims);
    let t_len = counts.dim().1;
    if t_len == 0 {
        return stats;
    }

    let posterior = Posterior::compute(parameters, counts);
    stats.log_likelihood = posterior.log_likelihood;

    for state in 0..k {
        stats.initial[state] = posterior.log_gamma[(state, 0)].exp();
    }

    // expected transition counts
    let log_a = parameters.log_transitions();
    for t in 0..t_len - 1 {
        for i in 0..k {
            let alpha = posterior.log_alpha[(i, t)];
            if alpha == f64::NEG_INFINITY {
                continue;
            }
            for j in 0..k {
                let contribution = alpha
                    + log_a[(i, j)]
                    + posterior.log_emission[(j, t + 1)]
                    + posterior.log_beta[(j, t + 1)]
                    - posterior.log_likelihood;
                if contribution > f64::NEG_INFINITY {
                    stats.transitions[(i, j)] += contribution.exp();
                }
            }
        }
    }

    // emission moments, pooled over the states sharing a row
    for t in 0..t_len {
        for state in 1..k {
            let weight = posterior.log_gamma[(state, t)].exp();
            if weight == 0.0 {
                continue;
            }
            for dim in 0..dims {
                let row = kind
                    .emission_row(state, dim)
                    .expect("non-zero state has an emission row");
                let x = counts[(dim, t)] as f64;
                let acc = &mut stats.emissions[(row, dim)];
                acc.0 += weight;
                acc.1 += weight * x;
                acc.2 += weight * x * x;
            }
        }
    }
    stats
}

fn m_step(
    parameters: &mut HmmParameters,
    stats: &EStepStats,
    config: &FitConfig,
    flags: &mut FitFlags,
) {
    let k = parameters.n_states();

    let initial_total: f64 = stats.initial.sum();
    if initial_total > 0.0 {
        let log_priors = stats
            .initial
            .mapv(|c| (c / initial_total).max(1e-10).ln());
        parameters.set_log_priors(log_priors);
    }

    let mut log_transitions = parameters.log_transitions().clone();
    for i in 0..k {
        let row_total: f64 = (0..k).map(|j| stats.transitions[(i, j)]).sum();
        if row_total > 0.0 {
            for j in 0..k {
                log_transitions[(i, j)] =
                    (stats.transitions[(i, j)] / row_total).max(1e-10).ln();
            }
        }
    }
    parameters.set_log_transitions(log_transitions);

    let rows = parameters.kind().n_emission_rows();
    let dims = parameters.n_dimensions();
    for row in 0..rows {
        for dim in 0..dims {
            let (weight, wx, wxx) = stats.emissions[(row, dim)];
            if weight <= 0.0 {
                continue;
            }
            let mean = wx / weight;
            let variance = (wxx / weight - mean * mean).max(0.0);
            parameters.set_emission(row, dim, NegBinEmission::from_moments(mean, variance));
        }
    }

    // SNR guard: keep the high state meaningfully above the low state
    if let Some(min_snr) = config.min_snr {
        if rows == 2 {
            for dim in 0..dims {
                let low = parameters.emissions()[(0, dim)];
                let high = parameters.emissions()[(1, dim)];
                if high.mean() < low.mean() * min_snr {
                    parameters.set_emission(1, dim, high.with_mean(low.mean() * min_snr));
                    if !flags.out_of_snr_range {
                        warn!(
                            "signal-to-noise ratio dropped below {}; clamping state means",
                            min_snr
                        );
                    }
                    flags.out_of_snr_range = true;
                }
            }
        }
    }
}

/// Log-space forward–backward results for one chromosome.
struct Posterior {
    log_likelihood: f64,
    /// `n_states x n_bins`
    log_alpha: Array2<f64>,
    log_beta: Array2<f64>,
    log_emission: Array2<f64>,
    log_gamma: Array2<f64>,
}

impl Posterior {
    fn compute(parameters: &HmmParameters, counts: &Array2<u32>) -> Posterior {
        let k = parameters.n_states();
        let (dims, t_len) = counts.dim();
        let log_a = parameters.log_transitions();

        let mut log_emission = Array2::zeros((k, t_len));
        let mut bin_counts = vec![0u32; dims];
        for t in 0..t_len {
            for (dim, count) in bin_counts.iter_mut().enumerate() {
                *count = counts[(dim, t)];
            }
            for state in 0..k {
                log_emission[(state, t)] = parameters.emission_log_prob(state, &bin_counts);
            }
        }

        let mut log_alpha = Array2::from_elem((k, t_len), f64::NEG_INFINITY);
        for state in 0..k {
            log_alpha[(state, 0)] = parameters.log_priors()[state] + log_emission[(state, 0)];
        }
        let mut scratch = vec![f64::NEG_INFINITY; k];
        for t in 1..t_len {
            for j in 0..k {
                for (i, slot) in scratch.iter_mut().enumerate() {
                    *slot = log_alpha[(i, t - 1)] + log_a[(i, j)];
                }
                log_alpha[(j, t)] = log_emission[(j, t)] + log_sum_exp(&scratch);
            }
        }

        let mut log_beta = Array2::from_elem((k, t_len), f64::NEG_INFINITY);
        for state in 0..k {
            log_beta[(state, t_len - 1)] = 0.0;
        }
        for t in (0..t_len - 1).rev() {
            for i in 0..k {
                for (j, slot) in scratch.iter_mut().enumerate() {
                    *slot = log_a[(i, j)] + log_emission[(j, t + 1)] + log_beta[(j, t + 1)];
                }
                log_beta[(i, t)] = log_sum_exp(&scratch);
            }
        }

        let final_alphas: Vec<f64> = (0..k).map(|state| log_alpha[(state, t_len - 1)]).collect();
        let log_likelihood = log_sum_exp(&final_alphas);

        let mut log_gamma = Array2::from_elem((k, t_len), f64::NEG_INFINITY);
        for t in 0..t_len {
            for state in 0..k {
                log_gamma[(state, t)] =
                    log_alpha[(state, t)] + log_beta[(state, t)] - log_likelihood;
            }
        }

        Posterior {
            log_likelihood,
            log_alpha,
            log_beta,
            log_emission,
            log_gamma,
        }
    }

    /// Log posterior of the null state set per bin, clamped to valid log
    /// probabilities and stored as f32.
    fn log_null(&self, null_states: &[usize]) -> Vec<f32> {
        let t_len = self.log_gamma.dim().1;
        let mut values = Vec::with_capacity(t_len);
        let mut scratch = vec![f64::NEG_INFINITY; null_states.len()];
        for t in 0..t_len {
            for (slot, &state) in scratch.iter_mut().zip(null_states) {
                *slot = self.log_gamma[(state, t)];
            }
            let log_null = log_sum_exp(&scratch).min(0.0);
            // keep every value finite in f32 for the downstream log sweeps
            values.push(log_null.max(f32::MIN as f64 / 2.0) as f32);
        }
        values
    }

    fn log_gamma_f32(&self) -> Array2<f32> {
        self.log_gamma.mapv(|v| v.max(f32::MIN as f64 / 2.0) as f32)
    }
}

fn log_sum_exp(values: &[f64]) -> f64 {
    *values
        .iter()
        .fold(LogProb::ln_zero(), |acc, &v| acc.ln_add_exp(LogProb(v)))
}
