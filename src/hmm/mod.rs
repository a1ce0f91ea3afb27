// Copyright 2016-2019 Johannes Köster, David Lähnemann.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

//! Zero-inflated multivariate negative-binomial hidden Markov model.
//!
//! One [`Hmm`] parameterization serves both peak calling flavors: the model
//! variant is a small tagged value ([`ModelKind`]) describing the state
//! alphabet, the null-hypothesis state set, and how states share emission
//! rows across dimensions. State 0 is always the fixed zero state, emitting
//! the all-zero count vector with probability one.

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

pub mod emission;
pub mod fit;

pub use emission::NegBinEmission;
pub use fit::{fit, FitConfig, FitFlags, FitInput, FitResult};

/// Model variant: state alphabet, null set, and emission-row sharing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelKind {
    /// Enrichment analysis: the zero state plus `free_states` states of
    /// increasing mean (three-state alphabet {Z, L, H} for the default of
    /// two free states). Null = every state but the highest.
    Analyze { free_states: usize },
    /// Differential analysis over two replicate groups: alphabet
    /// {Z, L, H, I, D}. I constrains the first group's dimensions to the
    /// high emission row and the second group's to the low row; D is the
    /// mirror image. Null = "same in both groups" = {Z, L, H}.
    Compare { group1: usize, group2: usize },
}

impl ModelKind {
    pub fn n_states(&self) -> usize {
        match *self {
            ModelKind::Analyze { free_states } => 1 + free_states,
            ModelKind::Compare { .. } => 5,
        }
    }

    /// Number of free emission rows shared by the non-zero states.
    pub fn n_emission_rows(&self) -> usize {
        match *self {
            ModelKind::Analyze { free_states } => free_states,
            ModelKind::Compare { .. } => 2,
        }
    }

    /// Emission row used by `state` in dimension `dim`; `None` for the zero
    /// state.
    pub fn emission_row(&self, state: usize, dim: usize) -> Option<usize> {
        if state == 0 {
            return None;
        }
        match *self {
            ModelKind::Analyze { .. } => Some(state - 1),
            ModelKind::Compare { group1, .. } => Some(match state {
                1 => 0,
                2 => 1,
                3 => usize::from(dim >= group1) ^ 1,
                4 => usize::from(dim < group1) ^ 1,
                _ => unreachable!("compare alphabet has five states"),
            }),
        }
    }

    /// States forming the null hypothesis.
    pub fn null_states(&self) -> Vec<usize> {
        match *self {
            ModelKind::Analyze { free_states } => (0..free_states).collect(),
            ModelKind::Compare { .. } => vec![0, 1, 2],
        }
    }

    /// Pairs of states that must be relabeled together when two emission
    /// rows are swapped during state sorting.
    fn swapped_states(&self, row_a: usize, row_b: usize) -> Vec<(usize, usize)> {
        match *self {
            ModelKind::Analyze { .. } => vec![(row_a + 1, row_b + 1)],
            // swapping the low/high rows mirrors both the same-states and
            // the increased/decreased pair
            ModelKind::Compare { .. } => vec![(1, 2), (3, 4)],
        }
    }

    pub fn state_label(&self, state: usize) -> &'static str {
        match (*self, state) {
            (_, 0) => "Z",
            (ModelKind::Analyze { free_states }, s) if s == free_states => "H",
            (ModelKind::Analyze { .. }, _) => "L",
            (ModelKind::Compare { .. }, 1) => "L",
            (ModelKind::Compare { .. }, 2) => "H",
            (ModelKind::Compare { .. }, 3) => "I",
            (ModelKind::Compare { .. }, 4) => "D",
            _ => "?",
        }
    }

    pub fn expected_dimensions(&self) -> Option<usize> {
        match *self {
            ModelKind::Analyze { .. } => None,
            ModelKind::Compare { group1, group2 } => Some(group1 + group2),
        }
    }
}

/// Fitted (or initial) parameters of the zero-inflated HMM.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HmmParameters {
    kind: ModelKind,
    n_dimensions: usize,
    log_priors: Array1<f64>,
    log_transitions: Array2<f64>,
    /// `n_emission_rows x n_dimensions`
    emissions: Array2<NegBinEmission>,
}

impl HmmParameters {
    pub(crate) fn new(
        kind: ModelKind,
        n_dimensions: usize,
        priors: &[f64],
        transitions: &Array2<f64>,
        emissions: Array2<NegBinEmission>,
    ) -> Self {
        let k = kind.n_states();
        assert_eq!(priors.len(), k);
        assert_eq!(transitions.dim(), (k, k));
        assert_eq!(emissions.dim(), (kind.n_emission_rows(), n_dimensions));
        HmmParameters {
            kind,
            n_dimensions,
            log_priors: priors.iter().map(|&p| p.ln()).collect(),
            log_transitions: transitions.mapv(f64::ln),
            emissions,
        }
    }

    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    pub fn n_states(&self) -> usize {
        self.kind.n_states()
    }

    pub fn n_dimensions(&self) -> usize {
        self.n_dimensions
    }

    pub fn log_priors(&self) -> &Array1<f64> {
        &self.log_priors
    }

    pub fn log_transitions(&self) -> &Array2<f64> {
        &self.log_transitions
    }

    pub fn emissions(&self) -> &Array2<NegBinEmission> {
        &self.emissions
    }

    /// Log emission probability of the count vector (one entry per
    /// dimension) under `state`.
    pub(crate) fn emission_log_prob(&self, state: usize, counts: &[u32]) -> f64 {
        if state == 0 {
            return if counts.iter().all(|&c| c == 0) {
                0.0
            } else {
                f64::NEG_INFINITY
            };
        }
        let mut log_prob = 0.0;
        for (dim, &count) in counts.iter().enumerate() {
            let row = self
                .kind
                .emission_row(state, dim)
                .expect("non-zero state has an emission row");
            log_prob += self.emissions[(row, dim)].log_pmf(count);
        }
        log_prob
    }

    pub(crate) fn set_log_priors(&mut self, log_priors: Array1<f64>) {
        self.log_priors = log_priors;
    }

    pub(crate) fn set_log_transitions(&mut self, log_transitions: Array2<f64>) {
        self.log_transitions = log_transitions;
    }

    pub(crate) fn set_emission(&mut self, row: usize, dim: usize, emission: NegBinEmission) {
        self.emissions[(row, dim)] = emission;
    }

    /// Mean of an emission row averaged over dimensions.
    fn row_mean(&self, row: usize) -> f64 {
        (0..self.n_dimensions)
            .map(|d| self.emissions[(row, d)].mean())
            .sum::<f64>()
            / self.n_dimensions as f64
    }

    fn row_success_prob(&self, row: usize) -> f64 {
        (0..self.n_dimensions)
            .map(|d| self.emissions[(row, d)].success_prob())
            .sum::<f64>()
            / self.n_dimensions as f64
    }

    /// Reorder states so that emission-row means ascend. A pair is swapped
    /// only when mean and success probability agree on the flip; when they
    /// disagree the pair is left unchanged and the fit is flagged low
    /// quality. Returns that flag.
    pub(crate) fn sort_states(&mut self) -> bool {
        let rows = self.kind.n_emission_rows();
        let mut low_quality = false;
        // bubble pass; row counts are tiny
        for _ in 0..rows {
            for i in 0..rows.saturating_sub(1) {
                let j = i + 1;
                let mean_flip = self.row_mean(i) > self.row_mean(j);
                let prob_flip = self.row_success_prob(i) > self.row_success_prob(j);
                if mean_flip && prob_flip {
                    self.swap_rows(i, j);
                } else if mean_flip != prob_flip {
                    low_quality = true;
                }
            }
        }
        low_quality
    }

    fn swap_rows(&mut self, row_a: usize, row_b: usize) {
        for dim in 0..self.n_dimensions {
            self.emissions.swap((row_a, dim), (row_b, dim));
        }
        for (a, b) in self.kind.swapped_states(row_a, row_b) {
            self.log_priors.swap(a, b);
            let k = self.n_states();
            for col in 0..k {
                self.log_transitions.swap((a, col), (b, col));
            }
            for row in 0..k {
                self.log_transitions.swap((row, a), (row, b));
            }
        }
    }
}
