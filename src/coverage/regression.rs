//! Linear control rescaling and regression.
//!
//! Control coverage is brought onto the treatment scale with
//! `s = ΣT / ΣC` over the whole genome. Optionally a coefficient
//! `β ∈ [0, 1]` is estimated so that the regressed signal
//! `T(b) − β·s·C(b)` decorrelates from the scaled control.

use log::{debug, warn};

use crate::genome::GenomeLayout;
use crate::stats::pearson;

use super::BinnedTrack;

/// Grid resolution of the β search.
const BETA_STEP: f64 = 0.01;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ControlNormalization {
    /// Linear rescaling factor `ΣT / ΣC`.
    pub scale: f64,
    /// Regression coefficient; zero when regression is disabled.
    pub beta: f64,
}

impl ControlNormalization {
    /// `max(0, t − β·s·c)`, rounded to integer.
    pub fn normalized_count(&self, t: u32, c: u32) -> u32 {
        (t as f64 - self.beta * self.scale * c as f64)
            .max(0.0)
            .round() as u32
    }

    pub fn normalized_score(&self, t: u64, c: u64) -> u64 {
        (t as f64 - self.beta * self.scale * c as f64)
            .max(0.0)
            .round() as u64
    }
}

/// Estimate the rescaling factor and, when `regress` is set, the β that
/// minimizes the absolute Pearson correlation between the regressed
/// treatment and the scaled control over genome-wide bins.
pub fn estimate(
    treatment: &BinnedTrack,
    control: &BinnedTrack,
    layout: &GenomeLayout,
    regress: bool,
) -> ControlNormalization {
    let treatment_sum: u64 = treatment.total_count();
    let control_sum: u64 = control.total_count();
    if control_sum == 0 {
        warn!("control coverage is empty; control rescaling disabled");
        return ControlNormalization {
            scale: 1.0,
            beta: 0.0,
        };
    }
    let scale = treatment_sum as f64 / control_sum as f64;
    debug!(
        "control rescaling factor {:.4} ({} treatment / {} control)",
        scale, treatment_sum, control_sum
    );
    if !regress {
        return ControlNormalization { scale, beta: 0.0 };
    }

    // concatenate bins in chromosome name order
    let mut t = Vec::new();
    let mut sc = Vec::new();
    for chromosome in layout.names() {
        let treatment_bins = treatment.bins(chromosome).unwrap_or(&[]);
        let control_bins = control.bins(chromosome).unwrap_or(&[]);
        for (&tb, &cb) in treatment_bins.iter().zip(control_bins) {
            t.push(tb as f64);
            sc.push(cb as f64 * scale);
        }
    }

    let mut best_beta = 0.0;
    let mut best_objective = f64::INFINITY;
    let steps = (1.0 / BETA_STEP).round() as usize;
    let mut residual = vec![0.0; t.len()];
    for step in 0..=steps {
        let beta = step as f64 * BETA_STEP;
        for (r, (&ti, &si)) in residual.iter_mut().zip(t.iter().zip(&sc)) {
            *r = ti - beta * si;
        }
        // a residual with no variance left carries no correlation signal;
        // treat it as maximally correlated so the grid does not park there
        let objective = pearson(&residual, &sc).map(f64::abs).unwrap_or(1.0);
        if objective < best_objective {
            best_objective = objective;
            best_beta = beta;
        }
    }
    debug!(
        "control regression beta {:.2} (|r| = {:.4})",
        best_beta, best_objective
    );
    ControlNormalization {
        scale,
        beta: best_beta,
    }
}
