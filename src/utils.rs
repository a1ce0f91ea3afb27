use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::errors::Error;

/// Cooperative cancellation flag shared between the engine and its caller.
///
/// Long running loops (EM iterations, the sensitivity sweep, per-chromosome
/// candidate scoring) poll the token at safe points; on cancellation,
/// partially filled buffers are discarded and [`Error::Cancelled`] is
/// surfaced.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn check(&self) -> Result<(), Error> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Counts-per-million normalization of a binned track, with blacklisted bins
/// zeroed. Intended for the external coverage track emitter.
pub fn counts_per_million(bins: &[u32], total_count: u64, blacklisted: impl Fn(usize) -> bool) -> Vec<f32> {
    let scale = if total_count == 0 {
        0.0
    } else {
        1e6 / total_count as f64
    };
    bins.iter()
        .enumerate()
        .map(|(i, &c)| {
            if blacklisted(i) {
                0.0
            } else {
                (c as f64 * scale) as f32
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_token() {
        let token = CancellationToken::new();
        assert!(token.check().is_ok());
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(Error::Cancelled)));
    }

    #[test]
    fn test_counts_per_million() {
        let cpm = counts_per_million(&[1, 2, 0, 1], 4, |i| i == 1);
        assert_eq!(cpm, vec![250_000.0, 0.0, 0.0, 250_000.0]);
    }
}
