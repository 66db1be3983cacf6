//! Order execution: dedup guard, retry engine, routing, slippage and
//! latency bookkeeping.

pub mod dedup;
pub mod latency;
pub mod retry;
pub mod router;
pub mod slippage;

pub use dedup::*;
pub use latency::*;
pub use retry::*;
pub use router::*;
pub use slippage::*;

/// Nearest-rank percentile over a pre-sorted slice. Empty input yields 0.
pub(crate) fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (pct / 100.0 * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[cfg(test)]
mod tests {
    use super::percentile;

    #[test]
    fn percentile_nearest_rank() {
        let sorted: Vec<f64> = (1..=10).map(|v| v as f64).collect();
        assert_eq!(percentile(&sorted, 50.0), 5.0);
        assert_eq!(percentile(&sorted, 95.0), 10.0);
        assert_eq!(percentile(&sorted, 100.0), 10.0);
        assert_eq!(percentile(&sorted, 1.0), 1.0);
        assert_eq!(percentile(&[], 50.0), 0.0);
    }
}
