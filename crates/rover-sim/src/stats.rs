//! Control loop statistics.
//!
//! [`TickStats`] accumulates counters over a run: ticks, collisions, solver
//! outcomes and solve latency.

// ---------------------------------------------------------------------------
// TickStats
// ---------------------------------------------------------------------------

/// Cumulative per-run statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickStats {
    /// Ticks executed.
    pub ticks: u64,
    /// Ticks ended by the collision gate.
    pub collisions: u64,
    /// Successful solves.
    pub solves: u64,
    /// Solves that reported failure.
    pub failures: u64,
    /// Ticks whose command came from the failure policy.
    pub fallbacks: u64,
    /// Ticks where the background solve had not finished.
    pub stale_ticks: u64,
    /// Sum of solver iterations over all solves.
    pub total_iterations: u64,
    /// Sum of solve wall-clock time in microseconds.
    pub total_solve_time_us: u64,
    /// Slowest single solve in microseconds.
    pub max_solve_time_us: u64,
}

impl TickStats {
    pub const fn new() -> Self {
        Self {
            ticks: 0,
            collisions: 0,
            solves: 0,
            failures: 0,
            fallbacks: 0,
            stale_ticks: 0,
            total_iterations: 0,
            total_solve_time_us: 0,
            max_solve_time_us: 0,
        }
    }

    /// Record a successful solve.
    pub fn record_solve(&mut self, iterations: u32, solve_time_us: u64) {
        self.solves += 1;
        self.total_iterations += u64::from(iterations);
        self.total_solve_time_us += solve_time_us;
        self.max_solve_time_us = self.max_solve_time_us.max(solve_time_us);
    }

    /// Record a solve that reported failure. Its time is not reported by the
    /// solver and is left out of the latency counters.
    pub fn record_failure(&mut self, iterations: u32) {
        self.failures += 1;
        self.total_iterations += u64::from(iterations);
    }

    /// Average time of successful solves.
    pub fn mean_solve_time_us(&self) -> Option<f64> {
        if self.solves == 0 {
            return None;
        }
        #[allow(clippy::cast_precision_loss)]
        Some(self.total_solve_time_us as f64 / self.solves as f64)
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_default_empty() {
        let stats = TickStats::new();
        assert_eq!(stats, TickStats::default());
        assert!(stats.mean_solve_time_us().is_none());
    }

    #[test]
    fn record_solve_splits_outcomes() {
        let mut stats = TickStats::new();
        stats.record_solve(5, 100);
        stats.record_solve(7, 300);
        stats.record_failure(100);
        assert_eq!(stats.solves, 2);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.total_iterations, 112);
        assert_eq!(stats.max_solve_time_us, 300);
        assert!((stats.mean_solve_time_us().unwrap() - 200.0).abs() < f64::EPSILON);
    }

    #[test]
    fn reset_clears_stats() {
        let mut stats = TickStats::new();
        stats.ticks = 7;
        stats.record_solve(1, 1);
        stats.reset();
        assert_eq!(stats, TickStats::new());
    }
}
