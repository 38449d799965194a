//! Synthesis run statistics
//!
//! Tracks iteration counts and model sizes at the MDP and chain level,
//! emits a periodic progress line and produces the final summary.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Zero approximation to avoid division-by-zero on empty runs
const APPROX_ZERO: f64 = 1e-6;

fn safe_division(dividend: f64, divisor: f64) -> f64 {
    if divisor == 0.0 {
        dividend / APPROX_ZERO
    } else {
        dividend / divisor
    }
}

/// Mutable statistics collected while a synthesis run is in flight
#[derive(Debug)]
pub struct Statistics {
    /// Unix timestamp the run started at
    started_at: i64,

    start: Option<Instant>,
    elapsed: Duration,

    iterations_mdp: u64,
    acc_size_mdp: u64,

    iterations_dtmc: u64,
    acc_size_dtmc: u64,

    /// How often the progress line is emitted
    status_period: Duration,
    status_horizon: Duration,
}

impl Statistics {
    pub fn new(status_period: Duration) -> Self {
        Self {
            started_at: chrono::Utc::now().timestamp(),
            start: None,
            elapsed: Duration::ZERO,
            iterations_mdp: 0,
            acc_size_mdp: 0,
            iterations_dtmc: 0,
            acc_size_dtmc: 0,
            status_period,
            status_horizon: status_period,
        }
    }

    pub fn start(&mut self) {
        self.start = Some(Instant::now());
    }

    pub fn elapsed(&self) -> Duration {
        match self.start {
            Some(start) => start.elapsed(),
            None => self.elapsed,
        }
    }

    /// Record one family verification at the MDP level.
    pub fn iteration_mdp(&mut self, size: usize) {
        self.iterations_mdp += 1;
        self.acc_size_mdp += size as u64;
    }

    /// Record one chain verification.
    pub fn iteration_dtmc(&mut self, size: usize) {
        self.iterations_dtmc += 1;
        self.acc_size_dtmc += size as u64;
    }

    /// Emit a progress line once per status period.
    pub fn report_progress(&mut self, explored: u128, discarded: u128, total: u128) {
        let elapsed = self.elapsed();
        if elapsed < self.status_horizon {
            return;
        }
        self.status_horizon += self.status_period;

        let rejected_fraction =
            safe_division((explored + discarded) as f64, total as f64);
        let percentage = (rejected_fraction * 1e4).round() / 1e2;
        tracing::info!(
            progress = %format!("{percentage}%"),
            elapsed_secs = elapsed.as_secs_f64(),
            iterations_mdp = self.iterations_mdp,
            iterations_dtmc = self.iterations_dtmc,
            "synthesis in progress"
        );
    }

    /// Close the run and assemble the summary.
    pub fn finish(
        &mut self,
        explored: u128,
        discarded: u128,
        total: u128,
        frontier_remaining: usize,
    ) -> StatisticsSummary {
        if let Some(start) = self.start.take() {
            self.elapsed = start.elapsed();
        }
        StatisticsSummary {
            started_at: self.started_at,
            synthesis_time_secs: self.elapsed.as_secs_f64(),
            explored_fraction: safe_division(explored as f64, total as f64),
            discarded_fraction: safe_division(discarded as f64, total as f64),
            iterations_mdp: self.iterations_mdp,
            iterations_dtmc: self.iterations_dtmc,
            avg_size_mdp: safe_division(self.acc_size_mdp as f64, self.iterations_mdp as f64),
            avg_size_dtmc: safe_division(self.acc_size_dtmc as f64, self.iterations_dtmc as f64),
            family_size: total,
            frontier_remaining,
        }
    }
}

/// Final numbers of one synthesis run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatisticsSummary {
    /// Unix timestamp the run started at
    pub started_at: i64,

    /// Total synthesis time in seconds
    pub synthesis_time_secs: f64,

    /// Fraction of the root family classified by verification
    pub explored_fraction: f64,

    /// Fraction pruned by the conflict cache, incomplete search or an
    /// early feasible exit
    pub discarded_fraction: f64,

    /// Family verifications at the MDP level
    pub iterations_mdp: u64,

    /// Chain verifications (double checks included)
    pub iterations_dtmc: u64,

    /// Average sub-MDP state count
    pub avg_size_mdp: f64,

    /// Average chain state count
    pub avg_size_dtmc: f64,

    /// Size of the root family
    pub family_size: u128,

    /// Families left on the frontier at exit, after cancellation or an
    /// early feasible return
    pub frontier_remaining: usize,
}

impl StatisticsSummary {
    /// Export the summary as pretty-printed JSON.
    pub fn export_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
