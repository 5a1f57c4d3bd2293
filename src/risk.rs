//! Kelly-criterion position sizing, used by `executor.rs` for the
//! `SizingStrategy::Kelly` path.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Fractional Kelly calculator for optimal position sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KellyCalculator {
    /// Fractional Kelly multiplier for safety (0.1-0.5x).
    pub fraction: f64,
    /// Bankroll available for trading.
    pub bankroll: f64,
    /// Historical win/loss outcomes, most recent last.
    win_history: VecDeque<bool>,
    max_history: usize,
}

impl KellyCalculator {
    pub fn new(bankroll: f64, fraction: f64) -> Self {
        Self {
            fraction: fraction.clamp(0.1, 0.5),
            bankroll,
            win_history: VecDeque::with_capacity(1000),
            max_history: 1000,
        }
    }

    /// Raw Kelly fraction before the safety multiplier is applied.
    pub fn raw_fraction(&self, win_probability: f64) -> f64 {
        let p = win_probability.clamp(0.001, 0.999);
        let q = 1.0 - p;
        let b = (1.0 / p) - 1.0;
        if b <= 0.0 {
            return 0.0;
        }
        ((b * p - q) / b).max(0.0)
    }

    pub fn update_history(&mut self, won: bool) {
        if self.win_history.len() >= self.max_history {
            self.win_history.pop_front();
        }
        self.win_history.push_back(won);
    }

    pub fn get_win_rate(&self) -> f64 {
        if self.win_history.is_empty() {
            return 0.5;
        }
        let wins = self.win_history.iter().filter(|&&w| w).count() as f64;
        wins / self.win_history.len() as f64
    }

    pub fn apply_pnl(&mut self, pnl: f64) {
        self.bankroll = (self.bankroll + pnl).max(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_fraction_is_zero_for_a_losing_edge() {
        let kelly = KellyCalculator::new(10_000.0, 0.5);
        assert_eq!(kelly.raw_fraction(0.4), 0.0);
    }

    #[test]
    fn raw_fraction_is_positive_for_a_winning_edge() {
        let kelly = KellyCalculator::new(10_000.0, 0.5);
        assert!(kelly.raw_fraction(0.6) > 0.0);
    }

    #[test]
    fn win_rate_defaults_to_half_with_no_history() {
        let kelly = KellyCalculator::new(10_000.0, 0.5);
        assert_eq!(kelly.get_win_rate(), 0.5);
    }

    #[test]
    fn win_rate_tracks_recorded_outcomes() {
        let mut kelly = KellyCalculator::new(10_000.0, 0.5);
        kelly.update_history(true);
        kelly.update_history(true);
        kelly.update_history(false);
        assert!((kelly.get_win_rate() - (2.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn bankroll_never_goes_negative() {
        let mut kelly = KellyCalculator::new(100.0, 0.5);
        kelly.apply_pnl(-500.0);
        assert_eq!(kelly.bankroll, 0.0);
    }
}
