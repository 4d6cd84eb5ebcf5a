//! Epoch-indexed learning-rate schedules.
//!
//! `lr(epoch) = round(base * (1 - epoch / max_epoch)^power, 8)`. The same
//! function serves the network and the refiner, each with its own base rate,
//! and gives a resumed run exactly the rate an uninterrupted run would use.

/// Polynomial learning-rate decay over epochs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolynomialDecay {
    base_lr: f64,
    max_epoch: usize,
    power: f64,
}

impl PolynomialDecay {
    pub fn new(base_lr: f64, max_epoch: usize) -> Self {
        Self {
            base_lr,
            max_epoch,
            power: 0.9,
        }
    }

    pub fn with_power(mut self, power: f64) -> Self {
        self.power = power;
        self
    }

    pub fn base_lr(&self) -> f64 {
        self.base_lr
    }

    /// Rate for `epoch`; zero from `max_epoch` on.
    pub fn at(&self, epoch: usize) -> f64 {
        if self.max_epoch == 0 || epoch >= self.max_epoch {
            return 0.0;
        }
        let remaining = 1.0 - epoch as f64 / self.max_epoch as f64;
        round_decimals(self.base_lr * remaining.powf(self.power), 8)
    }
}

fn round_decimals(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_endpoints() {
        let schedule = PolynomialDecay::new(1e-4, 500);
        assert_eq!(schedule.at(0), 1e-4);
        assert_eq!(schedule.at(500), 0.0);
        assert_eq!(schedule.at(600), 0.0);
    }

    #[test]
    fn test_known_value() {
        // 1e-4 * 0.5^0.9 = 5.358867e-5, rounded to 8 decimals.
        let schedule = PolynomialDecay::new(1e-4, 10);
        assert!((schedule.at(5) - 5.359e-5).abs() < 1e-12);
    }

    #[test]
    fn test_refiner_rate_uses_same_curve() {
        let network = PolynomialDecay::new(1e-4, 100);
        let refiner = PolynomialDecay::new(0.1, 100);
        let ratio = refiner.at(37) / network.at(37);
        assert!((ratio - 1000.0).abs() < 1.0);
    }

    proptest! {
        #[test]
        fn prop_non_increasing(base in 1u32..100_000, max_epoch in 1usize..1000, epoch in 0usize..1000) {
            let schedule = PolynomialDecay::new(base as f64 * 1e-6, max_epoch);
            prop_assert!(schedule.at(epoch + 1) <= schedule.at(epoch));
        }

        #[test]
        fn prop_starts_at_base(base in 1u32..100_000, max_epoch in 1usize..1000) {
            let base = base as f64 * 1e-6;
            let schedule = PolynomialDecay::new(base, max_epoch);
            prop_assert!((schedule.at(0) - base).abs() < 1e-12);
            prop_assert_eq!(schedule.at(max_epoch), 0.0);
        }

        #[test]
        fn prop_resume_is_continuous(max_epoch in 2usize..1000, k in 1usize..1000) {
            // A schedule built fresh at resume time agrees with the one an
            // uninterrupted run has been using.
            let k = k % max_epoch;
            let uninterrupted = PolynomialDecay::new(1e-4, max_epoch);
            let resumed = PolynomialDecay::new(1e-4, max_epoch);
            prop_assert_eq!(uninterrupted.at(k), resumed.at(k));
        }
    }
}
