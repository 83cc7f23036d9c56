use error_stack::{Report, bail};

use crate::error::IndicatorError;
use crate::indicator::{Indicator, close_prices};
use crate::model::PriceBar;

/// RSI (Relative Strength Index) using Wilder's smoothing method.
pub struct Rsi {
    period: usize,
}

impl Rsi {
    pub fn new(period: usize) -> Result<Self, Report<IndicatorError>> {
        if period == 0 {
            bail!(IndicatorError::InvalidParameter {
                name: "rsi period must be > 0".into(),
            });
        }
        Ok(Self { period })
    }
}

impl Indicator for Rsi {
    fn name(&self) -> &str {
        "rsi"
    }

    fn required_bars(&self) -> usize {
        self.period + 1
    }

    fn calculate(&self, bars: &[PriceBar]) -> Result<Vec<f64>, Report<IndicatorError>> {
        let prices = close_prices(bars);
        if prices.len() < self.required_bars() {
            bail!(IndicatorError::InsufficientData {
                required: self.required_bars(),
                available: prices.len(),
            });
        }

        let deltas: Vec<f64> = prices.windows(2).map(|w| w[1] - w[0]).collect();
        let period = self.period as f64;

        // Seed using simple average of first `period` gains/losses
        let mut avg_gain = deltas[..self.period].iter().map(|&d| d.max(0.0)).sum::<f64>() / period;
        let mut avg_loss =
            deltas[..self.period].iter().map(|&d| (-d).max(0.0)).sum::<f64>() / period;

        let mut results = Vec::with_capacity(deltas.len() - self.period + 1);
        results.push(rsi_value(avg_gain, avg_loss));

        for &delta in &deltas[self.period..] {
            avg_gain = (avg_gain * (period - 1.0) + delta.max(0.0)) / period;
            avg_loss = (avg_loss * (period - 1.0) + (-delta).max(0.0)) / period;
            results.push(rsi_value(avg_gain, avg_loss));
        }

        Ok(results)
    }
}

fn rsi_value(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        // flat series has no momentum either way
        if avg_gain == 0.0 {
            return 50.0;
        }
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    100.0 - 100.0 / (1.0 + rs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicator::bars_from_closes;

    #[test]
    fn rsi_insufficient_data() {
        let rsi = Rsi::new(14).unwrap();
        assert!(rsi.calculate(&bars_from_closes(&[1.0; 14])).is_err());
    }

    #[test]
    fn rsi_period_zero_invalid() {
        assert!(Rsi::new(0).is_err());
    }

    #[test]
    fn rsi_all_gains_returns_100() {
        let rsi = Rsi::new(3).unwrap();
        let values = rsi.calculate(&bars_from_closes(&[1.0, 2.0, 3.0, 4.0])).unwrap();
        assert_eq!(values, vec![100.0]);
    }

    #[test]
    fn rsi_all_losses_returns_0() {
        let rsi = Rsi::new(3).unwrap();
        let values = rsi.calculate(&bars_from_closes(&[4.0, 3.0, 2.0, 1.0])).unwrap();
        assert!(values[0].abs() < 1e-9);
    }

    #[test]
    fn rsi_flat_series_is_neutral() {
        let rsi = Rsi::new(14).unwrap();
        let values = rsi.calculate(&bars_from_closes(&[100.0; 20])).unwrap();
        assert!(values.iter().all(|v| (*v - 50.0).abs() < 1e-9));
    }

    #[test]
    fn rsi_wilder_smoothing_known_value() {
        // period 2: deltas +1, -1 seed avg_gain = avg_loss = 0.5 -> 50
        // next delta +2: avg_gain = (0.5 + 2) / 2 = 1.25, avg_loss = 0.25 -> rs 5
        let rsi = Rsi::new(2).unwrap();
        let values = rsi.calculate(&bars_from_closes(&[10.0, 11.0, 10.0, 12.0])).unwrap();
        assert!((values[0] - 50.0).abs() < 1e-9);
        assert!((values[1] - (100.0 - 100.0 / 6.0)).abs() < 1e-9);
    }

    #[test]
    fn rsi_output_length() {
        let rsi = Rsi::new(14).unwrap();
        let values = rsi.calculate(&bars_from_closes(&[100.0_f64; 20])).unwrap();
        // 20 prices -> 19 deltas -> 1 seed + 5 subsequent = 6 values
        assert_eq!(values.len(), 20 - 14);
    }
}
