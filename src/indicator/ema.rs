use error_stack::{Report, bail};

use crate::error::IndicatorError;
use crate::indicator::{Indicator, close_prices};
use crate::model::PriceBar;

/// Exponential Moving Average seeded with the SMA of the first `period` closes.
pub struct Ema {
    period: usize,
}

impl Ema {
    pub fn new(period: usize) -> Result<Self, Report<IndicatorError>> {
        if period == 0 {
            bail!(IndicatorError::InvalidParameter {
                name: "ema period must be > 0".into(),
            });
        }
        Ok(Self { period })
    }

    pub fn calculate_prices(&self, prices: &[f64]) -> Result<Vec<f64>, Report<IndicatorError>> {
        if prices.len() < self.period {
            bail!(IndicatorError::InsufficientData {
                required: self.period,
                available: prices.len(),
            });
        }

        let k = 2.0 / (self.period as f64 + 1.0);
        let mut ema = prices[..self.period].iter().sum::<f64>() / self.period as f64;
        let mut results = Vec::with_capacity(prices.len() - self.period + 1);
        results.push(ema);

        for &price in &prices[self.period..] {
            ema = price * k + ema * (1.0 - k);
            results.push(ema);
        }

        Ok(results)
    }
}

impl Indicator for Ema {
    fn name(&self) -> &str {
        "ema"
    }

    fn required_bars(&self) -> usize {
        self.period
    }

    fn calculate(&self, bars: &[PriceBar]) -> Result<Vec<f64>, Report<IndicatorError>> {
        self.calculate_prices(&close_prices(bars))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicator::bars_from_closes;

    #[test]
    fn ema_period_zero_invalid() {
        assert!(Ema::new(0).is_err());
    }

    #[test]
    fn ema_insufficient_data() {
        let ema = Ema::new(5).unwrap();
        assert!(ema.calculate(&bars_from_closes(&[1.0; 4])).is_err());
    }

    #[test]
    fn ema_flat_prices() {
        let ema = Ema::new(3).unwrap();
        let values = ema.calculate(&bars_from_closes(&[10.0; 6])).unwrap();
        assert_eq!(values.len(), 4);
        for v in &values {
            assert!((v - 10.0).abs() < 1e-9);
        }
    }

    #[test]
    fn ema_seed_equals_sma_then_smooths() {
        let ema = Ema::new(3).unwrap();
        let values = ema.calculate(&bars_from_closes(&[1.0, 2.0, 3.0, 4.0])).unwrap();
        // seed = (1+2+3)/3 = 2.0, k = 0.5 -> 4*0.5 + 2*0.5 = 3.0
        assert!((values[0] - 2.0).abs() < 1e-9);
        assert!((values[1] - 3.0).abs() < 1e-9);
    }
}
