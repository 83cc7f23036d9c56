pub mod ema;
pub mod rsi;

use error_stack::{Report, bail};

use crate::error::IndicatorError;
use crate::indicator::ema::Ema;
use crate::indicator::rsi::Rsi;
use crate::model::{IndicatorSnapshot, PriceBar};

/// A technical analysis indicator that operates on a slice of bars.
///
/// Bars must be in ascending chronological order (oldest first).
pub trait Indicator: Send + Sync {
    /// Unique name of this indicator (e.g., "rsi", "ema").
    fn name(&self) -> &str;

    /// Minimum number of bars required to produce at least one output value.
    fn required_bars(&self) -> usize;

    /// Calculate indicator values from bars.
    ///
    /// Returns one value per output point. The number of values may be less
    /// than the number of input bars depending on the indicator's lookback.
    fn calculate(&self, bars: &[PriceBar]) -> Result<Vec<f64>, Report<IndicatorError>>;
}

/// Extract close prices from a slice of bars.
pub fn close_prices(bars: &[PriceBar]) -> Vec<f64> {
    bars.iter().map(|b| b.close).collect()
}

/// Computes the RSI / short EMA / long EMA snapshot the gate works on.
pub struct IndicatorEngine {
    rsi: Rsi,
    ema_short: Ema,
    ema_long: Ema,
}

impl IndicatorEngine {
    pub fn new(
        rsi_period: usize,
        ema_short_period: usize,
        ema_long_period: usize,
    ) -> Result<Self, Report<IndicatorError>> {
        Ok(Self {
            rsi: Rsi::new(rsi_period)?,
            ema_short: Ema::new(ema_short_period)?,
            ema_long: Ema::new(ema_long_period)?,
        })
    }

    /// Number of bars needed for every field of the snapshot to be defined.
    pub fn required_bars(&self) -> usize {
        let indicators: [&dyn Indicator; 3] = [&self.rsi, &self.ema_short, &self.ema_long];
        indicators
            .iter()
            .map(|i| i.required_bars())
            .max()
            .unwrap_or(1)
    }

    /// Snapshot at the last bar. Indicators whose lookback is not covered by
    /// `bars` are left undefined; an empty series is an error.
    pub fn snapshot(
        &self,
        ticker: &str,
        bars: &[PriceBar],
    ) -> Result<IndicatorSnapshot, Report<IndicatorError>> {
        let Some(last) = bars.last() else {
            bail!(IndicatorError::InsufficientData {
                required: 1,
                available: 0,
            });
        };

        let change_pct = bars
            .len()
            .checked_sub(2)
            .map(|i| bars[i].close)
            .filter(|prev| *prev != 0.0)
            .map(|prev| (last.close - prev) / prev * 100.0);

        Ok(IndicatorSnapshot {
            ticker: ticker.to_string(),
            timestamp: last.timestamp,
            price: last.close,
            change_pct,
            rsi: latest_value(&self.rsi, bars)?,
            ema_short: latest_value(&self.ema_short, bars)?,
            ema_long: latest_value(&self.ema_long, bars)?,
        })
    }
}

fn latest_value(
    indicator: &dyn Indicator,
    bars: &[PriceBar],
) -> Result<Option<f64>, Report<IndicatorError>> {
    if bars.len() < indicator.required_bars() {
        tracing::debug!(
            indicator = indicator.name(),
            available = bars.len(),
            required = indicator.required_bars(),
            "indicator undefined"
        );
        return Ok(None);
    }
    Ok(indicator.calculate(bars)?.last().copied())
}

#[cfg(test)]
pub(crate) fn bars_from_closes(closes: &[f64]) -> Vec<PriceBar> {
    let start = chrono::Utc::now() - chrono::Duration::days(closes.len() as i64);
    closes
        .iter()
        .enumerate()
        .map(|(i, &c)| PriceBar {
            ticker: "TEST".into(),
            timestamp: start + chrono::Duration::days(i as i64),
            open: c,
            high: c,
            low: c,
            close: c,
            volume: 1_000.0,
        })
        .collect()
}
