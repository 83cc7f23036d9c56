pub mod sec;
pub mod yahoo;

use std::sync::Arc;

use error_stack::Report;
use futures::future::BoxFuture;

use crate::config::MarketDataConfig;
use crate::error::MarketDataError;
use crate::model::{Fundamentals, PriceBar};

/// Source of daily price history.
///
/// Uses `BoxFuture` (from `futures` crate) instead of `async fn` in trait
/// to keep the trait object-safe (`dyn MarketDataProvider`).
pub trait MarketDataProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Up to `lookback` most recent daily bars, oldest first.
    fn get_bars(
        &self,
        ticker: &str,
        lookback: usize,
    ) -> BoxFuture<'_, Result<Vec<PriceBar>, Report<MarketDataError>>>;
}

/// Source of company KPIs. `Ok(None)` means the ticker is not covered.
pub trait FundamentalsProvider: Send + Sync {
    fn get_fundamentals(
        &self,
        ticker: &str,
    ) -> BoxFuture<'_, Result<Option<Fundamentals>, Report<MarketDataError>>>;
}

impl MarketDataError {
    /// Network failures may clear up; malformed or empty answers will not.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Request { .. })
    }
}

/// What the configured data source can deliver.
#[derive(Clone)]
pub enum DataSource {
    PriceOnly(Arc<dyn MarketDataProvider>),
    PriceAndFundamentals {
        prices: Arc<dyn MarketDataProvider>,
        fundamentals: Arc<dyn FundamentalsProvider>,
    },
}

impl DataSource {
    /// Yahoo chart prices, optionally with SEC EDGAR fundamentals.
    pub fn from_config(config: &MarketDataConfig) -> Result<Self, Report<MarketDataError>> {
        let prices: Arc<dyn MarketDataProvider> = Arc::new(yahoo::YahooChartProvider::new(config)?);
        if !config.fundamentals {
            return Ok(Self::PriceOnly(prices));
        }
        Ok(Self::PriceAndFundamentals {
            prices,
            fundamentals: Arc::new(sec::SecEdgarProvider::new(config)?),
        })
    }

    pub fn prices(&self) -> &dyn MarketDataProvider {
        match self {
            Self::PriceOnly(prices) | Self::PriceAndFundamentals { prices, .. } => prices.as_ref(),
        }
    }

    pub fn get_bars(
        &self,
        ticker: &str,
        lookback: usize,
    ) -> BoxFuture<'_, Result<Vec<PriceBar>, Report<MarketDataError>>> {
        self.prices().get_bars(ticker, lookback)
    }

    /// Best-effort fundamentals; failures only cost prompt context.
    pub async fn fundamentals(&self, ticker: &str) -> Option<Fundamentals> {
        let Self::PriceAndFundamentals { fundamentals, .. } = self else {
            return None;
        };
        match fundamentals.get_fundamentals(ticker).await {
            Ok(found) => found.filter(|f| !f.is_empty()),
            Err(e) => {
                tracing::warn!(ticker, error = ?e, "fundamentals unavailable (continuing)");
                None
            }
        }
    }
}
