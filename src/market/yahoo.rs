use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use error_stack::{Report, ResultExt};
use futures::future::BoxFuture;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::Deserialize;
use tracing::info;

use crate::config::MarketDataConfig;
use crate::error::MarketDataError;
use crate::market::MarketDataProvider;
use crate::model::PriceBar;

const PROVIDER: &str = "yahoo";
/// Chart API ranges and the calendar days they cover.
const RANGES: &[(&str, i64)] = &[
    ("1mo", 30),
    ("3mo", 90),
    ("6mo", 180),
    ("1y", 365),
    ("2y", 730),
    ("5y", 1825),
    ("10y", 3650),
];

/// Daily bars from the Yahoo Finance v8 chart endpoint.
pub struct YahooChartProvider {
    client: reqwest::Client,
    base_url: String,
    rate_limiter: Arc<DefaultDirectRateLimiter>,
}

impl YahooChartProvider {
    pub fn new(config: &MarketDataConfig) -> Result<Self, Report<MarketDataError>> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent("Mozilla/5.0 (compatible; market-oracle)")
            .build()
            .change_context(MarketDataError::Request {
                provider: PROVIDER.into(),
            })?;
        let rps = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            rate_limiter: Arc::new(RateLimiter::direct(Quota::per_second(rps))),
        })
    }
}

impl MarketDataProvider for YahooChartProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn get_bars(
        &self,
        ticker: &str,
        lookback: usize,
    ) -> BoxFuture<'_, Result<Vec<PriceBar>, Report<MarketDataError>>> {
        let ticker = ticker.to_owned();
        Box::pin(async move {
            self.rate_limiter.until_ready().await;

            let url = format!("{}/{}", self.base_url, ticker);
            let params = [("range", range_for(lookback)), ("interval", "1d")];

            let response = self
                .client
                .get(&url)
                .query(&params)
                .send()
                .await
                .change_context(MarketDataError::Request {
                    provider: PROVIDER.into(),
                })
                .attach_with(|| format!("ticker: {ticker}"))?;

            let status = response.status();
            if status.as_u16() == 404 {
                return Err(Report::new(MarketDataError::NoData {
                    provider: PROVIDER.into(),
                    ticker,
                }));
            }
            if !status.is_success() {
                return Err(Report::new(MarketDataError::Request {
                    provider: PROVIDER.into(),
                })
                .attach(format!("HTTP status: {status}")));
            }

            let body: ChartResponse =
                response
                    .json()
                    .await
                    .change_context(MarketDataError::ResponseParse {
                        provider: PROVIDER.into(),
                    })?;

            let mut bars = parse_chart(&ticker, body)?;
            if bars.len() > lookback {
                bars.drain(..bars.len() - lookback);
            }

            info!(ticker = %ticker, fetched = bars.len(), "yahoo bar fetch complete");
            Ok(bars)
        })
    }
}

/// Smallest chart range that covers `lookback` trading days.
fn range_for(lookback: usize) -> &'static str {
    // ~252 trading days per 365 calendar days, plus holiday slack
    let days = (lookback as i64 * 365) / 252 + 10;
    RANGES
        .iter()
        .find(|(_, covered)| *covered >= days)
        .map(|(range, _)| *range)
        .unwrap_or("max")
}

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: Chart,
}

#[derive(Debug, Deserialize)]
struct Chart {
    result: Option<Vec<ChartResult>>,
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    timestamp: Option<Vec<i64>>,
    indicators: ChartIndicators,
}

#[derive(Debug, Deserialize)]
struct ChartIndicators {
    quote: Vec<Quote>,
}

#[derive(Debug, Default, Deserialize)]
struct Quote {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

fn parse_chart(ticker: &str, body: ChartResponse) -> Result<Vec<PriceBar>, Report<MarketDataError>> {
    if let Some(error) = body.chart.error {
        return Err(Report::new(MarketDataError::NoData {
            provider: PROVIDER.into(),
            ticker: ticker.into(),
        })
        .attach(format!("{}: {}", error.code, error.description)));
    }

    let Some(result) = body.chart.result.and_then(|r| r.into_iter().next()) else {
        return Err(Report::new(MarketDataError::NoData {
            provider: PROVIDER.into(),
            ticker: ticker.into(),
        }));
    };

    let timestamps = result.timestamp.unwrap_or_default();
    let quote = result.indicators.quote.into_iter().next().unwrap_or_default();
    let at = |series: &[Option<f64>], i: usize| series.get(i).copied().flatten();

    // Rows with gaps (halts, partial sessions) are skipped rather than guessed.
    let bars: Vec<PriceBar> = timestamps
        .iter()
        .enumerate()
        .filter_map(|(i, &ts)| {
            Some(PriceBar {
                ticker: ticker.to_string(),
                timestamp: DateTime::from_timestamp(ts, 0)?,
                open: at(&quote.open, i)?,
                high: at(&quote.high, i)?,
                low: at(&quote.low, i)?,
                close: at(&quote.close, i)?,
                volume: at(&quote.volume, i).unwrap_or(0.0),
            })
        })
        .collect();

    if bars.is_empty() {
        return Err(Report::new(MarketDataError::NoData {
            provider: PROVIDER.into(),
            ticker: ticker.into(),
        }));
    }
    Ok(bars)
}
