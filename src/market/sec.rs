use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use error_stack::{Report, ResultExt};
use futures::future::BoxFuture;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::MarketDataConfig;
use crate::error::MarketDataError;
use crate::market::FundamentalsProvider;
use crate::model::Fundamentals;

const PROVIDER: &str = "sec-edgar";
const BILLION: f64 = 1_000_000_000.0;
const MILLION: f64 = 1_000_000.0;

/// Fundamentals from the SEC EDGAR XBRL companyfacts API.
///
/// Ticker to CIK mappings are loaded once from the public ticker index and
/// cached for the lifetime of the provider.
pub struct SecEdgarProvider {
    client: reqwest::Client,
    base_url: String,
    tickers_url: String,
    ciks: RwLock<HashMap<String, String>>,
    rate_limiter: Arc<DefaultDirectRateLimiter>,
}

#[derive(Debug, Deserialize)]
struct TickerEntry {
    cik_str: u64,
    ticker: String,
}

impl SecEdgarProvider {
    pub fn new(config: &MarketDataConfig) -> Result<Self, Report<MarketDataError>> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.sec_user_agent.clone())
            .build()
            .change_context(MarketDataError::Request {
                provider: PROVIDER.into(),
            })?;
        // EDGAR asks for at most 10 requests per second
        let rps = NonZeroU32::new(config.requests_per_second.min(10)).unwrap_or(NonZeroU32::MIN);
        Ok(Self {
            client,
            base_url: config.sec_base_url.trim_end_matches('/').to_string(),
            tickers_url: config.sec_tickers_url.clone(),
            ciks: RwLock::new(HashMap::new()),
            rate_limiter: Arc::new(RateLimiter::direct(Quota::per_second(rps))),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, Report<MarketDataError>> {
        self.rate_limiter.until_ready().await;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .change_context(MarketDataError::Request {
                provider: PROVIDER.into(),
            })
            .attach_with(|| format!("url: {url}"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Report::new(MarketDataError::Request {
                provider: PROVIDER.into(),
            })
            .attach(format!("HTTP status: {status}"))
            .attach(format!("url: {url}")));
        }

        response
            .json()
            .await
            .change_context(MarketDataError::ResponseParse {
                provider: PROVIDER.into(),
            })
    }

    async fn cik_for(&self, ticker: &str) -> Result<Option<String>, Report<MarketDataError>> {
        let key = ticker.to_uppercase();
        {
            let ciks = self.ciks.read().await;
            if !ciks.is_empty() {
                return Ok(ciks.get(&key).cloned());
            }
        }

        let index: HashMap<String, TickerEntry> = self.get_json(&self.tickers_url).await?;
        let mut ciks = self.ciks.write().await;
        ciks.extend(
            index
                .into_values()
                .map(|entry| (entry.ticker.to_uppercase(), format_cik(entry.cik_str))),
        );
        info!(entries = ciks.len(), "sec ticker index loaded");
        Ok(ciks.get(&key).cloned())
    }
}

impl FundamentalsProvider for SecEdgarProvider {
    fn get_fundamentals(
        &self,
        ticker: &str,
    ) -> BoxFuture<'_, Result<Option<Fundamentals>, Report<MarketDataError>>> {
        let ticker = ticker.to_owned();
        Box::pin(async move {
            let Some(cik) = self.cik_for(&ticker).await? else {
                debug!(ticker = %ticker, "no CIK for ticker");
                return Ok(None);
            };

            let url = format!("{}/api/xbrl/companyfacts/CIK{}.json", self.base_url, cik);
            let facts: Value = self.get_json(&url).await?;
            let kpis = extract_kpis(&facts);
            debug!(ticker = %ticker, cik = %cik, ?kpis, "sec kpis extracted");
            Ok(Some(kpis))
        })
    }
}

/// EDGAR CIKs are zero-padded to ten digits in API paths.
fn format_cik(cik: u64) -> String {
    format!("{cik:010}")
}

/// Latest reported value of a us-gaap concept, by period end date.
/// Monetary units are preferred over share counts.
fn latest_value(facts: &Value, concept: &str) -> Option<f64> {
    let units = facts.get("facts")?.get("us-gaap")?.get(concept)?.get("units")?;
    ["USD", "shares"].iter().find_map(|unit| {
        units
            .get(unit)?
            .as_array()?
            .iter()
            .filter_map(|v| Some((v.get("end")?.as_str()?, v.get("val")?.as_f64()?)))
            .max_by(|a, b| a.0.cmp(b.0))
            .map(|(_, val)| val)
    })
}

fn nonzero(value: Option<f64>) -> Option<f64> {
    value.filter(|v| *v != 0.0)
}

/// Headline KPIs from a companyfacts document. Zero values count as missing.
pub fn extract_kpis(facts: &Value) -> Fundamentals {
    let revenue = nonzero(latest_value(facts, "Revenues")).or_else(|| {
        nonzero(latest_value(
            facts,
            "RevenueFromContractWithCustomerExcludingAssessedTax",
        ))
    });
    let debt = latest_value(facts, "LongTermDebt").unwrap_or(0.0)
        + latest_value(facts, "DebtCurrent").unwrap_or(0.0);

    Fundamentals {
        revenue_billions: revenue.map(|v| v / BILLION),
        net_income_millions: nonzero(latest_value(facts, "NetIncomeLoss")).map(|v| v / MILLION),
        eps: nonzero(latest_value(facts, "EarningsPerShareBasic")),
        cash_billions: nonzero(latest_value(facts, "CashAndCashEquivalentsAtCarryingValue"))
            .map(|v| v / BILLION),
        debt_billions: (debt > 0.0).then_some(debt / BILLION),
    }
}
