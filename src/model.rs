use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One daily OHLCV bar. Sequences are always ordered oldest first.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceBar {
    // Bars are always handled per requested ticker
    #[allow(dead_code)]
    pub ticker: String,
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Subscriber {
    pub id: i64,
    /// Channel-specific address, e.g. a Telegram chat id.
    pub contact: String,
    pub active: bool,
    pub plan: String,
    /// `None` means the subscription never expires.
    pub subscription_end: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Subscriber {
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.active && self.subscription_end.is_none_or(|end| end > now)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PortfolioEntry {
    pub subscriber_id: i64,
    pub ticker: String,
    pub watched_since: DateTime<Utc>,
}

/// A unit of pipeline work: one ticker on one active subscriber's watchlist.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchPair {
    pub subscriber_id: i64,
    pub contact: String,
    pub ticker: String,
}

/// Indicator values derived from a bar series. `None` means undefined: the
/// series was shorter than the indicator's period.
#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorSnapshot {
    pub ticker: String,
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub change_pct: Option<f64>,
    pub rsi: Option<f64>,
    pub ema_short: Option<f64>,
    pub ema_long: Option<f64>,
}

impl IndicatorSnapshot {
    /// Sign of `ema_short - ema_long`, undefined when either side is missing or
    /// both are equal.
    pub fn cross_sign(&self) -> Option<CrossSign> {
        let diff = self.ema_short? - self.ema_long?;
        if diff > 0.0 {
            Some(CrossSign::Positive)
        } else if diff < 0.0 {
            Some(CrossSign::Negative)
        } else {
            None
        }
    }

    /// Names of the indicators that could not be computed.
    pub fn undefined_fields(&self) -> Vec<&'static str> {
        [
            ("rsi", self.rsi),
            ("ema_short", self.ema_short),
            ("ema_long", self.ema_long),
        ]
        .into_iter()
        .filter(|(_, v)| v.is_none())
        .map(|(name, _)| name)
        .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RsiZone {
    Overbought,
    Oversold,
    Neutral,
}

impl RsiZone {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Overbought => "overbought",
            Self::Oversold => "oversold",
            Self::Neutral => "neutral",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "overbought" => Some(Self::Overbought),
            "oversold" => Some(Self::Oversold),
            "neutral" => Some(Self::Neutral),
            _ => None,
        }
    }
}

impl fmt::Display for RsiZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CrossSign {
    Positive,
    Negative,
}

impl CrossSign {
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Positive => 1,
            Self::Negative => -1,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            1 => Some(Self::Positive),
            -1 => Some(Self::Negative),
            _ => None,
        }
    }
}

/// Why the gate opened for a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    FirstRun,
    PriceMove,
    RsiOverbought,
    RsiOversold,
    GoldenCross,
    DeathCross,
}

impl TriggerReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FirstRun => "first_run",
            Self::PriceMove => "price_move",
            Self::RsiOverbought => "rsi_overbought",
            Self::RsiOversold => "rsi_oversold",
            Self::GoldenCross => "golden_cross",
            Self::DeathCross => "death_cross",
        }
    }
}

impl fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-(subscriber, ticker) memory of what was last delivered.
#[derive(Debug, Clone, PartialEq)]
pub struct GateState {
    pub last_notified_price: f64,
    pub last_rsi_zone: RsiZone,
    pub last_cross_sign: Option<CrossSign>,
    pub cooldowns: BTreeMap<TriggerReason, DateTime<Utc>>,
    pub last_recommendation: Option<Recommendation>,
    pub updated_at: DateTime<Utc>,
}

impl GateState {
    /// Latest cooldown expiry across all reasons.
    pub fn cooldown_expiry(&self) -> Option<DateTime<Utc>> {
        self.cooldowns.values().max().copied()
    }

    pub fn in_cooldown(&self, reason: TriggerReason, now: DateTime<Utc>) -> bool {
        self.cooldowns.get(&reason).is_some_and(|expiry| *expiry > now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Recommendation {
    Buy,
    Sell,
    Hold,
    Watch,
}

impl Recommendation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
            Self::Hold => "HOLD",
            Self::Watch => "WATCH",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "BUY" => Some(Self::Buy),
            "SELL" => Some(Self::Sell),
            "HOLD" => Some(Self::Hold),
            "WATCH" => Some(Self::Watch),
            _ => None,
        }
    }
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisResult {
    pub ticker: String,
    pub recommendation: Recommendation,
    pub confidence: f64,
    pub rationale: String,
    pub key_points: Vec<String>,
    pub invalidation: Option<String>,
    pub risk_note: Option<String>,
    pub generated_at: DateTime<Utc>,
}

/// Company KPIs from regulatory filings, scaled for display.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fundamentals {
    pub revenue_billions: Option<f64>,
    pub net_income_millions: Option<f64>,
    pub eps: Option<f64>,
    pub cash_billions: Option<f64>,
    pub debt_billions: Option<f64>,
}

impl Fundamentals {
    pub fn is_empty(&self) -> bool {
        self.revenue_billions.is_none()
            && self.net_income_millions.is_none()
            && self.eps.is_none()
            && self.cash_billions.is_none()
            && self.debt_billions.is_none()
    }
}

/// Append-only audit entry for a delivered alert.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationRecord {
    pub subscriber_id: i64,
    pub ticker: String,
    pub reasons: Vec<TriggerReason>,
    pub recommendation: Recommendation,
    pub confidence: f64,
    pub price: f64,
    pub sent_at: DateTime<Utc>,
}

/// Everything the data source returned for one ticker.
#[derive(Debug, Clone)]
pub struct MarketData {
    pub bars: Vec<PriceBar>,
    pub fundamentals: Option<Fundamentals>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn subscriber(active: bool, end: Option<DateTime<Utc>>) -> Subscriber {
        Subscriber {
            id: 1,
            contact: "42".into(),
            active,
            plan: "basic".into(),
            subscription_end: end,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn subscriber_activity_respects_flag_and_window() {
        let now = Utc::now();
        assert!(subscriber(true, None).is_active_at(now));
        assert!(subscriber(true, Some(now + Duration::days(1))).is_active_at(now));
        assert!(!subscriber(true, Some(now - Duration::days(1))).is_active_at(now));
        assert!(!subscriber(false, None).is_active_at(now));
    }

    #[test]
    fn cross_sign_undefined_without_both_emas() {
        let mut snap = IndicatorSnapshot {
            ticker: "AAPL".into(),
            timestamp: Utc::now(),
            price: 100.0,
            change_pct: None,
            rsi: Some(50.0),
            ema_short: Some(101.0),
            ema_long: None,
        };
        assert_eq!(snap.cross_sign(), None);
        assert_eq!(snap.undefined_fields(), vec!["ema_long"]);

        snap.ema_long = Some(100.0);
        assert_eq!(snap.cross_sign(), Some(CrossSign::Positive));
        snap.ema_long = Some(101.0);
        assert_eq!(snap.cross_sign(), None);
    }

    #[test]
    fn trigger_reason_serializes_snake_case() {
        let json = serde_json::to_string(&TriggerReason::RsiOversold).unwrap();
        assert_eq!(json, "\"rsi_oversold\"");
        assert_eq!(TriggerReason::GoldenCross.to_string(), "golden_cross");
    }

    #[test]
    fn recommendation_parses_uppercase_only() {
        let parsed: Recommendation = serde_json::from_str("\"WATCH\"").unwrap();
        assert_eq!(parsed, Recommendation::Watch);
        assert!(serde_json::from_str::<Recommendation>("\"WAIT\"").is_err());
        assert_eq!(Recommendation::from_str("SELL"), Some(Recommendation::Sell));
    }

    #[test]
    fn cooldown_expiry_is_latest_entry() {
        let now = Utc::now();
        let mut cooldowns = BTreeMap::new();
        cooldowns.insert(TriggerReason::PriceMove, now + Duration::minutes(5));
        cooldowns.insert(TriggerReason::GoldenCross, now + Duration::minutes(30));
        let state = GateState {
            last_notified_price: 100.0,
            last_rsi_zone: RsiZone::Neutral,
            last_cross_sign: None,
            cooldowns,
            last_recommendation: None,
            updated_at: now,
        };
        assert_eq!(state.cooldown_expiry(), Some(now + Duration::minutes(30)));
        assert!(state.in_cooldown(TriggerReason::PriceMove, now));
        assert!(!state.in_cooldown(TriggerReason::RsiOversold, now));
    }
}
