pub mod openai;

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use error_stack::{Report, ResultExt, bail};
use futures::future::BoxFuture;
use serde::Deserialize;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::config::LlmConfig;
use crate::error::AnalysisError;
use crate::gate::GateDecision;
use crate::model::{
    AnalysisResult, Fundamentals, GateState, IndicatorSnapshot, PriceBar, Recommendation,
};
use crate::retry::{RetryPolicy, with_backoff};

const MAX_KEY_POINTS: usize = 5;

const PERSONA: &str = "\
You are a senior swing-trading analyst writing short alerts for retail investors.
Be direct and specific. Never promise returns.

Answer with a single JSON object and nothing else:
{
  \"ticker\": \"SYMBOL\",
  \"action\": \"BUY\" | \"SELL\" | \"HOLD\" | \"WATCH\",
  \"confidence\": number between 0 and 1,
  \"summary\": \"2-3 sentences explaining the situation\",
  \"key_points\": [\"at most five short points\"],
  \"invalidation\": \"condition that would invalidate this view\",
  \"risk_note\": \"one sentence on the main risk\"
}

Guidelines:
- BUY: price above both EMAs with supportive momentum, or an oversold bounce in an uptrend.
- SELL: price breaking below the EMAs, or strongly overbought momentum.
- HOLD: the existing trend continues without a fresh entry signal.
- WATCH: signals conflict or direction is unclear.";

/// A chat prompt: fixed persona plus per-pair context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

/// Text-completion backend.
///
/// Uses `BoxFuture` so the client can hold any backend as `dyn LanguageModel`.
pub trait LanguageModel: Send + Sync {
    fn complete(
        &self,
        prompt: &Prompt,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<String, Report<AnalysisError>>>;
}

/// Everything the prompt is built from for one pair.
pub struct AnalysisRequest<'a> {
    pub snapshot: &'a IndicatorSnapshot,
    pub bars: &'a [PriceBar],
    pub decision: &'a GateDecision,
    pub previous: Option<&'a GateState>,
    pub fundamentals: Option<&'a Fundamentals>,
}

/// Turns a significant gate decision into a validated recommendation.
pub struct AnalysisClient {
    model: Arc<dyn LanguageModel>,
    limiter: Arc<Semaphore>,
    retry: RetryPolicy,
    timeout: Duration,
    context_bars: usize,
    max_prompt_chars: usize,
}

impl AnalysisClient {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        config: &LlmConfig,
        llm_concurrency: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            model,
            limiter: Arc::new(Semaphore::new(llm_concurrency.max(1))),
            retry,
            timeout: Duration::from_secs(config.timeout_secs),
            context_bars: config.context_bars,
            max_prompt_chars: config.max_prompt_chars,
        }
    }

    pub async fn analyze(
        &self,
        request: &AnalysisRequest<'_>,
    ) -> Result<AnalysisResult, Report<AnalysisError>> {
        let ticker = request.snapshot.ticker.as_str();
        let prompt = build_prompt(request, self.context_bars, self.max_prompt_chars);
        debug!(ticker, chars = prompt.user.len(), "analysis prompt built");

        let text = with_backoff(&self.retry, "llm", AnalysisError::is_transient, |attempt| {
            let prompt = &prompt;
            async move {
                // Permit is held per attempt so backoff sleeps do not block other pairs.
                let _permit = self
                    .limiter
                    .acquire()
                    .await
                    .change_context(AnalysisError::Transport)?;
                debug!(ticker, attempt, "calling language model");
                match tokio::time::timeout(self.timeout, self.model.complete(prompt, self.timeout))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(Report::new(AnalysisError::Timeout)),
                }
            }
        })
        .await
        .attach_with(|| format!("ticker: {ticker}"))?;

        let result = parse_response(ticker, &text, Utc::now())?;
        info!(
            ticker,
            recommendation = %result.recommendation,
            confidence = result.confidence,
            "analysis complete"
        );
        Ok(result)
    }
}

/// Persona plus a context block bounded to `context_bars` bars and
/// `max_prompt_chars` characters. Bars go last, newest first, so truncation
/// drops the oldest history first.
pub fn build_prompt(
    request: &AnalysisRequest<'_>,
    context_bars: usize,
    max_prompt_chars: usize,
) -> Prompt {
    let s = request.snapshot;
    let mut user = String::new();

    let _ = writeln!(user, "Ticker: {}", s.ticker);
    let _ = writeln!(user, "As of: {}", s.timestamp.format("%Y-%m-%d"));
    let _ = writeln!(user, "Price: {:.2}", s.price);
    if let Some(change) = s.change_pct {
        let _ = writeln!(user, "Day change: {change:+.2}%");
    }
    let _ = writeln!(user, "RSI: {}", fmt_opt(s.rsi));
    let _ = writeln!(user, "EMA short: {}", fmt_opt(s.ema_short));
    let _ = writeln!(user, "EMA long: {}", fmt_opt(s.ema_long));

    let reasons: Vec<&str> = request.decision.reasons.iter().map(|r| r.as_str()).collect();
    let _ = writeln!(user, "Triggered by: {}", reasons.join(", "));

    match request.previous {
        Some(prev) => {
            if prev.last_notified_price > 0.0 {
                let moved = (s.price - prev.last_notified_price) / prev.last_notified_price * 100.0;
                let _ = writeln!(
                    user,
                    "Since last alert ({}): price {:.2} -> {:.2} ({moved:+.2}%), RSI zone was {}",
                    prev.updated_at.format("%Y-%m-%d"),
                    prev.last_notified_price,
                    s.price,
                    prev.last_rsi_zone,
                );
            }
            if let Some(rec) = prev.last_recommendation {
                let _ = writeln!(user, "Previous recommendation: {rec}");
            }
        }
        None => {
            let _ = writeln!(user, "No previous alert for this ticker.");
        }
    }

    if let Some(f) = request.fundamentals {
        let _ = writeln!(user, "Fundamentals (latest filing):");
        let rows = [
            ("Revenue ($B)", f.revenue_billions),
            ("Net income ($M)", f.net_income_millions),
            ("EPS", f.eps),
            ("Cash ($B)", f.cash_billions),
            ("Debt ($B)", f.debt_billions),
        ];
        for (label, value) in rows {
            if let Some(value) = value {
                let _ = writeln!(user, "  {label}: {value:.2}");
            }
        }
    }

    let start = request.bars.len().saturating_sub(context_bars);
    let recent = &request.bars[start..];
    if !recent.is_empty() {
        let _ = writeln!(
            user,
            "Recent daily bars (date open high low close volume), newest first:"
        );
        for bar in recent.iter().rev() {
            let _ = writeln!(
                user,
                "{} {:.2} {:.2} {:.2} {:.2} {:.0}",
                bar.timestamp.format("%Y-%m-%d"),
                bar.open,
                bar.high,
                bar.low,
                bar.close,
                bar.volume
            );
        }
    }

    Prompt {
        system: PERSONA.to_string(),
        user: truncate_chars(user, max_prompt_chars),
    }
}

fn fmt_opt(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{v:.2}"))
}

fn truncate_chars(mut text: String, max_chars: usize) -> String {
    if let Some((idx, _)) = text.char_indices().nth(max_chars) {
        text.truncate(idx);
    }
    text
}

#[derive(Debug, Deserialize)]
struct RawAnalysis {
    #[serde(alias = "recommendation")]
    action: String,
    confidence: f64,
    #[serde(alias = "rationale")]
    summary: String,
    #[serde(default)]
    key_points: Vec<String>,
    #[serde(default)]
    invalidation: Option<String>,
    #[serde(default)]
    risk_note: Option<String>,
}

/// Removes a surrounding markdown code fence, with or without a language tag.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

/// Parses and validates a model answer. Anything off-schema is rejected.
pub fn parse_response(
    ticker: &str,
    text: &str,
    now: DateTime<Utc>,
) -> Result<AnalysisResult, Report<AnalysisError>> {
    let raw: RawAnalysis = serde_json::from_str(strip_code_fences(text))
        .change_context(AnalysisError::Parse {
            reason: "response is not the expected JSON object".into(),
        })
        .attach_with(|| format!("ticker: {ticker}"))?;

    let Some(recommendation) = Recommendation::from_str(raw.action.trim()) else {
        bail!(AnalysisError::Parse {
            reason: format!("unknown action {:?}", raw.action),
        });
    };
    if !(0.0..=1.0).contains(&raw.confidence) {
        bail!(AnalysisError::Parse {
            reason: format!("confidence {} outside [0, 1]", raw.confidence),
        });
    }
    let rationale = raw.summary.trim().to_string();
    if rationale.is_empty() {
        bail!(AnalysisError::Parse {
            reason: "empty summary".into(),
        });
    }

    let key_points = raw
        .key_points
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .take(MAX_KEY_POINTS)
        .collect();
    let non_empty = |s: Option<String>| s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());

    Ok(AnalysisResult {
        ticker: ticker.to_string(),
        recommendation,
        confidence: raw.confidence,
        rationale,
        key_points,
        invalidation: non_empty(raw.invalidation),
        risk_note: non_empty(raw.risk_note),
        generated_at: now,
    })
}
