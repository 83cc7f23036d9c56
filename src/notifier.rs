pub mod telegram;
pub mod terminal;

use std::fmt::Write as _;
use std::sync::Arc;

use error_stack::{Report, ResultExt};
use futures::future::BoxFuture;
use tracing::{debug, info};

use crate::error::NotifyError;
use crate::gate::GateDecision;
use crate::model::{AnalysisResult, GateState, IndicatorSnapshot, Recommendation};
use crate::retry::{RetryPolicy, with_backoff};

/// Delivery transport for formatted alerts.
pub trait MessagingChannel: Send + Sync {
    fn name(&self) -> &str;

    /// `endpoint` is the subscriber's channel address, e.g. a chat id.
    fn send(&self, endpoint: &str, message: &str)
    -> BoxFuture<'_, Result<(), Report<NotifyError>>>;
}

/// What a single alert message is rendered from.
pub struct Alert<'a> {
    pub snapshot: &'a IndicatorSnapshot,
    pub decision: &'a GateDecision,
    pub analysis: &'a AnalysisResult,
    pub previous: Option<&'a GateState>,
}

/// Formats alerts and pushes them through a channel, chunk by chunk.
pub struct NotificationDispatcher {
    channel: Arc<dyn MessagingChannel>,
    retry: RetryPolicy,
    max_message_len: usize,
}

impl NotificationDispatcher {
    pub fn new(channel: Arc<dyn MessagingChannel>, retry: RetryPolicy, max_message_len: usize) -> Self {
        Self {
            channel,
            retry,
            max_message_len,
        }
    }

    /// Sends every chunk of the rendered alert. Returns the number of chunks.
    ///
    /// A failure after some chunks went out still fails the whole dispatch;
    /// the next run re-sends the alert from the start.
    pub async fn dispatch(
        &self,
        endpoint: &str,
        alert: &Alert<'_>,
    ) -> Result<usize, Report<NotifyError>> {
        let message = format_alert(alert);
        let chunks = split_message(&message, self.max_message_len);
        let total = chunks.len();

        for (index, chunk) in chunks.iter().enumerate() {
            with_backoff(
                &self.retry,
                "dispatch",
                |_: &NotifyError| true,
                |attempt| {
                    debug!(
                        channel = self.channel.name(),
                        chunk = index + 1,
                        total,
                        attempt,
                        "sending chunk"
                    );
                    self.channel.send(endpoint, chunk)
                },
            )
            .await
            .attach_with(|| format!("chunk {} of {total}", index + 1))?;
        }

        info!(
            channel = self.channel.name(),
            ticker = %alert.snapshot.ticker,
            chunks = total,
            "alert delivered"
        );
        Ok(total)
    }
}

/// Escapes the characters Telegram's HTML parse mode treats as markup.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

fn badge(recommendation: Recommendation) -> &'static str {
    match recommendation {
        Recommendation::Buy => "🟢",
        Recommendation::Sell => "🔴",
        Recommendation::Hold => "🔵",
        Recommendation::Watch => "🟡",
    }
}

fn fmt_value(value: Option<f64>, precision: usize) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{v:.precision$}"))
}

/// Renders the alert as Telegram HTML. All dynamic text is escaped.
pub fn format_alert(alert: &Alert<'_>) -> String {
    let s = alert.snapshot;
    let a = alert.analysis;
    let mut out = String::new();

    let _ = writeln!(
        out,
        "<b>{}</b>: {} {} ({:.0}% confidence)",
        escape_html(&s.ticker),
        a.recommendation,
        badge(a.recommendation),
        a.confidence * 100.0
    );
    match s.change_pct {
        Some(change) => {
            let _ = writeln!(out, "Price: {:.2} ({change:+.2}%)", s.price);
        }
        None => {
            let _ = writeln!(out, "Price: {:.2}", s.price);
        }
    }
    let _ = writeln!(
        out,
        "RSI: {} | EMA short: {} | EMA long: {}",
        fmt_value(s.rsi, 1),
        fmt_value(s.ema_short, 2),
        fmt_value(s.ema_long, 2)
    );
    let reasons: Vec<&str> = alert.decision.reasons.iter().map(|r| r.as_str()).collect();
    let _ = writeln!(out, "Triggers: {}", reasons.join(", "));

    if let Some(prev) = alert.previous
        && prev.last_notified_price > 0.0
    {
        let moved = (s.price - prev.last_notified_price) / prev.last_notified_price * 100.0;
        let mut diff = format!(
            "Since last alert: {:.2} → {:.2} ({moved:+.2}%)",
            prev.last_notified_price, s.price
        );
        if let Some(rec) = prev.last_recommendation
            && rec != a.recommendation
        {
            let _ = write!(diff, ", was {rec}");
        }
        let _ = writeln!(out, "<i>{}</i>", escape_html(&diff));
    }

    let _ = writeln!(out, "---");
    let _ = writeln!(out, "{}", escape_html(&a.rationale));
    for point in &a.key_points {
        let _ = writeln!(out, "• {}", escape_html(point));
    }
    if let Some(invalidation) = &a.invalidation {
        let _ = writeln!(out, "<b>Invalidation:</b> {}", escape_html(invalidation));
    }
    if let Some(risk) = &a.risk_note {
        let _ = writeln!(out, "⚠️ {}", escape_html(risk));
    }
    let _ = writeln!(
        out,
        "<i>{} UTC</i>",
        a.generated_at.format("%Y-%m-%d %H:%M")
    );

    out.trim_end().to_string()
}

/// Splits `text` into chunks of at most `max_len` characters, preferring
/// newline boundaries. Leading whitespace of each continuation is dropped.
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    let max_len = max_len.max(1);
    let mut chunks = Vec::new();
    let mut rest = text;

    while !rest.is_empty() {
        let Some((limit, _)) = rest.char_indices().nth(max_len) else {
            chunks.push(rest.to_string());
            break;
        };
        let split_at = match rest[..limit].rfind('\n') {
            Some(idx) if idx > 0 => idx,
            _ => limit,
        };
        chunks.push(rest[..split_at].to_string());
        rest = rest[split_at..].trim_start();
    }

    chunks
}
