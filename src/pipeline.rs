use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use error_stack::{Report, ResultExt};
use futures::StreamExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::analysis::{AnalysisClient, AnalysisRequest};
use crate::config::AppConfig;
use crate::error::{MarketDataError, PipelineError};
use crate::gate::Gate;
use crate::indicator::IndicatorEngine;
use crate::market::DataSource;
use crate::model::{MarketData, NotificationRecord, Recommendation, TriggerReason, WatchPair};
use crate::notifier::{Alert, NotificationDispatcher};
use crate::retry::{RetryPolicy, with_backoff};
use crate::storage::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Full flow: analysis, delivery and state commit.
    Live,
    /// Fetch, indicators and gate only. Nothing is called, sent or written.
    DryRun,
}

/// Where a pair's processing stopped with an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    Fetch,
    StateLoad,
    Analysis,
    Dispatch,
    StateCommit,
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Fetch => "fetch",
            Self::StateLoad => "state_load",
            Self::Analysis => "analysis",
            Self::Dispatch => "dispatch",
            Self::StateCommit => "state_commit",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PairOutcome {
    /// Gate stayed closed. Reasons still cooling down are listed.
    Quiet { suppressed: Vec<TriggerReason> },
    Notified {
        reasons: Vec<TriggerReason>,
        recommendation: Recommendation,
    },
    DryRunSignificant { reasons: Vec<TriggerReason> },
    /// Not enough history for every indicator to be defined, or no data at
    /// all for the ticker.
    Skipped { undefined: Vec<&'static str> },
    Failed { stage: FailureStage, error: String },
    /// The run was cancelled or timed out before this pair started.
    NotScheduled,
}

impl PairOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Quiet { .. } => "quiet",
            Self::Notified { .. } => "notified",
            Self::DryRunSignificant { .. } => "dry_run_significant",
            Self::Skipped { .. } => "skipped",
            Self::Failed { .. } => "failed",
            Self::NotScheduled => "not_scheduled",
        }
    }

    fn failed_at(&self, at: FailureStage) -> bool {
        matches!(self, Self::Failed { stage, .. } if *stage == at)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PairReport {
    pub pair: WatchPair,
    pub outcome: PairOutcome,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Sorted by subscriber id, then ticker.
    pub pairs: Vec<PairReport>,
}

impl RunReport {
    pub fn count(&self, label: &str) -> usize {
        self.pairs
            .iter()
            .filter(|p| p.outcome.label() == label)
            .count()
    }

    #[cfg(test)]
    pub fn outcome_for(&self, subscriber_id: i64, ticker: &str) -> Option<&PairOutcome> {
        self.pairs
            .iter()
            .find(|p| p.pair.subscriber_id == subscriber_id && p.pair.ticker == ticker)
            .map(|p| &p.outcome)
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} pairs:", self.pairs.len())?;
        for label in [
            "notified",
            "dry_run_significant",
            "quiet",
            "skipped",
            "failed",
            "not_scheduled",
        ] {
            let n = self.count(label);
            if n > 0 {
                write!(f, " {label}={n}")?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub lookback_bars: usize,
    pub worker_concurrency: usize,
    pub run_timeout: Duration,
    pub fetch_retry: RetryPolicy,
}

impl PipelineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            lookback_bars: config.indicators.lookback_bars,
            worker_concurrency: config.pipeline.worker_concurrency,
            run_timeout: Duration::from_secs(config.pipeline.run_timeout_secs),
            fetch_retry: config.pipeline.fetch_retry.policy(),
        }
    }
}

/// Everything one run needs, built at run start and passed in explicitly.
pub struct RunContext {
    pub store: Arc<dyn Store>,
    pub data: DataSource,
    pub engine: IndicatorEngine,
    pub gate: Gate,
    pub analysis: AnalysisClient,
    pub dispatcher: NotificationDispatcher,
    pub settings: PipelineSettings,
}

/// Processes every active (subscriber, ticker) pair once.
///
/// Pair failures are isolated and reported. The run itself fails only when
/// pairs cannot be enumerated, or when every attempted pair failed at fetch
/// or at state load, which means a collaborator is down.
pub async fn run(
    ctx: &RunContext,
    mode: RunMode,
    cancel: &CancellationToken,
) -> Result<RunReport, Report<PipelineError>> {
    let run_id = Uuid::new_v4();
    let span = info_span!("run", run_id = %run_id, mode = ?mode);

    async move {
        let started_at = Utc::now();
        let deadline = Instant::now() + ctx.settings.run_timeout;

        let pairs = ctx
            .store
            .active_pairs(started_at)
            .await
            .change_context(PipelineError::Enumerate)?;
        info!(pairs = pairs.len(), "run started");

        let mut reports: Vec<PairReport> = futures::stream::iter(pairs)
            .map(|pair| async move {
                let outcome = if cancel.is_cancelled() || Instant::now() >= deadline {
                    PairOutcome::NotScheduled
                } else {
                    let span = info_span!(
                        "pair",
                        subscriber_id = pair.subscriber_id,
                        ticker = %pair.ticker
                    );
                    process_pair(ctx, &pair, mode).instrument(span).await
                };
                PairReport { pair, outcome }
            })
            .buffer_unordered(ctx.settings.worker_concurrency.max(1))
            .collect()
            .await;

        reports.sort_by(|a, b| {
            (a.pair.subscriber_id, &a.pair.ticker).cmp(&(b.pair.subscriber_id, &b.pair.ticker))
        });

        let report = RunReport {
            run_id,
            mode,
            started_at,
            finished_at: Utc::now(),
            pairs: reports,
        };

        check_collaborators(&report)?;
        info!(summary = %report, "run finished");
        Ok(report)
    }
    .instrument(span)
    .await
}

fn check_collaborators(report: &RunReport) -> Result<(), Report<PipelineError>> {
    let attempted: Vec<&PairOutcome> = report
        .pairs
        .iter()
        .map(|p| &p.outcome)
        .filter(|o| **o != PairOutcome::NotScheduled)
        .collect();
    if attempted.is_empty() {
        return Ok(());
    }

    let pairs = attempted.len();
    if attempted.iter().all(|o| o.failed_at(FailureStage::Fetch)) {
        error!(pairs, "every pair failed to fetch market data");
        return Err(Report::new(PipelineError::DataSourceUnavailable { pairs })
            .attach(format!("run {}: {report}", report.run_id)));
    }
    if attempted.iter().all(|o| o.failed_at(FailureStage::StateLoad)) {
        error!(pairs, "every pair failed to load gate state");
        return Err(Report::new(PipelineError::StoreUnavailable { pairs })
            .attach(format!("run {}: {report}", report.run_id)));
    }
    Ok(())
}

fn failed<C>(stage: FailureStage, report: &Report<C>) -> PairOutcome {
    warn!(stage = %stage, error = ?report, "pair failed");
    PairOutcome::Failed {
        stage,
        error: format!("{report:?}"),
    }
}

async fn process_pair(ctx: &RunContext, pair: &WatchPair, mode: RunMode) -> PairOutcome {
    let ticker = pair.ticker.as_str();

    let bars = match with_backoff(
        &ctx.settings.fetch_retry,
        "fetch",
        MarketDataError::is_transient,
        |_| ctx.data.get_bars(ticker, ctx.settings.lookback_bars),
    )
    .await
    {
        Ok(bars) => bars,
        // The source answered but has nothing for this ticker, e.g. delisted.
        Err(e) if matches!(e.current_context(), MarketDataError::NoData { .. }) => {
            warn!(error = ?e, "no market data for ticker, skipping");
            return PairOutcome::Skipped {
                undefined: vec!["price"],
            };
        }
        Err(e) => return failed(FailureStage::Fetch, &e),
    };

    let snapshot = match ctx.engine.snapshot(ticker, &bars) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!(error = ?e, "no usable bars");
            return PairOutcome::Skipped {
                undefined: vec!["price"],
            };
        }
    };
    let undefined = snapshot.undefined_fields();
    if !undefined.is_empty() {
        info!(
            bars = bars.len(),
            required = ctx.engine.required_bars(),
            ?undefined,
            "insufficient data, skipping"
        );
        return PairOutcome::Skipped { undefined };
    }

    let previous = match ctx.store.get_gate_state(pair.subscriber_id, ticker).await {
        Ok(previous) => previous,
        Err(e) => return failed(FailureStage::StateLoad, &e),
    };

    let now = Utc::now();
    let decision = ctx.gate.evaluate(&snapshot, previous.as_ref(), now);
    if !decision.is_significant() {
        debug!(
            suppressed = ?decision.suppressed,
            cooldown_until = ?previous.as_ref().and_then(|s| s.cooldown_expiry()),
            "gate closed"
        );
        return PairOutcome::Quiet {
            suppressed: decision.suppressed,
        };
    }

    if mode == RunMode::DryRun {
        info!(
            reasons = ?decision.reasons,
            price = snapshot.price,
            rsi = snapshot.rsi,
            "dry run: gate open"
        );
        return PairOutcome::DryRunSignificant {
            reasons: decision.reasons,
        };
    }
    info!(reason = ?decision.primary_reason(), reasons = ?decision.reasons, "gate open");

    let data = MarketData {
        fundamentals: ctx.data.fundamentals(ticker).await,
        bars,
    };

    let request = AnalysisRequest {
        snapshot: &snapshot,
        bars: &data.bars,
        decision: &decision,
        previous: previous.as_ref(),
        fundamentals: data.fundamentals.as_ref(),
    };
    let analysis = match ctx.analysis.analyze(&request).await {
        Ok(analysis) => analysis,
        Err(e) => return failed(FailureStage::Analysis, &e),
    };

    let alert = Alert {
        snapshot: &snapshot,
        decision: &decision,
        analysis: &analysis,
        previous: previous.as_ref(),
    };
    if let Err(e) = ctx.dispatcher.dispatch(&pair.contact, &alert).await {
        return failed(FailureStage::Dispatch, &e);
    }

    let committed_at = Utc::now();
    let next = ctx.gate.committed_state(
        previous.as_ref(),
        &snapshot,
        &decision,
        Some(analysis.recommendation),
        committed_at,
    );
    if let Err(e) = ctx
        .store
        .upsert_gate_state(pair.subscriber_id, ticker, &next)
        .await
    {
        // Delivered but not recorded: the next run will alert again.
        error!(error = ?e, "alert delivered but gate state not committed");
        return failed(FailureStage::StateCommit, &e);
    }

    let record = NotificationRecord {
        subscriber_id: pair.subscriber_id,
        ticker: ticker.to_string(),
        reasons: decision.reasons.clone(),
        recommendation: analysis.recommendation,
        confidence: analysis.confidence,
        price: snapshot.price,
        sent_at: committed_at,
    };
    if let Err(e) = ctx.store.log_notification(&record).await {
        warn!(error = ?e, "failed to append notification log (continuing)");
    }

    PairOutcome::Notified {
        reasons: decision.reasons,
        recommendation: analysis.recommendation,
    }
}
