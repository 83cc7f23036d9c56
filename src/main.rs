mod analysis;
mod config;
mod error;
mod gate;
mod indicator;
mod market;
mod model;
mod notifier;
mod pipeline;
mod retry;
mod scheduler;
mod storage;

use std::path::Path;
use std::sync::Arc;

use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use derive_more::{Display, Error};
use error_stack::{Report, ResultExt};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use analysis::AnalysisClient;
use analysis::openai::OpenAiChatModel;
use config::AppConfig;
use gate::Gate;
use indicator::IndicatorEngine;
use market::DataSource;
use notifier::telegram::TelegramChannel;
use notifier::terminal::TerminalChannel;
use notifier::{MessagingChannel, NotificationDispatcher};
use pipeline::{PipelineSettings, RunContext, RunMode, RunReport};
use storage::Store;
use storage::sqlite::SqliteStore;

#[derive(Debug, Display, Error)]
pub enum AppError {
    #[display("configuration error")]
    Config,
    #[display("storage error")]
    Storage,
    #[display("failed to set up run collaborators")]
    Setup,
    #[display("pipeline run failed")]
    Pipeline,
    #[display("no subscriber with contact {contact}")]
    UnknownSubscriber { contact: String },
}

#[derive(Parser)]
#[command(name = "market-oracle", about = "Gated stock watchlist analysis and alerts")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the pipeline at the configured times until ctrl+c
    Serve,
    /// Run the pipeline once now
    RunOnce {
        /// Evaluate the gate only: no analysis, no messages, no state changes
        #[arg(long)]
        dry_run: bool,
    },
    /// Add a subscriber, or renew and reactivate an existing one
    AddSubscriber {
        /// Channel address, e.g. a Telegram chat id
        contact: String,
        #[arg(long, default_value = "basic")]
        plan: String,
        /// Subscription length in days; open ended when omitted
        #[arg(long)]
        days: Option<i64>,
    },
    /// Deactivate a subscriber
    Deactivate { contact: String },
    /// Add tickers to a subscriber's watchlist
    Watch {
        contact: String,
        #[arg(required = true)]
        tickers: Vec<String>,
    },
    /// Remove a ticker from a subscriber's watchlist
    Unwatch { contact: String, ticker: String },
    /// Show subscribers, their watchlists and recent alerts
    List {
        #[arg(long, default_value_t = 10)]
        notifications: usize,
    },
}

#[tokio::main]
async fn main() {
    if let Err(report) = run().await {
        eprintln!("{report:?}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Report<AppError>> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = config::load(Path::new(&cli.config)).change_context(AppError::Config)?;

    init_tracing(&config);

    let db_path = Path::new(&config.general.data_dir).join("market-oracle.db");
    let store: Arc<dyn Store> = Arc::new(
        SqliteStore::open(&db_path)
            .await
            .change_context(AppError::Storage)?,
    );

    match cli.command {
        Command::Serve => serve(&config, store).await,
        Command::RunOnce { dry_run } => {
            let mode = if dry_run {
                RunMode::DryRun
            } else {
                RunMode::Live
            };
            let report = run_pipeline(&config, store, mode, &CancellationToken::new()).await?;
            print_report(&report);
            Ok(())
        }
        Command::AddSubscriber {
            contact,
            plan,
            days,
        } => {
            let end = days.map(|d| Utc::now() + Duration::days(d));
            let sub = store
                .upsert_subscriber(&contact, &plan, end)
                .await
                .change_context(AppError::Storage)?;
            println!(
                "subscriber {} ({}) plan={} until={}",
                sub.id,
                sub.contact,
                sub.plan,
                sub.subscription_end
                    .map_or_else(|| "open".to_string(), |e| e.to_rfc3339())
            );
            Ok(())
        }
        Command::Deactivate { contact } => {
            let found = store
                .deactivate_subscriber(&contact)
                .await
                .change_context(AppError::Storage)?;
            if !found {
                return Err(Report::new(AppError::UnknownSubscriber { contact }));
            }
            println!("deactivated {contact}");
            Ok(())
        }
        Command::Watch { contact, tickers } => {
            let sub = find_subscriber(store.as_ref(), &contact).await?;
            for ticker in &tickers {
                let added = store
                    .watch(sub.id, ticker)
                    .await
                    .change_context(AppError::Storage)?;
                let ticker = storage::normalize_ticker(ticker);
                if added {
                    println!("{contact}: watching {ticker}");
                } else {
                    println!("{contact}: already watching {ticker}");
                }
            }
            Ok(())
        }
        Command::Unwatch { contact, ticker } => {
            let sub = find_subscriber(store.as_ref(), &contact).await?;
            let removed = store
                .unwatch(sub.id, &ticker)
                .await
                .change_context(AppError::Storage)?;
            let ticker = storage::normalize_ticker(&ticker);
            if removed {
                println!("{contact}: stopped watching {ticker}");
            } else {
                println!("{contact}: was not watching {ticker}");
            }
            Ok(())
        }
        Command::List { notifications } => list(store.as_ref(), notifications).await,
    }
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::new(&config.general.log_level);
    match config.general.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .init();
        }
        _ => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}

/// Builds a fresh context for one run. Secrets are read here so a rotated
/// key is picked up by the next scheduled run.
fn build_context(
    config: &AppConfig,
    store: Arc<dyn Store>,
    mode: RunMode,
) -> Result<RunContext, Report<AppError>> {
    let data = DataSource::from_config(&config.market_data).change_context(AppError::Setup)?;

    let engine = IndicatorEngine::new(
        config.indicators.rsi_period,
        config.indicators.ema_short_period,
        config.indicators.ema_long_period,
    )
    .change_context(AppError::Config)?;

    let (analysis, dispatcher) = delivery(config, mode)?;

    Ok(RunContext {
        store,
        data,
        engine,
        gate: Gate::new(&config.gate),
        analysis,
        dispatcher,
        settings: PipelineSettings::from_config(config),
    })
}

/// Model client and dispatcher. A dry run never reaches either, so it runs
/// without credentials and with the terminal channel.
fn delivery(
    config: &AppConfig,
    mode: RunMode,
) -> Result<(AnalysisClient, NotificationDispatcher), Report<AppError>> {
    let api_key = match mode {
        RunMode::Live => {
            config::secret_from_env(&config.llm.api_key_env).change_context(AppError::Config)?
        }
        RunMode::DryRun => String::new(),
    };
    let model = OpenAiChatModel::new(&config.llm, api_key).change_context(AppError::Setup)?;
    let analysis = AnalysisClient::new(
        Arc::new(model),
        &config.llm,
        config.pipeline.llm_concurrency,
        config.pipeline.llm_retry.policy(),
    );

    let channel: Arc<dyn MessagingChannel> = match (mode, config.notifier.channel.as_str()) {
        (RunMode::Live, "telegram") => {
            let token = config::secret_from_env(&config.notifier.bot_token_env)
                .change_context(AppError::Config)?;
            Arc::new(TelegramChannel::new(&config.notifier, token).change_context(AppError::Setup)?)
        }
        _ => Arc::new(TerminalChannel),
    };
    let dispatcher = NotificationDispatcher::new(
        channel,
        config.pipeline.dispatch_retry.policy(),
        config.notifier.max_message_len,
    );

    Ok((analysis, dispatcher))
}

async fn run_pipeline(
    config: &AppConfig,
    store: Arc<dyn Store>,
    mode: RunMode,
    cancel: &CancellationToken,
) -> Result<RunReport, Report<AppError>> {
    let ctx = build_context(config, store, mode)?;
    pipeline::run(&ctx, mode, cancel)
        .await
        .change_context(AppError::Pipeline)
}

async fn serve(config: &AppConfig, store: Arc<dyn Store>) -> Result<(), Report<AppError>> {
    // Fail fast on setup problems instead of at the first scheduled slot.
    build_context(config, Arc::clone(&store), RunMode::Live)?;

    let times = config.schedule.parsed_run_times();
    let cancel = CancellationToken::new();

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl+c received, shutting down");
        }
        shutdown.cancel();
    });

    info!(run_times = ?config.schedule.run_times, "scheduler started");
    scheduler::serve(&times, &cancel, |slot| {
        let store = Arc::clone(&store);
        let cancel = cancel.clone();
        async move {
            info!(slot = %slot, "scheduled run starting");
            match run_pipeline(config, store, RunMode::Live, &cancel).await {
                Ok(report) => info!(summary = %report, "scheduled run complete"),
                Err(e) => tracing::error!(error = ?e, "scheduled run failed"),
            }
        }
    })
    .await;

    info!("shutdown complete");
    Ok(())
}

async fn find_subscriber(
    store: &dyn Store,
    contact: &str,
) -> Result<model::Subscriber, Report<AppError>> {
    store
        .get_subscriber(contact)
        .await
        .change_context(AppError::Storage)?
        .ok_or_else(|| {
            Report::new(AppError::UnknownSubscriber {
                contact: contact.to_string(),
            })
        })
}

async fn list(store: &dyn Store, notifications: usize) -> Result<(), Report<AppError>> {
    let now = Utc::now();
    for sub in store
        .list_subscribers()
        .await
        .change_context(AppError::Storage)?
    {
        let tickers: Vec<String> = store
            .portfolio(sub.id)
            .await
            .change_context(AppError::Storage)?
            .into_iter()
            .map(|e| format!("{}({})", e.ticker, e.watched_since.format("%m-%d")))
            .collect();
        let status = if sub.is_active_at(now) { "active" } else { "inactive" };
        println!(
            "{:>4}  {:<16} {:<8} {:<8} since {}  {}",
            sub.id,
            sub.contact,
            status,
            sub.plan,
            sub.created_at.format("%Y-%m-%d"),
            tickers.join(",")
        );
    }

    let recent = store
        .recent_notifications(notifications)
        .await
        .change_context(AppError::Storage)?;
    if !recent.is_empty() {
        println!("\nrecent alerts:");
        for n in recent {
            let reasons: Vec<&str> = n.reasons.iter().map(|r| r.as_str()).collect();
            println!(
                "  {}  sub={} {} {} ({:.0}%) @ {:.2} [{}]",
                n.sent_at.format("%Y-%m-%d %H:%M"),
                n.subscriber_id,
                n.ticker,
                n.recommendation,
                n.confidence * 100.0,
                n.price,
                reasons.join(", ")
            );
        }
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    let elapsed = report.finished_at - report.started_at;
    println!(
        "run {} ({:?}, {}s): {report}",
        report.run_id,
        report.mode,
        elapsed.num_seconds()
    );
    for p in &report.pairs {
        match &p.outcome {
            pipeline::PairOutcome::Failed { stage, .. } => println!(
                "  sub={} {:<8} failed at {stage}",
                p.pair.subscriber_id, p.pair.ticker
            ),
            outcome => println!(
                "  sub={} {:<8} {}",
                p.pair.subscriber_id,
                p.pair.ticker,
                outcome.label()
            ),
        }
    }
}
