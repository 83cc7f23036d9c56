use chrono::{DateTime, Utc};
use error_stack::{Report, ResultExt};
use futures::future::BoxFuture;
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode},
};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use crate::error::StorageError;
use crate::model::{
    CrossSign, GateState, NotificationRecord, PortfolioEntry, Recommendation, RsiZone, Subscriber,
    TriggerReason, WatchPair,
};
use crate::storage::{Store, normalize_ticker};

type SubscriberRow = (i64, String, bool, String, Option<String>, String);

type GateStateRow = (f64, String, Option<i64>, String, Option<String>, String);

type NotificationRow = (i64, String, String, String, f64, f64, String);

const SUBSCRIBER_COLUMNS: &str = "id, contact, active, plan, subscription_end, created_at";

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) a SQLite database at `path` and run migrations.
    pub async fn open(path: &Path) -> Result<Self, Report<StorageError>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .change_context(StorageError::Migration)
                .attach_with(|| format!("cannot create data directory: {}", parent.display()))?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .change_context(StorageError::Migration)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePool::connect_with(opts)
            .await
            .change_context(StorageError::Migration)
            .attach_with(|| format!("database path: {}", path.display()))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .change_context(StorageError::Migration)?;

        Ok(Self { pool })
    }
}

fn parse_time(value: &str, column: &str) -> Result<DateTime<Utc>, Report<StorageError>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .change_context(StorageError::Corrupt {
            reason: format!("{column} is not an RFC 3339 timestamp"),
        })
        .attach_with(|| format!("value: {value}"))
}

fn subscriber_from_row(row: SubscriberRow) -> Result<Subscriber, Report<StorageError>> {
    let (id, contact, active, plan, end, created) = row;
    Ok(Subscriber {
        id,
        contact,
        active,
        plan,
        subscription_end: end
            .as_deref()
            .map(|e| parse_time(e, "subscription_end"))
            .transpose()?,
        created_at: parse_time(&created, "created_at")?,
    })
}

fn gate_state_from_row(row: GateStateRow) -> Result<GateState, Report<StorageError>> {
    let (price, zone, sign, cooldowns, recommendation, updated_at) = row;

    let last_rsi_zone = RsiZone::from_str(&zone).ok_or_else(|| {
        Report::new(StorageError::Corrupt {
            reason: format!("unknown rsi zone {zone:?}"),
        })
    })?;
    let last_cross_sign = match sign {
        Some(value) => Some(CrossSign::from_i64(value).ok_or_else(|| {
            Report::new(StorageError::Corrupt {
                reason: format!("invalid cross sign {value}"),
            })
        })?),
        None => None,
    };
    let cooldowns: BTreeMap<TriggerReason, DateTime<Utc>> = serde_json::from_str(&cooldowns)
        .change_context(StorageError::Corrupt {
            reason: "cooldowns is not a reason to timestamp map".into(),
        })?;
    let last_recommendation = match recommendation {
        Some(value) => Some(Recommendation::from_str(&value).ok_or_else(|| {
            Report::new(StorageError::Corrupt {
                reason: format!("unknown recommendation {value:?}"),
            })
        })?),
        None => None,
    };

    Ok(GateState {
        last_notified_price: price,
        last_rsi_zone,
        last_cross_sign,
        cooldowns,
        last_recommendation,
        updated_at: parse_time(&updated_at, "updated_at")?,
    })
}

fn notification_from_row(row: NotificationRow) -> Result<NotificationRecord, Report<StorageError>> {
    let (subscriber_id, ticker, reasons, recommendation, confidence, price, sent_at) = row;
    Ok(NotificationRecord {
        subscriber_id,
        ticker,
        reasons: serde_json::from_str(&reasons).change_context(StorageError::Corrupt {
            reason: "reasons is not a list of trigger reasons".into(),
        })?,
        recommendation: Recommendation::from_str(&recommendation).ok_or_else(|| {
            Report::new(StorageError::Corrupt {
                reason: format!("unknown recommendation {recommendation:?}"),
            })
        })?,
        confidence,
        price,
        sent_at: parse_time(&sent_at, "sent_at")?,
    })
}

impl Store for SqliteStore {
    fn upsert_subscriber(
        &self,
        contact: &str,
        plan: &str,
        subscription_end: Option<DateTime<Utc>>,
    ) -> BoxFuture<'_, Result<Subscriber, Report<StorageError>>> {
        let contact = contact.trim().to_string();
        let plan = plan.to_string();
        Box::pin(async move {
            let row: SubscriberRow = sqlx::query_as(&format!(
                "INSERT INTO subscribers (contact, active, plan, subscription_end, created_at) \
                 VALUES (?, 1, ?, ?, ?) \
                 ON CONFLICT(contact) DO UPDATE SET \
                 active = 1, plan = excluded.plan, subscription_end = excluded.subscription_end \
                 RETURNING {SUBSCRIBER_COLUMNS}"
            ))
            .bind(&contact)
            .bind(&plan)
            .bind(subscription_end.map(|end| end.to_rfc3339()))
            .bind(Utc::now().to_rfc3339())
            .fetch_one(&self.pool)
            .await
            .change_context(StorageError::Insert)
            .attach_with(|| format!("contact: {contact}"))?;

            subscriber_from_row(row)
        })
    }

    fn deactivate_subscriber(
        &self,
        contact: &str,
    ) -> BoxFuture<'_, Result<bool, Report<StorageError>>> {
        let contact = contact.trim().to_string();
        Box::pin(async move {
            let result = sqlx::query("UPDATE subscribers SET active = 0 WHERE contact = ?")
                .bind(&contact)
                .execute(&self.pool)
                .await
                .change_context(StorageError::Insert)?;
            Ok(result.rows_affected() > 0)
        })
    }

    fn get_subscriber(
        &self,
        contact: &str,
    ) -> BoxFuture<'_, Result<Option<Subscriber>, Report<StorageError>>> {
        let contact = contact.trim().to_string();
        Box::pin(async move {
            let row: Option<SubscriberRow> = sqlx::query_as(&format!(
                "SELECT {SUBSCRIBER_COLUMNS} FROM subscribers WHERE contact = ?"
            ))
            .bind(&contact)
            .fetch_optional(&self.pool)
            .await
            .change_context(StorageError::Query)?;

            row.map(subscriber_from_row).transpose()
        })
    }

    fn list_subscribers(&self) -> BoxFuture<'_, Result<Vec<Subscriber>, Report<StorageError>>> {
        Box::pin(async move {
            let rows: Vec<SubscriberRow> = sqlx::query_as(&format!(
                "SELECT {SUBSCRIBER_COLUMNS} FROM subscribers ORDER BY id ASC"
            ))
            .fetch_all(&self.pool)
            .await
            .change_context(StorageError::Query)?;

            rows.into_iter().map(subscriber_from_row).collect()
        })
    }

    fn watch(
        &self,
        subscriber_id: i64,
        ticker: &str,
    ) -> BoxFuture<'_, Result<bool, Report<StorageError>>> {
        let ticker = normalize_ticker(ticker);
        Box::pin(async move {
            let result = sqlx::query(
                "INSERT OR IGNORE INTO portfolio_entries (subscriber_id, ticker, watched_since) \
                 VALUES (?, ?, ?)",
            )
            .bind(subscriber_id)
            .bind(&ticker)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await
            .change_context(StorageError::Insert)
            .attach_with(|| format!("subscriber_id: {subscriber_id}, ticker: {ticker}"))?;
            Ok(result.rows_affected() > 0)
        })
    }

    fn unwatch(
        &self,
        subscriber_id: i64,
        ticker: &str,
    ) -> BoxFuture<'_, Result<bool, Report<StorageError>>> {
        let ticker = normalize_ticker(ticker);
        Box::pin(async move {
            let mut tx = self
                .pool
                .begin()
                .await
                .change_context(StorageError::Insert)?;

            sqlx::query("DELETE FROM gate_states WHERE subscriber_id = ? AND ticker = ?")
                .bind(subscriber_id)
                .bind(&ticker)
                .execute(&mut *tx)
                .await
                .change_context(StorageError::Insert)?;

            let result =
                sqlx::query("DELETE FROM portfolio_entries WHERE subscriber_id = ? AND ticker = ?")
                    .bind(subscriber_id)
                    .bind(&ticker)
                    .execute(&mut *tx)
                    .await
                    .change_context(StorageError::Insert)?;

            tx.commit().await.change_context(StorageError::Insert)?;
            Ok(result.rows_affected() > 0)
        })
    }

    fn portfolio(
        &self,
        subscriber_id: i64,
    ) -> BoxFuture<'_, Result<Vec<PortfolioEntry>, Report<StorageError>>> {
        Box::pin(async move {
            let rows: Vec<(i64, String, String)> = sqlx::query_as(
                "SELECT subscriber_id, ticker, watched_since FROM portfolio_entries \
                 WHERE subscriber_id = ? ORDER BY ticker ASC",
            )
            .bind(subscriber_id)
            .fetch_all(&self.pool)
            .await
            .change_context(StorageError::Query)?;

            rows.into_iter()
                .map(|(subscriber_id, ticker, since)| {
                    Ok(PortfolioEntry {
                        subscriber_id,
                        ticker,
                        watched_since: parse_time(&since, "watched_since")?,
                    })
                })
                .collect()
        })
    }

    fn active_pairs(
        &self,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Vec<WatchPair>, Report<StorageError>>> {
        Box::pin(async move {
            let rows: Vec<(i64, String, Option<String>, String)> = sqlx::query_as(
                "SELECT s.id, s.contact, s.subscription_end, p.ticker \
                 FROM portfolio_entries p \
                 JOIN subscribers s ON s.id = p.subscriber_id \
                 WHERE s.active = 1 \
                 ORDER BY s.id ASC, p.ticker ASC",
            )
            .fetch_all(&self.pool)
            .await
            .change_context(StorageError::Query)?;

            let mut pairs = Vec::with_capacity(rows.len());
            for (subscriber_id, contact, end, ticker) in rows {
                if let Some(end) = end
                    && parse_time(&end, "subscription_end")? <= now
                {
                    continue;
                }
                pairs.push(WatchPair {
                    subscriber_id,
                    contact,
                    ticker,
                });
            }
            Ok(pairs)
        })
    }

    fn get_gate_state(
        &self,
        subscriber_id: i64,
        ticker: &str,
    ) -> BoxFuture<'_, Result<Option<GateState>, Report<StorageError>>> {
        let ticker = normalize_ticker(ticker);
        Box::pin(async move {
            let row: Option<GateStateRow> = sqlx::query_as(
                "SELECT last_notified_price, last_rsi_zone, last_cross_sign, cooldowns, \
                 last_recommendation, updated_at \
                 FROM gate_states WHERE subscriber_id = ? AND ticker = ?",
            )
            .bind(subscriber_id)
            .bind(&ticker)
            .fetch_optional(&self.pool)
            .await
            .change_context(StorageError::Query)?;

            row.map(gate_state_from_row)
                .transpose()
                .attach_with(|| format!("subscriber_id: {subscriber_id}, ticker: {ticker}"))
        })
    }

    fn upsert_gate_state(
        &self,
        subscriber_id: i64,
        ticker: &str,
        state: &GateState,
    ) -> BoxFuture<'_, Result<(), Report<StorageError>>> {
        let ticker = normalize_ticker(ticker);
        let state = state.clone();
        Box::pin(async move {
            let cooldowns =
                serde_json::to_string(&state.cooldowns).change_context(StorageError::Insert)?;

            sqlx::query(
                "INSERT OR REPLACE INTO gate_states \
                 (subscriber_id, ticker, last_notified_price, last_rsi_zone, last_cross_sign, \
                 cooldowns, last_recommendation, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(subscriber_id)
            .bind(&ticker)
            .bind(state.last_notified_price)
            .bind(state.last_rsi_zone.as_str())
            .bind(state.last_cross_sign.map(CrossSign::as_i64))
            .bind(&cooldowns)
            .bind(state.last_recommendation.map(Recommendation::as_str))
            .bind(state.updated_at.to_rfc3339())
            .execute(&self.pool)
            .await
            .change_context(StorageError::Insert)
            .attach_with(|| format!("subscriber_id: {subscriber_id}, ticker: {ticker}"))?;
            Ok(())
        })
    }

    fn log_notification(
        &self,
        record: &NotificationRecord,
    ) -> BoxFuture<'_, Result<(), Report<StorageError>>> {
        let record = record.clone();
        Box::pin(async move {
            let reasons =
                serde_json::to_string(&record.reasons).change_context(StorageError::Insert)?;

            sqlx::query(
                "INSERT INTO notification_log \
                 (subscriber_id, ticker, reasons, recommendation, confidence, price, sent_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(record.subscriber_id)
            .bind(&record.ticker)
            .bind(&reasons)
            .bind(record.recommendation.as_str())
            .bind(record.confidence)
            .bind(record.price)
            .bind(record.sent_at.to_rfc3339())
            .execute(&self.pool)
            .await
            .change_context(StorageError::Insert)?;
            Ok(())
        })
    }

    fn recent_notifications(
        &self,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<NotificationRecord>, Report<StorageError>>> {
        Box::pin(async move {
            let rows: Vec<NotificationRow> = sqlx::query_as(
                "SELECT subscriber_id, ticker, reasons, recommendation, confidence, price, sent_at \
                 FROM notification_log \
                 ORDER BY id DESC \
                 LIMIT ?",
            )
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .change_context(StorageError::Query)?;

            rows.into_iter().map(notification_from_row).collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn in_memory_store() -> SqliteStore {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")
            .unwrap()
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(opts).await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        SqliteStore { pool }
    }

    fn sample_state(now: DateTime<Utc>) -> GateState {
        GateState {
            last_notified_price: 187.5,
            last_rsi_zone: RsiZone::Oversold,
            last_cross_sign: Some(CrossSign::Negative),
            cooldowns: BTreeMap::from([
                (TriggerReason::RsiOversold, now + Duration::hours(4)),
                (TriggerReason::PriceMove, now + Duration::hours(1)),
            ]),
            last_recommendation: Some(Recommendation::Watch),
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn upsert_subscriber_is_keyed_by_contact() {
        let store = in_memory_store().await;
        let first = store.upsert_subscriber("1001", "basic", None).await.unwrap();
        assert!(first.active);
        assert_eq!(first.plan, "basic");

        store.deactivate_subscriber("1001").await.unwrap();
        let end = Utc::now() + Duration::days(30);
        let second = store
            .upsert_subscriber("1001", "pro", Some(end))
            .await
            .unwrap();
        assert_eq!(second.id, first.id);
        assert!(second.active);
        assert_eq!(second.plan, "pro");
        assert!(second.subscription_end.is_some());

        assert_eq!(store.list_subscribers().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn deactivate_unknown_contact_reports_false() {
        let store = in_memory_store().await;
        assert!(!store.deactivate_subscriber("nobody").await.unwrap());
        assert!(store.get_subscriber("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn watch_normalizes_and_deduplicates() {
        let store = in_memory_store().await;
        let sub = store.upsert_subscriber("1001", "basic", None).await.unwrap();

        assert!(store.watch(sub.id, " aapl ").await.unwrap());
        assert!(!store.watch(sub.id, "AAPL").await.unwrap());
        assert!(store.watch(sub.id, "msft").await.unwrap());

        let tickers: Vec<String> = store
            .portfolio(sub.id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.ticker)
            .collect();
        assert_eq!(tickers, vec!["AAPL", "MSFT"]);
    }

    #[tokio::test]
    async fn active_pairs_skip_inactive_and_expired() {
        let store = in_memory_store().await;
        let now = Utc::now();

        let open = store.upsert_subscriber("open", "basic", None).await.unwrap();
        let expired = store
            .upsert_subscriber("expired", "basic", Some(now - Duration::days(1)))
            .await
            .unwrap();
        let inactive = store.upsert_subscriber("inactive", "basic", None).await.unwrap();
        store.deactivate_subscriber("inactive").await.unwrap();

        for id in [open.id, expired.id, inactive.id] {
            store.watch(id, "NVDA").await.unwrap();
        }

        let pairs = store.active_pairs(now).await.unwrap();
        assert_eq!(
            pairs,
            vec![WatchPair {
                subscriber_id: open.id,
                contact: "open".into(),
                ticker: "NVDA".into(),
            }]
        );
    }

    #[tokio::test]
    async fn gate_state_upsert_and_reload() {
        let store = in_memory_store().await;
        let sub = store.upsert_subscriber("1001", "basic", None).await.unwrap();
        store.watch(sub.id, "AAPL").await.unwrap();
        assert!(store.get_gate_state(sub.id, "AAPL").await.unwrap().is_none());

        // Second-precision so the RFC 3339 round trip compares equal
        let now = DateTime::from_timestamp(Utc::now().timestamp(), 0).unwrap();
        let state = sample_state(now);
        store.upsert_gate_state(sub.id, "AAPL", &state).await.unwrap();
        assert_eq!(
            store.get_gate_state(sub.id, "aapl").await.unwrap(),
            Some(state.clone())
        );

        let replaced = GateState {
            last_notified_price: 200.0,
            last_cross_sign: None,
            last_recommendation: None,
            ..state
        };
        store
            .upsert_gate_state(sub.id, "AAPL", &replaced)
            .await
            .unwrap();
        assert_eq!(
            store.get_gate_state(sub.id, "AAPL").await.unwrap(),
            Some(replaced)
        );
    }

    #[tokio::test]
    async fn unwatch_drops_gate_state() {
        let store = in_memory_store().await;
        let sub = store.upsert_subscriber("1001", "basic", None).await.unwrap();
        store.watch(sub.id, "AAPL").await.unwrap();
        store
            .upsert_gate_state(sub.id, "AAPL", &sample_state(Utc::now()))
            .await
            .unwrap();

        assert!(store.unwatch(sub.id, "aapl").await.unwrap());
        assert!(!store.unwatch(sub.id, "AAPL").await.unwrap());
        assert!(store.get_gate_state(sub.id, "AAPL").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_gate_state_is_reported() {
        let store = in_memory_store().await;
        let sub = store.upsert_subscriber("1001", "basic", None).await.unwrap();
        sqlx::query(
            "INSERT INTO gate_states \
             (subscriber_id, ticker, last_notified_price, last_rsi_zone, cooldowns, updated_at) \
             VALUES (?, 'AAPL', 1.0, 'sideways', '{}', '2024-01-01T00:00:00Z')",
        )
        .bind(sub.id)
        .execute(&store.pool)
        .await
        .unwrap();

        let err = store.get_gate_state(sub.id, "AAPL").await.unwrap_err();
        assert!(matches!(
            err.current_context(),
            StorageError::Corrupt { .. }
        ));
    }

    #[tokio::test]
    async fn notification_log_newest_first() {
        let store = in_memory_store().await;
        let sent_at = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        for (ticker, recommendation) in [("AAPL", Recommendation::Buy), ("MSFT", Recommendation::Hold)] {
            store
                .log_notification(&NotificationRecord {
                    subscriber_id: 1,
                    ticker: ticker.into(),
                    reasons: vec![TriggerReason::GoldenCross, TriggerReason::PriceMove],
                    recommendation,
                    confidence: 0.7,
                    price: 100.0,
                    sent_at,
                })
                .await
                .unwrap();
        }

        let log = store.recent_notifications(10).await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].ticker, "MSFT");
        assert_eq!(log[1].reasons, vec![TriggerReason::GoldenCross, TriggerReason::PriceMove]);
        assert_eq!(log[1].sent_at, sent_at);
    }
}
