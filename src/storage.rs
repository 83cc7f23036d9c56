pub mod sqlite;

use chrono::{DateTime, Utc};
use error_stack::Report;
use futures::future::BoxFuture;

use crate::error::StorageError;
use crate::model::{GateState, NotificationRecord, PortfolioEntry, Subscriber, WatchPair};

/// Persistence for subscribers, their watchlists and per-pair gate state.
pub trait Store: Send + Sync {
    /// Creates the subscriber, or updates plan and window of an existing one
    /// with the same contact and reactivates it.
    fn upsert_subscriber(
        &self,
        contact: &str,
        plan: &str,
        subscription_end: Option<DateTime<Utc>>,
    ) -> BoxFuture<'_, Result<Subscriber, Report<StorageError>>>;

    /// Returns `false` if no subscriber has this contact.
    fn deactivate_subscriber(&self, contact: &str)
    -> BoxFuture<'_, Result<bool, Report<StorageError>>>;

    fn get_subscriber(
        &self,
        contact: &str,
    ) -> BoxFuture<'_, Result<Option<Subscriber>, Report<StorageError>>>;

    fn list_subscribers(&self) -> BoxFuture<'_, Result<Vec<Subscriber>, Report<StorageError>>>;

    /// Returns `false` if the ticker was already on the watchlist.
    fn watch(
        &self,
        subscriber_id: i64,
        ticker: &str,
    ) -> BoxFuture<'_, Result<bool, Report<StorageError>>>;

    /// Removes the ticker and its gate state. Returns `false` if it was not watched.
    fn unwatch(
        &self,
        subscriber_id: i64,
        ticker: &str,
    ) -> BoxFuture<'_, Result<bool, Report<StorageError>>>;

    fn portfolio(
        &self,
        subscriber_id: i64,
    ) -> BoxFuture<'_, Result<Vec<PortfolioEntry>, Report<StorageError>>>;

    /// Every (subscriber, ticker) pair whose subscriber is active at `now`.
    fn active_pairs(
        &self,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Vec<WatchPair>, Report<StorageError>>>;

    fn get_gate_state(
        &self,
        subscriber_id: i64,
        ticker: &str,
    ) -> BoxFuture<'_, Result<Option<GateState>, Report<StorageError>>>;

    /// Replaces the pair's state in a single statement.
    fn upsert_gate_state(
        &self,
        subscriber_id: i64,
        ticker: &str,
        state: &GateState,
    ) -> BoxFuture<'_, Result<(), Report<StorageError>>>;

    fn log_notification(
        &self,
        record: &NotificationRecord,
    ) -> BoxFuture<'_, Result<(), Report<StorageError>>>;

    fn recent_notifications(
        &self,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<NotificationRecord>, Report<StorageError>>>;
}

/// Tickers are stored upper case with surrounding whitespace removed.
pub fn normalize_ticker(ticker: &str) -> String {
    ticker.trim().to_uppercase()
}
