use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Days, NaiveTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Earliest configured wall-clock time (UTC) strictly after `now`.
pub fn next_run_after(now: DateTime<Utc>, times: &[NaiveTime]) -> Option<DateTime<Utc>> {
    let today = now.date_naive();
    let tomorrow = today.checked_add_days(Days::new(1))?;
    [today, tomorrow]
        .into_iter()
        .flat_map(|day| times.iter().map(move |t| day.and_time(*t).and_utc()))
        .filter(|at| *at > now)
        .min()
}

/// Runs `job` at each configured time until `cancel` fires.
///
/// A job that overruns the next slot delays it rather than overlapping.
pub async fn serve<F, Fut>(times: &[NaiveTime], cancel: &CancellationToken, mut job: F)
where
    F: FnMut(DateTime<Utc>) -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        let now = Utc::now();
        let Some(next) = next_run_after(now, times) else {
            tracing::warn!("no run times configured, scheduler idle");
            cancel.cancelled().await;
            return;
        };
        let delay = (next - now).to_std().unwrap_or(Duration::ZERO);
        info!(next_run = %next, wait_secs = delay.as_secs(), "waiting for next run");

        tokio::select! {
            _ = cancel.cancelled() => {
                info!("scheduler stopped");
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        job(next).await;
    }
}
