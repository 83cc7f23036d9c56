use error_stack::Report;
use futures::future::BoxFuture;

use crate::error::NotifyError;
use crate::notifier::MessagingChannel;

/// Writes alerts to the log instead of delivering them. For local runs.
pub struct TerminalChannel;

impl MessagingChannel for TerminalChannel {
    fn name(&self) -> &str {
        "terminal"
    }

    fn send(
        &self,
        endpoint: &str,
        message: &str,
    ) -> BoxFuture<'_, Result<(), Report<NotifyError>>> {
        tracing::warn!(endpoint = endpoint, "ALERT:\n{}", message);
        Box::pin(async { Ok(()) })
    }
}
