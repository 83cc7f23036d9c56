use std::time::Duration;

use error_stack::{Report, ResultExt};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::NotifierConfig;
use crate::error::NotifyError;
use crate::notifier::MessagingChannel;

const CHANNEL: &str = "telegram";

/// Telegram Bot API `sendMessage` in HTML parse mode.
pub struct TelegramChannel {
    client: reqwest::Client,
    base_url: String,
    bot_token: String,
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'static str,
    disable_web_page_preview: bool,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

impl TelegramChannel {
    pub fn new(config: &NotifierConfig, bot_token: String) -> Result<Self, Report<NotifyError>> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .change_context(NotifyError::Delivery {
                channel: CHANNEL.into(),
            })?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            bot_token,
        })
    }
}

impl MessagingChannel for TelegramChannel {
    fn name(&self) -> &str {
        CHANNEL
    }

    fn send(
        &self,
        endpoint: &str,
        message: &str,
    ) -> BoxFuture<'_, Result<(), Report<NotifyError>>> {
        let chat_id = endpoint.to_string();
        let text = message.to_string();
        Box::pin(async move {
            let url = format!("{}/bot{}/sendMessage", self.base_url, self.bot_token);
            let body = SendMessage {
                chat_id: &chat_id,
                text: &text,
                parse_mode: "HTML",
                disable_web_page_preview: true,
            };

            // The token is part of the URL, so it is stripped from every error.
            let response = self
                .client
                .post(&url)
                .json(&body)
                .send()
                .await
                .map_err(reqwest::Error::without_url)
                .change_context(NotifyError::Delivery {
                    channel: CHANNEL.into(),
                })
                .attach_with(|| format!("chat_id: {chat_id}"))?;

            let status = response.status();
            let api: ApiResponse = response
                .json()
                .await
                .map_err(reqwest::Error::without_url)
                .change_context(NotifyError::Delivery {
                    channel: CHANNEL.into(),
                })?;

            if !status.is_success() || !api.ok {
                return Err(Report::new(NotifyError::Delivery {
                    channel: CHANNEL.into(),
                })
                .attach(format!("HTTP status: {status}"))
                .attach(format!(
                    "telegram: {}",
                    api.description.unwrap_or_else(|| "no description".into())
                )));
            }

            debug!(chat_id = %chat_id, chars = text.chars().count(), "telegram message sent");
            Ok(())
        })
    }
}
