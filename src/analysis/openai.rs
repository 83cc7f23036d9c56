use std::time::Duration;

use error_stack::{Report, ResultExt};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::analysis::{LanguageModel, Prompt};
use crate::config::LlmConfig;
use crate::error::AnalysisError;

/// Chat-completions client for any OpenAI-compatible endpoint.
pub struct OpenAiChatModel {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    max_tokens: u32,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

impl OpenAiChatModel {
    pub fn new(config: &LlmConfig, api_key: String) -> Result<Self, Report<AnalysisError>> {
        let client = reqwest::Client::builder()
            .build()
            .change_context(AnalysisError::Transport)?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }

    fn request_body<'a>(&'a self, prompt: &'a Prompt) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: &prompt.system,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt.user,
                },
            ],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        }
    }
}

impl LanguageModel for OpenAiChatModel {
    fn complete(
        &self,
        prompt: &Prompt,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<String, Report<AnalysisError>>> {
        let prompt = prompt.clone();
        Box::pin(async move {
            let url = format!("{}/chat/completions", self.base_url);
            debug!(url = %url, model = %self.model, "sending chat completion");

            let response = self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .timeout(timeout)
                .json(&self.request_body(&prompt))
                .send()
                .await
                .map_err(transport_error)?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(Report::new(AnalysisError::Provider {
                    status: status.as_u16(),
                })
                .attach(format!("body: {}", body.chars().take(500).collect::<String>())));
            }

            // A body cut short is a transport failure and stays retryable.
            let body = response.text().await.map_err(transport_error)?;
            parse_envelope(&body)
        })
    }
}

fn transport_error(e: reqwest::Error) -> Report<AnalysisError> {
    let context = if e.is_timeout() {
        AnalysisError::Timeout
    } else {
        AnalysisError::Transport
    };
    Report::new(e).change_context(context)
}

fn parse_envelope(body: &str) -> Result<String, Report<AnalysisError>> {
    let parsed: ChatResponse =
        serde_json::from_str(body).change_context(AnalysisError::Parse {
            reason: "chat completion envelope".into(),
        })?;
    extract_content(parsed)
}

fn extract_content(response: ChatResponse) -> Result<String, Report<AnalysisError>> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .filter(|content| !content.trim().is_empty())
        .ok_or_else(|| {
            Report::new(AnalysisError::Parse {
                reason: "no content in chat completion".into(),
            })
        })
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    /// Accepts one connection, reads the request and answers with `raw`.
    async fn serve_once(raw: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                if request_complete(&request) {
                    break;
                }
            }
            socket.write_all(raw.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        });
        format!("http://{addr}")
    }

    fn request_complete(request: &[u8]) -> bool {
        let text = String::from_utf8_lossy(request);
        let Some(header_end) = text.find("\r\n\r\n") else {
            return false;
        };
        let length = text[..header_end]
            .lines()
            .find_map(|l| {
                let (name, value) = l.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())
                    .flatten()
            })
            .unwrap_or(0);
        request.len() >= header_end + 4 + length
    }

    fn model_at(base_url: String) -> OpenAiChatModel {
        let config = LlmConfig {
            base_url,
            ..LlmConfig::default()
        };
        OpenAiChatModel::new(&config, "sk-test".into()).unwrap()
    }

    fn prompt() -> Prompt {
        Prompt {
            system: "persona".into(),
            user: "context".into(),
        }
    }

    fn model() -> OpenAiChatModel {
        OpenAiChatModel::new(&LlmConfig::default(), "sk-test".into()).unwrap()
    }

    #[test]
    fn request_asks_for_json_object() {
        let m = model();
        let prompt = Prompt {
            system: "persona".into(),
            user: "context".into(),
        };
        let body = serde_json::to_value(m.request_body(&prompt)).unwrap();
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["response_format"]["type"], "json_object");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "context");
    }

    #[test]
    fn extracts_first_choice() {
        let response: ChatResponse = serde_json::from_str(
            r#"{"choices":[{"index":0,"message":{"role":"assistant","content":"{\"a\":1}"}}]}"#,
        )
        .unwrap();
        assert_eq!(extract_content(response).unwrap(), r#"{"a":1}"#);
    }

    #[tokio::test]
    async fn truncated_body_is_transport_error() {
        let base = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 200\r\n\r\n{\"choi",
        )
        .await;
        let err = model_at(base)
            .complete(&prompt(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(
            err.current_context(),
            AnalysisError::Transport | AnalysisError::Timeout
        ));
        assert!(err.current_context().is_transient());
    }

    #[tokio::test]
    async fn malformed_envelope_is_parse_error() {
        let base = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 8\r\nConnection: close\r\n\r\nnot json",
        )
        .await;
        let err = model_at(base)
            .complete(&prompt(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err.current_context(), AnalysisError::Parse { .. }));
    }

    #[tokio::test]
    async fn complete_returns_message_content() {
        let base = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 42\r\nConnection: close\r\n\r\n{\"choices\":[{\"message\":{\"content\":\"ok\"}}]}",
        )
        .await;
        let text = model_at(base)
            .complete(&prompt(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(text, "ok");
    }

    #[test]
    fn missing_content_is_parse_error() {
        let response: ChatResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"content":null}}]}"#).unwrap();
        let err = extract_content(response).unwrap_err();
        assert!(matches!(err.current_context(), AnalysisError::Parse { .. }));

        let empty: ChatResponse = serde_json::from_str(r#"{"choices":[]}"#).unwrap();
        assert!(extract_content(empty).is_err());
    }
}
