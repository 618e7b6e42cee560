// OpenAI-compatible streaming chat client.
//
// One POST to `{base_url}/chat/completions` with `stream: true`, then an
// SSE body: `data: {json}` lines carrying content deltas, terminated by
// `data: [DONE]`. Deltas are written to the answer writer the moment they
// arrive. The initial connection is retried with backoff; once the first
// byte has streamed there are no retries.

use std::io::Write;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{CompletionRequest, CompletionResponse, SharedAnswerWriter, StreamingClient};
use crate::shell::assemble::role_for_kind;

const CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_BASE_DELAY_MS: u64 = 1000;
const REQUEST_TIMEOUT_SECS: u64 = 600;

pub struct OpenAiClient {
    client: Client,
    api_key: String,
    base_url: String,
}

impl OpenAiClient {
    pub fn new(api_key: String, base_url: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("failed to create HTTP client")?;
        Ok(Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Open the SSE stream, retrying transient connection failures.
    async fn connect(&self, body: &ChatRequest) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut last_error = None;
        for attempt in 0..CONNECT_ATTEMPTS {
            match self.connect_once(&url, body).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    last_error = Some(err);
                    if attempt < CONNECT_ATTEMPTS - 1 {
                        let delay =
                            Duration::from_millis(CONNECT_BASE_DELAY_MS * 2u64.pow(attempt));
                        tracing::warn!(
                            "completion request failed (attempt {}/{}), retrying in {:?}",
                            attempt + 1,
                            CONNECT_ATTEMPTS,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("completion request failed")))
    }

    async fn connect_once(&self, url: &str, body: &ChatRequest) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await
            .context("failed to send completion request")?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            bail!("completion API error {}: {}", status, error_body.trim());
        }
        Ok(response)
    }
}

#[async_trait]
impl StreamingClient for OpenAiClient {
    async fn completion_stream(
        &self,
        request: &CompletionRequest,
        writer: SharedAnswerWriter,
    ) -> Result<CompletionResponse> {
        let body = build_chat_request(request);
        if request.verbose {
            tracing::info!(
                "completion request: model={} messages={} max_tokens={}",
                body.model,
                body.messages.len(),
                request.max_tokens
            );
        }

        let response = tokio::select! {
            _ = request.cancel.cancelled() => {
                tracing::debug!("completion canceled before connecting");
                return Ok(CompletionResponse::default());
            }
            connected = self.connect(&body) => connected?,
        };

        let mut stream = response.bytes_stream();
        let mut line_buffer: Vec<u8> = Vec::new();
        let mut completion = String::new();

        loop {
            let chunk = tokio::select! {
                _ = request.cancel.cancelled() => {
                    tracing::debug!("completion canceled mid-stream, keeping partial output");
                    return Ok(CompletionResponse { completion });
                }
                next = tokio::time::timeout(request.token_timeout, stream.next()) => match next {
                    Err(_) => bail!(
                        "no token received from the LLM within {:?}",
                        request.token_timeout
                    ),
                    Ok(None) => break,
                    Ok(Some(Err(err))) => return Err(err).context("completion stream failed"),
                    Ok(Some(Ok(bytes))) => bytes,
                },
            };

            line_buffer.extend_from_slice(&chunk);
            while let Some(newline) = line_buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = line_buffer.drain(..=newline).collect();
                let line = String::from_utf8_lossy(&line);
                match parse_sse_line(&line) {
                    SseEvent::Delta(delta) => {
                        let mut writer = writer.lock().unwrap();
                        writer.write_all(delta.as_bytes())?;
                        writer.flush()?;
                        drop(writer);
                        completion.push_str(&delta);
                    }
                    SseEvent::Done => return Ok(CompletionResponse { completion }),
                    SseEvent::Ignore => {}
                }
            }
        }

        Ok(CompletionResponse { completion })
    }
}

/// Map the request into chat-completions form: system message first, then
/// role-mapped history, then the prompt as the final user message.
fn build_chat_request(request: &CompletionRequest) -> ChatRequest {
    let mut messages = Vec::with_capacity(request.history_blocks.len() + 2);
    if !request.system_message.is_empty() {
        messages.push(ChatMessage {
            role: "system".to_string(),
            content: request.system_message.clone(),
        });
    }
    for block in &request.history_blocks {
        if let Some(role) = role_for_kind(block.kind) {
            messages.push(ChatMessage {
                role: role.to_string(),
                content: block.content.clone(),
            });
        }
    }
    messages.push(ChatMessage {
        role: "user".to_string(),
        content: request.prompt.clone(),
    });

    ChatRequest {
        model: request.model.clone(),
        messages,
        max_tokens: request.max_tokens,
        temperature: request.temperature,
        stream: true,
    }
}

enum SseEvent {
    Delta(String),
    Done,
    Ignore,
}

fn parse_sse_line(line: &str) -> SseEvent {
    let Some(payload) = line.trim_end_matches(['\r', '\n']).strip_prefix("data: ") else {
        return SseEvent::Ignore;
    };
    let payload = payload.trim();
    if payload == "[DONE]" {
        return SseEvent::Done;
    }
    let Ok(chunk) = serde_json::from_str::<ChatStreamChunk>(payload) else {
        return SseEvent::Ignore;
    };
    let delta = chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content);
    match delta {
        Some(content) if !content.is_empty() => SseEvent::Delta(content),
        _ => SseEvent::Ignore,
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: usize,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatStreamChunk {
    choices: Vec<ChatStreamChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatStreamChoice {
    delta: ChatDelta,
}

#[derive(Debug, Deserialize)]
struct ChatDelta {
    content: Option<String>,
}
