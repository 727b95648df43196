use std::time::Duration;

use anyhow::{Error, Result};
use futures::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub enum Role {
    #[serde(rename = "system")]
    System,
    #[serde(rename = "assistant")]
    Assistant,
    #[serde(rename = "user")]
    User,
}

/// A single turn of a conversation. Fields are private so a message
/// can't change after it was recorded.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Message {
    role: Role,
    content: String,
}

impl Message {
    pub fn new(role: Role, content: &str) -> Self {
        Message {
            role,
            content: content.to_string(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn content(&self) -> &str {
        &self.content
    }
}

/// Failures surfaced by the chat completion API.
///
/// These travel inside `anyhow::Error`, use `downcast_ref::<ApiError>()`
/// to tell them apart.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Authentication failed ({status}): {body}")]
    Authentication { status: StatusCode, body: String },
    #[error("Rate limited: {0}")]
    RateLimited(String),
    #[error("API returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("Malformed response: {0}")]
    Malformed(String),
    #[error("Unexpected finish reason: {0}")]
    Finish(String),
    #[error("Request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

fn endpoint(api_hostname: &str) -> String {
    format!("{}/v1/chat/completions", api_hostname.trim_end_matches('/'))
}

async fn send(
    url: &str,
    api_key: &str,
    payload: &Value,
    timeout: Duration,
) -> Result<reqwest::Response, ApiError> {
    let response = reqwest::Client::new()
        .post(url)
        .bearer_auth(api_key)
        .header("Content-Type", "application/json")
        .timeout(timeout)
        .json(payload)
        .send()
        .await?;

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let err = match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ApiError::Authentication { status, body }
        }
        StatusCode::TOO_MANY_REQUESTS => ApiError::RateLimited(body),
        _ => ApiError::Status { status, body },
    };
    Err(err)
}

// Only `stop` and `length` end a response normally. Anything else,
// e.g. `content_filter`, means the content can't be trusted.
fn check_finish_reason(finish_reason: Option<&str>) -> Result<(), ApiError> {
    match finish_reason {
        None | Some("stop") | Some("length") => Ok(()),
        Some(reason) => Err(ApiError::Finish(reason.to_string())),
    }
}

/// Requests the next message for `messages` and returns its content.
pub async fn completion(
    messages: &[Message],
    api_hostname: &str,
    api_key: &str,
    model: &str,
    temperature: f64,
) -> Result<String, Error> {
    let payload = json!({
        "model": model,
        "messages": messages,
        "temperature": temperature,
    });
    let response = send(
        &endpoint(api_hostname),
        api_key,
        &payload,
        Duration::from_secs(60 * 10),
    )
    .await?;

    let resp: Value = response
        .json()
        .await
        .map_err(|e| ApiError::Malformed(e.to_string()))?;
    let choice = &resp["choices"][0];
    check_finish_reason(choice["finish_reason"].as_str())?;

    let content = choice["message"]["content"]
        .as_str()
        .ok_or_else(|| ApiError::Malformed(format!("No message received. Resp:\n\n {}", resp)))?;

    Ok(content.to_string())
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Delta {
    Content { content: String },

    // Role announcements, reasoning and empty finish deltas
    Stop {},
}

#[derive(Debug, Deserialize)]
struct CompletionChunkChoice {
    delta: Delta,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    choices: Vec<CompletionChunkChoice>,
}

// Position of the blank line that ends the first complete SSE event
// in `buffer`, if any.
fn event_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

// The `data` field of an SSE event. Empty payloads and events without
// data (comments, keep-alives) yield `None`.
fn event_data(event: &str) -> Option<&str> {
    event
        .lines()
        .find_map(|line| line.strip_prefix("data:"))
        .map(str::trim)
        .filter(|data| !data.is_empty())
}

/// Requests the next message for `messages` as a stream of content
/// fragments.
///
/// Nothing happens until the stream is first polled, that's when the
/// request is sent. After that each poll reads from the response body
/// until the next fragment is available. The stream ends at `[DONE]`
/// or when a finish reason is received. A body that ends before either
/// is an `ApiError::Malformed` failure since the reply may be cut short.
pub fn completion_stream(
    messages: &[Message],
    api_hostname: &str,
    api_key: &str,
    model: &str,
    temperature: f64,
) -> BoxStream<'static, Result<String, Error>> {
    let payload = json!({
        "model": model,
        "messages": messages,
        "temperature": temperature,
        "stream": true,
    });
    let url = endpoint(api_hostname);
    let api_key = api_key.to_string();

    Box::pin(async_stream::try_stream! {
        let response = send(&url, &api_key, &payload, Duration::from_secs(60 * 5)).await?;
        let mut stream = response.bytes_stream();

        // Raw bytes are buffered rather than decoded per chunk since an
        // event, or a multi-byte character, can be split across chunks.
        let mut buffer: Vec<u8> = Vec::new();
        let mut finished = false;

        'outer: while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(ApiError::from)?;
            // CRLF framed events are read as LF framed. JSON payloads
            // never hold a raw carriage return.
            buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

            // Process all complete SSE events from the buffer
            while let Some(end) = event_end(&buffer) {
                let event: Vec<u8> = buffer.drain(..end + 2).collect();
                let event = std::str::from_utf8(&event)
                    .map_err(|e| ApiError::Malformed(e.to_string()))?;

                let data = match event_data(event) {
                    Some(data) => data,
                    None => continue,
                };
                tracing::debug!("Chunk: {}", data);

                // Handle the end of the stream
                if data == "[DONE]" {
                    finished = true;
                    break 'outer;
                }

                let chunk = serde_json::from_str::<CompletionChunk>(data)
                    .inspect_err(|e| {
                        tracing::error!("Parsing completion chunk failed for {}\nError:{}", data, e)
                    })
                    .map_err(|e| ApiError::Malformed(e.to_string()))?;

                // Usage reports come without choices
                let choice = match chunk.choices.first() {
                    Some(choice) => choice,
                    None => continue,
                };

                if let Delta::Content { content } = &choice.delta {
                    if !content.is_empty() {
                        yield content.clone();
                    }
                }

                if choice.finish_reason.is_some() {
                    check_finish_reason(choice.finish_reason.as_deref())?;
                    finished = true;
                    break 'outer;
                }
            }
        }

        if !finished {
            tracing::error!("Stream ended without [DONE], {} bytes left unread", buffer.len());
            Err::<(), _>(ApiError::Malformed("stream ended without [DONE]".to_string()))?;
        }
    })
}
