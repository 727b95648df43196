//! Test utilities for integration tests
#![allow(dead_code)]

use chatblock::ai::chat::DEFAULT_TEMPERATURE;
use chatblock::{Session, SessionBuilder};
use mockito::Matcher;
use serde_json::{Value, json};

pub const MODEL: &str = "gpt-4";
pub const SYSTEM_PROMPT: &str = "You are a test.";

/// Counts characters so budgets in tests don't depend on a tokenizer.
pub fn chars(text: &str) -> usize {
    text.chars().count()
}

/// A session pointed at the mock server at `url`.
pub fn test_session(url: &str) -> SessionBuilder {
    Session::builder(SYSTEM_PROMPT, "test-key", MODEL)
        .api_hostname(url)
        .cost_function(chars)
}

/// Builds `{"role": .., "content": ..}` messages from pairs.
pub fn messages(turns: &[(&str, &str)]) -> Value {
    Value::Array(
        turns
            .iter()
            .map(|(role, content)| json!({"role": role, "content": content}))
            .collect(),
    )
}

/// Matches a non-streaming request sending exactly `messages`.
pub fn request(messages: Value) -> Matcher {
    Matcher::Json(json!({
        "model": MODEL,
        "messages": messages,
        "temperature": DEFAULT_TEMPERATURE,
    }))
}

/// Matches a streaming request sending exactly `messages`.
pub fn stream_request(messages: Value) -> Matcher {
    Matcher::Json(json!({
        "model": MODEL,
        "messages": messages,
        "temperature": DEFAULT_TEMPERATURE,
        "stream": true,
    }))
}

pub fn completion_body(content: &str) -> String {
    completion_body_with_reason(content, "stop")
}

pub fn completion_body_with_reason(content: &str, finish_reason: &str) -> String {
    json!({
        "id": "chatcmpl-123",
        "object": "chat.completion",
        "created": 1694268190,
        "model": MODEL,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": finish_reason
        }]
    })
    .to_string()
}

/// An SSE body streaming `fragments` the way OpenAI does: a role
/// announcement, one chunk per fragment, an empty stop chunk and the
/// `[DONE]` marker.
pub fn sse_body(fragments: &[&str]) -> String {
    let chunk = |delta: Value, finish_reason: Value| {
        json!({
            "id": "chatcmpl-123",
            "object": "chat.completion.chunk",
            "created": 1694268190,
            "model": MODEL,
            "choices": [{"index": 0, "delta": delta, "finish_reason": finish_reason}]
        })
    };

    let mut body = format!(
        "data: {}\n\n",
        chunk(json!({"role": "assistant", "content": ""}), Value::Null)
    );
    for fragment in fragments {
        body.push_str(&format!(
            "data: {}\n\n",
            chunk(json!({"content": fragment}), Value::Null)
        ));
    }
    body.push_str(&format!("data: {}\n\n", chunk(json!({}), json!("stop"))));
    body.push_str("data: [DONE]\n\n");
    body
}
