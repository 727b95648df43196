use std::fmt;
use std::time::Instant;

use anyhow::{Error, Result, bail};
use futures::stream::BoxStream;
use futures_util::StreamExt;
use serde_json::Value;

use super::models::History;
use crate::ai::prompt::Preprocessor;
use crate::openai::tokens::{CostFn, DEFAULT_CONTEXT_WINDOW, context_window, token_counter};
use crate::openai::{Message, Role, completion, completion_stream};

pub const DEFAULT_API_HOSTNAME: &str = "https://api.openai.com";
pub const DEFAULT_MAX_OUTPUT_TOKENS: usize = 400;
// Low temperature keeps answers stable between runs
pub const DEFAULT_TEMPERATURE: f64 = 0.001;

/// Decides what happens when the chat completion API fails. Returning
/// `Some` replaces the failed response, `None` passes the error on to
/// the caller.
pub type ErrorHandler = Box<dyn Fn(&Error) -> Option<String> + Send + Sync>;

fn propagate(_err: &Error) -> Option<String> {
    None
}

/// Settings fixed when the session is built.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionConfig {
    pub api_hostname: String,
    pub api_key: String,
    pub model: String,
    pub streaming: bool,
    pub temperature: f64,
    pub max_output_tokens: usize,
    pub max_history_cost: usize,
}

/// The response to a call to `Session::invoke`.
pub enum Reply<'a> {
    /// The full response.
    Text(String),
    /// Response fragments in the order they arrive. The session stays
    /// borrowed until the stream is dropped and the reply is only
    /// added to the history once the stream is exhausted.
    Stream(BoxStream<'a, Result<String>>),
}

impl Reply<'_> {
    /// Waits for the whole response, draining the stream if needed.
    pub async fn into_text(self) -> Result<String> {
        match self {
            Reply::Text(text) => Ok(text),
            Reply::Stream(mut fragments) => {
                let mut text = String::new();
                while let Some(fragment) = fragments.next().await {
                    text.push_str(&fragment?);
                }
                Ok(text)
            }
        }
    }
}

impl fmt::Debug for Reply<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Reply::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Reply::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// A conversation with an LLM over an OpenAI compatible chat
/// completion API.
///
/// Every call sends the system prompt, then the examples, then as
/// much of the history as fits in `max_history_cost`. Older turns are
/// trimmed first. The system prompt and examples are never trimmed.
///
/// Use `Session::builder()` to construct a valid `Session`.
pub struct Session {
    config: SessionConfig,
    system_prompt: Message,
    examples: Vec<Message>,
    history: History,
    answer: String,
    cost: CostFn,
    preprocessor: Preprocessor,
    on_error: ErrorHandler,
}

impl Session {
    pub fn builder(system_prompt: &str, api_key: &str, model: &str) -> SessionBuilder {
        SessionBuilder::new(system_prompt, api_key, model)
    }

    /// Same as `invoke` without any arguments for the preprocessor.
    pub async fn ask(&mut self, input: &str) -> Result<Reply<'_>> {
        self.invoke(input, &Value::Null).await
    }

    /// Runs the next turn of the conversation.
    ///
    /// `input` and `args` go through the preprocessor and the result
    /// is added to the history as the user message, which stays there
    /// even if the API call fails. The history is then trimmed to the
    /// budget and sent along with the system prompt and examples.
    pub async fn invoke(&mut self, input: &str, args: &Value) -> Result<Reply<'_>> {
        let request = self.preprocessor.apply(input, args)?;
        self.history.push(Message::new(Role::User, &request));
        self.trim_history();

        let messages = self.messages();
        if self.config.streaming {
            Ok(Reply::Stream(self.reply_stream(messages)))
        } else {
            self.reply(messages).await.map(Reply::Text)
        }
    }

    /// Clears the history and the last answer. The system prompt,
    /// examples and configuration are kept.
    pub fn reset(&mut self) {
        self.history.clear();
        self.answer.clear();
    }

    /// The last complete response added to the history. Empty until
    /// the first response and after a reset.
    pub fn answer(&self) -> &str {
        &self.answer
    }

    pub fn history(&self) -> &[Message] {
        self.history.messages()
    }

    /// Cost of the history alone, without the system prompt and
    /// examples.
    pub fn history_cost(&self) -> usize {
        self.history.cost(&self.cost)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The system prompt, examples and history in the order they are
    /// sent to the API.
    pub fn messages(&self) -> Vec<Message> {
        let mut messages = Vec::with_capacity(1 + self.examples.len() + self.history.len());
        messages.push(self.system_prompt.clone());
        messages.extend(self.examples.iter().cloned());
        messages.extend(self.history.iter().cloned());
        messages
    }

    fn trim_history(&mut self) {
        let fixed_cost = (self.cost)(self.system_prompt.content())
            + self
                .examples
                .iter()
                .map(|m| (self.cost)(m.content()))
                .sum::<usize>();
        let budget = self.config.max_history_cost;

        let removed = self.history.trim(budget, fixed_cost, &self.cost);
        if removed > 0 {
            tracing::info!(
                "History trimmed by {} messages. New length: {}. Available length: {}",
                removed,
                fixed_cost + self.history.cost(&self.cost),
                budget
            );
        }
    }

    fn commit(&mut self, content: String) {
        self.history.push(Message::new(Role::Assistant, &content));
        self.answer = content;
    }

    fn recover(&self, err: Error) -> Result<String> {
        tracing::error!("Chat completion failed: {}", err);
        match (self.on_error)(&err) {
            Some(fallback) => Ok(fallback),
            None => Err(err),
        }
    }

    async fn reply(&mut self, messages: Vec<Message>) -> Result<String> {
        let start = Instant::now();
        let resp = completion(
            &messages,
            &self.config.api_hostname,
            &self.config.api_key,
            &self.config.model,
            self.config.temperature,
        )
        .await;
        tracing::debug!("Time waiting for api: {:.3}s", start.elapsed().as_secs_f64());

        match resp {
            Ok(content) => {
                self.commit(content.clone());
                Ok(content)
            }
            Err(err) => self.recover(err),
        }
    }

    fn reply_stream(&mut self, messages: Vec<Message>) -> BoxStream<'_, Result<String>> {
        let mut upstream = completion_stream(
            &messages,
            &self.config.api_hostname,
            &self.config.api_key,
            &self.config.model,
            self.config.temperature,
        );

        Box::pin(async_stream::try_stream! {
            let start = Instant::now();
            let mut content = String::new();

            while let Some(fragment) = upstream.next().await {
                match fragment {
                    Ok(fragment) => {
                        content.push_str(&fragment);
                        yield fragment;
                    }
                    Err(err) => {
                        // A substitute ends the stream without a reply
                        // being added to the history
                        let fallback = self.recover(err)?;
                        yield fallback;
                        return;
                    }
                }
            }

            tracing::debug!("Time streaming from api: {:.3}s", start.elapsed().as_secs_f64());
            self.commit(content);
        })
    }
}

pub struct SessionBuilder {
    system_prompt: String,
    api_key: String,
    model: String,
    api_hostname: String,
    examples: Vec<(String, String)>,
    streaming: bool,
    temperature: f64,
    max_output_tokens: usize,
    max_history_cost: Option<usize>,
    cost: Option<CostFn>,
    preprocessor: Preprocessor,
    on_error: Option<ErrorHandler>,
}

impl SessionBuilder {
    pub fn new(system_prompt: &str, api_key: &str, model: &str) -> Self {
        Self {
            system_prompt: system_prompt.to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            api_hostname: DEFAULT_API_HOSTNAME.to_string(),
            examples: Vec::new(),
            streaming: false,
            temperature: DEFAULT_TEMPERATURE,
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
            max_history_cost: None,
            cost: None,
            preprocessor: Preprocessor::identity(),
            on_error: None,
        }
    }

    pub fn build(self) -> Result<Session> {
        if self.system_prompt.trim().is_empty() {
            bail!("A system prompt is required");
        }
        if self.api_key.trim().is_empty() {
            bail!("An API key is required");
        }
        if self.model.trim().is_empty() {
            bail!("A model is required");
        }

        let max_history_cost = match self.max_history_cost {
            Some(cost) => cost,
            None => {
                let window = context_window(&self.model).unwrap_or_else(|| {
                    tracing::warn!(
                        "Unknown context window for model {}, assuming {} tokens",
                        self.model,
                        DEFAULT_CONTEXT_WINDOW
                    );
                    DEFAULT_CONTEXT_WINDOW
                });
                // Reserving the whole window leaves a budget of zero,
                // only the newest message is ever sent
                if self.max_output_tokens > window {
                    bail!(
                        "max_output_tokens must not exceed the context window of {}. Current: {} > {}",
                        self.model,
                        self.max_output_tokens,
                        window
                    );
                }
                window - self.max_output_tokens
            }
        };

        let cost = match self.cost {
            Some(cost) => cost,
            None => token_counter(&self.model)?,
        };

        let examples = self
            .examples
            .iter()
            .flat_map(|(prompt, response)| {
                [
                    Message::new(Role::User, prompt),
                    Message::new(Role::Assistant, response),
                ]
            })
            .collect();

        let config = SessionConfig {
            api_hostname: self.api_hostname,
            api_key: self.api_key,
            model: self.model,
            streaming: self.streaming,
            temperature: self.temperature,
            max_output_tokens: self.max_output_tokens,
            max_history_cost,
        };

        Ok(Session {
            config,
            system_prompt: Message::new(Role::System, &self.system_prompt),
            examples,
            history: History::new(),
            answer: String::new(),
            cost,
            preprocessor: self.preprocessor,
            on_error: self.on_error.unwrap_or_else(|| Box::new(propagate)),
        })
    }

    /// Use an OpenAI compatible server other than api.openai.com.
    pub fn api_hostname(mut self, api_hostname: &str) -> Self {
        self.api_hostname = api_hostname.to_string();
        self
    }

    /// Prompt and response pairs sent after the system prompt on every
    /// call.
    pub fn examples<I, P, R>(mut self, examples: I) -> Self
    where
        I: IntoIterator<Item = (P, R)>,
        P: Into<String>,
        R: Into<String>,
    {
        self.examples = examples
            .into_iter()
            .map(|(prompt, response)| (prompt.into(), response.into()))
            .collect();
        self
    }

    pub fn streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    /// Tokens reserved for the response. Only used to derive the
    /// default `max_history_cost`.
    pub fn max_output_tokens(mut self, max_output_tokens: usize) -> Self {
        self.max_output_tokens = max_output_tokens;
        self
    }

    /// Budget for the system prompt, examples and history combined,
    /// in the units of the cost function.
    pub fn max_history_cost(mut self, max_history_cost: usize) -> Self {
        self.max_history_cost = Some(max_history_cost);
        self
    }

    /// Replaces the model's tokenizer for measuring messages. Removing
    /// a message must always lower the total cost.
    pub fn cost_function<F>(mut self, cost: F) -> Self
    where
        F: Fn(&str) -> usize + Send + Sync + 'static,
    {
        self.cost = Some(Box::new(cost));
        self
    }

    pub fn preprocessor(mut self, preprocessor: Preprocessor) -> Self {
        self.preprocessor = preprocessor;
        self
    }

    pub fn on_error<F>(mut self, on_error: F) -> Self
    where
        F: Fn(&Error) -> Option<String> + Send + Sync + 'static,
    {
        self.on_error = Some(Box::new(on_error));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chars(text: &str) -> usize {
        text.chars().count()
    }

    fn completion_body(content: &str) -> String {
        json!({
            "id": "chatcmpl-123",
            "object": "chat.completion",
            "created": 1694268190,
            "model": "gpt-4",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": content},
                "finish_reason": "stop"
            }]
        })
        .to_string()
    }

    #[test]
    fn test_builder_defaults() {
        let session = SessionBuilder::new("Be helpful.", "test-key", "gpt-4")
            .cost_function(chars)
            .build()
            .unwrap();

        let config = session.config();
        assert_eq!(config.api_hostname, DEFAULT_API_HOSTNAME);
        assert_eq!(config.api_key, "test-key");
        assert_eq!(config.model, "gpt-4");
        assert!(!config.streaming);
        assert_eq!(config.temperature, DEFAULT_TEMPERATURE);
        assert_eq!(config.max_output_tokens, DEFAULT_MAX_OUTPUT_TOKENS);
        assert_eq!(config.max_history_cost, 8192 - DEFAULT_MAX_OUTPUT_TOKENS);
        assert!(session.history().is_empty());
        assert_eq!(session.answer(), "");
    }

    #[test]
    fn test_builder_default_cost_is_tokens() {
        let session = SessionBuilder::new("Be helpful.", "test-key", "gpt-4")
            .build()
            .unwrap();
        assert_eq!(session.history_cost(), 0);
        assert_eq!((session.cost)("hello world"), 2);
    }

    #[test]
    fn test_builder_unknown_model_window() {
        let session = SessionBuilder::new("Be helpful.", "test-key", "local-model")
            .cost_function(chars)
            .max_output_tokens(96)
            .build()
            .unwrap();
        assert_eq!(session.config().max_history_cost, DEFAULT_CONTEXT_WINDOW - 96);
    }

    #[test]
    fn test_builder_missing_required() {
        assert!(SessionBuilder::new("", "test-key", "gpt-4").build().is_err());
        assert!(SessionBuilder::new("Be helpful.", " ", "gpt-4").build().is_err());
        assert!(SessionBuilder::new("Be helpful.", "test-key", "").build().is_err());
    }

    #[test]
    fn test_builder_output_tokens_exceed_window() {
        let result = SessionBuilder::new("Be helpful.", "test-key", "gpt-3.5-turbo")
            .cost_function(chars)
            .max_output_tokens(5000)
            .build();
        assert!(result.is_err());

        // An explicit budget skips the check
        let session = SessionBuilder::new("Be helpful.", "test-key", "gpt-3.5-turbo")
            .cost_function(chars)
            .max_output_tokens(5000)
            .max_history_cost(100)
            .build()
            .unwrap();
        assert_eq!(session.config().max_history_cost, 100);
    }

    #[test]
    fn test_builder_output_tokens_fill_window() {
        let session = SessionBuilder::new("Be helpful.", "test-key", "gpt-4")
            .cost_function(chars)
            .max_output_tokens(8192)
            .build()
            .unwrap();
        assert_eq!(session.config().max_history_cost, 0);

        let result = SessionBuilder::new("Be helpful.", "test-key", "gpt-4")
            .cost_function(chars)
            .max_output_tokens(8193)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_examples() {
        let session = SessionBuilder::new("Be helpful.", "test-key", "gpt-4")
            .cost_function(chars)
            .examples([("Q1", "A1"), ("Q2", "A2")])
            .build()
            .unwrap();

        let messages = session.messages();
        let roles: Vec<Role> = messages.iter().map(|m| m.role()).collect();
        let contents: Vec<&str> = messages.iter().map(|m| m.content()).collect();
        assert_eq!(
            roles,
            vec![Role::System, Role::User, Role::Assistant, Role::User, Role::Assistant]
        );
        assert_eq!(contents, vec!["Be helpful.", "Q1", "A1", "Q2", "A2"]);
    }

    #[tokio::test]
    async fn test_invoke_text() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(completion_body("Hello! How can I help you today?"))
            .create_async()
            .await;

        let mut session = Session::builder("Be helpful.", "test-key", "gpt-4")
            .api_hostname(&server.url())
            .cost_function(chars)
            .build()
            .unwrap();

        let text = match session.ask("Hi").await.unwrap() {
            Reply::Text(text) => text,
            Reply::Stream(_) => panic!("Expected a text reply"),
        };

        mock.assert_async().await;
        assert_eq!(text, "Hello! How can I help you today?");
        assert_eq!(session.answer(), text);
        assert_eq!(session.history().len(), 2);
        assert_eq!(session.history()[1].role(), Role::Assistant);
    }

    #[tokio::test]
    async fn test_invoke_preprocessor_error_leaves_history() {
        let mut session = Session::builder("Be helpful.", "test-key", "gpt-4")
            .api_hostname("http://127.0.0.1:1")
            .cost_function(chars)
            .preprocessor(Preprocessor::new(|_, _| bail!("bad input")))
            .build()
            .unwrap();

        assert!(session.ask("Hi").await.is_err());
        assert!(session.history().is_empty());
    }

    #[tokio::test]
    async fn test_invoke_stream_into_text() {
        let mut server = mockito::Server::new_async().await;
        let body = concat!(
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hel\"},\"finish_reason\":null}]}\n\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
        );
        let _mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await;

        let mut session = Session::builder("Be helpful.", "test-key", "gpt-4")
            .api_hostname(&server.url())
            .cost_function(chars)
            .streaming(true)
            .build()
            .unwrap();

        let text = session.ask("Hi").await.unwrap().into_text().await.unwrap();

        assert_eq!(text, "Hello");
        assert_eq!(session.answer(), "Hello");
        assert_eq!(session.history()[1].content(), "Hello");
    }

    #[test]
    fn test_reset_keeps_prefix() {
        let mut session = Session::builder("Be helpful.", "test-key", "gpt-4")
            .cost_function(chars)
            .examples([("Q", "A")])
            .build()
            .unwrap();
        session.history.push(Message::new(Role::User, "Hi"));
        session.commit("Hello".to_string());

        session.reset();

        assert!(session.history().is_empty());
        assert_eq!(session.answer(), "");
        assert_eq!(session.messages().len(), 3);
        assert_eq!(session.config().model, "gpt-4");
    }

    #[test]
    fn test_trim_history_accounts_for_prefix() {
        let mut session = Session::builder("sys", "test-key", "gpt-4")
            .cost_function(chars)
            .examples([("Q", "A")])
            .max_history_cost(10)
            .build()
            .unwrap();
        session.history.push(Message::new(Role::User, "abc"));
        session.history.push(Message::new(Role::Assistant, "def"));
        session.history.push(Message::new(Role::User, "ghi"));

        // Prefix costs 5, so only one 3 character message fits
        session.trim_history();

        let contents: Vec<&str> = session.history().iter().map(|m| m.content()).collect();
        assert_eq!(contents, vec!["ghi"]);
        assert_eq!(session.history_cost(), 3);
    }
}
