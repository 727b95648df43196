//! A conversation session over an OpenAI compatible chat completion
//! API. The session keeps the history within a token budget, prefixes
//! every request with a system prompt and examples, and returns either
//! the full response or a stream of fragments.

pub mod ai;
pub mod cli;
pub mod core;
pub mod openai;

pub use ai::chat::{ErrorHandler, Reply, Session, SessionBuilder, SessionConfig};
pub use ai::prompt::Preprocessor;
pub use openai::{ApiError, Message, Role};
