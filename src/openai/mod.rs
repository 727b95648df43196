mod core;
pub mod tokens;

pub use self::core::{ApiError, Message, Role, completion, completion_stream};
