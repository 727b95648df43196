mod core;
pub mod models;

pub use self::core::{
    DEFAULT_API_HOSTNAME, DEFAULT_MAX_OUTPUT_TOKENS, DEFAULT_TEMPERATURE, ErrorHandler, Reply,
    Session, SessionBuilder, SessionConfig,
};
