//! Token accounting for OpenAI chat models. Costs are counted with
//! the same BPE the model uses so the history budget lines up with
//! the model's context window.

use anyhow::Result;
use tiktoken_rs::{CoreBPE, cl100k_base, get_bpe_from_model};

/// Maps text to its cost in budget units, usually tokens.
pub type CostFn = Box<dyn Fn(&str) -> usize + Send + Sync>;

/// Context window assumed for models missing from `context_window`.
pub const DEFAULT_CONTEXT_WINDOW: usize = 4096;

/// Size of the context window in tokens for known models.
pub fn context_window(model: &str) -> Option<usize> {
    let size = match model {
        "gpt-3.5-turbo" | "gpt-3.5-turbo-0301" => 4097,
        "gpt-3.5-turbo-16k" => 16385,
        "gpt-4" | "gpt-4-0314" | "gpt-4-0613" => 8192,
        "gpt-4-32k" | "gpt-4-32k-0314" => 32768,
        m if m.starts_with("gpt-4o") || m.starts_with("gpt-4.1") || m.starts_with("gpt-4-turbo") => {
            128_000
        }
        _ => return None,
    };
    Some(size)
}

/// The tokenizer for `model`. Models tiktoken doesn't know about get
/// `cl100k_base`.
pub fn encoder(model: &str) -> Result<CoreBPE> {
    match get_bpe_from_model(model) {
        Ok(bpe) => Ok(bpe),
        Err(e) => {
            tracing::debug!("No tokenizer for {}, using cl100k_base: {}", model, e);
            cl100k_base()
        }
    }
}

/// A cost function counting tokens the way `model` would.
pub fn token_counter(model: &str) -> Result<CostFn> {
    let bpe = encoder(model)?;
    Ok(Box::new(move |text: &str| {
        bpe.encode_with_special_tokens(text).len()
    }))
}
