//! Preprocessing of caller input into the user message that is sent
//! to the LLM. Templates use Handlebars since it can't do much out of
//! the box without registering your own helpers, and strict mode turns
//! a missing argument into an error instead of an empty string.

use anyhow::{Result, bail};
use handlebars::{Handlebars, no_escape};
use serde_json::{Map, Value};

const TEMPLATE_NAME: &str = "input";

type PreprocessFn = Box<dyn Fn(&str, &Value) -> Result<String> + Send + Sync>;

/// Turns the raw input of a call, plus any named arguments passed
/// along with it, into the content of the user message.
pub struct Preprocessor(PreprocessFn);

impl Preprocessor {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&str, &Value) -> Result<String> + Send + Sync + 'static,
    {
        Self(Box::new(f))
    }

    /// Uses the input as is and ignores any arguments.
    pub fn identity() -> Self {
        Self::new(|input, _args| Ok(input.to_string()))
    }

    /// Renders `source` with the call's arguments. The raw input is
    /// available as `{{input}}`, arguments must be an object (or null).
    pub fn template(source: &str) -> Result<Self> {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        // Prompts aren't HTML
        registry.register_escape_fn(no_escape);
        registry.register_template_string(TEMPLATE_NAME, source)?;

        Ok(Self::new(move |input, args| {
            let mut data = match args {
                Value::Object(map) => map.clone(),
                Value::Null => Map::new(),
                other => bail!("Template arguments must be an object, got: {}", other),
            };
            data.insert("input".to_string(), Value::String(input.to_string()));
            Ok(registry.render(TEMPLATE_NAME, &data)?)
        }))
    }

    pub fn apply(&self, input: &str, args: &Value) -> Result<String> {
        (self.0)(input, args)
    }
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self::identity()
    }
}
