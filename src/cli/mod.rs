use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use crate::ai::chat::{Session, SessionBuilder};
use crate::core::AppConfig;

pub mod ask;
pub mod chat;

/// Session options shared by the subcommands. Anything not set here
/// comes from the environment, see `AppConfig`.
#[derive(Args, Debug)]
pub struct SessionArgs {
    /// Stream the response as it's generated
    #[arg(long, action, default_value = "false")]
    stream: bool,

    /// System prompt sent before the conversation
    #[arg(long)]
    system: Option<String>,

    /// Model to use
    #[arg(long)]
    model: Option<String>,

    /// Token budget for the system prompt, examples and history
    #[arg(long)]
    max_history_cost: Option<usize>,

    /// JSON file with example pairs: [["prompt", "response"], ...]
    #[arg(long)]
    examples: Option<PathBuf>,
}

impl SessionArgs {
    pub fn session(&self, config: &AppConfig) -> Result<Session> {
        let system = self.system.as_deref().unwrap_or(&config.system_message);
        let model = self.model.as_deref().unwrap_or(&config.openai_model);

        let mut builder = SessionBuilder::new(system, &config.openai_api_key, model)
            .api_hostname(&config.openai_api_hostname)
            .streaming(self.stream);
        if let Some(cost) = self.max_history_cost {
            builder = builder.max_history_cost(cost);
        }
        if let Some(path) = &self.examples {
            builder = builder.examples(read_examples(path)?);
        }

        builder.build()
    }
}

fn read_examples(path: &Path) -> Result<Vec<(String, String)>> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read examples from {}", path.display()))?;
    let examples = serde_json::from_str(&data)
        .with_context(|| format!("Invalid examples in {}", path.display()))?;
    Ok(examples)
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start an interactive chat session
    Chat {
        #[command(flatten)]
        session: SessionArgs,
    },
    /// Send a single prompt and print the response
    Ask {
        prompt: String,

        #[command(flatten)]
        session: SessionArgs,
    },
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

pub async fn run() -> Result<()> {
    let args = Cli::parse();

    // Handle each sub command
    match args.command {
        Some(Command::Chat { session }) => {
            let config = AppConfig::from_env()?;
            chat::run(session.session(&config)?).await?;
        }
        Some(Command::Ask { prompt, session }) => {
            let config = AppConfig::from_env()?;
            ask::run(session.session(&config)?, &prompt).await?;
        }
        None => {}
    }

    Ok(())
}
