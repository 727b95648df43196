use std::io::{self, Write};

use anyhow::Result;
use futures_util::StreamExt;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;

use crate::ai::chat::{Reply, Session};

/// Writes a reply to stdout, fragment by fragment when streaming.
pub async fn print_reply(reply: Reply<'_>) -> Result<()> {
    let mut stdout = io::stdout();
    match reply {
        Reply::Text(text) => writeln!(stdout, "{}", text)?,
        Reply::Stream(mut fragments) => {
            while let Some(fragment) = fragments.next().await {
                write!(stdout, "{}", fragment?)?;
                stdout.flush()?;
            }
            writeln!(stdout)?;
        }
    }
    Ok(())
}

pub async fn run(mut session: Session) -> Result<()> {
    let mut rl = DefaultEditor::new()?;

    loop {
        let readline = rl.readline(">>> ");
        match readline {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(line);

                if line == "/reset" {
                    session.reset();
                    println!("History cleared.");
                    continue;
                }

                let result = match session.ask(line).await {
                    Ok(reply) => print_reply(reply).await,
                    Err(err) => Err(err),
                };
                // Keep the session going, the user message is already
                // recorded so the next turn has the context
                if let Err(err) = result {
                    eprintln!("Error: {}", err);
                }
            }
            Err(ReadlineError::Interrupted) => break,
            Err(ReadlineError::Eof) => break,
            Err(err) => {
                println!("Error: {:?}", err);
                break;
            }
        }
    }

    Ok(())
}
