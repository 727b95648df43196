use anyhow::Result;

use super::chat::print_reply;
use crate::ai::chat::Session;

pub async fn run(mut session: Session, prompt: &str) -> Result<()> {
    let reply = session.ask(prompt).await?;
    print_reply(reply).await
}
