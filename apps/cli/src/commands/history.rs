//! List stored conversations or print one transcript.

use std::path::PathBuf;

use anyhow::Context;
use banter_chat::ConversationRepository;
use banter_storage::Database;
use chrono::Local;
use uuid::Uuid;

pub(crate) fn run(db_path: PathBuf, id: Option<&str>) -> anyhow::Result<()> {
    let database = super::open_database(&db_path)?;
    match id {
        None => list(&database),
        Some(id) => show(&database, id),
    }
}

fn list(database: &Database) -> anyhow::Result<()> {
    let conversations = database.list()?;
    if conversations.is_empty() {
        println!("no conversations yet");
        return Ok(());
    }
    for conversation in conversations {
        let title = conversation.title.as_deref().unwrap_or("(untitled)");
        let when = conversation
            .updated_at
            .with_timezone(&Local)
            .format("%Y-%m-%d %H:%M");
        println!(
            "{}  {}  {:>3} messages  {}",
            conversation.id,
            when,
            conversation.len(),
            title
        );
    }
    Ok(())
}

fn show(database: &Database, id: &str) -> anyhow::Result<()> {
    let id = Uuid::parse_str(id).context("invalid conversation id")?;
    let conversation = database.get(&id)?;

    // Day separators and hour stamps are derived from the timestamps.
    let mut last_day = String::new();
    for message in &conversation.messages {
        let day = message.day_label(&Local);
        if day != last_day {
            println!("--- {day} ---");
            last_day = day;
        }
        let who = if message.is_from_user() { "you" } else { "banter" };
        println!("[{}] {who}: {}", message.hour_label(&Local), message.text);
    }
    Ok(())
}
