//! Interactive chat loop over a provisioned engine.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use banter_application::{ChatService, ChatServiceError, DEFAULT_SYSTEM_PROMPT};
use banter_chat::{ChatMessage, Conversation, ConversationRepository};
use banter_genai::GenerateOptions;
use banter_models::ChatModel;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;

pub(crate) async fn run(
    model: ChatModel,
    model_dir: PathBuf,
    db_path: PathBuf,
    system: Option<String>,
    max_tokens: usize,
) -> anyhow::Result<()> {
    let engine = crate::render::provision(model, &model_dir).await?;
    let database = super::open_database(&db_path)?;
    let system_prompt = system.unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());
    let options = GenerateOptions {
        max_new_tokens: max_tokens,
    };
    let mut conversation = Conversation::new();

    println!();
    println!("chatting with {} (Ctrl-C to leave)", engine.model_name());

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("you> ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        };
        let Some(line) = line else {
            break; // stdin closed
        };
        let text = match ChatService::validate_input(&line) {
            Ok(text) => text.to_string(),
            Err(ChatServiceError::EmptyMessage) => {
                println!("please enter your message");
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        conversation.push(ChatMessage::from_user(text));

        print!("banter> ");
        std::io::stdout().flush()?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let printer = tokio::spawn(async move {
            while let Some(piece) = rx.recv().await {
                print!("{piece}");
                let _ = std::io::stdout().flush();
            }
        });

        let reply =
            ChatService::reply(Arc::clone(&engine), &system_prompt, &conversation, options, tx)
                .await;
        printer.await?;
        println!();

        match reply {
            Ok(reply) => {
                conversation.push(ChatMessage::from_assistant(reply));
                if let Err(e) = database.save(&conversation) {
                    tracing::warn!(error = %e, "failed to persist conversation");
                }
            }
            Err(e) => eprintln!("generation failed: {e}"),
        }
    }

    if !conversation.is_empty() {
        println!("conversation saved as {}", conversation.id);
    }
    Ok(())
}
