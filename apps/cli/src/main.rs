//! banter CLI: chat with a locally executed ONNX language model.
//!
//! The model's weight files are fetched from Hugging Face on first use; the
//! chat prompt is not offered until the model is fully provisioned.

use std::path::PathBuf;

use banter_models::ChatModel;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod render;

#[derive(Parser)]
#[command(name = "banter")]
#[command(author, version, about = "Chat with a local Phi-3 model", long_about = None)]
struct Cli {
    /// Model directory (default: the per-user data dir, or BANTER_MODEL_DIR)
    #[arg(long, global = true)]
    model_dir: Option<PathBuf>,

    /// History database path (default: the per-user data dir, or BANTER_DB)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision the model if needed, then chat interactively (default)
    Chat {
        /// System prompt override
        #[arg(long)]
        system: Option<String>,

        /// Upper bound on generated tokens per reply
        #[arg(long, default_value_t = banter_application::DEFAULT_MAX_NEW_TOKENS)]
        max_tokens: usize,
    },

    /// Download any missing model files and exit
    Pull,

    /// Show the model, its directory, and per-file presence
    Models,

    /// List stored conversations, or print one transcript
    History {
        /// Conversation id to print
        id: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so they never garble the chat stream on stdout.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .without_time()
        .init();

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let model = ChatModel::default();
    let model_dir = resolve_model_dir(cli.model_dir, model);
    let db_path = resolve_db_path(cli.db);

    let command = cli.command.unwrap_or(Commands::Chat {
        system: None,
        max_tokens: banter_application::DEFAULT_MAX_NEW_TOKENS,
    });
    match command {
        Commands::Chat { system, max_tokens } => {
            commands::chat::run(model, model_dir, db_path, system, max_tokens).await
        }
        Commands::Pull => commands::pull::run(model, model_dir).await,
        Commands::Models => commands::models::run(model, &model_dir),
        Commands::History { id } => commands::history::run(db_path, id.as_deref()),
    }
}

fn resolve_model_dir(flag: Option<PathBuf>, model: ChatModel) -> PathBuf {
    flag.or_else(|| std::env::var_os("BANTER_MODEL_DIR").map(PathBuf::from))
        .unwrap_or_else(|| banter_models::model_path(model))
}

fn resolve_db_path(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| std::env::var_os("BANTER_DB").map(PathBuf::from))
        .unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("banter")
                .join("history.db")
        })
}
