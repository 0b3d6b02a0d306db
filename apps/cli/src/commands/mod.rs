//! CLI subcommand implementations.

use std::path::Path;

use banter_storage::Database;

pub(crate) mod chat;
pub(crate) mod history;
pub(crate) mod models;
pub(crate) mod pull;

/// Open the history database, creating its parent directory if needed.
pub(crate) fn open_database(path: &Path) -> anyhow::Result<Database> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(Database::open(path)?)
}
