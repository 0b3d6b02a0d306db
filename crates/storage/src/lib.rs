use banter_chat::{Conversation, ConversationRepository};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// SQLite-backed conversation history.
///
/// Each conversation is one row; the JSON blob is the canonical record and
/// the timestamp columns exist only as ordering keys.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "opening chat database");
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().expect("database mutex poisoned");
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                title TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                conversation_json TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_conversations_updated_at ON conversations(updated_at DESC);
            "#,
        )?;
        Ok(())
    }
}

impl ConversationRepository for Database {
    type Error = StorageError;

    fn save(&self, conversation: &Conversation) -> Result<()> {
        let json = serde_json::to_string(conversation)?;
        let conn = self.conn.lock().expect("database mutex poisoned");
        conn.execute(
            "INSERT OR REPLACE INTO conversations (id, title, created_at, updated_at, conversation_json) VALUES (?1, ?2, ?3, ?4, ?5)",
            (
                conversation.id.to_string(),
                &conversation.title,
                conversation.created_at.timestamp_millis(),
                conversation.updated_at.timestamp_millis(),
                json,
            ),
        )?;
        Ok(())
    }

    fn get(&self, id: &Uuid) -> Result<Conversation> {
        let conn = self.conn.lock().expect("database mutex poisoned");
        let json: String = conn
            .query_row(
                "SELECT conversation_json FROM conversations WHERE id = ?1",
                [id.to_string()],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    StorageError::NotFound(format!("conversation {id}"))
                }
                other => StorageError::Database(other),
            })?;
        Ok(serde_json::from_str(&json)?)
    }

    fn list(&self) -> Result<Vec<Conversation>> {
        let conn = self.conn.lock().expect("database mutex poisoned");
        let mut stmt =
            conn.prepare("SELECT conversation_json FROM conversations ORDER BY updated_at DESC")?;
        let rows = stmt.query_map([], |row| {
            let json: String = row.get(0)?;
            Ok(json)
        })?;

        let mut conversations = Vec::new();
        for row in rows {
            let json = row?;
            if let Ok(c) = serde_json::from_str(&json) {
                conversations.push(c);
            }
        }
        Ok(conversations)
    }

    fn delete(&self, id: &Uuid) -> Result<()> {
        let conn = self.conn.lock().expect("database mutex poisoned");
        let affected = conn.execute("DELETE FROM conversations WHERE id = ?1", [id.to_string()])?;
        if affected == 0 {
            return Err(StorageError::NotFound(format!("conversation {id}")));
        }
        Ok(())
    }
}
