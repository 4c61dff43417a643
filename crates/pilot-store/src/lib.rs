use anyhow::Result;
use chrono::Utc;
use pilot_core::{runtime_dir, ChatMessage, Role};
use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};

const MIGRATIONS: &[(i64, &str)] = &[(
    1,
    "CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id TEXT NOT NULL,
        role TEXT NOT NULL,
        content TEXT NOT NULL,
        created_at TEXT NOT NULL
     );
     CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, id);",
)];

/// Persistent session transcripts. The loop writes exactly the user
/// instruction and the final assistant message here, never intermediate tool
/// chatter.
pub struct SessionStore {
    db_path: PathBuf,
}

impl SessionStore {
    pub fn new(workspace: &Path) -> Result<Self> {
        let root = runtime_dir(workspace);
        fs::create_dir_all(&root)?;
        let store = Self {
            db_path: root.join("sessions.sqlite"),
        };
        store.init_db()?;
        Ok(store)
    }

    /// Open a store at an explicit database path (used by tests and tooling).
    pub fn at_path(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let store = Self { db_path };
        store.init_db()?;
        Ok(store)
    }

    fn db(&self) -> Result<Connection> {
        Ok(Connection::open(&self.db_path)?)
    }

    fn init_db(&self) -> Result<()> {
        let conn = self.db()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY);",
        )?;
        let current: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);
        for (version, sql) in MIGRATIONS {
            if *version > current {
                conn.execute_batch(sql)?;
                conn.execute(
                    "INSERT INTO schema_version(version) VALUES (?1)",
                    params![version],
                )?;
            }
        }
        Ok(())
    }

    pub fn append(&self, session_id: &str, role: Role, content: &str) -> Result<()> {
        let conn = self.db()?;
        conn.execute(
            "INSERT INTO messages(session_id, role, content, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![session_id, role.as_str(), content, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Most recent `limit` messages for a session, oldest first.
    pub fn load(&self, session_id: &str, limit: usize) -> Result<Vec<ChatMessage>> {
        let conn = self.db()?;
        let mut stmt = conn.prepare(
            "SELECT role, content FROM messages
             WHERE session_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let mut rows: Vec<ChatMessage> = stmt
            .query_map(params![session_id, limit as i64], |row| {
                let role: String = row.get(0)?;
                let content: String = row.get(1)?;
                Ok(ChatMessage {
                    role: Role::parse(&role),
                    content,
                })
            })?
            .collect::<std::result::Result<_, _>>()?;
        rows.reverse();
        Ok(rows)
    }

    pub fn clear(&self, session_id: &str) -> Result<()> {
        let conn = self.db()?;
        conn.execute(
            "DELETE FROM messages WHERE session_id = ?1",
            params![session_id],
        )?;
        Ok(())
    }
}
