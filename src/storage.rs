//! SQLite persistence for the relay.
//!
//! One database holds the account directory and the message log.  The log is
//! append-only except for the per-message `delivered` flag, which flips from
//! 0 to 1 the first time a message is pushed to its recipient's live
//! connection.  Retention is out of scope: nothing here ever deletes a
//! message.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum StorageError {
    Sqlite(rusqlite::Error),
    NotFound(String),
    AlreadyExists(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Sqlite(e) => write!(f, "sqlite error: {e}"),
            StorageError::NotFound(msg) => write!(f, "not found: {msg}"),
            StorageError::AlreadyExists(msg) => write!(f, "already exists: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Sqlite(e)
    }
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// Account row in the directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRow {
    pub identity: String,
    pub phone: String,
    pub display_name: Option<String>,
}

/// Message row in the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRow {
    /// Store-assigned, monotonically increasing.
    pub id: i64,
    pub sender: String,
    pub recipient: String,
    pub body: String,
    /// Server-assigned, unix milliseconds.
    pub timestamp: u64,
    pub delivered: bool,
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Database handle. Not `Sync`; callers share it behind a lock.
pub struct Storage {
    conn: Connection,
}

impl Storage {
    /// Open or create a database at the given path. Creates schema if needed.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let storage = Self { conn };
        storage.create_schema()?;
        Ok(storage)
    }

    /// Create an in-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let storage = Self { conn };
        storage.create_schema()?;
        Ok(storage)
    }

    fn create_schema(&self) -> Result<(), StorageError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS users (
                identity     TEXT PRIMARY KEY,
                phone        TEXT NOT NULL,
                display_name TEXT
            );

            CREATE TABLE IF NOT EXISTS messages (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                sender      TEXT NOT NULL,
                recipient   TEXT NOT NULL,
                body        TEXT NOT NULL,
                timestamp   INTEGER NOT NULL,
                delivered   INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_messages_undelivered
                ON messages(recipient, delivered, timestamp);
            CREATE INDEX IF NOT EXISTS idx_messages_sender
                ON messages(sender, timestamp);
            ",
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Directory CRUD
    // -----------------------------------------------------------------------

    pub fn insert_user(&self, row: &UserRow) -> Result<(), StorageError> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO users (identity, phone, display_name) VALUES (?1, ?2, ?3)",
            params![row.identity, row.phone, row.display_name],
        )?;
        if inserted == 0 {
            return Err(StorageError::AlreadyExists(row.identity.clone()));
        }
        Ok(())
    }

    pub fn get_user(&self, identity: &str) -> Result<Option<UserRow>, StorageError> {
        let row = self
            .conn
            .query_row(
                "SELECT identity, phone, display_name FROM users WHERE identity = ?1",
                params![identity],
                |row| {
                    Ok(UserRow {
                        identity: row.get(0)?,
                        phone: row.get(1)?,
                        display_name: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Look up an account by identity or by phone number (the alternate key).
    pub fn find_user_by_key(&self, key: &str) -> Result<Option<UserRow>, StorageError> {
        let row = self
            .conn
            .query_row(
                "SELECT identity, phone, display_name FROM users
                 WHERE identity = ?1 OR phone = ?1",
                params![key],
                |row| {
                    Ok(UserRow {
                        identity: row.get(0)?,
                        phone: row.get(1)?,
                        display_name: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    // -----------------------------------------------------------------------
    // Message log
    // -----------------------------------------------------------------------

    /// Append a message with `delivered = false`. Returns the assigned id.
    pub fn append_message(
        &self,
        sender: &str,
        recipient: &str,
        body: &str,
        timestamp: u64,
    ) -> Result<i64, StorageError> {
        self.conn.execute(
            "INSERT INTO messages (sender, recipient, body, timestamp, delivered)
             VALUES (?1, ?2, ?3, ?4, 0)",
            params![sender, recipient, body, timestamp as i64],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Flip the delivered flag. Idempotent; the flag never goes back to 0.
    /// Returns whether a row matched.
    pub fn mark_delivered(&self, id: i64) -> Result<bool, StorageError> {
        let affected = self.conn.execute(
            "UPDATE messages SET delivered = 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(affected > 0)
    }

    pub fn get_message(&self, id: i64) -> Result<Option<MessageRow>, StorageError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, sender, recipient, body, timestamp, delivered
                 FROM messages WHERE id = ?1",
                params![id],
                Self::message_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Pending backlog for a recipient: every message addressed to them with
    /// `delivered = 0`, oldest first. Ties on timestamp break by id, so the
    /// order messages were appended in is the order they replay in.
    pub fn undelivered_for(&self, recipient: &str) -> Result<Vec<MessageRow>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, sender, recipient, body, timestamp, delivered
             FROM messages
             WHERE recipient = ?1 AND delivered = 0
             ORDER BY timestamp ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![recipient], Self::message_from_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Full history involving an identity as sender or recipient, oldest
    /// first, regardless of delivery state.
    pub fn history_for(&self, identity: &str) -> Result<Vec<MessageRow>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, sender, recipient, body, timestamp, delivered
             FROM messages
             WHERE sender = ?1 OR recipient = ?1
             ORDER BY timestamp ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![identity], Self::message_from_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn message_count(&self) -> Result<i64, StorageError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        Ok(count)
    }

    fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
        Ok(MessageRow {
            id: row.get(0)?,
            sender: row.get(1)?,
            recipient: row.get(2)?,
            body: row.get(3)?,
            timestamp: row.get::<_, i64>(4)? as u64,
            delivered: row.get::<_, i32>(5)? != 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_storage() -> Storage {
        Storage::open_in_memory().unwrap()
    }

    #[test]
    fn test_user_crud() {
        let storage = test_storage();

        assert!(storage.get_user("alice@example.com").unwrap().is_none());

        let row = UserRow {
            identity: "alice@example.com".to_string(),
            phone: "555-0100".to_string(),
            display_name: Some("alice".to_string()),
        };
        storage.insert_user(&row).unwrap();

        let loaded = storage.get_user("alice@example.com").unwrap().unwrap();
        assert_eq!(loaded.phone, "555-0100");
        assert_eq!(loaded.display_name, Some("alice".to_string()));

        // Duplicate signup is rejected
        assert!(matches!(
            storage.insert_user(&row),
            Err(StorageError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_find_user_by_alternate_key() {
        let storage = test_storage();
        storage
            .insert_user(&UserRow {
                identity: "bob@example.com".to_string(),
                phone: "555-0101".to_string(),
                display_name: None,
            })
            .unwrap();

        let by_identity = storage.find_user_by_key("bob@example.com").unwrap();
        assert!(by_identity.is_some());

        let by_phone = storage.find_user_by_key("555-0101").unwrap().unwrap();
        assert_eq!(by_phone.identity, "bob@example.com");

        assert!(storage.find_user_by_key("555-9999").unwrap().is_none());
    }

    #[test]
    fn test_append_and_mark_delivered() {
        let storage = test_storage();

        let id = storage.append_message("a", "b", "hello", 1_000).unwrap();
        let msg = storage.get_message(id).unwrap().unwrap();
        assert_eq!(msg.body, "hello");
        assert!(!msg.delivered);

        assert!(storage.mark_delivered(id).unwrap());
        let msg = storage.get_message(id).unwrap().unwrap();
        assert!(msg.delivered);

        // Second mark is a no-op on the value, not an error
        assert!(storage.mark_delivered(id).unwrap());
        assert!(storage.get_message(id).unwrap().unwrap().delivered);

        // Unknown id matches nothing
        assert!(!storage.mark_delivered(9999).unwrap());
    }

    #[test]
    fn test_undelivered_ordering() {
        let storage = test_storage();

        // Appended out of timestamp order, plus a tie on timestamp 500
        let id_late = storage.append_message("a", "b", "late", 3_000).unwrap();
        let id_tie1 = storage.append_message("a", "b", "tie-1", 500).unwrap();
        let id_tie2 = storage.append_message("c", "b", "tie-2", 500).unwrap();
        let id_mid = storage.append_message("a", "b", "mid", 1_000).unwrap();
        storage.append_message("a", "other", "elsewhere", 100).unwrap();

        let pending = storage.undelivered_for("b").unwrap();
        let ids: Vec<i64> = pending.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![id_tie1, id_tie2, id_mid, id_late]);

        // Delivered messages drop out of the backlog
        storage.mark_delivered(id_tie1).unwrap();
        let pending = storage.undelivered_for("b").unwrap();
        assert_eq!(pending.len(), 3);
        assert_eq!(pending[0].id, id_tie2);
    }

    #[test]
    fn test_history_includes_both_directions() {
        let storage = test_storage();

        storage.append_message("a", "b", "first", 100).unwrap();
        let id = storage.append_message("b", "a", "second", 200).unwrap();
        storage.append_message("b", "c", "unrelated", 300).unwrap();
        storage.mark_delivered(id).unwrap();

        let history = storage.history_for("a").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].body, "first");
        assert_eq!(history[1].body, "second");
        // History is independent of the delivered flag
        assert!(!history[0].delivered);
        assert!(history[1].delivered);
    }
}
