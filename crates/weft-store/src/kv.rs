use crate::error::{StoreError, StoreResult};
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::Path;
use std::sync::Mutex;

/// Durable key-value table with atomic single-key reads and writes.
///
/// Keys are stored as blobs so iteration follows byte order.
pub struct KvStore {
    conn: Mutex<Connection>,
}

impl KvStore {
    pub fn open(db_path: &Path) -> StoreResult<Self> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                StoreError::backend(format!("failed to create {}: {err}", parent.display()))
            })?;
        }
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS kv (
                key BLOB PRIMARY KEY,
                value BLOB NOT NULL
            ) WITHOUT ROWID;
            ",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let conn = self.conn.lock().expect("kv connection mutex poisoned");
        let value = conn
            .query_row(
                "SELECT value FROM kv WHERE key = ?1",
                params![key.as_bytes()],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        let conn = self.conn.lock().expect("kv connection mutex poisoned");
        conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key.as_bytes(), value],
        )?;
        Ok(())
    }

    pub fn keys(&self) -> StoreResult<Vec<String>> {
        let conn = self.conn.lock().expect("kv connection mutex poisoned");
        let mut stmt = conn.prepare("SELECT key FROM kv ORDER BY key ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;

        let mut keys = Vec::new();
        for row in rows {
            keys.push(String::from_utf8_lossy(&row?).to_string());
        }
        Ok(keys)
    }
}
