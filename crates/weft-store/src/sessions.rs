use crate::cursor::{decode_cursor, encode_cursor, SessionCursor};
use crate::error::{StoreError, StoreResult};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Mutex;

const MAX_PAGE_LIMIT: u16 = 500;

fn default_page_limit() -> u16 {
    50
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageRequest {
    #[serde(default = "default_page_limit")]
    pub limit: u16,
    #[serde(default)]
    pub cursor: Option<String>,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            limit: default_page_limit(),
            cursor: None,
        }
    }
}

impl PageRequest {
    pub fn normalized_limit(&self) -> u16 {
        self.limit.clamp(1, MAX_PAGE_LIMIT)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub context_id: String,
    pub start_unix_ms: i64,
}

/// Sessions ordered by start time, newest first.
pub struct SessionIndex {
    conn: Mutex<Connection>,
}

impl SessionIndex {
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
            CREATE TABLE IF NOT EXISTS session_index (
                context_id TEXT PRIMARY KEY,
                start_unix_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_session_index_start
                ON session_index(start_unix_ms DESC, context_id DESC);
            ",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn upsert(&self, context_id: &str, start_unix_ms: i64) -> StoreResult<()> {
        let conn = self.conn.lock().expect("session index mutex poisoned");
        conn.execute(
            "INSERT INTO session_index (context_id, start_unix_ms) VALUES (?1, ?2)
             ON CONFLICT(context_id) DO UPDATE SET start_unix_ms = excluded.start_unix_ms",
            params![context_id, start_unix_ms],
        )?;
        Ok(())
    }

    pub fn list(&self, request: &PageRequest) -> StoreResult<Page<SessionSummary>> {
        let limit = request.normalized_limit() as usize;
        let after = match request.cursor.as_deref() {
            Some(token) if !token.is_empty() => Some(decode_cursor::<SessionCursor>(token)?),
            _ => None,
        };

        let conn = self.conn.lock().expect("session index mutex poisoned");
        let mut items = Vec::new();
        {
            let mut stmt = conn.prepare(
                "SELECT context_id, start_unix_ms FROM session_index
                 WHERE ?1 = 0
                    OR start_unix_ms < ?2
                    OR (start_unix_ms = ?2 AND context_id < ?3)
                 ORDER BY start_unix_ms DESC, context_id DESC
                 LIMIT ?4",
            )?;
            let (has_cursor, start, context) = match &after {
                Some(cursor) => (1i64, cursor.last_start_unix_ms, cursor.context_id.as_str()),
                None => (0i64, 0i64, ""),
            };
            let rows = stmt.query_map(
                params![has_cursor, start, context, (limit + 1) as i64],
                |row| {
                    Ok(SessionSummary {
                        context_id: row.get(0)?,
                        start_unix_ms: row.get(1)?,
                    })
                },
            )?;
            for row in rows {
                items.push(row?);
            }
        }

        let mut next_cursor = None;
        if items.len() > limit {
            items.truncate(limit);
            if let Some(last) = items.last() {
                next_cursor = Some(encode_cursor(&SessionCursor {
                    last_start_unix_ms: last.start_unix_ms,
                    context_id: last.context_id.clone(),
                })?);
            }
        }

        Ok(Page { items, next_cursor })
    }
}
