use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context as _, Result};
use rusqlite::{Connection, OptionalExtension as _, params};

use super::{SwapId, SwapRecord};

/// Durable swap records plus a small key/value table for node metadata.
///
/// Records are written after every state transition and never deleted.
pub trait SwapStore: Send + Sync {
    /// Inserts or replaces the record with the same id.
    fn put(&self, record: &SwapRecord) -> Result<()>;
    fn get(&self, swap_id: &SwapId) -> Result<Option<SwapRecord>>;
    /// Every record, oldest first.
    fn list(&self) -> Result<Vec<SwapRecord>>;

    fn list_active(&self) -> Result<Vec<SwapRecord>> {
        Ok(self.list()?.into_iter().filter(|r| r.is_active()).collect())
    }

    fn get_meta(&self, key: &str) -> Result<Option<String>>;
    fn set_meta(&self, key: &str, value: &str) -> Result<()>;
}

#[derive(Debug)]
pub struct SqliteSwapStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl SqliteSwapStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create swap store dir {}", dir.display()))?;
        }

        let conn =
            Connection::open(&path).with_context(|| format!("open sqlite {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("set sqlite busy_timeout")?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .context("configure sqlite pragmas")?;

        migrate(&conn).context("migrate sqlite schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SwapStore for SqliteSwapStore {
    fn put(&self, record: &SwapRecord) -> Result<()> {
        let data = serde_json::to_string(record)
            .with_context(|| format!("serialize swap {}", record.id))?;
        let created_at = i64::try_from(record.created_at)
            .with_context(|| format!("invalid created_at {}", record.created_at))?;

        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            r#"
INSERT INTO swaps (swap_id, swap_type, role, state, peer_node_id, created_at, data)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
ON CONFLICT(swap_id) DO UPDATE SET
  state = excluded.state,
  data = excluded.data
"#,
            params![
                record.id.to_string(),
                record.swap_type.to_string(),
                record.role.to_string(),
                record.current.as_str(),
                &record.peer_node_id,
                created_at,
                data,
            ],
        )
        .with_context(|| format!("put swap {}", record.id))?;
        Ok(())
    }

    fn get(&self, swap_id: &SwapId) -> Result<Option<SwapRecord>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM swaps WHERE swap_id = ?1",
                params![swap_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("get swap {swap_id}"))?;

        data.map(|data| decode_record(&data)).transpose()
    }

    fn list(&self) -> Result<Vec<SwapRecord>> {
        self.query_records("SELECT data FROM swaps ORDER BY created_at, swap_id")
    }

    fn list_active(&self) -> Result<Vec<SwapRecord>> {
        self.query_records(
            r#"
SELECT data FROM swaps
WHERE state NOT IN ('claimed_preimage', 'claimed_csv', 'claimed_coop', 'canceled')
ORDER BY created_at, swap_id
"#,
        )
    }

    fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.query_row(
            "SELECT value FROM meta WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .with_context(|| format!("get meta {key}"))
    }

    fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "INSERT INTO meta (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )
        .with_context(|| format!("set meta {key}"))?;
        Ok(())
    }
}

impl SqliteSwapStore {
    fn query_records(&self, sql: &str) -> Result<Vec<SwapRecord>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn.prepare(sql).context("prepare list swaps")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context("query list swaps")?;

        let mut out = Vec::new();
        for row in rows {
            let data = row.context("read swap row")?;
            out.push(decode_record(&data)?);
        }
        Ok(out)
    }
}

fn decode_record(data: &str) -> Result<SwapRecord> {
    serde_json::from_str(data).context("decode swap record")
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS swaps (
  swap_id TEXT PRIMARY KEY,
  swap_type TEXT NOT NULL,
  role TEXT NOT NULL,
  state TEXT NOT NULL,
  peer_node_id TEXT NOT NULL,
  created_at INTEGER NOT NULL,
  data TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS swaps_state_idx ON swaps(state);

CREATE TABLE IF NOT EXISTS meta (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);
"#,
    )
    .context("create tables")?;
    Ok(())
}

/// Store kept in process memory, for tests and ephemeral nodes.
#[derive(Debug, Default)]
pub struct MemorySwapStore {
    swaps: Mutex<HashMap<SwapId, SwapRecord>>,
    meta: Mutex<HashMap<String, String>>,
}

impl MemorySwapStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SwapStore for MemorySwapStore {
    fn put(&self, record: &SwapRecord) -> Result<()> {
        self.swaps
            .lock()
            .expect("store mutex poisoned")
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn get(&self, swap_id: &SwapId) -> Result<Option<SwapRecord>> {
        Ok(self
            .swaps
            .lock()
            .expect("store mutex poisoned")
            .get(swap_id)
            .cloned())
    }

    fn list(&self) -> Result<Vec<SwapRecord>> {
        let mut out: Vec<SwapRecord> = self
            .swaps
            .lock()
            .expect("store mutex poisoned")
            .values()
            .cloned()
            .collect();
        out.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(out)
    }

    fn get_meta(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .meta
            .lock()
            .expect("store mutex poisoned")
            .get(key)
            .cloned())
    }

    fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.meta
            .lock()
            .expect("store mutex poisoned")
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

