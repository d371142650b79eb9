//! Relational store for quarry: download records, the conversation/persona
//! tables populated by migration, and a small metadata table.
//!
//! Every call opens its own connection (WAL, `synchronous=FULL`), so a
//! returned `put`/`delete` has reached the journal on disk.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DB_FILE: &str = "quarry.sqlite";
pub const META_MIGRATION_COMPLETED: &str = "migration.completed_at";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("blocking task failed: {0}")]
    Join(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Clone, Debug)]
pub struct Store {
    db_path: PathBuf,
}

/// Outcome of a successful acquisition, keyed by `record_key(model_name, quant)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub key: String,
    pub model_name: String,
    pub service_name: String,
    pub artifact_path: PathBuf,
    pub quantization: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    pub downloaded_at: String,
    /// Cached result of the last existence check. Re-verify before trusting.
    pub file_exists: bool,
}

impl DownloadRecord {
    pub fn artifact_present(&self) -> bool {
        self.artifact_path.is_file()
    }
}

/// Composite identity of a download record: `{model_name}-{quantization}`, lowercased.
pub fn record_key(model_name: &str, quantization: &str) -> String {
    format!("{model_name}-{quantization}").to_lowercase()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRow {
    pub id: String,
    pub title: String,
    pub persona: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRow {
    pub conversation_id: String,
    pub model: String,
    pub role: String,
    pub content: String,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonaRow {
    pub key: String,
    pub name: String,
    pub icon: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_path: Option<String>,
    pub description: String,
    pub system_prompt: String,
}

/// Rows produced by parsing the legacy file layout, written in one transaction.
#[derive(Debug, Clone, Default)]
pub struct LegacyImport {
    pub conversations: Vec<ConversationRow>,
    pub messages: Vec<MessageRow>,
    pub records: Vec<DownloadRecord>,
    pub personas: Vec<PersonaRow>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableCounts {
    pub conversations: u64,
    pub messages: u64,
    pub download_records: u64,
    pub personas: u64,
}

impl TableCounts {
    pub fn is_empty(&self) -> bool {
        self.conversations == 0
            && self.messages == 0
            && self.download_records == 0
            && self.personas == 0
    }
}

const RECORD_COLUMNS: &str = "record_key,model_name,service_name,artifact_path,quantization,model_id,sha256,bytes,downloaded_at,file_exists";

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<DownloadRecord> {
    let path: String = row.get(3)?;
    let bytes: Option<i64> = row.get(7)?;
    Ok(DownloadRecord {
        key: row.get(0)?,
        model_name: row.get(1)?,
        service_name: row.get(2)?,
        artifact_path: PathBuf::from(path),
        quantization: row.get(4)?,
        model_id: row.get(5)?,
        sha256: row.get(6)?,
        bytes: bytes.map(|b| b.max(0) as u64),
        downloaded_at: row.get(8)?,
        file_exists: row.get::<_, i64>(9)? != 0,
    })
}

fn upsert_record(conn: &Connection, rec: &DownloadRecord) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT OR REPLACE INTO download_records(record_key,model_name,service_name,artifact_path,quantization,model_id,sha256,bytes,downloaded_at,file_exists) VALUES (?,?,?,?,?,?,?,?,?,?)",
        params![
            rec.key,
            rec.model_name,
            rec.service_name,
            rec.artifact_path.to_string_lossy(),
            rec.quantization,
            rec.model_id,
            rec.sha256,
            rec.bytes.map(|b| b as i64),
            rec.downloaded_at,
            rec.file_exists as i64,
        ],
    )
}

impl Store {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let db_path = dir.join(DB_FILE);
        let conn = Connection::open(&db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init_schema(&conn)?;
        tracing::debug!(path = %db_path.display(), "store opened");
        Ok(Self { db_path })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS download_records (
              record_key TEXT PRIMARY KEY,
              model_name TEXT NOT NULL,
              service_name TEXT NOT NULL,
              artifact_path TEXT NOT NULL,
              quantization TEXT NOT NULL,
              model_id TEXT,
              sha256 TEXT,
              bytes INTEGER,
              downloaded_at TEXT NOT NULL,
              file_exists INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS conversations (
              id TEXT PRIMARY KEY,
              title TEXT NOT NULL,
              persona TEXT NOT NULL DEFAULT 'default',
              created_at TEXT NOT NULL,
              updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
              model TEXT NOT NULL,
              role TEXT NOT NULL,
              content TEXT NOT NULL,
              timestamp TEXT NOT NULL,
              completed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id);

            CREATE TABLE IF NOT EXISTS personas (
              key TEXT PRIMARY KEY,
              name TEXT NOT NULL,
              icon TEXT NOT NULL,
              icon_path TEXT,
              description TEXT NOT NULL,
              system_prompt TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS meta (
              key TEXT PRIMARY KEY,
              value TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(Duration::from_millis(5000))?;
        Ok(conn)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    // ---------------- Download records ----------------

    pub fn find(&self, key: &str) -> Result<Option<DownloadRecord>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {RECORD_COLUMNS} FROM download_records WHERE record_key=?");
        Ok(conn
            .query_row(&sql, params![key], record_from_row)
            .optional()?)
    }

    /// Case-insensitive substring match on model name, service name or key.
    /// Case is folded in Rust; SQLite `LIKE` folds ASCII only.
    pub fn find_by_name(&self, needle: &str) -> Result<Vec<DownloadRecord>> {
        let needle = needle.trim().to_lowercase();
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM download_records ORDER BY model_name, quantization"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], record_from_row)?;
        let mut hits = Vec::new();
        for rec in rows {
            let rec = rec?;
            let matched = [&rec.model_name, &rec.service_name, &rec.key]
                .iter()
                .any(|field| field.to_lowercase().contains(&needle));
            if matched {
                hits.push(rec);
            }
        }
        Ok(hits)
    }

    /// Upsert; last write wins on the record key.
    pub fn put(&self, rec: &DownloadRecord) -> Result<()> {
        let conn = self.conn()?;
        upsert_record(&conn, rec)?;
        Ok(())
    }

    pub fn delete(&self, key: &str) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM download_records WHERE record_key=?",
            params![key],
        )?;
        Ok(n > 0)
    }

    pub fn list(&self) -> Result<Vec<DownloadRecord>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM download_records ORDER BY downloaded_at DESC, record_key"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], record_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn set_file_exists(&self, key: &str, exists: bool) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE download_records SET file_exists=? WHERE record_key=?",
            params![exists as i64, key],
        )?;
        Ok(n > 0)
    }

    /// Stat the artifact again, persist the flag if it changed and return the fresh record.
    pub fn recheck_existence(&self, key: &str) -> Result<Option<DownloadRecord>> {
        let Some(mut rec) = self.find(key)? else {
            return Ok(None);
        };
        let present = rec.artifact_present();
        if present != rec.file_exists {
            tracing::info!(key, present, path = %rec.artifact_path.display(), "record existence changed");
            self.set_file_exists(key, present)?;
            rec.file_exists = present;
        }
        Ok(Some(rec))
    }

    // ---------------- Conversations / personas ----------------

    pub fn list_conversations(&self) -> Result<Vec<ConversationRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id,title,persona,created_at,updated_at FROM conversations ORDER BY updated_at DESC, id",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok(ConversationRow {
                id: r.get(0)?,
                title: r.get(1)?,
                persona: r.get(2)?,
                created_at: r.get(3)?,
                updated_at: r.get(4)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn messages_for(&self, conversation_id: &str) -> Result<Vec<MessageRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT conversation_id,model,role,content,timestamp,completed_at FROM messages WHERE conversation_id=? ORDER BY id",
        )?;
        let rows = stmt.query_map(params![conversation_id], |r| {
            Ok(MessageRow {
                conversation_id: r.get(0)?,
                model: r.get(1)?,
                role: r.get(2)?,
                content: r.get(3)?,
                timestamp: r.get(4)?,
                completed_at: r.get(5)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn list_personas(&self) -> Result<Vec<PersonaRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT key,name,icon,icon_path,description,system_prompt FROM personas ORDER BY key",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok(PersonaRow {
                key: r.get(0)?,
                name: r.get(1)?,
                icon: r.get(2)?,
                icon_path: r.get(3)?,
                description: r.get(4)?,
                system_prompt: r.get(5)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn counts(&self) -> Result<TableCounts> {
        let conn = self.conn()?;
        let count = |table: &str| -> rusqlite::Result<u64> {
            let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| {
                r.get(0)
            })?;
            Ok(n.max(0) as u64)
        };
        Ok(TableCounts {
            conversations: count("conversations")?,
            messages: count("messages")?,
            download_records: count("download_records")?,
            personas: count("personas")?,
        })
    }

    // ---------------- Metadata ----------------

    pub fn meta_get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row("SELECT value FROM meta WHERE key=?", params![key], |r| {
                r.get(0)
            })
            .optional()?)
    }

    pub fn meta_set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO meta(key,value) VALUES (?,?)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn migration_completed_at(&self) -> Result<Option<String>> {
        self.meta_get(META_MIGRATION_COMPLETED)
    }

    /// Write every legacy row and the completion marker in a single transaction.
    ///
    /// Any failure rolls the whole import back, leaving the tables as they were.
    pub fn import_legacy(&self, batch: &LegacyImport) -> Result<TableCounts> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for c in &batch.conversations {
            // Re-importing a conversation replaces its transcript instead of appending to it.
            tx.execute(
                "DELETE FROM messages WHERE conversation_id=?",
                params![c.id],
            )?;
            tx.execute(
                "INSERT OR REPLACE INTO conversations(id,title,persona,created_at,updated_at) VALUES (?,?,?,?,?)",
                params![c.id, c.title, c.persona, c.created_at, c.updated_at],
            )?;
        }
        for m in &batch.messages {
            tx.execute(
                "INSERT INTO messages(conversation_id,model,role,content,timestamp,completed_at) VALUES (?,?,?,?,?,?)",
                params![m.conversation_id, m.model, m.role, m.content, m.timestamp, m.completed_at],
            )?;
        }
        for r in &batch.records {
            upsert_record(&tx, r)?;
        }
        for p in &batch.personas {
            tx.execute(
                "INSERT OR REPLACE INTO personas(key,name,icon,icon_path,description,system_prompt) VALUES (?,?,?,?,?,?)",
                params![p.key, p.name, p.icon, p.icon_path, p.description, p.system_prompt],
            )?;
        }
        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        tx.execute(
            "INSERT OR REPLACE INTO meta(key,value) VALUES (?,?)",
            params![META_MIGRATION_COMPLETED, now],
        )?;
        tx.commit()?;
        Ok(TableCounts {
            conversations: batch.conversations.len() as u64,
            messages: batch.messages.len() as u64,
            download_records: batch.records.len() as u64,
            personas: batch.personas.len() as u64,
        })
    }

    // ---------------- Async wrappers (spawn_blocking) ----------------

    pub async fn find_async(&self, key: &str) -> Result<Option<DownloadRecord>> {
        let k = self.clone();
        let s = key.to_string();
        tokio::task::spawn_blocking(move || k.find(&s))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))?
    }

    pub async fn find_by_name_async(&self, needle: &str) -> Result<Vec<DownloadRecord>> {
        let k = self.clone();
        let s = needle.to_string();
        tokio::task::spawn_blocking(move || k.find_by_name(&s))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))?
    }

    pub async fn put_async(&self, rec: &DownloadRecord) -> Result<()> {
        let k = self.clone();
        let rec = rec.clone();
        tokio::task::spawn_blocking(move || k.put(&rec))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))?
    }

    pub async fn delete_async(&self, key: &str) -> Result<bool> {
        let k = self.clone();
        let s = key.to_string();
        tokio::task::spawn_blocking(move || k.delete(&s))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))?
    }

    pub async fn list_async(&self) -> Result<Vec<DownloadRecord>> {
        let k = self.clone();
        tokio::task::spawn_blocking(move || k.list())
            .await
            .map_err(|e| StoreError::Join(e.to_string()))?
    }

    pub async fn recheck_existence_async(&self, key: &str) -> Result<Option<DownloadRecord>> {
        let k = self.clone();
        let s = key.to_string();
        tokio::task::spawn_blocking(move || k.recheck_existence(&s))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))?
    }
}
