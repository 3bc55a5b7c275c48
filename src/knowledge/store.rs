//! SQLite-backed persona and knowledge store
//!
//! Holds persona records, uploaded knowledge documents, and per-call
//! transcripts. Persona text and the flattened chunk list are cached
//! in-process with TTLs; any admin write invalidates the affected cache.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{chunker, retrieval};
use crate::types::Message;

/// Persona text cache lifetime.
const PERSONA_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Chunk list cache lifetime.
const CHUNK_CACHE_TTL: Duration = Duration::from_secs(10 * 60);

/// Name of the persona used when a call supplies none.
pub const DEFAULT_PERSONA_NAME: &str = "default";

/// Seeded when no persona record exists yet.
const FALLBACK_PERSONA: &str = "You are a polite customer support agent for a business \
messaging platform. Answer briefly, in one or two sentences, the way you would on a \
phone call. If you do not know something, say so instead of guessing.";

#[derive(Debug, Clone, Serialize)]
pub struct PersonaRecord {
    pub id: String,
    pub name: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentRecord {
    pub id: String,
    pub filename: String,
    pub mimetype: String,
    pub content: String,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentMeta {
    pub id: String,
    pub filename: String,
    pub mimetype: String,
    pub content_length: usize,
    pub uploaded_at: DateTime<Utc>,
}

pub struct KnowledgeStore {
    conn: Arc<Mutex<Connection>>,
    persona_cache: StdMutex<HashMap<String, (Instant, String)>>,
    chunk_cache: StdMutex<Option<(Instant, Arc<Vec<String>>)>>,
}

impl KnowledgeStore {
    /// Open (or create) the store at the given path.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let conn = Connection::open(&path).context("Failed to open knowledge database")?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::init_schema(&conn)?;

        info!("Knowledge store ready at {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            persona_cache: StdMutex::new(HashMap::new()),
            chunk_cache: StdMutex::new(None),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS personas (
                id TEXT PRIMARY KEY,
                name TEXT UNIQUE NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                filename TEXT NOT NULL,
                mimetype TEXT NOT NULL,
                content TEXT NOT NULL,
                uploaded_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS transcripts (
                id TEXT PRIMARY KEY,
                call_id TEXT NOT NULL,
                direction TEXT NOT NULL,
                history TEXT NOT NULL,
                duration_secs REAL,
                status TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_documents_uploaded ON documents(uploaded_at);
            CREATE INDEX IF NOT EXISTS idx_transcripts_call ON transcripts(call_id);
            "#,
        )?;
        Ok(())
    }

    // ─── Personas ────────────────────────────────────────────

    /// Persona text by name, seeding the built-in fallback on first use.
    /// Cached for five minutes; invalidated by `update_persona`.
    pub async fn load_persona(&self, name: &str) -> Result<String> {
        if let Some(content) = self.cached_persona(name) {
            return Ok(content);
        }

        if let Some(record) = self.get_persona(name).await? {
            self.cache_persona(name, &record.content);
            return Ok(record.content);
        }

        debug!("Persona \"{}\" missing, seeding fallback", name);
        let record = self.update_persona(name, FALLBACK_PERSONA).await?;
        self.cache_persona(name, &record.content);
        Ok(record.content)
    }

    pub async fn get_persona(&self, name: &str) -> Result<Option<PersonaRecord>> {
        let conn = self.conn.lock().await;
        let record = conn
            .query_row(
                "SELECT id, name, content, created_at, updated_at FROM personas WHERE name = ?1",
                params![name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;

        Ok(record.map(|(id, name, content, created_at, updated_at)| PersonaRecord {
            id,
            name,
            content,
            created_at: parse_timestamp(&created_at),
            updated_at: parse_timestamp(&updated_at),
        }))
    }

    /// Upsert a persona and invalidate its cache entry.
    pub async fn update_persona(&self, name: &str, content: &str) -> Result<PersonaRecord> {
        let now = Utc::now();
        let conn = self.conn.lock().await;
        let existing: Option<(String, String)> = conn
            .query_row(
                "SELECT id, created_at FROM personas WHERE name = ?1",
                params![name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let (id, created_at) = match existing {
            Some((id, created)) => (id, parse_timestamp(&created)),
            None => (uuid::Uuid::new_v4().to_string(), now),
        };

        conn.execute(
            r#"INSERT OR REPLACE INTO personas (id, name, content, created_at, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5)"#,
            params![id, name, content, created_at.to_rfc3339(), now.to_rfc3339()],
        )?;
        drop(conn);

        self.invalidate_persona(name);
        info!("Persona \"{}\" updated ({} chars)", name, content.len());

        Ok(PersonaRecord {
            id,
            name: name.to_string(),
            content: content.to_string(),
            created_at,
            updated_at: now,
        })
    }

    fn cached_persona(&self, name: &str) -> Option<String> {
        let cache = self.persona_cache.lock().ok()?;
        cache
            .get(name)
            .filter(|(stamp, _)| stamp.elapsed() < PERSONA_CACHE_TTL)
            .map(|(_, content)| content.clone())
    }

    fn cache_persona(&self, name: &str, content: &str) {
        if let Ok(mut cache) = self.persona_cache.lock() {
            cache.insert(name.to_string(), (Instant::now(), content.to_string()));
        }
    }

    fn invalidate_persona(&self, name: &str) {
        if let Ok(mut cache) = self.persona_cache.lock() {
            cache.remove(name);
        }
    }

    // ─── Documents ───────────────────────────────────────────

    pub async fn insert_document(
        &self,
        filename: &str,
        mimetype: &str,
        content: &str,
    ) -> Result<DocumentRecord> {
        let record = DocumentRecord {
            id: uuid::Uuid::new_v4().to_string(),
            filename: filename.to_string(),
            mimetype: mimetype.to_string(),
            content: content.to_string(),
            uploaded_at: Utc::now(),
        };

        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT INTO documents (id, filename, mimetype, content, uploaded_at)
               VALUES (?1, ?2, ?3, ?4, ?5)"#,
            params![
                record.id,
                record.filename,
                record.mimetype,
                record.content,
                record.uploaded_at.to_rfc3339()
            ],
        )?;
        drop(conn);

        self.invalidate_chunks();
        info!("Document \"{}\" stored ({} chars)", record.filename, record.content.len());
        Ok(record)
    }

    pub async fn list_documents(&self) -> Result<Vec<DocumentMeta>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, filename, mimetype, length(content), uploaded_at
             FROM documents ORDER BY uploaded_at, id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(DocumentMeta {
                id: row.get(0)?,
                filename: row.get(1)?,
                mimetype: row.get(2)?,
                content_length: row.get::<_, i64>(3)? as usize,
                uploaded_at: parse_timestamp(&row.get::<_, String>(4)?),
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub async fn get_document(&self, id: &str) -> Result<Option<DocumentRecord>> {
        let conn = self.conn.lock().await;
        let record = conn
            .query_row(
                "SELECT id, filename, mimetype, content, uploaded_at FROM documents WHERE id = ?1",
                params![id],
                |row| {
                    Ok(DocumentRecord {
                        id: row.get(0)?,
                        filename: row.get(1)?,
                        mimetype: row.get(2)?,
                        content: row.get(3)?,
                        uploaded_at: parse_timestamp(&row.get::<_, String>(4)?),
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    pub async fn delete_document(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute("DELETE FROM documents WHERE id = ?1", params![id])?;
        drop(conn);
        if deleted > 0 {
            self.invalidate_chunks();
        }
        Ok(deleted > 0)
    }

    // ─── Retrieval ───────────────────────────────────────────

    /// Top-`k` chunks across all documents for a query.
    pub async fn relevant_chunks(&self, query: &str, k: usize) -> Result<Vec<String>> {
        let chunks = self.all_chunks().await?;
        Ok(retrieval::relevant_chunks(query, &chunks, k))
    }

    /// Flattened chunk list over all documents, in upload order.
    /// Cached for ten minutes; invalidated by any document write.
    async fn all_chunks(&self) -> Result<Arc<Vec<String>>> {
        if let Ok(cache) = self.chunk_cache.lock() {
            if let Some((stamp, chunks)) = cache.as_ref() {
                if stamp.elapsed() < CHUNK_CACHE_TTL {
                    return Ok(chunks.clone());
                }
            }
        }

        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT content FROM documents ORDER BY uploaded_at, id")?;
        let contents: Vec<String> =
            stmt.query_map([], |row| row.get(0))?.filter_map(|r| r.ok()).collect();
        drop(stmt);
        drop(conn);

        let chunks: Vec<String> = contents
            .iter()
            .flat_map(|content| {
                chunker::chunk_text(content, chunker::CHUNK_SIZE, chunker::CHUNK_OVERLAP)
            })
            .collect();
        debug!("Chunk cache rebuilt: {} chunks", chunks.len());

        let chunks = Arc::new(chunks);
        if let Ok(mut cache) = self.chunk_cache.lock() {
            *cache = Some((Instant::now(), chunks.clone()));
        }
        Ok(chunks)
    }

    fn invalidate_chunks(&self) {
        if let Ok(mut cache) = self.chunk_cache.lock() {
            *cache = None;
        }
    }

    // ─── Transcripts ─────────────────────────────────────────

    /// Persist a finished call's conversation. Failures are logged by
    /// the caller; nothing here is fatal to the session teardown path.
    pub async fn save_transcript(
        &self,
        call_id: &str,
        direction: &str,
        history: &[Message],
        duration_secs: f64,
        status: &str,
    ) -> Result<()> {
        let history_json = serde_json::to_string(history)?;
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT INTO transcripts (id, call_id, direction, history, duration_secs, status, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
            params![
                uuid::Uuid::new_v4().to_string(),
                call_id,
                direction,
                history_json,
                duration_secs,
                status,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }
}

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|e| {
            warn!("Bad timestamp \"{}\" in store: {}", value, e);
            Utc::now()
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (KnowledgeStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = KnowledgeStore::open(dir.path().join("test.db")).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_persona_seeded_on_first_load() {
        let (store, _dir) = store().await;
        let content = store.load_persona(DEFAULT_PERSONA_NAME).await.unwrap();
        assert!(content.contains("customer support"));
        // Seeding persisted the record.
        let record = store.get_persona(DEFAULT_PERSONA_NAME).await.unwrap().unwrap();
        assert_eq!(record.content, content);
    }

    #[tokio::test]
    async fn test_update_persona_visible_through_cache() {
        let (store, _dir) = store().await;
        let _ = store.load_persona(DEFAULT_PERSONA_NAME).await.unwrap();
        store
            .update_persona(DEFAULT_PERSONA_NAME, "You are Priya from Mumbai.")
            .await
            .unwrap();
        let content = store.load_persona(DEFAULT_PERSONA_NAME).await.unwrap();
        assert_eq!(content, "You are Priya from Mumbai.");
    }

    #[tokio::test]
    async fn test_update_persona_keeps_identity() {
        let (store, _dir) = store().await;
        let first = store.update_persona("sales", "v1").await.unwrap();
        let second = store.update_persona("sales", "v2").await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.created_at, second.created_at);
        assert!(second.updated_at >= first.updated_at);
    }

    #[tokio::test]
    async fn test_document_lifecycle() {
        let (store, _dir) = store().await;
        let doc = store
            .insert_document("pricing.md", "text/markdown", "WhatsApp pricing: 500 rupees.")
            .await
            .unwrap();

        let listed = store.list_documents().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].filename, "pricing.md");
        assert_eq!(listed[0].content_length, doc.content.len());

        let fetched = store.get_document(&doc.id).await.unwrap().unwrap();
        assert_eq!(fetched.content, doc.content);

        assert!(store.delete_document(&doc.id).await.unwrap());
        assert!(!store.delete_document(&doc.id).await.unwrap());
        assert!(store.list_documents().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retrieval_sees_new_documents() {
        let (store, _dir) = store().await;
        // Warm the (empty) chunk cache, then write; the write must
        // invalidate so retrieval sees the new document.
        assert!(store.relevant_chunks("whatsapp", 3).await.unwrap().is_empty());
        store
            .insert_document("kb.txt", "text/plain", "WhatsApp bulk messaging pricing: cheap.")
            .await
            .unwrap();
        let top = store.relevant_chunks("whatsapp pricing", 3).await.unwrap();
        assert_eq!(top.len(), 1);
        assert!(top[0].contains("WhatsApp"));
    }

    #[tokio::test]
    async fn test_save_transcript() {
        let (store, _dir) = store().await;
        let history = vec![Message::user("hi"), Message::assistant("hello")];
        store
            .save_transcript("call-1", "inbound", &history, 12.5, "completed")
            .await
            .unwrap();
    }
}
