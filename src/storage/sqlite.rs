use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension};

use super::{unix_now, Conversation, ConversationStore, DocumentRecord, NewMessage, StoredMessage};
use crate::embeddings::{rank, Embedding, ScoredChunk, VectorIndex};
use crate::error::CacheError;
use crate::llm::{CacheBackend, CacheEntry, Role};
use crate::rag::DocumentChunk;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS conversations (
    id          TEXT PRIMARY KEY,
    title       TEXT NOT NULL,
    created_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id  TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    role             TEXT NOT NULL,
    content          TEXT NOT NULL,
    provider         TEXT,
    created_at       INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, id);

CREATE TABLE IF NOT EXISTS documents (
    id          TEXT PRIMARY KEY,
    title       TEXT NOT NULL,
    source      TEXT,
    created_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS chunks (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    document_id    TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
    chunk_index    INTEGER NOT NULL,
    text           TEXT NOT NULL,
    token_count    INTEGER NOT NULL,
    overlap_words  INTEGER NOT NULL,
    UNIQUE(document_id, chunk_index)
);

CREATE TABLE IF NOT EXISTS embeddings (
    chunk_id   INTEGER PRIMARY KEY REFERENCES chunks(id) ON DELETE CASCADE,
    model      TEXT NOT NULL,
    dimension  INTEGER NOT NULL,
    vector     BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS cache_entries (
    key         TEXT PRIMARY KEY,
    payload     TEXT NOT NULL,
    created_at  REAL NOT NULL,
    ttl_secs    REAL NOT NULL
);
"#;

/// Single-file store for conversations, documents, embeddings and cached
/// responses.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database {}", path.display()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA).context("Failed to apply schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `work` against the connection on the blocking pool, so async
    /// callers never hold a runtime thread while SQLite does I/O.
    async fn blocking<T, F>(&self, work: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            work(&mut conn)
        })
        .await
        .context("database task failed")?
    }

    // ---- documents -------------------------------------------------------

    pub fn create_document(&self, title: &str, source: Option<&str>) -> Result<DocumentRecord> {
        let record = DocumentRecord {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.to_string(),
            source: source.map(String::from),
            chunk_count: 0,
            created_at: unix_now(),
        };

        self.conn().execute(
            "INSERT INTO documents (id, title, source, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![record.id, record.title, record.source, record.created_at],
        )?;
        Ok(record)
    }

    pub fn list_documents(&self) -> Result<Vec<DocumentRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT d.id, d.title, d.source, d.created_at, COUNT(c.id)
             FROM documents d LEFT JOIN chunks c ON c.document_id = d.id
             GROUP BY d.id
             ORDER BY d.created_at DESC, d.rowid DESC",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok(DocumentRecord {
                id: row.get(0)?,
                title: row.get(1)?,
                source: row.get(2)?,
                created_at: row.get(3)?,
                chunk_count: row.get::<_, i64>(4)? as usize,
            })
        })?;

        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Look a document up by id, falling back to an exact title match
    pub fn find_document(&self, id_or_title: &str) -> Result<Option<DocumentRecord>> {
        let documents = self.list_documents()?;
        Ok(documents
            .iter()
            .find(|d| d.id == id_or_title)
            .or_else(|| documents.iter().find(|d| d.title == id_or_title))
            .cloned())
    }

    /// Delete a document together with its chunks and embeddings
    pub fn delete_document(&self, id: &str) -> Result<bool> {
        let removed = self
            .conn()
            .execute("DELETE FROM documents WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }

    fn index_model(conn: &Connection) -> rusqlite::Result<Option<(String, usize)>> {
        conn.query_row("SELECT model, dimension FROM embeddings LIMIT 1", [], |row| {
            Ok((row.get(0)?, row.get::<_, i64>(1)? as usize))
        })
        .optional()
    }
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

fn to_unix_secs(time: SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

fn from_unix_secs(secs: f64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs_f64(secs.max(0.0))
}

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn create_conversation(&self, title: &str) -> Result<Conversation> {
        let conversation = Conversation {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.to_string(),
            created_at: unix_now(),
        };

        let row = conversation.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO conversations (id, title, created_at) VALUES (?1, ?2, ?3)",
                params![row.id, row.title, row.created_at],
            )?;
            Ok(())
        })
        .await?;
        Ok(conversation)
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, title, created_at FROM conversations ORDER BY created_at DESC, rowid DESC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(Conversation {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    created_at: row.get(2)?,
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let id = id.to_string();
        self.blocking(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT id, title, created_at FROM conversations WHERE id = ?1",
                    params![id],
                    |row| {
                        Ok(Conversation {
                            id: row.get(0)?,
                            title: row.get(1)?,
                            created_at: row.get(2)?,
                        })
                    },
                )
                .optional()?)
        })
        .await
    }

    async fn messages(&self, conversation_id: &str) -> Result<Vec<StoredMessage>> {
        let conversation_id = conversation_id.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, conversation_id, role, content, provider, created_at
                 FROM messages WHERE conversation_id = ?1 ORDER BY id",
            )?;

            let rows = stmt.query_map(params![conversation_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            })?;

            let mut messages = Vec::new();
            for row in rows {
                let (id, conversation_id, role, content, provider, created_at) = row?;
                let role = Role::parse(&role)
                    .with_context(|| format!("message {} has unknown role `{}`", id, role))?;
                messages.push(StoredMessage {
                    id,
                    conversation_id,
                    role,
                    content,
                    provider,
                    created_at,
                });
            }
            Ok(messages)
        })
        .await
    }

    async fn append_message(&self, conversation_id: &str, message: NewMessage) -> Result<StoredMessage> {
        let conversation_id = conversation_id.to_string();
        let created_at = unix_now();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO messages (conversation_id, role, content, provider, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    conversation_id,
                    message.role.as_str(),
                    message.content,
                    message.provider,
                    created_at
                ],
            )
            .with_context(|| format!("Failed to append message to conversation {}", conversation_id))?;

            Ok(StoredMessage {
                id: conn.last_insert_rowid(),
                conversation_id,
                role: message.role,
                content: message.content,
                provider: message.provider,
                created_at,
            })
        })
        .await
    }

    async fn delete_conversation(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.blocking(move |conn| {
            let removed = conn.execute("DELETE FROM conversations WHERE id = ?1", params![id])?;
            Ok(removed > 0)
        })
        .await
    }
}

#[async_trait]
impl VectorIndex for SqliteStore {
    async fn insert(&self, chunk: &DocumentChunk, embedding: &Embedding) -> Result<()> {
        if embedding.vector.is_empty() {
            anyhow::bail!("refusing to index an empty vector");
        }

        let chunk = chunk.clone();
        let embedding = embedding.clone();
        self.blocking(move |conn| {
            if let Some((model, dimension)) = Self::index_model(conn)? {
                embedding.ensure_compatible(&model, dimension)?;
            }

            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO chunks (document_id, chunk_index, text, token_count, overlap_words)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    chunk.document_id,
                    chunk.chunk_index as i64,
                    chunk.text,
                    chunk.token_count as i64,
                    chunk.overlap_words as i64
                ],
            )?;
            let chunk_id = tx.last_insert_rowid();
            tx.execute(
                "INSERT INTO embeddings (chunk_id, model, dimension, vector) VALUES (?1, ?2, ?3, ?4)",
                params![
                    chunk_id,
                    embedding.model,
                    embedding.dimension() as i64,
                    encode_vector(&embedding.vector)
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn nearest(&self, query: &Embedding, k: usize) -> Result<Vec<ScoredChunk>> {
        let query = query.clone();
        self.blocking(move |conn| {
            let Some((model, dimension)) = Self::index_model(conn)? else {
                return Ok(Vec::new());
            };
            query.ensure_compatible(&model, dimension)?;

            let mut stmt = conn.prepare(
                "SELECT c.document_id, c.chunk_index, c.text, c.token_count, c.overlap_words, e.vector
                 FROM chunks c JOIN embeddings e ON e.chunk_id = c.id
                 ORDER BY c.id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    DocumentChunk {
                        document_id: row.get(0)?,
                        chunk_index: row.get::<_, i64>(1)? as usize,
                        text: row.get(2)?,
                        token_count: row.get::<_, i64>(3)? as usize,
                        overlap_words: row.get::<_, i64>(4)? as usize,
                    },
                    decode_vector(&row.get::<_, Vec<u8>>(5)?),
                ))
            })?;
            let candidates = rows.collect::<rusqlite::Result<Vec<_>>>()?;

            Ok(rank(
                &query.vector,
                candidates.iter().map(|(chunk, vector)| (chunk, vector.as_slice())),
                k,
            ))
        })
        .await
    }

    async fn remove_document(&self, document_id: &str) -> Result<usize> {
        let document_id = document_id.to_string();
        self.blocking(move |conn| {
            Ok(conn.execute("DELETE FROM chunks WHERE document_id = ?1", params![document_id])?)
        })
        .await
    }

    async fn len(&self) -> Result<usize> {
        self.blocking(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM embeddings", [], |row| row.get(0))?;
            Ok(count as usize)
        })
        .await
    }
}

#[async_trait]
impl CacheBackend for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let key = key.to_string();
        let entry = self
            .blocking(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT payload, created_at, ttl_secs FROM cache_entries WHERE key = ?1",
                        params![key],
                        |row| {
                            Ok(CacheEntry {
                                payload: row.get(0)?,
                                created_at: from_unix_secs(row.get(1)?),
                                ttl: Duration::from_secs_f64(row.get::<_, f64>(2)?.max(0.0)),
                            })
                        },
                    )
                    .optional()?)
            })
            .await?;
        Ok(entry)
    }

    async fn set(&self, key: &str, entry: CacheEntry) -> Result<(), CacheError> {
        let key = key.to_string();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO cache_entries (key, payload, created_at, ttl_secs)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    key,
                    entry.payload,
                    to_unix_secs(entry.created_at),
                    entry.ttl.as_secs_f64()
                ],
            )?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, CacheError> {
        let key = key.to_string();
        let removed = self
            .blocking(move |conn| {
                Ok(conn.execute("DELETE FROM cache_entries WHERE key = ?1", params![key])?)
            })
            .await?;
        Ok(removed > 0)
    }

    async fn remove_matching(&self, pattern: &Regex) -> Result<usize, CacheError> {
        let pattern = pattern.clone();
        let removed = self
            .blocking(move |conn| {
                let tx = conn.transaction()?;

                let keys: Vec<String> = {
                    let mut stmt = tx.prepare("SELECT key FROM cache_entries")?;
                    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
                    rows.collect::<rusqlite::Result<Vec<_>>>()?
                };

                let mut removed = 0;
                for key in keys.iter().filter(|k| pattern.is_match(k)) {
                    removed += tx.execute("DELETE FROM cache_entries WHERE key = ?1", params![key])?;
                }
                tx.commit()?;
                Ok(removed)
            })
            .await?;
        Ok(removed)
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        let now = SystemTime::now();
        let keys = self
            .blocking(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT key, created_at, ttl_secs FROM cache_entries ORDER BY key")?;
                let rows = stmt.query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, f64>(2)?,
                    ))
                })?;

                let mut keys = Vec::new();
                for row in rows {
                    let (key, created_at, ttl) = row?;
                    let entry = CacheEntry {
                        payload: String::new(),
                        created_at: from_unix_secs(created_at),
                        ttl: Duration::from_secs_f64(ttl.max(0.0)),
                    };
                    if !entry.is_expired(now) {
                        keys.push(key);
                    }
                }
                Ok(keys)
            })
            .await?;
        Ok(keys)
    }
}
