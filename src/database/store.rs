use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use log::{info, warn};
use thiserror::Error;
use tokio_rusqlite::Connection;

use super::models::{Conversation, ConversationKind, Document, FileType, Message, Role, StoredChunk};

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] tokio_rusqlite::Error),
    #[error("Database connection error: {0}")]
    Connection(String),
    #[error("Not found: {0}")]
    NotFound(String),
}

fn now_text() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

type DocumentRow = (i64, String, String, String, i64, String);
type ConversationRow = (i64, String, String, String, String, String);
type MessageRow = (i64, i64, String, String, String);

fn document_from_row((id, owner_id, title, file_type, processed, uploaded_at): DocumentRow) -> Document {
    Document {
        id,
        owner_id,
        title,
        file_type: FileType::parse(&file_type).unwrap_or(FileType::Txt),
        processed: processed != 0,
        uploaded_at: parse_ts(&uploaded_at),
    }
}

fn conversation_from_row(
    (id, owner_id, title, kind, created_at, updated_at): ConversationRow,
) -> Conversation {
    Conversation {
        id,
        owner_id,
        title,
        kind: ConversationKind::parse(&kind),
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    }
}

fn message_from_row((id, conversation_id, role, content, timestamp): MessageRow) -> Message {
    Message {
        id,
        conversation_id,
        role: Role::parse(&role),
        content,
        timestamp: parse_ts(&timestamp),
    }
}

/// SQLite-backed store for conversations, messages, documents, chunks and
/// attachments. Embeddings are kept as JSON float arrays in the chunk rows.
#[derive(Clone)]
pub struct ChatStore {
    conn: Arc<Connection>,
}

impl ChatStore {
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self, DatabaseError> {
        let conn = Connection::open(path)
            .await
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;
        let store = Self { conn: Arc::new(conn) };
        store.initialize().await?;
        Ok(store)
    }

    pub async fn in_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;
        let store = Self { conn: Arc::new(conn) };
        store.initialize().await?;
        Ok(store)
    }

    async fn initialize(&self) -> Result<(), DatabaseError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "PRAGMA foreign_keys = ON;
                    CREATE TABLE IF NOT EXISTS documents (
                        id INTEGER PRIMARY KEY,
                        owner_id TEXT NOT NULL,
                        title TEXT NOT NULL,
                        file_type TEXT NOT NULL,
                        processed INTEGER NOT NULL DEFAULT 0,
                        uploaded_at TEXT NOT NULL
                    );
                    CREATE TABLE IF NOT EXISTS document_chunks (
                        id INTEGER PRIMARY KEY,
                        document_id INTEGER NOT NULL
                            REFERENCES documents(id) ON DELETE CASCADE,
                        chunk_index INTEGER NOT NULL,
                        content TEXT NOT NULL,
                        embedding TEXT NOT NULL,
                        UNIQUE(document_id, chunk_index)
                    );
                    CREATE TABLE IF NOT EXISTS conversations (
                        id INTEGER PRIMARY KEY,
                        owner_id TEXT NOT NULL,
                        title TEXT NOT NULL,
                        kind TEXT NOT NULL DEFAULT 'general',
                        created_at TEXT NOT NULL,
                        updated_at TEXT NOT NULL
                    );
                    CREATE TABLE IF NOT EXISTS messages (
                        id INTEGER PRIMARY KEY,
                        conversation_id INTEGER NOT NULL
                            REFERENCES conversations(id) ON DELETE CASCADE,
                        role TEXT NOT NULL,
                        content TEXT NOT NULL,
                        timestamp TEXT NOT NULL
                    );
                    CREATE TABLE IF NOT EXISTS attachments (
                        conversation_id INTEGER NOT NULL
                            REFERENCES conversations(id) ON DELETE CASCADE,
                        document_id INTEGER NOT NULL
                            REFERENCES documents(id) ON DELETE CASCADE,
                        created_at TEXT NOT NULL,
                        PRIMARY KEY (conversation_id, document_id)
                    );
                    CREATE INDEX IF NOT EXISTS idx_messages_conversation
                        ON messages(conversation_id, timestamp);
                    CREATE INDEX IF NOT EXISTS idx_chunks_document
                        ON document_chunks(document_id, chunk_index);",
                )
            })
            .await?;

        info!("Database initialized successfully");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Documents
    // ------------------------------------------------------------------

    pub async fn create_document(
        &self,
        owner_id: String,
        title: String,
        file_type: FileType,
    ) -> Result<i64, DatabaseError> {
        let uploaded_at = now_text();
        let id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO documents (owner_id, title, file_type, processed, uploaded_at)
                     VALUES (?1, ?2, ?3, 0, ?4)",
                    (&owner_id, &title, file_type.as_str(), &uploaded_at),
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        Ok(id)
    }

    pub async fn get_document(
        &self,
        id: i64,
        owner_id: String,
    ) -> Result<Option<Document>, DatabaseError> {
        let result = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, owner_id, title, file_type, processed, uploaded_at
                     FROM documents WHERE id = ?1 AND owner_id = ?2",
                )?;
                let mut rows = stmt.query_map((id, &owner_id), |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                })?;
                rows.next().transpose()
            })
            .await?;
        Ok(result.map(document_from_row))
    }

    pub async fn list_documents(
        &self,
        owner_id: String,
        limit: i64,
    ) -> Result<Vec<Document>, DatabaseError> {
        let result = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, owner_id, title, file_type, processed, uploaded_at
                     FROM documents WHERE owner_id = ?1
                     ORDER BY uploaded_at DESC LIMIT ?2",
                )?;
                let rows = stmt.query_map((&owner_id, limit), |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                })?;
                let mut documents = Vec::new();
                for row in rows {
                    documents.push(row?);
                }
                Ok(documents)
            })
            .await?;
        Ok(result.into_iter().map(document_from_row).collect())
    }

    pub async fn delete_document(&self, id: i64, owner_id: String) -> Result<bool, DatabaseError> {
        let deleted = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "DELETE FROM documents WHERE id = ?1 AND owner_id = ?2",
                    (id, &owner_id),
                )?;
                Ok(n > 0)
            })
            .await?;
        Ok(deleted)
    }

    /// Replaces a document's chunks and flips `processed` in one transaction,
    /// so a partially-ingested document is never observable.
    pub async fn store_chunks_and_mark_processed(
        &self,
        document_id: i64,
        chunks: Vec<(i64, String, Vec<f32>)>,
    ) -> Result<(), DatabaseError> {
        // Serialize embeddings up front so the write closure only fails on
        // SQLite errors.
        let rows: Vec<(i64, String, String)> = chunks
            .into_iter()
            .map(|(index, text, embedding)| {
                let encoded = serde_json::to_string(&embedding).unwrap_or_else(|_| "[]".to_string());
                (index, text, encoded)
            })
            .collect();

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM document_chunks WHERE document_id = ?1",
                    [document_id],
                )?;
                for (index, text, embedding) in &rows {
                    tx.execute(
                        "INSERT INTO document_chunks (document_id, chunk_index, content, embedding)
                         VALUES (?1, ?2, ?3, ?4)",
                        (document_id, index, text, embedding),
                    )?;
                }
                tx.execute(
                    "UPDATE documents SET processed = 1 WHERE id = ?1",
                    [document_id],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// All chunks of processed documents owned by `owner_id`, joined with
    /// the document title. Chunks whose embedding fails to decode are
    /// skipped, not surfaced.
    pub async fn processed_chunks_for_owner(
        &self,
        owner_id: String,
    ) -> Result<Vec<StoredChunk>, DatabaseError> {
        let raw = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT c.document_id, d.title, c.chunk_index, c.content, c.embedding
                     FROM document_chunks c
                     JOIN documents d ON d.id = c.document_id
                     WHERE d.owner_id = ?1 AND d.processed = 1
                     ORDER BY c.document_id, c.chunk_index",
                )?;
                let rows = stmt.query_map([&owner_id], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                })?;
                let mut chunks = Vec::new();
                for row in rows {
                    chunks.push(row?);
                }
                Ok(chunks)
            })
            .await?;

        let mut chunks = Vec::with_capacity(raw.len());
        for (document_id, document_title, chunk_index, text, embedding_json) in raw {
            match serde_json::from_str::<Vec<f32>>(&embedding_json) {
                Ok(embedding) => chunks.push(StoredChunk {
                    document_id,
                    document_title,
                    chunk_index,
                    text,
                    embedding,
                }),
                Err(e) => {
                    warn!(
                        "Skipping chunk {} of document {}: undecodable embedding: {}",
                        chunk_index, document_id, e
                    );
                }
            }
        }
        Ok(chunks)
    }

    // ------------------------------------------------------------------
    // Conversations
    // ------------------------------------------------------------------

    pub async fn create_conversation(
        &self,
        owner_id: String,
        title: String,
        kind: ConversationKind,
    ) -> Result<Conversation, DatabaseError> {
        let now = now_text();
        let conversation = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO conversations (owner_id, title, kind, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?4)",
                    (&owner_id, &title, kind.as_str(), &now),
                )?;
                let id = conn.last_insert_rowid();
                Ok(Conversation {
                    id,
                    owner_id,
                    title,
                    kind,
                    created_at: parse_ts(&now),
                    updated_at: parse_ts(&now),
                })
            })
            .await?;
        Ok(conversation)
    }

    pub async fn get_conversation(
        &self,
        id: i64,
        owner_id: String,
    ) -> Result<Option<Conversation>, DatabaseError> {
        let result = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, owner_id, title, kind, created_at, updated_at
                     FROM conversations WHERE id = ?1 AND owner_id = ?2",
                )?;
                let mut rows = stmt.query_map((id, &owner_id), |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                })?;
                rows.next().transpose()
            })
            .await?;
        Ok(result.map(conversation_from_row))
    }

    pub async fn list_conversations(
        &self,
        owner_id: String,
        limit: i64,
    ) -> Result<Vec<Conversation>, DatabaseError> {
        let result = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, owner_id, title, kind, created_at, updated_at
                     FROM conversations WHERE owner_id = ?1
                     ORDER BY updated_at DESC LIMIT ?2",
                )?;
                let rows = stmt.query_map((&owner_id, limit), |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                })?;
                let mut conversations = Vec::new();
                for row in rows {
                    conversations.push(row?);
                }
                Ok(conversations)
            })
            .await?;
        Ok(result.into_iter().map(conversation_from_row).collect())
    }

    pub async fn rename_conversation(
        &self,
        id: i64,
        owner_id: String,
        title: String,
    ) -> Result<bool, DatabaseError> {
        let now = now_text();
        let updated = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE conversations SET title = ?1, updated_at = ?2
                     WHERE id = ?3 AND owner_id = ?4",
                    (&title, &now, id, &owner_id),
                )?;
                Ok(n > 0)
            })
            .await?;
        Ok(updated)
    }

    pub async fn delete_conversation(
        &self,
        id: i64,
        owner_id: String,
    ) -> Result<bool, DatabaseError> {
        let deleted = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "DELETE FROM conversations WHERE id = ?1 AND owner_id = ?2",
                    (id, &owner_id),
                )?;
                Ok(n > 0)
            })
            .await?;
        Ok(deleted)
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    pub async fn insert_message(
        &self,
        conversation_id: i64,
        role: Role,
        content: String,
    ) -> Result<i64, DatabaseError> {
        let now = now_text();
        let id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO messages (conversation_id, role, content, timestamp)
                     VALUES (?1, ?2, ?3, ?4)",
                    (conversation_id, role.as_str(), &content, &now),
                )?;
                conn.execute(
                    "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
                    (&now, conversation_id),
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        Ok(id)
    }

    /// The most recent `limit` messages, returned in timestamp-ascending
    /// order. The history windower depends on this ordering.
    pub async fn recent_messages(
        &self,
        conversation_id: i64,
        limit: i64,
    ) -> Result<Vec<Message>, DatabaseError> {
        let raw = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, conversation_id, role, content, timestamp
                     FROM messages WHERE conversation_id = ?1
                     ORDER BY timestamp DESC, id DESC LIMIT ?2",
                )?;
                let rows = stmt.query_map((conversation_id, limit), |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                })?;
                let mut messages = Vec::new();
                for row in rows {
                    messages.push(row?);
                }
                Ok(messages)
            })
            .await?;
        let mut messages: Vec<Message> = raw.into_iter().map(message_from_row).collect();
        messages.reverse();
        Ok(messages)
    }

    pub async fn messages_for_conversation(
        &self,
        conversation_id: i64,
    ) -> Result<Vec<Message>, DatabaseError> {
        let raw = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, conversation_id, role, content, timestamp
                     FROM messages WHERE conversation_id = ?1
                     ORDER BY timestamp ASC, id ASC",
                )?;
                let rows = stmt.query_map([conversation_id], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                })?;
                let mut messages = Vec::new();
                for row in rows {
                    messages.push(row?);
                }
                Ok(messages)
            })
            .await?;
        Ok(raw.into_iter().map(message_from_row).collect())
    }

    // ------------------------------------------------------------------
    // Attachments
    // ------------------------------------------------------------------

    /// Links a document to a conversation, at most once per pair, and
    /// upgrades the conversation kind to `document`. Returns whether a new
    /// link was created.
    pub async fn link_document(
        &self,
        conversation_id: i64,
        document_id: i64,
    ) -> Result<bool, DatabaseError> {
        let now = now_text();
        let created = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "INSERT OR IGNORE INTO attachments (conversation_id, document_id, created_at)
                     VALUES (?1, ?2, ?3)",
                    (conversation_id, document_id, &now),
                )?;
                conn.execute(
                    "UPDATE conversations SET kind = 'document' WHERE id = ?1",
                    [conversation_id],
                )?;
                Ok(n > 0)
            })
            .await?;
        Ok(created)
    }

    /// Ids of processed documents attached to the conversation.
    pub async fn attached_processed_document_ids(
        &self,
        conversation_id: i64,
    ) -> Result<Vec<i64>, DatabaseError> {
        let result = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT a.document_id
                     FROM attachments a
                     JOIN documents d ON d.id = a.document_id
                     WHERE a.conversation_id = ?1 AND d.processed = 1
                     ORDER BY a.created_at ASC",
                )?;
                let rows = stmt.query_map([conversation_id], |row| row.get::<_, i64>(0))?;
                let mut ids = Vec::new();
                for row in rows {
                    ids.push(row?);
                }
                Ok(ids)
            })
            .await?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn link_document_is_idempotent_and_upgrades_kind() {
        let store = ChatStore::in_memory().await.unwrap();
        let conversation = store
            .create_conversation("u1".into(), "Chat".into(), ConversationKind::General)
            .await
            .unwrap();
        let doc_id = store
            .create_document("u1".into(), "notes.txt".into(), FileType::Txt)
            .await
            .unwrap();

        assert!(store.link_document(conversation.id, doc_id).await.unwrap());
        assert!(!store.link_document(conversation.id, doc_id).await.unwrap());

        let reloaded = store
            .get_conversation(conversation.id, "u1".into())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reloaded.kind, ConversationKind::Document);
    }

    #[tokio::test]
    async fn deleting_a_document_cascades_to_chunks() {
        let store = ChatStore::in_memory().await.unwrap();
        let doc_id = store
            .create_document("u1".into(), "notes.txt".into(), FileType::Txt)
            .await
            .unwrap();
        store
            .store_chunks_and_mark_processed(doc_id, vec![(0, "hello world".into(), vec![1.0, 0.0])])
            .await
            .unwrap();

        assert_eq!(
            store
                .processed_chunks_for_owner("u1".into())
                .await
                .unwrap()
                .len(),
            1
        );
        assert!(store.delete_document(doc_id, "u1".into()).await.unwrap());
        assert!(store
            .processed_chunks_for_owner("u1".into())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn recent_messages_come_back_in_timestamp_order() {
        let store = ChatStore::in_memory().await.unwrap();
        let conversation = store
            .create_conversation("u1".into(), "Chat".into(), ConversationKind::General)
            .await
            .unwrap();
        for i in 0..6 {
            store
                .insert_message(conversation.id, Role::User, format!("m{}", i))
                .await
                .unwrap();
        }

        let recent = store.recent_messages(conversation.id, 4).await.unwrap();
        let contents: Vec<&str> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4", "m5"]);
    }

    #[tokio::test]
    async fn attachment_listing_requires_processed_documents() {
        let store = ChatStore::in_memory().await.unwrap();
        let conversation = store
            .create_conversation("u1".into(), "Chat".into(), ConversationKind::General)
            .await
            .unwrap();
        let doc_id = store
            .create_document("u1".into(), "notes.txt".into(), FileType::Txt)
            .await
            .unwrap();
        store.link_document(conversation.id, doc_id).await.unwrap();

        assert!(store
            .attached_processed_document_ids(conversation.id)
            .await
            .unwrap()
            .is_empty());

        store
            .store_chunks_and_mark_processed(doc_id, vec![(0, "text".into(), vec![0.0])])
            .await
            .unwrap();
        assert_eq!(
            store
                .attached_processed_document_ids(conversation.id)
                .await
                .unwrap(),
            vec![doc_id]
        );
    }
}
