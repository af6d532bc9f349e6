use std::sync::Arc;

use log::{info, warn};
use thiserror::Error;

use crate::database::{ChatStore, DatabaseError, Document, FileType};
use crate::embedding::EmbeddingProvider;

use super::chunker::chunk_text;
use super::extract::extract_text;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Unsupported file type: {0}")]
    UnsupportedType(String),
    #[error("Extraction failed: {0}")]
    Extraction(String),
    #[error("Document contains no text to index")]
    EmptyDocument,
    #[error("Embedding failed: {0}")]
    Embedding(String),
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Runs the upload pipeline: extract text, chunk, embed, store. Chunks and
/// the `processed` flag land in one transaction, so a document is either
/// fully indexed or still pending.
#[derive(Clone)]
pub struct DocumentIngestor {
    store: ChatStore,
    embedder: Arc<dyn EmbeddingProvider>,
    window: usize,
    overlap: usize,
}

impl DocumentIngestor {
    pub fn new(
        store: ChatStore,
        embedder: Arc<dyn EmbeddingProvider>,
        window: usize,
        overlap: usize,
    ) -> Self {
        Self {
            store,
            embedder,
            window,
            overlap,
        }
    }

    pub async fn ingest(
        &self,
        owner_id: &str,
        filename: &str,
        bytes: &[u8],
    ) -> Result<Document, IngestError> {
        let extension = filename.rsplit('.').next().unwrap_or("");
        let file_type = FileType::from_extension(extension)
            .ok_or_else(|| IngestError::UnsupportedType(extension.to_string()))?;

        let document_id = self
            .store
            .create_document(owner_id.to_string(), filename.to_string(), file_type)
            .await?;

        if let Err(e) = self.process(document_id, file_type, bytes).await {
            warn!("Document {} ({}) failed to process: {}", document_id, filename, e);
            // A document that never indexed is removed, not left pending.
            if let Err(cleanup) = self
                .store
                .delete_document(document_id, owner_id.to_string())
                .await
            {
                warn!(
                    "Failed to remove document {} after ingest failure: {}",
                    document_id, cleanup
                );
            }
            return Err(e);
        }

        self.store
            .get_document(document_id, owner_id.to_string())
            .await?
            .ok_or_else(|| {
                IngestError::Database(DatabaseError::NotFound(format!(
                    "document {}",
                    document_id
                )))
            })
    }

    /// Re-runs extraction and indexing for an existing document. Previous
    /// chunks are replaced, never appended to.
    pub async fn process(
        &self,
        document_id: i64,
        file_type: FileType,
        bytes: &[u8],
    ) -> Result<(), IngestError> {
        let text =
            extract_text(bytes, file_type).map_err(|e| IngestError::Extraction(e.to_string()))?;

        let chunks = chunk_text(&text, self.window, self.overlap);
        if chunks.is_empty() {
            return Err(IngestError::EmptyDocument);
        }

        let mut rows = Vec::with_capacity(chunks.len());
        for (index, chunk) in chunks.into_iter().enumerate() {
            let embedding = self
                .embedder
                .embed(&chunk)
                .await
                .map_err(|e| IngestError::Embedding(e.to_string()))?;
            rows.push((index as i64, chunk, embedding));
        }

        let count = rows.len();
        self.store
            .store_chunks_and_mark_processed(document_id, rows)
            .await?;
        info!("Document {} indexed with {} chunks", document_id, count);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;

    struct FixedEmbedder;

    #[async_trait]
    impl EmbeddingProvider for FixedEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(vec![1.0, 0.0])
        }

        fn dimension(&self) -> usize {
            2
        }
    }

    async fn ingestor() -> (DocumentIngestor, ChatStore) {
        let store = ChatStore::in_memory().await.unwrap();
        let ingestor = DocumentIngestor::new(store.clone(), Arc::new(FixedEmbedder), 100, 10);
        (ingestor, store)
    }

    #[tokio::test]
    async fn ingest_marks_document_processed() {
        let (ingestor, store) = ingestor().await;
        let doc = ingestor
            .ingest("u1", "notes.txt", b"some words to index")
            .await
            .unwrap();
        assert!(doc.processed);
        assert_eq!(doc.file_type, FileType::Txt);

        let chunks = store.processed_chunks_for_owner("u1".into()).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "some words to index");
    }

    #[tokio::test]
    async fn reprocessing_replaces_chunks() {
        let (ingestor, store) = ingestor().await;
        let doc = ingestor
            .ingest("u1", "notes.txt", b"first version text")
            .await
            .unwrap();

        ingestor
            .process(doc.id, FileType::Txt, b"second version text")
            .await
            .unwrap();

        let chunks = store.processed_chunks_for_owner("u1".into()).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "second version text");
    }

    #[tokio::test]
    async fn unsupported_extension_is_rejected() {
        let (ingestor, _store) = ingestor().await;
        let err = ingestor.ingest("u1", "binary.exe", b"MZ").await.unwrap_err();
        assert!(matches!(err, IngestError::UnsupportedType(_)));
    }

    #[tokio::test]
    async fn failed_ingest_removes_the_document() {
        let (ingestor, store) = ingestor().await;
        let err = ingestor.ingest("u1", "blank.txt", b"   ").await.unwrap_err();
        assert!(matches!(err, IngestError::EmptyDocument));

        let docs = store.list_documents("u1".into(), 10).await.unwrap();
        assert!(docs.is_empty());
    }
}
