use std::sync::Arc;

use anyhow::Result;
use log::debug;
use serde::Serialize;

use crate::database::ChatStore;
use crate::embedding::EmbeddingProvider;

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub document_id: i64,
    pub document_title: String,
    pub chunk_index: i64,
    pub text: String,
    pub score: f32,
}

/// Similarity search over the stored chunks of one owner's processed
/// documents. Embeddings are unit vectors, so the dot product is the
/// cosine similarity.
#[derive(Clone)]
pub struct DocumentSearch {
    store: ChatStore,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl DocumentSearch {
    pub fn new(store: ChatStore, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self { store, embedder }
    }

    pub async fn search(
        &self,
        owner_id: &str,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<SearchResult>> {
        self.search_filtered(owner_id, query, top_k, None).await
    }

    /// Like `search`, optionally restricted to the given document ids. An
    /// empty filter slice matches nothing.
    pub async fn search_filtered(
        &self,
        owner_id: &str,
        query: &str,
        top_k: usize,
        document_ids: Option<&[i64]>,
    ) -> Result<Vec<SearchResult>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let query_embedding = self.embedder.embed(query).await?;
        let chunks = self
            .store
            .processed_chunks_for_owner(owner_id.to_string())
            .await?;

        let mut results: Vec<SearchResult> = chunks
            .into_iter()
            .filter(|chunk| match document_ids {
                Some(ids) => ids.contains(&chunk.document_id),
                None => true,
            })
            .filter_map(|chunk| {
                if chunk.embedding.len() != query_embedding.len() {
                    debug!(
                        "Skipping chunk {} of document {}: dimension {} vs query {}",
                        chunk.chunk_index,
                        chunk.document_id,
                        chunk.embedding.len(),
                        query_embedding.len()
                    );
                    return None;
                }
                let score = dot(&query_embedding, &chunk.embedding);
                Some(SearchResult {
                    document_id: chunk.document_id,
                    document_title: chunk.document_title,
                    chunk_index: chunk.chunk_index,
                    text: chunk.text,
                    score,
                })
            })
            .collect();

        // Stable sort keeps the (document_id, chunk_index) load order for
        // equal scores.
        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(top_k);
        Ok(results)
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::FileType;
    use async_trait::async_trait;

    struct KeywordEmbedder;

    #[async_trait]
    impl EmbeddingProvider for KeywordEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            if text.contains("apple") {
                Ok(vec![1.0, 0.0])
            } else {
                Ok(vec![0.0, 1.0])
            }
        }

        fn dimension(&self) -> usize {
            2
        }
    }

    async fn store_with_chunks() -> (ChatStore, i64, i64) {
        let store = ChatStore::in_memory().await.unwrap();
        let apple_doc = store
            .create_document("u1".into(), "fruit.txt".into(), FileType::Txt)
            .await
            .unwrap();
        store
            .store_chunks_and_mark_processed(
                apple_doc,
                vec![(0, "apple pie recipe".into(), vec![1.0, 0.0])],
            )
            .await
            .unwrap();
        let banana_doc = store
            .create_document("u1".into(), "other.txt".into(), FileType::Txt)
            .await
            .unwrap();
        store
            .store_chunks_and_mark_processed(
                banana_doc,
                vec![(0, "banana bread".into(), vec![0.0, 1.0])],
            )
            .await
            .unwrap();
        (store, apple_doc, banana_doc)
    }

    #[tokio::test]
    async fn best_match_comes_first() {
        let (store, apple_doc, _) = store_with_chunks().await;
        let search = DocumentSearch::new(store, Arc::new(KeywordEmbedder));

        let results = search.search("u1", "tell me about apple", 5).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].document_id, apple_doc);
        assert!(results[0].score > results[1].score);
    }

    #[tokio::test]
    async fn results_are_scoped_to_the_owner() {
        let (store, _, _) = store_with_chunks().await;
        let other_doc = store
            .create_document("u2".into(), "private.txt".into(), FileType::Txt)
            .await
            .unwrap();
        store
            .store_chunks_and_mark_processed(other_doc, vec![(0, "apple secrets".into(), vec![1.0, 0.0])])
            .await
            .unwrap();

        let search = DocumentSearch::new(store, Arc::new(KeywordEmbedder));
        let results = search.search("u1", "apple", 10).await.unwrap();
        assert!(results.iter().all(|r| r.document_id != other_doc));
    }

    #[tokio::test]
    async fn document_filter_restricts_results() {
        let (store, apple_doc, banana_doc) = store_with_chunks().await;
        let search = DocumentSearch::new(store, Arc::new(KeywordEmbedder));

        let results = search
            .search_filtered("u1", "apple", 5, Some(&[banana_doc]))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].document_id, banana_doc);
        assert_ne!(results[0].document_id, apple_doc);

        let none = search
            .search_filtered("u1", "apple", 5, Some(&[]))
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn mismatched_dimensions_are_skipped() {
        let store = ChatStore::in_memory().await.unwrap();
        let doc = store
            .create_document("u1".into(), "odd.txt".into(), FileType::Txt)
            .await
            .unwrap();
        store
            .store_chunks_and_mark_processed(doc, vec![(0, "three dims".into(), vec![1.0, 0.0, 0.0])])
            .await
            .unwrap();

        let search = DocumentSearch::new(store, Arc::new(KeywordEmbedder));
        assert!(search.search("u1", "apple", 5).await.unwrap().is_empty());
    }
}
