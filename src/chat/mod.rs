pub mod stream;

use std::sync::Arc;

use log::warn;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::context::{combine, document_context, API_DOC_BUDGET};
use crate::database::{ChatStore, ConversationKind, DatabaseError, Role};
use crate::history::{build_history, HISTORY_WINDOW};
use crate::search::DocumentSearch;
use crate::tools::ToolRouter;

pub use stream::{StreamEvent, StreamingDispatcher};

const RETRIEVAL_TOP_K: usize = 5;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Conversation not found")]
    ConversationNotFound,
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

pub struct ChatRequest {
    pub owner_id: String,
    pub conversation_id: Option<i64>,
    pub message: String,
    pub kind: ConversationKind,
}

/// Runs one chat turn end to end: conversation bookkeeping, tool routing,
/// retrieval, context assembly, history windowing, then the streaming
/// generation call.
pub struct ChatOrchestrator {
    store: ChatStore,
    router: Arc<ToolRouter>,
    search: DocumentSearch,
    dispatcher: StreamingDispatcher,
}

impl ChatOrchestrator {
    pub fn new(
        store: ChatStore,
        router: Arc<ToolRouter>,
        search: DocumentSearch,
        dispatcher: StreamingDispatcher,
    ) -> Self {
        Self {
            store,
            router,
            search,
            dispatcher,
        }
    }

    pub async fn send_message(
        &self,
        request: ChatRequest,
    ) -> Result<(i64, mpsc::Receiver<StreamEvent>), ChatError> {
        let conversation = match request.conversation_id {
            Some(id) => self
                .store
                .get_conversation(id, request.owner_id.clone())
                .await?
                .ok_or(ChatError::ConversationNotFound)?,
            None => {
                self.store
                    .create_conversation(
                        request.owner_id.clone(),
                        generate_title(&request.message),
                        request.kind,
                    )
                    .await?
            }
        };

        self.store
            .insert_message(conversation.id, Role::User, request.message.clone())
            .await?;

        let tool = self
            .router
            .route(&request.owner_id, &request.message)
            .await;
        let doc = self
            .doc_context(&conversation.owner_id, conversation.id, conversation.kind, &request.message)
            .await?;

        let combined = combine(tool.as_ref(), doc.as_deref());
        let context = (!combined.is_empty()).then_some(combined);

        let recent = self
            .store
            .recent_messages(conversation.id, HISTORY_WINDOW)
            .await?;
        let turns = build_history(&recent, &request.message, tool.as_ref(), doc.as_deref());

        let rx = self.dispatcher.dispatch(conversation.id, turns, context);
        Ok((conversation.id, rx))
    }

    async fn doc_context(
        &self,
        owner_id: &str,
        conversation_id: i64,
        kind: ConversationKind,
        message: &str,
    ) -> Result<Option<String>, ChatError> {
        if kind != ConversationKind::Document {
            return Ok(None);
        }
        let attached = self
            .store
            .attached_processed_document_ids(conversation_id)
            .await?;
        if attached.is_empty() {
            return Ok(None);
        }

        let results = match self
            .search
            .search_filtered(owner_id, message, RETRIEVAL_TOP_K, Some(&attached))
            .await
        {
            Ok(results) => results,
            Err(e) => {
                warn!("Document retrieval failed, continuing without it: {}", e);
                return Ok(None);
            }
        };
        Ok(document_context(&results, API_DOC_BUDGET))
    }
}

const QUESTION_WORDS: &[&str] = &[
    "how", "what", "why", "when", "where", "who", "can", "could", "would", "should", "is", "are",
    "do", "does",
];

/// Derives a conversation title from its first message: a few leading
/// words (one extra for questions), an ellipsis when truncated, capped at
/// 60 characters.
pub fn generate_title(message: &str) -> String {
    let message = message.trim();
    let words: Vec<&str> = message.split_whitespace().collect();
    if words.is_empty() {
        return "New Chat".to_string();
    }

    let take = if QUESTION_WORDS.contains(&words[0].to_lowercase().as_str()) {
        8
    } else {
        7
    };

    let mut title = words.iter().take(take).copied().collect::<Vec<_>>().join(" ");
    if words.len() > take {
        title.push_str("...");
    }

    let mut chars = title.chars();
    if let Some(first) = chars.next() {
        title = first.to_uppercase().collect::<String>() + chars.as_str();
    }

    if title.chars().count() > 60 {
        title = title.chars().take(57).collect::<String>() + "...";
    }
    title
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::FileType;
    use crate::embedding::EmbeddingProvider;
    use crate::llm::{ChatTurn, GenerationError, GenerationService, TokenStream};
    use crate::tools::{StockSource, WeatherSource};
    use crate::web::WebSource;
    use anyhow::Result;
    use async_trait::async_trait;
    use futures::StreamExt;
    use std::sync::Mutex;

    #[test]
    fn question_titles_take_eight_words() {
        let title = generate_title("what is the best way to cook rice tonight");
        assert_eq!(title, "What is the best way to cook rice...");
    }

    #[test]
    fn statement_titles_take_seven_words() {
        let title = generate_title("tell me about the history of rust programming");
        assert_eq!(title, "Tell me about the history of rust...");
    }

    #[test]
    fn short_titles_have_no_ellipsis() {
        assert_eq!(generate_title("hello there"), "Hello there");
    }

    #[test]
    fn empty_message_gets_the_default_title() {
        assert_eq!(generate_title("   "), "New Chat");
    }

    #[test]
    fn long_titles_are_capped() {
        let message = format!("{} and more", "superlongword".repeat(8));
        let title = generate_title(&message);
        assert!(title.chars().count() <= 60);
        assert!(title.ends_with("..."));
    }

    struct NoWeather;
    #[async_trait]
    impl WeatherSource for NoWeather {
        async fn current(&self, _city: &str) -> Result<Option<String>> {
            Ok(None)
        }
    }

    struct NoStock;
    #[async_trait]
    impl StockSource for NoStock {
        async fn quote(&self, _symbol: &str) -> Result<Option<String>> {
            Ok(None)
        }
    }

    struct NoWeb;
    #[async_trait]
    impl WebSource for NoWeb {
        async fn fetch(&self, _user_id: &str, _query: &str) -> Result<Option<String>> {
            Ok(None)
        }
    }

    /// Records the turns and context it was called with.
    struct RecordingService {
        calls: Mutex<Vec<(Vec<ChatTurn>, Option<String>)>>,
    }

    #[async_trait]
    impl GenerationService for RecordingService {
        async fn stream_chat(
            &self,
            turns: Vec<ChatTurn>,
            context: Option<String>,
        ) -> Result<TokenStream, GenerationError> {
            self.calls.lock().unwrap().push((turns, context));
            Ok(futures::stream::iter(vec![Ok("ok".to_string())]).boxed())
        }
    }

    struct HashEmbedder;
    #[async_trait]
    impl EmbeddingProvider for HashEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(vec![1.0, 0.0])
        }
        fn dimension(&self) -> usize {
            2
        }
    }

    async fn orchestrator() -> (ChatOrchestrator, ChatStore, Arc<RecordingService>) {
        let store = ChatStore::in_memory().await.unwrap();
        let service = Arc::new(RecordingService {
            calls: Mutex::new(Vec::new()),
        });
        let router = Arc::new(ToolRouter::new(
            Arc::new(NoWeather),
            Arc::new(NoStock),
            Arc::new(NoWeb),
            "Kigali".into(),
        ));
        let search = DocumentSearch::new(store.clone(), Arc::new(HashEmbedder));
        let dispatcher = StreamingDispatcher::new(store.clone(), service.clone());
        (
            ChatOrchestrator::new(store.clone(), router, search, dispatcher),
            store,
            service,
        )
    }

    #[tokio::test]
    async fn first_message_creates_a_titled_conversation_and_persists_both_sides() {
        let (orchestrator, store, _service) = orchestrator().await;
        let (conversation_id, mut rx) = orchestrator
            .send_message(ChatRequest {
                owner_id: "u1".into(),
                conversation_id: None,
                message: "hello assistant".into(),
                kind: ConversationKind::General,
            })
            .await
            .unwrap();

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert!(matches!(events.last(), Some(StreamEvent::Done { .. })));

        let conversation = store
            .get_conversation(conversation_id, "u1".into())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conversation.title, "Hello assistant");

        let messages = store.messages_for_conversation(conversation_id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].content, "ok");
    }

    #[tokio::test]
    async fn unknown_conversation_is_rejected() {
        let (orchestrator, _store, _service) = orchestrator().await;
        let err = orchestrator
            .send_message(ChatRequest {
                owner_id: "u1".into(),
                conversation_id: Some(999),
                message: "hi".into(),
                kind: ConversationKind::General,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::ConversationNotFound));
    }

    #[tokio::test]
    async fn attached_documents_feed_context_into_the_call() {
        let (orchestrator, store, service) = orchestrator().await;
        let doc_id = store
            .create_document("u1".into(), "notes.txt".into(), FileType::Txt)
            .await
            .unwrap();
        store
            .store_chunks_and_mark_processed(
                doc_id,
                vec![(0, "the launch is scheduled for March".into(), vec![1.0, 0.0])],
            )
            .await
            .unwrap();
        let conversation = store
            .create_conversation("u1".into(), "Docs".into(), ConversationKind::General)
            .await
            .unwrap();
        store.link_document(conversation.id, doc_id).await.unwrap();

        let (_, mut rx) = orchestrator
            .send_message(ChatRequest {
                owner_id: "u1".into(),
                conversation_id: Some(conversation.id),
                message: "when is the launch".into(),
                kind: ConversationKind::Document,
            })
            .await
            .unwrap();
        while rx.recv().await.is_some() {}

        let calls = service.calls.lock().unwrap();
        let (turns, context) = &calls[0];
        let context = context.as_deref().unwrap();
        assert!(context.contains("[Document Context]: "));
        assert!(context.contains("the launch is scheduled for March"));
        let current = &turns.last().unwrap().content;
        assert!(current.contains("uploaded documents"));
    }
}
