use std::sync::Arc;

use futures::StreamExt;
use log::{error, warn};
use serde_json::json;
use tokio::sync::mpsc;

use crate::database::{ChatStore, Role};
use crate::llm::{ChatTurn, GenerationService};

/// Events delivered to the client, in order: zero or more `Chunk`s, then
/// exactly one `Done` or `Error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Chunk(String),
    Done { conversation_id: i64 },
    Error(String),
}

impl StreamEvent {
    pub fn to_json(&self) -> String {
        match self {
            StreamEvent::Chunk(text) => json!({ "chunk": text }).to_string(),
            StreamEvent::Done { conversation_id } => {
                json!({ "done": true, "conversation_id": conversation_id }).to_string()
            }
            StreamEvent::Error(message) => json!({ "error": message }).to_string(),
        }
    }
}

/// Drives one generation call on a spawned task. Tokens are forwarded as
/// they arrive; the full response is persisted in a single write only
/// after a clean end of stream. A failed send means the client went away,
/// so the task stops pulling tokens and skips persistence.
pub struct StreamingDispatcher {
    store: ChatStore,
    service: Arc<dyn GenerationService>,
}

impl StreamingDispatcher {
    pub fn new(store: ChatStore, service: Arc<dyn GenerationService>) -> Self {
        Self { store, service }
    }

    pub fn dispatch(
        &self,
        conversation_id: i64,
        turns: Vec<ChatTurn>,
        context: Option<String>,
    ) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(32);
        let store = self.store.clone();
        let service = Arc::clone(&self.service);

        tokio::spawn(async move {
            let mut stream = match service.stream_chat(turns, context).await {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Generation call failed to start: {}", e);
                    let _ = tx.send(StreamEvent::Error(e.to_string())).await;
                    return;
                }
            };

            let mut full_response = String::new();
            while let Some(fragment) = stream.next().await {
                match fragment {
                    Ok(chunk) => {
                        full_response.push_str(&chunk);
                        if tx.send(StreamEvent::Chunk(chunk)).await.is_err() {
                            warn!(
                                "Client disconnected mid-stream for conversation {}",
                                conversation_id
                            );
                            return;
                        }
                    }
                    Err(e) => {
                        error!("Generation stream failed mid-response: {}", e);
                        let _ = tx.send(StreamEvent::Error(e.to_string())).await;
                        return;
                    }
                }
            }

            match store
                .insert_message(conversation_id, Role::Assistant, full_response)
                .await
            {
                Ok(_) => {
                    let _ = tx.send(StreamEvent::Done { conversation_id }).await;
                }
                Err(e) => {
                    error!("Failed to persist assistant message: {}", e);
                    let _ = tx
                        .send(StreamEvent::Error(format!("Failed to save response: {}", e)))
                        .await;
                }
            }
        });

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::ConversationKind;
    use crate::llm::{GenerationError, TokenStream};
    use async_trait::async_trait;

    /// Replays a scripted fragment sequence, optionally ending in an error.
    struct ScriptedService {
        fragments: Vec<String>,
        fail_at_end: bool,
    }

    #[async_trait]
    impl GenerationService for ScriptedService {
        async fn stream_chat(
            &self,
            _turns: Vec<ChatTurn>,
            _context: Option<String>,
        ) -> Result<TokenStream, GenerationError> {
            let mut items: Vec<Result<String, GenerationError>> =
                self.fragments.iter().cloned().map(Ok).collect();
            if self.fail_at_end {
                items.push(Err(GenerationError::Transport("connection reset".into())));
            }
            Ok(futures::stream::iter(items).boxed())
        }
    }

    async fn setup(service: ScriptedService) -> (StreamingDispatcher, ChatStore, i64) {
        let store = ChatStore::in_memory().await.unwrap();
        let conversation = store
            .create_conversation("u1".into(), "Chat".into(), ConversationKind::General)
            .await
            .unwrap();
        let dispatcher = StreamingDispatcher::new(store.clone(), Arc::new(service));
        (dispatcher, store, conversation.id)
    }

    async fn collect(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn clean_stream_emits_chunks_then_done_and_persists_once() {
        let (dispatcher, store, conversation_id) = setup(ScriptedService {
            fragments: vec!["Hel".into(), "lo".into()],
            fail_at_end: false,
        })
        .await;

        let rx = dispatcher.dispatch(conversation_id, vec![ChatTurn::user("hi")], None);
        let events = collect(rx).await;

        assert_eq!(
            events,
            vec![
                StreamEvent::Chunk("Hel".into()),
                StreamEvent::Chunk("lo".into()),
                StreamEvent::Done { conversation_id },
            ]
        );

        let messages = store.messages_for_conversation(conversation_id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::Assistant);
        assert_eq!(messages[0].content, "Hello");
    }

    #[tokio::test]
    async fn mid_stream_failure_emits_error_and_persists_nothing() {
        let (dispatcher, store, conversation_id) = setup(ScriptedService {
            fragments: vec!["Hi".into()],
            fail_at_end: true,
        })
        .await;

        let rx = dispatcher.dispatch(conversation_id, vec![ChatTurn::user("hi")], None);
        let events = collect(rx).await;

        assert_eq!(events.len(), 2);
        assert_eq!(events[0], StreamEvent::Chunk("Hi".into()));
        assert!(matches!(events[1], StreamEvent::Error(_)));

        let messages = store.messages_for_conversation(conversation_id).await.unwrap();
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn client_disconnect_skips_persistence() {
        let (dispatcher, store, conversation_id) = setup(ScriptedService {
            fragments: (0..100).map(|i| format!("t{}", i)).collect(),
            fail_at_end: false,
        })
        .await;

        let rx = dispatcher.dispatch(conversation_id, vec![ChatTurn::user("hi")], None);
        drop(rx);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let messages = store.messages_for_conversation(conversation_id).await.unwrap();
        assert!(messages.is_empty());
    }

    #[test]
    fn event_json_shapes_match_the_wire_contract() {
        assert_eq!(
            StreamEvent::Chunk("hi".into()).to_json(),
            "{\"chunk\":\"hi\"}"
        );
        let done = StreamEvent::Done { conversation_id: 7 }.to_json();
        assert!(done.contains("\"done\":true"));
        assert!(done.contains("\"conversation_id\":7"));
        assert_eq!(
            StreamEvent::Error("boom".into()).to_json(),
            "{\"error\":\"boom\"}"
        );
    }
}
