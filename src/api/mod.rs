use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Multipart, Path, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use validator::Validate;

use crate::chat::{ChatError, ChatOrchestrator, ChatRequest};
use crate::database::{
    ChatStore, Conversation, ConversationKind, DatabaseError, Document, Message,
};
use crate::document::{DocumentIngestor, IngestError};

#[derive(Clone)]
pub struct AppState {
    store: ChatStore,
    orchestrator: Arc<ChatOrchestrator>,
    ingestor: Arc<DocumentIngestor>,
}

#[derive(Serialize)]
struct ApiResponse {
    status: String,
}

fn api_error(code: StatusCode, message: impl Into<String>) -> Response {
    (
        code,
        Json(ApiResponse {
            status: message.into(),
        }),
    )
        .into_response()
}

/// Owner identity comes from the `X-User-Id` header; account management
/// lives outside this service.
fn owner_id(headers: &HeaderMap) -> Result<String, Response> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| api_error(StatusCode::UNAUTHORIZED, "Missing X-User-Id header"))
}

#[derive(Deserialize, Validate)]
pub struct SendMessageRequest {
    #[validate(length(min = 1, max = 4000))]
    message: String,
    #[serde(default)]
    chat_type: Option<ConversationKind>,
}

#[derive(Deserialize)]
pub struct CreateConversationRequest {
    title: Option<String>,
    #[serde(default)]
    chat_type: Option<ConversationKind>,
}

#[derive(Deserialize, Validate)]
pub struct RenameConversationRequest {
    #[validate(length(min = 1, max = 120))]
    title: String,
}

#[derive(Deserialize)]
pub struct LinkDocumentRequest {
    conversation_id: i64,
    document_id: i64,
}

#[derive(Serialize)]
struct ConversationListResponse {
    conversations: Vec<Conversation>,
}

#[derive(Serialize)]
struct ConversationDetailResponse {
    conversation: Conversation,
    messages: Vec<Message>,
}

#[derive(Serialize)]
struct DocumentListResponse {
    documents: Vec<Document>,
}

#[derive(Serialize)]
struct DocumentResponse {
    document: Document,
}

#[derive(Serialize)]
struct UploadResponse {
    document: Document,
    conversation_id: i64,
}

#[derive(Serialize)]
struct DocumentStatusResponse {
    document_id: i64,
    processed: bool,
}

#[derive(Serialize)]
struct LinkDocumentResponse {
    linked: bool,
    created: bool,
}

pub fn create_api(
    store: ChatStore,
    orchestrator: Arc<ChatOrchestrator>,
    ingestor: Arc<DocumentIngestor>,
) -> Router {
    let state = AppState {
        store,
        orchestrator,
        ingestor,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .max_age(std::time::Duration::from_secs(3600));

    Router::new()
        .route("/health", get(health_check))
        .route("/api/conversations", get(list_conversations).post(create_conversation))
        .route(
            "/api/conversations/:id",
            get(get_conversation)
                .delete(delete_conversation)
                .patch(rename_conversation),
        )
        .route("/api/chat/send", post(send_message_new))
        .route("/api/chat/send/:id", post(send_message_existing))
        .route("/api/documents", get(list_documents).post(upload_document))
        .route(
            "/api/documents/:id",
            get(get_document).delete(delete_document),
        )
        .route("/api/documents/:id/status", get(document_status))
        .route("/api/documents/link", post(link_document))
        .layer(cors)
        .with_state(state)
}

async fn health_check() -> Response {
    Json(ApiResponse {
        status: "Server is running and healthy".to_string(),
    })
    .into_response()
}

// ----------------------------------------------------------------------
// Conversations
// ----------------------------------------------------------------------

async fn list_conversations(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let owner = match owner_id(&headers) {
        Ok(owner) => owner,
        Err(response) => return response,
    };
    match state.store.list_conversations(owner, 50).await {
        Ok(conversations) => Json(ConversationListResponse { conversations }).into_response(),
        Err(e) => {
            error!("Failed to list conversations: {}", e);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "Database error")
        }
    }
}

async fn create_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateConversationRequest>,
) -> Response {
    let owner = match owner_id(&headers) {
        Ok(owner) => owner,
        Err(response) => return response,
    };
    let title = request
        .title
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| "New Chat".to_string());
    let kind = request.chat_type.unwrap_or(ConversationKind::General);

    match state.store.create_conversation(owner, title, kind).await {
        Ok(conversation) => {
            (StatusCode::CREATED, Json(ConversationDetailResponse {
                conversation,
                messages: Vec::new(),
            }))
                .into_response()
        }
        Err(e) => {
            error!("Failed to create conversation: {}", e);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "Database error")
        }
    }
}

async fn get_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Response {
    let owner = match owner_id(&headers) {
        Ok(owner) => owner,
        Err(response) => return response,
    };
    let conversation = match state.store.get_conversation(id, owner).await {
        Ok(Some(conversation)) => conversation,
        Ok(None) => return api_error(StatusCode::NOT_FOUND, "Conversation not found"),
        Err(e) => {
            error!("Failed to load conversation {}: {}", id, e);
            return api_error(StatusCode::INTERNAL_SERVER_ERROR, "Database error");
        }
    };
    match state.store.messages_for_conversation(id).await {
        Ok(messages) => Json(ConversationDetailResponse {
            conversation,
            messages,
        })
        .into_response(),
        Err(e) => {
            error!("Failed to load messages for conversation {}: {}", id, e);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "Database error")
        }
    }
}

async fn delete_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Response {
    let owner = match owner_id(&headers) {
        Ok(owner) => owner,
        Err(response) => return response,
    };
    match state.store.delete_conversation(id, owner).await {
        Ok(true) => Json(ApiResponse {
            status: "Conversation deleted".to_string(),
        })
        .into_response(),
        Ok(false) => api_error(StatusCode::NOT_FOUND, "Conversation not found"),
        Err(e) => {
            error!("Failed to delete conversation {}: {}", id, e);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "Database error")
        }
    }
}

async fn rename_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(request): Json<RenameConversationRequest>,
) -> Response {
    let owner = match owner_id(&headers) {
        Ok(owner) => owner,
        Err(response) => return response,
    };
    if let Err(e) = request.validate() {
        return api_error(StatusCode::BAD_REQUEST, format!("Invalid title: {}", e));
    }
    match state.store.rename_conversation(id, owner, request.title).await {
        Ok(true) => Json(ApiResponse {
            status: "Conversation renamed".to_string(),
        })
        .into_response(),
        Ok(false) => api_error(StatusCode::NOT_FOUND, "Conversation not found"),
        Err(e) => {
            error!("Failed to rename conversation {}: {}", id, e);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "Database error")
        }
    }
}

// ----------------------------------------------------------------------
// Chat
// ----------------------------------------------------------------------

async fn send_message_new(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SendMessageRequest>,
) -> Response {
    send_message(state, headers, None, request).await
}

async fn send_message_existing(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(request): Json<SendMessageRequest>,
) -> Response {
    send_message(state, headers, Some(id), request).await
}

async fn send_message(
    state: AppState,
    headers: HeaderMap,
    conversation_id: Option<i64>,
    request: SendMessageRequest,
) -> Response {
    let owner = match owner_id(&headers) {
        Ok(owner) => owner,
        Err(response) => return response,
    };
    if let Err(e) = request.validate() {
        return api_error(StatusCode::BAD_REQUEST, format!("Invalid message: {}", e));
    }

    let chat_request = ChatRequest {
        owner_id: owner,
        conversation_id,
        message: request.message,
        kind: request.chat_type.unwrap_or(ConversationKind::General),
    };

    let (_, rx) = match state.orchestrator.send_message(chat_request).await {
        Ok(result) => result,
        Err(ChatError::ConversationNotFound) => {
            return api_error(StatusCode::NOT_FOUND, "Conversation not found");
        }
        Err(e) => {
            error!("Chat turn failed to start: {}", e);
            return api_error(StatusCode::INTERNAL_SERVER_ERROR, "Database error");
        }
    };

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        let event = rx.recv().await?;
        Some((
            Ok::<_, Infallible>(Event::default().data(event.to_json())),
            rx,
        ))
    });
    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

// ----------------------------------------------------------------------
// Documents
// ----------------------------------------------------------------------

async fn list_documents(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let owner = match owner_id(&headers) {
        Ok(owner) => owner,
        Err(response) => return response,
    };
    match state.store.list_documents(owner, 50).await {
        Ok(documents) => Json(DocumentListResponse { documents }).into_response(),
        Err(e) => {
            error!("Failed to list documents: {}", e);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "Database error")
        }
    }
}

async fn upload_document(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    let owner = match owner_id(&headers) {
        Ok(owner) => owner,
        Err(response) => return response,
    };

    let mut upload: Option<(String, Vec<u8>)> = None;
    let mut requested_conversation: Option<i64> = None;
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) => match field.name() {
                Some("file") => {
                    let filename = field
                        .file_name()
                        .map(|f| f.to_string())
                        .unwrap_or_else(|| "upload.txt".to_string());
                    match field.bytes().await {
                        Ok(bytes) => upload = Some((filename, bytes.to_vec())),
                        Err(e) => {
                            return api_error(
                                StatusCode::BAD_REQUEST,
                                format!("Failed to read upload: {}", e),
                            );
                        }
                    }
                }
                Some("conversation_id") => {
                    requested_conversation = field
                        .text()
                        .await
                        .ok()
                        .and_then(|t| t.trim().parse::<i64>().ok());
                }
                _ => continue,
            },
            Ok(None) => break,
            Err(e) => {
                return api_error(
                    StatusCode::BAD_REQUEST,
                    format!("Malformed multipart body: {}", e),
                );
            }
        }
    }

    let Some((filename, bytes)) = upload else {
        return api_error(StatusCode::BAD_REQUEST, "Missing 'file' field");
    };

    info!("Ingesting upload {} ({} bytes)", filename, bytes.len());
    let document = match state.ingestor.ingest(&owner, &filename, &bytes).await {
        Ok(document) => document,
        Err(e @ IngestError::UnsupportedType(_)) | Err(e @ IngestError::EmptyDocument) => {
            return api_error(StatusCode::BAD_REQUEST, e.to_string());
        }
        Err(e @ IngestError::Extraction(_)) => {
            warn!("Upload {} failed extraction: {}", filename, e);
            return api_error(StatusCode::UNPROCESSABLE_ENTITY, e.to_string());
        }
        Err(e) => {
            error!("Upload {} failed: {}", filename, e);
            return api_error(StatusCode::INTERNAL_SERVER_ERROR, "Document processing failed");
        }
    };

    let conversation_id = match conversation_for_upload(
        &state.store,
        &owner,
        &filename,
        requested_conversation,
    )
    .await
    {
        Ok(id) => id,
        Err(e) => {
            error!("Failed to attach upload {} to a conversation: {}", filename, e);
            return api_error(StatusCode::INTERNAL_SERVER_ERROR, "Database error");
        }
    };
    if let Err(e) = state.store.link_document(conversation_id, document.id).await {
        error!("Failed to link document {}: {}", document.id, e);
        return api_error(StatusCode::INTERNAL_SERVER_ERROR, "Database error");
    }

    (
        StatusCode::CREATED,
        Json(UploadResponse {
            document,
            conversation_id,
        }),
    )
        .into_response()
}

/// Every upload lands in a conversation: the caller's, when it names one it
/// owns, otherwise a fresh document conversation titled after the file.
async fn conversation_for_upload(
    store: &ChatStore,
    owner: &str,
    filename: &str,
    requested: Option<i64>,
) -> Result<i64, DatabaseError> {
    if let Some(id) = requested {
        if let Some(conversation) = store.get_conversation(id, owner.to_string()).await? {
            return Ok(conversation.id);
        }
    }
    let short: String = filename.chars().take(30).collect();
    let conversation = store
        .create_conversation(
            owner.to_string(),
            format!("Document: {}", short),
            ConversationKind::Document,
        )
        .await?;
    Ok(conversation.id)
}

async fn get_document(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Response {
    let owner = match owner_id(&headers) {
        Ok(owner) => owner,
        Err(response) => return response,
    };
    match state.store.get_document(id, owner).await {
        Ok(Some(document)) => Json(DocumentResponse { document }).into_response(),
        Ok(None) => api_error(StatusCode::NOT_FOUND, "Document not found"),
        Err(e) => {
            error!("Failed to load document {}: {}", id, e);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "Database error")
        }
    }
}

async fn delete_document(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Response {
    let owner = match owner_id(&headers) {
        Ok(owner) => owner,
        Err(response) => return response,
    };
    match state.store.delete_document(id, owner).await {
        Ok(true) => Json(ApiResponse {
            status: "Document deleted".to_string(),
        })
        .into_response(),
        Ok(false) => api_error(StatusCode::NOT_FOUND, "Document not found"),
        Err(e) => {
            error!("Failed to delete document {}: {}", id, e);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "Database error")
        }
    }
}

async fn document_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Response {
    let owner = match owner_id(&headers) {
        Ok(owner) => owner,
        Err(response) => return response,
    };
    match state.store.get_document(id, owner).await {
        Ok(Some(document)) => Json(DocumentStatusResponse {
            document_id: document.id,
            processed: document.processed,
        })
        .into_response(),
        Ok(None) => api_error(StatusCode::NOT_FOUND, "Document not found"),
        Err(e) => {
            error!("Failed to load document {}: {}", id, e);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "Database error")
        }
    }
}

async fn link_document(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<LinkDocumentRequest>,
) -> Response {
    let owner = match owner_id(&headers) {
        Ok(owner) => owner,
        Err(response) => return response,
    };

    match state
        .store
        .get_conversation(request.conversation_id, owner.clone())
        .await
    {
        Ok(Some(_)) => {}
        Ok(None) => return api_error(StatusCode::NOT_FOUND, "Conversation not found"),
        Err(e) => {
            error!("Failed to load conversation: {}", e);
            return api_error(StatusCode::INTERNAL_SERVER_ERROR, "Database error");
        }
    }
    match state.store.get_document(request.document_id, owner).await {
        Ok(Some(_)) => {}
        Ok(None) => return api_error(StatusCode::NOT_FOUND, "Document not found"),
        Err(e) => {
            error!("Failed to load document: {}", e);
            return api_error(StatusCode::INTERNAL_SERVER_ERROR, "Database error");
        }
    }

    match state
        .store
        .link_document(request.conversation_id, request.document_id)
        .await
    {
        Ok(created) => Json(LinkDocumentResponse {
            linked: true,
            created,
        })
        .into_response(),
        Err(e) => {
            error!("Failed to link document: {}", e);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "Database error")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upload_attaches_to_the_callers_conversation() {
        let store = ChatStore::in_memory().await.unwrap();
        let conversation = store
            .create_conversation("u1".into(), "Chat".into(), ConversationKind::General)
            .await
            .unwrap();

        let id = conversation_for_upload(&store, "u1", "notes.txt", Some(conversation.id))
            .await
            .unwrap();
        assert_eq!(id, conversation.id);
    }

    #[tokio::test]
    async fn upload_creates_a_document_conversation_when_none_given() {
        let store = ChatStore::in_memory().await.unwrap();

        let id = conversation_for_upload(&store, "u1", "quarterly-report.pdf", None)
            .await
            .unwrap();
        let conversation = store
            .get_conversation(id, "u1".into())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conversation.title, "Document: quarterly-report.pdf");
        assert_eq!(conversation.kind, ConversationKind::Document);
    }

    #[tokio::test]
    async fn someone_elses_conversation_id_falls_back_to_a_new_one() {
        let store = ChatStore::in_memory().await.unwrap();
        let other = store
            .create_conversation("u2".into(), "Private".into(), ConversationKind::General)
            .await
            .unwrap();

        let id = conversation_for_upload(&store, "u1", "notes.txt", Some(other.id))
            .await
            .unwrap();
        assert_ne!(id, other.id);
        let conversation = store
            .get_conversation(id, "u1".into())
            .await
            .unwrap()
            .unwrap();
        assert!(conversation.title.starts_with("Document: "));
    }

    #[tokio::test]
    async fn long_filenames_are_shortened_in_the_title() {
        let store = ChatStore::in_memory().await.unwrap();
        let filename = format!("{}.pdf", "a".repeat(60));

        let id = conversation_for_upload(&store, "u1", &filename, None)
            .await
            .unwrap();
        let conversation = store
            .get_conversation(id, "u1".into())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conversation.title, format!("Document: {}", "a".repeat(30)));
    }
}
