use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Supported upload types. Anything else is rejected before a document row
/// is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Pdf,
    Docx,
    Txt,
    Csv,
    Xlsx,
    Xls,
    Image,
}

impl FileType {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "pdf" => Some(FileType::Pdf),
            "docx" => Some(FileType::Docx),
            "txt" | "md" | "text" => Some(FileType::Txt),
            "csv" => Some(FileType::Csv),
            "xlsx" => Some(FileType::Xlsx),
            "xls" => Some(FileType::Xls),
            "png" | "jpg" | "jpeg" | "bmp" | "gif" | "tiff" => Some(FileType::Image),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Pdf => "pdf",
            FileType::Docx => "docx",
            FileType::Txt => "txt",
            FileType::Csv => "csv",
            FileType::Xlsx => "xlsx",
            FileType::Xls => "xls",
            FileType::Image => "image",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pdf" => Some(FileType::Pdf),
            "docx" => Some(FileType::Docx),
            "txt" => Some(FileType::Txt),
            "csv" => Some(FileType::Csv),
            "xlsx" => Some(FileType::Xlsx),
            "xls" => Some(FileType::Xls),
            "image" => Some(FileType::Image),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    General,
    Document,
}

impl ConversationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationKind::General => "general",
            ConversationKind::Document => "document",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "document" => ConversationKind::Document,
            _ => ConversationKind::General,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "assistant" => Role::Assistant,
            _ => Role::User,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: i64,
    pub owner_id: String,
    pub title: String,
    pub file_type: FileType,
    pub processed: bool,
    pub uploaded_at: DateTime<Utc>,
}

/// A stored chunk joined with its owning document's title, as the search
/// engine consumes it.
#[derive(Debug, Clone)]
pub struct StoredChunk {
    pub document_id: i64,
    pub document_title: String,
    pub chunk_index: i64,
    pub text: String,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: i64,
    pub owner_id: String,
    pub title: String,
    pub kind: ConversationKind,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: i64,
    pub conversation_id: i64,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}
