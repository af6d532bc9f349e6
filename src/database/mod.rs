pub mod models;
pub mod store;

pub use models::{Conversation, ConversationKind, Document, FileType, Message, Role, StoredChunk};
pub use store::{ChatStore, DatabaseError};
