pub mod api;
pub mod chat;
pub mod config;
pub mod context;
pub mod database;
pub mod document;
pub mod embedding;
pub mod history;
pub mod llm;
pub mod search;
pub mod tools;
pub mod web;

// Re-export commonly used items
pub use chat::{ChatOrchestrator, StreamingDispatcher};
pub use config::Settings;
pub use database::ChatStore;
pub use document::DocumentIngestor;
pub use search::DocumentSearch;
