pub mod chunker;
pub mod extract;
pub mod ingest;

pub use chunker::{chunk_text, DEFAULT_OVERLAP, DEFAULT_WINDOW};
pub use ingest::{DocumentIngestor, IngestError};
