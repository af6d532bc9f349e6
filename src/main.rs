use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use colored::Colorize;
use dotenv::dotenv;
use log::info;
use tokio::net::TcpListener;

use rag_chat_server::api;
use rag_chat_server::chat::{ChatOrchestrator, StreamingDispatcher};
use rag_chat_server::config::Settings;
use rag_chat_server::database::ChatStore;
use rag_chat_server::document::DocumentIngestor;
use rag_chat_server::embedding::OllamaEmbedder;
use rag_chat_server::llm::OllamaClient;
use rag_chat_server::search::DocumentSearch;
use rag_chat_server::tools::{AlphaVantageClient, OpenWeatherClient, ToolRouter};
use rag_chat_server::web::cache::ContextCache;
use rag_chat_server::web::fallback::DuckDuckGoSearch;
use rag_chat_server::web::search_api::SearchApiClient;
use rag_chat_server::web::WebContextProvider;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(long, default_value = "8000")]
    port: u16,

    /// Overrides DATABASE_PATH.
    #[arg(long)]
    database: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenv().ok();
    env_logger::init();

    let args = Args::parse();
    let mut settings = Settings::from_env();
    if let Some(database) = args.database {
        settings.database_path = database;
    }

    println!("{}", "Starting chat server...".green());

    if let Some(parent) = std::path::Path::new(&settings.database_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let store = ChatStore::new(&settings.database_path).await?;
    info!("Database ready at {}", settings.database_path);

    let embedder = Arc::new(OllamaEmbedder::new(
        settings.ollama_url.clone(),
        settings.embedding_model.clone(),
        settings.embedding_dimension,
    ));
    let generation = Arc::new(OllamaClient::new(
        settings.ollama_url.clone(),
        settings.chat_model.clone(),
    ));

    let cache = Arc::new(ContextCache::new(
        settings.web_cache_capacity,
        settings.web_cache_ttl,
    ));
    let primary = settings
        .search_api_key
        .clone()
        .map(|key| SearchApiClient::new(settings.search_api_url.clone(), key));
    if primary.is_none() {
        info!("SEARCH_API_KEY not set, web context uses the fallback search only");
    }
    let web = Arc::new(WebContextProvider::new(
        cache,
        primary,
        DuckDuckGoSearch::new(),
    ));

    let router = Arc::new(ToolRouter::new(
        Arc::new(OpenWeatherClient::new(
            settings.openweather_url.clone(),
            settings.openweather_api_key.clone(),
        )),
        Arc::new(AlphaVantageClient::new(
            settings.alphavantage_url.clone(),
            settings.alphavantage_api_key.clone(),
        )),
        web,
        settings.default_city.clone(),
    ));

    let search = DocumentSearch::new(store.clone(), embedder.clone());
    let ingestor = Arc::new(DocumentIngestor::new(
        store.clone(),
        embedder,
        settings.chunk_window,
        settings.chunk_overlap,
    ));
    let dispatcher = StreamingDispatcher::new(store.clone(), generation);
    let orchestrator = Arc::new(ChatOrchestrator::new(
        store.clone(),
        router,
        search,
        dispatcher,
    ));

    let app = api::create_api(store, orchestrator, ingestor);

    let addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let listener = TcpListener::bind(&addr).await?;
    println!("{} {}", "Listening on".green(), addr);

    axum::serve(listener, app).await?;
    Ok(())
}
