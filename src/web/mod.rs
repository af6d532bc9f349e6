pub mod cache;
pub mod fallback;
pub mod search_api;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use lazy_static::lazy_static;
use log::warn;
use regex::Regex;

use cache::{cache_key, ContextCache};
use fallback::DuckDuckGoSearch;
use search_api::SearchApiClient;

#[async_trait]
pub trait WebSource: Send + Sync {
    /// Formatted web context for the query, or `Ok(None)` when nothing
    /// usable was found.
    async fn fetch(&self, user_id: &str, query: &str) -> Result<Option<String>>;
}

lazy_static! {
    static ref URL_RE: Regex =
        Regex::new(r"https?://[^\s]+|(?:\b[a-zA-Z0-9-]+\.)+(?:com|org|net|io|dev|gov|edu)\b[^\s]*")
            .unwrap();
}

const CRAWL_HINTS: &[&str] = &["crawl", "sitemap", "all pages", "whole site", "entire site"];
const MAP_HINTS: &[&str] = &["map the site", "list pages", "site map", "what pages"];
const URGENT_HINTS: &[&str] = &["today", "breaking", "just now", "this morning", "right now"];
const RESEARCH_HINTS: &[&str] = &["research", "in depth", "detailed", "comprehensive", "explain everything"];

/// Picks and runs the right web operation for a query, caching every
/// formatted answer. The primary search service is tried first; the
/// keyless scrape fallback covers it being absent or unavailable.
pub struct WebContextProvider {
    cache: Arc<ContextCache>,
    primary: Option<SearchApiClient>,
    fallback: DuckDuckGoSearch,
}

#[derive(Debug, PartialEq, Eq)]
enum Operation {
    Extract(String),
    Crawl(String),
    Map(String),
    Search,
    Research,
}

fn pick_operation(query: &str) -> Operation {
    let lower = query.to_lowercase();
    if let Some(url) = URL_RE.find(query) {
        let url = normalize_url(url.as_str());
        if MAP_HINTS.iter().any(|h| lower.contains(h)) {
            return Operation::Map(url);
        }
        if CRAWL_HINTS.iter().any(|h| lower.contains(h)) || lower.contains("news") {
            return Operation::Crawl(url);
        }
        return Operation::Extract(url);
    }
    if RESEARCH_HINTS.iter().any(|h| lower.contains(h)) {
        return Operation::Research;
    }
    Operation::Search
}

fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim_end_matches(|c: char| ",.;:!?)".contains(c));
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    }
}

fn operation_cache_parts(op: &Operation) -> (&'static str, String) {
    match op {
        Operation::Extract(url) => ("extract", url.clone()),
        Operation::Crawl(url) => ("crawl", url.clone()),
        Operation::Map(url) => ("map", url.clone()),
        Operation::Search => ("search", String::new()),
        Operation::Research => ("research", String::new()),
    }
}

impl WebContextProvider {
    pub fn new(
        cache: Arc<ContextCache>,
        primary: Option<SearchApiClient>,
        fallback: DuckDuckGoSearch,
    ) -> Self {
        Self {
            cache,
            primary,
            fallback,
        }
    }

    async fn run_primary(&self, op: &Operation, query: &str) -> Result<Option<String>> {
        let Some(api) = &self.primary else {
            return Ok(None);
        };
        match op {
            Operation::Extract(url) => api.extract(url).await,
            Operation::Crawl(url) => api.crawl(url).await,
            Operation::Map(url) => api.map(url).await,
            Operation::Research => api.research(query).await,
            Operation::Search => {
                let lower = query.to_lowercase();
                if URGENT_HINTS.iter().any(|h| lower.contains(h)) {
                    api.search(query, Some("news"), Some(3)).await
                } else {
                    api.search(query, None, None).await
                }
            }
        }
    }
}

#[async_trait]
impl WebSource for WebContextProvider {
    async fn fetch(&self, user_id: &str, query: &str) -> Result<Option<String>> {
        let op = pick_operation(query);
        let (tool, args) = operation_cache_parts(&op);
        let key = cache_key(user_id, tool, &args, query);

        if let Some(hit) = self.cache.get(&key) {
            return Ok(Some(hit));
        }

        let primary = match self.run_primary(&op, query).await {
            Ok(result) => result,
            Err(e) => {
                warn!("Primary search service failed, using fallback: {}", e);
                None
            }
        };

        let context = match primary {
            Some(text) => Some(text),
            None => match self.fallback.context(query).await {
                Ok(result) => result,
                Err(e) => {
                    warn!("Fallback web search failed: {}", e);
                    None
                }
            },
        };

        if let Some(text) = &context {
            self.cache.put(key, text.clone());
        }
        Ok(context)
    }
}
