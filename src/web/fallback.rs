use std::time::Duration;

use anyhow::Result;
use futures::stream::{self, StreamExt};
use log::warn;
use reqwest::Client;
use scraper::{Html, Selector};
use url::Url;

const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";
const SEARCH_RESULTS: usize = 2;
const FETCH_POOL: usize = 3;
const PAGE_CHAR_BUDGET: usize = 1_500;
const CONTENT_SLICE: usize = 800;

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub title: String,
    pub snippet: String,
    pub url: String,
}

/// Keyless fallback search: scrapes the DuckDuckGo HTML endpoint, then
/// fetches the top result pages concurrently. A page fetch that fails
/// degrades to the search snippet for that result.
pub struct DuckDuckGoSearch {
    client: Client,
}

impl DuckDuckGoSearch {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client }
    }

    pub async fn context(&self, query: &str) -> Result<Option<String>> {
        let hits = self.search(query, SEARCH_RESULTS).await?;
        if hits.is_empty() {
            return Ok(None);
        }

        // Owned URLs, so the fetch closure borrows nothing from `hits`.
        let urls: Vec<(usize, String)> =
            hits.iter().map(|hit| hit.url.clone()).enumerate().collect();
        let pages: Vec<(usize, Option<String>)> = stream::iter(urls)
            .map(|(i, url)| async move { (i, self.fetch_page_text(&url).await) })
            .buffer_unordered(FETCH_POOL)
            .collect()
            .await;

        Ok(Some(format_hits(query, &hits, &pages)))
    }

    pub async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>> {
        let response = self
            .client
            .get("https://html.duckduckgo.com/html/")
            .query(&[("q", query)])
            .send()
            .await?;

        if !response.status().is_success() {
            warn!("DuckDuckGo returned {}", response.status());
            return Ok(Vec::new());
        }

        let body = response.text().await?;
        Ok(parse_search_results(&body, max_results))
    }

    async fn fetch_page_text(&self, url: &str) -> Option<String> {
        let response = match self.client.get(url).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                warn!("Page fetch for {} returned {}", url, r.status());
                return None;
            }
            Err(e) => {
                warn!("Page fetch for {} failed: {}", url, e);
                return None;
            }
        };
        let body = response.text().await.ok()?;
        let text = page_text(&body);
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }
}

impl Default for DuckDuckGoSearch {
    fn default() -> Self {
        Self::new()
    }
}

/// Renders the numbered result list. `pages` carries the fetched page text
/// keyed by hit index; a hit whose fetch failed keeps only its snippet.
fn format_hits(query: &str, hits: &[SearchHit], pages: &[(usize, Option<String>)]) -> String {
    let mut parts = vec![format!("[Web Search Results for: {}]\n", query)];
    for (i, hit) in hits.iter().enumerate() {
        parts.push(format!("\n{}. {}", i + 1, hit.title));
        parts.push(format!("   {}", hit.snippet));
        let page = pages
            .iter()
            .find(|(idx, _)| *idx == i)
            .and_then(|(_, content)| content.as_deref());
        if let Some(content) = page {
            let mut end = CONTENT_SLICE.min(content.len());
            while !content.is_char_boundary(end) {
                end -= 1;
            }
            parts.push(format!("   Content: {}...", &content[..end]));
        }
        parts.push(format!("   Source: {}\n", hit.url));
    }
    parts.join("\n")
}

fn parse_search_results(html: &str, max_results: usize) -> Vec<SearchHit> {
    let document = Html::parse_document(html);
    let result_sel = Selector::parse(".result").unwrap();
    let link_sel = Selector::parse("a.result__a").unwrap();
    let snippet_sel = Selector::parse(".result__snippet").unwrap();

    let mut hits = Vec::new();
    for result in document.select(&result_sel) {
        let Some(link) = result.select(&link_sel).next() else {
            continue;
        };
        let href = link.value().attr("href").unwrap_or("");
        let url = resolve_redirect(href);
        if url.is_empty() {
            continue;
        }
        let title = link.text().collect::<String>().trim().to_string();
        let snippet = result
            .select(&snippet_sel)
            .next()
            .map(|s| s.text().collect::<String>().trim().to_string())
            .unwrap_or_default();
        hits.push(SearchHit { title, snippet, url });
        if hits.len() >= max_results {
            break;
        }
    }
    hits
}

/// DuckDuckGo links point at a redirect endpoint carrying the real target
/// in the `uddg` query parameter.
fn resolve_redirect(href: &str) -> String {
    let absolute = if href.starts_with("//") {
        format!("https:{}", href)
    } else {
        href.to_string()
    };
    if let Ok(parsed) = Url::parse(&absolute) {
        if let Some((_, target)) = parsed.query_pairs().find(|(k, _)| k == "uddg") {
            return target.into_owned();
        }
        return absolute;
    }
    String::new()
}

/// Visible text from the main content elements, scripts and chrome
/// excluded.
fn page_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let content_sel = Selector::parse("p, h1, h2, h3, h4, li").unwrap();

    let mut text = String::new();
    for element in document.select(&content_sel) {
        let fragment = element.text().collect::<String>();
        let fragment = fragment.split_whitespace().collect::<Vec<_>>().join(" ");
        if fragment.is_empty() {
            continue;
        }
        if !text.is_empty() {
            text.push(' ');
        }
        text.push_str(&fragment);
        if text.len() >= PAGE_CHAR_BUDGET {
            break;
        }
    }
    if text.len() > PAGE_CHAR_BUDGET {
        let mut end = PAGE_CHAR_BUDGET;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
        text.push_str("...");
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        <div class="result">
            <a class="result__a" href="//duckduckgo.com/l/?uddg=https%3A%2F%2Fexample.com%2Fpage&rut=abc">Example Page</a>
            <a class="result__snippet">A short snippet.</a>
        </div>
        <div class="result">
            <a class="result__a" href="https://other.org/direct">Other</a>
        </div>
    "#;

    #[test]
    fn parses_results_and_decodes_redirects() {
        let hits = parse_search_results(SAMPLE, 5);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].title, "Example Page");
        assert_eq!(hits[0].snippet, "A short snippet.");
        assert_eq!(hits[0].url, "https://example.com/page");
        assert_eq!(hits[1].url, "https://other.org/direct");
    }

    #[test]
    fn result_limit_is_honored() {
        assert_eq!(parse_search_results(SAMPLE, 1).len(), 1);
    }

    #[test]
    fn page_text_skips_scripts() {
        let html = "<html><body><script>var x = 1;</script><p>Real   words</p><li>item</li></body></html>";
        assert_eq!(page_text(html), "Real words item");
    }

    #[test]
    fn failed_page_fetch_degrades_to_the_snippet() {
        let hits = vec![
            SearchHit {
                title: "First".into(),
                snippet: "first snippet".into(),
                url: "https://a.example".into(),
            },
            SearchHit {
                title: "Second".into(),
                snippet: "second snippet".into(),
                url: "https://b.example".into(),
            },
        ];
        let pages = vec![(1, Some("x".repeat(2_000))), (0, None)];

        let text = format_hits("q", &hits, &pages);
        assert!(text.starts_with("[Web Search Results for: q]"));

        let (first, second) = text.split_once("2. Second").unwrap();
        assert!(first.contains("1. First"));
        assert!(first.contains("first snippet"));
        assert!(!first.contains("Content:"));
        assert!(second.contains(&format!("Content: {}...", "x".repeat(800))));
        assert!(second.contains("Source: https://b.example"));
    }
}
