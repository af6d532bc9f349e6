use std::time::Duration;

use anyhow::Result;
use log::warn;
use reqwest::Client;
use serde_json::{json, Value};

pub const MAX_CRAWL_DEPTH: u32 = 2;
pub const MAX_CRAWL_BREADTH: u32 = 25;
pub const MAX_CRAWL_PAGES: u32 = 30;
pub const MAX_SEARCH_RESULTS: u32 = 8;
const EXTRACT_CHAR_BUDGET: usize = 6_000;
const PAGE_CHAR_BUDGET: usize = 1_200;

/// Client for the hosted search/extract/crawl service. Every method
/// returns `Ok(None)` when the service is reachable but has nothing
/// usable, and `Err` only on transport failure, so callers can fall back
/// to the secondary provider.
pub struct SearchApiClient {
    client: Client,
    base_url: String,
    api_key: String,
}

/// The service's responses are loosely shaped; the content of a result can
/// live under any of these keys depending on the operation.
fn content_of(value: &Value) -> Option<&str> {
    ["content", "raw_content", "text"]
        .into_iter()
        .filter_map(|key| value.get(key).and_then(|v| v.as_str()))
        .find(|s| !s.trim().is_empty())
}

fn truncate(text: &str, budget: usize) -> String {
    if text.len() > budget {
        let mut end = budget;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &text[..end])
    } else {
        text.to_string()
    }
}

impl SearchApiClient {
    pub fn new(base_url: String, api_key: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            base_url,
            api_key,
        }
    }

    async fn post(&self, path: &str, body: Value) -> Result<Option<Value>> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            warn!("Search service {} returned {}", path, status);
            return Ok(None);
        }
        Ok(Some(response.json().await?))
    }

    /// Direct search. `topic`/`days` narrow to recent news for urgent
    /// phrasing.
    pub async fn search(
        &self,
        query: &str,
        topic: Option<&str>,
        days: Option<u32>,
    ) -> Result<Option<String>> {
        let mut body = json!({
            "query": query,
            "max_results": MAX_SEARCH_RESULTS,
            "include_answer": true,
        });
        if let Some(topic) = topic {
            body["topic"] = json!(topic);
        }
        if let Some(days) = days {
            body["days"] = json!(days);
        }

        let Some(data) = self.post("/search", body).await? else {
            return Ok(None);
        };
        Ok(format_search_results(query, &data))
    }

    /// Broad research pass for open-ended or time-sensitive questions.
    pub async fn research(&self, query: &str) -> Result<Option<String>> {
        let body = json!({
            "query": query,
            "max_results": MAX_SEARCH_RESULTS,
            "include_answer": true,
            "search_depth": "advanced",
        });
        let Some(data) = self.post("/search", body).await? else {
            return Ok(None);
        };
        Ok(format_search_results(query, &data))
    }

    /// Pulls the readable text of one page.
    pub async fn extract(&self, url: &str) -> Result<Option<String>> {
        let body = json!({ "urls": [url] });
        let Some(data) = self.post("/extract", body).await? else {
            return Ok(None);
        };

        let content = data
            .get("results")
            .and_then(|r| r.as_array())
            .and_then(|r| r.first())
            .and_then(content_of)
            .map(|text| {
                format!(
                    "[Page content from {}]\n{}",
                    url,
                    truncate(text, EXTRACT_CHAR_BUDGET)
                )
            });
        Ok(content)
    }

    /// Bounded site crawl. External links are never followed.
    pub async fn crawl(&self, url: &str) -> Result<Option<String>> {
        let body = json!({
            "url": url,
            "max_depth": MAX_CRAWL_DEPTH,
            "max_breadth": MAX_CRAWL_BREADTH,
            "limit": MAX_CRAWL_PAGES,
            "allow_external": false,
        });
        let Some(data) = self.post("/crawl", body).await? else {
            return Ok(None);
        };

        let pages = data
            .get("results")
            .and_then(|r| r.as_array())
            .map(|results| {
                results
                    .iter()
                    .filter_map(|page| {
                        let page_url = page.get("url").and_then(|u| u.as_str())?;
                        let text = content_of(page)?;
                        Some(format!("[{}]\n{}", page_url, truncate(text, PAGE_CHAR_BUDGET)))
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        if pages.is_empty() {
            return Ok(None);
        }
        Ok(Some(format!(
            "[Site crawl of {}]\n\n{}",
            url,
            pages.join("\n\n")
        )))
    }

    /// Lists the site's discovered URLs without fetching their content.
    pub async fn map(&self, url: &str) -> Result<Option<String>> {
        let body = json!({ "url": url });
        let Some(data) = self.post("/map", body).await? else {
            return Ok(None);
        };

        let links = data
            .get("results")
            .and_then(|r| r.as_array())
            .map(|results| {
                results
                    .iter()
                    .filter_map(|v| v.as_str().or_else(|| v.get("url").and_then(|u| u.as_str())))
                    .take(MAX_CRAWL_PAGES as usize)
                    .map(|s| format!("- {}", s))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        if links.is_empty() {
            return Ok(None);
        }
        Ok(Some(format!("[Site map of {}]\n{}", url, links.join("\n"))))
    }
}

fn format_search_results(query: &str, data: &Value) -> Option<String> {
    let mut parts = vec![format!("[Web Search Results for: {}]", query)];

    if let Some(answer) = data
        .get("answer")
        .and_then(|a| a.as_str())
        .filter(|a| !a.trim().is_empty())
    {
        parts.push(format!("Answer: {}", answer));
    }

    let results = data.get("results").and_then(|r| r.as_array());
    if let Some(results) = results {
        for (i, result) in results.iter().take(MAX_SEARCH_RESULTS as usize).enumerate() {
            let title = result.get("title").and_then(|t| t.as_str()).unwrap_or("");
            let url = result.get("url").and_then(|u| u.as_str()).unwrap_or("");
            let snippet = content_of(result).unwrap_or("");
            parts.push(format!(
                "{}. {}\n   {}\n   Source: {}",
                i + 1,
                title,
                truncate(snippet, PAGE_CHAR_BUDGET),
                url
            ));
        }
    }

    // A bare header with neither answer nor results is a miss.
    if parts.len() == 1 {
        return None;
    }
    Some(parts.join("\n\n"))
}
