use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use lazy_static::lazy_static;
use log::warn;
use regex::Regex;
use reqwest::Client;
use serde_json::Value;

#[async_trait]
pub trait StockSource: Send + Sync {
    /// `Ok(None)` when the symbol is unknown or malformed; errors are
    /// transport failures only.
    async fn quote(&self, symbol: &str) -> Result<Option<String>>;
}

lazy_static! {
    static ref SYMBOL_RE: Regex = Regex::new(r"^[A-Z\.]{1,10}$").unwrap();
}

pub struct AlphaVantageClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl AlphaVantageClient {
    pub fn new(base_url: String, api_key: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            base_url,
            api_key,
        }
    }
}

#[async_trait]
impl StockSource for AlphaVantageClient {
    async fn quote(&self, symbol: &str) -> Result<Option<String>> {
        let symbol = symbol.to_uppercase();
        if !SYMBOL_RE.is_match(&symbol) {
            warn!("Rejected stock lookup for invalid symbol: {:?}", symbol);
            return Ok(None);
        }

        let response = self
            .client
            .get(format!("{}/query", self.base_url))
            .query(&[
                ("function", "GLOBAL_QUOTE"),
                ("symbol", symbol.as_str()),
                ("apikey", self.api_key.as_str()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            warn!("Stock API returned {} for symbol {}", response.status(), symbol);
            return Ok(None);
        }

        let data: Value = response.json().await?;
        let price = data
            .get("Global Quote")
            .and_then(|q| q.get("05. price"))
            .and_then(|p| p.as_str())
            .map(|p| p.to_string());

        match price {
            Some(price) => Ok(Some(format!("Current price for {}: ${}", symbol, price))),
            None => {
                warn!("Stock symbol not found: {}", symbol);
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn invalid_symbols_are_refused_without_network() {
        let client = AlphaVantageClient::new("http://127.0.0.1:1".into(), "key".into());
        assert_eq!(client.quote("not-a-ticker").await.unwrap(), None);
        assert_eq!(client.quote("TOOLONGSYMBOL").await.unwrap(), None);
    }
}
