use std::sync::Arc;

use log::warn;
use serde::Deserialize;

use crate::llm::GenerationService;
use crate::web::WebSource;

use super::rules::{classify, Intent};
use super::stock::StockSource;
use super::weather::WeatherSource;

/// Context produced by exactly one tool branch. Web search results are the
/// only kind that also gets injected into the current message text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolContext {
    Weather(String),
    Stock(String),
    WebSearch(String),
}

impl ToolContext {
    pub fn text(&self) -> &str {
        match self {
            ToolContext::Weather(t) | ToolContext::Stock(t) | ToolContext::WebSearch(t) => t,
        }
    }

    pub fn is_web_search(&self) -> bool {
        matches!(self, ToolContext::WebSearch(_))
    }
}

/// Routes a message to at most one tool provider. Provider errors degrade
/// to "no context"; a chat turn never fails because a tool was down.
pub struct ToolRouter {
    weather: Arc<dyn WeatherSource>,
    stock: Arc<dyn StockSource>,
    web: Arc<dyn WebSource>,
    default_city: String,
}

impl ToolRouter {
    pub fn new(
        weather: Arc<dyn WeatherSource>,
        stock: Arc<dyn StockSource>,
        web: Arc<dyn WebSource>,
        default_city: String,
    ) -> Self {
        Self {
            weather,
            stock,
            web,
            default_city,
        }
    }

    pub async fn route(&self, user_id: &str, message: &str) -> Option<ToolContext> {
        self.dispatch(user_id, classify(message)?, message).await
    }

    /// Runs a pre-classified intent, for callers using the model-driven
    /// selector instead of the keyword rules.
    pub async fn dispatch(
        &self,
        user_id: &str,
        intent: Intent,
        message: &str,
    ) -> Option<ToolContext> {
        match intent {
            Intent::Weather { city } => {
                let city = city.unwrap_or_else(|| self.default_city.clone());
                match self.weather.current(&city).await {
                    Ok(Some(text)) => Some(ToolContext::Weather(text)),
                    Ok(None) => None,
                    Err(e) => {
                        warn!("Weather provider failed for {}: {}", city, e);
                        None
                    }
                }
            }
            Intent::Stock { symbol } => {
                let symbol = symbol?;
                match self.stock.quote(&symbol).await {
                    Ok(Some(text)) => Some(ToolContext::Stock(text)),
                    Ok(None) => None,
                    Err(e) => {
                        warn!("Stock provider failed for {}: {}", symbol, e);
                        None
                    }
                }
            }
            Intent::WebSearch => match self.web.fetch(user_id, message).await {
                Ok(Some(text)) => Some(ToolContext::WebSearch(format!(
                    "[Web Search Results - Use this data to answer]:\n{}",
                    text
                ))),
                Ok(None) => None,
                Err(e) => {
                    warn!("Web context provider failed: {}", e);
                    None
                }
            },
        }
    }
}

#[derive(Deserialize)]
struct ToolSelection {
    tool: String,
    #[serde(default)]
    argument: Option<String>,
}

const SELECTOR_PROMPT: &str = "Decide whether the user message needs a tool. \
Respond with one JSON object only, no prose: \
{\"tool\": \"weather\" | \"stock\" | \"web_search\" | \"none\", \"argument\": string | null}. \
For weather the argument is the city, for stock the ticker symbol.";

/// Model-driven alternative to the keyword rules: one structured-output
/// call, and any malformed reply is discarded rather than retried.
pub struct LlmToolSelector {
    service: Arc<dyn GenerationService>,
}

impl LlmToolSelector {
    pub fn new(service: Arc<dyn GenerationService>) -> Self {
        Self { service }
    }

    pub async fn select(&self, message: &str) -> Option<Intent> {
        let prompt = format!("{}\n\nUser message: {}", SELECTOR_PROMPT, message);
        let response = match self.service.complete(&prompt).await {
            Ok(text) => text,
            Err(e) => {
                warn!("Tool selector call failed: {}", e);
                return None;
            }
        };
        parse_selection(&response)
    }
}

fn parse_selection(text: &str) -> Option<Intent> {
    let cleaned = text
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    let selection: ToolSelection = serde_json::from_str(cleaned).ok()?;
    let argument = selection.argument.filter(|a| !a.trim().is_empty());
    match selection.tool.as_str() {
        "weather" => Some(Intent::Weather { city: argument }),
        "stock" => Some(Intent::Stock {
            symbol: argument.map(|s| s.to_uppercase()),
        }),
        "web_search" => Some(Intent::WebSearch),
        _ => None,
    }
}
