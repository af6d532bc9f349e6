use lazy_static::lazy_static;
use regex::Regex;

/// Classified intent for one message. At most one intent applies; the rule
/// table below is ordered and the first match wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    /// City is absent when the message has no "in <city>" phrase; the
    /// router substitutes the configured default city.
    Weather { city: Option<String> },
    /// Symbol is absent when stock phrasing appears without a ticker; the
    /// router treats that as "no tool".
    Stock { symbol: Option<String> },
    WebSearch,
}

lazy_static! {
    static ref CITY_RE: Regex = Regex::new(r"(?i)in\s+([a-zA-Z\s\-']+)").unwrap();
    static ref TICKER_RE: Regex = Regex::new(r"\b([A-Z]{1,5})\b").unwrap();
}

const SEARCH_TRIGGERS: &[&str] = &[
    "search",
    "look up",
    "find out",
    "google",
    "browse",
    "latest",
    "recent",
    "current",
    "today",
    "yesterday",
    "this week",
    "this month",
    "this year",
    "2024",
    "2025",
    "2026",
    "2027",
    "news",
    "what is happening",
    "what happened",
    "update",
    "winner",
    "won",
    "champion",
    "championship",
    "cup",
    "tournament",
    "match",
    "score",
    "afcon",
    "world cup",
    "premier league",
    "champions league",
    "who is the",
    "what is the current",
    "how much is",
    "price of",
    "president of",
    "ceo of",
    "prime minister",
];

struct Rule {
    name: &'static str,
    matcher: fn(&str, &str) -> Option<Intent>,
}

fn weather_rule(message: &str, lower: &str) -> Option<Intent> {
    if !lower.contains("weather") {
        return None;
    }
    let city = CITY_RE
        .captures(message)
        .map(|c| c[1].trim().to_string())
        .filter(|c| !c.is_empty());
    Some(Intent::Weather { city })
}

fn stock_rule(message: &str, lower: &str) -> Option<Intent> {
    if !(lower.contains("stock") || message.contains('$') || TICKER_RE.is_match(message)) {
        return None;
    }
    let symbol = TICKER_RE
        .captures(message)
        .map(|c| c[1].to_string());
    Some(Intent::Stock { symbol })
}

fn web_search_rule(_message: &str, lower: &str) -> Option<Intent> {
    SEARCH_TRIGGERS
        .iter()
        .any(|t| lower.contains(t))
        .then_some(Intent::WebSearch)
}

/// Ordered rule table. Weather outranks stock, stock outranks web search.
static RULES: &[Rule] = &[
    Rule {
        name: "weather",
        matcher: weather_rule,
    },
    Rule {
        name: "stock",
        matcher: stock_rule,
    },
    Rule {
        name: "web_search",
        matcher: web_search_rule,
    },
];

pub fn classify(message: &str) -> Option<Intent> {
    let lower = message.to_lowercase();
    for rule in RULES {
        if let Some(intent) = (rule.matcher)(message, &lower) {
            log::debug!("Intent rule '{}' matched", rule.name);
            return Some(intent);
        }
    }
    None
}
