use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use lazy_static::lazy_static;
use log::warn;
use regex::Regex;
use reqwest::Client;
use serde_json::Value;

#[async_trait]
pub trait WeatherSource: Send + Sync {
    /// `Ok(None)` means no weather data for that input; only transport
    /// failures surface as errors.
    async fn current(&self, city: &str) -> Result<Option<String>>;
}

lazy_static! {
    static ref CITY_NAME_RE: Regex = Regex::new(r"^[a-zA-Z\s\-']+$").unwrap();
}

pub struct OpenWeatherClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl OpenWeatherClient {
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
impl WeatherSource for OpenWeatherClient {
    async fn current(&self, city: &str) -> Result<Option<String>> {
        if !CITY_NAME_RE.is_match(city) {
            warn!("Rejected weather lookup for suspicious city name: {:?}", city);
            return Ok(None);
        }

        let response = self
            .client
            .get(format!("{}/data/2.5/weather", self.base_url))
            .query(&[
                ("q", city),
                ("appid", self.api_key.as_str()),
                ("units", "metric"),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            warn!("Weather API returned {} for city {}", response.status(), city);
            return Ok(None);
        }

        let data: Value = response.json().await?;
        let description = data
            .get("weather")
            .and_then(|w| w.get(0))
            .and_then(|w| w.get("description"))
            .and_then(|d| d.as_str())
            .map(title_case);
        let temp = data
            .get("main")
            .and_then(|m| m.get("temp"))
            .and_then(|t| t.as_f64());
        let country = data
            .get("sys")
            .and_then(|s| s.get("country"))
            .and_then(|c| c.as_str());

        match (description, temp, country) {
            (Some(description), Some(temp), Some(country)) => Ok(Some(format!(
                "Current weather in {}, {}: {}, {}°C",
                city, country, description, temp
            ))),
            _ => {
                warn!("Weather API response missing expected fields for {}", city);
                Ok(None)
            }
        }
    }
}

fn title_case(s: &str) -> String {
    s.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
