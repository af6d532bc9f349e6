pub mod router;
pub mod rules;
pub mod stock;
pub mod weather;

pub use router::{LlmToolSelector, ToolContext, ToolRouter};
pub use rules::{classify, Intent};
pub use stock::{AlphaVantageClient, StockSource};
pub use weather::{OpenWeatherClient, WeatherSource};
