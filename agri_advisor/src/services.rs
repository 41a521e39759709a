//! Narrow contracts for the external collaborators the core calls into:
//! weather, image diagnosis, mandi prices and the conversation log.
//!
//! Every failure here is recoverable from the caller's point of view.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::ServiceError;

/// Wind speed at or above which spraying drifts, in m/s.
pub const MAX_SPRAY_WIND_MS: f32 = 8.0;
/// Humidity at or above which sprays wash off or fail to dry, in percent.
pub const MAX_SPRAY_HUMIDITY_PCT: f32 = 85.0;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Forecast {
    pub location: String,
    /// Free-text conditions, e.g. "rain in 6 hours".
    pub summary: String,
    pub temperature_c: f32,
    pub humidity_pct: f32,
    pub wind_speed_ms: f32,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SprayAdvice {
    pub suitable: bool,
    pub reasons: Vec<String>,
}

/// Whether field conditions allow spraying right now.
pub fn check_spray_conditions(forecast: &Forecast) -> SprayAdvice {
    let mut reasons = Vec::new();
    let summary = forecast.summary.to_lowercase();

    if ["rain", "storm", "thunder", "shower", "drizzle"]
        .iter()
        .any(|w| summary.contains(w))
    {
        reasons.push(format!("Rain expected ({}), spray would wash off", forecast.summary));
    }
    if forecast.wind_speed_ms >= MAX_SPRAY_WIND_MS {
        reasons.push(format!("Wind {:.1} m/s is too strong, spray will drift", forecast.wind_speed_ms));
    }
    if forecast.humidity_pct >= MAX_SPRAY_HUMIDITY_PCT {
        reasons.push(format!("Humidity {:.0}% is too high for spraying", forecast.humidity_pct));
    }

    SprayAdvice { suitable: reasons.is_empty(), reasons }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageDiagnosis {
    pub label: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MandiPrice {
    pub market: String,
    pub crop: String,
    /// Rupees per quintal.
    pub min_price: f64,
    pub max_price: f64,
    pub modal_price: f64,
}

/// The market paying the highest maximum price.
pub fn best_mandi(prices: &[MandiPrice]) -> Option<&MandiPrice> {
    prices
        .iter()
        .max_by(|a, b| a.max_price.partial_cmp(&b.max_price).unwrap_or(std::cmp::Ordering::Equal))
}

#[async_trait]
pub trait WeatherService: Send + Sync + fmt::Debug {
    async fn get_forecast(&self, location: &str) -> Result<Forecast, ServiceError>;
}

#[async_trait]
pub trait VisionService: Send + Sync + fmt::Debug {
    async fn analyze_image(&self, image: &[u8]) -> Result<ImageDiagnosis, ServiceError>;
}

#[async_trait]
pub trait MarketService: Send + Sync + fmt::Debug {
    async fn get_prices(&self, crop: &str, market: Option<&str>) -> Result<Vec<MandiPrice>, ServiceError>;
}

/// One answered query as handed to the persistence collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggedTurn {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub query: String,
    pub response: String,
    pub sources: Vec<String>,
    pub at: DateTime<Utc>,
}

#[async_trait]
pub trait ConversationLog: Send + Sync + fmt::Debug {
    async fn save_turn(&self, turn: LoggedTurn) -> Result<(), ServiceError>;
}

/// Process-local log, newest last.
#[derive(Debug, Default)]
pub struct InMemoryConversationLog {
    turns: Mutex<Vec<LoggedTurn>>,
}

impl InMemoryConversationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn turns(&self, user_id: &str) -> Vec<LoggedTurn> {
        self.turns
            .lock()
            .iter()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ConversationLog for InMemoryConversationLog {
    async fn save_turn(&self, turn: LoggedTurn) -> Result<(), ServiceError> {
        self.turns.lock().push(turn);
        Ok(())
    }
}

/// The collaborators available to the specialists. Missing ones degrade.
#[derive(Debug, Clone, Default)]
pub struct Services {
    pub weather: Option<Arc<dyn WeatherService>>,
    pub vision: Option<Arc<dyn VisionService>>,
    pub market: Option<Arc<dyn MarketService>>,
}

impl Services {
    pub fn with_weather(mut self, service: Arc<dyn WeatherService>) -> Self {
        self.weather = Some(service);
        self
    }

    pub fn with_vision(mut self, service: Arc<dyn VisionService>) -> Self {
        self.vision = Some(service);
        self
    }

    pub fn with_market(mut self, service: Arc<dyn MarketService>) -> Self {
        self.market = Some(service);
        self
    }
}
