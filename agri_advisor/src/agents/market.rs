use async_trait::async_trait;
use serde_json::json;
use std::fmt::Write;
use tracing::{instrument, warn};

use super::prompt::{compose, PromptParts};
use super::{
    references, AgentDeps, AgentHealth, Specialist, SpecialistCore, SpecialistKind,
    SpecialistRequest, SpecialistResponse,
};
use crate::error::AgentError;
use crate::services::{best_mandi, MandiPrice};

const COLLECTIONS: &[&str] = &["market_data"];

const INSTRUCTIONS: &[&str] = &[
    "Summarise current prices per quintal and the trend if the data shows one.",
    "Recommend whether to sell now or hold, and where to sell.",
    "Mention MSP where it applies and any transport or storage considerations.",
];

/// Mandi prices and selling advice.
#[derive(Debug)]
pub struct MarketAgent {
    core: SpecialistCore,
}

fn price_table(prices: &[MandiPrice]) -> String {
    let mut table = String::new();
    for p in prices {
        let _ = writeln!(
            table,
            "- {} ({}): min ₹{:.0}, max ₹{:.0}, modal ₹{:.0} per quintal",
            p.market, p.crop, p.min_price, p.max_price, p.modal_price
        );
    }
    if let Some(best) = best_mandi(prices) {
        let _ = write!(table, "Best price currently at {} (₹{:.0}).", best.market, best.max_price);
    }
    table
}

impl MarketAgent {
    pub fn new(deps: AgentDeps) -> Self {
        Self { core: SpecialistCore::new(SpecialistKind::Market, deps) }
    }

    async fn prices(&self, request: &SpecialistRequest) -> Result<Vec<MandiPrice>, String> {
        let Some(crop) = request.entity("crop") else {
            return Err("no crop was named, so live mandi prices were not looked up".into());
        };
        let Some(market) = self.core.services().market.clone() else {
            return Err("live mandi prices are not available, figures are from the knowledge base".into());
        };
        match market.get_prices(crop, request.entity("market")).await {
            Ok(prices) if prices.is_empty() => Err(format!("no live mandi prices were found for {crop}")),
            Ok(prices) => Ok(prices),
            Err(e) => {
                warn!(crop, error = %e, "Price lookup failed");
                Err("live mandi prices could not be fetched, figures are from the knowledge base".into())
            }
        }
    }

    async fn answer(&self, request: &SpecialistRequest) -> Result<SpecialistResponse, AgentError> {
        let knowledge = self.core.knowledge(&request.query, self.collections()).await?;

        let (prices, degraded) = match self.prices(request).await {
            Ok(prices) => (prices, None),
            Err(note) => (Vec::new(), Some(note)),
        };

        let mut external = Vec::new();
        if !prices.is_empty() {
            external.push(("Live mandi prices".to_string(), price_table(&prices)));
        }

        let prompt = compose(&PromptParts {
            persona: "an agricultural market analyst",
            instructions: INSTRUCTIONS,
            query: &request.query,
            entities: &request.entities,
            memory: &request.memory_context,
            knowledge: &knowledge,
            external,
            degraded: degraded.as_deref(),
        });
        let text = self.core.generate(prompt).await?;

        let metadata = json!({
            "best_mandi": best_mandi(&prices),
            "prices": prices,
            "references": references(&knowledge),
        });
        Ok(self.core.respond(text, &knowledge, metadata, degraded))
    }
}

#[async_trait]
impl Specialist for MarketAgent {
    fn kind(&self) -> SpecialistKind {
        SpecialistKind::Market
    }

    fn collections(&self) -> &'static [&'static str] {
        COLLECTIONS
    }

    #[instrument(skip_all, fields(agent = "market"))]
    async fn handle(&self, request: &SpecialistRequest) -> Result<SpecialistResponse, AgentError> {
        self.core.track(self.answer(request)).await
    }

    fn health(&self) -> AgentHealth {
        self.core.health()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_table_names_best_market() {
        let prices = vec![
            MandiPrice {
                market: "Warangal".into(),
                crop: "cotton".into(),
                min_price: 6800.0,
                max_price: 7200.0,
                modal_price: 7000.0,
            },
            MandiPrice {
                market: "Khammam".into(),
                crop: "cotton".into(),
                min_price: 6900.0,
                max_price: 7400.0,
                modal_price: 7150.0,
            },
        ];
        let table = price_table(&prices);
        assert!(table.contains("- Warangal (cotton): min ₹6800"));
        assert!(table.ends_with("Best price currently at Khammam (₹7400)."));
    }
}
