//! Keyword search volumes and the sales projection built on top of them.

use crate::llm::{LlmClient, LlmError, LlmMessage};
use crate::models::{KeywordVolumes, ProjectionResponse, ProjectionTotals};
use crate::stages::StageError;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

const KEYWORD_COLUMN: &str = "Keyword Phrase";
const VOLUME_COLUMN: &str = "Search Volume";
const TOP_KEYWORDS: usize = 10;
const PROMPT_FOOTER: &str = "Aforementioned are the top keywords sorted by search volume.";

const ESTIMATOR_SYSTEM_PROMPT: &str = r#"You are an expert Amazon market analyzer assistant.
You will be given a list of top keywords sorted by search volume.
Analyze the current market situation and return estimated average values for the product as a JSON object
like this: {"CTR": 0.01, "CVR": 0.02, "AOV": 100, "COGS": 50, "Fees": 10, "PPC": 10} where money values share the currency of AOV:
CTR: Click-Through Rate based on the expected search rank for those keywords.
CVR: Conversion Rate for the product listing.
AOV: Average Order Value, also known as the selling price.
COGS: Cost of Goods Sold per unit.
Fees: Amazon Fees (Referral + FBA) per unit.
PPC: Advertising Spend (PPC) per unit required to achieve the rank/traffic.
DO NOT include any other text or comments in your response, only the JSON object."#;

/// Reads an exported keyword CSV and keeps the highest-volume rows.
///
/// Volumes that do not parse count as zero. Ties keep file order.
pub fn keyword_volumes_from_csv(path: &Path) -> Result<KeywordVolumes, StageError> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
    let headers = reader.headers()?.clone();
    let column = |name: &str| {
        headers
            .iter()
            .position(|h| h.trim_start_matches('\u{feff}').trim() == name)
            .ok_or_else(|| StageError::InvalidResponse(format!("keyword export has no `{name}` column")))
    };
    let keyword_idx = column(KEYWORD_COLUMN)?;
    let volume_idx = column(VOLUME_COLUMN)?;

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let phrase = record.get(keyword_idx).unwrap_or_default().to_string();
        let volume = record
            .get(volume_idx)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(0);
        rows.push((phrase, volume));
    }

    rows.sort_by(|a, b| b.1.cmp(&a.1));
    rows.truncate(TOP_KEYWORDS);

    let mut user_prompt = rows
        .iter()
        .map(|(phrase, volume)| format!("{phrase} {volume}"))
        .collect::<Vec<_>>()
        .join("\n");
    if !user_prompt.is_empty() {
        user_prompt.push('\n');
    }
    user_prompt.push_str(PROMPT_FOOTER);

    Ok(KeywordVolumes {
        user_prompt,
        search_volumes: rows.into_iter().map(|(_, volume)| volume).collect(),
    })
}

/// Per-unit market estimates returned by the estimator.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
pub struct MarketEstimates {
    #[serde(rename = "CTR")]
    pub ctr: f64,
    #[serde(rename = "CVR")]
    pub cvr: f64,
    #[serde(rename = "AOV")]
    pub aov: f64,
    #[serde(rename = "COGS")]
    pub cogs: f64,
    #[serde(rename = "Fees")]
    pub fees: f64,
    #[serde(rename = "PPC")]
    pub ppc: f64,
}

#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error("Error during API call: {0}")]
    Llm(#[from] LlmError),
    #[error("Response is not a valid JSON dictionary: {0}")]
    Parse(#[from] serde_json::Error),
}

pub fn parse_estimates(raw: &str) -> Result<MarketEstimates, ProjectionError> {
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed);
    Ok(serde_json::from_str(body.trim())?)
}

/// Base, low and high scenario totals for the given keyword volumes.
///
/// Low scenario scales traffic by 0.875 and conversion by 0.75; high scales
/// them by 1.125 and 1.25.
pub fn project(volumes: &[u64], est: &MarketEstimates) -> ProjectionTotals {
    let ppu_start_ads = est.aov - (est.cogs + est.fees + est.ppc);
    let ppu_end_ads = est.aov - (est.cogs + est.fees);

    let sales_with = |traffic_factor: f64, conversion_factor: f64| -> Vec<f64> {
        volumes
            .iter()
            .map(|&v| v as f64 * traffic_factor * est.ctr * conversion_factor * est.cvr)
            .collect()
    };
    let base = sales_with(1.0, 1.0);
    let low = sales_with(0.875, 0.75);
    let high = sales_with(1.125, 1.25);

    let total = |sales: &[f64], per_unit: f64| round2(sales.iter().map(|s| s * per_unit).sum());
    let units = |sales: &[f64]| sales.iter().sum::<f64>().floor().max(0.0) as u64;

    ProjectionTotals {
        base_total_sales: units(&base),
        base_total_revenue: total(&base, est.aov),
        base_total_profit_start_ads: total(&base, ppu_start_ads),
        base_total_profit_end_ads: total(&base, ppu_end_ads),
        low_total_sales: units(&low),
        low_total_revenue: total(&low, est.aov),
        low_total_profit: total(&low, ppu_start_ads),
        high_total_sales: units(&high),
        high_total_revenue: total(&high, est.aov),
        high_total_profit: total(&high, ppu_start_ads),
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// External projection call. Never fails: problems are reported inside the
/// response.
#[async_trait]
pub trait Projector: Send + Sync {
    async fn project(&self, user_prompt: &str, search_volumes: &[u64]) -> ProjectionResponse;
}

pub struct LlmProjector {
    client: LlmClient,
}

impl LlmProjector {
    pub fn new(client: LlmClient) -> Self {
        Self { client }
    }

    async fn estimate(&self, user_prompt: &str) -> Result<MarketEstimates, ProjectionError> {
        let reply = self
            .client
            .chat(&[
                LlmMessage::system(ESTIMATOR_SYSTEM_PROMPT),
                LlmMessage::user(user_prompt),
            ])
            .await?;
        parse_estimates(&reply)
    }
}

#[async_trait]
impl Projector for LlmProjector {
    async fn project(&self, user_prompt: &str, search_volumes: &[u64]) -> ProjectionResponse {
        match self.estimate(user_prompt).await {
            Ok(estimates) => {
                info!(target = "research.projection", ?estimates, "market estimates received");
                ProjectionResponse::Totals(project(search_volumes, &estimates))
            }
            Err(err) => {
                warn!(target = "research.projection", error = %err, "projection failed");
                ProjectionResponse::Failed {
                    error: err.to_string(),
                }
            }
        }
    }
}
