use crate::http::build_client;
use crate::models::{
    CountryCode, MoneyText, PickerBest, ProductRun, ProjectionResponse, ResultTree,
};
use async_trait::async_trait;
use chrono::Datelike;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

pub const ROW_WIDTH: usize = 32;

const COL_NO: usize = 0;
const COL_CATEGORY: usize = 1;
const COL_PRODUCTS: usize = 2;
const COL_CURRENT_MREV: usize = 3;
const COL_MONTHLY_MARKETCAP: usize = 4;
const COL_COMPETITOR: usize = 6;
const COL_COMPETITOR_MREV: usize = 7;
const COL_PRICE: usize = 9;
const COL_FBA_FEES: usize = 11;
const COL_STORAGE_FEES: usize = 13;
const COL_PPU_LOW: usize = 17;
const COL_UNITS_LOW: usize = 18;
const COL_REV_LOW: usize = 19;
const COL_PPU_BASE: usize = 21;
const COL_UNITS_BASE: usize = 22;
const COL_REV_BASE: usize = 23;
const COL_PPU_HIGH: usize = 25;
const COL_UNITS_HIGH: usize = 26;
const COL_REV_HIGH: usize = 27;

#[derive(Debug, Error)]
pub enum SheetError {
    #[error("spreadsheet writer is not configured (set SPREADSHEET_ID and GOOGLE_SHEETS_TOKEN)")]
    NotConfigured,
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response: {0}")]
    Deserialize(String),
}

/// Receives every finished result tree. Failures are reported, never retried.
#[async_trait]
pub trait SheetWriter: Send + Sync {
    /// Returns the number of rows written.
    async fn write_results(&self, tree: &ResultTree) -> Result<usize, SheetError>;
}

/// Used when no spreadsheet credentials are configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledSheets;

#[async_trait]
impl SheetWriter for DisabledSheets {
    async fn write_results(&self, _tree: &ResultTree) -> Result<usize, SheetError> {
        Err(SheetError::NotConfigured)
    }
}

/// Appends one row per product to the tab named after its country.
#[derive(Debug, Clone)]
pub struct SheetsClient {
    base_url: String,
    spreadsheet_id: String,
    access_token: String,
    http: Client,
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

#[derive(Debug, Serialize)]
struct AppendBody<'a> {
    values: [&'a [String]; 1],
}

impl SheetsClient {
    pub fn from_env() -> Option<Self> {
        let spreadsheet_id = non_empty_env("SPREADSHEET_ID")?;
        let access_token = non_empty_env("GOOGLE_SHEETS_TOKEN")?;
        let base_url = std::env::var("SHEETS_API_BASE")
            .unwrap_or_else(|_| "https://sheets.googleapis.com/v4".to_string());
        Some(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            spreadsheet_id,
            access_token,
            http: build_client(),
        })
    }

    fn values_url(&self, range: &str) -> String {
        format!(
            "{}/spreadsheets/{}/values/{}",
            self.base_url,
            self.spreadsheet_id,
            urlencoding::encode(range)
        )
    }

    async fn next_row_number(&self, tab: &str) -> Result<u64, SheetError> {
        let response = self
            .http
            .get(self.values_url(&format!("{tab}!A1:A")))
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|err| SheetError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(SheetError::Request(format!("HTTP {}", response.status())));
        }
        let range: ValueRange = response
            .json()
            .await
            .map_err(|err| SheetError::Deserialize(err.to_string()))?;
        Ok(next_number(&range.values))
    }

    async fn append_row(&self, tab: &str, row: &[String]) -> Result<(), SheetError> {
        let range = format!("{tab}!A1:{}1", column_letter(ROW_WIDTH - 1));
        let url = format!(
            "{}:append?valueInputOption=USER_ENTERED&insertDataOption=INSERT_ROWS",
            self.values_url(&range)
        );
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.access_token)
            .json(&AppendBody { values: [row] })
            .send()
            .await
            .map_err(|err| SheetError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(SheetError::Request(format!("HTTP {}", response.status())));
        }
        Ok(())
    }

    async fn write_country(
        &self,
        tab: CountryCode,
        products: &[ProductRun],
    ) -> Result<usize, SheetError> {
        let month = chrono::Local::now().month();
        let mut written = 0;
        for product in products {
            let mut row = build_row(product, month);
            row[COL_NO] = self.next_row_number(tab.as_str()).await?.to_string();
            self.append_row(tab.as_str(), &row).await?;
            written += 1;
            info!(target = "research.sheets", tab = %tab, no = %row[COL_NO], "row appended");
        }
        Ok(written)
    }
}

#[async_trait]
impl SheetWriter for SheetsClient {
    async fn write_results(&self, tree: &ResultTree) -> Result<usize, SheetError> {
        let mut written = 0;
        for brand in &tree.runs {
            for country in &brand.countries {
                match self.write_country(country.name, &country.products).await {
                    Ok(rows) => written += rows,
                    Err(err) => {
                        warn!(target = "research.sheets", tab = %country.name, error = %err, "skipping country tab");
                    }
                }
            }
        }
        Ok(written)
    }
}

/// Builds the fixed-width row for one product. Storage fees follow the
/// Q4 rate from October on.
pub fn build_row(product: &ProductRun, month: u32) -> Vec<String> {
    let mut row = vec![String::new(); ROW_WIDTH];
    let result = &product.result;

    row[COL_CATEGORY] = if product.category_url.is_empty() {
        product.keyword.clone()
    } else {
        hyperlink(&product.category_url, &product.keyword)
    };
    row[COL_PRODUCTS] = if product.url.is_empty() {
        product.productname.clone()
    } else {
        hyperlink(&product.url, &product.productname)
    };
    row[COL_CURRENT_MREV] = result
        .monthly_revenue
        .meta
        .as_ref()
        .and_then(|meta| meta.parent_level_revenue_text.clone())
        .unwrap_or_default();
    row[COL_MONTHLY_MARKETCAP] = money_text(result.category_revenue.as_ref());

    let raw = result.competitors_flow.raw_result.as_ref();
    let competitor = result.competitors_flow.picker_best.as_ref();
    let pick_field = |get: fn(&PickerBest) -> &str, key: &str| -> String {
        competitor
            .map(get)
            .filter(|v| !v.is_empty())
            .or_else(|| raw.and_then(|flow| flow.extra_str(key)))
            .unwrap_or_default()
            .to_string()
    };
    let comp_url = pick_field(|p| p.url.as_str(), "url");
    let comp_title = pick_field(|p| p.product_details.as_str(), "product_details");
    if !comp_url.is_empty() || !comp_title.is_empty() {
        row[COL_COMPETITOR] = hyperlink(&comp_url, &comp_title);
    }
    row[COL_COMPETITOR_MREV] =
        pick_field(|p| p.parent_level_revenue.as_str(), "parent_level_revenue");

    if let Some(metrics) = &result.profitability_metrics {
        row[COL_PRICE] = money_text(Some(&metrics.product_price));
        row[COL_FBA_FEES] = money_text(Some(&metrics.fba_fees));
        let storage = if month >= 10 {
            &metrics.storage_fee_oct_dec
        } else {
            &metrics.storage_fee_jan_sep
        };
        row[COL_STORAGE_FEES] = money_text(Some(storage));
    }

    if let Some(ProjectionResponse::Totals(totals)) = &result.gpt_projection.response {
        row[COL_UNITS_LOW] = totals.low_total_sales.to_string();
        row[COL_UNITS_BASE] = totals.base_total_sales.to_string();
        row[COL_UNITS_HIGH] = totals.high_total_sales.to_string();
        row[COL_REV_LOW] = totals.low_total_revenue.to_string();
        row[COL_REV_BASE] = totals.base_total_revenue.to_string();
        row[COL_REV_HIGH] = totals.high_total_revenue.to_string();
        row[COL_PPU_LOW] = per_unit(totals.low_total_profit, totals.low_total_sales);
        row[COL_PPU_BASE] = per_unit(totals.base_total_profit_start_ads, totals.base_total_sales);
        row[COL_PPU_HIGH] = per_unit(totals.high_total_profit, totals.high_total_sales);
    }

    row
}

fn money_text(value: Option<&MoneyText>) -> String {
    value.and_then(|m| m.text.clone()).unwrap_or_default()
}

fn per_unit(profit: f64, units: u64) -> String {
    if units == 0 {
        return String::new();
    }
    format!("${:.2}", profit / units as f64)
}

fn hyperlink(url: &str, text: &str) -> String {
    if url.is_empty() {
        return String::new();
    }
    let text = if text.is_empty() { "link" } else { text };
    format!(
        "=HYPERLINK(\"{}\",\"{}\")",
        url.replace('"', "\"\""),
        text.replace('"', "\"\"")
    )
}

/// Next value for the "No." column: last numeric cell plus one.
fn next_number(column: &[Vec<Value>]) -> u64 {
    column
        .iter()
        .rev()
        .filter_map(|row| row.first())
        .find_map(|cell| match cell {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse::<u64>().ok(),
            _ => None,
        })
        .map_or(1, |last| last + 1)
}

/// Zero-based column index to its A1 letter.
fn column_letter(index: usize) -> String {
    let mut n = index + 1;
    let mut letters = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push((b'A' + rem as u8) as char);
        n = (n - 1) / 26;
    }
    letters.iter().rev().collect()
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        CompetitorFlow, GptProjection, ProfitabilityMetrics, ProjectionTotals, RunResult,
    };
    use serde_json::json;

    fn money(text: &str) -> MoneyText {
        MoneyText {
            text: Some(text.into()),
            number: None,
        }
    }

    fn product_run(result: RunResult) -> ProductRun {
        ProductRun {
            productname: "Grip \"Pro\" Football".into(),
            url: "https://www.amazon.com/dp/B0012SNLJG".into(),
            keyword: "football".into(),
            category_url: "https://www.amazon.com/s?k=football".into(),
            result,
        }
    }

    fn full_result() -> RunResult {
        let mut result = RunResult::new("c", "p", "k");
        result.category_revenue = Some(money("$1.2M"));
        result.profitability_metrics = Some(ProfitabilityMetrics {
            fba_fees: money("$5.10"),
            storage_fee_jan_sep: money("$0.12"),
            storage_fee_oct_dec: money("$0.40"),
            product_price: money("$24.99"),
        });
        result.competitors_flow.picker_best = Some(PickerBest {
            url: "https://www.amazon.com/dp/B0COMPET01".into(),
            product_details: "Rival ball".into(),
            parent_level_revenue: "$9,800".into(),
            ..Default::default()
        });
        result.gpt_projection = GptProjection {
            response: Some(ProjectionResponse::Totals(ProjectionTotals {
                base_total_sales: 30,
                base_total_revenue: 3000.0,
                base_total_profit_start_ads: 1350.0,
                base_total_profit_end_ads: 1500.0,
                low_total_sales: 19,
                low_total_revenue: 1968.75,
                low_total_profit: 885.94,
                high_total_sales: 0,
                high_total_revenue: 0.0,
                high_total_profit: 0.0,
            })),
        };
        result
    }

    #[test]
    fn row_fills_expected_columns() {
        let row = build_row(&product_run(full_result()), 3);
        assert_eq!(row.len(), ROW_WIDTH);
        assert_eq!(
            row[COL_PRODUCTS],
            "=HYPERLINK(\"https://www.amazon.com/dp/B0012SNLJG\",\"Grip \"\"Pro\"\" Football\")"
        );
        assert_eq!(row[COL_MONTHLY_MARKETCAP], "$1.2M");
        assert_eq!(row[COL_COMPETITOR_MREV], "$9,800");
        assert_eq!(row[COL_STORAGE_FEES], "$0.12");
        assert_eq!(row[COL_UNITS_BASE], "30");
        assert_eq!(row[COL_PPU_BASE], "$45.00");
        assert_eq!(row[COL_PPU_LOW], "$46.63");
        assert_eq!(row[COL_REV_LOW], "1968.75");
        assert_eq!(row[COL_PPU_HIGH], "", "no units means no per-unit profit");
        assert!(row[COL_NO].is_empty());
    }

    #[test]
    fn q4_uses_peak_storage_fee() {
        let row = build_row(&product_run(full_result()), 11);
        assert_eq!(row[COL_STORAGE_FEES], "$0.40");
    }

    #[test]
    fn competitor_falls_back_to_raw_result() {
        let mut result = RunResult::new("c", "p", "k");
        let raw: CompetitorFlow = serde_json::from_value(json!({
            "url": "https://www.amazon.com/dp/B0RIVAL001",
            "product_details": "Rival ball",
            "parent_level_revenue": "$4,100",
            "picker_best": { "product_details": "Nested pick is ignored" }
        }))
        .unwrap();
        result.competitors_flow.raw_result = Some(raw);
        let row = build_row(&product_run(result), 1);
        assert_eq!(
            row[COL_COMPETITOR],
            "=HYPERLINK(\"https://www.amazon.com/dp/B0RIVAL001\",\"Rival ball\")"
        );
        assert_eq!(row[COL_COMPETITOR_MREV], "$4,100");
        assert_eq!(row[COL_CURRENT_MREV], "");
    }

    #[test]
    fn nested_raw_pick_is_not_a_fallback() {
        let mut result = RunResult::new("c", "p", "k");
        result.competitors_flow.raw_result = Some(CompetitorFlow {
            picker_best: Some(PickerBest {
                product_details: "Unqualified rival".into(),
                parent_level_revenue: "$1".into(),
                ..Default::default()
            }),
            ..Default::default()
        });
        let row = build_row(&product_run(result), 1);
        assert_eq!(row[COL_COMPETITOR], "");
        assert_eq!(row[COL_COMPETITOR_MREV], "");
    }

    #[test]
    fn failed_projection_leaves_projection_columns_blank() {
        let mut result = full_result();
        result.gpt_projection.response = Some(ProjectionResponse::Failed {
            error: "quota".into(),
        });
        let row = build_row(&product_run(result), 1);
        assert!(row[COL_UNITS_LOW..=COL_REV_HIGH].iter().all(String::is_empty));
    }

    #[test]
    fn next_number_skips_headers_and_blanks() {
        let column = vec![
            vec![json!("No.")],
            vec![json!("1")],
            vec![json!(2)],
            vec![],
            vec![json!("notes")],
        ];
        assert_eq!(next_number(&column), 3);
        assert_eq!(next_number(&[vec![json!("No.")]]), 1);
    }

    #[test]
    fn column_letters() {
        assert_eq!(column_letter(0), "A");
        assert_eq!(column_letter(25), "Z");
        assert_eq!(column_letter(31), "AF");
    }

    #[tokio::test]
    async fn disabled_writer_reports_not_configured() {
        let err = DisabledSheets
            .write_results(&ResultTree::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SheetError::NotConfigured));
    }
}
