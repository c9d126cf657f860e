use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

// -------- Intake --------

#[derive(Debug, Clone, Deserialize)]
pub struct SubmissionRequest {
    #[serde(default)]
    pub brands: Vec<BrandRequest>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrandRequest {
    #[serde(default)]
    pub brand: String,
    #[serde(default)]
    pub countries: Vec<CountryRequest>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CountryRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub products: Vec<Product>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntakeError {
    #[error("No brands provided")]
    NoBrands,
    #[error("No valid countries found")]
    NoValidCountries,
}

impl SubmissionRequest {
    /// Normalizes country names, drops unknown countries and brands left
    /// without any country.
    pub fn into_submission(self) -> Result<Submission, IntakeError> {
        if self.brands.is_empty() {
            return Err(IntakeError::NoBrands);
        }

        let mut brands = Vec::new();
        for brand in self.brands {
            let countries = brand
                .countries
                .into_iter()
                .filter_map(|country| match CountryCode::normalize(&country.name) {
                    Some(code) => Some(Country {
                        name: code,
                        products: country.products,
                    }),
                    None => {
                        warn!(
                            target = "research.intake",
                            country = %country.name,
                            "skipping invalid/unknown country"
                        );
                        None
                    }
                })
                .collect::<Vec<_>>();

            if !countries.is_empty() {
                brands.push(Brand {
                    brand: brand.brand,
                    countries,
                });
            }
        }

        if brands.is_empty() {
            return Err(IntakeError::NoValidCountries);
        }
        Ok(Submission { brands })
    }
}

// -------- Submission --------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Submission {
    pub brands: Vec<Brand>,
}

impl Submission {
    pub fn product_count(&self) -> usize {
        self.brands
            .iter()
            .flat_map(|b| b.countries.iter())
            .map(|c| c.products.len())
            .sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Brand {
    pub brand: String,
    pub countries: Vec<Country>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Country {
    pub name: CountryCode,
    #[serde(default)]
    pub products: Vec<Product>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Product {
    #[serde(default)]
    pub productname: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub keyword: String,
    #[serde(default, rename = "categoryUrl")]
    pub category_url: String,
}

/// Marketplaces the research tabs exist for. Declaration order is the
/// spreadsheet tab order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CountryCode {
    #[serde(rename = "US")]
    Us,
    #[serde(rename = "UK")]
    Uk,
    #[serde(rename = "CAN")]
    Can,
    #[serde(rename = "AUS")]
    Aus,
    #[serde(rename = "DE")]
    De,
    #[serde(rename = "UAE")]
    Uae,
}

impl CountryCode {
    pub const ALL: [CountryCode; 6] = [
        CountryCode::Us,
        CountryCode::Uk,
        CountryCode::Can,
        CountryCode::Aus,
        CountryCode::De,
        CountryCode::Uae,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CountryCode::Us => "US",
            CountryCode::Uk => "UK",
            CountryCode::Can => "CAN",
            CountryCode::Aus => "AUS",
            CountryCode::De => "DE",
            CountryCode::Uae => "UAE",
        }
    }

    pub fn normalize(input: &str) -> Option<Self> {
        let upper = input.trim().to_uppercase();
        let canonical = match upper.as_str() {
            "AU" => "AUS",
            other => other,
        };
        Self::ALL.into_iter().find(|code| code.as_str() == canonical)
    }
}

impl std::fmt::Display for CountryCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// -------- Stage payloads --------

/// A figure read off the extension UI, kept both as displayed and as a bare
/// number string.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MoneyText {
    pub text: Option<String>,
    pub number: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MonthlyRevenueMeta {
    pub asin: Option<String>,
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub product_url: String,
    pub parent_level_revenue: Option<f64>,
    pub parent_level_revenue_text: Option<String>,
    #[serde(default)]
    pub source_url: String,
    #[serde(default)]
    pub saved_csv: String,
    #[serde(default)]
    pub scraped_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PickerBest {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub product_details: String,
    #[serde(default)]
    pub parent_level_revenue: String,
    #[serde(default)]
    pub creation_date: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PickerBest {
    /// A pick is usable only when all three identifying fields are present.
    pub fn is_qualifying(&self) -> bool {
        !self.url.trim().is_empty()
            && !self.product_details.trim().is_empty()
            && !self.parent_level_revenue.trim().is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CompetitorFlow {
    pub downloaded_path: Option<String>,
    pub picker_best: Option<PickerBest>,
    pub updated_total_revenue_text: Option<String>,
    pub updated_total_revenue_number: Option<String>,
    /// Worker fields not modelled above, kept so the raw result round-trips.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CompetitorFlow {
    /// A non-empty top-level string field of the raw payload.
    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra
            .get(key)
            .and_then(Value::as_str)
            .filter(|v| !v.is_empty())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProfitabilityMetrics {
    pub fba_fees: MoneyText,
    pub storage_fee_jan_sep: MoneyText,
    pub storage_fee_oct_dec: MoneyText,
    pub product_price: MoneyText,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct KeywordVolumes {
    pub user_prompt: String,
    pub search_volumes: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectionTotals {
    pub base_total_sales: u64,
    pub base_total_revenue: f64,
    pub base_total_profit_start_ads: f64,
    pub base_total_profit_end_ads: f64,
    pub low_total_sales: u64,
    pub low_total_revenue: f64,
    pub low_total_profit: f64,
    pub high_total_sales: u64,
    pub high_total_revenue: f64,
    pub high_total_profit: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ProjectionResponse {
    Totals(ProjectionTotals),
    Failed {
        #[serde(rename = "Error")]
        error: String,
    },
}

// -------- Results --------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunInputs {
    pub category_url: String,
    pub product_url: String,
    pub keyword: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MonthlyRevenueSlot {
    pub meta: Option<MonthlyRevenueMeta>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GptProjection {
    pub response: Option<ProjectionResponse>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CompetitorsSlot {
    pub picker_best: Option<PickerBest>,
    pub raw_result: Option<CompetitorFlow>,
}

/// Everything one product's pipeline produced. Stage slots stay `None` when
/// the stage never succeeded; `errors` has one entry per failed attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunResult {
    pub inputs: RunInputs,
    pub category_revenue: Option<MoneyText>,
    pub monthly_revenue: MonthlyRevenueSlot,
    pub competitors_flow: CompetitorsSlot,
    pub profitability_metrics: Option<ProfitabilityMetrics>,
    pub keywords_volumes: Option<KeywordVolumes>,
    pub gpt_projection: GptProjection,
    pub errors: Vec<String>,
}

impl RunResult {
    pub fn new(category_url: &str, product_url: &str, keyword: &str) -> Self {
        Self {
            inputs: RunInputs {
                category_url: category_url.to_string(),
                product_url: product_url.to_string(),
                keyword: keyword.to_string(),
            },
            category_revenue: None,
            monthly_revenue: MonthlyRevenueSlot::default(),
            competitors_flow: CompetitorsSlot::default(),
            profitability_metrics: None,
            keywords_volumes: None,
            gpt_projection: GptProjection::default(),
            errors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResultTree {
    pub runs: Vec<BrandRun>,
}

impl ResultTree {
    pub fn product_runs(&self) -> impl Iterator<Item = (&CountryRun, &ProductRun)> {
        self.runs
            .iter()
            .flat_map(|b| b.countries.iter())
            .flat_map(|c| c.products.iter().map(move |p| (c, p)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrandRun {
    pub brand: String,
    pub countries: Vec<CountryRun>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CountryRun {
    pub name: CountryCode,
    pub products: Vec<ProductRun>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProductRun {
    pub productname: String,
    pub url: String,
    pub keyword: String,
    #[serde(rename = "categoryUrl")]
    pub category_url: String,
    pub result: RunResult,
}

/// Outcome of one run controller invocation.
#[derive(Debug, Clone, Serialize)]
pub struct RunEnvelope {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<ResultTree>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub message: String,
}

impl RunEnvelope {
    pub fn completed(results: ResultTree) -> Self {
        Self {
            success: true,
            run_id: None,
            results: Some(results),
            error: None,
            message: "Scraper completed successfully".into(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            run_id: None,
            results: None,
            error: Some(error.into()),
            message: "Scraper failed".into(),
        }
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn product() -> Value {
        json!({
            "productname": "Grip Football",
            "url": "https://www.amazon.com/x/dp/B0012SNLJG",
            "keyword": "football",
            "categoryUrl": "https://www.amazon.com/s?k=football"
        })
    }

    #[test]
    fn normalize_maps_alias_and_case() {
        assert_eq!(CountryCode::normalize(" au "), Some(CountryCode::Aus));
        assert_eq!(CountryCode::normalize("uk"), Some(CountryCode::Uk));
        assert_eq!(CountryCode::normalize("AUS"), Some(CountryCode::Aus));
        assert_eq!(CountryCode::normalize("FR"), None);
        assert_eq!(CountryCode::normalize(""), None);
    }

    #[test]
    fn intake_normalizes_and_drops_unknown_countries() {
        let request: SubmissionRequest = serde_json::from_value(json!({
            "brands": [
                {
                    "brand": "Big wipes",
                    "countries": [
                        { "name": "AU", "products": [product()] },
                        { "name": "FR", "products": [product()] }
                    ]
                },
                {
                    "brand": "Only unknown",
                    "countries": [{ "name": "JP", "products": [product()] }]
                }
            ]
        }))
        .unwrap();

        let submission = request.into_submission().expect("valid submission");
        assert_eq!(submission.brands.len(), 1);
        assert_eq!(submission.brands[0].countries.len(), 1);
        assert_eq!(submission.brands[0].countries[0].name, CountryCode::Aus);
        assert_eq!(submission.product_count(), 1);
        assert_eq!(
            submission.brands[0].countries[0].products[0].category_url,
            "https://www.amazon.com/s?k=football"
        );
    }

    #[test]
    fn intake_rejects_empty_and_all_invalid() {
        let empty = SubmissionRequest { brands: vec![] };
        assert_eq!(empty.into_submission(), Err(IntakeError::NoBrands));

        let request: SubmissionRequest = serde_json::from_value(json!({
            "brands": [{ "brand": "b", "countries": [{ "name": "XX", "products": [] }] }]
        }))
        .unwrap();
        assert_eq!(request.into_submission(), Err(IntakeError::NoValidCountries));
    }

    #[test]
    fn picker_best_requires_all_fields() {
        let mut pick = PickerBest {
            url: "https://www.amazon.com/dp/B000000001".into(),
            product_details: "Widget".into(),
            parent_level_revenue: "$1,200".into(),
            ..Default::default()
        };
        assert!(pick.is_qualifying());
        pick.parent_level_revenue = "  ".into();
        assert!(!pick.is_qualifying());
    }

    #[test]
    fn country_serializes_as_canonical_code() {
        let country = Country {
            name: CountryCode::Uae,
            products: vec![],
        };
        let value = serde_json::to_value(&country).unwrap();
        assert_eq!(value["name"], json!("UAE"));
    }

    #[test]
    fn projection_failure_serializes_with_error_key() {
        let failed = ProjectionResponse::Failed {
            error: "boom".into(),
        };
        assert_eq!(serde_json::to_value(&failed).unwrap(), json!({"Error": "boom"}));
    }
}
