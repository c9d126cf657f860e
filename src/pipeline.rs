use crate::config::StageSettings;
use crate::metrics;
use crate::models::{
    BrandRun, CompetitorFlow, CountryRun, KeywordVolumes, PickerBest, Product, ProductRun,
    ResultTree, RunResult, Submission,
};
use crate::projection::{Projector, keyword_volumes_from_csv};
use crate::retry::{Recovery, RetryPolicy, retry_stage, retry_validated};
use crate::stages::{
    BoxFuture, CompetitorQuery, KeywordExport, ResearchStages, StageError, clear_csv_exports,
};
use once_cell::sync::Lazy;
use regex::Regex;
use std::{fs, future::Future, sync::Arc, time::Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

static ASIN_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/dp/([A-Z0-9]{10})").expect("ASIN pattern compiles"));

const NO_QUALIFYING_PICK: &str = "no qualifying product found in CSV";
const ASIN_MISSING_WARNING: &str = "[WARN] Could not parse ASIN from product_url; skipping cerebro";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RunError {
    #[error("No brands provided")]
    EmptySubmission,
}

/// Runs the five research stages for one product at a time.
#[derive(Clone)]
pub struct Pipeline {
    stages: Arc<dyn ResearchStages>,
    projector: Arc<dyn Projector>,
    settings: Arc<StageSettings>,
    policy: RetryPolicy,
}

impl Pipeline {
    pub fn new(
        stages: Arc<dyn ResearchStages>,
        projector: Arc<dyn Projector>,
        settings: StageSettings,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            stages,
            projector,
            settings: Arc::new(settings),
            policy,
        }
    }

    /// Walks brands, countries and products in input order. One product's
    /// failures never stop the next product.
    pub async fn process_submission(&self, submission: &Submission) -> Result<ResultTree, RunError> {
        if submission.brands.is_empty() {
            return Err(RunError::EmptySubmission);
        }

        let mut tree = ResultTree::default();
        for brand in &submission.brands {
            let mut brand_run = BrandRun {
                brand: brand.brand.trim().to_string(),
                countries: Vec::with_capacity(brand.countries.len()),
            };
            for country in &brand.countries {
                let mut country_run = CountryRun {
                    name: country.name,
                    products: Vec::with_capacity(country.products.len()),
                };
                for product in &country.products {
                    info!(
                        target = "research.pipeline",
                        brand = %brand_run.brand,
                        country = %country.name,
                        product = %product.productname,
                        "processing product"
                    );
                    let result = self.run_product(product).await;
                    country_run.products.push(ProductRun {
                        productname: product.productname.clone(),
                        url: product.url.clone(),
                        keyword: product.keyword.clone(),
                        category_url: product.category_url.clone(),
                        result,
                    });
                }
                brand_run.countries.push(country_run);
            }
            tree.runs.push(brand_run);
        }
        Ok(tree)
    }

    /// Produces exactly one [`RunResult`] for `product`, whatever fails.
    pub async fn run_product(&self, product: &Product) -> RunResult {
        let started = Instant::now();
        let mut result = RunResult::new(&product.category_url, &product.url, &product.keyword);
        self.prepare_export_dirs();

        match self.stages.open_session(&product.category_url).await {
            Ok(()) => self.run_stages(product, &mut result).await,
            Err(err) => {
                warn!(target = "research.pipeline", error = %err, "browser session launch failed");
                result.errors.push(format!("session launch failed: {err}"));
            }
        }

        self.cleanup().await;
        metrics::product_elapsed(started.elapsed().as_millis(), result.errors.len());
        result
    }

    async fn run_stages(&self, product: &Product, result: &mut RunResult) {
        let stages = &*self.stages;
        let settings = &*self.settings;
        let landing = product.category_url.as_str();

        let reconnect = || stages.reconnect(landing);
        let recovery = Recovery {
            applies: StageError::is_surface_missing,
            action: &reconnect,
        };

        // 1. category revenue
        let wait = settings.category_wait_after_click;
        result.category_revenue = timed(
            "category_revenue",
            retry_stage(
                "category_revenue",
                &self.policy,
                &mut result.errors,
                Some(&recovery),
                || stages.category_revenue(wait),
            ),
        )
        .await;

        // 2. monthly revenue on the product page
        if let Err(err) = stages.open_product(&product.url, settings.product_open_wait).await {
            warn!(target = "research.pipeline", error = %err, "product page did not open");
            result.errors.push(format!("open_product failed: {err}"));
        }
        let product_url = product.url.as_str();
        let open_wait = settings.product_open_wait;
        let reopen = || {
            Box::pin(async move {
                stages.reconnect(landing).await?;
                stages.open_product(product_url, open_wait).await
            }) as BoxFuture<'_, Result<(), StageError>>
        };
        let reopen_recovery = Recovery {
            applies: StageError::is_surface_missing,
            action: &reopen,
        };
        let monthly_dir = settings.monthly_revenue_dir.as_path();
        result.monthly_revenue.meta = timed(
            "monthly_revenue",
            retry_stage(
                "monthly_revenue",
                &self.policy,
                &mut result.errors,
                Some(&reopen_recovery),
                || async move {
                    let outcome = stages.monthly_revenue(monthly_dir).await;
                    clear_csv_exports(monthly_dir);
                    outcome
                },
            ),
        )
        .await;

        // 3. competitors
        let query = CompetitorQuery {
            download_dir: settings.competitors_dir.clone(),
            max_input_visible_index: settings.competitor_max_input_index,
            max_value: settings.competitor_max_value.clone(),
            title_keyword: product.keyword.clone(),
            wait_after_apply_ms: settings.competitor_wait_after_apply.as_millis() as u64,
            picker_within_years: settings.picker_within_years,
            try_read_updated_revenue: true,
        };
        let query = &query;
        let mut raw_result: Option<CompetitorFlow> = None;
        let picker_best = timed(
            "competitors_flow",
            retry_validated(
                "competitors_flow",
                &self.policy,
                &mut result.errors,
                Some(&recovery),
                || async move {
                    let outcome = stages.competitors(query).await;
                    clear_csv_exports(&query.download_dir);
                    outcome
                },
                |flow: CompetitorFlow| {
                    let pick = qualifying_pick(&flow);
                    raw_result = Some(flow);
                    pick
                },
            ),
        )
        .await;
        result.competitors_flow.raw_result = raw_result;
        result.competitors_flow.picker_best = picker_best;

        // 4. profitability, read off the competitor's page
        match result.competitors_flow.picker_best.as_ref().map(|pick| pick.url.clone()) {
            Some(competitor_url) => {
                let wait = settings.profitability_wait;
                let competitor_url = competitor_url.as_str();
                result.profitability_metrics = timed(
                    "profitability_metrics",
                    retry_stage(
                        "profitability_metrics",
                        &self.policy,
                        &mut result.errors,
                        Some(&recovery),
                        || stages.profitability(competitor_url, wait),
                    ),
                )
                .await;
            }
            None => {
                debug!(target = "research.pipeline", "no competitor url; skipping profitability");
            }
        }

        // 5. keyword volumes and projection
        let Some(asin) = extract_asin(&product.url) else {
            warn!(target = "research.pipeline", url = %product.url, "could not parse ASIN");
            result.errors.push(ASIN_MISSING_WARNING.to_string());
            return;
        };
        let export = KeywordExport {
            product_url: product.url.clone(),
            filename_hint: format!("cerebro_{asin}_{}.csv", product.keyword),
            asin,
            keyword: product.keyword.clone(),
            download_dir: settings.keywords_dir.clone(),
            timeout_ms: settings.keyword_tool_timeout.as_millis() as u64,
        };
        let export = &export;
        let volumes = timed(
            "cerebro",
            retry_stage(
                "cerebro",
                &self.policy,
                &mut result.errors,
                Some(&recovery),
                || async move {
                    let outcome = export_volumes(stages, export).await;
                    clear_csv_exports(&export.download_dir);
                    outcome
                },
            ),
        )
        .await;

        if let Some(volumes) = volumes {
            let response = self
                .projector
                .project(&volumes.user_prompt, &volumes.search_volumes)
                .await;
            result.keywords_volumes = Some(volumes);
            result.gpt_projection.response = Some(response);
        }
    }

    fn prepare_export_dirs(&self) {
        for dir in self.settings.export_dirs() {
            if let Err(err) = fs::create_dir_all(dir) {
                warn!(target = "research.pipeline", dir = %dir.display(), error = %err, "cannot create export dir");
            }
        }
    }

    async fn cleanup(&self) {
        if let Err(err) = self.stages.close_tabs().await {
            warn!(target = "research.pipeline", error = %err, "closing tabs failed");
        }
        if let Err(err) = self.stages.shutdown().await {
            warn!(target = "research.pipeline", error = %err, "browser shutdown failed");
        }
    }
}

pub fn extract_asin(product_url: &str) -> Option<String> {
    ASIN_PATTERN
        .captures(product_url)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

fn qualifying_pick(flow: &CompetitorFlow) -> Result<PickerBest, StageError> {
    flow.picker_best
        .as_ref()
        .filter(|pick| pick.is_qualifying())
        .cloned()
        .ok_or_else(|| StageError::Rejected(NO_QUALIFYING_PICK.into()))
}

async fn export_volumes(
    stages: &dyn ResearchStages,
    export: &KeywordExport,
) -> Result<KeywordVolumes, StageError> {
    let csv_path = stages.export_keywords(export).await?;
    debug!(target = "research.pipeline", path = %csv_path.display(), "keyword export saved");
    keyword_volumes_from_csv(&csv_path)
}

async fn timed<T, F>(stage: &'static str, fut: F) -> Option<T>
where
    F: Future<Output = Option<T>>,
{
    let started = Instant::now();
    let out = fut.await;
    metrics::stage_elapsed(stage, started.elapsed().as_millis(), out.is_some());
    out
}
