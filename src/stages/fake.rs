//! Scripted stand-ins for the automation worker and the estimator.

use super::{CompetitorQuery, KeywordExport, ResearchStages, StageError};
use crate::models::{
    CompetitorFlow, MoneyText, MonthlyRevenueMeta, PickerBest, ProfitabilityMetrics,
    ProjectionResponse, ProjectionTotals,
};
use crate::projection::Projector;
use async_trait::async_trait;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        Mutex,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

#[derive(Default)]
pub struct FakeStages {
    pub fail_launch: bool,
    pub fail_open_product: bool,
    /// Competitor picks come back without a URL.
    pub incomplete_competitor: bool,
    /// Number of leading category calls that report a missing overlay.
    pub category_surface_misses: AtomicU32,
    /// Panics inside the category stage.
    pub panic_on_category: bool,
    pub calls: Mutex<Vec<String>>,
}

impl FakeStages {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn count(&self, name: &str) -> usize {
        self.calls().iter().filter(|c| *c == name).count()
    }

    fn record(&self, name: &str) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(name.to_string());
        }
    }
}

pub fn money(text: &str, number: &str) -> MoneyText {
    MoneyText {
        text: Some(text.to_string()),
        number: Some(number.to_string()),
    }
}

#[async_trait]
impl ResearchStages for FakeStages {
    async fn open_session(&self, _landing_url: &str) -> Result<(), StageError> {
        self.record("open_session");
        if self.fail_launch {
            return Err(StageError::Transport("connection refused".into()));
        }
        Ok(())
    }

    async fn reconnect(&self, _landing_url: &str) -> Result<(), StageError> {
        self.record("reconnect");
        Ok(())
    }

    async fn category_revenue(&self, _wait: Duration) -> Result<MoneyText, StageError> {
        self.record("category_revenue");
        if self.panic_on_category {
            panic!("extension crashed");
        }
        let misses = self.category_surface_misses.load(Ordering::SeqCst);
        if misses > 0 {
            self.category_surface_misses.store(misses - 1, Ordering::SeqCst);
            return Err(StageError::SurfaceNotDetected("overlay missing".into()));
        }
        Ok(money("$1,234,567", "1234567"))
    }

    async fn open_product(&self, _product_url: &str, _wait: Duration) -> Result<(), StageError> {
        self.record("open_product");
        if self.fail_open_product {
            return Err(StageError::Failed("tab crashed".into()));
        }
        Ok(())
    }

    async fn monthly_revenue(&self, download_dir: &Path) -> Result<MonthlyRevenueMeta, StageError> {
        self.record("monthly_revenue");
        fs::create_dir_all(download_dir)?;
        let saved = download_dir.join("monthly.csv");
        fs::write(&saved, "month,revenue\n")?;
        Ok(MonthlyRevenueMeta {
            asin: Some("B0012SNLJG".into()),
            parent_level_revenue: Some(45_000.0),
            parent_level_revenue_text: Some("$45,000".into()),
            saved_csv: saved.display().to_string(),
            ..Default::default()
        })
    }

    async fn competitors(&self, _query: &CompetitorQuery) -> Result<CompetitorFlow, StageError> {
        self.record("competitors");
        let url = if self.incomplete_competitor {
            String::new()
        } else {
            "https://www.amazon.com/dp/B0COMPET01".to_string()
        };
        Ok(CompetitorFlow {
            downloaded_path: Some("competitors.csv".into()),
            picker_best: Some(PickerBest {
                url,
                product_details: "Competing football".into(),
                parent_level_revenue: "$9,800".into(),
                creation_date: "2024-05-01".into(),
                ..Default::default()
            }),
            updated_total_revenue_text: Some("$120,000".into()),
            updated_total_revenue_number: Some("120000".into()),
            ..Default::default()
        })
    }

    async fn profitability(
        &self,
        _product_url: &str,
        _wait: Duration,
    ) -> Result<ProfitabilityMetrics, StageError> {
        self.record("profitability");
        Ok(ProfitabilityMetrics {
            fba_fees: money("$5.10", "5.10"),
            storage_fee_jan_sep: money("$0.12", "0.12"),
            storage_fee_oct_dec: money("$0.40", "0.40"),
            product_price: money("$24.99", "24.99"),
        })
    }

    async fn export_keywords(&self, request: &KeywordExport) -> Result<PathBuf, StageError> {
        self.record("export_keywords");
        fs::create_dir_all(&request.download_dir)?;
        let path = request.download_dir.join(&request.filename_hint);
        fs::write(
            &path,
            "Keyword Phrase,Search Volume\nfootball,5000\nnfl football,1200\n",
        )?;
        Ok(path)
    }

    async fn close_tabs(&self) -> Result<(), StageError> {
        self.record("close_tabs");
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), StageError> {
        self.record("shutdown");
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeProjector {
    pub calls: AtomicU32,
}

#[async_trait]
impl Projector for FakeProjector {
    async fn project(&self, _user_prompt: &str, search_volumes: &[u64]) -> ProjectionResponse {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let sales = search_volumes.iter().sum::<u64>() / 100;
        ProjectionResponse::Totals(ProjectionTotals {
            base_total_sales: sales,
            base_total_revenue: sales as f64 * 20.0,
            base_total_profit_start_ads: sales as f64 * 4.0,
            base_total_profit_end_ads: sales as f64 * 6.0,
            low_total_sales: sales / 2,
            low_total_revenue: sales as f64 * 10.0,
            low_total_profit: sales as f64 * 2.0,
            high_total_sales: sales * 2,
            high_total_revenue: sales as f64 * 40.0,
            high_total_profit: sales as f64 * 8.0,
        })
    }
}
