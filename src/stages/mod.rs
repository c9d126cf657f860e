//! Boundary to the browser-automation layer.
//!
//! The orchestrator only sees [`ResearchStages`]: one method per extraction
//! stage plus session lifecycle calls. How a stage reads the extension UI is
//! the implementation's business.

pub mod remote;

#[cfg(test)]
pub mod fake;

use crate::models::{CompetitorFlow, MoneyText, MonthlyRevenueMeta, ProfitabilityMetrics};
use async_trait::async_trait;
use serde::Serialize;
use std::{
    fs,
    future::Future,
    path::{Path, PathBuf},
    pin::Pin,
    time::Duration,
};
use thiserror::Error;
use tracing::debug;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Error)]
pub enum StageError {
    /// The extension overlay never showed up on any tab. A fresh browser
    /// session usually fixes it.
    #[error("xray not detected: {0}")]
    SurfaceNotDetected(String),
    /// The stage answered, but the answer is not usable.
    #[error("{0}")]
    Rejected(String),
    #[error("{0}")]
    Failed(String),
    #[error("automation transport error: {0}")]
    Transport(String),
    #[error("invalid stage response: {0}")]
    InvalidResponse(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

impl StageError {
    pub fn is_surface_missing(&self) -> bool {
        matches!(self, StageError::SurfaceNotDetected(_))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CompetitorQuery {
    pub download_dir: PathBuf,
    pub max_input_visible_index: u32,
    pub max_value: String,
    pub title_keyword: String,
    pub wait_after_apply_ms: u64,
    pub picker_within_years: u32,
    pub try_read_updated_revenue: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct KeywordExport {
    pub product_url: String,
    pub asin: String,
    pub keyword: String,
    pub download_dir: PathBuf,
    pub filename_hint: String,
    pub timeout_ms: u64,
}

/// One live browser session with the research extension loaded.
#[async_trait]
pub trait ResearchStages: Send + Sync {
    /// Boots the browser and lands on `landing_url` with the overlay running.
    async fn open_session(&self, landing_url: &str) -> Result<(), StageError>;

    /// Tears the session down and boots a new one on `landing_url`.
    async fn reconnect(&self, landing_url: &str) -> Result<(), StageError>;

    async fn category_revenue(&self, wait_after_click: Duration) -> Result<MoneyText, StageError>;

    async fn open_product(&self, product_url: &str, wait: Duration) -> Result<(), StageError>;

    async fn monthly_revenue(&self, download_dir: &Path) -> Result<MonthlyRevenueMeta, StageError>;

    async fn competitors(&self, query: &CompetitorQuery) -> Result<CompetitorFlow, StageError>;

    async fn profitability(
        &self,
        product_url: &str,
        wait: Duration,
    ) -> Result<ProfitabilityMetrics, StageError>;

    /// Runs the keyword tool for `asin` and returns the exported CSV path.
    async fn export_keywords(&self, request: &KeywordExport) -> Result<PathBuf, StageError>;

    async fn close_tabs(&self) -> Result<(), StageError>;

    async fn shutdown(&self) -> Result<(), StageError>;
}

/// Deletes exported CSVs left in `dir`. Best effort.
pub fn clear_csv_exports(dir: &Path) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let is_csv = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
        if is_csv && fs::remove_file(&path).is_ok() {
            debug!(target = "research.stages", path = %path.display(), "removed export");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_missing_surface_is_recoverable() {
        assert!(StageError::SurfaceNotDetected("no tab".into()).is_surface_missing());
        assert!(!StageError::Failed("timeout".into()).is_surface_missing());
        assert!(
            StageError::SurfaceNotDetected("no tab".into())
                .to_string()
                .to_lowercase()
                .contains("xray not detected")
        );
    }

    #[test]
    fn clear_csv_exports_keeps_other_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.csv"), "x").unwrap();
        fs::write(dir.path().join("b.CSV"), "x").unwrap();
        fs::write(dir.path().join("notes.txt"), "x").unwrap();
        clear_csv_exports(dir.path());
        let left = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        assert_eq!(left, vec!["notes.txt".to_string()]);
        clear_csv_exports(&dir.path().join("missing"));
    }
}
