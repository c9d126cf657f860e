use super::{CompetitorQuery, KeywordExport, ResearchStages, StageError};
use crate::http::build_client;
use crate::models::{CompetitorFlow, MoneyText, MonthlyRevenueMeta, ProfitabilityMetrics};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::json;
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::debug;

/// Error code the automation worker uses when the overlay is missing.
const SURFACE_NOT_DETECTED: &str = "surface_not_detected";

/// Stages executed by a browser-automation worker reachable over HTTP.
///
/// Every call is `POST {base_url}/{path}` with a JSON body. Failures come
/// back as non-2xx responses carrying `{ "error": code, "detail": text }`.
#[derive(Debug, Clone)]
pub struct RemoteStages {
    base_url: String,
    api_key: Option<String>,
    http: Client,
}

#[derive(Debug, Deserialize)]
struct WorkerError {
    error: String,
    #[serde(default)]
    detail: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExportedFile {
    path: PathBuf,
}

impl RemoteStages {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            http: build_client(),
        }
    }

    pub fn from_env() -> Self {
        let base_url = std::env::var("AUTOMATION_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:9700".to_string());
        Self::new(base_url, std::env::var("AUTOMATION_API_KEY").ok())
    }

    async fn call<B, T>(&self, path: &str, body: &B) -> Result<T, StageError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}/{}", self.base_url, path);
        debug!(target = "research.stages", %url, "stage call");
        let mut request = self.http.post(&url).json(body);
        if let Some(key) = &self.api_key {
            request = request.header("X-API-Key", key);
        }
        let response = request
            .send()
            .await
            .map_err(|err| StageError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(worker_error(status, &body));
        }
        response
            .json::<T>()
            .await
            .map_err(|err| StageError::InvalidResponse(err.to_string()))
    }

    async fn call_unit<B>(&self, path: &str, body: &B) -> Result<(), StageError>
    where
        B: Serialize + ?Sized,
    {
        let _: serde_json::Value = self.call(path, body).await?;
        Ok(())
    }
}

fn worker_error(status: StatusCode, body: &str) -> StageError {
    match serde_json::from_str::<WorkerError>(body) {
        Ok(err) => {
            let detail = err.detail.unwrap_or_else(|| err.error.clone());
            if err.error == SURFACE_NOT_DETECTED {
                StageError::SurfaceNotDetected(detail)
            } else {
                StageError::Failed(detail)
            }
        }
        Err(_) => StageError::Transport(format!("HTTP {status}")),
    }
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis().min(u64::MAX as u128) as u64
}

#[async_trait]
impl ResearchStages for RemoteStages {
    async fn open_session(&self, landing_url: &str) -> Result<(), StageError> {
        self.call_unit("session/open", &json!({ "landing_url": landing_url }))
            .await
    }

    async fn reconnect(&self, landing_url: &str) -> Result<(), StageError> {
        self.call_unit("session/reconnect", &json!({ "landing_url": landing_url }))
            .await
    }

    async fn category_revenue(&self, wait_after_click: Duration) -> Result<MoneyText, StageError> {
        self.call(
            "stages/category_revenue",
            &json!({ "wait_after_click_ms": millis(wait_after_click) }),
        )
        .await
    }

    async fn open_product(&self, product_url: &str, wait: Duration) -> Result<(), StageError> {
        self.call_unit(
            "stages/open_product",
            &json!({ "target_url": product_url, "wait_ms": millis(wait) }),
        )
        .await
    }

    async fn monthly_revenue(&self, download_dir: &Path) -> Result<MonthlyRevenueMeta, StageError> {
        self.call(
            "stages/monthly_revenue",
            &json!({ "download_dir": download_dir }),
        )
        .await
    }

    async fn competitors(&self, query: &CompetitorQuery) -> Result<CompetitorFlow, StageError> {
        self.call("stages/competitors", query).await
    }

    async fn profitability(
        &self,
        product_url: &str,
        wait: Duration,
    ) -> Result<ProfitabilityMetrics, StageError> {
        self.call(
            "stages/profitability",
            &json!({
                "product_url": product_url,
                "wait_ms": millis(wait),
                "close_others_after_open": true,
            }),
        )
        .await
    }

    async fn export_keywords(&self, request: &KeywordExport) -> Result<PathBuf, StageError> {
        let exported: ExportedFile = self.call("stages/keywords_export", request).await?;
        Ok(exported.path)
    }

    async fn close_tabs(&self) -> Result<(), StageError> {
        self.call_unit("session/close_tabs", &json!({})).await
    }

    async fn shutdown(&self) -> Result<(), StageError> {
        self.call_unit("session/shutdown", &json!({})).await
    }
}
