use std::{env, path::PathBuf, time::Duration};

/// Runtime settings for the orchestrator, read once at startup.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub queue: QueuePaths,
    pub lock_timeout: Duration,
    pub lock_retry_interval: Duration,
    pub snapshot_path: PathBuf,
    pub max_stage_attempts: u32,
    pub stages: StageSettings,
}

#[derive(Debug, Clone)]
pub struct QueuePaths {
    pub queue_file: PathBuf,
    pub failed_file: PathBuf,
    pub lock_file: PathBuf,
}

impl QueuePaths {
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            queue_file: dir.join("queue.json"),
            failed_file: dir.join("failed_queue.json"),
            lock_file: dir.join("queue.lock"),
        }
    }
}

/// Parameters handed to the extraction stages.
#[derive(Debug, Clone)]
pub struct StageSettings {
    pub category_wait_after_click: Duration,
    pub product_open_wait: Duration,
    pub competitor_max_input_index: u32,
    pub competitor_max_value: String,
    pub competitor_wait_after_apply: Duration,
    pub picker_within_years: u32,
    pub profitability_wait: Duration,
    pub keyword_tool_timeout: Duration,
    pub competitors_dir: PathBuf,
    pub monthly_revenue_dir: PathBuf,
    pub keywords_dir: PathBuf,
}

impl StageSettings {
    pub fn with_export_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            category_wait_after_click: Duration::from_secs(60),
            product_open_wait: Duration::from_secs(50),
            competitor_max_input_index: 7,
            competitor_max_value: "1000".into(),
            competitor_wait_after_apply: Duration::from_millis(8000),
            picker_within_years: 2,
            profitability_wait: Duration::from_secs(60),
            keyword_tool_timeout: Duration::from_secs(60),
            monthly_revenue_dir: root.join("monthlyrev"),
            keywords_dir: root.join("cerebro"),
            competitors_dir: root,
        }
    }

    pub fn export_dirs(&self) -> [&PathBuf; 3] {
        [
            &self.competitors_dir,
            &self.monthly_revenue_dir,
            &self.keywords_dir,
        ]
    }
}

impl RunnerConfig {
    pub fn from_env() -> Self {
        let data_dir = env::var("RUNNER_DATA_DIR").unwrap_or_else(|_| ".".into());
        let mut queue = QueuePaths::in_dir(&data_dir);
        if let Ok(path) = env::var("QUEUE_FILE") {
            queue.queue_file = path.into();
        }
        if let Ok(path) = env::var("FAILED_QUEUE_FILE") {
            queue.failed_file = path.into();
        }
        if let Ok(path) = env::var("QUEUE_LOCK_FILE") {
            queue.lock_file = path.into();
        }

        let export_root = env::var("EXPORT_DIR").unwrap_or_else(|_| "exports".into());
        let mut stages = StageSettings::with_export_root(export_root);
        stages.category_wait_after_click =
            Duration::from_millis(u64_from_env("CATEGORY_WAIT_AFTER_CLICK_MS", 60_000));
        stages.competitor_max_value =
            env::var("COMPETITOR_MAX_VALUE").unwrap_or_else(|_| "1000".into());
        stages.picker_within_years = u32_from_env("PICKER_WITHIN_YEARS", 2);

        Self {
            queue,
            lock_timeout: Duration::from_secs(u64_from_env("LOCK_TIMEOUT_SECS", 15)),
            lock_retry_interval: Duration::from_millis(u64_from_env("LOCK_RETRY_MS", 100)),
            snapshot_path: PathBuf::from(&data_dir).join(
                env::var("SNAPSHOT_FILE").unwrap_or_else(|_| "full_runs.json".into()),
            ),
            max_stage_attempts: u32_from_env("MAX_STAGE_ATTEMPTS", 8),
            stages,
        }
    }
}

fn u64_from_env(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

fn u32_from_env(key: &str, default: u32) -> u32 {
    narrow_or(u64_from_env(key, u64::from(default)), default)
}

/// Out-of-range values fall back to `default` instead of wrapping.
fn narrow_or(value: u64, default: u32) -> u32 {
    u32::try_from(value).unwrap_or(default)
}
