use crate::models::ResultTree;
use crate::queue::write_json_atomic;
use std::path::PathBuf;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
#[error("snapshot write to {path} failed: {source}")]
pub struct SnapshotError {
    path: PathBuf,
    #[source]
    source: std::io::Error,
}

/// Where the latest result tree ends up. Each save replaces the previous one.
pub trait SnapshotStore: Send + Sync {
    fn save(&self, tree: &ResultTree) -> Result<(), SnapshotError>;
}

#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn save(&self, tree: &ResultTree) -> Result<(), SnapshotError> {
        write_json_atomic(&self.path, tree).map_err(|source| SnapshotError {
            path: self.path.clone(),
            source,
        })?;
        info!(target = "research.snapshot", path = %self.path.display(), "saved full results");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BrandRun, CountryCode, CountryRun};
    use std::fs;

    fn tree(brand: &str) -> ResultTree {
        ResultTree {
            runs: vec![BrandRun {
                brand: brand.into(),
                countries: vec![CountryRun {
                    name: CountryCode::Us,
                    products: vec![],
                }],
            }],
        }
    }

    #[test]
    fn save_overwrites_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("full_runs.json");
        let store = FileSnapshotStore::new(&path);
        store.save(&tree("first")).unwrap();
        store.save(&tree("second")).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        let parsed: ResultTree = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed, tree("second"));
        assert!(raw.contains('\n'), "snapshot is pretty printed");
    }

    #[test]
    fn unwritable_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, "x").unwrap();
        let store = FileSnapshotStore::new(blocker.join("full_runs.json"));
        let err = store.save(&tree("x")).unwrap_err();
        assert!(err.to_string().contains("full_runs.json"));
    }
}
