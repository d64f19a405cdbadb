//! Registry persistence: one `runs.json` per state directory.

use crate::model::RunRecord;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub const REGISTRY_FILE: &str = "runs.json";

/// `<data dir>/simwatch`, falling back to the working directory.
pub fn default_state_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("simwatch")
}

/// Write all records to `<dir>/runs.json`, replacing the previous file
/// atomically.
pub fn save_registry(dir: &Path, records: &[RunRecord]) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let path = dir.join(REGISTRY_FILE);
    let tmp = dir.join(format!("{REGISTRY_FILE}.tmp"));

    let data = serde_json::to_vec_pretty(records).context("failed to serialize run registry")?;
    fs::write(&tmp, data).with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, &path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(path)
}

/// Read `<dir>/runs.json`. A missing file is an empty registry.
pub fn load_registry(dir: &Path) -> Result<Vec<RunRecord>> {
    let path = dir.join(REGISTRY_FILE);
    let data = match fs::read(&path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read {}", path.display()));
        }
    };
    serde_json::from_slice(&data).with_context(|| format!("failed to parse {}", path.display()))
}
