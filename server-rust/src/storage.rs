use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;

use crate::error::Result;
use crate::state::AppState;

pub const WORKERS_FILE: &str = "workers.json";
pub const REVENUE_FILE: &str = "revenue.json";

/// Write `value` as pretty JSON, replacing `path` only once the new content
/// is fully on disk.
pub async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    let json = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// `Ok(None)` when the file does not exist yet
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match tokio::fs::read(path).await {
        Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Snapshot the worker registry. Revenue is persisted by the allocator as
/// part of each mutation.
pub async fn save_state(state: &AppState) -> Result<()> {
    let dir = Path::new(&state.config.data_dir);
    let mut workers = state.registry.snapshot().await;
    workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
    write_json(&dir.join(WORKERS_FILE), &workers).await
}

/// Load both snapshots. The revenue book holds the distribution history, so
/// failing to read it is an error; an unreadable worker snapshot only costs
/// re-registration and is skipped with a warning.
pub async fn load_state(state: &AppState) -> Result<()> {
    let dir = Path::new(&state.config.data_dir);

    if let Some(book) = read_json(&dir.join(REVENUE_FILE)).await? {
        state.revenue.restore(book).await;
    }
    match read_json(&dir.join(WORKERS_FILE)).await {
        Ok(Some(workers)) => state.registry.restore(workers).await,
        Ok(None) => {}
        Err(e) => tracing::warn!(error = %e, "Ignoring unreadable worker snapshot"),
    }

    tracing::info!(workers = state.registry.count().await, "Loaded persisted state");
    Ok(())
}
