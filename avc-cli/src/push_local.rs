//! Local plan sink
//!
//! Materializes an operation plan into a directory, standing in for the
//! external uploader. Blob operations run on a bounded pool of blocking
//! workers; direct operations (the metadata store) run afterwards so the
//! destination never references a blob that is not there yet.

use anyhow::{Context, Result};
use avc_core::{check_unique_destinations, VirtualAddOperation};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Default number of concurrent workers
pub const DEFAULT_JOBS: usize = 8;

/// Statistics from one push
#[derive(Debug, Clone, Default)]
pub struct PushStats {
    pub operations: u64,
    pub bytes: u64,
    pub duration_ms: u64,
}

impl PushStats {
    pub fn summary(&self) -> String {
        format!(
            "Pushed {} objects, {} in {}ms",
            self.operations,
            format_size(self.bytes),
            self.duration_ms
        )
    }
}

fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

async fn run_bounded(ops: Vec<VirtualAddOperation>, dest: &Path, jobs: usize) -> Result<u64> {
    let sem = Arc::new(Semaphore::new(jobs.max(1)));
    let mut set = JoinSet::new();
    for op in ops {
        let permit = sem.clone().acquire_owned().await?;
        let dest = dest.to_path_buf();
        set.spawn_blocking(move || {
            let _permit = permit;
            debug!("Materializing {}", op.repo_path());
            op.materialize(&dest)
                .with_context(|| format!("Failed to materialize {}", op.repo_path()))
        });
    }

    // Blocking tasks cannot be aborted, so wait for all of them before
    // reporting the first failure.
    let mut bytes = 0;
    let mut first_err = None;
    while let Some(joined) = set.join_next().await {
        match joined.map_err(anyhow::Error::from).and_then(|r| r) {
            Ok(n) => bytes += n,
            Err(e) => {
                warn!("{:#}", e);
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(bytes),
    }
}

/// Materialize every operation of `ops` below `dest`
pub async fn push_plan(ops: Vec<VirtualAddOperation>, dest: PathBuf, jobs: usize) -> Result<PushStats> {
    check_unique_destinations(&ops)?;
    let start = Instant::now();
    let operations = ops.len() as u64;

    let (direct, blobs): (Vec<_>, Vec<_>) = ops
        .into_iter()
        .partition(|op| matches!(op, VirtualAddOperation::Direct { .. }));
    info!("Pushing {} blobs to {}", blobs.len(), dest.display());
    let mut bytes = run_bounded(blobs, &dest, jobs).await?;
    bytes += run_bounded(direct, &dest, 1).await?;

    Ok(PushStats {
        operations,
        bytes,
        duration_ms: start.elapsed().as_millis() as u64,
    })
}
