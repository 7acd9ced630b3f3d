//! `prune` command implementation.

use std::path::Path;

use anyhow::{Context, Result};
use repository::PrunePolicy;
use serde_json::json;
use tracing::info;

use super::{load_config, open_repository};
use crate::cli::PruneArgs;

/// Execute the `prune` command
pub fn run_prune(config_path: &Path, args: &PruneArgs) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(days) = args.max_age_days {
        config.repository.max_age_days = Some(days);
    }
    if let Some(mb) = args.max_size_mb {
        config.repository.max_size_mb = Some(mb);
    }

    let repository = open_repository(&config)?;
    let policy = PrunePolicy::from_config(&config.repository);
    info!(?policy, root = %repository.root().display(), "Pruning repository");

    let report = repository.prune(&policy).context("Prune failed")?;
    observability::record_repository(&repository.refresh()?);

    if args.json {
        let value = json!({
            "removed": report.removed,
            "bytes_freed": report.bytes_freed,
            "remaining_bytes": report.remaining_bytes,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!(
        "Removed {} session(s), freed {} bytes, {} bytes remain.",
        report.removed.len(),
        report.bytes_freed,
        report.remaining_bytes
    );
    for session_id in &report.removed {
        println!("   - {}", session_id);
    }
    Ok(())
}
