//! `sessions` command implementation.

use std::path::Path;

use anyhow::{Context, Result};
use contracts::SessionSummary;
use packager::Packager;
use serde::Serialize;

use super::{load_config, open_repository};
use crate::cli::SessionsArgs;

#[derive(Serialize)]
struct SessionRow<'a> {
    session_id: String,
    product: &'a str,
    application: &'a str,
    version: &'a str,
    host: &'a str,
    started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    ended_at: Option<String>,
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    end_status: Option<String>,
    sent: bool,
    fragments: usize,
    bytes: u64,
}

impl<'a> From<&'a SessionSummary> for SessionRow<'a> {
    fn from(summary: &'a SessionSummary) -> Self {
        let identity = &summary.identity;
        Self {
            session_id: summary.session_id().to_string(),
            product: &identity.product,
            application: &identity.application,
            version: &identity.application_version,
            host: &identity.host_name,
            started_at: identity.started_at.to_rfc3339(),
            ended_at: summary.ended_at.map(|t| t.to_rfc3339()),
            status: format!("{:?}", summary.status),
            end_status: summary.end_status.map(|s| format!("{s:?}")),
            sent: summary.sent,
            fragments: summary.fragments.len(),
            bytes: summary.total_size(),
        }
    }
}

/// Execute the `sessions` command
pub async fn run_sessions(config_path: &Path, args: &SessionsArgs) -> Result<()> {
    let config = load_config(config_path)?;
    let repository = open_repository(&config)?;
    observability::record_repository(&repository.refresh()?);

    let packager = Packager::http(repository, config.server.clone())?;
    let sessions = packager
        .select(args.criteria)
        .await
        .with_context(|| format!("Failed to select sessions ({})", args.criteria))?;
    let rows: Vec<SessionRow> = sessions.iter().map(SessionRow::from).collect();

    if args.json {
        let json = serde_json::to_string_pretty(&rows).context("Failed to serialize sessions")?;
        println!("{}", json);
        return Ok(());
    }

    if rows.is_empty() {
        println!("No sessions.");
        return Ok(());
    }
    println!(
        "{:<36}  {:<24}  {:<25}  {:<8}  {:<4}  {:>5}  {:>10}",
        "SESSION", "APPLICATION", "STARTED", "STATUS", "SENT", "FRAGS", "BYTES"
    );
    for row in &rows {
        println!(
            "{:<36}  {:<24}  {:<25}  {:<8}  {:<4}  {:>5}  {:>10}",
            row.session_id,
            format!("{}/{}", row.product, row.application),
            row.started_at,
            row.status,
            if row.sent { "yes" } else { "no" },
            row.fragments,
            row.bytes
        );
    }
    Ok(())
}
