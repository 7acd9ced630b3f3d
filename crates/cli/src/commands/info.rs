//! `info` command implementation.

use std::path::Path;

use anyhow::{Context, Result};
use contracts::AgentConfig;
use packager::Package;
use serde::Serialize;
use tracing::info;

use super::load_config;
use super::validate::describe_destination;
use crate::cli::InfoArgs;

/// Configuration info for JSON output
#[derive(Serialize)]
struct ConfigInfo {
    product: String,
    application: String,
    application_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    environment: Option<String>,
    max_queue_length: usize,
    force_synchronous: bool,
    sinks: Vec<SinkInfo>,
    repository: RepositoryInfo,
    server: String,
}

#[derive(Serialize)]
struct SinkInfo {
    name: String,
    sink_type: String,
    queue_capacity: usize,
}

#[derive(Serialize)]
struct RepositoryInfo {
    path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_age_days: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_size_mb: Option<u64>,
    max_fragment_size_kb: u64,
}

#[derive(Serialize)]
struct PackageInfo {
    package_id: String,
    created_at: String,
    compressed: bool,
    body_bytes: u64,
    sessions: Vec<PackageSessionInfo>,
}

#[derive(Serialize)]
struct PackageSessionInfo {
    session_id: String,
    product: String,
    application: String,
    status: String,
    fragments: usize,
    bytes: u64,
}

/// Execute the `info` command
pub fn run_info(config_path: &Path, args: &InfoArgs) -> Result<()> {
    if let Some(package) = &args.package {
        return package_info(package, args.json);
    }

    info!(config = %config_path.display(), "Loading configuration info");
    let config = load_config(config_path)?;
    let info = build_config_info(&config);

    if args.json {
        let json = serde_json::to_string_pretty(&info).context("Failed to serialize config info")?;
        println!("{}", json);
    } else {
        print_config_info(&info);
    }
    Ok(())
}

fn build_config_info(config: &AgentConfig) -> ConfigInfo {
    ConfigInfo {
        product: config.session.product.clone(),
        application: config.session.application.clone(),
        application_version: config.session.application_version.clone(),
        environment: config.session.environment.clone(),
        max_queue_length: config.messenger.max_queue_length,
        force_synchronous: config.messenger.force_synchronous,
        sinks: config
            .sinks
            .iter()
            .map(|s| SinkInfo {
                name: s.name.clone(),
                sink_type: format!("{:?}", s.sink_type),
                queue_capacity: config.queue_capacity(s),
            })
            .collect(),
        repository: RepositoryInfo {
            path: config.repository.path.display().to_string(),
            max_age_days: config.repository.max_age_days,
            max_size_mb: config.repository.max_size_mb,
            max_fragment_size_kb: config.repository.max_fragment_size_kb,
        },
        server: describe_destination(config),
    }
}

fn print_config_info(info: &ConfigInfo) {
    println!("Beacon configuration\n");

    println!("Session");
    println!("   ├─ Product: {}", info.product);
    println!("   ├─ Application: {} {}", info.application, info.application_version);
    println!(
        "   └─ Environment: {}",
        info.environment.as_deref().unwrap_or("(default)")
    );

    println!("\nMessenger");
    println!("   ├─ Max queue length: {}", info.max_queue_length);
    println!("   └─ Force synchronous: {}", info.force_synchronous);

    println!("\nSinks ({})", info.sinks.len());
    for (i, sink) in info.sinks.iter().enumerate() {
        let prefix = if i == info.sinks.len() - 1 { "└─" } else { "├─" };
        println!(
            "   {} {} ({}, queue {})",
            prefix, sink.name, sink.sink_type, sink.queue_capacity
        );
    }

    let repository = &info.repository;
    println!("\nRepository");
    println!("   ├─ Path: {}", repository.path);
    match repository.max_age_days {
        Some(days) => println!("   ├─ Max age: {} days", days),
        None => println!("   ├─ Max age: unlimited"),
    }
    match repository.max_size_mb {
        Some(mb) => println!("   ├─ Max size: {} MB", mb),
        None => println!("   ├─ Max size: unlimited"),
    }
    println!("   └─ Fragment size: {} KB", repository.max_fragment_size_kb);

    println!("\nServer: {}", info.server);
    println!();
}

fn package_info(path: &Path, json: bool) -> Result<()> {
    let package =
        Package::open(path).with_context(|| format!("Failed to open package {}", path.display()))?;
    let manifest = package.manifest();
    let info = PackageInfo {
        package_id: manifest.package_id.to_string(),
        created_at: manifest.created_at.to_rfc3339(),
        compressed: package.is_compressed(),
        body_bytes: manifest.body_len,
        sessions: manifest
            .sessions
            .iter()
            .map(|s| PackageSessionInfo {
                session_id: s.session_id().to_string(),
                product: s.identity.product.clone(),
                application: s.identity.application.clone(),
                status: format!("{:?}", s.status),
                fragments: s.fragments.len(),
                bytes: s.fragments.iter().map(|f| f.len).sum(),
            })
            .collect(),
    };

    if json {
        let json = serde_json::to_string_pretty(&info).context("Failed to serialize package info")?;
        println!("{}", json);
        return Ok(());
    }

    println!("Package {}", info.package_id);
    println!("   ├─ Created: {}", info.created_at);
    println!("   ├─ Compressed: {}", info.compressed);
    println!("   └─ Body: {} bytes", info.body_bytes);
    println!("\nSessions ({})", info.sessions.len());
    for session in &info.sessions {
        println!(
            "   {} {}/{} {} ({} fragments, {} bytes)",
            session.session_id,
            session.product,
            session.application,
            session.status,
            session.fragments,
            session.bytes
        );
    }
    Ok(())
}
