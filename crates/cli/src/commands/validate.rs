//! `validate` command implementation.

use std::path::Path;

use anyhow::{Context, Result};
use contracts::{AgentConfig, SinkType};
use serde::Serialize;
use tracing::info;

use crate::cli::ValidateArgs;

/// Validation result for JSON output
#[derive(Serialize)]
struct ValidationResult {
    valid: bool,
    config_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<ConfigSummary>,
}

#[derive(Serialize)]
struct ConfigSummary {
    product: String,
    application: String,
    sink_count: usize,
    repository: String,
    destination: String,
}

/// Execute the `validate` command
pub fn run_validate(config_path: &Path, args: &ValidateArgs) -> Result<()> {
    info!(config = %config_path.display(), "Validating configuration");

    let result = validate_config(config_path);

    if args.json {
        let json = serde_json::to_string_pretty(&result)
            .context("Failed to serialize validation result")?;
        println!("{}", json);
    } else {
        print_validation_result(&result);
    }

    if result.valid {
        Ok(())
    } else {
        anyhow::bail!("Configuration validation failed")
    }
}

fn validate_config(path: &Path) -> ValidationResult {
    let config_path = path.display().to_string();

    if !path.exists() {
        return ValidationResult {
            valid: false,
            config_path,
            error: Some(format!("File not found: {}", path.display())),
            warnings: Vec::new(),
            summary: None,
        };
    }

    match config_loader::ConfigLoader::load_from_path(path) {
        Ok(config) => ValidationResult {
            valid: true,
            config_path,
            error: None,
            warnings: collect_warnings(&config),
            summary: Some(ConfigSummary {
                product: config.session.product.clone(),
                application: config.session.application.clone(),
                sink_count: config.sinks.len(),
                repository: config.repository.path.display().to_string(),
                destination: describe_destination(&config),
            }),
        },
        Err(e) => ValidationResult {
            valid: false,
            config_path,
            error: Some(e.to_string()),
            warnings: Vec::new(),
            summary: None,
        },
    }
}

pub(crate) fn describe_destination(config: &AgentConfig) -> String {
    match packager::Endpoint::from_config(&config.server) {
        Ok(endpoint) => endpoint.base().to_string(),
        Err(_) => "(none)".to_string(),
    }
}

/// Non-fatal issues
fn collect_warnings(config: &AgentConfig) -> Vec<String> {
    let mut warnings = Vec::new();

    if !config.sinks.iter().any(|s| s.sink_type == SinkType::File) {
        warnings.push("No file sink configured - sessions will not be kept for packaging".to_string());
    }
    if !config.server.is_configured() {
        warnings.push("No server configured - `package --server` is unavailable".to_string());
    }
    if config.repository.max_age_days.is_none() && config.repository.max_size_mb.is_none() {
        warnings.push("No prune limits set - the repository grows without bound".to_string());
    }
    if config.messenger.force_synchronous {
        warnings.push("messenger.force_synchronous is on - full queues slow down producers".to_string());
    }

    warnings
}

fn print_validation_result(result: &ValidationResult) {
    if result.valid {
        println!("✓ Configuration is valid: {}", result.config_path);

        if let Some(ref summary) = result.summary {
            println!("\n  Product: {}", summary.product);
            println!("  Application: {}", summary.application);
            println!("  Sinks: {}", summary.sink_count);
            println!("  Repository: {}", summary.repository);
            println!("  Server: {}", summary.destination);
        }

        if !result.warnings.is_empty() {
            println!("\n⚠ Warnings:");
            for warning in &result.warnings {
                println!("  - {}", warning);
            }
        }
    } else {
        println!("✗ Configuration is invalid: {}", result.config_path);
        if let Some(ref error) = result.error {
            println!("\n  Error: {}", error);
        }
    }
}
