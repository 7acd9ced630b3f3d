//! Configuration validation
//!
//! Rules:
//! - product / application present and usable as directory names
//! - sink names present and unique, sink params known and complete
//! - queue lengths and failure limits > 0
//! - fragment limits > 0
//! - server destination well formed when given

use std::collections::HashSet;

use contracts::{AgentConfig, ContractError, SinkType};

/// Validate an AgentConfig
///
/// Returns the first error encountered, or Ok(()).
pub fn validate(config: &AgentConfig) -> Result<(), ContractError> {
    validate_session(config)?;
    validate_messenger(config)?;
    validate_sinks(config)?;
    validate_repository(config)?;
    validate_server(config)?;
    Ok(())
}

fn validate_session(config: &AgentConfig) -> Result<(), ContractError> {
    for (field, value) in [
        ("session.product", &config.session.product),
        ("session.application", &config.session.application),
    ] {
        if value.trim().is_empty() {
            return Err(ContractError::config_validation(field, "cannot be empty"));
        }
        if !is_path_segment(value) {
            return Err(ContractError::config_validation(
                field,
                format!("'{value}' cannot be used as a directory name"),
            ));
        }
    }
    Ok(())
}

/// No separators, no parent references
fn is_path_segment(value: &str) -> bool {
    value != "." && value != ".." && !value.contains(['/', '\\', '\0'])
}

fn validate_messenger(config: &AgentConfig) -> Result<(), ContractError> {
    if config.messenger.max_queue_length == 0 {
        return Err(ContractError::config_validation(
            "messenger.max_queue_length",
            "max_queue_length must be > 0",
        ));
    }
    if config.messenger.max_consecutive_failures == 0 {
        return Err(ContractError::config_validation(
            "messenger.max_consecutive_failures",
            "max_consecutive_failures must be > 0",
        ));
    }
    Ok(())
}

fn validate_sinks(config: &AgentConfig) -> Result<(), ContractError> {
    let mut seen = HashSet::new();
    for (idx, sink) in config.sinks.iter().enumerate() {
        if sink.name.is_empty() {
            return Err(ContractError::config_validation(
                format!("sinks[{idx}].name"),
                "sink name cannot be empty",
            ));
        }
        if !seen.insert(&sink.name) {
            return Err(ContractError::config_validation(
                format!("sinks[name={}]", sink.name),
                "duplicate sink name",
            ));
        }
        if sink.queue_capacity == Some(0) {
            return Err(ContractError::config_validation(
                format!("sinks[{}].queue_capacity", sink.name),
                "queue_capacity must be > 0",
            ));
        }

        let known = sink.sink_type.known_params();
        if let Some(unknown) = sink.params.keys().find(|k| !known.contains(&k.as_str())) {
            return Err(ContractError::config_validation(
                format!("sinks[{}].params.{unknown}", sink.name),
                format!("unknown parameter for {:?} sink", sink.sink_type),
            ));
        }
        for required in sink.sink_type.required_params() {
            if sink.params.get(*required).is_none_or(|v| v.is_empty()) {
                return Err(ContractError::config_validation(
                    format!("sinks[{}].params.{required}", sink.name),
                    "required parameter missing",
                ));
            }
        }

        match sink.sink_type {
            SinkType::Network => {
                let port = &sink.params["port"];
                if port.parse::<u16>().map_or(true, |p| p == 0) {
                    return Err(ContractError::config_validation(
                        format!("sinks[{}].params.port", sink.name),
                        format!("invalid port '{port}'"),
                    ));
                }
                if let Some(timeout) = sink.params.get("connect_timeout_ms") {
                    if timeout.parse::<u64>().is_err() {
                        return Err(ContractError::config_validation(
                            format!("sinks[{}].params.connect_timeout_ms", sink.name),
                            format!("invalid timeout '{timeout}'"),
                        ));
                    }
                }
            }
            SinkType::Export => {
                if let Some(format) = sink.params.get("format") {
                    if !matches!(format.as_str(), "text" | "json") {
                        return Err(ContractError::config_validation(
                            format!("sinks[{}].params.format", sink.name),
                            format!("format must be 'text' or 'json', got '{format}'"),
                        ));
                    }
                }
            }
            SinkType::File => {}
        }
    }
    Ok(())
}

fn validate_repository(config: &AgentConfig) -> Result<(), ContractError> {
    let repository = &config.repository;
    if repository.path.as_os_str().is_empty() {
        return Err(ContractError::config_validation(
            "repository.path",
            "path cannot be empty",
        ));
    }
    if repository.max_fragment_size_kb == 0 {
        return Err(ContractError::config_validation(
            "repository.max_fragment_size_kb",
            "max_fragment_size_kb must be > 0",
        ));
    }
    if repository.max_fragment_duration_secs == 0 {
        return Err(ContractError::config_validation(
            "repository.max_fragment_duration_secs",
            "max_fragment_duration_secs must be > 0",
        ));
    }
    Ok(())
}

fn validate_server(config: &AgentConfig) -> Result<(), ContractError> {
    let server = &config.server;
    if let Some(key) = &server.customer_key {
        if !key.is_empty() && !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(ContractError::config_validation(
                "server.customer_key",
                "customer key may only contain letters, digits, '-' and '_'",
            ));
        }
    }
    if server.host.is_some() && server.port == Some(0) {
        return Err(ContractError::config_validation(
            "server.port",
            "port must be > 0",
        ));
    }
    if server.chunk_size_kb == 0 {
        return Err(ContractError::config_validation(
            "server.chunk_size_kb",
            "chunk_size_kb must be > 0",
        ));
    }
    if server.timeout_secs == 0 {
        return Err(ContractError::config_validation(
            "server.timeout_secs",
            "timeout_secs must be > 0",
        ));
    }
    Ok(())
}
