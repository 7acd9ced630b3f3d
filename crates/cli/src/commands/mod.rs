//! Command implementations.

mod info;
mod package;
mod prune;
mod record;
mod sessions;
mod validate;

pub use info::run_info;
pub use package::run_package;
pub use prune::run_prune;
pub use record::run_record;
pub use sessions::run_sessions;
pub use validate::run_validate;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use contracts::AgentConfig;
use repository::{FragmentLedger, Repository};

use crate::error::CliError;

/// Load and validate the configuration file
pub(crate) fn load_config(path: &Path) -> Result<AgentConfig> {
    if !path.exists() {
        return Err(CliError::config_not_found(path).into());
    }
    config_loader::ConfigLoader::load_from_path(path)
        .with_context(|| format!("Failed to load config from {}", path.display()))
}

/// Open the configured repository for reading and maintenance
pub(crate) fn open_repository(config: &AgentConfig) -> Result<Arc<Repository>> {
    let repository = Repository::from_config(&config.repository, Arc::new(FragmentLedger::new()))
        .with_context(|| {
            format!(
                "Failed to open repository at {}",
                config.repository.path.display()
            )
        })?;
    Ok(Arc::new(repository))
}
