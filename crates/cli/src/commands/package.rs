//! `package` command implementation.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use packager::{Packager, PackagerError, SendOutcome, ServerSendOptions};
use tracing::{info, warn};

use super::{load_config, open_repository};
use crate::cli::PackageArgs;
use crate::error::CliError;

/// Execute the `package` command
pub async fn run_package(config_path: &Path, args: &PackageArgs) -> Result<()> {
    let config = load_config(config_path)?;
    let repository = open_repository(&config)?;

    let mut server = config.server.clone();
    if let Some(key) = &args.customer_key {
        server.customer_key = Some(key.clone());
    }
    let packager = Arc::new(Packager::http(repository, server)?);

    let outcome = match &args.file {
        Some(destination) => {
            info!(criteria = %args.criteria, destination = %destination.display(), "Packaging to file");
            packager
                .send_to_file(args.criteria, args.mark_read, destination)
                .await
                .with_context(|| format!("Failed to write package to {}", destination.display()))?
        }
        None => send_to_server(&packager, args).await?,
    };

    print_outcome(&outcome);
    Ok(())
}

/// Background send that Ctrl-C cancels
async fn send_to_server(packager: &Arc<Packager>, args: &PackageArgs) -> Result<SendOutcome> {
    let options = ServerSendOptions {
        mark_as_read: args.mark_read,
        purge_after_send: args.purge,
        server: None,
    };
    info!(criteria = %args.criteria, "Packaging to server");
    let handle = packager
        .send_to_server_async(args.criteria, options)
        .context("Invalid server configuration")?;

    let cancel = handle.cancel_token();
    let wait = handle.wait();
    tokio::pin!(wait);
    let result = tokio::select! {
        result = &mut wait => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, canceling delivery");
            cancel.cancel();
            wait.await
        }
    };

    match result {
        Ok(outcome) => Ok(outcome),
        Err(PackagerError::Canceled) => Err(CliError::Canceled.into()),
        Err(e) => Err(anyhow::Error::new(e).context("Package delivery failed")),
    }
}

fn print_outcome(outcome: &SendOutcome) {
    let Some(package_id) = outcome.package_id else {
        println!("Nothing to package.");
        return;
    };
    println!("Package {}", package_id);
    println!("   ├─ Sessions: {}", outcome.sessions.len());
    println!("   ├─ Bytes: {}", outcome.bytes);
    if let Some(destination) = &outcome.destination {
        println!("   └─ Destination: {}", destination.display());
    }
}
