use std::env;
use std::error::Error;

use issue_relay_core::config::Settings;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod cmdline;
mod setup_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    setup_tracing::register();

    if let Err(e) = run().await {
        error!("{e}");
        return Err(e);
    }
    info!("Exiting...");

    Ok(())
}

async fn run() -> Result<(), Box<dyn Error>> {
    let matches = cmdline::root_cli().get_matches();
    let (name, sub_matches) = matches
        .subcommand()
        .ok_or("a subcommand is required")?;
    let mode = cmdline::mode(name).ok_or_else(|| format!("unknown subcommand {name}"))?;

    let mut settings = Settings::load(env::vars())?;
    cmdline::apply_overrides(sub_matches, &mut settings)?;
    info!(?mode, ?settings, "Starting issue-relay");

    let cancel = CancellationToken::new();
    let shutdown_cancel = cancel.clone();
    let shutdown_handle = tokio::spawn(async move {
        issue_relay_core::shutdown_signal().await;
        shutdown_cancel.cancel();
    });

    let result = issue_relay_core::run(settings, mode, cancel).await;

    // the loops are done, nothing left for the signal handler to stop
    if !shutdown_handle.is_finished() {
        shutdown_handle.abort();
    }
    result.map_err(Into::into)
}
