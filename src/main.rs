use anyhow::Context;
use clap::Parser;
use megaphone::application::App;
use std::path::PathBuf;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const DEFAULT_CONFIG_DIR: &str = "/etc/megaphone";

/// SIP gateway feeding a single-slot call queue
#[derive(Parser, Debug)]
#[command(name = "megaphone", version, about)]
struct Cli {
    /// Configuration directory path
    #[arg(long, default_value = DEFAULT_CONFIG_DIR)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let started = Instant::now();

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            wait_for_signal().await;
            cancel.cancel();
        }
    });

    let mut app = App::setup(&cli.config, cancel.clone())
        .await
        .context("error during setup")?;
    info!("Setup completed in {:?}", started.elapsed());

    if let Err(e) = app.run().await {
        warn!("Error during runtime: {}", e);
    }
    info!("Runtime exit after {:?}", started.elapsed());

    cancel.cancel();
    let timeout = app.shutdown_timeout();
    app.shutdown(timeout)
        .await
        .context("error during shutdown")?;

    Ok(())
}

/// Resolve on interrupt, SIGTERM or SIGQUIT
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut term, mut quit) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::quit()),
        ) {
            (Ok(term), Ok(quit)) => (term, quit),
            _ => {
                warn!("Could not install SIGTERM/SIGQUIT handlers");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received interrupt"),
            _ = term.recv() => info!("Received SIGTERM"),
            _ = quit.recv() => info!("Received SIGQUIT"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received interrupt");
    }
}
