mod cli;
mod tui;

use std::fs::OpenOptions;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};
use deskcast::config::DeskcastConfig;
use deskcast::screen::TerminalDisplay;
use deskcast::session::{PublisherSession, PublisherSources, SubscriberSinks, Viewer};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    let mut config = DeskcastConfig::load(cli.config.as_deref())?;
    cli.apply(&mut config);

    match &cli.command {
        Commands::Host { .. } => {
            init_tracing(&config, false)?;
            host(config).await
        }
        Commands::Join { .. } => {
            init_tracing(&config, true)?;
            join(config).await
        }
        Commands::GenConfig => {
            print!("{}", DeskcastConfig::default().to_toml()?);
            Ok(())
        }
    }
}

/// `RUST_LOG` wins over the configured level. The viewer owns the terminal,
/// so it logs to a file instead of stderr.
fn init_tracing(config: &DeskcastConfig, to_file: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    if to_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.logging.file)
            .with_context(|| format!("cannot open log file {}", config.logging.file))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

async fn host(config: DeskcastConfig) -> Result<()> {
    info!("deskcast v{}", env!("CARGO_PKG_VERSION"));

    let sources = PublisherSources::devices(&config);
    let session = match PublisherSession::start(&config, sources).await {
        Ok(session) => session,
        Err(e) => {
            error!("cannot start publisher: {e}");
            return Err(e).context("cannot start publisher");
        }
    };
    println!(
        "Hosting on port {} (video){}. Press Ctrl-C to stop.",
        session.video_port(),
        session
            .audio_port()
            .map(|port| format!(" and {port} (audio)"))
            .unwrap_or_default()
    );

    tokio::signal::ctrl_c().await.ok();
    info!("Ctrl-C received, shutting down");
    session.stop().await;
    Ok(())
}

async fn join(config: DeskcastConfig) -> Result<()> {
    info!("deskcast v{}", env!("CARGO_PKG_VERSION"));

    // Must query the terminal before raw mode.
    let picker = config.viewer.graphics.picker();

    let display = Arc::new(TerminalDisplay::new());
    let sinks = SubscriberSinks::with_speaker(display.clone(), &config);
    let mut viewer = Viewer::new(&config, sinks).context("invalid endpoint")?;
    viewer
        .start()
        .with_context(|| format!("cannot connect to {}", viewer.endpoint()))?;

    let mut ui = tui::ViewerUi::new(display, picker);
    let result = ui.run(&mut viewer).await;
    viewer.stop().await;
    result
}
