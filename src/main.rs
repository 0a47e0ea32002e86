use std::path::PathBuf;
use std::process::ExitCode;

use arena_relay_rs::{ApiVersionSetting, Relay, RelayConfig, StateStore, VERSION};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Relay chat requests from a controller to the upstream web app.
#[derive(Debug, Parser)]
#[command(name = "arena-relay", version, about)]
struct Cli {
    /// JSON configuration file; missing fields keep their defaults.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Controller websocket URL.
    #[arg(long)]
    controller_url: Option<String>,

    /// Upstream origin, e.g. https://lmarena.ai
    #[arg(long)]
    origin: Option<Url>,

    /// auto, api or nextjs-api
    #[arg(long)]
    api_version: Option<ApiVersionSetting>,

    /// Path of the durable state database.
    #[arg(long)]
    state_path: Option<PathBuf>,

    /// Keep the pending queue and credential in memory only.
    #[arg(long)]
    ephemeral: bool,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn load_config(&self) -> Result<RelayConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => RelayConfig::from_file(path)?,
            None => RelayConfig::default(),
        }
        .apply_env()?;

        if let Some(url) = &self.controller_url {
            config.controller_url = url.clone();
        }
        if let Some(origin) = &self.origin {
            config.upstream_origin = origin.clone();
        }
        if let Some(version) = self.api_version {
            config.api_version = version;
        }
        if let Some(path) = &self.state_path {
            config.state_path = path.clone();
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = cli.load_config()?;
    log::info!(
        "arena-relay {VERSION}: controller {} upstream {} (api {})",
        config.controller_url,
        config.upstream_origin,
        config.api_version
    );

    let mut builder = Relay::builder().with_config(config);
    if cli.ephemeral {
        builder = builder.with_state_store(StateStore::in_memory()?);
    }
    let relay = builder.build()?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                log::info!("interrupt received, shutting down");
                signal.cancel();
            }
            Err(err) => log::warn!("cannot listen for ctrl-c: {err}"),
        }
    });

    relay.run(shutdown).await?;
    Ok(())
}
