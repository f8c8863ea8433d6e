use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use vstreamer::{ControlServer, StreamerConfig};

/// Video device streaming and recording server
#[derive(Debug, Parser)]
#[command(name = "vstreamer", version)]
struct Args {
    /// Configuration file; defaults apply when it does not exist
    #[arg(short, long, default_value = "vstreamer.toml")]
    config: PathBuf,

    /// Control port, overriding the configuration
    #[arg(short, long)]
    port: Option<u16>,

    /// Recordings folder, overriding the configuration
    #[arg(long)]
    video_folder: Option<PathBuf>,
}

fn load_config(args: &Args) -> vstreamer::Result<StreamerConfig> {
    let mut config = if args.config.exists() {
        StreamerConfig::load(&args.config)?
    } else {
        tracing::info!(path = %args.config.display(), "No configuration file, using defaults");
        StreamerConfig::default()
    };
    if let Some(port) = args.port {
        config = config.server_port(port);
    }
    if let Some(folder) = &args.video_folder {
        config = config.saved_video_folder(folder.clone());
    }
    config.validate()?;
    Ok(config)
}

async fn run(args: Args) -> vstreamer::Result<()> {
    let config = load_config(&args)?;
    let server = ControlServer::start(&config).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    server.stop().await;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("vstreamer=info")),
        )
        .init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "vstreamer failed");
            ExitCode::FAILURE
        }
    }
}
