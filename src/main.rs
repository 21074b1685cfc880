use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use duplex_voice::audio::{list_devices, CpalInput, CpalOutput};
use duplex_voice::remote::{get_api_key, WsConnector};
use duplex_voice::settings::{default_config_path, load_config, save_config};
use duplex_voice::{ConfigError, EngineConfig, EngineError, SessionHandle};

/// Duplex voice session with barge-in
#[derive(Parser)]
#[command(name = "duplex-voice", version, about)]
struct Cli {
    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a voice session until Ctrl-C or a fatal error
    Run {
        /// Config file (defaults to the user config directory)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Speech service WebSocket URL, overrides the config file
        #[arg(long, env = "SPEECH_WS_URL")]
        url: Option<String>,
    },
    /// Write the default configuration
    InitConfig {
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// List audio devices
    Devices,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present (for development convenience)
    // Silently ignore if not found - production uses system env vars
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},tungstenite=warn", cli.log_level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        log::debug!("TLS crypto provider already installed");
    }

    let result = match cli.command {
        Command::Run { config, url } => run(config, url).await,
        Command::InitConfig { config, force } => init_config(config, force),
        Command::Devices => devices(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("fatal: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn config_path(path: Option<PathBuf>) -> Result<PathBuf, EngineError> {
    match path {
        Some(path) => Ok(path),
        None => Ok(default_config_path()?),
    }
}

async fn run(path: Option<PathBuf>, url: Option<String>) -> Result<(), EngineError> {
    let path = config_path(path)?;
    let mut config: EngineConfig = load_config(&path)?;
    config.apply_env_overrides();
    if url.is_some() {
        config.remote.url = url;
    }
    log::debug!("Loaded configuration from {}: {:?}", path.display(), config);

    let connector = WsConnector::from_config(&config, get_api_key())?;
    let input = CpalInput::open(config.audio.input_sample_rate)?;
    let output = CpalOutput::open(config.audio.output_sample_rate)?;

    let mut session = SessionHandle::new(config)?;
    session.start(input, output, Arc::new(connector))?;
    log::info!("Session {} running, press Ctrl-C to stop", session.id());

    let report = tokio::select! {
        report = session.wait() => report?,
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-C received");
            session.stop().await?
        }
    };

    match serde_json::to_string_pretty(&report) {
        Ok(json) => println!("{}", json),
        Err(e) => log::warn!("Could not serialize session report: {}", e),
    }

    report.into_result().map(|_| ())
}

fn init_config(path: Option<PathBuf>, force: bool) -> Result<(), EngineError> {
    let path = config_path(path)?;
    if path.exists() && !force {
        return Err(ConfigError::AlreadyExists {
            path: path.display().to_string(),
        }
        .into());
    }

    save_config(&path, &EngineConfig::default())?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

fn devices() -> Result<(), EngineError> {
    let devices = list_devices()?;
    if devices.is_empty() {
        println!("No audio devices found");
        return Ok(());
    }

    for device in devices {
        println!(
            "{:6} {}{}",
            if device.is_input { "input" } else { "output" },
            device.name,
            if device.is_default { " (default)" } else { "" }
        );
    }
    Ok(())
}
