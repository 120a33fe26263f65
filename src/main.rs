use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use voicelink_gateway::{ServerConfig, harness, server, state::AppState};

/// VoiceLink Gateway - audio relay between AR training devices and a voice assistant
#[derive(Parser, Debug)]
#[command(name = "voicelink-gateway")]
#[command(version, about, long_about = None)]
struct Cli {
    /// YAML configuration file; environment variables fill whatever it leaves out
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Stream a WAV file to the voice provider and record its replies
    Harness {
        /// Mono 16-bit PCM WAV at the configured sample rate
        #[arg(short = 'i', long = "input", value_name = "WAV")]
        input: PathBuf,

        /// Where provider audio is written
        #[arg(short = 'o', long = "output", value_name = "WAV", default_value = "reply.wav")]
        output: PathBuf,

        /// Provider WebSocket URL to open instead of creating a call
        #[arg(long = "url")]
        url: Option<String>,

        /// Seconds to keep listening after the input is exhausted
        #[arg(long = "linger", default_value_t = harness::DEFAULT_LINGER.as_secs())]
        linger: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env must be applied before the configuration reads the environment
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt::init();

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install the ring crypto provider"))?;

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Some(Commands::Harness {
            input,
            output,
            url,
            linger,
        }) => {
            let options = harness::HarnessOptions {
                input,
                output: output.clone(),
                url,
                linger: Duration::from_secs(linger),
            };
            let report = harness::run(&config, options)
                .await
                .context("Harness failed")?;
            println!("{report}");
            println!("Provider audio written to {}", output.display());
            Ok(())
        }
        None => {
            if !config.has_provider_credentials() {
                warn!(
                    "VAPI_API_KEY or VAPI_ASSISTANT_ID not set; relay sessions will fail to create calls"
                );
            }
            info!(address = %config.address(), tls = config.is_tls_enabled(), "Starting relay");
            let state = AppState::new(config).context("Failed to initialise relay state")?;
            server::serve(state).await?;
            Ok(())
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<ServerConfig> {
    match path {
        Some(path) => {
            info!(path = %path.display(), "Loading configuration file");
            ServerConfig::from_file(path).map_err(|e| anyhow!("{}: {e}", path.display()))
        }
        None => ServerConfig::from_env().map_err(|e| anyhow!(e.to_string())),
    }
}
